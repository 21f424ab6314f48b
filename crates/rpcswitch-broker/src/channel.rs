//! Virtual channels between a client connection and a worker connection.

use std::collections::HashMap;
use std::sync::{Mutex, Weak};

use rand::RngCore as _;

use crate::connection::Connection;
use crate::msgs::RequestId;

/// A virtual-channel identifier.
///
/// Channel ids only need to be collision-free within one process lifetime,
/// so a random 128-bit value is plenty.  It travels on the wire inside the
/// `rpcswitch` envelope.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) struct Vci(String);

impl Vci {
    /// Generate a fresh random channel id.
    pub(crate) fn new_random() -> Vci {
        use base64ct::{Base64Unpadded as B64, Encoding};
        let mut bytes = [0_u8; 16];
        rand::rng().fill_bytes(&mut bytes);
        Vci(B64::encode_string(&bytes))
    }

    /// Wrap an id received on the wire.
    pub(crate) fn from_wire(s: &str) -> Vci {
        Vci(s.to_owned())
    }

    /// The wire form of this id.
    pub(crate) fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Vci {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which endpoint of a channel a connection is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Side {
    /// The calling side.
    Client,
    /// The announced-worker side.
    Worker,
}

impl Side {
    /// The other endpoint.
    pub(crate) fn opposite(self) -> Side {
        match self {
            Side::Client => Side::Worker,
            Side::Worker => Side::Client,
        }
    }
}

/// The direction an in-flight request flowed in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Direction {
    /// The request went client to worker; the response travels back.
    ToWorker,
    /// The request went worker to client.
    ToClient,
}

impl Direction {
    /// The direction of a request sent by the endpoint on `side`.
    pub(crate) fn from_sender(side: Side) -> Direction {
        match side {
            Side::Client => Direction::ToWorker,
            Side::Worker => Direction::ToClient,
        }
    }

    /// The endpoint this request flowed into: the one that owes a response.
    pub(crate) fn target(self) -> Side {
        match self {
            Direction::ToWorker => Side::Worker,
            Direction::ToClient => Side::Client,
        }
    }
}

/// A channel between one client connection and one worker connection.
///
/// Both endpoints hold the same `Arc<Channel>` in their channel tables,
/// keyed by `vci`.  The endpoints themselves are held weakly so that a
/// dropped connection cannot be resurrected through its channels.
pub(crate) struct Channel {
    /// This channel's identifier.
    pub(crate) vci: Vci,
    /// The calling endpoint.
    pub(crate) client: Weak<Connection>,
    /// The worker endpoint.
    pub(crate) worker: Weak<Connection>,
    /// Outstanding request ids, with the direction each request flowed.
    reqs: Mutex<HashMap<RequestId, Direction>>,
}

impl Channel {
    /// Create a channel between `client` and `worker` with a fresh id.
    pub(crate) fn new(client: Weak<Connection>, worker: Weak<Connection>) -> Channel {
        Channel {
            vci: Vci::new_random(),
            client,
            worker,
            reqs: Mutex::new(HashMap::new()),
        }
    }

    /// Which side of this channel `conn` is, if either.
    pub(crate) fn side_of(&self, conn: &Connection) -> Option<Side> {
        if std::ptr::eq(self.client.as_ptr(), conn) {
            Some(Side::Client)
        } else if std::ptr::eq(self.worker.as_ptr(), conn) {
            Some(Side::Worker)
        } else {
            None
        }
    }

    /// The endpoint on `side`.
    pub(crate) fn endpoint(&self, side: Side) -> &Weak<Connection> {
        match side {
            Side::Client => &self.client,
            Side::Worker => &self.worker,
        }
    }

    /// Start tracking an in-flight request.
    pub(crate) fn record(&self, id: RequestId, direction: Direction) {
        self.reqs
            .lock()
            .expect("poisoned lock")
            .insert(id, direction);
    }

    /// Stop tracking `id`, returning the direction it flowed in.
    pub(crate) fn resolve(&self, id: &RequestId) -> Option<Direction> {
        self.reqs.lock().expect("poisoned lock").remove(id)
    }

    /// The direction `id` flowed in, without untracking it.
    pub(crate) fn direction_of(&self, id: &RequestId) -> Option<Direction> {
        self.reqs.lock().expect("poisoned lock").get(id).copied()
    }

    /// Remove and return every outstanding request, for teardown.
    pub(crate) fn drain(&self) -> Vec<(RequestId, Direction)> {
        self.reqs
            .lock()
            .expect("poisoned lock")
            .drain()
            .collect()
    }

    /// Number of outstanding requests.
    pub(crate) fn len(&self) -> usize {
        self.reqs.lock().expect("poisoned lock").len()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("vci", &self.vci)
            .field("reqs", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn vci_uniqueness() {
        // Not a proof, but a regression check for accidentally constant ids.
        let a = Vci::new_random();
        let b = Vci::new_random();
        assert_ne!(a, b);
        assert!(!a.as_str().is_empty());
    }

    #[test]
    fn direction_bookkeeping() {
        assert_eq!(Direction::from_sender(Side::Client), Direction::ToWorker);
        assert_eq!(Direction::from_sender(Side::Worker), Direction::ToClient);
        assert_eq!(Direction::ToWorker.target(), Side::Worker);
        assert_eq!(Side::Client.opposite(), Side::Worker);
    }

    #[test]
    fn record_and_resolve() {
        let ch = Channel::new(Weak::new(), Weak::new());
        let id = RequestId::Int(7);
        ch.record(id.clone(), Direction::ToWorker);
        assert_eq!(ch.direction_of(&id), Some(Direction::ToWorker));
        assert_eq!(ch.resolve(&id), Some(Direction::ToWorker));
        assert_eq!(ch.resolve(&id), None);
    }
}
