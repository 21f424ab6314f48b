//! Switch connections: one per accepted socket, plus their mainloop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::{SinkExt as _, StreamExt as _, channel::mpsc};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::channel::{Channel, Vci};
use crate::codecs::{JsonFrameDecoder, JsonLinesEncoder};
use crate::err::{ConnectionError, SwitchError};
use crate::mgr::Broker;
use crate::msgs::RequestId;
use crate::registry::WorkerMethod;

/// How many outbound frames can be queued for a connection before senders
/// start to block.
const OUTBOUND_CHAN_SIZE: usize = 128;

/// The lifecycle state of a connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnState {
    /// Accepted but not yet authenticated.
    New,
    /// Authenticated; `who` is known.
    Auth,
    /// On its way out; no further dispatch.
    Closing,
}

impl ConnState {
    /// The wire/log spelling of this state.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnState::New => "new",
            ConnState::Auth => "auth",
            ConnState::Closing => "closing",
        }
    }
}

/// A message for a connection's write half.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Write this frame to the peer.
    Frame(Value),
    /// Flush and close the connection.
    Close,
}

/// An open connection from a client or worker peer.
///
/// Everything mutable lives in `inner`.
///
/// # Lock hierarchy
///
/// The broker's lock may be held while taking a `Connection::inner`, but
/// never the other way around.  Nothing may be awaited while either lock
/// is held.
pub struct Connection {
    /// The broker this connection belongs to.
    broker: Weak<Broker>,
    /// Stable identifier of this connection within the broker.
    conn_id: u64,
    /// Printable peer address.
    from: String,
    /// Sender feeding this connection's write loop.
    ///
    /// Cloned by whoever needs to put a frame on the wire: the opposite
    /// ends of channels, the ping task, and the broker at shutdown.
    outbound: mpsc::Sender<Outbound>,
    /// Advisory count of in-flight requests this connection is the target
    /// of; used for least-loaded worker selection.
    refcount: AtomicUsize,
    /// The mutable state of this connection.
    inner: Mutex<Inner>,
}

/// The lock-protected part of a connection.
struct Inner {
    /// Lifecycle state.
    state: ConnState,
    /// Authenticated principal, set by hello.
    who: Option<String>,
    /// Human label for a worker; defaults to `who` at first announce.
    workername: Option<String>,
    /// Assigned at first successful announce; 0 means "not a worker".
    worker_id: u64,
    /// Announced backends, by name.
    methods: HashMap<String, Arc<WorkerMethod>>,
    /// Channels this connection is an endpoint of, by channel id.
    channels: HashMap<Vci, Arc<Channel>>,
    /// Abort handle for the ping task, while one is running.
    ping: Option<tokio::task::AbortHandle>,
    /// Broker-originated requests awaiting a response from this peer.
    pending_pings: HashMap<RequestId, oneshot::Sender<()>>,
    /// Sequence number for the broker-originated id space.
    next_ping_seq: u64,
    /// The receive half of the outbound queue, until `run` claims it.
    outbound_rx: Option<mpsc::Receiver<Outbound>>,
}

impl Connection {
    /// Create a new connection belonging to `broker`.
    pub(crate) fn new(broker: &Arc<Broker>, conn_id: u64, from: String) -> Arc<Self> {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CHAN_SIZE);
        Arc::new(Connection {
            broker: Arc::downgrade(broker),
            conn_id,
            from,
            outbound,
            refcount: AtomicUsize::new(0),
            inner: Mutex::new(Inner {
                state: ConnState::New,
                who: None,
                workername: None,
                worker_id: 0,
                methods: HashMap::new(),
                channels: HashMap::new(),
                ping: None,
                pending_pings: HashMap::new(),
                next_ping_seq: 0,
                outbound_rx: Some(outbound_rx),
            }),
        })
    }

    /// The printable peer address.
    pub fn peer_addr(&self) -> &str {
        &self.from
    }

    /// The stable identifier of this connection.
    pub(crate) fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.inner.lock().expect("poisoned lock").state
    }

    /// The authenticated principal, if any.
    pub fn who(&self) -> Option<String> {
        self.inner.lock().expect("poisoned lock").who.clone()
    }

    /// Mark this connection authenticated as `who`.
    pub(crate) fn set_auth(&self, who: &str) {
        let mut inner = self.inner.lock().expect("poisoned lock");
        inner.state = ConnState::Auth;
        inner.who = Some(who.to_owned());
    }

    /// Try to get a strong reference to the owning broker.
    pub(crate) fn broker(&self) -> Result<Arc<Broker>, SwitchError> {
        self.broker
            .upgrade()
            .ok_or_else(|| SwitchError::Internal("broker is shutting down".to_owned()))
    }

    /// Current advisory refcount.
    pub(crate) fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Relaxed)
    }

    /// Note one more in-flight request targeting this connection.
    pub(crate) fn inc_refcount(&self) {
        self.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Note one in-flight request resolved.
    pub(crate) fn dec_refcount(&self) {
        // A stray response must not wrap the counter around.
        let _ = self
            .refcount
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// True if this connection ever completed an announce and still has
    /// announced methods.
    pub(crate) fn is_worker(&self) -> bool {
        !self.inner.lock().expect("poisoned lock").methods.is_empty()
    }

    /// Queue a frame for this connection's peer.
    ///
    /// Blocks (asynchronously) when the peer is slow and the queue is full;
    /// fails only if the connection is gone.
    pub(crate) async fn send_frame(&self, frame: Value) -> Result<(), SwitchError> {
        self.outbound
            .clone()
            .send(Outbound::Frame(frame))
            .await
            .map_err(|_| SwitchError::Gone)
    }

    /// Ask this connection to flush and close.
    pub(crate) async fn close(&self) {
        let _ = self.outbound.clone().send(Outbound::Close).await;
    }

    // ===== announced methods =====

    /// Check whether `method` can be announced (it must not already be).
    pub(crate) fn check_not_announced(&self, method: &str) -> Result<(), SwitchError> {
        let inner = self.inner.lock().expect("poisoned lock");
        if inner.methods.contains_key(method) {
            Err(SwitchError::BadParam(format!(
                "{} already announced",
                method
            )))
        } else {
            Ok(())
        }
    }

    /// Record a successful announcement.
    ///
    /// Assigns the worker id and default workername on the first announce.
    /// Returns the worker id and whether this was the first announce.
    pub(crate) fn add_worker_method(
        &self,
        wm: Arc<WorkerMethod>,
        workername: Option<String>,
    ) -> (u64, bool) {
        let assigned = if self.inner.lock().expect("poisoned lock").worker_id == 0 {
            self.broker().ok().map(|b| b.assign_worker_id())
        } else {
            None
        };
        let mut inner = self.inner.lock().expect("poisoned lock");
        if let Some(id) = assigned {
            inner.worker_id = id;
        }
        if inner.workername.is_none() {
            inner.workername = workername.or_else(|| inner.who.clone());
        }
        let first = inner.methods.is_empty();
        inner.methods.insert(wm.method.clone(), wm);
        (inner.worker_id, first)
    }

    /// Remove an announcement.
    ///
    /// Returns the announcement and whether it was the last one.
    pub(crate) fn remove_worker_method(
        &self,
        method: &str,
    ) -> Option<(Arc<WorkerMethod>, bool)> {
        let mut inner = self.inner.lock().expect("poisoned lock");
        let wm = inner.methods.remove(method)?;
        Some((wm, inner.methods.is_empty()))
    }

    // ===== channels =====

    /// Look up one of our channels by id.
    pub(crate) fn channel_by_vci(&self, vci: &Vci) -> Option<Arc<Channel>> {
        self.inner
            .lock()
            .expect("poisoned lock")
            .channels
            .get(vci)
            .cloned()
    }

    /// Find the channel (if any) from us, as client, to `worker`.
    pub(crate) fn channel_to_worker(&self, worker: &Connection) -> Option<Arc<Channel>> {
        let inner = self.inner.lock().expect("poisoned lock");
        inner
            .channels
            .values()
            .find(|ch| {
                std::ptr::eq(ch.client.as_ptr(), self)
                    && std::ptr::eq(ch.worker.as_ptr(), worker)
            })
            .cloned()
    }

    /// Insert a channel into our table.
    pub(crate) fn insert_channel(&self, ch: Arc<Channel>) {
        self.inner
            .lock()
            .expect("poisoned lock")
            .channels
            .insert(ch.vci.clone(), ch);
    }

    /// Remove a channel from our table.
    pub(crate) fn remove_channel(&self, vci: &Vci) {
        self.inner.lock().expect("poisoned lock").channels.remove(vci);
    }

    /// Find the channel on which we owe a response for `id`, if any.
    ///
    /// Used for responses arriving without an envelope.
    pub(crate) fn find_response_channel(&self, id: &RequestId) -> Option<Arc<Channel>> {
        let inner = self.inner.lock().expect("poisoned lock");
        inner
            .channels
            .values()
            .find(|ch| {
                ch.side_of(self).is_some_and(|side| {
                    ch.direction_of(id).is_some_and(|dir| dir.target() == side)
                })
            })
            .cloned()
    }

    /// Drain the method and channel tables for teardown, marking the
    /// connection closing.
    pub(crate) fn take_tables(
        &self,
    ) -> (HashMap<String, Arc<WorkerMethod>>, HashMap<Vci, Arc<Channel>>) {
        let mut inner = self.inner.lock().expect("poisoned lock");
        inner.state = ConnState::Closing;
        inner.pending_pings.clear();
        (
            std::mem::take(&mut inner.methods),
            std::mem::take(&mut inner.channels),
        )
    }

    // ===== ping =====

    /// Start the recurring ping task for this connection.
    pub(crate) fn start_ping(
        self: &Arc<Self>,
        period: std::time::Duration,
        deadline: std::time::Duration,
    ) {
        let mut inner = self.inner.lock().expect("poisoned lock");
        if inner.ping.is_some() {
            return;
        }
        let handle = tokio::spawn(ping_task(Arc::downgrade(self), period, deadline));
        inner.ping = Some(handle.abort_handle());
    }

    /// Stop the ping task, if one is running.
    pub(crate) fn stop_ping(&self) {
        if let Some(handle) = self.inner.lock().expect("poisoned lock").ping.take() {
            handle.abort();
        }
    }

    /// Allocate an id in the broker-originated id space and register a
    /// waiter for its response.
    pub(crate) fn register_ping(&self, tx: oneshot::Sender<()>) -> RequestId {
        let mut inner = self.inner.lock().expect("poisoned lock");
        let seq = inner.next_ping_seq;
        inner.next_ping_seq += 1;
        let id = RequestId::Str(format!("rpcswitch-ping-{}", seq).into());
        inner.pending_pings.insert(id.clone(), tx);
        id
    }

    /// Drop the waiter for a broker-originated request.
    pub(crate) fn forget_ping(&self, id: &RequestId) {
        self.inner.lock().expect("poisoned lock").pending_pings.remove(id);
    }

    /// If `id` is a pending broker-originated request, resolve it.
    ///
    /// Returns true if the response was consumed here.
    pub(crate) fn note_pong(&self, id: &RequestId) -> bool {
        let waiter = self
            .inner
            .lock()
            .expect("poisoned lock")
            .pending_pings
            .remove(id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    // ===== introspection =====

    /// Describe this connection for `get_clients`.
    pub(crate) fn describe(&self) -> Value {
        let inner = self.inner.lock().expect("poisoned lock");
        let mut methods: Vec<&str> = inner.methods.keys().map(String::as_str).collect();
        methods.sort_unstable();
        json!({
            "from": self.from,
            "state": inner.state.as_str(),
            "who": inner.who,
            "workername": inner.workername,
            "worker_id": if inner.worker_id == 0 { Value::Null } else { inner.worker_id.into() },
            "methods": methods,
            "channels": inner.channels.len(),
        })
    }

    /// The worker label and id, for `get_workers` and friends.
    pub(crate) fn worker_label(&self) -> (Option<String>, u64) {
        let inner = self.inner.lock().expect("poisoned lock");
        (inner.workername.clone(), inner.worker_id)
    }

    // ===== mainloop =====

    /// Run in a loop, decoding JSON frames from `input`, dispatching them,
    /// and writing queued frames onto `output`.
    ///
    /// Returns when the peer disconnects, when the connection is asked to
    /// close, or on an unrecoverable transport error.  Teardown of
    /// announced methods and channels happens before this returns.
    pub async fn run<IN, OUT>(self: Arc<Self>, input: IN, output: OUT) -> Result<(), ConnectionError>
    where
        IN: futures::AsyncRead + Send + Unpin + 'static,
        OUT: futures::AsyncWrite + Send + Unpin + 'static,
    {
        let Ok(broker) = self.broker() else {
            return Ok(());
        };
        let max_frame_len = broker.options().max_frame_len;
        drop(broker);

        let rx = self.inner.lock().expect("poisoned lock").outbound_rx.take();
        let Some(rx) = rx else {
            warn!("{}: connection started twice", self.from);
            return Ok(());
        };

        let read = asynchronous_codec::FramedRead::new(input, JsonFrameDecoder::new(max_frame_len));
        let write = asynchronous_codec::FramedWrite::new(
            output,
            JsonLinesEncoder::<Value>::default(),
        );

        let result = Arc::clone(&self).run_loop(read.fuse(), write, rx).await;

        self.stop_ping();
        if let Some(broker) = self.broker.upgrade() {
            broker.connection_closed(&self).await;
        }

        match result {
            Err(e) if e.is_connection_close() => Ok(()),
            other => other,
        }
    }

    /// The select loop behind [`Connection::run`].
    async fn run_loop<R, W>(
        self: Arc<Self>,
        mut read: futures::stream::Fuse<R>,
        mut write: W,
        mut rx: mpsc::Receiver<Outbound>,
    ) -> Result<(), ConnectionError>
    where
        R: futures::Stream<Item = Result<Value, crate::codecs::CodecError>> + Unpin,
        W: futures::Sink<Value, Error = crate::codecs::CodecError> + Unpin,
    {
        loop {
            futures::select! {
                out = rx.next() => {
                    match out {
                        None | Some(Outbound::Close) => {
                            let _ = write.close().await;
                            return Ok(());
                        }
                        Some(Outbound::Frame(frame)) => {
                            // Blocking here is deliberate: when the peer
                            // does not drain its socket, everything that
                            // feeds this connection slows down with it.
                            write.send(frame).await.map_err(ConnectionError::writing)?;
                        }
                    }
                }

                frame = read.next() => {
                    match frame {
                        None => return Ok(()),
                        Some(Err(e)) => {
                            let e = ConnectionError::reading(e);
                            // Answer what can be answered before dropping
                            // the connection.
                            let reply = match &e {
                                ConnectionError::DecodeFailed(je) => Some(
                                    crate::msgs::err_response(
                                        None,
                                        &SwitchError::Parse(je.to_string()),
                                    ),
                                ),
                                ConnectionError::FrameTooLarge { len, .. } => Some(
                                    crate::msgs::err_response(
                                        None,
                                        &SwitchError::TooBig { len: *len },
                                    ),
                                ),
                                _ => None,
                            };
                            if let Some(reply) = reply {
                                let _ = write.send(reply).await;
                            }
                            return Err(e);
                        }
                        Some(Ok(value)) => {
                            let disposition = self.handle_frame(value).await;
                            for reply in disposition.replies {
                                write.send(reply).await.map_err(ConnectionError::writing)?;
                            }
                            if disposition.close {
                                let _ = write.close().await;
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.conn_id)
            .field("from", &self.from)
            .finish_non_exhaustive()
    }
}

/// The recurring liveness probe for a connection with announced methods.
///
/// Sends `rpcswitch.ping` every `period` and disconnects the peer if a
/// response does not arrive within `deadline`.
async fn ping_task(
    conn: Weak<Connection>,
    period: std::time::Duration,
    deadline: std::time::Duration,
) {
    loop {
        tokio::time::sleep(period).await;
        let Some(conn) = conn.upgrade() else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        let id = conn.register_ping(tx);
        let frame = json!({
            "jsonrpc": "2.0",
            "id": id.to_value(),
            "method": "rpcswitch.ping",
            "params": {},
        });
        if conn.send_frame(frame).await.is_err() {
            return;
        }
        let pong = tokio::time::timeout(deadline, rx).await;
        conn.forget_ping(&id);
        match pong {
            Ok(Ok(())) => {
                debug!("{}: pong", conn.peer_addr());
            }
            _ => {
                info!("{}: no pong within {:?}, disconnecting", conn.peer_addr(), deadline);
                conn.close().await;
                return;
            }
        }
    }
}
