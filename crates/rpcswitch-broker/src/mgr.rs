//! Top-level [`Broker`]: shared state and configuration for all
//! connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::auth::AuthBackend;
use crate::channel::Channel;
use crate::connection::Connection;
use crate::err::SwitchError;
use crate::msgs::notification;
use crate::policy::Policy;
use crate::registry::{WorkerMethod, WorkerRegistry};

/// Tunables for a [`Broker`].
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct BrokerOptions {
    /// How often to probe connections with announced methods.
    pub ping_interval: Duration,
    /// How long a probed peer gets to answer before being disconnected.
    pub pong_timeout: Duration,
    /// Largest JSON frame we accept from a peer, in bytes.
    pub max_frame_len: usize,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        BrokerOptions {
            ping_interval: Duration::from_secs(60),
            pong_timeout: Duration::from_secs(10),
            max_frame_len: 1 << 20,
        }
    }
}

/// Shared state, configuration, and data for all switch connections.
///
/// A `Broker` knows the current policy snapshot, the worker registry, and
/// every live connection.  Connections hold a `Weak` reference back.
///
/// # Lock hierarchy
///
/// `inner` comes before any `Connection::inner`: a connection's lock may
/// be taken while `inner` is held, never the reverse.  Nothing is awaited
/// while either is held.  The policy lock is only ever held long enough
/// to clone or replace the `Arc`.
pub struct Broker {
    /// The authentication backend consulted by hello.
    auth: Arc<dyn AuthBackend>,
    /// Tunables.
    opts: BrokerOptions,
    /// The current policy snapshot; replaced wholesale on reload.
    policy: RwLock<Arc<Policy>>,
    /// Live connections and the worker registry.
    inner: Mutex<Inner>,
    /// JSON frames handled since startup.
    chunks: AtomicU64,
    /// Connections accepted since startup.
    total_connections: AtomicU64,
    /// Next worker id; worker ids are never reused.
    next_worker_id: AtomicU64,
    /// Next connection id.
    next_conn_id: AtomicU64,
}

/// The lock-protected part of a [`Broker`].
struct Inner {
    /// Every live connection, by connection id.
    clients: HashMap<u64, Arc<Connection>>,
    /// Which connections serve which backends.
    registry: WorkerRegistry,
}

impl Broker {
    /// Create a broker with an initial policy and an auth backend.
    pub fn new(policy: Policy, auth: Arc<dyn AuthBackend>, opts: BrokerOptions) -> Arc<Broker> {
        Arc::new(Broker {
            auth,
            opts,
            policy: RwLock::new(Arc::new(policy)),
            inner: Mutex::new(Inner {
                clients: HashMap::new(),
                registry: WorkerRegistry::default(),
            }),
            chunks: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            next_worker_id: AtomicU64::new(1),
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// The authentication backend.
    pub(crate) fn auth(&self) -> &Arc<dyn AuthBackend> {
        &self.auth
    }

    /// The broker tunables.
    pub(crate) fn options(&self) -> &BrokerOptions {
        &self.opts
    }

    /// The current policy snapshot.
    ///
    /// Callers keep the returned `Arc` for the duration of one operation,
    /// so a reload mid-call cannot change the rules under them.
    pub fn policy(&self) -> Arc<Policy> {
        Arc::clone(&self.policy.read().expect("poisoned lock"))
    }

    /// Install a new policy snapshot.
    ///
    /// Existing channels and in-flight calls are unaffected; everything
    /// dispatched afterwards sees the new policy.
    pub fn reload_policy(&self, policy: Policy) {
        *self.policy.write().expect("poisoned lock") = Arc::new(policy);
        info!("policy reloaded");
    }

    /// Count one handled JSON frame.
    pub(crate) fn count_chunk(&self) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
    }

    /// Hand out the next worker id.
    pub(crate) fn assign_worker_id(&self) -> u64 {
        self.next_worker_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a new connection from `from`.
    pub fn new_connection(self: &Arc<Self>, from: String) -> Arc<Connection> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(self, conn_id, from);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .expect("poisoned lock")
            .clients
            .insert(conn_id, Arc::clone(&conn));
        debug!("{}: new connection {}", conn.peer_addr(), conn_id);
        conn
    }

    /// Insert an announcement into the worker registry.
    pub(crate) fn announce_worker(&self, wm: Arc<WorkerMethod>) -> Result<(), SwitchError> {
        self.inner.lock().expect("poisoned lock").registry.announce(wm)
    }

    /// Remove an announcement from the worker registry.
    pub(crate) fn withdraw_worker(&self, wm: &Arc<WorkerMethod>) -> bool {
        self.inner.lock().expect("poisoned lock").registry.withdraw(wm)
    }

    /// Pick a worker for `backend`, within `filter_value`'s bucket if set.
    pub(crate) fn select_worker(
        &self,
        backend: &str,
        filter_value: Option<&str>,
    ) -> Option<Arc<WorkerMethod>> {
        self.inner
            .lock()
            .expect("poisoned lock")
            .registry
            .select(backend, filter_value)
    }

    /// All announcements for one backend.
    pub(crate) fn workers_for(&self, backend: &str) -> Vec<Arc<WorkerMethod>> {
        self.inner
            .lock()
            .expect("poisoned lock")
            .registry
            .workers_for(backend)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Every announced backend with its announcements, sorted by name.
    pub(crate) fn workers_overview(&self) -> Vec<(String, Vec<Arc<WorkerMethod>>)> {
        let inner = self.inner.lock().expect("poisoned lock");
        let mut backends: Vec<String> =
            inner.registry.backends().map(str::to_owned).collect();
        backends.sort_unstable();
        backends
            .into_iter()
            .map(|b| {
                let workers = inner
                    .registry
                    .workers_for(&b)
                    .into_iter()
                    .cloned()
                    .collect();
                (b, workers)
            })
            .collect()
    }

    /// A stable-order snapshot of every live connection.
    pub(crate) fn clients_snapshot(&self) -> Vec<Arc<Connection>> {
        let inner = self.inner.lock().expect("poisoned lock");
        let mut clients: Vec<_> = inner.clients.values().cloned().collect();
        clients.sort_unstable_by_key(|c| c.conn_id());
        clients
    }

    /// Find the channel between `client` and `worker`, creating it on the
    /// first forwarded call of the pair.
    ///
    /// Channel creation is only ever driven from the calling side's task,
    /// so there is no create/create race for one pair.
    pub(crate) fn find_or_create_channel(
        &self,
        client: &Arc<Connection>,
        worker: &Arc<Connection>,
    ) -> Arc<Channel> {
        if let Some(existing) = client.channel_to_worker(worker) {
            return existing;
        }
        let channel = Arc::new(Channel::new(
            Arc::downgrade(client),
            Arc::downgrade(worker),
        ));
        client.insert_channel(Arc::clone(&channel));
        worker.insert_channel(Arc::clone(&channel));
        debug!(
            "created channel {} between {} and {}",
            channel.vci,
            client.peer_addr(),
            worker.peer_addr()
        );
        channel
    }

    /// Tear down a connection that has closed.
    ///
    /// Withdraws its announcements, then walks its channels: the surviving
    /// endpoint gets one synthesized error per request the closed side
    /// still owed an answer for, followed by a single `channel_gone`
    /// notification, and the channel is dropped on both sides.
    pub(crate) async fn connection_closed(&self, conn: &Arc<Connection>) {
        {
            let mut inner = self.inner.lock().expect("poisoned lock");
            inner.clients.remove(&conn.conn_id());
        }
        conn.stop_ping();
        let (methods, channels) = conn.take_tables();
        if !methods.is_empty() {
            let mut inner = self.inner.lock().expect("poisoned lock");
            for wm in methods.values() {
                inner.registry.withdraw(wm);
            }
        }

        for (vci, channel) in channels {
            let Some(my_side) = channel.side_of(conn) else {
                continue;
            };
            let Some(survivor) = channel.endpoint(my_side.opposite()).upgrade() else {
                continue;
            };
            let mut gone = Vec::new();
            for (id, direction) in channel.drain() {
                if direction.target() == my_side {
                    // The closed side owed this answer; tell the requester.
                    gone.push(crate::msgs::channel_err_response(
                        &id,
                        &channel.vci,
                        &SwitchError::Gone,
                    ));
                } else {
                    // The request pointed into the survivor and has now
                    // evaporated along with its channel entry.
                    survivor.dec_refcount();
                }
            }
            for frame in gone {
                let _ = survivor.send_frame(frame).await;
            }
            let _ = survivor
                .send_frame(notification(
                    "rpcswitch.channel_gone",
                    json!({ "channel": vci.as_str() }),
                ))
                .await;
            survivor.remove_channel(&vci);
        }
        info!("{}: connection closed", conn.peer_addr());
    }

    /// Switch-wide counters, as returned by `rpcswitch.get_stats`.
    pub(crate) fn stats(&self) -> Value {
        let policy = self.policy();
        let (clients, workers) = {
            let inner = self.inner.lock().expect("poisoned lock");
            let clients = inner.clients.len();
            let workers = inner.clients.values().filter(|c| c.is_worker()).count();
            (clients, workers)
        };
        let mut methods = Map::new();
        for (name, entry) in policy.methods() {
            let calls = entry.call_count();
            if calls > 0 {
                methods.insert(name.to_owned(), calls.into());
            }
        }
        json!({
            "chunks": self.chunks.load(Ordering::Relaxed),
            "clients": clients,
            "connections": self.total_connections.load(Ordering::Relaxed),
            "workers": workers,
            "methods": methods,
        })
    }

    /// Ask every connection to flush and close.
    ///
    /// Each connection then goes through the normal teardown path, so
    /// surviving peers still get their `channel_gone` notifications while
    /// the process winds down.
    pub async fn shutdown(&self) {
        let clients = self.clients_snapshot();
        info!("closing {} connections", clients.len());
        for conn in clients {
            conn.close().await;
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("chunks", &self.chunks.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
