//! The built-in `rpcswitch.*` methods.
//!
//! `hello`, `announce`, and `withdraw` mutate connection and registry
//! state; `ping` answers the liveness probe; the `get_*` family is
//! read-only introspection.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::auth::AuthOutcome;
use crate::connection::Connection;
use crate::err::SwitchError;
use crate::msgs::Frame;
use crate::policy::split_ns;
use crate::registry::{WorkerMethod, canonical_filter_value};

/// The names in the internal method table, without their `rpcswitch.`
/// prefix.
const INTERNAL_METHODS: &[&str] = &[
    "hello",
    "ping",
    "announce",
    "withdraw",
    "get_clients",
    "get_methods",
    "get_method_details",
    "get_workers",
    "get_stats",
];

/// True if `name` is in the internal method table.
pub(crate) fn is_internal_method(name: &str) -> bool {
    INTERNAL_METHODS.contains(&name)
}

/// The result of a built-in method, plus whether the connection should be
/// closed after the reply is written.
pub(crate) struct MethodOutcome {
    /// The `result` member of the reply.
    pub(crate) result: Value,
    /// Close after replying (failed hello).
    pub(crate) close: bool,
}

impl MethodOutcome {
    /// A reply that leaves the connection open.
    fn of(result: Value) -> Self {
        MethodOutcome {
            result,
            close: false,
        }
    }
}

/// Parameters of `rpcswitch.hello`.
#[derive(Debug, Deserialize)]
struct HelloParams {
    /// The authentication method to verify against.
    method: String,
    /// The claimed principal.
    who: String,
    /// The credential for `who` under `method`.
    token: String,
}

/// Parameters of `rpcswitch.announce`.
#[derive(Debug, Deserialize)]
struct AnnounceParams {
    /// The backend being announced, in `ns.name` form.
    method: String,
    /// Optional human label for this worker.
    workername: Option<String>,
    /// The filter object, when the backend is filtered.
    filter: Option<Value>,
    /// Optional documentation for this announcement.
    doc: Option<String>,
}

/// Parameters of `rpcswitch.withdraw` and `rpcswitch.get_method_details`.
#[derive(Debug, Deserialize)]
struct MethodParams {
    /// The method in question.
    method: String,
}

/// Parse a frame's params as the named-parameter object a built-in method
/// expects.  Absent params count as an empty object.
fn named_params<T: for<'de> Deserialize<'de>>(frame: &Frame) -> Result<T, SwitchError> {
    let obj = match frame.params() {
        None => Map::new(),
        Some(Value::Object(obj)) => obj.clone(),
        Some(_) => {
            return Err(SwitchError::InvalidParams(
                "params must be an object".to_owned(),
            ));
        }
    };
    serde_json::from_value(Value::Object(obj))
        .map_err(|e| SwitchError::InvalidParams(e.to_string()))
}

impl Connection {
    /// Run one built-in method.  State checks have already happened.
    pub(crate) async fn run_internal(
        self: &Arc<Self>,
        name: &str,
        frame: &Frame,
    ) -> Result<MethodOutcome, SwitchError> {
        match name {
            "hello" => self.m_hello(frame).await,
            "ping" => Ok(MethodOutcome::of(json!("pong?"))),
            "announce" => self.m_announce(frame),
            "withdraw" => self.m_withdraw(frame),
            "get_clients" => self.m_get_clients(),
            "get_methods" => self.m_get_methods(),
            "get_method_details" => self.m_get_method_details(frame),
            "get_workers" => self.m_get_workers(),
            "get_stats" => self.m_get_stats(),
            other => Err(SwitchError::MethodNotFound(format!("rpcswitch.{}", other))),
        }
    }

    /// `rpcswitch.hello`: authenticate this connection.
    async fn m_hello(self: &Arc<Self>, frame: &Frame) -> Result<MethodOutcome, SwitchError> {
        let p: HelloParams = named_params(frame)?;
        let broker = self.broker()?;
        let outcome = broker
            .auth()
            .verify(&p.method, &p.who, &p.token)
            .await
            .map_err(|e| SwitchError::HandlerFailed(e.to_string()))?;
        match outcome {
            AuthOutcome::Granted { note } => {
                self.set_auth(&p.who);
                info!("{}: authenticated as {}", self.peer_addr(), p.who);
                let greeting =
                    note.unwrap_or_else(|| format!("welcome to rpcswitch, {}!", p.who));
                Ok(MethodOutcome::of(json!([true, greeting])))
            }
            AuthOutcome::Denied { reason } => {
                warn!(
                    "{}: authentication failed for {}: {}",
                    self.peer_addr(),
                    p.who,
                    reason
                );
                Ok(MethodOutcome {
                    result: json!([false, reason]),
                    close: true,
                })
            }
        }
    }

    /// `rpcswitch.announce`: start serving a backend on this connection.
    fn m_announce(self: &Arc<Self>, frame: &Frame) -> Result<MethodOutcome, SwitchError> {
        let p: AnnounceParams = named_params(frame)?;
        let broker = self.broker()?;
        let policy = broker.policy();

        if split_ns(&p.method).is_none() {
            return Err(SwitchError::NoNamespace(p.method));
        }
        let Some(acl) = policy.acl_for_backend(&p.method) else {
            return Err(SwitchError::NoAcl(p.method));
        };
        let who = self
            .who()
            .ok_or_else(|| SwitchError::Internal("no principal".to_owned()))?;
        if !policy.check_acl(acl, &who) {
            return Err(SwitchError::NoAcl(p.method));
        }

        let filter = match (policy.filter_for_backend(&p.method), p.filter) {
            (Some(key), Some(Value::Object(map))) => {
                if map.len() != 1 || !map.contains_key(key) {
                    return Err(SwitchError::BadParam(format!(
                        "filter must be an object with exactly the {} key",
                        key
                    )));
                }
                let value = map.get(key).and_then(|v| canonical_filter_value(v));
                match value {
                    Some(value) => Some((key.to_owned(), value)),
                    None => {
                        return Err(SwitchError::BadParam(
                            "filter value must be a defined scalar".to_owned(),
                        ));
                    }
                }
            }
            (Some(key), _) => {
                return Err(SwitchError::BadParam(format!(
                    "announcing {} requires a filter object with the {} key",
                    p.method, key
                )));
            }
            (None, Some(_)) => {
                return Err(SwitchError::BadParam(format!(
                    "{} does not take a filter",
                    p.method
                )));
            }
            (None, None) => None,
        };

        self.check_not_announced(&p.method)?;

        let wm = Arc::new(WorkerMethod {
            method: p.method.clone(),
            conn: Arc::downgrade(self),
            doc: p.doc,
            filter,
        });
        broker.announce_worker(Arc::clone(&wm))?;
        let (worker_id, first) = self.add_worker_method(wm, p.workername);
        if first {
            let opts = broker.options();
            self.start_ping(opts.ping_interval, opts.pong_timeout);
        }
        info!(
            "{}: {} announced {} (worker {})",
            self.peer_addr(),
            who,
            p.method,
            worker_id
        );
        Ok(MethodOutcome::of(json!({
            "msg": "success",
            "worker_id": worker_id,
        })))
    }

    /// `rpcswitch.withdraw`: stop serving a backend.
    fn m_withdraw(self: &Arc<Self>, frame: &Frame) -> Result<MethodOutcome, SwitchError> {
        let p: MethodParams = named_params(frame)?;
        let broker = self.broker()?;
        let Some((wm, last)) = self.remove_worker_method(&p.method) else {
            return Err(SwitchError::BadParam(format!(
                "{} was not announced here",
                p.method
            )));
        };
        broker.withdraw_worker(&wm);
        if last {
            self.stop_ping();
        }
        info!("{}: withdrew {}", self.peer_addr(), p.method);
        Ok(MethodOutcome::of(json!(true)))
    }

    /// `rpcswitch.get_clients`: describe every connection.
    fn m_get_clients(self: &Arc<Self>) -> Result<MethodOutcome, SwitchError> {
        let broker = self.broker()?;
        let clients: Vec<Value> = broker
            .clients_snapshot()
            .iter()
            .map(|c| c.describe())
            .collect();
        Ok(MethodOutcome::of(Value::Array(clients)))
    }

    /// `rpcswitch.get_methods`: the public method table.
    fn m_get_methods(self: &Arc<Self>) -> Result<MethodOutcome, SwitchError> {
        let broker = self.broker()?;
        let policy = broker.policy();
        let mut out = Map::new();
        for (name, entry) in policy.methods() {
            out.insert(
                name.to_owned(),
                entry.doc.clone().map(Value::String).unwrap_or(Value::Null),
            );
        }
        Ok(MethodOutcome::of(Value::Object(out)))
    }

    /// `rpcswitch.get_method_details`: one method, resolved.
    fn m_get_method_details(self: &Arc<Self>, frame: &Frame) -> Result<MethodOutcome, SwitchError> {
        let p: MethodParams = named_params(frame)?;
        let broker = self.broker()?;
        let policy = broker.policy();
        let Some(entry) = policy.method(&p.method) else {
            return Err(SwitchError::MethodNotFound(p.method));
        };
        let workers: Vec<Value> = broker
            .workers_for(&entry.backend)
            .into_iter()
            .map(describe_worker)
            .collect();
        Ok(MethodOutcome::of(json!({
            "method": p.method,
            "backend": entry.backend,
            "doc": entry.doc,
            "filter": policy.filter_for_backend(&entry.backend),
            "workers": workers,
        })))
    }

    /// `rpcswitch.get_workers`: every announced backend and who serves it.
    fn m_get_workers(self: &Arc<Self>) -> Result<MethodOutcome, SwitchError> {
        let broker = self.broker()?;
        let mut out = Map::new();
        for (backend, announcements) in broker.workers_overview() {
            let described: Vec<Value> = announcements.into_iter().map(describe_worker).collect();
            out.insert(backend, Value::Array(described));
        }
        Ok(MethodOutcome::of(Value::Object(out)))
    }

    /// `rpcswitch.get_stats`: switch-wide counters.
    fn m_get_stats(self: &Arc<Self>) -> Result<MethodOutcome, SwitchError> {
        let broker = self.broker()?;
        Ok(MethodOutcome::of(broker.stats()))
    }
}

/// Describe one announcement for the introspection replies.
fn describe_worker(wm: Arc<WorkerMethod>) -> Value {
    let (workername, worker_id) = wm
        .conn
        .upgrade()
        .map(|c| c.worker_label())
        .unwrap_or((None, 0));
    let filter = wm.filter.as_ref().map(|(key, value)| {
        let mut obj = Map::new();
        obj.insert(key.clone(), Value::String(value.clone()));
        Value::Object(obj)
    });
    json!({
        "method": wm.method,
        "workername": workername,
        "worker_id": worker_id,
        "doc": wm.doc,
        "filter": filter,
    })
}
