//! The request dispatcher: what happens to each frame a peer sends.
//!
//! Decision order for an incoming frame:
//!
//! 1. Responses go to the channel they belong to, or to the local matcher
//!    for broker-originated requests (ping).
//! 2. Requests carrying a channel envelope are relayed over that channel.
//! 3. Requests for `rpcswitch.*` go to the built-in handlers.
//! 4. Requests for a policy method are forwarded to a selected worker.
//! 5. Anything else is method-not-found.

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::channel::{Direction, Vci};
use crate::connection::{ConnState, Connection};
use crate::err::SwitchError;
use crate::msgs::{ChannelEnvelope, ENVELOPE_KEY, Frame, RequestId, VCOOKIE, err_response};
use crate::policy::split_ns;
use crate::registry::canonical_filter_value;

/// What the mainloop should do after one frame has been handled.
#[derive(Debug, Default)]
pub(crate) struct Disposition {
    /// Frames to write to this peer, in order.
    pub(crate) replies: Vec<Value>,
    /// Whether to close the connection once the replies are written.
    pub(crate) close: bool,
}

impl Disposition {
    /// Nothing to say.
    fn none() -> Self {
        Disposition::default()
    }

    /// Reply with one frame.
    fn reply(frame: Value) -> Self {
        Disposition {
            replies: vec![frame],
            close: false,
        }
    }

    /// Reply with one frame, then close.
    fn reply_and_close(frame: Value) -> Self {
        Disposition {
            replies: vec![frame],
            close: true,
        }
    }
}

/// Report a request failure: answered when the request had an id, logged
/// and dropped when it was a notification.
fn fail(id: Option<&RequestId>, err: SwitchError) -> Disposition {
    match id {
        Some(id) => Disposition::reply(err_response(Some(id), &err)),
        None => {
            debug!("dropping failed notification: {}", err);
            Disposition::none()
        }
    }
}

impl Connection {
    /// Handle one decoded frame from this connection's peer.
    pub(crate) async fn handle_frame(self: &Arc<Self>, value: Value) -> Disposition {
        if let Ok(broker) = self.broker() {
            broker.count_chunk();
        }

        let frame = match Frame::from_value(value) {
            Ok(frame) => frame,
            Err(e) => return Disposition::reply_and_close(err_response(None, &e)),
        };
        let id = match frame.id() {
            Ok(id) => id,
            Err(e) => return Disposition::reply(err_response(None, &e)),
        };

        if frame.is_response() {
            return self.handle_response(frame, id).await;
        }

        let Some(method) = frame.method().map(str::to_owned) else {
            return fail(
                id.as_ref(),
                SwitchError::InvalidRequest("neither a request nor a response".to_owned()),
            );
        };

        match frame.envelope() {
            Some(Ok(env)) => return self.relay_channel_request(frame, id, env).await,
            Some(Err(e)) => return fail(id.as_ref(), e),
            None => {}
        }

        if let Some(local) = method.strip_prefix("rpcswitch.") {
            // Only names in the internal table reach the internal handler
            // (and its state checks); the reserved namespace never appears
            // in the policy, so everything else is unknown.
            if crate::methods::is_internal_method(local) {
                return self.dispatch_internal(local, frame, id).await;
            }
            return fail(id.as_ref(), SwitchError::MethodNotFound(method));
        }

        self.dispatch_external(frame, id, method).await
    }

    /// Handle a frame that is a response.
    async fn handle_response(
        self: &Arc<Self>,
        frame: Frame,
        id: Option<RequestId>,
    ) -> Disposition {
        match frame.envelope() {
            Some(Ok(env)) => self.relay_channel_response(frame, id, Some(env)).await,
            Some(Err(_)) => {
                debug!("{}: dropping response with bad envelope", self.peer_addr());
                Disposition::none()
            }
            None => {
                if let Some(id) = &id {
                    if self.note_pong(id) {
                        return Disposition::none();
                    }
                    if self.find_response_channel(id).is_some() {
                        // A bare response whose id we are still tracking on
                        // one of our channels; treat it as belonging there.
                        return self.relay_channel_response(frame, Some(id.clone()), None).await;
                    }
                }
                debug!("{}: dropping unmatched response", self.peer_addr());
                Disposition::none()
            }
        }
    }

    /// Relay a response over its channel to the opposite endpoint.
    ///
    /// Responses never produce error replies; anything unusable is logged
    /// and dropped.
    async fn relay_channel_response(
        self: &Arc<Self>,
        frame: Frame,
        id: Option<RequestId>,
        env: Option<ChannelEnvelope>,
    ) -> Disposition {
        let channel = match &env {
            Some(env) => self.channel_by_vci(&Vci::from_wire(&env.vci)),
            None => id.as_ref().and_then(|id| self.find_response_channel(id)),
        };
        let Some(channel) = channel else {
            debug!("{}: response for unknown channel", self.peer_addr());
            return Disposition::none();
        };
        let Some(id) = id else {
            debug!("{}: response without id on channel", self.peer_addr());
            return Disposition::none();
        };
        let Some(direction) = channel.resolve(&id) else {
            debug!(
                "{}: response for untracked id {} on channel {}",
                self.peer_addr(),
                id,
                channel.vci
            );
            return Disposition::none();
        };
        // The request flowed into the responder; it has now answered.
        if let Some(responder) = channel.endpoint(direction.target()).upgrade() {
            responder.dec_refcount();
        }
        let Some(my_side) = channel.side_of(self) else {
            return Disposition::none();
        };
        let Some(dest) = channel.endpoint(my_side.opposite()).upgrade() else {
            debug!("{}: response for half-closed channel", self.peer_addr());
            return Disposition::none();
        };
        let _ = dest.send_frame(frame.into_value()).await;
        Disposition::none()
    }

    /// Relay an in-channel request to the opposite endpoint.
    async fn relay_channel_request(
        self: &Arc<Self>,
        frame: Frame,
        id: Option<RequestId>,
        env: ChannelEnvelope,
    ) -> Disposition {
        let vci = Vci::from_wire(&env.vci);
        let Some(channel) = self.channel_by_vci(&vci) else {
            return fail(id.as_ref(), SwitchError::NoChannel(env.vci));
        };
        let Some(my_side) = channel.side_of(self) else {
            return fail(id.as_ref(), SwitchError::NoChannel(env.vci));
        };
        let Some(dest) = channel.endpoint(my_side.opposite()).upgrade() else {
            return fail(id.as_ref(), SwitchError::Gone);
        };
        if let Some(id) = id {
            channel.record(id, Direction::from_sender(my_side));
            dest.inc_refcount();
        }
        let _ = dest.send_frame(frame.into_value()).await;
        Disposition::none()
    }

    /// Handle a request for one of the built-in `rpcswitch.*` methods.
    async fn dispatch_internal(
        self: &Arc<Self>,
        name: &str,
        frame: Frame,
        id: Option<RequestId>,
    ) -> Disposition {
        // Every built-in method returns a result, so an id is required.
        let Some(id) = id else {
            let full = format!("rpcswitch.{}", name);
            return Disposition::reply(err_response(None, &SwitchError::NotNotification(full)));
        };

        // Only hello is free of state constraints.
        if name != "hello" && self.state() != ConnState::Auth {
            let err = SwitchError::BadState {
                method: format!("rpcswitch.{}", name),
                state: self.state().as_str(),
            };
            return Disposition::reply(err_response(Some(&id), &err));
        }

        let outcome = match self.run_internal(name, &frame).await {
            Ok(outcome) => outcome,
            Err(e) => return Disposition::reply(err_response(Some(&id), &e)),
        };
        let reply = crate::msgs::ok_response(Some(&id), outcome.result);
        if outcome.close {
            Disposition::reply_and_close(reply)
        } else {
            Disposition::reply(reply)
        }
    }

    /// Handle a request for a policy-defined method: check, select a
    /// worker, and forward.
    async fn dispatch_external(
        self: &Arc<Self>,
        mut frame: Frame,
        id: Option<RequestId>,
        method: String,
    ) -> Disposition {
        let broker = match self.broker() {
            Ok(broker) => broker,
            Err(e) => return fail(id.as_ref(), e),
        };
        let policy = broker.policy();

        let Some(entry) = policy.method(&method) else {
            return fail(id.as_ref(), SwitchError::MethodNotFound(method));
        };

        if self.state() != ConnState::Auth {
            return fail(
                id.as_ref(),
                SwitchError::BadState {
                    method,
                    state: self.state().as_str(),
                },
            );
        }
        let who = match self.who() {
            Some(who) => who,
            None => {
                return fail(id.as_ref(), SwitchError::Internal("no principal".to_owned()));
            }
        };

        if split_ns(&method).is_none() {
            return fail(id.as_ref(), SwitchError::NoNamespace(method));
        }
        let Some(acl) = policy.acl_for_method(&method) else {
            return fail(id.as_ref(), SwitchError::NoAcl(method));
        };
        if !policy.check_acl(acl, &who) {
            return fail(id.as_ref(), SwitchError::NotAllowed { method, who });
        }

        let backend = entry.backend.clone();

        // Filtered backends route on a required parameter.
        let filter_value = match policy.filter_for_backend(&backend) {
            Some(key) => {
                let value = frame
                    .params()
                    .and_then(Value::as_object)
                    .and_then(|params| params.get(key));
                match value.and_then(canonical_filter_value) {
                    Some(v) => Some(v),
                    None => {
                        return fail(
                            id.as_ref(),
                            SwitchError::BadParam(format!(
                                "call requires a usable {} parameter",
                                key
                            )),
                        );
                    }
                }
            }
            None => None,
        };

        let selected = broker.select_worker(&backend, filter_value.as_deref());
        let Some(worker_conn) = selected.and_then(|wm| wm.conn.upgrade()) else {
            return fail(id.as_ref(), SwitchError::NoWorker(backend));
        };

        entry.bump_calls();

        let channel = broker.find_or_create_channel(self, &worker_conn);
        if let Some(id) = &id {
            channel.record(id.clone(), Direction::ToWorker);
            worker_conn.inc_refcount();
        }

        // Rewrite the outgoing request.  The params travel untouched.
        let mut out = Map::new();
        out.insert("jsonrpc".to_owned(), json!("2.0"));
        out.insert(
            ENVELOPE_KEY.to_owned(),
            json!({
                "vcookie": VCOOKIE,
                "vci": channel.vci.as_str(),
                "who": who,
            }),
        );
        out.insert("method".to_owned(), Value::String(backend));
        if let Some(params) = frame.take_params() {
            out.insert("params".to_owned(), params);
        }
        if let Some(id) = &id {
            out.insert("id".to_owned(), id.to_value());
        }

        if worker_conn.send_frame(Value::Object(out)).await.is_err() {
            warn!(
                "{}: selected worker went away mid-forward",
                self.peer_addr()
            );
            if let Some(id) = &id {
                channel.resolve(id);
                worker_conn.dec_refcount();
                return Disposition::reply(err_response(Some(id), &SwitchError::Gone));
            }
        }
        Disposition::none()
    }
}
