//! Backend machinery for `rpcswitch`, a JSON-RPC 2.0 switching broker.
//!
//! The switch sits between two classes of peer: *clients* that call
//! methods, and *workers* that announce the backends implementing them.
//! Every connection authenticates with `rpcswitch.hello`; every call is
//! checked against an ACL policy, routed to a worker (optionally through
//! per-method filter buckets), and then relayed over a persistent virtual
//! channel between the two peers.  The switch never runs application
//! methods itself.
//!
//! The pieces, roughly bottom-up:
//!
//! * `codecs` frames newline-separated JSON objects.
//! * `msgs` interprets frames just enough to dispatch them.
//! * [`Policy`] is the immutable ACL/routing snapshot, atomically
//!   replaceable at runtime.
//! * `registry` tracks announcements and picks workers (round robin with
//!   a least-loaded preference).
//! * `channel` is the per-(client, worker) relay state.
//! * [`Connection`] owns one socket and its mainloop; `dispatch` and
//!   `methods` implement the request handling on top of it.
//! * [`Broker`] ties the above together and is what an embedding
//!   application constructs.
//!
//! All state lives in memory; restarting the process forgets everything.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::unwrap_used)]

mod auth;
mod channel;
mod codecs;
mod connection;
mod dispatch;
mod err;
mod listen;
mod methods;
mod mgr;
mod msgs;
mod policy;
mod registry;

pub use auth::{AuthBackend, AuthError, AuthOutcome, StaticTokenBackend};
pub use connection::{ConnState, Connection};
pub use err::{ConnectionError, SwitchError};
pub use listen::{accept_tcp, accept_unix};
pub use mgr::{Broker, BrokerOptions};
pub use policy::{AclSpec, MethodEntry, MethodSpec, Policy, PolicyError, PolicyFile, PUBLIC_ACL};
