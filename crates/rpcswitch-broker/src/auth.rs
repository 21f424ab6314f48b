//! Pluggable authentication for incoming connections.
//!
//! The switch itself has no opinion on credentials; a connection's
//! `rpcswitch.hello` hands the `{method, who, token}` triple to whatever
//! [`AuthBackend`] the broker was built with.

use std::collections::HashMap;

use async_trait::async_trait;

/// The outcome of a verification attempt.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum AuthOutcome {
    /// The peer is who they claim to be.
    Granted {
        /// Optional note from the backend, reported in the hello reply.
        note: Option<String>,
    },
    /// The claim was rejected.
    Denied {
        /// Why, in terms fit to show the peer.
        reason: String,
    },
}

/// A hard failure inside an authentication backend.
///
/// Distinct from [`AuthOutcome::Denied`]: a denial is an answer, this is
/// the absence of one.
#[derive(Clone, Debug, thiserror::Error)]
#[error("authentication backend failure: {0}")]
pub struct AuthError(pub String);

/// An authentication backend.
///
/// Implementations may take their time (an LDAP round trip, say); the
/// calling connection simply does not progress until the answer arrives.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Verify that `who` may authenticate via `method` using `token`.
    async fn verify(&self, method: &str, who: &str, token: &str)
    -> Result<AuthOutcome, AuthError>;
}

/// An in-memory backend: per-method tables of `who` to expected token.
///
/// This is what the shipped binary configures from its TOML config, and
/// what the test suite uses.
#[derive(Clone, Debug, Default)]
pub struct StaticTokenBackend {
    /// Auth method name to its user/token table.
    methods: HashMap<String, HashMap<String, String>>,
}

impl StaticTokenBackend {
    /// Create a backend from a method to user to token mapping.
    pub fn new(methods: HashMap<String, HashMap<String, String>>) -> Self {
        Self { methods }
    }

    /// Convenience for tests and small setups: one method, listed users.
    pub fn single_method<'a>(
        method: &str,
        users: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        let table = users
            .into_iter()
            .map(|(who, token)| (who.to_owned(), token.to_owned()))
            .collect();
        Self {
            methods: HashMap::from([(method.to_owned(), table)]),
        }
    }
}

#[async_trait]
impl AuthBackend for StaticTokenBackend {
    async fn verify(
        &self,
        method: &str,
        who: &str,
        token: &str,
    ) -> Result<AuthOutcome, AuthError> {
        let Some(table) = self.methods.get(method) else {
            return Ok(AuthOutcome::Denied {
                reason: format!("unknown auth method {}", method),
            });
        };
        match table.get(who) {
            Some(expected) if expected == token => Ok(AuthOutcome::Granted { note: None }),
            _ => Ok(AuthOutcome::Denied {
                reason: "bad credentials".to_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[tokio::test]
    async fn static_backend() {
        let auth = StaticTokenBackend::single_method("password", [("alice", "sesame")]);
        match auth.verify("password", "alice", "sesame").await.unwrap() {
            AuthOutcome::Granted { .. } => {}
            other => panic!("unexpected: {:?}", other),
        }
        for (m, w, t) in [
            ("password", "alice", "wrong"),
            ("password", "mallory", "sesame"),
            ("token", "alice", "sesame"),
        ] {
            match auth.verify(m, w, t).await.unwrap() {
                AuthOutcome::Denied { .. } => {}
                other => panic!("unexpected: {:?}", other),
            }
        }
    }
}
