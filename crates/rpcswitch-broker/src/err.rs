//! Error types used by `rpcswitch-broker`.

use std::{io::Error as IoError, sync::Arc};

use serde_json::json;

use crate::codecs::CodecError;

/// An error that the switch reports to a peer as a JSON-RPC error object.
///
/// Every variant maps onto a fixed numeric code; the rendered message is
/// whatever the `Display` impl produces.  Variants in the `-32000..=-32010`
/// range are switch-specific, the rest are the standard JSON-RPC 2.0 codes.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SwitchError {
    /// A request had no `id`, but the method is not a notification.
    #[error("request has no id, but {0} is not a notification")]
    NotNotification(String),

    /// A method handler failed while running.
    #[error("method handler failed: {0}")]
    HandlerFailed(String),

    /// A method was invoked in a connection state that does not allow it.
    #[error("method {method} not allowed in connection state {state}")]
    BadState {
        /// The method that was invoked.
        method: String,
        /// The state the connection was in at the time.
        state: &'static str,
    },

    /// No worker is currently registered for the target backend.
    #[error("no worker available for {0}")]
    NoWorker(String),

    /// The `rpcswitch` envelope on a channel message was missing or malformed.
    #[error("malformed or missing rpcswitch envelope")]
    BadChannel,

    /// The envelope referenced a channel id we do not know about.
    #[error("no such channel: {0}")]
    NoChannel(String),

    /// The opposite end of a channel disconnected.
    #[error("opposite end of channel gone")]
    Gone,

    /// A method name lacked its `ns.` prefix.
    #[error("no namespace in method {0}")]
    NoNamespace(String),

    /// No ACL entry matches the method (or its `ns.*` wildcard).
    #[error("no acl entry for {0}")]
    NoAcl(String),

    /// The caller is not a member of the matched ACL.
    #[error("{who} is not allowed to call {method}")]
    NotAllowed {
        /// The method that was denied.
        method: String,
        /// The caller.
        who: String,
    },

    /// A required (filter) parameter was missing or unusable.
    #[error("bad parameter: {0}")]
    BadParam(String),

    /// An incoming frame exceeded the maximum frame length.
    ///
    /// Shares its numeric code with [`SwitchError::BadParam`]; the two are
    /// kept apart so that logs and tests can tell them apart.
    #[error("frame too large ({len} bytes)")]
    TooBig {
        /// Observed length of the offending frame, in bytes.
        len: usize,
    },

    /// The envelope shape was not a valid JSON-RPC request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The method is neither an internal method nor in the policy table.
    #[error("no such method: {0}")]
    MethodNotFound(String),

    /// Named/positional parameter mismatch, or otherwise unusable params.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// An internal fault inside the switch.
    #[error("internal error: {0}")]
    Internal(String),

    /// A frame could not be parsed as JSON at all.
    #[error("parse error: {0}")]
    Parse(String),
}

impl SwitchError {
    /// Return the numeric JSON-RPC error code for this error.
    pub fn code(&self) -> i64 {
        use SwitchError as E;
        match self {
            E::NotNotification(_) => -32000,
            E::HandlerFailed(_) => -32001,
            E::BadState { .. } => -32002,
            E::NoWorker(_) => -32003,
            E::BadChannel => -32004,
            E::NoChannel(_) => -32005,
            E::Gone => -32006,
            E::NoNamespace(_) => -32007,
            E::NoAcl(_) => -32008,
            E::NotAllowed { .. } => -32009,
            E::BadParam(_) => -32010,
            E::TooBig { .. } => -32010,
            E::InvalidRequest(_) => -32600,
            E::MethodNotFound(_) => -32601,
            E::InvalidParams(_) => -32602,
            E::Internal(_) => -32603,
            E::Parse(_) => -32700,
        }
    }

    /// Render this error as the `error` member of a JSON-RPC response.
    pub(crate) fn to_error_object(&self) -> serde_json::Value {
        json!({
            "code": self.code(),
            "message": self.to_string(),
        })
    }
}

/// A failure that results in closing a connection.
///
/// These are not reported to the peer as JSON-RPC errors (the peer may be
/// gone, or unable to parse anything we send); they surface on the
/// connection task instead.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Unable to write to the peer.
    #[error("could not write to connection")]
    WriteFailed(#[source] Arc<IoError>),
    /// Unable to read from the peer.
    #[error("problem reading from connection")]
    ReadFailed(#[source] Arc<IoError>),
    /// Read something that we could not decode.
    #[error("unable to decode frame from connection")]
    DecodeFailed(#[source] Arc<serde_json::Error>),
    /// Unable to encode one of our own frames.
    #[error("unable to encode frame onto connection")]
    EncodeFailed(#[source] Arc<serde_json::Error>),
    /// The peer sent a frame larger than the configured maximum.
    #[error("frame of {len} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Number of buffered bytes when we gave up.
        len: usize,
        /// The configured maximum frame length.
        max: usize,
    },
}

impl ConnectionError {
    /// Construct a `ConnectionError` from a codec error that occurred while
    /// writing.
    pub(crate) fn writing(error: CodecError) -> Self {
        match error {
            CodecError::Io(e) => Self::WriteFailed(Arc::new(e)),
            CodecError::Json(e) => Self::EncodeFailed(Arc::new(e)),
            CodecError::FrameTooLarge { len, max } => Self::FrameTooLarge { len, max },
        }
    }

    /// Construct a `ConnectionError` from a codec error that occurred while
    /// reading.
    pub(crate) fn reading(error: CodecError) -> Self {
        match error {
            CodecError::Io(e) => Self::ReadFailed(Arc::new(e)),
            CodecError::Json(e) => Self::DecodeFailed(Arc::new(e)),
            CodecError::FrameTooLarge { len, max } => Self::FrameTooLarge { len, max },
        }
    }

    /// Return true if this error is (or might be) due to the peer closing
    /// the connection.
    ///
    /// Such errors are tolerated without much complaint; other errors get at
    /// least a log line.
    pub(crate) fn is_connection_close(&self) -> bool {
        use serde_json::error::Category as JK;
        use std::io::ErrorKind as IK;
        match self {
            Self::ReadFailed(e) | Self::WriteFailed(e) => matches!(
                e.kind(),
                IK::UnexpectedEof | IK::ConnectionAborted | IK::ConnectionReset | IK::BrokenPipe
            ),
            Self::DecodeFailed(e) => matches!(e.classify(), JK::Eof),
            _ => false,
        }
    }
}
