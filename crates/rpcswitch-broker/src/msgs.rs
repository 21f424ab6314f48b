//! Message types used on a switch connection.
//!
//! We keep every incoming frame around as its raw JSON object: most frames
//! are relayed to the opposite end of a channel, and relaying must not
//! disturb fields we do not understand.  The accessors here interpret just
//! enough of the object to drive the dispatcher.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::channel::Vci;
use crate::err::SwitchError;

/// The sentinel cookie carried in every channel envelope.
pub(crate) const VCOOKIE: &str = "eatme";

/// The key under which the channel envelope is carried in a frame.
pub(crate) const ENVELOPE_KEY: &str = "rpcswitch";

/// An identifier for a request within the context of a connection.
///
/// Multiple in-flight requests may share the same `RequestId`; doing so
/// makes the responses ambiguous, and is the peer's problem.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum RequestId {
    /// A peer-provided string.
    //
    // (We use Box<str> to save a word here, since these never have to be
    // mutable.)
    Str(Box<str>),
    /// A peer-provided integer.
    Int(i64),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Str(s) => write!(f, "{}", s),
            RequestId::Int(i) => write!(f, "{}", i),
        }
    }
}

impl RequestId {
    /// Render this id as the JSON value it arrived as.
    pub(crate) fn to_value(&self) -> Value {
        match self {
            RequestId::Str(s) => Value::String(s.to_string()),
            RequestId::Int(i) => Value::from(*i),
        }
    }
}

/// The switch envelope attached to every frame that travels on a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChannelEnvelope {
    /// Sentinel; must equal [`VCOOKIE`].
    pub(crate) vcookie: String,
    /// The channel identifier.
    pub(crate) vci: String,
    /// The authenticated caller, stamped by the switch on the way out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) who: Option<String>,
}

/// A single parsed frame, kept as its raw JSON object.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    /// The object members of the frame.
    obj: Map<String, Value>,
}

impl Frame {
    /// Wrap a decoded JSON value, insisting that it is an object.
    pub(crate) fn from_value(v: Value) -> Result<Frame, SwitchError> {
        match v {
            Value::Object(obj) => Ok(Frame { obj }),
            other => Err(SwitchError::InvalidRequest(format!(
                "expected an object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    /// Give back the raw object, for verbatim forwarding.
    pub(crate) fn into_value(self) -> Value {
        Value::Object(self.obj)
    }

    /// The `method` member, if it is present and a string.
    pub(crate) fn method(&self) -> Option<&str> {
        self.obj.get("method").and_then(Value::as_str)
    }

    /// The `params` member, if any.
    pub(crate) fn params(&self) -> Option<&Value> {
        self.obj.get("params")
    }

    /// Take the `params` member out of the frame.
    ///
    /// Used when rewriting an outgoing request, so the params that arrived
    /// are the params that leave.
    pub(crate) fn take_params(&mut self) -> Option<Value> {
        self.obj.remove("params")
    }

    /// Parse the `id` member.
    ///
    /// `None` means the id was absent or JSON `null`; any other non-string,
    /// non-integer id is an envelope error.
    pub(crate) fn id(&self) -> Result<Option<RequestId>, SwitchError> {
        match self.obj.get("id") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(RequestId::Str(s.as_str().into()))),
            Some(Value::Number(n)) => n
                .as_i64()
                .map(|i| Some(RequestId::Int(i)))
                .ok_or_else(|| SwitchError::InvalidRequest("non-integer id".into())),
            Some(other) => Err(SwitchError::InvalidRequest(format!(
                "id must be a string or integer, not {}",
                json_type_name(other)
            ))),
        }
    }

    /// True if this frame is a response: no `method`, and a `result` or
    /// `error` member.
    pub(crate) fn is_response(&self) -> bool {
        !self.obj.contains_key("method")
            && (self.obj.contains_key("result") || self.obj.contains_key("error"))
    }

    /// The channel envelope, if one is present.
    ///
    /// `Some(Err(..))` means an envelope member exists but is unusable,
    /// including the case of a wrong cookie.
    pub(crate) fn envelope(&self) -> Option<Result<ChannelEnvelope, SwitchError>> {
        let raw = self.obj.get(ENVELOPE_KEY)?;
        let parsed = serde_json::from_value::<ChannelEnvelope>(raw.clone())
            .map_err(|_| SwitchError::BadChannel)
            .and_then(|env| {
                if env.vcookie == VCOOKIE {
                    Ok(env)
                } else {
                    Err(SwitchError::BadChannel)
                }
            });
        Some(parsed)
    }
}

/// Name a JSON value's type, for error messages.
fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Build a successful JSON-RPC response.
pub(crate) fn ok_response(id: Option<&RequestId>, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id.map(RequestId::to_value).unwrap_or(Value::Null),
        "result": result,
    })
}

/// Build an error response from a [`SwitchError`].
pub(crate) fn err_response(id: Option<&RequestId>, err: &SwitchError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id.map(RequestId::to_value).unwrap_or(Value::Null),
        "error": err.to_error_object(),
    })
}

/// Build an error response carrying a channel envelope, as sent to the
/// surviving end of a torn-down channel.
pub(crate) fn channel_err_response(id: &RequestId, vci: &Vci, err: &SwitchError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id.to_value(),
        "error": err.to_error_object(),
        ENVELOPE_KEY: { "vcookie": VCOOKIE, "vci": vci.as_str() },
    })
}

/// Build a JSON-RPC notification (a request without an id).
pub(crate) fn notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}
