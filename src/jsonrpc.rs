//! A subset of JSON-RPC types used by the Language Server Protocol.

pub use self::error::{Error, ErrorCode, Result};
pub use self::request::{Notification, Request};
pub use self::response::Response;

use std::borrow::Cow;
use std::fmt::{self, Debug, Display, Formatter};

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod error;
mod request;
mod response;

/// A unique ID used to correlate requests and responses together.
///
/// IDs allocated for outgoing requests are always numeric, but servers are free to key their own
/// requests with strings, so both forms must round-trip.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Id {
    /// Numeric ID.
    Number(i64),
    /// String ID.
    String(String),
}

impl Id {
    /// Returns the numeric value of this ID, accepting numeric strings such as `"3"`.
    ///
    /// Locally allocated request IDs are always integers, so any response which cannot be keyed
    /// back to an integer cannot belong to an outstanding request.
    pub fn as_number(&self) -> Option<i64> {
        match self {
            Id::Number(n) => Some(*n),
            Id::String(s) => s.parse().ok(),
        }
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Id::Number(id) => Display::fmt(id, f),
            Id::String(id) => Debug::fmt(id, f),
        }
    }
}

impl From<i64> for Id {
    fn from(n: i64) -> Self {
        Id::Number(n)
    }
}

impl From<&'_ str> for Id {
    fn from(s: &'_ str) -> Self {
        Id::String(s.to_string())
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Id::String(s)
    }
}

/// The `jsonrpc` version marker. Only `"2.0"` is accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Version;

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Inner<'a>(#[serde(borrow)] Cow<'a, str>);

        let Inner(ver) = Inner::deserialize(deserializer)?;

        match ver.as_ref() {
            "2.0" => Ok(Version),
            _ => Err(de::Error::custom("expected JSON-RPC version \"2.0\"")),
        }
    }
}

impl Serialize for Version {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str("2.0")
    }
}

/// An incoming JSON-RPC message, classified by shape.
///
/// Classification follows the protocol rules rather than full deserialization: the presence of a
/// `method` member makes the payload a server-to-client request or notification, an `id` member
/// without `method` makes it a response, and anything else is unknown. The `result`/`error`
/// members of a response are kept raw so that invalid combinations (both present, both absent)
/// can be detected and reported by the dispatcher.
#[derive(Debug)]
pub(crate) enum Message {
    /// A server-to-client request (`id` present) or notification (`id` absent).
    Request {
        method: String,
        params: Option<Value>,
        id: Option<Id>,
    },
    /// A response to a client-to-server request.
    Response {
        id: Id,
        result: Option<Value>,
        error: Option<Value>,
    },
    /// A payload which is neither a request nor a response.
    Unknown(Value),
}

impl Message {
    pub(crate) fn classify(payload: Value) -> Message {
        let mut object = match payload {
            Value::Object(object) => object,
            other => return Message::Unknown(other),
        };

        match object.remove("method") {
            Some(Value::String(method)) => {
                return Message::Request {
                    method,
                    params: object.remove("params"),
                    id: object.remove("id").and_then(parse_id),
                };
            }
            Some(other) => {
                object.insert("method".to_string(), other);
                return Message::Unknown(Value::Object(object));
            }
            None => {}
        }

        if let Some(id) = object.remove("id") {
            return match parse_id(id) {
                Some(id) => Message::Response {
                    id,
                    result: object.remove("result"),
                    error: object.remove("error"),
                },
                None => Message::Unknown(Value::Object(object)),
            };
        }

        Message::Unknown(Value::Object(object))
    }
}

fn parse_id(id: Value) -> Option<Id> {
    match id {
        Value::Number(n) => n.as_i64().map(Id::Number),
        Value::String(s) => Some(Id::String(s)),
        _ => None,
    }
}
