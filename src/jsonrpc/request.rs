//! Client-to-server method calls and notifications.

use std::borrow::Cow;
use std::fmt::{self, Display, Formatter};

use lsp_types::notification::Notification as _;
use lsp_types::request::Request as _;
use serde_json::{Map, Value};

use super::Version;

/// A JSON-RPC method call awaiting an ID.
///
/// Requests do not carry their own request ID. The ID is allocated by the RPC client at send
/// time, which is what guarantees that IDs are unique and strictly increasing within a session.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    method: Cow<'static, str>,
    params: Option<Value>,
}

impl Request {
    /// Creates a new method call with the given `params`.
    pub fn new<M>(method: M, params: Value) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        Request {
            method: method.into(),
            params: Some(params),
        }
    }

    /// Constructs a JSON-RPC method call from its corresponding LSP type.
    ///
    /// # Panics
    ///
    /// Panics if `params` could not be serialized into a [`serde_json::Value`]. Since the
    /// [`lsp_types::request::Request`] trait promises this invariant is upheld, this should never
    /// happen in practice (unless the trait was implemented incorrectly).
    pub fn from_request<R>(params: R::Params) -> Self
    where
        R: lsp_types::request::Request,
    {
        Request {
            method: R::METHOD.into(),
            params: Some(serde_json::to_value(params).unwrap()),
        }
    }

    /// Constructs the `initialize` request.
    pub fn initialize(params: Value) -> Self {
        Request::new(lsp_types::request::Initialize::METHOD, params)
    }

    /// Constructs the `shutdown` request.
    pub fn shutdown() -> Self {
        Request {
            method: lsp_types::request::Shutdown::METHOD.into(),
            params: None,
        }
    }

    /// Returns the name of the method to be invoked.
    pub fn method(&self) -> &str {
        self.method.as_ref()
    }

    /// Returns the `params` field, if present.
    pub fn params(&self) -> Option<&Value> {
        self.params.as_ref()
    }

    /// Assembles the outgoing wire payload under the given request ID.
    pub(crate) fn into_payload(self, id: i64) -> Value {
        let mut payload = Map::new();
        payload.insert("jsonrpc".to_string(), version());
        payload.insert("id".to_string(), Value::from(id));
        payload.insert("method".to_string(), Value::from(self.method.into_owned()));
        if let Some(params) = self.params {
            payload.insert("params".to_string(), params);
        }
        Value::Object(payload)
    }
}

impl Display for Request {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.method)
    }
}

/// A JSON-RPC notification.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    method: Cow<'static, str>,
    params: Option<Value>,
}

impl Notification {
    /// Creates a new notification with the given `params`.
    pub fn new<M>(method: M, params: Value) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        Notification {
            method: method.into(),
            params: Some(params),
        }
    }

    /// Constructs a JSON-RPC notification from its corresponding LSP type.
    ///
    /// # Panics
    ///
    /// Panics if `params` could not be serialized into a [`serde_json::Value`]. Since the
    /// [`lsp_types::notification::Notification`] trait promises this invariant is upheld, this
    /// should never happen in practice (unless the trait was implemented incorrectly).
    pub fn from_notification<N>(params: N::Params) -> Self
    where
        N: lsp_types::notification::Notification,
    {
        Notification {
            method: N::METHOD.into(),
            params: Some(serde_json::to_value(params).unwrap()),
        }
    }

    /// Constructs the `exit` notification.
    pub fn exit() -> Self {
        Notification {
            method: lsp_types::notification::Exit::METHOD.into(),
            params: None,
        }
    }

    /// Returns the name of the method to be invoked.
    pub fn method(&self) -> &str {
        self.method.as_ref()
    }

    /// Returns the `params` field, if present.
    pub fn params(&self) -> Option<&Value> {
        self.params.as_ref()
    }

    /// Assembles the outgoing wire payload.
    pub(crate) fn into_payload(self) -> Value {
        let mut payload = Map::new();
        payload.insert("jsonrpc".to_string(), version());
        payload.insert("method".to_string(), Value::from(self.method.into_owned()));
        if let Some(params) = self.params {
            payload.insert("params".to_string(), params);
        }
        Value::Object(payload)
    }
}

pub(crate) fn version() -> Value {
    serde_json::to_value(Version).unwrap()
}
