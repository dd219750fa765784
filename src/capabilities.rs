//! The negotiated server capability cache and its `textDocumentSync` decoding.

use serde_json::Value;

use crate::config::get_dotted_value;

/// The server wants no document sync notifications at all.
pub const TEXT_DOCUMENT_SYNC_NONE: i64 = 0;

/// Capabilities published by the server in its `initialize` response.
///
/// The cache is queried by dotted capability name (e.g. `"textDocumentSync"`,
/// `"workspace.workspaceFolders.supported"`). It is populated once when initialization completes
/// and cleared again when the session ends; in between it is read-only.
///
/// Every decoder below is total: whatever shape the server sent (absent, integer, object with any
/// subset of fields, or something else entirely) resolves to a definite answer.
#[derive(Clone, Debug, PartialEq)]
pub struct Capabilities(Value);

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities(Value::Object(Default::default()))
    }
}

impl Capabilities {
    pub(crate) fn replace(&mut self, capabilities: &Value) {
        self.0 = match capabilities {
            Value::Object(_) => capabilities.clone(),
            _ => Value::Object(Default::default()),
        };
    }

    pub(crate) fn clear(&mut self) {
        self.0 = Value::Object(Default::default());
    }

    /// Returns `true` when no capabilities are cached.
    pub fn is_empty(&self) -> bool {
        self.0.as_object().map_or(true, |map| map.is_empty())
    }

    /// Resolves a dotted capability name.
    pub fn get(&self, capability: &str) -> Option<&Value> {
        get_dotted_value(&self.0, capability)
    }

    /// Returns `true` when the capability is present and not literally `false`.
    pub fn has(&self, capability: &str) -> bool {
        !matches!(self.get(capability), None | Some(Value::Bool(false)))
    }

    fn text_document_sync(&self) -> Option<&Value> {
        self.get("textDocumentSync")
    }

    /// The change-notification kind the server asked for, as a plain integer.
    pub fn text_sync_kind(&self) -> i64 {
        match self.text_document_sync() {
            Some(Value::Object(options)) => options
                .get("change")
                .and_then(Value::as_i64)
                .unwrap_or(TEXT_DOCUMENT_SYNC_NONE),
            Some(Value::Number(kind)) => kind.as_i64().unwrap_or(TEXT_DOCUMENT_SYNC_NONE),
            _ => TEXT_DOCUMENT_SYNC_NONE,
        }
    }

    pub fn should_notify_did_open(&self) -> bool {
        match self.text_document_sync() {
            Some(Value::Object(options)) => options.get("openClose").map_or(false, truthy),
            Some(Value::Number(kind)) => {
                kind.as_i64().unwrap_or(TEXT_DOCUMENT_SYNC_NONE) > TEXT_DOCUMENT_SYNC_NONE
            }
            _ => false,
        }
    }

    pub fn should_notify_did_close(&self) -> bool {
        self.should_notify_did_open()
    }

    pub fn should_notify_did_change(&self) -> bool {
        self.text_sync_kind() > TEXT_DOCUMENT_SYNC_NONE
    }

    pub fn should_notify_will_save(&self) -> bool {
        self.sync_option_flag("willSave")
    }

    pub fn should_request_will_save_wait_until(&self) -> bool {
        self.sync_option_flag("willSaveWaitUntil")
    }

    /// Reads a boolean flag out of the `textDocumentSync` object, if present.
    fn sync_option_flag(&self, key: &str) -> bool {
        match self.text_document_sync() {
            Some(Value::Object(options)) => options.get(key).map_or(false, truthy),
            _ => false,
        }
    }

    /// Returns `(enabled, include_text)` for the `didSave` notification.
    pub fn should_notify_did_save(&self) -> (bool, bool) {
        match self.text_document_sync() {
            Some(Value::Object(options)) => match options.get("save") {
                Some(Value::Object(save)) => (true, save.get("includeText").map_or(false, truthy)),
                Some(Value::Bool(enabled)) => (*enabled, false),
                _ => (false, false),
            },
            _ => (false, false),
        }
    }

    /// Whether the server accepts `workspace/didChangeWorkspaceFolders` notifications.
    pub fn supports_workspace_folders(&self) -> bool {
        self.get("workspace.workspaceFolders.supported")
            .map_or(false, truthy)
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
