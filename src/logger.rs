//! Debug logging of wire traffic, with redaction of oversized payloads.

use lsp_types::notification::{LogMessage, Notification};
use serde_json::Value;
use tracing::debug;

use crate::config::Settings;
use crate::jsonrpc::{Error, Id};

const TARGET: &str = "lsp_session::wire";

/// Emits one pre-formatted debug line per payload crossing the wire.
///
/// The direction markers distinguish plain (`-->`) from blocking (`==>`) outgoing requests and
/// handled (`<- `) from unhandled (`<? `) incoming notifications.
pub(crate) struct PayloadLogger {
    settings: Settings,
    server_name: String,
}

impl PayloadLogger {
    pub(crate) fn new(settings: Settings, server_name: String) -> Self {
        PayloadLogger {
            settings,
            server_name,
        }
    }

    pub(crate) fn debug_enabled(&self) -> bool {
        self.settings.log_debug
    }

    fn log(&self, message: String, params: Option<&Value>, log_payload: bool) {
        if log_payload {
            debug!(target: TARGET, "{}: {}", message, display_params(params));
        } else {
            debug!(target: TARGET, "{}", message);
        }
    }

    fn format_response(&self, direction: &str, request_id: &Id) -> String {
        format!("{} {} {}", direction, self.server_name, request_id)
    }

    fn format_request(&self, direction: &str, method: &str, request_id: &Id) -> String {
        format!("{} {} {}({})", direction, self.server_name, method, request_id)
    }

    fn format_notification(&self, direction: &str, method: &str) -> String {
        format!("{} {} {}", direction, self.server_name, method)
    }

    pub(crate) fn outgoing_request(&self, request_id: i64, method: &str, params: Option<&Value>, blocking: bool) {
        if !self.settings.log_debug {
            return;
        }
        let direction = if blocking { "==>" } else { "-->" };
        let line = self.format_request(direction, method, &Id::Number(request_id));
        self.log(line, params, self.settings.log_payloads);
    }

    pub(crate) fn outgoing_notification(&self, method: &str, params: Option<&Value>) {
        if !self.settings.log_debug {
            return;
        }
        // The payload might contain the entire content of a view, so suppress it for the
        // document-sync notifications that embed full text.
        let log_payload = self.settings.log_payloads && should_log_payload(method, params);
        self.log(self.format_notification(" ->", method), params, log_payload);
    }

    pub(crate) fn outgoing_response(&self, request_id: &Id, result: &Value) {
        if !self.settings.log_debug {
            return;
        }
        let line = self.format_response(">>>", request_id);
        self.log(line, Some(result), self.settings.log_payloads);
    }

    pub(crate) fn outgoing_error_response(&self, request_id: &Id, error: &Error) {
        if !self.settings.log_debug {
            return;
        }
        let line = self.format_response("~~>", request_id);
        let payload = serde_json::to_value(error).unwrap_or(Value::Null);
        self.log(line, Some(&payload), self.settings.log_payloads);
    }

    pub(crate) fn incoming_response(&self, request_id: i64, result: &Value) {
        if !self.settings.log_debug {
            return;
        }
        let line = self.format_response("<<<", &Id::Number(request_id));
        self.log(line, Some(result), self.settings.log_payloads);
    }

    pub(crate) fn incoming_error_response(&self, request_id: i64, error: &Value) {
        if !self.settings.log_debug {
            return;
        }
        let line = self.format_response("<~~", &Id::Number(request_id));
        self.log(line, Some(error), self.settings.log_payloads);
    }

    pub(crate) fn incoming_request(&self, request_id: &Id, method: &str, params: Option<&Value>) {
        if !self.settings.log_debug {
            return;
        }
        let line = self.format_request("<--", method, request_id);
        self.log(line, params, self.settings.log_payloads);
    }

    pub(crate) fn incoming_notification(&self, method: &str, params: Option<&Value>, unhandled: bool) {
        // `window/logMessage` is never echoed back into the debug log.
        if !self.settings.log_debug || method == LogMessage::METHOD {
            return;
        }
        let direction = if unhandled { "<? " } else { "<- " };
        let line = self.format_notification(direction, method);
        self.log(line, params, self.settings.log_payloads);
    }
}

fn display_params(params: Option<&Value>) -> String {
    match params {
        Some(params) => params.to_string(),
        None => "null".to_string(),
    }
}

/// Decides whether a notification body is safe to echo into the log.
///
/// Bodies are suppressed when they may contain the entire document text: `didOpen`, full-document
/// `didChange` (first content change has no `range`), and `didSave` with an inlined `text`.
pub(crate) fn should_log_payload(method: &str, params: Option<&Value>) -> bool {
    if method.ends_with("didOpen") {
        return false;
    }

    if method.ends_with("didChange") {
        let first_change = params
            .and_then(|p| p.get("contentChanges"))
            .and_then(|changes| changes.get(0));
        if let Some(change) = first_change {
            return change.get("range").is_some();
        }
        return true;
    }

    if method.ends_with("didSave") {
        return params.map_or(true, |p| p.get("text").is_none());
    }

    true
}
