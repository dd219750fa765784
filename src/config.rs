//! Per-session client configuration.

use serde_json::Value;

/// How to reach the language server process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportParams {
    /// Spawn the server binary and talk to it over its standard streams.
    Stdio {
        /// Path or name of the server executable.
        command: String,
        /// Arguments passed to the server executable.
        args: Vec<String>,
    },
    /// Connect to an already-running server over TCP.
    Tcp {
        /// Host the server is listening on.
        host: String,
        /// Port the server is listening on.
        port: u16,
    },
}

/// Immutable per-session configuration for one language server.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Display name of the server, also used to key its diagnostics.
    pub name: String,
    /// How to reach the server.
    pub transport: TransportParams,
    /// Value for `initializationOptions` in the `initialize` request, if any.
    pub init_options: Option<Value>,
    /// Arbitrary settings tree served back to the server on request, queryable by dotted path.
    pub settings: Value,
    /// Language IDs this server is responsible for.
    pub languages: Vec<String>,
}

impl ClientConfig {
    /// Creates a configuration for a server spawned from the given command line.
    pub fn stdio<N, C>(name: N, command: C, args: Vec<String>) -> Self
    where
        N: Into<String>,
        C: Into<String>,
    {
        ClientConfig {
            name: name.into(),
            transport: TransportParams::Stdio {
                command: command.into(),
                args,
            },
            init_options: None,
            settings: Value::Null,
            languages: Vec::new(),
        }
    }

    /// Creates a configuration for a server reachable over TCP.
    pub fn tcp<N, H>(name: N, host: H, port: u16) -> Self
    where
        N: Into<String>,
        H: Into<String>,
    {
        ClientConfig {
            name: name.into(),
            transport: TransportParams::Tcp {
                host: host.into(),
                port,
            },
            init_options: None,
            settings: Value::Null,
            languages: Vec::new(),
        }
    }

    /// Returns `true` when a settings tree has been configured.
    pub fn has_settings(&self) -> bool {
        match &self.settings {
            Value::Null => false,
            Value::Object(map) => !map.is_empty(),
            _ => true,
        }
    }
}

/// Behavior switches for wire-traffic logging, passed to the logger by value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Settings {
    /// Emit a debug line for every payload sent or received.
    pub log_debug: bool,
    /// Include payload bodies in those lines (subject to redaction).
    pub log_payloads: bool,
}

/// Resolves a dotted path like `"a.b.c"` through nested JSON objects.
///
/// Returns `None` when any path segment is missing or the current value is not an object. The
/// empty path resolves through the empty segment and therefore also yields `None`.
pub fn get_dotted_value<'a>(current: &'a Value, dotted: &str) -> Option<&'a Value> {
    let mut current = current;
    for key in dotted.split('.') {
        current = current.as_object()?.get(key)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn resolves_nested_paths() {
        let tree = json!({"a": {"b": 1}});
        assert_eq!(get_dotted_value(&tree, "a.b"), Some(&json!(1)));
        assert_eq!(get_dotted_value(&tree, "a"), Some(&json!({"b": 1})));
    }

    #[test]
    fn missing_segments_resolve_to_none() {
        assert_eq!(get_dotted_value(&json!({"a": 1}), "a.b"), None);
        assert_eq!(get_dotted_value(&json!({"a": {"b": 1}}), "a.c"), None);
    }

    #[test]
    fn empty_path_resolves_to_none() {
        assert_eq!(get_dotted_value(&json!({}), ""), None);
        assert_eq!(get_dotted_value(&json!({"python": 1}), ""), None);
    }

    #[test]
    fn settings_emptiness() {
        let mut config = ClientConfig::stdio("test", "srv", vec![]);
        assert!(!config.has_settings());
        config.settings = json!({});
        assert!(!config.has_settings());
        config.settings = json!({"python": {"pythonPath": "/usr/bin/py"}});
        assert!(config.has_settings());
    }
}
