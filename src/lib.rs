//! Client-side core of a Language Server Protocol session.
//!
//! This crate implements the editor-facing half of an LSP connection: it spawns or connects to a
//! language server, pumps `Content-Length`-framed JSON-RPC messages over the transport,
//! correlates requests with responses (asynchronous callback style and blocking synchronous
//! style), negotiates capabilities through the `initialize` handshake, and routes
//! server-originated traffic to the editor integration.
//!
//! The layering, bottom to top:
//!
//! * [`Transport`]: the LSP wire framing and the byte stream, with reader, stderr, and writer
//!   tasks reporting upward through [`TransportCallbacks`].
//! * [`RpcClient`]: request IDs, the response-handler table, and the synchronous rendezvous.
//! * [`Session`]: the per-server state machine, capability cache, and workspace folders.
//! * [`LanguageHost`]: the trait a host implements to receive editor-side effects.
//!
//! Everything editor-specific (buffers, UI, feature requests like hover or rename) lives with
//! the host; this crate only moves and correlates messages.

#![forbid(unsafe_code)]

/// A re-export of [`async-trait`](https://docs.rs/async-trait) for convenience.
pub use async_trait::async_trait;

pub mod capabilities;
pub mod client;
pub mod config;
pub mod jsonrpc;
pub mod session;
pub mod transport;
pub mod workspace;

mod codec;
mod logger;

use std::sync::Arc;

use lsp_types::{
    ApplyWorkspaceEditParams, LogMessageParams, PublishDiagnosticsParams, ShowMessageParams,
    ShowMessageRequestParams,
};

pub use self::client::RpcClient;
pub use self::config::{ClientConfig, Settings, TransportParams};
pub use self::jsonrpc::Id;
pub use self::session::{Session, SessionState};
pub use self::transport::{Transport, TransportCallbacks, TransportError};
pub use self::workspace::WorkspaceFolder;

/// Editor-side integration surface of a [`Session`].
///
/// Sessions hold their host weakly: once the host is dropped, every callback becomes a no-op.
/// All methods default to doing nothing, so hosts only implement what they care about. None of
/// them is re-entered synchronously from within a send operation.
#[async_trait]
pub trait LanguageHost: Send + Sync + 'static {
    /// A line the server wrote to stderr.
    async fn handle_stderr_log(&self, session: Arc<Session>, line: String) {
        let _ = (session, line);
    }

    /// The session finished its `initialize` handshake and is ready for use.
    async fn on_post_initialize(&self, session: Arc<Session>) {
        let _ = session;
    }

    /// The session's transport has closed, orderly or not.
    async fn on_post_exit(
        &self,
        session: Arc<Session>,
        exit_code: i32,
        error: Option<TransportError>,
    ) {
        let _ = (session, exit_code, error);
    }

    /// A `window/showMessageRequest` request. The host answers through
    /// [`Session::send_response`] whenever the user picks an action.
    async fn handle_message_request(
        &self,
        session: Arc<Session>,
        params: ShowMessageRequestParams,
        request_id: Id,
    ) {
        let _ = (session, params, request_id);
    }

    /// A `window/showMessage` notification.
    async fn handle_show_message(&self, session: Arc<Session>, params: ShowMessageParams) {
        let _ = (session, params);
    }

    /// A `window/logMessage` notification.
    async fn handle_log_message(&self, session: Arc<Session>, params: LogMessageParams) {
        let _ = (session, params);
    }

    /// A `workspace/applyEdit` request. The host answers through [`Session::send_response`]
    /// once the edit has been applied (or refused).
    async fn apply_workspace_edit(
        &self,
        session: Arc<Session>,
        params: ApplyWorkspaceEditParams,
        request_id: Id,
    ) {
        let _ = (session, params, request_id);
    }

    /// A `textDocument/publishDiagnostics` notification, keyed by the server's configured name.
    async fn publish_diagnostics(&self, server_name: String, params: PublishDiagnosticsParams) {
        let _ = (server_name, params);
    }
}
