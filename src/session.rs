//! Per-server session: the lifecycle state machine and the LSP semantics layered on top of the
//! JSON-RPC client.

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use lsp_types::notification::{
    DidChangeConfiguration, DidChangeWorkspaceFolders, LogMessage, Notification as _,
    PublishDiagnostics, ShowMessage,
};
use lsp_types::request::{
    ApplyWorkspaceEdit, Request as _, ShowMessageRequest, WorkspaceConfiguration,
    WorkspaceFoldersRequest,
};
use lsp_types::{
    ApplyWorkspaceEditParams, ConfigurationParams, DidChangeConfigurationParams,
    DidChangeWorkspaceFoldersParams, LogMessageParams, PublishDiagnosticsParams,
    ShowMessageParams, ShowMessageRequestParams, WorkspaceFoldersChangeEvent,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::capabilities::Capabilities;
use crate::client::{ErrorHandler, ResponseHandler, RpcClient, ServerMessageHandler};
use crate::config::{get_dotted_value, ClientConfig, Settings};
use crate::jsonrpc::{self, Error, Id, Notification, Request, Response};
use crate::transport::TransportError;
use crate::workspace::{diff_folders, is_subpath_of, WorkspaceFolder};
use crate::LanguageHost;

/// Lifecycle of a session. Transitions are monotonic; a session never moves backwards.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum SessionState {
    /// Constructed, `initialize` not yet answered.
    Starting = 0,
    /// Initialization succeeded; the server is in service.
    Ready = 1,
    /// Shutdown has begun; waiting for the transport to wind down.
    Stopping = 2,
    /// The transport is closed.
    Stopped = 3,
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        StateCell(AtomicU8::new(SessionState::Starting as u8))
    }

    fn get(&self) -> SessionState {
        match self.0.load(Ordering::SeqCst) {
            0 => SessionState::Starting,
            1 => SessionState::Ready,
            2 => SessionState::Stopping,
            _ => SessionState::Stopped,
        }
    }

    /// Moves to `next` only if it is strictly ahead of the current state.
    fn advance(&self, next: SessionState) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < next as u8).then_some(next as u8)
            })
            .is_ok()
    }
}

/// One connection to one language server, from handshake to teardown.
///
/// The session owns the [`RpcClient`] and with it the transport. Server-originated requests and
/// notifications are routed through a static dispatch table keyed by the LSP method name; the
/// editor-side effects go through the [`LanguageHost`], which is held weakly, so callbacks after
/// the host is gone are silently dropped.
pub struct Session {
    config: ClientConfig,
    host: Weak<dyn LanguageHost>,
    state: StateCell,
    capabilities: RwLock<Capabilities>,
    folders: Mutex<Vec<WorkspaceFolder>>,
    client: Arc<RpcClient>,
}

impl Session {
    /// Spawns the server transport and assembles a session around it.
    ///
    /// The returned session is in [`SessionState::Starting`]; call
    /// [`initialize`](Session::initialize) to begin the handshake.
    pub async fn start(
        host: Weak<dyn LanguageHost>,
        settings: Settings,
        cwd: &Path,
        config: ClientConfig,
        folders: Vec<WorkspaceFolder>,
    ) -> Result<Arc<Session>, TransportError> {
        let client = RpcClient::connect(&config, cwd, settings).await?;
        Ok(Session::assemble(host, config, folders, client))
    }

    fn assemble(
        host: Weak<dyn LanguageHost>,
        config: ClientConfig,
        folders: Vec<WorkspaceFolder>,
        client: Arc<RpcClient>,
    ) -> Arc<Session> {
        let session = Arc::new(Session {
            config,
            host,
            state: StateCell::new(),
            capabilities: RwLock::new(Capabilities::default()),
            folders: Mutex::new(folders),
            client,
        });
        session
            .client
            .bind_handler(Arc::downgrade(&session) as Weak<dyn ServerMessageHandler>);
        session
    }

    /// The configuration this session was started with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Snapshot of the current workspace folder list.
    pub fn workspace_folders(&self) -> Vec<WorkspaceFolder> {
        self.lock_folders().clone()
    }

    /// Begins the `initialize` handshake.
    ///
    /// On success the session becomes [`SessionState::Ready`] and the host is notified through
    /// [`LanguageHost::on_post_initialize`]; on failure the session shuts down.
    pub fn initialize(self: &Arc<Self>) {
        let params = initialize_params(&self.lock_folders(), &self.config);

        let session = Arc::downgrade(self);
        let on_result: ResponseHandler = Box::new(move |result| {
            Box::pin(async move {
                if let Some(session) = session.upgrade() {
                    session.handle_initialize_result(result).await;
                }
            })
        });

        let session = Arc::downgrade(self);
        let on_error: ErrorHandler = Box::new(move |error| {
            Box::pin(async move {
                if let Some(session) = session.upgrade() {
                    warn!("initialize failed for {}: {}", session.config.name, error);
                    session.end();
                }
            })
        });

        self.client
            .send_request(Request::initialize(params), on_result, Some(on_error));
    }

    /// Begins a graceful shutdown: `shutdown` request, then `exit`, then transport close.
    ///
    /// Idempotent; requests after the first call are not repeated.
    pub fn end(self: &Arc<Self>) {
        if !self.state.advance(SessionState::Stopping) {
            return;
        }
        debug!("stopping {} gracefully", self.config.name);
        self.lock_capabilities_mut().clear();

        let session = Arc::downgrade(self);
        let on_result: ResponseHandler = Box::new(move |_| {
            Box::pin(async move {
                if let Some(session) = session.upgrade() {
                    session.client.exit();
                }
            })
        });

        let session = Arc::downgrade(self);
        let on_error: ErrorHandler = Box::new(move |_| {
            Box::pin(async move {
                if let Some(session) = session.upgrade() {
                    session.client.exit();
                }
            })
        });

        self.client
            .send_request(Request::shutdown(), on_result, Some(on_error));
    }

    // Capability queries.

    /// Returns `true` when the capability is present and not literally `false`.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.lock_capabilities().has(capability)
    }

    /// Returns a copy of the capability value, if present.
    pub fn get_capability(&self, capability: &str) -> Option<Value> {
        self.lock_capabilities().get(capability).cloned()
    }

    pub fn should_notify_did_open(&self) -> bool {
        self.lock_capabilities().should_notify_did_open()
    }

    pub fn should_notify_did_close(&self) -> bool {
        self.lock_capabilities().should_notify_did_close()
    }

    pub fn should_notify_did_change(&self) -> bool {
        self.lock_capabilities().should_notify_did_change()
    }

    pub fn text_sync_kind(&self) -> i64 {
        self.lock_capabilities().text_sync_kind()
    }

    pub fn should_notify_will_save(&self) -> bool {
        self.lock_capabilities().should_notify_will_save()
    }

    pub fn should_request_will_save_wait_until(&self) -> bool {
        self.lock_capabilities().should_request_will_save_wait_until()
    }

    /// Returns `(enabled, include_text)` for the `didSave` notification.
    pub fn should_notify_did_save(&self) -> (bool, bool) {
        self.lock_capabilities().should_notify_did_save()
    }

    /// Whether this server is responsible for the given file.
    ///
    /// A session with no workspace folders handles everything; otherwise the file must live
    /// inside one of the folders. The empty path is never handled.
    pub fn handles_path(&self, file_path: &Path) -> bool {
        if file_path.as_os_str().is_empty() {
            return false;
        }

        let folders = self.lock_folders();
        if folders.is_empty() {
            return true;
        }

        folders
            .iter()
            .any(|folder| is_subpath_of(file_path, &folder.path))
    }

    /// Replaces the workspace folder list, announcing the difference to the server.
    ///
    /// Servers that did not advertise `workspace.workspaceFolders.supported` keep their original
    /// folder list and receive nothing.
    pub fn update_folders(&self, new_folders: Vec<WorkspaceFolder>) {
        if !self.lock_capabilities().supports_workspace_folders() {
            return;
        }

        let mut folders = self.lock_folders();
        let (added, removed) = diff_folders(&folders, &new_folders);
        let params = DidChangeWorkspaceFoldersParams {
            event: WorkspaceFoldersChangeEvent {
                added: added.iter().map(WorkspaceFolder::to_lsp).collect(),
                removed: removed.iter().map(WorkspaceFolder::to_lsp).collect(),
            },
        };
        self.client
            .send_notification(Notification::from_notification::<DidChangeWorkspaceFolders>(params));
        *folders = new_folders;
    }

    // RPC passthroughs, for the document- and feature-level code built on top of this session.

    /// See [`RpcClient::send_request`].
    pub fn send_request(
        &self,
        request: Request,
        on_result: ResponseHandler,
        on_error: Option<ErrorHandler>,
    ) {
        self.client.send_request(request, on_result, on_error);
    }

    /// See [`RpcClient::execute_request`].
    pub fn execute_request(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Option<jsonrpc::Result<Value>> {
        self.client.execute_request(request, timeout)
    }

    /// See [`RpcClient::send_notification`].
    pub fn send_notification(&self, notification: Notification) {
        self.client.send_notification(notification);
    }

    /// See [`RpcClient::send_response`].
    pub fn send_response(&self, response: Response) {
        self.client.send_response(response);
    }

    /// See [`RpcClient::send_error_response`].
    pub fn send_error_response(&self, request_id: Id, error: Error) {
        self.client.send_error_response(request_id, error);
    }

    // Internals.

    fn host(&self) -> Option<Arc<dyn LanguageHost>> {
        self.host.upgrade()
    }

    fn lock_folders(&self) -> MutexGuard<'_, Vec<WorkspaceFolder>> {
        self.folders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_capabilities(&self) -> std::sync::RwLockReadGuard<'_, Capabilities> {
        self.capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_capabilities_mut(&self) -> std::sync::RwLockWriteGuard<'_, Capabilities> {
        self.capabilities
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn handle_initialize_result(self: Arc<Self>, result: Value) {
        if !self.state.advance(SessionState::Ready) {
            debug!(
                "{} is no longer starting, ignoring initialize result",
                self.config.name
            );
            return;
        }

        self.lock_capabilities_mut()
            .replace(result.get("capabilities").unwrap_or(&Value::Null));

        {
            let mut folders = self.lock_folders();
            if folders.is_empty() {
                debug!("{} session with no workspace folders", self.config.name);
            } else if self.lock_capabilities().supports_workspace_folders() {
                debug!("{} multi folder session: {:?}", self.config.name, folders);
            } else {
                // Only keep the supported amount of folders.
                folders.truncate(1);
                debug!("{} single folder session: {:?}", self.config.name, folders[0]);
            }
        }

        if self.config.has_settings() {
            let params = DidChangeConfigurationParams {
                settings: self.config.settings.clone(),
            };
            self.client
                .send_notification(Notification::from_notification::<DidChangeConfiguration>(params));
        }

        if let Some(host) = self.host() {
            host.on_post_initialize(self.clone()).await;
        }
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> jsonrpc::Result<T> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| Error::invalid_params(e.to_string()))
}

#[async_trait]
impl ServerMessageHandler for Session {
    async fn handle_request(
        self: Arc<Self>,
        method: &str,
        params: Option<Value>,
        id: Id,
    ) -> Option<jsonrpc::Result<Value>> {
        match method {
            ShowMessageRequest::METHOD => {
                let params: ShowMessageRequestParams = match parse_params(params) {
                    Ok(params) => params,
                    Err(error) => return Some(Err(error)),
                };
                if let Some(host) = self.host() {
                    host.handle_message_request(self.clone(), params, id).await;
                }
                None
            }
            WorkspaceFoldersRequest::METHOD => {
                let folders: Vec<_> = self.lock_folders().iter().map(WorkspaceFolder::to_lsp).collect();
                Some(serde_json::to_value(folders).map_err(|e| Error::internal_error(e.to_string())))
            }
            WorkspaceConfiguration::METHOD => {
                let params: ConfigurationParams = match parse_params(params) {
                    Ok(params) => params,
                    Err(error) => return Some(Err(error)),
                };
                let settings = &self.config.settings;
                let items = params
                    .items
                    .iter()
                    .map(|item| match item.section.as_deref() {
                        Some(section) if !section.is_empty() => {
                            get_dotted_value(settings, section)
                                .cloned()
                                .unwrap_or(Value::Null)
                        }
                        _ => settings.clone(),
                    })
                    .collect();
                Some(Ok(Value::Array(items)))
            }
            ApplyWorkspaceEdit::METHOD => {
                let params: ApplyWorkspaceEditParams = match parse_params(params) {
                    Ok(params) => params,
                    Err(error) => return Some(Err(error)),
                };
                if let Some(host) = self.host() {
                    host.apply_workspace_edit(self.clone(), params, id).await;
                }
                None
            }
            _ => Some(Err(Error::method_not_found(method))),
        }
    }

    async fn handle_notification(self: Arc<Self>, method: &str, params: Option<Value>) -> bool {
        match method {
            ShowMessage::METHOD => match parse_params::<ShowMessageParams>(params) {
                Ok(params) => {
                    if let Some(host) = self.host() {
                        host.handle_show_message(self.clone(), params).await;
                    }
                    true
                }
                Err(error) => {
                    warn!("invalid {} params: {}", method, error);
                    false
                }
            },
            LogMessage::METHOD => match parse_params::<LogMessageParams>(params) {
                Ok(params) => {
                    if let Some(host) = self.host() {
                        host.handle_log_message(self.clone(), params).await;
                    }
                    true
                }
                Err(error) => {
                    warn!("invalid {} params: {}", method, error);
                    false
                }
            },
            PublishDiagnostics::METHOD => match parse_params::<PublishDiagnosticsParams>(params) {
                Ok(params) => {
                    if let Some(host) = self.host() {
                        host.publish_diagnostics(self.config.name.clone(), params).await;
                    }
                    true
                }
                Err(error) => {
                    warn!("invalid {} params: {}", method, error);
                    false
                }
            },
            _ => false,
        }
    }

    async fn handle_stderr(self: Arc<Self>, line: String) {
        if let Some(host) = self.host() {
            host.handle_stderr_log(self.clone(), line).await;
        }
    }

    async fn handle_close(self: Arc<Self>, exit_code: i32, error: Option<TransportError>) {
        self.state.advance(SessionState::Stopped);
        debug!("stopped {} with exit code {}", self.config.name, exit_code);
        if let Some(host) = self.host() {
            host.on_post_exit(self.clone(), exit_code, error).await;
        }
    }
}

fn initialize_params(folders: &[WorkspaceFolder], config: &ClientConfig) -> Value {
    let first_folder = folders.first();
    let workspace_folders = if folders.is_empty() {
        Value::Null
    } else {
        serde_json::to_value(folders.iter().map(WorkspaceFolder::to_lsp).collect::<Vec<_>>())
            .unwrap_or(Value::Null)
    };

    let mut params = json!({
        "processId": std::process::id(),
        "clientInfo": {
            "name": "lsp-session",
        },
        "rootUri": first_folder.map(|folder| folder.uri.as_str()),
        "rootPath": first_folder.map(|folder| folder.path.to_string_lossy()),
        "workspaceFolders": workspace_folders,
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "didSave": true,
                    "willSave": true,
                    "willSaveWaitUntil": true,
                },
                "hover": {
                    "contentFormat": ["markdown", "plaintext"],
                },
                "completion": {
                    "completionItem": {
                        "snippetSupport": true,
                        "deprecatedSupport": true,
                    },
                    "completionItemKind": {
                        "valueSet": (1..=25).collect::<Vec<i64>>(),
                    },
                },
                "signatureHelp": {
                    "signatureInformation": {
                        "documentationFormat": ["markdown", "plaintext"],
                        "parameterInformation": {
                            "labelOffsetSupport": true,
                        },
                    },
                },
                "references": {},
                "documentHighlight": {},
                "documentSymbol": {
                    "symbolKind": {
                        "valueSet": (1..=26).collect::<Vec<i64>>(),
                    },
                },
                "formatting": {},
                "rangeFormatting": {},
                "declaration": {"linkSupport": true},
                "definition": {"linkSupport": true},
                "typeDefinition": {"linkSupport": true},
                "implementation": {"linkSupport": true},
                "codeAction": {
                    "codeActionLiteralSupport": {
                        "codeActionKind": {
                            "valueSet": [],
                        },
                    },
                },
                "rename": {},
                "colorProvider": {},
                "publishDiagnostics": {
                    "relatedInformation": true,
                },
            },
            "workspace": {
                "applyEdit": true,
                "didChangeConfiguration": {},
                "executeCommand": {},
                "workspaceFolders": true,
                "symbol": {
                    "symbolKind": {
                        "valueSet": (1..=26).collect::<Vec<i64>>(),
                    },
                },
                "configuration": true,
            },
        },
    });

    if let Some(init_options) = &config.init_options {
        params["initializationOptions"] = init_options.clone();
    }

    params
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;
    use tokio::time::timeout as tokio_timeout;
    use tokio_util::codec::Framed;

    use crate::codec::LanguageServerCodec;
    use crate::jsonrpc::ErrorCode;
    use crate::transport::{Transport, TransportCallbacks};

    use super::*;

    type FakeServer = Framed<DuplexStream, LanguageServerCodec<Value>>;

    #[derive(Debug, PartialEq)]
    enum HostEvent {
        PostInitialize,
        PostExit(i32),
        MessageRequest(Id),
        ShowMessage(String),
        LogMessage(String),
        ApplyEdit(Id),
        Diagnostics(String, String),
        Stderr(String),
    }

    struct RecordingHost {
        events: mpsc::UnboundedSender<HostEvent>,
    }

    #[async_trait]
    impl LanguageHost for RecordingHost {
        async fn handle_stderr_log(&self, _session: Arc<Session>, line: String) {
            let _ = self.events.send(HostEvent::Stderr(line));
        }

        async fn on_post_initialize(&self, _session: Arc<Session>) {
            let _ = self.events.send(HostEvent::PostInitialize);
        }

        async fn on_post_exit(
            &self,
            _session: Arc<Session>,
            exit_code: i32,
            _error: Option<TransportError>,
        ) {
            let _ = self.events.send(HostEvent::PostExit(exit_code));
        }

        async fn handle_message_request(
            &self,
            _session: Arc<Session>,
            _params: ShowMessageRequestParams,
            request_id: Id,
        ) {
            let _ = self.events.send(HostEvent::MessageRequest(request_id));
        }

        async fn handle_show_message(&self, _session: Arc<Session>, params: ShowMessageParams) {
            let _ = self.events.send(HostEvent::ShowMessage(params.message));
        }

        async fn handle_log_message(&self, _session: Arc<Session>, params: LogMessageParams) {
            let _ = self.events.send(HostEvent::LogMessage(params.message));
        }

        async fn apply_workspace_edit(
            &self,
            _session: Arc<Session>,
            _params: ApplyWorkspaceEditParams,
            request_id: Id,
        ) {
            let _ = self.events.send(HostEvent::ApplyEdit(request_id));
        }

        async fn publish_diagnostics(&self, server_name: String, params: PublishDiagnosticsParams) {
            let _ = self
                .events
                .send(HostEvent::Diagnostics(server_name, params.uri.to_string()));
        }
    }

    struct Fixture {
        session: Arc<Session>,
        server: FakeServer,
        events: mpsc::UnboundedReceiver<HostEvent>,
        // Keeps the weakly-held host alive for the duration of the test.
        _host: Arc<RecordingHost>,
    }

    fn fixture(config: ClientConfig, folders: Vec<WorkspaceFolder>) -> Fixture {
        let (events_tx, events) = mpsc::unbounded_channel();
        let host = Arc::new(RecordingHost { events: events_tx });

        let client = Arc::new(RpcClient::new(config.name.clone(), Settings::default()));
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(client_io);
        let callbacks = Arc::downgrade(&client) as Weak<dyn TransportCallbacks>;
        client.attach_transport(Transport::from_io(read, write, callbacks));

        let session = Session::assemble(
            Arc::downgrade(&host) as Weak<dyn LanguageHost>,
            config,
            folders,
            client,
        );

        Fixture {
            session,
            server: Framed::new(server_io, LanguageServerCodec::default()),
            events,
            _host: host,
        }
    }

    fn folder(path: &str) -> WorkspaceFolder {
        WorkspaceFolder::from_path(PathBuf::from(path)).unwrap()
    }

    async fn next_frame(server: &mut FakeServer) -> Value {
        tokio_timeout(Duration::from_secs(5), server.next())
            .await
            .expect("timed out")
            .expect("stream ended")
            .expect("bad frame")
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<HostEvent>) -> HostEvent {
        tokio_timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out")
            .expect("host gone")
    }

    /// Drives the fixture through a successful `initialize` exchange.
    async fn go_ready(fixture: &mut Fixture, capabilities: Value) -> Value {
        fixture.session.initialize();
        let request = next_frame(&mut fixture.server).await;
        assert_eq!(request["method"], json!("initialize"));

        fixture
            .server
            .send(json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": {"capabilities": capabilities},
            }))
            .await
            .unwrap();

        assert_eq!(next_event(&mut fixture.events).await, HostEvent::PostInitialize);
        assert_eq!(fixture.session.state(), SessionState::Ready);
        request
    }

    #[tokio::test]
    async fn initialize_params_carry_workspace_and_options() {
        let mut config = ClientConfig::stdio("pyls", "pyls", vec![]);
        config.init_options = Some(json!({"plugins": false}));
        let folders = vec![folder("/ws/one"), folder("/ws/two")];
        let mut fixture = fixture(config, folders);

        fixture.session.initialize();
        let request = next_frame(&mut fixture.server).await;
        let params = &request["params"];

        assert_eq!(params["rootUri"], json!("file:///ws/one"));
        assert_eq!(params["rootPath"], json!("/ws/one"));
        assert_eq!(params["clientInfo"]["name"], json!("lsp-session"));
        assert_eq!(params["initializationOptions"], json!({"plugins": false}));
        assert_eq!(params["workspaceFolders"].as_array().unwrap().len(), 2);
        assert_eq!(params["capabilities"]["workspace"]["workspaceFolders"], json!(true));
        assert_eq!(
            params["capabilities"]["textDocument"]["hover"]["contentFormat"],
            json!(["markdown", "plaintext"])
        );
    }

    #[tokio::test]
    async fn initialize_without_folders_sends_nulls() {
        let mut fixture = fixture(ClientConfig::stdio("srv", "srv", vec![]), vec![]);

        fixture.session.initialize();
        let request = next_frame(&mut fixture.server).await;
        let params = &request["params"];

        assert_eq!(params["rootUri"], json!(null));
        assert_eq!(params["rootPath"], json!(null));
        assert_eq!(params["workspaceFolders"], json!(null));
        assert!(params.get("initializationOptions").is_none());
    }

    #[tokio::test]
    async fn unsupported_folders_are_truncated_and_settings_pushed() {
        let mut config = ClientConfig::stdio("srv", "srv", vec![]);
        config.settings = json!({"python": {"pythonPath": "/usr/bin/py"}});
        let folders = vec![folder("/ws/a"), folder("/ws/b"), folder("/ws/c")];
        let mut fixture = fixture(config, folders);

        // No workspace.workspaceFolders.supported in the reply.
        go_ready(&mut fixture, json!({"textDocumentSync": 1})).await;

        assert_eq!(fixture.session.workspace_folders(), vec![folder("/ws/a")]);

        let notification = next_frame(&mut fixture.server).await;
        assert_eq!(notification["method"], json!("workspace/didChangeConfiguration"));
        assert_eq!(
            notification["params"]["settings"],
            json!({"python": {"pythonPath": "/usr/bin/py"}})
        );
    }

    #[tokio::test]
    async fn supported_folders_are_kept() {
        let folders = vec![folder("/ws/a"), folder("/ws/b")];
        let mut fixture = fixture(ClientConfig::stdio("srv", "srv", vec![]), folders.clone());

        go_ready(
            &mut fixture,
            json!({"workspace": {"workspaceFolders": {"supported": true}}}),
        )
        .await;

        assert_eq!(fixture.session.workspace_folders(), folders);
    }

    #[tokio::test]
    async fn initialize_error_ends_the_session() {
        let mut fixture = fixture(ClientConfig::stdio("srv", "srv", vec![]), vec![]);

        fixture.session.initialize();
        let request = next_frame(&mut fixture.server).await;
        fixture
            .server
            .send(json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "error": {"code": -32603, "message": "no can do"},
            }))
            .await
            .unwrap();

        let shutdown = next_frame(&mut fixture.server).await;
        assert_eq!(shutdown["method"], json!("shutdown"));
        assert_eq!(fixture.session.state(), SessionState::Stopping);
    }

    #[tokio::test]
    async fn capability_queries_follow_the_cache() {
        let mut fixture = fixture(ClientConfig::stdio("srv", "srv", vec![]), vec![]);

        assert!(!fixture.session.should_notify_did_open());
        go_ready(
            &mut fixture,
            json!({"textDocumentSync": {"openClose": true, "change": 2}, "hoverProvider": true}),
        )
        .await;

        assert!(fixture.session.has_capability("hoverProvider"));
        assert!(!fixture.session.has_capability("renameProvider"));
        assert!(fixture.session.should_notify_did_open());
        assert!(fixture.session.should_notify_did_change());
        assert_eq!(fixture.session.text_sync_kind(), 2);
        assert_eq!(fixture.session.get_capability("textDocumentSync.change"), Some(json!(2)));
    }

    #[tokio::test]
    async fn workspace_configuration_resolves_dotted_sections() {
        let mut config = ClientConfig::stdio("srv", "srv", vec![]);
        config.settings = json!({"python": {"pythonPath": "/usr/bin/py"}});
        let mut fixture = fixture(config, vec![]);

        fixture
            .server
            .send(json!({
                "jsonrpc": "2.0",
                "id": 31,
                "method": "workspace/configuration",
                "params": {"items": [
                    {"section": "python.pythonPath"},
                    {"section": ""},
                    {},
                ]},
            }))
            .await
            .unwrap();

        let reply = next_frame(&mut fixture.server).await;
        assert_eq!(reply["id"], json!(31));
        assert_eq!(
            reply["result"],
            json!([
                "/usr/bin/py",
                {"python": {"pythonPath": "/usr/bin/py"}},
                {"python": {"pythonPath": "/usr/bin/py"}},
            ])
        );
    }

    #[tokio::test]
    async fn workspace_configuration_misses_resolve_to_null() {
        let mut config = ClientConfig::stdio("srv", "srv", vec![]);
        config.settings = json!({"a": 1});
        let mut fixture = fixture(config, vec![]);

        fixture
            .server
            .send(json!({
                "jsonrpc": "2.0",
                "id": 32,
                "method": "workspace/configuration",
                "params": {"items": [{"section": "a.b"}]},
            }))
            .await
            .unwrap();

        let reply = next_frame(&mut fixture.server).await;
        assert_eq!(reply["result"], json!([null]));
    }

    #[tokio::test]
    async fn workspace_folders_request_is_answered_directly() {
        let folders = vec![folder("/ws/a"), folder("/ws/b")];
        let mut fixture = fixture(ClientConfig::stdio("srv", "srv", vec![]), folders);

        fixture
            .server
            .send(json!({"jsonrpc": "2.0", "id": 7, "method": "workspace/workspaceFolders"}))
            .await
            .unwrap();

        let reply = next_frame(&mut fixture.server).await;
        assert_eq!(reply["id"], json!(7));
        assert_eq!(
            reply["result"],
            json!([
                {"uri": "file:///ws/a", "name": "a"},
                {"uri": "file:///ws/b", "name": "b"},
            ])
        );
    }

    #[tokio::test]
    async fn unknown_request_is_answered_with_method_not_found() {
        let mut fixture = fixture(ClientConfig::stdio("srv", "srv", vec![]), vec![]);

        fixture
            .server
            .send(json!({"jsonrpc": "2.0", "id": "a", "method": "server/unknown"}))
            .await
            .unwrap();

        let reply = next_frame(&mut fixture.server).await;
        assert_eq!(
            reply,
            json!({
                "jsonrpc": "2.0",
                "id": "a",
                "error": {"code": -32601, "message": "server/unknown"},
            })
        );
    }

    #[tokio::test]
    async fn window_notifications_reach_the_host() {
        let mut fixture = fixture(ClientConfig::stdio("srv", "srv", vec![]), vec![]);

        fixture
            .server
            .send(json!({
                "jsonrpc": "2.0",
                "method": "window/showMessage",
                "params": {"type": 3, "message": "hello"},
            }))
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut fixture.events).await,
            HostEvent::ShowMessage("hello".to_string())
        );

        fixture
            .server
            .send(json!({
                "jsonrpc": "2.0",
                "method": "window/logMessage",
                "params": {"type": 4, "message": "noise"},
            }))
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut fixture.events).await,
            HostEvent::LogMessage("noise".to_string())
        );
    }

    #[tokio::test]
    async fn message_requests_are_deferred_to_the_host() {
        let mut fixture = fixture(ClientConfig::stdio("srv", "srv", vec![]), vec![]);

        fixture
            .server
            .send(json!({
                "jsonrpc": "2.0",
                "id": 5,
                "method": "window/showMessageRequest",
                "params": {"type": 1, "message": "pick one", "actions": [{"title": "ok"}]},
            }))
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut fixture.events).await,
            HostEvent::MessageRequest(Id::Number(5))
        );

        // The host answers whenever it is ready; only then does a response hit the wire.
        fixture
            .session
            .send_response(Response::from_ok(Id::Number(5), json!({"title": "ok"})));
        let reply = next_frame(&mut fixture.server).await;
        assert_eq!(reply["id"], json!(5));
        assert_eq!(reply["result"], json!({"title": "ok"}));
    }

    #[tokio::test]
    async fn apply_edit_is_forwarded_and_answered_by_the_host() {
        let mut fixture = fixture(ClientConfig::stdio("srv", "srv", vec![]), vec![]);

        fixture
            .server
            .send(json!({
                "jsonrpc": "2.0",
                "id": 9,
                "method": "workspace/applyEdit",
                "params": {"edit": {"changes": {}}},
            }))
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut fixture.events).await,
            HostEvent::ApplyEdit(Id::Number(9))
        );

        fixture
            .session
            .send_response(Response::from_ok(Id::Number(9), json!({"applied": true})));
        let reply = next_frame(&mut fixture.server).await;
        assert_eq!(reply["id"], json!(9));
        assert_eq!(reply["result"], json!({"applied": true}));
    }

    #[tokio::test]
    async fn diagnostics_are_keyed_by_server_name() {
        let mut fixture = fixture(ClientConfig::stdio("rust-analyzer", "ra", vec![]), vec![]);

        fixture
            .server
            .send(json!({
                "jsonrpc": "2.0",
                "method": "textDocument/publishDiagnostics",
                "params": {"uri": "file:///ws/a/main.rs", "diagnostics": []},
            }))
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut fixture.events).await,
            HostEvent::Diagnostics("rust-analyzer".to_string(), "file:///ws/a/main.rs".to_string())
        );
    }

    #[tokio::test]
    async fn handles_path_queries() {
        let scoped = fixture(
            ClientConfig::stdio("srv", "srv", vec![]),
            vec![folder("/ws/a")],
        );
        assert!(scoped.session.handles_path(Path::new("/ws/a/src/main.rs")));
        assert!(!scoped.session.handles_path(Path::new("/elsewhere/main.rs")));
        assert!(!scoped.session.handles_path(Path::new("")));

        let unscoped = fixture(ClientConfig::stdio("srv", "srv", vec![]), vec![]);
        assert!(unscoped.session.handles_path(Path::new("/anything/at/all.rs")));
        assert!(!unscoped.session.handles_path(Path::new("")));
    }

    #[tokio::test]
    async fn update_folders_diffs_against_the_server() {
        let mut fixture = fixture(
            ClientConfig::stdio("srv", "srv", vec![]),
            vec![folder("/ws/a")],
        );
        go_ready(
            &mut fixture,
            json!({"workspace": {"workspaceFolders": {"supported": true}}}),
        )
        .await;

        fixture.session.update_folders(vec![folder("/ws/a"), folder("/ws/b")]);
        let notification = next_frame(&mut fixture.server).await;
        assert_eq!(notification["method"], json!("workspace/didChangeWorkspaceFolders"));
        assert_eq!(
            notification["params"]["event"]["added"],
            json!([{"uri": "file:///ws/b", "name": "b"}])
        );
        assert_eq!(notification["params"]["event"]["removed"], json!([]));

        // An unchanged list still produces one (empty) notification, deterministically.
        fixture.session.update_folders(vec![folder("/ws/a"), folder("/ws/b")]);
        let notification = next_frame(&mut fixture.server).await;
        assert_eq!(notification["params"]["event"]["added"], json!([]));
        assert_eq!(notification["params"]["event"]["removed"], json!([]));
    }

    #[tokio::test]
    async fn update_folders_is_inert_without_server_support() {
        let mut fixture = fixture(
            ClientConfig::stdio("srv", "srv", vec![]),
            vec![folder("/ws/a")],
        );
        go_ready(&mut fixture, json!({})).await;

        fixture.session.update_folders(vec![folder("/ws/b")]);
        assert_eq!(fixture.session.workspace_folders(), vec![folder("/ws/a")]);

        // The next frame on the wire is the probe, not a folder notification.
        fixture.session.send_notification(Notification::exit());
        let frame = next_frame(&mut fixture.server).await;
        assert_eq!(frame["method"], json!("exit"));
    }

    #[tokio::test]
    async fn graceful_shutdown() {
        let mut fixture = fixture(ClientConfig::stdio("srv", "srv", vec![]), vec![]);
        go_ready(&mut fixture, json!({"hoverProvider": true})).await;

        fixture.session.end();
        assert_eq!(fixture.session.state(), SessionState::Stopping);
        assert!(!fixture.session.has_capability("hoverProvider"));

        let shutdown = next_frame(&mut fixture.server).await;
        assert_eq!(shutdown["method"], json!("shutdown"));

        fixture
            .server
            .send(json!({"jsonrpc": "2.0", "id": shutdown["id"], "result": null}))
            .await
            .unwrap();

        let exit = next_frame(&mut fixture.server).await;
        assert_eq!(exit["method"], json!("exit"));

        // The client closed its write side after `exit`.
        assert!(fixture.server.next().await.is_none());

        assert_eq!(next_event(&mut fixture.events).await, HostEvent::PostExit(0));
        assert_eq!(fixture.session.state(), SessionState::Stopped);

        // Calling end twice does not send another shutdown.
        fixture.session.end();
    }

    #[tokio::test]
    async fn stderr_lines_are_forwarded() {
        let fixture = fixture(ClientConfig::stdio("srv", "srv", vec![]), vec![]);
        let mut events = fixture.events;

        // Feed the line through the transport callback path.
        let session = fixture.session.clone();
        let handler: Arc<dyn ServerMessageHandler> = session;
        handler.handle_stderr("warning: something".to_string()).await;

        assert_eq!(
            next_event(&mut events).await,
            HostEvent::Stderr("warning: something".to_string())
        );
    }

    #[test]
    fn state_transitions_are_monotonic() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), SessionState::Starting);

        assert!(cell.advance(SessionState::Ready));
        assert_eq!(cell.get(), SessionState::Ready);

        // No way back.
        assert!(!cell.advance(SessionState::Ready));
        assert!(cell.advance(SessionState::Stopping));
        assert!(!cell.advance(SessionState::Ready));
        assert!(cell.advance(SessionState::Stopped));
        assert!(!cell.advance(SessionState::Stopping));
        assert_eq!(cell.get(), SessionState::Stopped);
    }

    #[test]
    fn stopping_wins_over_a_late_initialize() {
        let cell = StateCell::new();
        assert!(cell.advance(SessionState::Stopping));
        // The initialize result arriving now must not resurrect the session.
        assert!(!cell.advance(SessionState::Ready));
        assert_eq!(cell.get(), SessionState::Stopping);
    }

    #[tokio::test]
    async fn invalid_request_params_produce_invalid_params_error() {
        let mut fixture = fixture(ClientConfig::stdio("srv", "srv", vec![]), vec![]);

        fixture
            .server
            .send(json!({
                "jsonrpc": "2.0",
                "id": 12,
                "method": "window/showMessageRequest",
                "params": {"type": "not-a-number"},
            }))
            .await
            .unwrap();

        let reply = next_frame(&mut fixture.server).await;
        assert_eq!(reply["id"], json!(12));
        assert_eq!(reply["error"]["code"], json!(ErrorCode::InvalidParams.code()));
    }
}
