//! JSON-RPC client: request/response correlation and inbound dispatch.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, error};

use crate::config::{ClientConfig, Settings};
use crate::jsonrpc::{self, Error, Id, Message, Notification, Request, Response};
use crate::logger::PayloadLogger;
use crate::transport::{Transport, TransportCallbacks, TransportError};

/// How long a synchronous request waits for its response by default.
pub const DEFAULT_SYNC_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Callback invoked on the reader task with the `result` of a successful response.
pub type ResponseHandler = Box<dyn FnOnce(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Callback invoked on the reader task with the `error` of a failed response.
pub type ErrorHandler = Box<dyn FnOnce(Error) -> BoxFuture<'static, ()> + Send + Sync>;

struct PendingRequest {
    on_result: ResponseHandler,
    on_error: Option<ErrorHandler>,
}

tokio::task_local! {
    static DISPATCHING: ();
}

/// Dispatch hook for server-originated traffic and transport lifecycle events.
///
/// Bound to the client as a [`Weak`] reference; when the owner is gone, incoming requests are
/// answered with "method not found" and everything else is dropped.
#[async_trait]
pub trait ServerMessageHandler: Send + Sync + 'static {
    /// Handles a server-to-client request.
    ///
    /// Returning `Some` makes the client reply immediately with the given body. Returning `None`
    /// means the handler has taken responsibility for answering later through
    /// [`RpcClient::send_response`].
    async fn handle_request(
        self: Arc<Self>,
        method: &str,
        params: Option<Value>,
        id: Id,
    ) -> Option<jsonrpc::Result<Value>>;

    /// Handles a server-to-client notification. Returns `false` when the method is unhandled.
    async fn handle_notification(self: Arc<Self>, method: &str, params: Option<Value>) -> bool;

    /// Called for every stderr line the server produces.
    async fn handle_stderr(self: Arc<Self>, line: String) {
        let _ = line;
    }

    /// Called once the transport has shut down.
    async fn handle_close(self: Arc<Self>, exit_code: i32, error: Option<TransportError>) {
        let _ = (exit_code, error);
    }
}

struct SyncRendezvous {
    slots: Mutex<HashMap<i64, Option<jsonrpc::Result<Value>>>>,
    cvar: Condvar,
}

/// The JSON-RPC half of a language server session.
///
/// Owns the transport, allocates request IDs, and routes every inbound payload either to a
/// registered response handler, to a synchronous caller parked in
/// [`execute_request`](RpcClient::execute_request), or to the bound [`ServerMessageHandler`].
pub struct RpcClient {
    transport: OnceLock<Transport>,
    handler: OnceLock<Weak<dyn ServerMessageHandler>>,
    request_id: AtomicI64,
    pending: DashMap<i64, PendingRequest>,
    sync: SyncRendezvous,
    exiting: AtomicBool,
    logger: PayloadLogger,
}

impl RpcClient {
    /// Spawns the transport described by `config` and returns a connected client.
    pub async fn connect(
        config: &ClientConfig,
        cwd: &Path,
        settings: Settings,
    ) -> Result<Arc<RpcClient>, TransportError> {
        let client = Arc::new(RpcClient::new(config.name.clone(), settings));
        let callbacks = Arc::downgrade(&client) as Weak<dyn TransportCallbacks>;
        let transport = Transport::start(&config.transport, cwd, callbacks).await?;
        client.attach_transport(transport);
        Ok(client)
    }

    pub(crate) fn new(server_name: String, settings: Settings) -> RpcClient {
        RpcClient {
            transport: OnceLock::new(),
            handler: OnceLock::new(),
            request_id: AtomicI64::new(0),
            pending: DashMap::new(),
            sync: SyncRendezvous {
                slots: Mutex::new(HashMap::new()),
                cvar: Condvar::new(),
            },
            exiting: AtomicBool::new(false),
            logger: PayloadLogger::new(settings, server_name),
        }
    }

    pub(crate) fn attach_transport(&self, transport: Transport) {
        if self.transport.set(transport).is_err() {
            debug!("transport already attached, ignoring");
        }
    }

    /// Binds the dispatch hook for server-originated messages. Effective once.
    pub fn bind_handler(&self, handler: Weak<dyn ServerMessageHandler>) {
        if self.handler.set(handler).is_err() {
            debug!("message handler already bound, ignoring");
        }
    }

    /// Sends a request and registers its response handlers. Non-blocking.
    ///
    /// The handler pair is registered before any bytes reach the wire, so the response can never
    /// race the registration. Exactly one of the two handlers is invoked, at most once, on the
    /// reader task.
    pub fn send_request(
        &self,
        request: Request,
        on_result: ResponseHandler,
        on_error: Option<ErrorHandler>,
    ) {
        let request_id = self.next_request_id();
        self.logger
            .outgoing_request(request_id, request.method(), request.params(), false);
        self.pending
            .insert(request_id, PendingRequest { on_result, on_error });
        self.send_payload(request.into_payload(request_id));
    }

    /// Sends a request and blocks the calling thread until its response arrives or `timeout`
    /// elapses.
    ///
    /// Returns `None` on timeout; a response arriving after that is dropped. A server error
    /// response is delivered as `Some(Err(_))`, distinguishable from a timeout.
    ///
    /// Must not be called from the reader task: the response could never be processed while the
    /// caller blocks it, so the call is refused and `None` returned immediately.
    pub fn execute_request(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Option<jsonrpc::Result<Value>> {
        if DISPATCHING.try_with(|_| ()).is_ok() {
            error!("execute_request called from the reader task, refusing");
            return None;
        }

        let request_id = self.next_request_id();
        self.logger
            .outgoing_request(request_id, request.method(), request.params(), true);
        let method = request.method().to_owned();

        {
            let mut slots = self.lock_slots();
            slots.insert(request_id, None);
        }
        self.send_payload(request.into_payload(request_id));

        let slots = self.lock_slots();
        let (mut slots, _) = self
            .sync
            .cvar
            .wait_timeout_while(slots, timeout, |slots| {
                slots.get(&request_id).map_or(false, Option::is_none)
            })
            .unwrap_or_else(PoisonError::into_inner);

        match slots.remove(&request_id).flatten() {
            Some(outcome) => Some(outcome),
            None => {
                debug!("timed out waiting for response to {}", method);
                None
            }
        }
    }

    /// Sends a notification. Non-blocking; no ID is allocated.
    pub fn send_notification(&self, notification: Notification) {
        self.logger
            .outgoing_notification(notification.method(), notification.params());
        self.send_payload(notification.into_payload());
    }

    /// Sends an answer to a server-originated request.
    pub fn send_response(&self, response: Response) {
        match response.error() {
            Some(error) => self.logger.outgoing_error_response(response.id(), error),
            None => {
                let result = response.result().unwrap_or(&Value::Null);
                self.logger.outgoing_response(response.id(), result);
            }
        }
        match serde_json::to_value(&response) {
            Ok(payload) => self.send_payload(payload),
            Err(err) => error!("failed to serialize response: {}", err),
        }
    }

    /// Sends an error answer to a server-originated request.
    pub fn send_error_response(&self, request_id: Id, error: Error) {
        self.send_response(Response::from_error(request_id, error));
    }

    /// Announces the exit to the server and closes the transport. Idempotent.
    pub fn exit(&self) {
        if self.exiting.swap(true, Ordering::SeqCst) {
            return;
        }
        self.send_notification(Notification::exit());
        if let Some(transport) = self.transport.get() {
            transport.close();
        }
    }

    /// Returns `true` once [`exit`](RpcClient::exit) has been called.
    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    fn next_request_id(&self) -> i64 {
        self.request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn send_payload(&self, payload: Value) {
        if let Some(transport) = self.transport.get() {
            transport.send(payload);
        }
    }

    fn handler(&self) -> Option<Arc<dyn ServerMessageHandler>> {
        self.handler.get().and_then(Weak::upgrade)
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Option<jsonrpc::Result<Value>>>> {
        self.sync.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_deposit(&self, request_id: i64, outcome: jsonrpc::Result<Value>) -> bool {
        let mut slots = self.lock_slots();
        match slots.get_mut(&request_id) {
            Some(slot) => {
                // At most one thread is waiting on this slot.
                *slot = Some(outcome);
                self.sync.cvar.notify_all();
                true
            }
            None => false,
        }
    }

    async fn dispatch(&self, payload: Value) {
        match Message::classify(payload) {
            Message::Request {
                method,
                params,
                id: Some(id),
            } => self.dispatch_request(method, params, id).await,
            Message::Request {
                method,
                params,
                id: None,
            } => self.dispatch_notification(method, params).await,
            Message::Response { id, result, error } => {
                self.dispatch_response(id, result, error).await
            }
            Message::Unknown(payload) => debug!("unknown payload type: {}", payload),
        }
    }

    async fn dispatch_request(&self, method: String, params: Option<Value>, id: Id) {
        self.logger.incoming_request(&id, &method, params.as_ref());

        let outcome = match self.handler() {
            Some(handler) => handler.handle_request(&method, params, id.clone()).await,
            None => Some(Err(Error::method_not_found(method))),
        };

        match outcome {
            Some(Ok(result)) => self.send_response(Response::from_ok(id, result)),
            Some(Err(error)) => self.send_error_response(id, error),
            // The handler answers later through `send_response`.
            None => {}
        }
    }

    async fn dispatch_notification(&self, method: String, params: Option<Value>) {
        let log_params = if self.logger.debug_enabled() {
            params.clone()
        } else {
            None
        };

        let handled = match self.handler() {
            Some(handler) => handler.handle_notification(&method, params).await,
            None => false,
        };

        self.logger
            .incoming_notification(&method, log_params.as_ref(), !handled);
    }

    async fn dispatch_response(&self, id: Id, result: Option<Value>, error: Option<Value>) {
        let request_id = match id.as_number() {
            Some(request_id) => request_id,
            None => {
                debug!("response with unparsable request ID {}, dropping", id);
                return;
            }
        };

        let pending = self.pending.remove(&request_id).map(|(_, pending)| pending);

        match (result, error) {
            (Some(result), None) => {
                self.logger.incoming_response(request_id, &result);
                match pending {
                    Some(pending) => (pending.on_result)(result).await,
                    None => {
                        if !self.try_deposit(request_id, Ok(result)) {
                            debug!("response for unknown request ID {}, dropping", request_id);
                        }
                    }
                }
            }
            (None, Some(error)) => {
                self.logger.incoming_error_response(request_id, &error);
                let error = match serde_json::from_value::<Error>(error) {
                    Ok(error) => error,
                    Err(err) => {
                        debug!("invalid error object for request {}: {}", request_id, err);
                        return;
                    }
                };
                match pending {
                    Some(PendingRequest {
                        on_error: Some(on_error),
                        ..
                    }) => on_error(error).await,
                    Some(_) => debug!(
                        "error response for request {} with no error handler: {}",
                        request_id, error
                    ),
                    None => {
                        if !self.try_deposit(request_id, Err(error)) {
                            debug!(
                                "error response for unknown request ID {}, dropping",
                                request_id
                            );
                        }
                    }
                }
            }
            _ => debug!("invalid response payload for request {}, dropping", request_id),
        }
    }

    /// Fails every still-registered error handler with a synthesized "transport closed" error.
    ///
    /// Synchronous callers are left to run into their own timeout.
    async fn drain_pending_requests(&self) {
        let mut request_ids: Vec<i64> = self.pending.iter().map(|entry| *entry.key()).collect();
        request_ids.sort_unstable();

        for request_id in request_ids {
            if let Some((_, pending)) = self.pending.remove(&request_id) {
                if let Some(on_error) = pending.on_error {
                    on_error(Error::transport_closed()).await;
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub(crate) fn sync_slots_len(&self) -> usize {
        self.lock_slots().len()
    }
}

#[async_trait]
impl TransportCallbacks for RpcClient {
    async fn on_payload(&self, payload: Value) {
        // The task-local marker lets `execute_request` detect (and refuse) re-entrant calls that
        // would deadlock the reader.
        DISPATCHING.scope((), self.dispatch(payload)).await;
    }

    async fn on_stderr_message(&self, line: String) {
        if let Some(handler) = self.handler() {
            handler.handle_stderr(line).await;
        }
    }

    async fn on_transport_close(&self, exit_code: i32, error: Option<TransportError>) {
        self.drain_pending_requests().await;
        if let Some(handler) = self.handler() {
            handler.handle_close(exit_code, error).await;
        }
    }
}
