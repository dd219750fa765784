//! Duplex transport to a language server over child-process stdio or TCP.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::io::{Error as IoError, ErrorKind};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{AbortHandle, Abortable};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, warn};

use crate::codec::{LanguageServerCodec, ParseError};
use crate::config::TransportParams;

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const PROCESS_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors raised while establishing or running a transport.
#[derive(Debug)]
pub enum TransportError {
    /// The server process could not be spawned.
    Spawn(IoError),
    /// The TCP connection could not be established.
    Connect(IoError),
    /// The inbound byte stream stopped being decodable as LSP frames.
    MalformedFrame(ParseError),
}

impl Display for TransportError {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match self {
            TransportError::Spawn(e) => write!(f, "failed to start language server: {e}"),
            TransportError::Connect(e) => write!(f, "failed to connect to language server: {e}"),
            TransportError::MalformedFrame(e) => write!(f, "malformed frame: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Spawn(e) | TransportError::Connect(e) => Some(e),
            TransportError::MalformedFrame(e) => Some(e),
        }
    }
}

/// Sink for everything a transport produces.
///
/// The transport only holds a [`Weak`] reference to its callbacks, so it never extends the life
/// of its owner; once the owner is gone the reader stops on its own.
#[async_trait]
pub trait TransportCallbacks: Send + Sync + 'static {
    /// Called on the reader task for every decoded inbound payload, in receive order.
    async fn on_payload(&self, payload: Value);

    /// Called for every line the server writes to stderr.
    async fn on_stderr_message(&self, line: String);

    /// Called exactly once when the transport shuts down, orderly or not.
    async fn on_transport_close(&self, exit_code: i32, error: Option<TransportError>);
}

struct TransportInner {
    tx: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    abort_read: AbortHandle,
    closed: AtomicBool,
}

/// A running connection to a language server.
///
/// Owns the reader, stderr, and writer tasks. All outbound traffic funnels through a single
/// writer task, so concurrent [`send`](Transport::send) calls never interleave frames.
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    /// Spawns or connects to the server described by `params` and starts the I/O tasks.
    ///
    /// Must be called within a Tokio runtime.
    pub async fn start(
        params: &TransportParams,
        cwd: &Path,
        callbacks: Weak<dyn TransportCallbacks>,
    ) -> Result<Transport, TransportError> {
        match params {
            TransportParams::Stdio { command, args } => {
                let mut child = Command::new(command)
                    .args(args)
                    .current_dir(cwd)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(TransportError::Spawn)?;

                let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
                let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
                let stderr = child.stderr.take();

                Ok(Self::spawn_tasks(stdout, stdin, stderr, Some(child), callbacks))
            }
            TransportParams::Tcp { host, port } => {
                let connect = TcpStream::connect((host.as_str(), *port));
                let stream = timeout(TCP_CONNECT_TIMEOUT, connect)
                    .await
                    .map_err(|_| {
                        TransportError::Connect(IoError::new(
                            ErrorKind::TimedOut,
                            "connection timed out",
                        ))
                    })?
                    .map_err(TransportError::Connect)?;

                let (read, write) = stream.into_split();
                Ok(Self::spawn_tasks(read, write, None, None, callbacks))
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn from_io<R, W>(
        reader: R,
        writer: W,
        callbacks: Weak<dyn TransportCallbacks>,
    ) -> Transport
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn_tasks(reader, writer, None, None, callbacks)
    }

    fn spawn_tasks<R, W>(
        reader: R,
        writer: W,
        stderr: Option<ChildStderr>,
        child: Option<Child>,
        callbacks: Weak<dyn TransportCallbacks>,
    ) -> Transport
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

        let writer_task = tokio::spawn(async move {
            let mut framed = FramedWrite::new(writer, LanguageServerCodec::<Value>::default());
            while let Some(payload) = rx.recv().await {
                if let Err(err) = framed.send(payload).await {
                    error!("failed to write outgoing frame: {}", err);
                    break;
                }
            }
        });

        let read_callbacks = callbacks.clone();
        let read_loop = async move {
            let mut framed = FramedRead::new(reader, LanguageServerCodec::<Value>::default());
            while let Some(frame) = framed.next().await {
                match frame {
                    Ok(payload) => match read_callbacks.upgrade() {
                        Some(cb) => cb.on_payload(payload).await,
                        None => return None,
                    },
                    Err(ParseError::Body(err)) => {
                        warn!("discarding frame with invalid JSON body: {}", err);
                    }
                    Err(err) => return Some(TransportError::MalformedFrame(err)),
                }
            }
            None
        };
        let (abort_read, registration) = AbortHandle::new_pair();
        let reader_task = tokio::spawn(Abortable::new(read_loop, registration));

        let stderr_task = stderr.map(|stderr| {
            let callbacks = callbacks.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match callbacks.upgrade() {
                        Some(cb) => cb.on_stderr_message(line).await,
                        None => break,
                    }
                }
            })
        });

        let inner = Arc::new(TransportInner {
            tx: Mutex::new(Some(tx)),
            abort_read,
            closed: AtomicBool::new(false),
        });

        // Supervisor: joins the tasks, reaps the process, and reports the close exactly once.
        let supervisor_inner = inner.clone();
        tokio::spawn(async move {
            let error = match reader_task.await {
                Ok(Ok(error)) => error,
                Ok(Err(_aborted)) => None,
                Err(err) => {
                    error!("transport reader task failed: {}", err);
                    None
                }
            };

            supervisor_inner.closed.store(true, Ordering::SeqCst);
            supervisor_inner
                .tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let _ = writer_task.await;

            let exit_code = match child {
                Some(mut child) => reap(&mut child).await,
                None => 0,
            };

            if let Some(task) = stderr_task {
                let _ = task.await;
            }

            if let Some(cb) = callbacks.upgrade() {
                cb.on_transport_close(exit_code, error).await;
            }
        });

        Transport { inner }
    }

    /// Enqueues a payload for writing.
    ///
    /// Callable from any thread. Once the transport has closed, payloads are silently dropped
    /// since the session may be in the middle of tearing down.
    pub fn send(&self, payload: Value) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let guard = self.inner.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(payload);
        }
    }

    /// Shuts the transport down. Idempotent.
    ///
    /// Payloads already enqueued are still flushed; the reader stops, the server's stdin is
    /// closed, and the process is reaped (killed after a grace period if necessary) before
    /// [`TransportCallbacks::on_transport_close`] fires.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.inner.abort_read.abort();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

fn missing_pipe(name: &str) -> TransportError {
    TransportError::Spawn(IoError::new(
        ErrorKind::Other,
        format!("failed to capture child {name}"),
    ))
}

async fn reap(child: &mut Child) -> i32 {
    match timeout(PROCESS_EXIT_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => status.code().unwrap_or(-1),
        Ok(Err(err)) => {
            warn!("failed to wait for server process: {}", err);
            -1
        }
        Err(_) => {
            debug!("server process did not exit in time, killing it");
            if let Err(err) = child.kill().await {
                warn!("failed to kill server process: {}", err);
            }
            child
                .try_wait()
                .ok()
                .flatten()
                .and_then(|status| status.code())
                .unwrap_or(-1)
        }
    }
}
