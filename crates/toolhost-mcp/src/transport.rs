//! Transports: how requests reach a running server.
//!
//! `StdioTransport` speaks newline-delimited JSON-RPC to a child process;
//! `InMemoryTransport` dispatches straight into a built-in server.

use crate::builtin::BuiltinServer;
use crate::error::McpError;
use crate::jsonrpc::{
    INVALID_PARAMS, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    METHOD_NOT_FOUND, RESOURCE_NOT_FOUND,
};
use crate::protocol::{PROTOCOL_VERSION, descriptor_to_tool};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::process::ChildStdin;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Boxed future returned by transport operations.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, McpError>> + Send + 'a>>;

/// A connection to one running server.
pub trait Transport: Send + Sync {
    /// Send a request and wait for its result. JSON-RPC errors become
    /// `McpError::JsonRpc`; a closed transport gives `ServerStopped`.
    fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> TransportFuture<'_, Value>;

    /// Send a notification. No response is expected.
    fn notify(&self, method: &str, params: Option<Value>) -> TransportFuture<'_, ()>;

    /// Close the transport. In-flight requests fail with `ServerStopped`.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

type Waiter = oneshot::Sender<JsonRpcResponse>;

#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<u64, Waiter>,
}

/// Removes a waiter when its request future is dropped or times out.
struct PendingGuard<'a> {
    pending: &'a Mutex<Pending>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).waiters.remove(&self.id);
    }
}

fn lock(pending: &Mutex<Pending>) -> std::sync::MutexGuard<'_, Pending> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// JSON-RPC over a child's stdin, with responses fed in from its stdout.
pub struct StdioTransport {
    server: String,
    next_id: AtomicU64,
    write_tx: Mutex<Option<mpsc::Sender<String>>>,
    pending: Arc<Mutex<Pending>>,
    dispatcher: JoinHandle<()>,
}

impl StdioTransport {
    /// Start writer and dispatcher tasks. `incoming` carries the JSON-RPC
    /// lines read from the child's stdout; when it ends, the transport closes.
    pub fn new(server: &str, stdin: ChildStdin, incoming: mpsc::Receiver<String>) -> Self {
        let (write_tx, mut write_rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            let mut stdin = BufWriter::new(stdin);
            while let Some(msg) = write_rx.recv().await {
                if stdin.write_all(msg.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                    || stdin.flush().await.is_err()
                {
                    break;
                }
            }
        });

        let pending = Arc::new(Mutex::new(Pending::default()));
        let dispatcher = tokio::spawn(dispatch(
            server.to_string(),
            incoming,
            Arc::clone(&pending),
        ));

        Self {
            server: server.to_string(),
            next_id: AtomicU64::new(1),
            write_tx: Mutex::new(Some(write_tx)),
            pending,
            dispatcher,
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<String>, McpError> {
        self.write_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| self.stopped())
    }

    fn stopped(&self) -> McpError {
        McpError::ServerStopped {
            name: self.server.clone(),
        }
    }
}

/// Route responses to their waiters until stdout closes.
async fn dispatch(server: String, mut incoming: mpsc::Receiver<String>, pending: Arc<Mutex<Pending>>) {
    while let Some(line) = incoming.recv().await {
        let resp: JsonRpcResponse = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(server = %server, "Failed to parse JSON-RPC message: {e}");
                continue;
            }
        };
        if resp.is_server_message() {
            tracing::debug!(server = %server, method = ?resp.method, "ignoring server-initiated message");
            continue;
        }
        if let Some(id) = resp.id {
            let waiter = lock(&pending).waiters.remove(&id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(resp);
                }
                None => tracing::debug!(server = %server, id, "response for unknown request"),
            }
        }
    }
    close_pending(&pending);
    tracing::debug!(server = %server, "stdout closed; transport shut");
}

/// Mark closed and drop every waiter so their requests fail.
fn close_pending(pending: &Mutex<Pending>) {
    let mut state = lock(pending);
    state.closed = true;
    state.waiters.clear();
}

impl Transport for StdioTransport {
    fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> TransportFuture<'_, Value> {
        let method = method.to_string();
        Box::pin(async move {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let serialized = serde_json::to_string(&JsonRpcRequest::new(id, &method, params))?;

            let (tx, rx) = oneshot::channel();
            {
                let mut state = lock(&self.pending);
                if state.closed {
                    return Err(self.stopped());
                }
                state.waiters.insert(id, tx);
            }
            let _guard = PendingGuard {
                pending: &self.pending,
                id,
            };

            self.sender()?
                .send(serialized)
                .await
                .map_err(|_| self.stopped())?;

            let resp = tokio::select! {
                resp = tokio::time::timeout(timeout, rx) => match resp {
                    Ok(Ok(resp)) => resp,
                    Ok(Err(_)) => return Err(self.stopped()),
                    Err(_) => {
                        return Err(McpError::Timeout {
                            server: self.server.clone(),
                            method,
                            timeout_ms: timeout.as_millis() as u64,
                        });
                    }
                },
                _ = cancel.cancelled() => {
                    let _ = self
                        .notify(
                            "notifications/cancelled",
                            Some(json!({"requestId": id, "reason": "cancelled by caller"})),
                        )
                        .await;
                    return Err(McpError::Cancelled {
                        server: self.server.clone(),
                        method,
                    });
                }
            };

            match (resp.result, resp.error) {
                (_, Some(err)) => Err(McpError::JsonRpc {
                    server: self.server.clone(),
                    code: err.code,
                    message: err.message,
                }),
                (Some(result), None) => Ok(result),
                (None, None) => Err(McpError::protocol(
                    &self.server,
                    format!("{method} response has neither result nor error"),
                )),
            }
        })
    }

    fn notify(&self, method: &str, params: Option<Value>) -> TransportFuture<'_, ()> {
        let notification = JsonRpcNotification::new(method, params);
        Box::pin(async move {
            let serialized = serde_json::to_string(&notification)?;
            self.sender()?
                .send(serialized)
                .await
                .map_err(|_| self.stopped())
        })
    }

    fn close(&self) {
        // Dropping the sender lets the writer finish and closes the child's stdin.
        self.write_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        close_pending(&self.pending);
        self.dispatcher.abort();
    }

    fn is_closed(&self) -> bool {
        lock(&self.pending).closed
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Direct dispatch into a built-in server. Messages stay as `serde_json::Value`.
pub struct InMemoryTransport {
    server: String,
    builtin: Arc<dyn BuiltinServer>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl InMemoryTransport {
    pub fn new(server: &str, builtin: Arc<dyn BuiltinServer>) -> Self {
        Self {
            server: server.to_string(),
            builtin,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    async fn handle(&self, method: &str, params: Value) -> Result<Value, JsonRpcError> {
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}, "resources": {}},
                "serverInfo": self.builtin.info(),
            })),
            "ping" => Ok(json!({})),
            "tools/list" => {
                let tools: Vec<Value> = self.builtin.list_tools().iter().map(descriptor_to_tool).collect();
                Ok(json!({ "tools": tools }))
            }
            "tools/call" => {
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| JsonRpcError::new(INVALID_PARAMS, "tools/call needs a tool name"))?;
                let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                Ok(self.builtin.call_tool(name, arguments).await.to_result())
            }
            "resources/read" => {
                let uri = params
                    .get("uri")
                    .and_then(Value::as_str)
                    .ok_or_else(|| JsonRpcError::new(INVALID_PARAMS, "resources/read needs a uri"))?;
                let contents = self
                    .builtin
                    .read_resource(uri)
                    .await
                    .map_err(|message| JsonRpcError::new(RESOURCE_NOT_FOUND, message))?;
                Ok(json!({ "contents": [contents] }))
            }
            other => Err(JsonRpcError::new(
                METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        }
    }
}

impl Transport for InMemoryTransport {
    fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> TransportFuture<'_, Value> {
        let method = method.to_string();
        Box::pin(async move {
            if self.is_closed() {
                return Err(McpError::ServerStopped {
                    name: self.server.clone(),
                });
            }
            let params = params.unwrap_or_else(|| json!({}));
            let outcome = tokio::select! {
                outcome = tokio::time::timeout(timeout, self.handle(&method, params)) => outcome,
                _ = self.shutdown.cancelled() => {
                    return Err(McpError::ServerStopped { name: self.server.clone() });
                }
                _ = cancel.cancelled() => {
                    return Err(McpError::Cancelled { server: self.server.clone(), method });
                }
            };
            match outcome {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(err)) => Err(McpError::JsonRpc {
                    server: self.server.clone(),
                    code: err.code,
                    message: err.message,
                }),
                Err(_) => Err(McpError::Timeout {
                    server: self.server.clone(),
                    method,
                    timeout_ms: timeout.as_millis() as u64,
                }),
            }
        })
    }

    fn notify(&self, method: &str, _params: Option<Value>) -> TransportFuture<'_, ()> {
        tracing::trace!(server = %self.server, method, "in-memory notification");
        Box::pin(async move {
            if self.is_closed() {
                return Err(McpError::ServerStopped {
                    name: self.server.clone(),
                });
            }
            Ok(())
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
