//! MCP client bound to one server name.
//!
//! Handles the handshake (initialize + initialized notification), tool
//! discovery (tools/list), tool invocation (tools/call) and resource reads
//! over whatever transport the manager holds for the server.

use crate::error::McpError;
use crate::manager::ServerProcessManager;
use crate::protocol::{
    PROTOCOL_VERSION, ResourceContents, ServerInfo, content_to_text, resource_from_result,
    tool_from_value,
};
use crate::transport::Transport;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use toolhost_config::{ConfigStore, ServerDefinition};
use toolhost_types::ToolDescriptor;

/// Argument keys whose relative values are resolved against the server's cwd.
const PATH_KEYS: &[&str] = &["path", "paths", "source", "destination", "directory"];

struct Session {
    transport: Arc<dyn Transport>,
    info: Option<ServerInfo>,
}

/// Client for a single server. Connects lazily and reconnects after the
/// transport closes.
pub struct McpClient {
    server: String,
    config: Arc<ConfigStore>,
    manager: ServerProcessManager,
    session: Mutex<Option<Session>>,
}

impl McpClient {
    pub fn new(server: impl Into<String>, config: Arc<ConfigStore>, manager: ServerProcessManager) -> Self {
        Self {
            server: server.into(),
            config,
            manager,
            session: Mutex::new(None),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server
    }

    /// The `serverInfo` from the last handshake, if any.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.lock()
            .as_ref()
            .and_then(|session| session.info.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|session| !session.transport.is_closed())
    }

    /// Handshake with the running server. A no-op while connected.
    pub async fn connect(&self) -> Result<(), McpError> {
        self.transport().await.map(|_| ())
    }

    /// Drop the session. The server process is left alone.
    pub fn disconnect(&self) {
        if self.lock().take().is_some() {
            tracing::debug!(server = %self.server, "client disconnected");
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let result = self
            .request("tools/list", None, CancellationToken::new())
            .await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .ok_or_else(|| McpError::protocol(&self.server, "tools/list result has no tools array"))?;
        let tools = tools
            .iter()
            .map(|tool| tool_from_value(&self.server, tool))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(server = %self.server, count = tools.len(), "listed tools");
        Ok(tools)
    }

    /// Call a tool and return its text output.
    pub async fn call_tool(&self, tool: &str, arguments: Value) -> Result<String, McpError> {
        self.call_tool_with_cancel(tool, arguments, CancellationToken::new())
            .await
    }

    /// Like [`call_tool`](Self::call_tool), but aborted with `Cancelled` when
    /// `cancel` fires.
    pub async fn call_tool_with_cancel(
        &self,
        tool: &str,
        arguments: Value,
        cancel: CancellationToken,
    ) -> Result<String, McpError> {
        let definition = self.definition()?;
        let arguments = match &definition.cwd {
            Some(cwd) => resolve_path_args(arguments, cwd),
            None => arguments,
        };
        let params = json!({
            "name": tool,
            "arguments": arguments,
        });
        let result = self.request("tools/call", Some(params), cancel).await?;

        let content = result
            .get("content")
            .and_then(Value::as_array)
            .ok_or_else(|| McpError::protocol(&self.server, "tools/call result has no content"))?;
        let text = content_to_text(content);
        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if is_error {
            return Err(McpError::ToolExecutionError {
                server: self.server.clone(),
                tool: tool.to_string(),
                message: text,
            });
        }
        Ok(text)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ResourceContents, McpError> {
        let result = self
            .request(
                "resources/read",
                Some(json!({ "uri": uri })),
                CancellationToken::new(),
            )
            .await?;
        Ok(resource_from_result(uri, &result))
    }

    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn definition(&self) -> Result<ServerDefinition, McpError> {
        self.config
            .definition(&self.server)
            .ok_or_else(|| McpError::NotConfigured {
                name: self.server.clone(),
            })
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: CancellationToken,
    ) -> Result<Value, McpError> {
        let timeout = self.definition()?.request_timeout();
        let transport = self.transport().await?;
        let result = transport.request(method, params, timeout, cancel).await;
        if result.is_err() && transport.is_closed() {
            self.invalidate(&transport);
        }
        result
    }

    /// The live transport, performing the handshake first if needed.
    async fn transport(&self) -> Result<Arc<dyn Transport>, McpError> {
        {
            let mut session = self.lock();
            match session.as_ref() {
                Some(s) if !s.transport.is_closed() => return Ok(Arc::clone(&s.transport)),
                Some(_) => {
                    tracing::debug!(server = %self.server, "transport closed; reconnecting");
                    *session = None;
                }
                None => {}
            }
        }

        let transport = self.manager.transport(&self.server)?;
        let timeout = self.definition()?.request_timeout();
        let init = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "toolhost",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = transport
            .request("initialize", Some(init), timeout, CancellationToken::new())
            .await?;
        let info = result
            .get("serverInfo")
            .and_then(|info| serde_json::from_value::<ServerInfo>(info.clone()).ok());
        transport
            .notify("notifications/initialized", None)
            .await?;

        match &info {
            Some(info) => tracing::info!(
                server = %self.server,
                remote = %info.name,
                version = %info.version,
                "connected"
            ),
            None => tracing::info!(server = %self.server, "connected"),
        }

        let mut session = self.lock();
        match session.as_ref() {
            // Another caller finished its handshake first on the same transport.
            Some(s) if !s.transport.is_closed() => Ok(Arc::clone(&s.transport)),
            _ => {
                *session = Some(Session {
                    transport: Arc::clone(&transport),
                    info,
                });
                Ok(transport)
            }
        }
    }

    fn invalidate(&self, transport: &Arc<dyn Transport>) {
        let mut session = self.lock();
        if session
            .as_ref()
            .is_some_and(|s| Arc::ptr_eq(&s.transport, transport))
        {
            *session = None;
        }
    }
}

fn is_path_key(key: &str) -> bool {
    PATH_KEYS.contains(&key) || key.ends_with("_path") || key.ends_with("_dir")
}

/// Resolve relative values of path-like argument keys against `cwd`.
pub fn resolve_path_args(arguments: Value, cwd: &Path) -> Value {
    let Value::Object(map) = arguments else {
        return arguments;
    };
    let resolve = |value: Value| match value {
        Value::String(s) if Path::new(&s).is_relative() => {
            Value::String(cwd.join(&s).to_string_lossy().into_owned())
        }
        other => other,
    };
    Value::Object(
        map.into_iter()
            .map(|(key, value)| {
                if !is_path_key(&key) {
                    return (key, value);
                }
                let value = match value {
                    Value::Array(items) => Value::Array(items.into_iter().map(resolve).collect()),
                    other => resolve(other),
                };
                (key, value)
            })
            .collect(),
    )
}
