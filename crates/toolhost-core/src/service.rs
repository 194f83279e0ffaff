//! Tool invocation: discovery on the default server and policy-checked calls.

use crate::error::InvokeError;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use toolhost_config::{ConfigStore, InstallOutcome, InstallRejection, InstallRequest, resolve_install};
use toolhost_mcp::{McpClient, McpError, ServerProcessManager};
use toolhost_permissions::PermissionDecision;
use toolhost_types::{EventBus, GenericToolCall, GenericToolDefinition, GenericToolResult, HostEvent};

/// Discovers tools on the default server and forwards calls to it.
///
/// Every call is checked against the server's approval set first. Calls never
/// fail outright: errors come back as `GenericToolResult`s with `is_error`.
pub struct ToolInvocationService {
    config: Arc<ConfigStore>,
    manager: ServerProcessManager,
    events: EventBus,
    client: Mutex<Option<Arc<McpClient>>>,
}

impl ToolInvocationService {
    pub fn new(config: Arc<ConfigStore>, manager: ServerProcessManager) -> Self {
        let events = manager.events().clone();
        Self {
            config,
            manager,
            events,
            client: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn manager(&self) -> &ServerProcessManager {
        &self.manager
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The default server's tools, as function definitions.
    pub async fn list_all_tools(&self) -> Result<Vec<GenericToolDefinition>, InvokeError> {
        let (server, client) = self.ready_client().await?;
        let tools = client.list_tools().await?;
        tracing::debug!(server = %server, count = tools.len(), "enumerated tools");
        Ok(tools.iter().map(GenericToolDefinition::from_descriptor).collect())
    }

    pub async fn invoke(&self, call: &GenericToolCall) -> GenericToolResult {
        self.invoke_with_cancel(call, CancellationToken::new()).await
    }

    /// Invoke a tool call, aborting it when `cancel` fires.
    pub async fn invoke_with_cancel(
        &self,
        call: &GenericToolCall,
        cancel: CancellationToken,
    ) -> GenericToolResult {
        let mut call = call.clone();
        if call.id.is_empty() {
            call.id = format!("call_{}", uuid::Uuid::new_v4().simple());
        }

        let result = match self.try_invoke(&call, cancel).await {
            Ok(text) => GenericToolResult::text(&call, text),
            Err(e) => {
                tracing::warn!(tool = %call.function.name, call_id = %call.id, "tool call failed: {e}");
                GenericToolResult::error(&call, e.to_string())
            }
        };

        self.events.emit(HostEvent::ToolCallResult {
            call_id: result.tool_call_id.clone(),
            tool: result.name.clone(),
            is_error: result.is_error,
            content: result.content.clone(),
        });
        result
    }

    async fn try_invoke(
        &self,
        call: &GenericToolCall,
        cancel: CancellationToken,
    ) -> Result<String, InvokeError> {
        let server = self
            .config
            .default_server()
            .ok_or(InvokeError::NoDefaultServer)?;
        let definition = self
            .config
            .definition(&server)
            .ok_or_else(|| McpError::NotConfigured {
                name: server.clone(),
            })?;

        let tool = &call.function.name;
        if let PermissionDecision::Deny { reason, .. } = definition.policy().check(tool) {
            return Err(InvokeError::PermissionDenied(reason));
        }

        let arguments = parse_arguments(&call.function.arguments);
        self.manager.start(&server).await?;
        let client = self.client_for(&server);
        let text = client.call_tool_with_cancel(tool, arguments, cancel).await?;
        Ok(text)
    }

    /// Stop a server if it is running or starting, forget its client, then
    /// delete it.
    pub async fn remove_server(&self, name: &str) -> Result<bool, InvokeError> {
        self.manager.stop(name).await;
        {
            let mut client = self.lock_client();
            if client.as_ref().is_some_and(|c| c.server_name() == name) {
                if let Some(client) = client.take() {
                    client.disconnect();
                }
            }
        }
        Ok(self.config.remove(name)?)
    }

    /// Add every acceptable server from an install request.
    ///
    /// Entries that fail to persist are reported as rejections.
    pub fn install(&self, request: InstallRequest) -> InstallOutcome {
        let resolved = resolve_install(request);
        let mut outcome = InstallOutcome {
            accepted: Vec::with_capacity(resolved.accepted.len()),
            rejected: resolved.rejected,
        };
        for (name, definition) in resolved.accepted {
            match self.config.upsert(&name, definition.clone()) {
                Ok(()) => {
                    tracing::info!(server = %name, "installed server");
                    outcome.accepted.push((name, definition));
                }
                Err(e) => outcome.rejected.push(InstallRejection {
                    name,
                    reason: e.to_string(),
                }),
            }
        }
        outcome
    }

    /// Disconnect the client and stop every server.
    pub async fn shutdown(&self) {
        if let Some(client) = self.lock_client().take() {
            client.disconnect();
        }
        self.manager.stop_all().await;
    }

    async fn ready_client(&self) -> Result<(String, Arc<McpClient>), InvokeError> {
        let server = self
            .config
            .default_server()
            .ok_or(InvokeError::NoDefaultServer)?;
        self.manager.start(&server).await?;
        let client = self.client_for(&server);
        Ok((server, client))
    }

    /// The client bound to `server`, replacing one bound elsewhere.
    fn client_for(&self, server: &str) -> Arc<McpClient> {
        let mut slot = self.lock_client();
        if let Some(client) = slot.as_ref() {
            if client.server_name() == server {
                return Arc::clone(client);
            }
        }
        if let Some(old) = slot.take() {
            old.disconnect();
        }
        let client = Arc::new(McpClient::new(
            server,
            Arc::clone(&self.config),
            self.manager.clone(),
        ));
        *slot = Some(Arc::clone(&client));
        client
    }

    fn lock_client(&self) -> MutexGuard<'_, Option<Arc<McpClient>>> {
        self.client
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Parse call arguments. Blank input is `{}`; anything that is not a JSON
/// object is replaced by `{}` with a warning.
pub fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Map::new());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => {
            tracing::warn!("Tool arguments are not a JSON object ({other}); using {{}}");
            Value::Object(Map::new())
        }
        Err(e) => {
            tracing::warn!("Failed to parse tool arguments: {e}; using {{}}");
            Value::Object(Map::new())
        }
    }
}
