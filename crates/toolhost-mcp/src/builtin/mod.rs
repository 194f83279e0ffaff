//! Built-in servers that run inside the host process.

mod filesystem;
mod prompts;

pub use filesystem::FilesystemServer;
pub use prompts::PromptsServer;

use crate::protocol::{CallOutcome, ResourceContents, ServerInfo};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use toolhost_config::{BuiltinId, ServerDefinition};
use toolhost_types::{ParamSpec, ToolDescriptor};

/// Boxed future returned by built-in server operations.
pub type BuiltinFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An MCP server implemented in-process.
///
/// Tool failures are reported through `CallOutcome::is_error`, never as a
/// transport failure.
pub trait BuiltinServer: Send + Sync {
    fn info(&self) -> ServerInfo;

    fn list_tools(&self) -> Vec<ToolDescriptor>;

    fn call_tool(&self, name: &str, args: serde_json::Value) -> BuiltinFuture<'_, CallOutcome>;

    /// Read a resource by URI. The error string is shown to the caller.
    fn read_resource(&self, uri: &str) -> BuiltinFuture<'_, Result<ResourceContents, String>>;
}

/// Construct the built-in named by `id` from its server definition.
pub fn create(id: BuiltinId, definition: &ServerDefinition) -> Arc<dyn BuiltinServer> {
    match id {
        BuiltinId::Filesystem => Arc::new(FilesystemServer::from_definition(definition)),
        BuiltinId::Prompts => Arc::new(PromptsServer::new()),
    }
}

/// Descriptor builder used by the built-in tool tables.
pub(crate) fn tool(
    name: &str,
    description: &str,
    params: &[(&str, &str, &str)],
    required: &[&str],
) -> ToolDescriptor {
    ToolDescriptor {
        name: name.to_string(),
        description: description.to_string(),
        params: params
            .iter()
            .map(|(param, param_type, description)| {
                (
                    param.to_string(),
                    ParamSpec {
                        param_type: param_type.to_string(),
                        description: description.to_string(),
                    },
                )
            })
            .collect(),
        required: required.iter().map(|r| r.to_string()).collect(),
    }
}

fn server_info(name: &str) -> ServerInfo {
    ServerInfo {
        name: format!("toolhost-{name}"),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_builds_matching_server() {
        let def = ServerDefinition::in_memory(BuiltinId::Prompts);
        let server = create(BuiltinId::Prompts, &def);
        assert_eq!(server.info().name, "toolhost-prompts");

        let def = ServerDefinition::in_memory(BuiltinId::Filesystem);
        let server = create(BuiltinId::Filesystem, &def);
        assert!(server.list_tools().iter().any(|t| t.name == "read_file"));
    }

    #[test]
    fn builtin_servers_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FilesystemServer>();
        assert_send_sync::<PromptsServer>();
    }
}
