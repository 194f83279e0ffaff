use thiserror::Error;
use toolhost_mcp::McpError;
use toolhost_types::ConfigError;

/// Errors from discovering or invoking tools.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("No default server is selected")]
    NoDefaultServer,

    #[error("{0}")]
    PermissionDenied(String),

    #[error(transparent)]
    Mcp(#[from] McpError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
