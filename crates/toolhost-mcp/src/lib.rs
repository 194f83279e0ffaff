//! MCP plumbing for toolhost.
//!
//! Spawned servers speak newline-delimited JSON-RPC 2.0 over stdio; built-in
//! servers run in-process behind the same `Transport` trait. The
//! [`ServerProcessManager`] owns server lifecycles and [`McpClient`] speaks
//! the protocol to one server at a time.

pub mod builtin;
pub mod client;
pub mod error;
pub mod jsonrpc;
pub mod manager;
mod process;
pub mod protocol;
pub mod transport;

pub use builtin::{BuiltinServer, FilesystemServer, PromptsServer};
pub use client::McpClient;
pub use error::McpError;
pub use manager::{RunningServerInfo, ServerProcessManager};
pub use process::{BUILTIN_READY_PHRASES, STOP_GRACE};
pub use protocol::{CallOutcome, ResourceContents, ServerInfo};
pub use transport::{InMemoryTransport, StdioTransport, Transport};
