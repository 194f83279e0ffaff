//! Tool discovery and policy-checked invocation for toolhost.

mod error;
mod service;

pub use error::InvokeError;
pub use service::{ToolInvocationService, parse_arguments};
