//! Approval policy for toolhost.
//!
//! Capabilities: read / write / all
//! A tool name is classified into the capability it needs; a server's approval
//! set decides whether the call may proceed.

pub mod classify;
pub mod engine;
pub mod types;

pub use classify::classify;
pub use engine::ApprovalPolicy;
pub use types::*;
