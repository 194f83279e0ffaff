//! Core types for the approval system.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A capability tag a server can be pre-approved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    Write,
    All,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Read => f.write_str("read"),
            Capability::Write => f.write_str("write"),
            Capability::All => f.write_str("all"),
        }
    }
}

/// The result of checking a tool call against an approval set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    /// Tool call is permitted.
    Permit,
    /// Tool call is denied; `reason` is shown to the calling conversation.
    Deny {
        tool: String,
        required: Option<Capability>,
        reason: String,
    },
}

impl PermissionDecision {
    pub fn is_permitted(&self) -> bool {
        matches!(self, PermissionDecision::Permit)
    }
}
