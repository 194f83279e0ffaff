//! Approval policy: the entry point for permission checks.

use crate::classify::classify;
use crate::types::*;
use std::collections::BTreeSet;

/// A server's approval set, evaluated against tool names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApprovalPolicy {
    approvals: BTreeSet<Capability>,
}

impl ApprovalPolicy {
    pub fn new(approvals: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            approvals: approvals.into_iter().collect(),
        }
    }

    /// A policy that admits every call.
    pub fn allow_all() -> Self {
        Self::new([Capability::All])
    }

    pub fn grants(&self, capability: Capability) -> bool {
        self.approvals.contains(&Capability::All) || self.approvals.contains(&capability)
    }

    /// Check whether a call to `tool_name` may proceed.
    ///
    /// `all` admits everything. Otherwise the tool's classified capability
    /// must be in the set; unclassified tools are denied.
    pub fn check(&self, tool_name: &str) -> PermissionDecision {
        if self.approvals.contains(&Capability::All) {
            return PermissionDecision::Permit;
        }

        let required = classify(tool_name);
        match required {
            Some(capability) if self.grants(capability) => PermissionDecision::Permit,
            Some(capability) => {
                tracing::debug!(tool = tool_name, %capability, "tool call denied by approval set");
                PermissionDecision::Deny {
                    tool: tool_name.to_string(),
                    required,
                    reason: format!(
                        "Permission denied: tool '{tool_name}' requires '{capability}' approval, \
                         which this server has not been granted"
                    ),
                }
            }
            None => {
                tracing::debug!(tool = tool_name, "unclassified tool call denied");
                PermissionDecision::Deny {
                    tool: tool_name.to_string(),
                    required: None,
                    reason: format!(
                        "Permission denied: tool '{tool_name}' is not classified as read or \
                         write and requires 'all' approval"
                    ),
                }
            }
        }
    }

    pub fn approvals(&self) -> impl Iterator<Item = Capability> + '_ {
        self.approvals.iter().copied()
    }
}
