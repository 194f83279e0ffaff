//! Tool-name classification.
//!
//! The required capability is derived from the literal tool name. Keep all
//! name-based rules in this file so a structured capability declaration can
//! replace it later.

use crate::types::Capability;

/// Tools known to only inspect state.
const READ_TOOLS: &[&str] = &[
    "read_file",
    "read_text_file",
    "read_media_file",
    "read_multiple_files",
    "list_directory",
    "list_directory_with_sizes",
    "directory_tree",
    "search_files",
    "get_file_info",
    "list_allowed_directories",
    "list_prompts",
    "get_prompt",
];

/// Tools known to mutate state.
const WRITE_TOOLS: &[&str] = &[
    "write_file",
    "edit_file",
    "create_directory",
    "move_file",
];

/// Name prefixes treated as inspection operations.
const READ_PREFIXES: &[&str] = &["read", "get", "list", "search", "find", "query", "fetch"];

/// Name prefixes treated as mutating operations.
const WRITE_PREFIXES: &[&str] = &[
    "write", "edit", "create", "move", "delete", "remove", "update", "rename", "insert", "set",
];

/// Return the capability a tool call needs, or `None` when the name is
/// unclassified (only an `all` approval admits those).
pub fn classify(tool_name: &str) -> Option<Capability> {
    let name = tool_name.trim();
    let lower = name.to_ascii_lowercase();

    if READ_TOOLS.contains(&lower.as_str()) {
        return Some(Capability::Read);
    }
    if WRITE_TOOLS.contains(&lower.as_str()) {
        return Some(Capability::Write);
    }
    if has_prefix(name, &lower, WRITE_PREFIXES) {
        return Some(Capability::Write);
    }
    if has_prefix(name, &lower, READ_PREFIXES) {
        return Some(Capability::Read);
    }
    None
}

/// A prefix only counts when it is the whole name or is followed by a
/// separator or a camelCase boundary (`read_file`, `read-file`, `readFile`).
fn has_prefix(name: &str, lower: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|prefix| match lower.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => {
            rest.starts_with(['_', '-', '.'])
                || name[prefix.len()..].starts_with(|c: char| c.is_ascii_uppercase())
        }
        None => false,
    })
}
