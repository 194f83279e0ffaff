//! Built-in prompt catalog.

use super::{BuiltinFuture, BuiltinServer, server_info, tool};
use crate::protocol::{CallOutcome, ResourceContents, ServerInfo};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use toolhost_types::ToolDescriptor;

/// URI scheme for prompt resources.
const SCHEME: &str = "prompt://";

/// A named prompt template. `{{arg}}` placeholders are filled on `get_prompt`.
struct PromptTemplate {
    name: &'static str,
    description: &'static str,
    arguments: &'static [&'static str],
    template: &'static str,
}

const CATALOG: &[PromptTemplate] = &[
    PromptTemplate {
        name: "code-review",
        description: "Review a change for bugs, style and missing tests",
        arguments: &["code"],
        template: "Review the following code. Point out bugs, unclear naming and \
                   missing tests, most important first.\n\n{{code}}",
    },
    PromptTemplate {
        name: "summarize",
        description: "Summarize a document in a few sentences",
        arguments: &["text"],
        template: "Summarize the following text in at most three sentences.\n\n{{text}}",
    },
    PromptTemplate {
        name: "explain-error",
        description: "Explain an error message and suggest a fix",
        arguments: &["error", "context"],
        template: "Explain what this error means and how to fix it.\n\nError:\n{{error}}\n\n\
                   Context:\n{{context}}",
    },
    PromptTemplate {
        name: "commit-message",
        description: "Write a commit message for a diff",
        arguments: &["diff"],
        template: "Write a concise commit message (subject line under 72 characters, \
                   then a short body) for this diff.\n\n{{diff}}",
    },
];

/// Serves the static prompt catalog.
#[derive(Debug, Default)]
pub struct PromptsServer;

#[derive(Deserialize)]
struct GetPromptInput {
    name: String,
    #[serde(default)]
    arguments: BTreeMap<String, Value>,
}

impl PromptsServer {
    pub fn new() -> Self {
        Self
    }

    fn find(name: &str) -> Option<&'static PromptTemplate> {
        CATALOG.iter().find(|p| p.name == name)
    }

    fn list_prompts() -> CallOutcome {
        let prompts: Vec<Value> = CATALOG
            .iter()
            .map(|p| {
                json!({
                    "name": p.name,
                    "description": p.description,
                    "arguments": p.arguments,
                })
            })
            .collect();
        match serde_json::to_string_pretty(&prompts) {
            Ok(text) => CallOutcome::ok(text),
            Err(e) => CallOutcome::error(e.to_string()),
        }
    }

    fn get_prompt(args: Value) -> CallOutcome {
        let input: GetPromptInput = match serde_json::from_value(args) {
            Ok(input) => input,
            Err(e) => return CallOutcome::error(format!("Invalid input: {e}")),
        };
        let Some(prompt) = Self::find(&input.name) else {
            return CallOutcome::error(format!("Unknown prompt: {}", input.name));
        };
        CallOutcome::ok(render(prompt.template, &input.arguments))
    }
}

/// Substitute `{{name}}` placeholders. Unfilled placeholders are left as-is.
fn render(template: &str, arguments: &BTreeMap<String, Value>) -> String {
    let mut out = template.to_string();
    for (name, value) in arguments {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out = out.replace(&format!("{{{{{name}}}}}"), &text);
    }
    out
}

impl BuiltinServer for PromptsServer {
    fn info(&self) -> ServerInfo {
        server_info("prompts")
    }

    fn list_tools(&self) -> Vec<ToolDescriptor> {
        vec![
            tool("list_prompts", "List the available prompt templates", &[], &[]),
            tool(
                "get_prompt",
                "Render a prompt template by name",
                &[
                    ("name", "string", "Prompt name, as returned by list_prompts"),
                    ("arguments", "object", "Values for the template placeholders"),
                ],
                &["name"],
            ),
        ]
    }

    fn call_tool(&self, name: &str, args: Value) -> BuiltinFuture<'_, CallOutcome> {
        let outcome = match name {
            "list_prompts" => Self::list_prompts(),
            "get_prompt" => Self::get_prompt(args),
            other => CallOutcome::error(format!("Unknown tool: {other}")),
        };
        Box::pin(async move { outcome })
    }

    fn read_resource(&self, uri: &str) -> BuiltinFuture<'_, Result<ResourceContents, String>> {
        let result = uri
            .strip_prefix(SCHEME)
            .and_then(Self::find)
            .map(|prompt| ResourceContents {
                uri: uri.to_string(),
                text: prompt.template.to_string(),
            })
            .ok_or_else(|| format!("Resource not found: {uri}"));
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_prompts_names_the_catalog() {
        let server = PromptsServer::new();
        let outcome = server.call_tool("list_prompts", json!({})).await;
        assert!(!outcome.is_error);
        let list: Vec<Value> = serde_json::from_str(&outcome.text).unwrap();
        assert_eq!(list.len(), CATALOG.len());
        assert!(list.iter().any(|p| p["name"] == "code-review"));
    }

    #[tokio::test]
    async fn get_prompt_fills_placeholders() {
        let server = PromptsServer::new();
        let outcome = server
            .call_tool(
                "get_prompt",
                json!({"name": "summarize", "arguments": {"text": "The quick brown fox."}}),
            )
            .await;
        assert!(!outcome.is_error);
        assert!(outcome.text.ends_with("The quick brown fox."));
        assert!(!outcome.text.contains("{{"));
    }

    #[tokio::test]
    async fn get_prompt_unknown_name_is_tool_error() {
        let server = PromptsServer::new();
        let outcome = server.call_tool("get_prompt", json!({"name": "nope"})).await;
        assert!(outcome.is_error);
        assert!(outcome.text.contains("nope"));

        let outcome = server.call_tool("get_prompt", json!({})).await;
        assert!(outcome.is_error);
    }

    #[tokio::test]
    async fn prompt_resources_resolve_by_name() {
        let server = PromptsServer::new();
        let contents = server.read_resource("prompt://explain-error").await.unwrap();
        assert!(contents.text.contains("{{error}}"));
        assert!(server.read_resource("prompt://missing").await.is_err());
        assert!(server.read_resource("file:///etc/passwd").await.is_err());
    }

    #[test]
    fn render_leaves_unknown_placeholders() {
        let mut args = BTreeMap::new();
        args.insert("error".to_string(), json!("E0382"));
        let text = render("{{error}} in {{context}}", &args);
        assert_eq!(text, "E0382 in {{context}}");
    }
}
