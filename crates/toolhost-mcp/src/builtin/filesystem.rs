//! Built-in filesystem server, sandboxed to a set of allowed roots.

use super::{BuiltinFuture, BuiltinServer, server_info, tool};
use crate::protocol::{CallOutcome, ResourceContents, ServerInfo};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::path::{Component, Path, PathBuf};
use toolhost_config::ServerDefinition;
use toolhost_types::ToolDescriptor;

/// URI scheme for file resources.
const SCHEME: &str = "file://";

/// Deepest level `directory_tree` descends to.
const MAX_TREE_DEPTH: usize = 16;

/// File access limited to the allowed roots.
pub struct FilesystemServer {
    roots: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct PathInput {
    path: String,
}

#[derive(Deserialize)]
struct PathsInput {
    paths: Vec<String>,
}

#[derive(Deserialize)]
struct WriteInput {
    path: String,
    content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditInput {
    path: String,
    edits: Vec<TextEdit>,
    #[serde(default)]
    dry_run: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextEdit {
    old_text: String,
    new_text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchInput {
    path: String,
    pattern: String,
    #[serde(default)]
    exclude_patterns: Vec<String>,
}

#[derive(Deserialize)]
struct MoveInput {
    source: String,
    destination: String,
}

impl FilesystemServer {
    /// Roots are the given directories, canonicalized where they exist.
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        let roots = roots
            .into_iter()
            .map(|root| std::fs::canonicalize(&root).unwrap_or_else(|_| normalize(&root)))
            .collect();
        Self { roots }
    }

    /// Roots come from the definition's args, else its cwd, else the process cwd.
    pub fn from_definition(definition: &ServerDefinition) -> Self {
        let base = definition
            .cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        let roots: Vec<PathBuf> = if definition.args.is_empty() {
            vec![base]
        } else {
            definition.args.iter().map(|arg| base.join(arg)).collect()
        };
        tracing::debug!(?roots, "filesystem server roots");
        Self::new(roots)
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Resolve a caller path and check it stays inside a root. A missing
    /// target is checked through its nearest existing ancestor.
    fn resolve(&self, raw: &str) -> Result<PathBuf, String> {
        let requested = PathBuf::from(raw);
        let absolute = if requested.is_absolute() {
            requested
        } else {
            let first = self
                .roots
                .first()
                .ok_or_else(|| "no allowed directories configured".to_string())?;
            first.join(requested)
        };
        let resolved = canonicalize_lenient(&normalize(&absolute));
        if self.roots.iter().any(|root| resolved.starts_with(root)) {
            Ok(resolved)
        } else {
            Err(format!(
                "Access denied: {} is outside the allowed directories",
                absolute.display()
            ))
        }
    }

    async fn dispatch(&self, name: &str, args: Value) -> Result<String, String> {
        match name {
            "read_file" => {
                let input: PathInput = parse(args)?;
                let path = self.resolve(&input.path)?;
                read_text(&path).await
            }
            "read_multiple_files" => {
                let input: PathsInput = parse(args)?;
                let mut sections = Vec::with_capacity(input.paths.len());
                for raw in &input.paths {
                    let section = match self.resolve(raw) {
                        Ok(path) => match read_text(&path).await {
                            Ok(text) => format!("{raw}:\n{text}"),
                            Err(e) => format!("{raw}: Error - {e}"),
                        },
                        Err(e) => format!("{raw}: Error - {e}"),
                    };
                    sections.push(section);
                }
                Ok(sections.join("\n---\n"))
            }
            "list_directory" => {
                let input: PathInput = parse(args)?;
                let path = self.resolve(&input.path)?;
                list_directory(&path).await
            }
            "directory_tree" => {
                let input: PathInput = parse(args)?;
                let path = self.resolve(&input.path)?;
                let tree = tokio::task::spawn_blocking(move || directory_tree(&path, 0))
                    .await
                    .map_err(|e| e.to_string())??;
                serde_json::to_string_pretty(&tree).map_err(|e| e.to_string())
            }
            "search_files" => {
                let input: SearchInput = parse(args)?;
                let path = self.resolve(&input.path)?;
                let roots = self.roots.clone();
                tokio::task::spawn_blocking(move || {
                    search_files(&path, &input.pattern, &input.exclude_patterns, &roots)
                })
                .await
                .map_err(|e| e.to_string())?
            }
            "get_file_info" => {
                let input: PathInput = parse(args)?;
                let path = self.resolve(&input.path)?;
                file_info(&path).await
            }
            "list_allowed_directories" => {
                let dirs: Vec<String> = self.roots.iter().map(|r| r.display().to_string()).collect();
                Ok(format!("Allowed directories:\n{}", dirs.join("\n")))
            }
            "write_file" => {
                let input: WriteInput = parse(args)?;
                let path = self.resolve(&input.path)?;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| format!("{}: {e}", parent.display()))?;
                }
                tokio::fs::write(&path, &input.content)
                    .await
                    .map_err(|e| format!("{}: {e}", path.display()))?;
                Ok(format!("Successfully wrote to {}", input.path))
            }
            "edit_file" => {
                let input: EditInput = parse(args)?;
                let path = self.resolve(&input.path)?;
                edit_file(&path, &input).await
            }
            "create_directory" => {
                let input: PathInput = parse(args)?;
                let path = self.resolve(&input.path)?;
                tokio::fs::create_dir_all(&path)
                    .await
                    .map_err(|e| format!("{}: {e}", path.display()))?;
                Ok(format!("Successfully created directory {}", input.path))
            }
            "move_file" => {
                let input: MoveInput = parse(args)?;
                let source = self.resolve(&input.source)?;
                let destination = self.resolve(&input.destination)?;
                if tokio::fs::try_exists(&destination).await.unwrap_or(false) {
                    return Err(format!("Destination already exists: {}", input.destination));
                }
                tokio::fs::rename(&source, &destination)
                    .await
                    .map_err(|e| format!("{}: {e}", source.display()))?;
                Ok(format!(
                    "Successfully moved {} to {}",
                    input.source, input.destination
                ))
            }
            other => Err(format!("Unknown tool: {other}")),
        }
    }
}

impl BuiltinServer for FilesystemServer {
    fn info(&self) -> ServerInfo {
        server_info("filesystem")
    }

    fn list_tools(&self) -> Vec<ToolDescriptor> {
        let path = ("path", "string", "Path inside an allowed directory");
        vec![
            tool("read_file", "Read the complete contents of a text file", &[path], &["path"]),
            tool(
                "read_multiple_files",
                "Read several files at once; failures are reported per file",
                &[("paths", "array", "Paths to read")],
                &["paths"],
            ),
            tool(
                "list_directory",
                "List a directory, marking entries with [DIR] or [FILE]",
                &[path],
                &["path"],
            ),
            tool(
                "directory_tree",
                "Recursive JSON tree of files and directories",
                &[path],
                &["path"],
            ),
            tool(
                "search_files",
                "Find files whose path matches a glob pattern",
                &[
                    ("path", "string", "Directory to search from"),
                    ("pattern", "string", "Glob pattern, or a plain substring of the file name"),
                    ("excludePatterns", "array", "Glob patterns to skip"),
                ],
                &["path", "pattern"],
            ),
            tool(
                "get_file_info",
                "Size, timestamps, type and permissions of a file or directory",
                &[path],
                &["path"],
            ),
            tool(
                "list_allowed_directories",
                "List the directories this server may access",
                &[],
                &[],
            ),
            tool(
                "write_file",
                "Create or overwrite a file",
                &[path, ("content", "string", "Text to write")],
                &["path", "content"],
            ),
            tool(
                "edit_file",
                "Apply exact text replacements to a file",
                &[
                    path,
                    ("edits", "array", "List of {oldText, newText} replacements"),
                    ("dryRun", "boolean", "Preview the changes without writing"),
                ],
                &["path", "edits"],
            ),
            tool(
                "create_directory",
                "Create a directory, including missing parents",
                &[path],
                &["path"],
            ),
            tool(
                "move_file",
                "Move or rename a file or directory",
                &[
                    ("source", "string", "Existing path"),
                    ("destination", "string", "New path; must not exist"),
                ],
                &["source", "destination"],
            ),
        ]
    }

    fn call_tool(&self, name: &str, args: Value) -> BuiltinFuture<'_, CallOutcome> {
        let name = name.to_string();
        Box::pin(async move {
            match self.dispatch(&name, args).await {
                Ok(text) => CallOutcome::ok(text),
                Err(e) => CallOutcome::error(format!("Error: {e}")),
            }
        })
    }

    fn read_resource(&self, uri: &str) -> BuiltinFuture<'_, Result<ResourceContents, String>> {
        let uri = uri.to_string();
        Box::pin(async move {
            let raw = uri
                .strip_prefix(SCHEME)
                .ok_or_else(|| format!("Unsupported resource URI: {uri}"))?;
            let path = self.resolve(raw)?;
            let text = read_text(&path).await?;
            Ok(ResourceContents { uri, text })
        })
    }
}

fn parse<T: DeserializeOwned>(args: Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| format!("Invalid input: {e}"))
}

/// Lexically remove `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize the deepest existing ancestor and re-append the rest.
fn canonicalize_lenient(path: &Path) -> PathBuf {
    for ancestor in path.ancestors() {
        if let Ok(real) = std::fs::canonicalize(ancestor) {
            return match path.strip_prefix(ancestor) {
                Ok(rest) if !rest.as_os_str().is_empty() => real.join(rest),
                _ => real,
            };
        }
    }
    path.to_path_buf()
}

async fn read_text(path: &Path) -> Result<String, String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("{}: {e}", path.display()))
}

async fn list_directory(path: &Path) -> Result<String, String> {
    let mut reader = tokio::fs::read_dir(path)
        .await
        .map_err(|e| format!("{}: {e}", path.display()))?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await.map_err(|e| e.to_string())? {
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        let marker = if is_dir { "[DIR]" } else { "[FILE]" };
        entries.push(format!("{marker} {}", entry.file_name().to_string_lossy()));
    }
    entries.sort();
    if entries.is_empty() {
        return Ok("Directory is empty".to_string());
    }
    Ok(entries.join("\n"))
}

fn directory_tree(path: &Path, depth: usize) -> Result<Vec<Value>, String> {
    let mut children = Vec::new();
    let entries = std::fs::read_dir(path).map_err(|e| format!("{}: {e}", path.display()))?;
    for entry in entries.filter_map(Result::ok) {
        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(_) => continue,
        };
        if file_type.is_dir() {
            let nested = if depth + 1 < MAX_TREE_DEPTH {
                directory_tree(&entry.path(), depth + 1)?
            } else {
                Vec::new()
            };
            children.push(json!({"name": name, "type": "directory", "children": nested}));
        } else {
            children.push(json!({"name": name, "type": "file"}));
        }
    }
    children.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    Ok(children)
}

fn build_globset(patterns: &[String]) -> Result<globset::GlobSet, String> {
    let mut builder = globset::GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(glob(pattern)?);
    }
    builder.build().map_err(|e| format!("Invalid glob pattern: {e}"))
}

/// A bare word matches anywhere in a file name; a pattern without a slash
/// matches at any depth.
fn glob(pattern: &str) -> Result<globset::Glob, String> {
    let has_meta = pattern.contains(['*', '?', '[', '{']);
    let expanded = match (has_meta, pattern.contains('/')) {
        (false, _) => format!("**/*{pattern}*"),
        (true, false) => format!("**/{pattern}"),
        (true, true) => pattern.to_string(),
    };
    globset::GlobBuilder::new(&expanded)
        .case_insensitive(true)
        .literal_separator(true)
        .build()
        .map_err(|e| format!("Invalid glob pattern: {e}"))
}

fn search_files(
    dir: &Path,
    pattern: &str,
    exclude: &[String],
    roots: &[PathBuf],
) -> Result<String, String> {
    let matcher = build_globset(&[pattern.to_string()])?;
    let excluded = build_globset(exclude)?;

    let mut found = Vec::new();
    let walker = walkdir::WalkDir::new(dir)
        .follow_links(false)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| {
            entry
                .path()
                .strip_prefix(dir)
                .map(|rel| !excluded.is_match(rel))
                .unwrap_or(true)
        });
    for entry in walker.filter_map(Result::ok) {
        let path = entry.path();
        if !roots.iter().any(|root| path.starts_with(root)) {
            continue;
        }
        if let Ok(rel) = path.strip_prefix(dir) {
            if matcher.is_match(rel) {
                found.push(path.display().to_string());
            }
        }
    }
    found.sort();
    if found.is_empty() {
        return Ok("No matches found".to_string());
    }
    Ok(found.join("\n"))
}

async fn file_info(path: &Path) -> Result<String, String> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| format!("{}: {e}", path.display()))?;
    let time = |t: std::io::Result<std::time::SystemTime>| {
        t.ok()
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string())
    };
    let lines = [
        format!("size: {}", meta.len()),
        format!("created: {}", time(meta.created())),
        format!("modified: {}", time(meta.modified())),
        format!("accessed: {}", time(meta.accessed())),
        format!("isDirectory: {}", meta.is_dir()),
        format!("isFile: {}", meta.is_file()),
        format!("permissions: {}", permissions(&meta)),
    ];
    Ok(lines.join("\n"))
}

#[cfg(unix)]
fn permissions(meta: &std::fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    format!("{:o}", meta.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn permissions(meta: &std::fs::Metadata) -> String {
    if meta.permissions().readonly() {
        "readonly".to_string()
    } else {
        "readwrite".to_string()
    }
}

async fn edit_file(path: &Path, input: &EditInput) -> Result<String, String> {
    let original = read_text(path).await?;
    let mut content = original.clone();
    let mut diff = Vec::new();
    for (i, edit) in input.edits.iter().enumerate() {
        if edit.old_text.is_empty() {
            return Err(format!("edit {} has an empty oldText", i + 1));
        }
        if !content.contains(&edit.old_text) {
            return Err(format!("edit {}: oldText not found in {}", i + 1, input.path));
        }
        content = content.replacen(&edit.old_text, &edit.new_text, 1);
        diff.extend(edit.old_text.lines().map(|l| format!("-{l}")));
        diff.extend(edit.new_text.lines().map(|l| format!("+{l}")));
    }

    if !input.dry_run {
        tokio::fs::write(path, &content)
            .await
            .map_err(|e| format!("{}: {e}", path.display()))?;
    }
    let header = if input.dry_run { "Dry run for" } else { "Edited" };
    Ok(format!(
        "{header} {} ({} edit(s))\n{}",
        input.path,
        input.edits.len(),
        diff.join("\n")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sandbox() -> (FilesystemServer, TempDir) {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("hello.txt"), "hello world\n").unwrap();
        std::fs::create_dir(tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src/main.rs"), "fn main() {}\n").unwrap();
        std::fs::write(tmp.path().join("src/lib.rs"), "pub fn f() {}\n").unwrap();
        let server = FilesystemServer::new([tmp.path().to_path_buf()]);
        (server, tmp)
    }

    async fn call(server: &FilesystemServer, name: &str, args: Value) -> CallOutcome {
        server.call_tool(name, args).await
    }

    #[tokio::test]
    async fn read_file_relative_to_root() {
        let (server, _tmp) = sandbox();
        let out = call(&server, "read_file", json!({"path": "hello.txt"})).await;
        assert!(!out.is_error, "{}", out.text);
        assert_eq!(out.text, "hello world\n");
    }

    #[tokio::test]
    async fn paths_outside_roots_are_denied() {
        let (server, _tmp) = sandbox();
        let out = call(&server, "read_file", json!({"path": "/etc/hostname"})).await;
        assert!(out.is_error);
        assert!(out.text.contains("Access denied"));

        let out = call(&server, "read_file", json!({"path": "../../../../etc/hostname"})).await;
        assert!(out.is_error);
        assert!(out.text.contains("Access denied"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_is_denied() {
        let (server, tmp) = sandbox();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("link")).unwrap();
        let out = call(&server, "read_file", json!({"path": "link/secret.txt"})).await;
        assert!(out.is_error);
        assert!(out.text.contains("Access denied"));
    }

    #[tokio::test]
    async fn write_then_read_new_nested_file() {
        let (server, tmp) = sandbox();
        let out = call(
            &server,
            "write_file",
            json!({"path": "new/dir/note.md", "content": "# Note"}),
        )
        .await;
        assert!(!out.is_error, "{}", out.text);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("new/dir/note.md")).unwrap(),
            "# Note"
        );
    }

    #[tokio::test]
    async fn read_multiple_reports_failures_inline() {
        let (server, _tmp) = sandbox();
        let out = call(
            &server,
            "read_multiple_files",
            json!({"paths": ["hello.txt", "missing.txt"]}),
        )
        .await;
        assert!(!out.is_error);
        assert!(out.text.contains("hello world"));
        assert!(out.text.contains("missing.txt: Error"));
    }

    #[tokio::test]
    async fn list_directory_marks_entries() {
        let (server, _tmp) = sandbox();
        let out = call(&server, "list_directory", json!({"path": "."})).await;
        assert!(!out.is_error, "{}", out.text);
        assert!(out.text.contains("[DIR] src"));
        assert!(out.text.contains("[FILE] hello.txt"));
    }

    #[tokio::test]
    async fn directory_tree_nests_children() {
        let (server, _tmp) = sandbox();
        let out = call(&server, "directory_tree", json!({"path": "."})).await;
        let tree: Vec<Value> = serde_json::from_str(&out.text).unwrap();
        let src = tree.iter().find(|n| n["name"] == "src").unwrap();
        assert_eq!(src["type"], "directory");
        assert_eq!(src["children"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn search_files_by_glob_and_substring() {
        let (server, _tmp) = sandbox();
        let out = call(&server, "search_files", json!({"path": ".", "pattern": "*.rs"})).await;
        assert_eq!(out.text.lines().count(), 2, "{}", out.text);

        let out = call(&server, "search_files", json!({"path": ".", "pattern": "HELLO"})).await;
        assert!(out.text.ends_with("hello.txt"), "{}", out.text);

        let out = call(
            &server,
            "search_files",
            json!({"path": ".", "pattern": "*.rs", "excludePatterns": ["src"]}),
        )
        .await;
        assert_eq!(out.text, "No matches found");
    }

    #[tokio::test]
    async fn edit_file_applies_and_dry_runs() {
        let (server, tmp) = sandbox();
        let out = call(
            &server,
            "edit_file",
            json!({"path": "hello.txt", "edits": [{"oldText": "world", "newText": "there"}], "dryRun": true}),
        )
        .await;
        assert!(!out.is_error, "{}", out.text);
        assert!(out.text.contains("-world\n+there"), "{}", out.text);
        assert_eq!(std::fs::read_to_string(tmp.path().join("hello.txt")).unwrap(), "hello world\n");

        let out = call(
            &server,
            "edit_file",
            json!({"path": "hello.txt", "edits": [{"oldText": "world", "newText": "there"}]}),
        )
        .await;
        assert!(!out.is_error);
        assert_eq!(std::fs::read_to_string(tmp.path().join("hello.txt")).unwrap(), "hello there\n");

        let out = call(
            &server,
            "edit_file",
            json!({"path": "hello.txt", "edits": [{"oldText": "absent", "newText": "x"}]}),
        )
        .await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn move_file_refuses_to_overwrite() {
        let (server, tmp) = sandbox();
        let out = call(
            &server,
            "move_file",
            json!({"source": "hello.txt", "destination": "src/main.rs"}),
        )
        .await;
        assert!(out.is_error);

        let out = call(
            &server,
            "move_file",
            json!({"source": "hello.txt", "destination": "moved.txt"}),
        )
        .await;
        assert!(!out.is_error, "{}", out.text);
        assert!(tmp.path().join("moved.txt").exists());
        assert!(!tmp.path().join("hello.txt").exists());
    }

    #[tokio::test]
    async fn create_directory_and_file_info() {
        let (server, _tmp) = sandbox();
        let out = call(&server, "create_directory", json!({"path": "a/b/c"})).await;
        assert!(!out.is_error);
        let out = call(&server, "get_file_info", json!({"path": "a/b/c"})).await;
        assert!(out.text.contains("isDirectory: true"));
    }

    #[tokio::test]
    async fn allowed_directories_lists_roots() {
        let (server, tmp) = sandbox();
        let out = call(&server, "list_allowed_directories", json!({})).await;
        let root = std::fs::canonicalize(tmp.path()).unwrap();
        assert!(out.text.contains(&root.display().to_string()));
    }

    #[tokio::test]
    async fn bad_input_and_unknown_tool_are_tool_errors() {
        let (server, _tmp) = sandbox();
        assert!(call(&server, "read_file", json!({})).await.is_error);
        assert!(call(&server, "format_disk", json!({})).await.is_error);
    }

    #[tokio::test]
    async fn file_resources_are_sandboxed() {
        let (server, tmp) = sandbox();
        let uri = format!("file://{}", tmp.path().join("hello.txt").display());
        let contents = server.read_resource(&uri).await.unwrap();
        assert_eq!(contents.text, "hello world\n");
        assert!(server.read_resource("file:///etc/hostname").await.is_err());
        assert!(server.read_resource("prompt://x").await.is_err());
    }

    #[test]
    fn roots_default_to_definition_cwd() {
        let tmp = TempDir::new().unwrap();
        let mut def = ServerDefinition::in_memory(toolhost_config::BuiltinId::Filesystem);
        def.cwd = Some(tmp.path().to_path_buf());
        let server = FilesystemServer::from_definition(&def);
        assert_eq!(server.roots(), &[std::fs::canonicalize(tmp.path()).unwrap()]);

        std::fs::create_dir(tmp.path().join("docs")).unwrap();
        def.args = vec!["docs".into()];
        let server = FilesystemServer::from_definition(&def);
        assert_eq!(
            server.roots(),
            &[std::fs::canonicalize(tmp.path().join("docs")).unwrap()]
        );
    }

    #[test]
    fn normalize_strips_dot_segments() {
        assert_eq!(normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
    }
}
