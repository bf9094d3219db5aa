//! 工具调用的可读描述
//!
//! 有序的 (谓词, 格式化函数) 表：第一个匹配的条目生效，
//! 新增工具只需要在表中加一行。

use serde_json::Value;

/// 工具分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    List,
    Read,
    Write,
    Edit,
    Shell,
    Search,
    WebSearch,
    WebFetch,
    TodoUpdate,
    /// 外部集成（`mcp__<server>__<action>`）
    External,
    Other,
}

impl ToolKind {
    pub fn of(name: &str) -> Self {
        match name {
            "LS" | "list_files" => ToolKind::List,
            "Read" | "read_file" => ToolKind::Read,
            "Write" | "write_to_file" => ToolKind::Write,
            "Edit" | "MultiEdit" | "NotebookEdit" | "replace_in_file" => ToolKind::Edit,
            "Bash" | "execute_command" => ToolKind::Shell,
            "Grep" | "Glob" | "search_files" => ToolKind::Search,
            "WebSearch" => ToolKind::WebSearch,
            "WebFetch" => ToolKind::WebFetch,
            "TodoWrite" => ToolKind::TodoUpdate,
            n if n.starts_with("mcp__") => ToolKind::External,
            _ => ToolKind::Other,
        }
    }
}

type Predicate = fn(ToolKind, &Value) -> bool;
type Formatter = fn(&str, &Value) -> String;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "svg", "webp", "pdf"];

/// 命令描述最大长度（字符）
const MAX_COMMAND_CHARS: usize = 200;

static TOOL_FORMATTERS: &[(Predicate, Formatter)] = &[
    (is_list, format_list),
    (is_image_read, format_image_read),
    (is_read, format_read),
    (is_write, format_write),
    (is_edit, format_edit),
    (is_shell, format_shell),
    (is_search, format_search),
    (is_web_search, format_web_search),
    (is_web_fetch, format_web_fetch),
    (is_todo, format_todo),
    (is_external, format_external),
];

/// 生成工具调用的单行描述
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let kind = ToolKind::of(name);
    TOOL_FORMATTERS
        .iter()
        .find(|(matches, _)| matches(kind, input))
        .map(|(_, format)| format(name, input))
        .unwrap_or_else(|| format!("invoked tool `{}`", name))
}

fn str_field<'a>(input: &'a Value, keys: &[&str]) -> &'a str {
    keys.iter()
        .find_map(|k| input.get(*k).and_then(|v| v.as_str()))
        .unwrap_or_default()
}

fn target_path(input: &Value) -> &str {
    str_field(input, &["file_path", "path", "notebook_path"])
}

fn is_list(kind: ToolKind, _: &Value) -> bool {
    kind == ToolKind::List
}

fn is_image_read(kind: ToolKind, input: &Value) -> bool {
    if kind != ToolKind::Read {
        return false;
    }
    let ext = std::path::Path::new(target_path(input))
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    IMAGE_EXTENSIONS.contains(&ext.as_str())
}

fn is_read(kind: ToolKind, _: &Value) -> bool {
    kind == ToolKind::Read
}

fn is_write(kind: ToolKind, _: &Value) -> bool {
    kind == ToolKind::Write
}

fn is_edit(kind: ToolKind, _: &Value) -> bool {
    kind == ToolKind::Edit
}

fn is_shell(kind: ToolKind, _: &Value) -> bool {
    kind == ToolKind::Shell
}

fn is_search(kind: ToolKind, _: &Value) -> bool {
    kind == ToolKind::Search
}

fn is_web_search(kind: ToolKind, _: &Value) -> bool {
    kind == ToolKind::WebSearch
}

fn is_web_fetch(kind: ToolKind, _: &Value) -> bool {
    kind == ToolKind::WebFetch
}

fn is_todo(kind: ToolKind, _: &Value) -> bool {
    kind == ToolKind::TodoUpdate
}

fn is_external(kind: ToolKind, _: &Value) -> bool {
    kind == ToolKind::External
}

fn format_list(_: &str, input: &Value) -> String {
    let path = str_field(input, &["path"]);
    format!("Listing: {}", if path.is_empty() { "." } else { path })
}

fn format_image_read(_: &str, input: &Value) -> String {
    format!("Reading image: {}", target_path(input))
}

fn format_read(_: &str, input: &Value) -> String {
    format!("Reading: {}", target_path(input))
}

fn format_write(_: &str, input: &Value) -> String {
    format!("Writing: {}", target_path(input))
}

fn format_edit(_: &str, input: &Value) -> String {
    format!("Editing: {}", target_path(input))
}

fn format_shell(_: &str, input: &Value) -> String {
    let command = str_field(input, &["command"]).lines().next().unwrap_or_default();
    let shown: String = if command.chars().count() > MAX_COMMAND_CHARS {
        let head: String = command.chars().take(MAX_COMMAND_CHARS).collect();
        format!("{}...", head)
    } else {
        command.to_string()
    };
    format!("Running: {}", shown)
}

fn format_search(_: &str, input: &Value) -> String {
    format!("Searching: {}", str_field(input, &["pattern", "regex", "query"]))
}

fn format_web_search(_: &str, input: &Value) -> String {
    format!("Web search: {}", str_field(input, &["query"]))
}

fn format_web_fetch(_: &str, input: &Value) -> String {
    format!("Fetching: {}", str_field(input, &["url"]))
}

fn format_todo(_: &str, _: &Value) -> String {
    "Updating todo list".to_string()
}

fn format_external(name: &str, _: &Value) -> String {
    let rest = name.trim_start_matches("mcp__");
    let (server, action) = match rest.split_once("__") {
        Some((server, action)) => (server, action),
        None => (rest, ""),
    };
    let server = display_server(server);
    if action.is_empty() {
        format!("{}: call", server)
    } else {
        format!("{}: {}", server, action)
    }
}

fn display_server(server: &str) -> String {
    match server {
        "github" => "GitHub".to_string(),
        "gitlab" => "GitLab".to_string(),
        _ => {
            let mut chars = server.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => "External".to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_file_tools() {
        assert_eq!(describe_tool_use("LS", &json!({"path": "."})), "Listing: .");
        assert_eq!(describe_tool_use("LS", &json!({})), "Listing: .");
        assert_eq!(
            describe_tool_use("Read", &json!({"file_path": "src/main.rs"})),
            "Reading: src/main.rs"
        );
        assert_eq!(
            describe_tool_use("Read", &json!({"file_path": "docs/Diagram.PNG"})),
            "Reading image: docs/Diagram.PNG"
        );
        assert_eq!(
            describe_tool_use("Write", &json!({"file_path": "a.txt", "content": "x"})),
            "Writing: a.txt"
        );
        assert_eq!(
            describe_tool_use("MultiEdit", &json!({"file_path": "b.rs"})),
            "Editing: b.rs"
        );
    }

    #[test]
    fn test_command_and_search_tools() {
        assert_eq!(
            describe_tool_use("Bash", &json!({"command": "cargo fmt\nexit 0"})),
            "Running: cargo fmt"
        );
        let long = "x".repeat(500);
        let msg = describe_tool_use("Bash", &json!({ "command": long }));
        assert!(msg.ends_with("..."));
        assert!(msg.len() < 250);

        assert_eq!(describe_tool_use("Grep", &json!({"pattern": "TODO"})), "Searching: TODO");
        assert_eq!(describe_tool_use("Glob", &json!({"pattern": "**/*.rs"})), "Searching: **/*.rs");
        assert_eq!(
            describe_tool_use("WebSearch", &json!({"query": "rust async"})),
            "Web search: rust async"
        );
        assert_eq!(
            describe_tool_use("WebFetch", &json!({"url": "https://example.com"})),
            "Fetching: https://example.com"
        );
        assert_eq!(describe_tool_use("TodoWrite", &json!({"todos": []})), "Updating todo list");
    }

    #[test]
    fn test_external_and_unknown_tools() {
        assert_eq!(
            describe_tool_use("mcp__github__create_issue", &json!({})),
            "GitHub: create_issue"
        );
        assert_eq!(describe_tool_use("mcp__linear__search", &json!({})), "Linear: search");
        assert_eq!(describe_tool_use("mcp__slack", &json!({})), "Slack: call");
        assert_eq!(describe_tool_use("Frobnicate", &json!({})), "invoked tool `Frobnicate`");
    }

    #[test]
    fn test_missing_input_fields_do_not_panic() {
        assert_eq!(describe_tool_use("Read", &Value::Null), "Reading: ");
        assert_eq!(describe_tool_use("Bash", &json!({"command": 42})), "Running: ");
    }
}
