//! Header parsing for agent JSONL conversation logs.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::SystemTime;

use serde_json::Value;

/// Bound on how much of a log file we read to find header fields.
const HEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
        }
    }
}

/// Read the first up to [`HEAD_BYTES`] of `path`, returning the decoded lines
/// that parse as JSON. Unparseable lines are skipped, never propagated as errors.
fn read_head_json_lines(path: &Path) -> Vec<Value> {
    let Ok(mut file) = File::open(path) else {
        return Vec::new();
    };
    let mut buf = vec![0u8; HEAD_BYTES];
    let Ok(n) = file.read(&mut buf) else {
        return Vec::new();
    };
    buf.truncate(n);
    let text = String::from_utf8_lossy(&buf);
    text.lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .collect()
}

fn first_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    for key in keys {
        if let Some(s) = value.get(key).and_then(Value::as_str)
            && !s.is_empty()
        {
            return Some(s);
        }
    }
    None
}

/// The first non-empty string from, in order: top-level `sessionId`/`session_id`,
/// or `payload.id`/`payload.sessionId`/`payload.session_id`.
pub fn extract_session_id(path: &Path) -> Option<String> {
    for line in read_head_json_lines(path) {
        if let Some(s) = first_str(&line, &["sessionId", "session_id"]) {
            return Some(s.to_string());
        }
        if let Some(payload) = line.get("payload")
            && let Some(s) = first_str(payload, &["id", "sessionId", "session_id"])
        {
            return Some(s.to_string());
        }
    }
    None
}

/// The first non-empty string from, in order: top-level `cwd`, or
/// `payload.cwd`/`payload.working_directory`.
pub fn extract_project_path(path: &Path) -> Option<String> {
    for line in read_head_json_lines(path) {
        if let Some(s) = first_str(&line, &["cwd"]) {
            return Some(s.to_string());
        }
        if let Some(payload) = line.get("payload")
            && let Some(s) = first_str(payload, &["cwd", "working_directory"])
        {
            return Some(s.to_string());
        }
    }
    None
}

/// True if the very first line parses, has `type == "session_meta"`, and the
/// payload's `source` field is an object rather than the literal string `"cli"`.
pub fn is_codex_subagent(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut buf = vec![0u8; HEAD_BYTES];
    let Ok(n) = file.read(&mut buf) else {
        return false;
    };
    buf.truncate(n);
    let text = String::from_utf8_lossy(&buf);
    let Some(first_line) = text.lines().next() else {
        return false;
    };
    let Ok(value) = serde_json::from_str::<Value>(first_line) else {
        return false;
    };
    if value.get("type").and_then(Value::as_str) != Some("session_meta") {
        return false;
    }
    match value.pointer("/payload/source") {
        Some(Value::Object(_)) => true,
        Some(Value::String(s)) => s != "cli",
        _ => false,
    }
}

/// (mtime, birthtime, size). Falls back to mtime when the filesystem lacks
/// birthtime.
pub fn get_log_times(path: &Path) -> Option<(SystemTime, SystemTime, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    let mtime = meta.modified().ok()?;
    let birthtime = meta.created().unwrap_or(mtime);
    Some((mtime, birthtime, meta.len()))
}

/// True if the very first line parses, has `type == "session_meta"`, and the
/// payload's `source` field is the literal string `"exec"` -- Codex's marker
/// for a headless `codex exec` run rather than an interactive CLI session.
pub fn is_codex_exec(path: &Path) -> bool {
    let Ok(mut file) = File::open(path) else {
        return false;
    };
    let mut buf = vec![0u8; HEAD_BYTES];
    let Ok(n) = file.read(&mut buf) else {
        return false;
    };
    buf.truncate(n);
    let text = String::from_utf8_lossy(&buf);
    let Some(first_line) = text.lines().next() else {
        return false;
    };
    let Ok(value) = serde_json::from_str::<Value>(first_line) else {
        return false;
    };
    if value.get("type").and_then(Value::as_str) != Some("session_meta") {
        return false;
    }
    value.pointer("/payload/source").and_then(Value::as_str) == Some("exec")
}

/// Rough token estimate over the log's user/assistant text content, used only
/// to gate logs too sparse to be worth a matching pass. Not a real
/// tokenizer: approximates the common ~4-characters-per-token rule of thumb
/// over every `text`/`content`/`message` string field found in the head.
pub fn estimate_token_count(path: &Path) -> i64 {
    let mut chars = 0usize;
    for line in read_head_json_lines(path) {
        collect_text_len(&line, &mut chars);
    }
    (chars / 4) as i64
}

fn collect_text_len(value: &Value, total: &mut usize) {
    match value {
        Value::String(s) => *total += s.chars().count(),
        Value::Array(items) => items.iter().for_each(|v| collect_text_len(v, total)),
        Value::Object(map) => {
            for (key, v) in map {
                if matches!(key.as_str(), "text" | "content" | "message") || v.is_object() || v.is_array() {
                    collect_text_len(v, total);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_log(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[test]
    fn extracts_top_level_session_id_and_cwd() {
        let file = write_log(&[r#"{"type":"user","sessionId":"claude-session-123","cwd":"/U/p"}"#]);
        assert_eq!(
            extract_session_id(file.path()).as_deref(),
            Some("claude-session-123")
        );
        assert_eq!(extract_project_path(file.path()).as_deref(), Some("/U/p"));
    }

    #[test]
    fn extracts_nested_payload_session_id() {
        let file = write_log(&[r#"{"payload":{"sessionId":"codex-abc","cwd":"/repo"}}"#]);
        assert_eq!(
            extract_session_id(file.path()).as_deref(),
            Some("codex-abc")
        );
        assert_eq!(extract_project_path(file.path()).as_deref(), Some("/repo"));
    }

    #[test]
    fn missing_fields_return_none() {
        let file = write_log(&[r#"{"type":"assistant"}"#]);
        assert_eq!(extract_session_id(file.path()), None);
        assert_eq!(extract_project_path(file.path()), None);
    }

    #[test]
    fn unparseable_lines_are_skipped() {
        let file = write_log(&["not json", r#"{"sessionId":"ok"}"#]);
        assert_eq!(extract_session_id(file.path()).as_deref(), Some("ok"));
    }

    #[test]
    fn subagent_detected_via_object_source() {
        let file = write_log(&[r#"{"type":"session_meta","payload":{"source":{"kind":"task"}}}"#]);
        assert!(is_codex_subagent(file.path()));
    }

    #[test]
    fn cli_source_is_not_a_subagent() {
        let file = write_log(&[r#"{"type":"session_meta","payload":{"source":"cli"}}"#]);
        assert!(!is_codex_subagent(file.path()));
    }

    #[test]
    fn non_session_meta_first_line_is_not_a_subagent() {
        let file = write_log(&[r#"{"type":"user"}"#]);
        assert!(!is_codex_subagent(file.path()));
    }

    #[test]
    fn exec_source_is_detected() {
        let file = write_log(&[r#"{"type":"session_meta","payload":{"source":"exec"}}"#]);
        assert!(is_codex_exec(file.path()));
    }

    #[test]
    fn cli_source_is_not_exec() {
        let file = write_log(&[r#"{"type":"session_meta","payload":{"source":"cli"}}"#]);
        assert!(!is_codex_exec(file.path()));
    }

    #[test]
    fn estimate_token_count_counts_text_fields() {
        let file = write_log(&[r#"{"type":"user","message":{"content":"abcdefgh"}}"#]);
        assert_eq!(estimate_token_count(file.path()), 2);
    }

    #[test]
    fn estimate_token_count_is_zero_for_empty_log() {
        let file = write_log(&[]);
        assert_eq!(estimate_token_count(file.path()), 0);
    }
}
