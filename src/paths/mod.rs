//! Paths & log discovery.
//!
//! Resolves the OS home directory and per-agent config directories, scans
//! them for `*.jsonl` conversation logs, and extracts header metadata from
//! those logs. Every fallible read here is swallowed into `None` -- the
//! caller decides what "no information" means.

mod jsonl;

pub use jsonl::{
    AgentKind, estimate_token_count, extract_project_path, extract_session_id, get_log_times,
    is_codex_exec, is_codex_subagent,
};

use std::path::{Path, PathBuf};

use crate::config::Config;

/// Claude Code's default log root relative to `$HOME`.
const CLAUDE_DEFAULT_SUBDIR: &str = ".claude/projects";
/// Codex CLI's default log root relative to `$HOME`.
const CODEX_DEFAULT_SUBDIR: &str = ".codex/sessions";

/// Directories named this are skipped entirely during the scan.
const SKIPPED_DIR_NAME: &str = "subagents";

/// Bounded recursion depth per root: 3 levels under the Claude root (which
/// nests by encoded-project-path directory), 4 under Codex's (which nests by
/// year/month/day).
const CLAUDE_MAX_DEPTH: usize = 3;
const CODEX_MAX_DEPTH: usize = 4;

/// Ordered pair of roots to scan: (claude_root, codex_root).
pub fn list_log_search_dirs(config: &Config) -> (PathBuf, PathBuf) {
    let claude_root = config
        .claude_config_dir
        .clone()
        .unwrap_or_else(|| home_dir_or_cwd().join(CLAUDE_DEFAULT_SUBDIR));
    let codex_root = config
        .codex_home
        .clone()
        .unwrap_or_else(|| home_dir_or_cwd().join(CODEX_DEFAULT_SUBDIR));
    (claude_root, codex_root)
}

fn home_dir_or_cwd() -> PathBuf {
    home::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// Deterministic Claude-style directory name for a project path: every path
/// separator is replaced with `-`. Never contains a path separator itself.
pub fn encode_project_path(p: &Path) -> String {
    p.to_string_lossy().replace(['/', '\\'], "-")
}

/// Lazily scan both log roots for `*.jsonl` files, skipping symlinks and any
/// directory named `subagents`, bounded to the per-root depth documented above.
pub fn scan_all_log_dirs(config: &Config) -> Vec<PathBuf> {
    let (claude_root, codex_root) = list_log_search_dirs(config);
    let mut found = Vec::new();
    scan_dir(&claude_root, CLAUDE_MAX_DEPTH, &mut found);
    scan_dir(&codex_root, CODEX_MAX_DEPTH, &mut found);
    found
}

fn scan_dir(root: &Path, max_depth: usize, out: &mut Vec<PathBuf>) {
    if max_depth == 0 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        // `symlink_metadata` does not follow the link, so we can detect and
        // skip symlinks without ever dereferencing them.
        let Ok(meta) = std::fs::symlink_metadata(&path) else {
            continue;
        };
        if meta.file_type().is_symlink() {
            continue;
        }
        if meta.is_dir() {
            if path.file_name().and_then(|n| n.to_str()) == Some(SKIPPED_DIR_NAME) {
                continue;
            }
            scan_dir(&path, max_depth - 1, out);
        } else if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
            out.push(path);
        }
    }
}

/// `claude` | `codex` | `None`, inferred from which root prefix `path` lies under.
pub fn infer_agent_type_from_path(path: &Path, config: &Config) -> Option<AgentKind> {
    let (claude_root, codex_root) = list_log_search_dirs(config);
    if path.starts_with(&claude_root) {
        Some(AgentKind::Claude)
    } else if path.starts_with(&codex_root) {
        Some(AgentKind::Codex)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn encode_project_path_has_no_separators() {
        let encoded = encode_project_path(Path::new("/Users/alice/code/project"));
        assert!(!encoded.contains('/'));
        assert!(!encoded.contains('\\'));
        assert_eq!(encoded, "-Users-alice-code-project");
    }

    #[test]
    fn encode_project_path_is_deterministic() {
        let p = Path::new("/a/b/c");
        assert_eq!(encode_project_path(p), encode_project_path(p));
    }

    #[test]
    fn scan_skips_symlinks_and_subagents_dir() {
        let dir = tempdir().unwrap();
        let claude_root = dir.path().join("claude");
        fs::create_dir_all(&claude_root).unwrap();
        fs::write(claude_root.join("real.jsonl"), "{}").unwrap();

        let subagents = claude_root.join("subagents");
        fs::create_dir_all(&subagents).unwrap();
        fs::write(subagents.join("hidden.jsonl"), "{}").unwrap();

        let mut found = Vec::new();
        scan_dir(&claude_root, CLAUDE_MAX_DEPTH, &mut found);
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("real.jsonl"));
    }

    #[test]
    fn scan_respects_depth_bound() {
        let dir = tempdir().unwrap();
        let mut nested = dir.path().to_path_buf();
        for i in 0..6 {
            nested = nested.join(format!("level{i}"));
        }
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("deep.jsonl"), "{}").unwrap();

        let mut found = Vec::new();
        scan_dir(dir.path(), 3, &mut found);
        assert!(found.is_empty());
    }
}
