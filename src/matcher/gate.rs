//! Log poll gate: a cheap filter deciding which logs even need a
//! (potentially expensive) matching pass.

use std::path::{Path, PathBuf};

/// Sentinel token count meaning "enrichment skipped, metadata came from a
/// cached persisted record".
pub const ENRICHMENT_SKIPPED: i64 = -1;

/// Sentinel project path representing the always-headless codex-exec case.
pub const CODEX_EXEC_SENTINEL: &str = "<codex-exec>";

/// Below this token count a log isn't real content yet; the poll worker
/// records it in the empty-log cache instead of persisting it.
pub const DEFAULT_MIN_TOKEN_COUNT: i64 = 10;

/// One candidate log, flattened for the gate.
#[derive(Debug, Clone)]
pub struct LogSnapshot {
    pub log_path: PathBuf,
    pub session_id: Option<String>,
    pub project_path: Option<String>,
    pub is_codex_exec: bool,
    pub token_count: i64,
    pub size: u64,
}

/// The subset of a persisted `AgentSession` row the gate needs.
#[derive(Debug, Clone)]
pub struct PersistedRow {
    pub session_id: String,
    pub log_file_path: PathBuf,
    pub current_window: Option<String>,
    pub last_activity_at: String,
    pub last_known_log_size: i64,
}

#[derive(Debug, Clone)]
pub struct GateOptions {
    pub min_token_count: i64,
    /// Exact-equality or trailing-`*`-prefix skip patterns for project paths,
    /// case-insensitive, forward-slash normalized, plus the codex-exec sentinel.
    pub skip_patterns: Vec<String>,
}

impl Default for GateOptions {
    fn default() -> Self {
        Self {
            min_token_count: DEFAULT_MIN_TOKEN_COUNT,
            skip_patterns: Vec::new(),
        }
    }
}

fn normalize_path_for_skip(p: &str) -> String {
    p.replace('\\', "/").to_lowercase()
}

fn matches_skip_pattern(project_path: &str, pattern: &str) -> bool {
    let project_path = normalize_path_for_skip(project_path);
    let pattern = normalize_path_for_skip(pattern);
    if let Some(prefix) = pattern.strip_suffix('*') {
        project_path.starts_with(&prefix)
    } else {
        project_path == pattern
    }
}

fn is_skipped(project_path: Option<&str>, is_codex_exec: bool, patterns: &[String]) -> bool {
    if is_codex_exec && patterns.iter().any(|p| p == CODEX_EXEC_SENTINEL) {
        return true;
    }
    let Some(project_path) = project_path else {
        return false;
    };
    patterns.iter().any(|p| matches_skip_pattern(project_path, p))
}

/// Returns the subset of `entries` warranting a matching pass, applying
/// every skip rule in order.
pub fn get_entries_needing_match<'a>(
    entries: &'a [LogSnapshot],
    persisted: &[PersistedRow],
    opts: &GateOptions,
) -> Vec<&'a LogSnapshot> {
    entries
        .iter()
        .filter(|entry| entry.session_id.is_some())
        .filter(|entry| !entry.is_codex_exec)
        .filter(|entry| entry.token_count == ENRICHMENT_SKIPPED || entry.token_count >= opts.min_token_count)
        .filter(|entry| {
            let session_id = entry.session_id.as_deref().unwrap();
            match persisted.iter().find(|row| row.session_id == session_id) {
                None => true,
                Some(row) if row.current_window.is_some() => false,
                Some(row) => {
                    if is_skipped(entry.project_path.as_deref(), entry.is_codex_exec, &opts.skip_patterns) {
                        return false;
                    }
                    row.last_known_log_size != entry.size
                }
            }
        })
        .collect()
}

pub fn should_run_matching(entries: &[LogSnapshot], sessions: &[PersistedRow], opts: &GateOptions) -> bool {
    !get_entries_needing_match(entries, sessions, opts).is_empty()
}

/// Find the persisted row, if any, whose `log_file_path` equals `path`.
pub fn find_by_log_path<'a>(rows: &'a [PersistedRow], path: &Path) -> Option<&'a PersistedRow> {
    rows.iter().find(|r| r.log_file_path == path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(session_id: Option<&str>, size: u64, tokens: i64) -> LogSnapshot {
        LogSnapshot {
            log_path: PathBuf::from(format!("/logs/{}.jsonl", session_id.unwrap_or("none"))),
            session_id: session_id.map(String::from),
            project_path: Some("/repo".to_string()),
            is_codex_exec: false,
            token_count: tokens,
            size,
        }
    }

    #[test]
    fn drops_entries_with_no_session_id() {
        let entries = vec![snapshot(None, 100, 50)];
        assert!(get_entries_needing_match(&entries, &[], &GateOptions::default()).is_empty());
    }

    #[test]
    fn drops_codex_exec_entries() {
        let mut entry = snapshot(Some("s1"), 100, 50);
        entry.is_codex_exec = true;
        assert!(get_entries_needing_match(&[entry], &[], &GateOptions::default()).is_empty());
    }

    #[test]
    fn drops_low_token_entries_unless_enrichment_skipped() {
        let low = snapshot(Some("s1"), 100, 5);
        assert!(get_entries_needing_match(&[low], &[], &GateOptions::default()).is_empty());

        let skipped = snapshot(Some("s1"), 100, ENRICHMENT_SKIPPED);
        assert_eq!(get_entries_needing_match(&[skipped], &[], &GateOptions::default()).len(), 1);
    }

    #[test]
    fn new_session_with_no_persisted_row_is_included() {
        let entry = snapshot(Some("new-session"), 100, 50);
        assert_eq!(get_entries_needing_match(&[entry], &[], &GateOptions::default()).len(), 1);
    }

    #[test]
    fn session_with_current_window_is_excluded() {
        let entry = snapshot(Some("s1"), 500, 50);
        let rows = vec![PersistedRow {
            session_id: "s1".to_string(),
            log_file_path: PathBuf::from("/logs/s1.jsonl"),
            current_window: Some("agentboard:@1".to_string()),
            last_activity_at: String::new(),
            last_known_log_size: 500,
        }];
        assert!(get_entries_needing_match(&[entry], &rows, &GateOptions::default()).is_empty());
    }

    #[test]
    fn orphan_session_included_only_if_size_changed() {
        let rows = vec![PersistedRow {
            session_id: "s1".to_string(),
            log_file_path: PathBuf::from("/logs/s1.jsonl"),
            current_window: None,
            last_activity_at: String::new(),
            last_known_log_size: 500,
        }];

        let unchanged = snapshot(Some("s1"), 500, 50);
        assert!(get_entries_needing_match(&[unchanged], &rows, &GateOptions::default()).is_empty());

        let changed = snapshot(Some("s1"), 600, 50);
        assert_eq!(get_entries_needing_match(&[changed], &rows, &GateOptions::default()).len(), 1);
    }

    #[test]
    fn skip_pattern_suppresses_orphan_rematch() {
        let rows = vec![PersistedRow {
            session_id: "s1".to_string(),
            log_file_path: PathBuf::from("/logs/s1.jsonl"),
            current_window: None,
            last_activity_at: String::new(),
            last_known_log_size: 500,
        }];
        let changed = snapshot(Some("s1"), 600, 50);
        let opts = GateOptions {
            min_token_count: 10,
            skip_patterns: vec!["/repo*".to_string()],
        };
        assert!(get_entries_needing_match(&[changed], &rows, &opts).is_empty());
    }

    #[test]
    fn codex_exec_sentinel_suppresses_headless_orphans() {
        let rows = vec![PersistedRow {
            session_id: "s1".to_string(),
            log_file_path: PathBuf::from("/logs/s1.jsonl"),
            current_window: None,
            last_activity_at: String::new(),
            last_known_log_size: 500,
        }];
        let mut changed = snapshot(Some("s1"), 600, 50);
        changed.is_codex_exec = false; // gate rule 2 already drops true codex-exec; this models a headless orphan by path
        changed.project_path = Some(CODEX_EXEC_SENTINEL.to_string());
        let opts = GateOptions {
            min_token_count: 10,
            skip_patterns: vec![CODEX_EXEC_SENTINEL.to_string()],
        };
        assert!(get_entries_needing_match(&[changed], &rows, &opts).is_empty());
    }

    #[test]
    fn should_run_matching_reflects_emptiness() {
        assert!(!should_run_matching(&[], &[], &GateOptions::default()));
        let entry = snapshot(Some("s1"), 100, 50);
        assert!(should_run_matching(&[entry], &[], &GateOptions::default()));
    }
}
