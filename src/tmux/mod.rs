//! Tmux driver: a thin, validated wrapper around every invocation of the
//! multiplexer binary.
//!
//! Every function that takes a target or a name runs it through
//! [`crate::validators`] first -- this is the one place in the crate where
//! that validation is load-bearing against argument injection, since the
//! output of these functions is never shell-interpreted but the inputs can
//! originate from a client's websocket message.

pub mod parse;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rand::seq::IndexedRandom;
use tracing::{debug, warn};

use crate::cmd::Cmd;
use crate::config::Config;
use crate::errors::AgentboardError;
use crate::model::{Session, SessionSource, WindowRow};
use crate::time::now_iso;
use crate::validators::{is_valid_session_id, is_valid_tmux_target};

/// Closed vocabulary for randomly-generated window names when the caller
/// supplies neither a name nor a command.
const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "daring", "eager", "feral", "gentle", "hollow", "idle", "jolly",
    "keen", "lucid", "mellow", "nimble", "olive", "plucky", "quiet", "rapid", "solid", "tidy",
];
const NOUNS: &[&str] = &[
    "otter", "falcon", "harbor", "ember", "ridge", "comet", "willow", "badger", "canyon", "drift",
    "heron", "lagoon", "meadow", "nebula", "quartz", "raven", "summit", "thicket", "vapor", "wren",
];

/// Lowest window index new windows are created at (tmux's `base-index`
/// default, kept as a constant rather than queried since this server always
/// creates its own managed session).
const BASE_WINDOW_INDEX: u32 = 0;

/// `tmux -V` must succeed before the server does anything else.
pub fn check_prerequisite() -> Result<(), AgentboardError> {
    Cmd::new("tmux")
        .arg("-V")
        .run()
        .map(|_| ())
        .map_err(|e| AgentboardError::PrerequisiteMissing(e.to_string()))
}

/// Idempotent: creates the managed session if `has-session` reports it's
/// missing.
pub fn ensure_session(name: &str) -> Result<(), AgentboardError> {
    if !is_valid_session_id(name) {
        return Err(AgentboardError::InvalidSessionId(name.to_string()));
    }
    let exists = Cmd::new("tmux")
        .args(["has-session", "-t", name])
        .run_as_check()
        .unwrap_or(false);
    if exists {
        return Ok(());
    }
    Cmd::new("tmux")
        .args(["new-session", "-d", "-s", name])
        .run()
        .map(|_| ())
        .map_err(|e| AgentboardError::SessionCreateFailed(e.to_string()))
}

/// One `list-windows -a -F <fmt>` call across every session on the server,
/// classified into managed/external/dropped. Retries once with the fallback
/// format on an "unknown variable" error from older tmux.
pub fn list_windows(config: &Config) -> Result<Vec<Session>, AgentboardError> {
    let raw = run_list_windows()?;
    let ws_proxy_prefix = config.ws_proxy_prefix();

    let mut sessions = Vec::new();
    for line in raw.lines() {
        let Some(row) = parse::parse_window_line(line) else {
            continue;
        };
        let Some(source) = parse::classify(
            &row,
            &config.tmux_session,
            &config.discover_prefixes,
            &ws_proxy_prefix,
        ) else {
            continue;
        };
        sessions.push(window_row_to_session(row, source));
    }
    Ok(sessions)
}

fn run_list_windows() -> Result<String, AgentboardError> {
    match Cmd::new("tmux")
        .args(["list-windows", "-a", "-F", parse::PREFERRED_FORMAT])
        .run_and_capture_stdout()
    {
        Ok(out) => Ok(out),
        Err(e) => {
            debug!(error = %e, "list-windows with preferred format failed, retrying with fallback");
            Cmd::new("tmux")
                .args(["list-windows", "-a", "-F", parse::FALLBACK_FORMAT])
                .run_and_capture_stdout()
                .map_err(|e| AgentboardError::SessionCreateFailed(e.to_string()))
        }
    }
}

fn window_row_to_session(row: WindowRow, source: SessionSource) -> Session {
    let id = format!("{}:{}", row.session_name, row.window_id);
    let display_name = match source {
        SessionSource::Managed => row.window_name.clone(),
        SessionSource::External => row.session_name.clone(),
    };
    let now = now_iso();
    Session {
        id,
        name: display_name,
        tmux_window: row.window_id,
        project_path: PathBuf::from(row.pane_path),
        status: crate::model::AgentStatus::Unknown,
        last_activity: now.clone(),
        created_at: now,
        agent_type: None,
        source,
        command: if row.start_command.is_empty() {
            None
        } else {
            Some(row.start_command)
        },
    }
}

/// Parameters for [`create_window`].
pub struct CreateWindowParams<'a> {
    pub session: &'a str,
    pub project_path: &'a Path,
    pub name: Option<&'a str>,
    pub command: Option<&'a str>,
    pub existing_managed_names: &'a HashSet<String>,
}

pub fn create_window(params: CreateWindowParams<'_>) -> Result<String, AgentboardError> {
    let resolved_path = expand_home(params.project_path);
    if !resolved_path.is_dir() {
        return Err(AgentboardError::ProjectPathMissing(
            resolved_path.display().to_string(),
        ));
    }

    let base_name = match params.name {
        Some(n) => collapse_whitespace(n),
        None => match params.command {
            Some(_) => random_name(),
            None => random_name(),
        },
    };
    let name = uniquify_name(&base_name, params.existing_managed_names);

    let index = next_free_index(params.session, params.existing_managed_names)?;
    let target = format!("{}:{}", params.session, index);

    let mut cmd = Cmd::new("tmux").args([
        "new-window",
        "-t",
        &target,
        "-n",
        &name,
        "-c",
        &resolved_path.to_string_lossy(),
    ]);
    if let Some(command) = params.command {
        cmd = cmd.arg(command);
    }
    cmd.run()
        .map(|_| name)
        .map_err(|e| AgentboardError::SessionCreateFailed(e.to_string()))
}

fn expand_home(path: &Path) -> PathBuf {
    let Ok(s) = path.to_str().ok_or(()) else {
        return path.to_path_buf();
    };
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = home::home_dir() {
            return home.join(rest);
        }
    } else if s == "~"
        && let Some(home) = home::home_dir()
    {
        return home;
    }
    path.to_path_buf()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn random_name() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("otter");
    format!("{adjective}-{noun}")
}

fn uniquify_name(base: &str, existing: &HashSet<String>) -> String {
    if !existing.contains(base) {
        return base.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{base}-{n}");
        if !existing.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// The first window index at or above [`BASE_WINDOW_INDEX`] not already used
/// by a managed window in `session`.
fn next_free_index(session: &str, existing_managed_names: &HashSet<String>) -> Result<u32, AgentboardError> {
    let _ = existing_managed_names;
    let output = Cmd::new("tmux")
        .args(["list-windows", "-t", session, "-F", "#{window_index}"])
        .run_and_capture_stdout()
        .unwrap_or_default();
    let used: HashSet<u32> = output.lines().filter_map(|l| l.trim().parse().ok()).collect();
    let mut idx = BASE_WINDOW_INDEX;
    while used.contains(&idx) {
        idx += 1;
    }
    Ok(idx)
}

/// Validates `new_name` as `[\w-]+`, checked by the caller against the
/// current managed name set before this runs.
pub fn rename_window(target: &str, new_name: &str) -> Result<(), AgentboardError> {
    if !is_valid_tmux_target(target) {
        return Err(AgentboardError::InvalidTmuxTarget(target.to_string()));
    }
    if new_name.is_empty() || !new_name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
        return Err(AgentboardError::NameNotAllowed(new_name.to_string()));
    }
    Cmd::new("tmux")
        .args(["rename-window", "-t", target, new_name])
        .run()
        .map(|_| ())
        .map_err(|e| AgentboardError::SessionCreateFailed(e.to_string()))
}

pub fn kill_window(target: &str) -> Result<(), AgentboardError> {
    if !is_valid_tmux_target(target) {
        return Err(AgentboardError::InvalidTmuxTarget(target.to_string()));
    }
    Cmd::new("tmux")
        .args(["kill-window", "-t", target])
        .run()
        .map(|_| ())
        .map_err(|e| AgentboardError::SessionCreateFailed(e.to_string()))
}

/// Maximum number of trailing visible rows kept by `capture_pane`.
const CAPTURE_TAIL_ROWS: usize = 30;

/// `capture-pane -t target -p -J`, trailing blank lines trimmed and truncated
/// to the last [`CAPTURE_TAIL_ROWS`] rows. `None` on any failure (the window
/// may have disappeared between listing and capture).
pub fn capture_pane(target: &str) -> Option<String> {
    if !is_valid_tmux_target(target) {
        warn!(target, "refusing to capture an invalid tmux target");
        return None;
    }
    let out = Cmd::new("tmux")
        .args(["capture-pane", "-t", target, "-p", "-J"])
        .run_and_capture_stdout_opt()?;
    Some(trim_and_tail(&out, CAPTURE_TAIL_ROWS))
}

/// Same as [`capture_pane`] but includes scrollback via `-S -<lines>`.
/// `lines` is clamped to >= 1.
pub fn get_terminal_scrollback(target: &str, lines: u32) -> Option<String> {
    if !is_valid_tmux_target(target) {
        warn!(target, "refusing to capture an invalid tmux target");
        return None;
    }
    let lines = lines.max(1);
    let start = format!("-{lines}");
    let out = Cmd::new("tmux")
        .args(["capture-pane", "-t", target, "-p", "-J", "-S", &start])
        .run_and_capture_stdout_opt()?;
    Some(out)
}

fn trim_and_tail(captured: &str, max_rows: usize) -> String {
    let trimmed = captured.trim_end_matches(['\n', '\r']);
    let lines: Vec<&str> = trimmed.lines().collect();
    if lines.len() <= max_rows {
        return trimmed.to_string();
    }
    lines[lines.len() - max_rows..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniquify_name_appends_suffix_on_collision() {
        let mut existing = HashSet::new();
        existing.insert("feature".to_string());
        assert_eq!(uniquify_name("feature", &existing), "feature-2");
        existing.insert("feature-2".to_string());
        assert_eq!(uniquify_name("feature", &existing), "feature-3");
    }

    #[test]
    fn uniquify_name_passes_through_when_free() {
        let existing = HashSet::new();
        assert_eq!(uniquify_name("feature", &existing), "feature");
    }

    #[test]
    fn collapse_whitespace_collapses_runs() {
        assert_eq!(collapse_whitespace("  hello   world  "), "hello world");
    }

    #[test]
    fn trim_and_tail_keeps_last_n_rows() {
        let captured = (0..50).map(|i| format!("line{i}")).collect::<Vec<_>>().join("\n");
        let tailed = trim_and_tail(&captured, CAPTURE_TAIL_ROWS);
        assert_eq!(tailed.lines().count(), CAPTURE_TAIL_ROWS);
        assert!(tailed.ends_with("line49"));
    }

    #[test]
    fn trim_and_tail_trims_trailing_blank_lines() {
        let captured = "hello\nworld\n\n\n";
        assert_eq!(trim_and_tail(captured, CAPTURE_TAIL_ROWS), "hello\nworld");
    }

    #[test]
    fn random_name_is_adjective_noun_pair() {
        let name = random_name();
        assert_eq!(name.split('-').count(), 2);
    }
}
