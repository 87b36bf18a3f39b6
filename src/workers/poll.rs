//! Log poll worker: the periodic pass correlating on-disk JSONL conversation
//! logs with live tmux windows, generalizing
//! `workmux::command::dashboard::monitor::AgentMonitor`'s single-bulk-call,
//! diff-against-owned-cache tick shape to a second, independent data source
//! (the filesystem) feeding the same registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db::{NewAgentSession, SessionDatabase};
use crate::matcher::gate::{self, GateOptions, LogSnapshot, PersistedRow, ENRICHMENT_SKIPPED};
use crate::matcher::rg::{RealRgRunner, RgRunner, SearchScope};
use crate::matcher::{self, WindowCandidate};
use crate::matcher::prompts::extract_user_prompts;
use crate::model::{AgentSession, AgentSessionPatch, Session, SessionPatch, SessionSource};
use crate::paths;
use crate::registry::SessionRegistry;
use crate::time::now_iso;
use crate::tmux;

/// Upper bound on how many candidate logs a single tick will enrich and feed
/// to the matcher, sorted by mtime descending so the freshest logs are never
/// starved by a large, mostly-idle log directory.
const MAX_CANDIDATES_PER_TICK: usize = 25;

/// Scrollback depth captured per live window to extract candidate prompts.
/// Deeper than the refresh worker's single-last-message capture since the
/// matcher needs the window's whole recent conversation.
const POLL_SCROLLBACK_LINES: u32 = 1000;

/// Minimum time between repeated matching attempts for the same orphaned
/// session, so a log that keeps growing without ever producing a match
/// doesn't burn an `rg` pass every tick.
const REMATCH_COOLDOWN: Duration = Duration::from_secs(60);

pub struct LogPollWorker {
    config: Config,
    registry: Arc<SessionRegistry>,
    db: Arc<SessionDatabase>,
    rg: Box<dyn RgRunner>,
    in_flight: AtomicBool,
    empty_log_cache: Mutex<HashMap<PathBuf, SystemTime>>,
    rematch_cooldown: Mutex<HashMap<String, Instant>>,
}

impl LogPollWorker {
    pub fn new(config: Config, registry: Arc<SessionRegistry>, db: Arc<SessionDatabase>) -> Arc<Self> {
        Self::with_rg(config, registry, db, Box::new(RealRgRunner))
    }

    pub fn with_rg(
        config: Config,
        registry: Arc<SessionRegistry>,
        db: Arc<SessionDatabase>,
        rg: Box<dyn RgRunner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            db,
            rg,
            in_flight: AtomicBool::new(false),
            empty_log_cache: Mutex::new(HashMap::new()),
            rematch_cooldown: Mutex::new(HashMap::new()),
        })
    }

    /// Runs the periodic tick loop until the process exits. A no-op task if
    /// polling is disabled (`AGENTBOARD_LOG_POLL_MS <= 0`).
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let Some(interval_ms) = self.config.log_poll_ms else {
                debug!("log poll worker: disabled, not spawning tick loop");
                return;
            };
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                interval.tick().await;
                self.tick().await;
            }
        })
    }

    /// At-most-one-in-flight guard: a tick still running when the next one
    /// is due is skipped rather than queued.
    pub async fn tick(self: &Arc<Self>) {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            debug!("log poll worker: previous tick still in flight, skipping");
            return;
        }
        let worker = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || worker.tick_blocking()).await {
            warn!(error = %e, "log poll worker tick panicked");
        }
        self.in_flight.store(false, Ordering::SeqCst);
    }

    fn tick_blocking(&self) {
        let started = Instant::now();
        let mut errors = 0u64;
        let mut inserted = 0u64;
        let mut orphaned = 0u64;

        let all_paths = paths::scan_all_log_dirs(&self.config);
        let candidates = self.select_candidates(&all_paths);

        let persisted = match self.load_persisted_rows() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "log poll worker: failed to load persisted sessions, skipping tick");
                return;
            }
        };

        let snapshots: Vec<LogSnapshot> = candidates
            .iter()
            .filter_map(|(path, mtime, size)| self.build_snapshot(path, *mtime, *size, &persisted))
            .collect();

        let needing_match = self.apply_rematch_cooldown(gate::get_entries_needing_match(
            &snapshots,
            &persisted,
            &GateOptions::default(),
        ));

        if needing_match.is_empty() {
            info!(
                scanned = all_paths.len(),
                candidates = snapshots.len(),
                matched = 0,
                inserted = 0,
                orphaned = 0,
                errors = 0,
                duration_ms = started.elapsed().as_millis() as u64,
                "log_poll"
            );
            return;
        }

        let entry_paths: Vec<PathBuf> = needing_match.iter().map(|e| e.log_path.clone()).collect();
        let by_path: HashMap<&Path, &LogSnapshot> =
            needing_match.iter().map(|e| (e.log_path.as_path(), *e)).collect();

        let windows = self.live_window_candidates();
        let matched: Vec<(String, PathBuf)> = if windows.is_empty() {
            Vec::new()
        } else {
            let raw_matches = matcher::match_windows_to_logs(
                &windows,
                SearchScope::Paths(&entry_paths),
                self.rg.as_ref(),
                None,
                None,
            );
            self.apply_agent_and_path_filter(raw_matches, &by_path)
        };

        for (window_id, log_path) in &matched {
            let Some(entry) = by_path.get(log_path.as_path()) else { continue };
            match self.apply_match(window_id, entry, &persisted) {
                Ok(was_inserted) => {
                    if was_inserted {
                        inserted += 1;
                    }
                    if let Some(sid) = entry.session_id.as_deref() {
                        self.rematch_cooldown.lock().expect("cooldown lock poisoned").remove(sid);
                    }
                }
                Err(e) => {
                    errors += 1;
                    warn!(window_id, error = %e, "log poll worker: failed to apply match");
                }
            }
        }

        orphaned += self.resolve_window_collisions(&matched, &persisted).unwrap_or_else(|e| {
            errors += 1;
            warn!(error = %e, "log poll worker: collision resolution failed");
            0
        });

        let matched_paths: std::collections::HashSet<&Path> =
            matched.iter().map(|(_, p)| p.as_path()).collect();
        for entry in &needing_match {
            if matched_paths.contains(entry.log_path.as_path()) {
                continue;
            }
            match self.insert_if_new_unmatched(entry, &persisted) {
                Ok(true) => inserted += 1,
                Ok(false) => {}
                Err(e) => {
                    errors += 1;
                    warn!(error = %e, "log poll worker: failed to insert unmatched new log");
                }
            }
        }

        info!(
            scanned = all_paths.len(),
            candidates = snapshots.len(),
            matched = matched.len(),
            inserted,
            orphaned,
            errors,
            duration_ms = started.elapsed().as_millis() as u64,
            "log_poll"
        );
    }

    /// Step 1: stat every discovered path, drop ones that vanished between
    /// scan and stat, and keep only the freshest [`MAX_CANDIDATES_PER_TICK`].
    fn select_candidates(&self, all_paths: &[PathBuf]) -> Vec<(PathBuf, SystemTime, u64)> {
        let mut stamped: Vec<(PathBuf, SystemTime, u64)> = all_paths
            .iter()
            .filter_map(|p| paths::get_log_times(p).map(|(mtime, _, size)| (p.clone(), mtime, size)))
            .collect();
        stamped.sort_by(|a, b| b.1.cmp(&a.1));
        stamped.truncate(MAX_CANDIDATES_PER_TICK);
        stamped
    }

    fn load_persisted_rows(&self) -> anyhow::Result<Vec<PersistedRow>> {
        let mut rows = self.db.get_active_sessions()?;
        rows.extend(self.db.get_inactive_sessions()?);
        Ok(rows.into_iter().map(to_persisted_row).collect())
    }

    /// Step 2: cheap header extraction, short-circuited by
    /// [`ENRICHMENT_SKIPPED`] for rows the gate would reject regardless of
    /// the real token count, and by `empty_log_cache` -- keyed by the mtime
    /// at which a log was last found to carry too few tokens -- so a log
    /// that never grows isn't re-read and re-counted every tick.
    fn build_snapshot(
        &self,
        path: &Path,
        mtime: SystemTime,
        size: u64,
        persisted: &[PersistedRow],
    ) -> Option<LogSnapshot> {
        {
            let cache = self.empty_log_cache.lock().expect("empty log cache lock poisoned");
            if cache.get(path) == Some(&mtime) {
                return None;
            }
        }

        let session_id = paths::extract_session_id(path)?;

        let is_codex_exec = paths::is_codex_exec(path);
        let project_path = paths::extract_project_path(path);

        let persisted_row = gate::find_by_log_path(persisted, path)
            .or_else(|| persisted.iter().find(|r| r.session_id == session_id));

        let token_count = match persisted_row {
            Some(row) if row.current_window.is_some() && row.last_known_log_size == size => ENRICHMENT_SKIPPED,
            _ => paths::estimate_token_count(path),
        };

        if token_count != ENRICHMENT_SKIPPED && token_count < gate::DEFAULT_MIN_TOKEN_COUNT {
            self.empty_log_cache
                .lock()
                .expect("empty log cache lock poisoned")
                .insert(path.to_path_buf(), mtime);
            return None;
        }
        self.empty_log_cache.lock().expect("empty log cache lock poisoned").remove(path);

        Some(LogSnapshot {
            log_path: path.to_path_buf(),
            session_id: Some(session_id),
            project_path,
            is_codex_exec,
            token_count,
            size,
        })
    }

    /// Step 4's cooldown: orphaned sessions (a persisted row exists with no
    /// `current_window`) are only re-attempted once per [`REMATCH_COOLDOWN`].
    /// Brand new session ids -- no persisted row yet -- are never throttled.
    fn apply_rematch_cooldown<'a>(&self, entries: Vec<&'a LogSnapshot>) -> Vec<&'a LogSnapshot> {
        let now = Instant::now();
        let mut cooldown = self.rematch_cooldown.lock().expect("cooldown lock poisoned");
        entries
            .into_iter()
            .filter(|entry| {
                let Some(sid) = entry.session_id.as_deref() else { return true };
                match cooldown.get(sid) {
                    Some(last) if now.duration_since(*last) < REMATCH_COOLDOWN => false,
                    _ => {
                        cooldown.insert(sid.to_string(), now);
                        true
                    }
                }
            })
            .collect()
    }

    fn live_window_candidates(&self) -> Vec<WindowCandidate> {
        self.registry
            .get_all()
            .into_iter()
            .filter(|s| s.source == SessionSource::Managed)
            .filter_map(|s| {
                let scrollback = tmux::get_terminal_scrollback(&s.id, POLL_SCROLLBACK_LINES)?;
                let prompts = extract_user_prompts(&scrollback);
                if prompts.is_empty() { None } else { Some(WindowCandidate { id: s.id, prompts }) }
            })
            .collect()
    }

    /// Step 5: drop matches the matcher's path-only scope can't itself rule
    /// out -- a log whose declared working directory disagrees with the
    /// window's actual pane path, or whose inferred agent kind disagrees
    /// with the command the window was launched with.
    fn apply_agent_and_path_filter(
        &self,
        raw: HashMap<String, PathBuf>,
        by_path: &HashMap<&Path, &LogSnapshot>,
    ) -> Vec<(String, PathBuf)> {
        raw.into_iter()
            .filter(|(window_id, log_path)| {
                let Some(session) = self.registry.get(window_id) else { return false };
                let Some(entry) = by_path.get(log_path.as_path()) else { return false };
                passes_agent_and_path_filter(&session, entry, &self.config)
            })
            .collect()
    }

    /// Inserts a new `AgentSession` row, or updates the existing one's
    /// `current_window`/activity/size, and mirrors the resolved agent kind
    /// back onto the live `Session` so clients see it without a restart.
    /// Returns `true` if a new row was inserted.
    fn apply_match(&self, window_id: &str, entry: &LogSnapshot, persisted: &[PersistedRow]) -> anyhow::Result<bool> {
        let session_id = entry.session_id.as_deref().expect("gated entries always carry a session id");
        let Some(window) = self.registry.get(window_id) else {
            return Ok(false);
        };
        let agent_kind = paths::infer_agent_type_from_path(&entry.log_path, &self.config);

        let existing = persisted.iter().find(|r| r.session_id == session_id);
        let now = now_iso();

        match existing {
            Some(row) => {
                let current = self.db.get_session_by_id(session_id)?;
                if let Some(current) = current {
                    self.db.update_session(
                        current.id,
                        AgentSessionPatch {
                            current_window: Some(Some(window_id.to_string())),
                            last_activity_at: Some(now),
                            last_known_log_size: Some(entry.size as i64),
                            ..Default::default()
                        },
                    )?;
                }
                let _ = row;
            }
            None => {
                let project_path = entry
                    .project_path
                    .clone()
                    .unwrap_or_else(|| window.project_path.display().to_string());
                self.db.insert_session(NewAgentSession {
                    session_id: session_id.to_string(),
                    log_file_path: entry.log_path.clone(),
                    project_path: PathBuf::from(project_path),
                    agent_type: agent_kind.map(Into::into).unwrap_or(crate::model::AgentKind::Claude),
                    display_name: window.name.clone(),
                    created_at: now.clone(),
                    last_activity_at: now,
                    current_window: Some(window_id.to_string()),
                    last_known_log_size: entry.size as i64,
                    is_codex_exec: entry.is_codex_exec,
                })?;
                info!(window_id, session_id, "on_session_activated");
                return self.mirror_agent_kind(window_id, agent_kind).map(|_| true);
            }
        }

        info!(window_id, session_id, "on_session_activated");
        self.mirror_agent_kind(window_id, agent_kind)?;
        Ok(false)
    }

    /// S6: a log with enough content to be real is persisted as an inactive
    /// `AgentSession` (`current_window = null`) even when no live window
    /// claimed it this tick, so it isn't dropped until something happens to
    /// match it later. No-op if a persisted row for this session already
    /// exists -- this only covers genuinely new sessions.
    fn insert_if_new_unmatched(&self, entry: &LogSnapshot, persisted: &[PersistedRow]) -> anyhow::Result<bool> {
        let session_id = entry.session_id.as_deref().expect("gated entries always carry a session id");
        if persisted.iter().any(|r| r.session_id == session_id) {
            return Ok(false);
        }

        let agent_kind = paths::infer_agent_type_from_path(&entry.log_path, &self.config);
        let project_path = entry.project_path.clone().unwrap_or_default();
        let now = now_iso();
        self.db.insert_session(NewAgentSession {
            session_id: session_id.to_string(),
            log_file_path: entry.log_path.clone(),
            project_path: PathBuf::from(&project_path),
            agent_type: agent_kind.map(Into::into).unwrap_or(crate::model::AgentKind::Claude),
            display_name: derive_display_name(&project_path, session_id),
            created_at: now.clone(),
            last_activity_at: now,
            current_window: None,
            last_known_log_size: entry.size as i64,
            is_codex_exec: entry.is_codex_exec,
        })?;
        info!(session_id, log_path = %entry.log_path.display(), "log poll worker: inserted new inactive session");
        Ok(true)
    }

    fn mirror_agent_kind(
        &self,
        window_id: &str,
        agent_kind: Option<paths::AgentKind>,
    ) -> anyhow::Result<()> {
        if let Some(kind) = agent_kind {
            self.registry.update_session(
                window_id,
                SessionPatch { agent_type: Some(Some(kind.into())), ..Default::default() },
            );
        }
        Ok(())
    }

    /// A persisted row still claiming a window that this tick just
    /// reassigned to a different session is orphaned: the newly-matched
    /// entry wins and the stale claimant loses its window.
    fn resolve_window_collisions(
        &self,
        matched: &[(String, PathBuf)],
        persisted: &[PersistedRow],
    ) -> anyhow::Result<u64> {
        let mut orphaned = 0u64;
        for (window_id, log_path) in matched {
            let Some(entry_session_id) = persisted
                .iter()
                .find(|r| r.log_file_path == *log_path)
                .map(|r| r.session_id.clone())
            else {
                continue;
            };
            for row in persisted {
                if row.session_id != entry_session_id
                    && row.current_window.as_deref() == Some(window_id.as_str())
                {
                    if let Some(stale) = self.db.get_session_by_id(&row.session_id)? {
                        self.db.orphan_session(stale.id)?;
                        orphaned += 1;
                        info!(window_id, session_id = row.session_id.as_str(), "on_session_orphaned");
                    }
                }
            }
        }
        Ok(orphaned)
    }
}

fn to_persisted_row(row: AgentSession) -> PersistedRow {
    PersistedRow {
        session_id: row.session_id,
        log_file_path: row.log_file_path,
        current_window: row.current_window,
        last_activity_at: row.last_activity_at,
        last_known_log_size: row.last_known_log_size,
    }
}

/// Pure step-5 post-filter, split out of the worker for testability: a match
/// survives unless the log's declared project path plainly disagrees with
/// the window's actual pane path, or the window's launch command names an
/// agent whose log root disagrees with where this log actually lives.
fn passes_agent_and_path_filter(session: &Session, entry: &LogSnapshot, config: &Config) -> bool {
    if let Some(declared) = entry.project_path.as_deref()
        && !project_paths_plausibly_match(&session.project_path, declared)
    {
        return false;
    }

    if let Some(command) = session.command.as_deref() {
        let inferred = paths::infer_agent_type_from_path(&entry.log_path, config);
        let expects_codex = command.contains("codex");
        let expects_claude = command.contains("claude");
        match inferred {
            Some(paths::AgentKind::Codex) if expects_claude && !expects_codex => return false,
            Some(paths::AgentKind::Claude) if expects_codex && !expects_claude => return false,
            _ => {}
        }
    }

    true
}

/// Display name for a session discovered before any window named it: the
/// project directory's basename, falling back to the session id itself.
fn derive_display_name(project_path: &str, session_id: &str) -> String {
    Path::new(project_path)
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| session_id.to_string())
}

fn project_paths_plausibly_match(pane_path: &Path, declared: &str) -> bool {
    let pane = pane_path.to_string_lossy().trim_end_matches('/').to_string();
    let declared = declared.trim_end_matches('/');
    pane == declared
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AgentStatus;

    fn session(id: &str, project_path: &str, command: Option<&str>) -> Session {
        Session {
            id: id.to_string(),
            name: "test".to_string(),
            tmux_window: "@1".to_string(),
            project_path: PathBuf::from(project_path),
            status: AgentStatus::Unknown,
            last_activity: "2026-01-01T00:00:00.000Z".to_string(),
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
            agent_type: None,
            source: SessionSource::Managed,
            command: command.map(str::to_string),
        }
    }

    fn entry(project_path: Option<&str>, log_path: &str) -> LogSnapshot {
        LogSnapshot {
            log_path: PathBuf::from(log_path),
            session_id: Some("s1".to_string()),
            project_path: project_path.map(str::to_string),
            is_codex_exec: false,
            token_count: 50,
            size: 100,
        }
    }

    fn config() -> Config {
        Config {
            port: 4040,
            tmux_session: "agentboard".to_string(),
            refresh_interval_ms: 3000,
            log_poll_ms: None,
            discover_prefixes: Vec::new(),
            claude_config_dir: Some(PathBuf::from("/home/u/.claude/projects")),
            codex_home: Some(PathBuf::from("/home/u/.codex/sessions")),
            db_path: PathBuf::from(":memory:"),
            claude_resume_cmd: None,
            codex_resume_cmd: None,
        }
    }

    #[test]
    fn matching_project_path_passes() {
        let session = session("a", "/repo", None);
        let entry = entry(Some("/repo"), "/home/u/.claude/projects/x/a.jsonl");
        assert!(passes_agent_and_path_filter(&session, &entry, &config()));
    }

    #[test]
    fn disagreeing_project_path_is_rejected() {
        let session = session("a", "/repo-one", None);
        let entry = entry(Some("/repo-two"), "/home/u/.claude/projects/x/a.jsonl");
        assert!(!passes_agent_and_path_filter(&session, &entry, &config()));
    }

    #[test]
    fn codex_command_rejects_claude_rooted_log() {
        let session = session("a", "/repo", Some("codex"));
        let entry = entry(Some("/repo"), "/home/u/.claude/projects/x/a.jsonl");
        assert!(!passes_agent_and_path_filter(&session, &entry, &config()));
    }

    #[test]
    fn no_declared_project_path_does_not_block_the_match() {
        let session = session("a", "/repo", None);
        let entry = entry(None, "/home/u/.claude/projects/x/a.jsonl");
        assert!(passes_agent_and_path_filter(&session, &entry, &config()));
    }

    #[test]
    fn trailing_slash_does_not_break_project_path_comparison() {
        assert!(project_paths_plausibly_match(Path::new("/repo"), "/repo/"));
    }

    #[test]
    fn derive_display_name_uses_project_basename() {
        assert_eq!(derive_display_name("/repo/my-project", "s1"), "my-project");
    }

    #[test]
    fn derive_display_name_falls_back_to_session_id_when_path_empty() {
        assert_eq!(derive_display_name("", "s1"), "s1");
    }

    fn worker_with_log_dir(claude_dir: PathBuf) -> (Arc<LogPollWorker>, Arc<SessionDatabase>) {
        let db = Arc::new(SessionDatabase::open_in_memory().unwrap());
        let registry = Arc::new(SessionRegistry::new());
        let mut cfg = config();
        cfg.claude_config_dir = Some(claude_dir);
        cfg.codex_home = Some(PathBuf::from("/does/not/exist"));
        let worker = LogPollWorker::with_rg(
            cfg,
            registry,
            db.clone(),
            Box::new(crate::matcher::rg::fake::FakeRgRunner::default()),
        );
        (worker, db)
    }

    #[test]
    fn new_log_with_enough_content_is_inserted_inactive_with_no_live_window() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("sess-1.jsonl");
        std::fs::write(
            &log_path,
            r#"{"type":"user","sessionId":"sess-1","cwd":"/repo/my-project","message":{"content":"this is a long enough user prompt to clear the insertion token threshold easily"}}"#,
        )
        .unwrap();

        let (worker, db) = worker_with_log_dir(dir.path().to_path_buf());

        worker.tick_blocking();

        let active = db.get_active_sessions().unwrap();
        assert!(active.is_empty());
        let inactive = db.get_inactive_sessions().unwrap();
        assert_eq!(inactive.len(), 1);
        assert_eq!(inactive[0].session_id, "sess-1");
        assert!(inactive[0].current_window.is_none());
        assert_eq!(inactive[0].display_name, "my-project");

        // A second tick over the same, unchanged log must not insert again.
        worker.tick_blocking();
        assert_eq!(db.get_inactive_sessions().unwrap().len(), 1);
    }

    #[test]
    fn low_token_log_is_cached_by_mtime_and_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("sess-2.jsonl");
        std::fs::write(
            &log_path,
            r#"{"type":"user","sessionId":"sess-2","cwd":"/repo/tiny","message":{"content":"hi"}}"#,
        )
        .unwrap();

        let (worker, db) = worker_with_log_dir(dir.path().to_path_buf());

        worker.tick_blocking();
        assert!(db.get_inactive_sessions().unwrap().is_empty());
        assert!(db.get_active_sessions().unwrap().is_empty());

        let mtime = paths::get_log_times(&log_path).unwrap().0;
        assert_eq!(worker.empty_log_cache.lock().unwrap().get(&log_path), Some(&mtime));
    }
}
