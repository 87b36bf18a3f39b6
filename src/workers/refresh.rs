//! Session refresh worker, grounded on
//! `workmux::command::dashboard::monitor::AgentMonitor`'s tick loop: one
//! bulk `list-windows` call, a per-window pane capture and status diff
//! against an owned cache, then a single registry swap.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::Config;
use crate::matcher::prompts::extract_user_prompts;
use crate::model::Session;
use crate::registry::SessionRegistry;
use crate::status::{self, PaneCacheEntry};
use crate::time::now_iso;
use crate::tmux;

/// Scrollback depth used to service `get_last_user_message`.
const LAST_USER_MESSAGE_SCROLLBACK_LINES: u32 = 200;

pub struct RefreshWorker {
    config: Config,
    registry: std::sync::Arc<SessionRegistry>,
    pane_cache: Mutex<HashMap<String, PaneCacheEntry>>,
}

impl RefreshWorker {
    pub fn new(config: Config, registry: std::sync::Arc<SessionRegistry>) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            config,
            registry,
            pane_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Runs the periodic tick loop on its own task until the process exits.
    pub fn spawn(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(self.config.refresh_interval_ms));
            loop {
                interval.tick().await;
                self.tick().await;
            }
        })
    }

    async fn tick(self: &std::sync::Arc<Self>) {
        let worker = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || worker.tick_blocking()).await {
            warn!(error = %e, "refresh worker tick panicked");
        }
    }

    /// Forces an out-of-band tick, used by the broker's `session-refresh`
    /// message and by the poll worker after a session-create/kill so the
    /// registry doesn't wait for the next interval to catch up.
    pub async fn trigger(self: &std::sync::Arc<Self>) {
        self.tick().await;
    }

    fn tick_blocking(&self) {
        let windows = match tmux::list_windows(&self.config) {
            Ok(windows) => windows,
            Err(e) => {
                warn!(error = %e, "refresh worker: list_windows failed, skipping tick");
                return;
            }
        };

        let now = Instant::now();
        let mut cache = self.pane_cache.lock().expect("pane cache lock poisoned");
        let mut assembled = Vec::with_capacity(windows.len());

        for session in windows {
            let prior = self.registry.get(&session.id);
            let raw_capture = tmux::capture_pane(&session.id).unwrap_or_default();
            let previous_entry = cache.get(&session.id);
            let (session, entry) = assemble_session(session, prior.as_ref(), previous_entry, &raw_capture, now);
            cache.insert(entry_key(&session), entry);
            assembled.push(session);
        }

        let live_ids: std::collections::HashSet<&str> = assembled.iter().map(|s| s.id.as_str()).collect();
        cache.retain(|id, _| live_ids.contains(id.as_str()));
        drop(cache);

        self.registry.replace_sessions(assembled);
    }

    /// Services `get_last_user_message`: a bounded scrollback capture plus the
    /// most recently extracted prompt, or `None`.
    pub async fn get_last_user_message(target: &str) -> Option<String> {
        let target = target.to_string();
        tokio::task::spawn_blocking(move || {
            let scrollback = tmux::get_terminal_scrollback(&target, LAST_USER_MESSAGE_SCROLLBACK_LINES)?;
            extract_user_prompts(&scrollback).into_iter().next_back()
        })
        .await
        .ok()
        .flatten()
    }
}

fn entry_key(session: &Session) -> String {
    session.id.clone()
}

/// Pure per-window assembly step: derives pane
/// dimensions from the shape of the capture itself (the tmux driver does not
/// currently thread pane width/height through `Session`), infers status, and
/// carries forward `created_at`/`last_activity` from the prior registry
/// entry except where this tick observed fresh activity.
fn assemble_session(
    mut session: Session,
    prior: Option<&Session>,
    previous_cache: Option<&PaneCacheEntry>,
    raw_capture: &str,
    now: Instant,
) -> (Session, PaneCacheEntry) {
    let rows = raw_capture.lines().count().max(1) as u16;
    let cols = raw_capture.lines().map(|l| l.chars().count()).max().unwrap_or(1).max(1) as u16;

    let (status, last_changed, entry) =
        status::infer_status(previous_cache, raw_capture, cols, rows, now, status::DEFAULT_WORKING_GRACE);
    session.status = status;

    if let Some(prior) = prior {
        session.created_at = prior.created_at.clone();
    }

    session.last_activity = if last_changed == now {
        now_iso()
    } else if let Some(prior) = prior {
        prior.last_activity.clone()
    } else {
        now_iso()
    };

    (session, entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentStatus, SessionSource};
    use std::path::PathBuf;

    fn skeleton(id: &str) -> Session {
        Session {
            id: id.to_string(),
            name: "test".to_string(),
            tmux_window: "@1".to_string(),
            project_path: PathBuf::from("/repo"),
            status: AgentStatus::Unknown,
            last_activity: "2026-01-01T00:00:00.000Z".to_string(),
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
            agent_type: None,
            source: SessionSource::Managed,
            command: None,
        }
    }

    #[test]
    fn first_sighting_is_unknown_and_stamps_created_at_now() {
        let now = Instant::now();
        let (session, entry) = assemble_session(skeleton("a"), None, None, "hello", now);
        assert_eq!(session.status, AgentStatus::Unknown);
        assert_eq!(entry.status, AgentStatus::Unknown);
    }

    #[test]
    fn created_at_is_carried_forward_from_prior() {
        let now = Instant::now();
        let mut prior = skeleton("a");
        prior.created_at = "2020-01-01T00:00:00.000Z".to_string();
        let (session, _) = assemble_session(skeleton("a"), Some(&prior), None, "hello", now);
        assert_eq!(session.created_at, "2020-01-01T00:00:00.000Z");
    }

    #[test]
    fn unchanged_content_past_grace_preserves_prior_last_activity() {
        let earlier = Instant::now();
        let later = earlier + status::DEFAULT_WORKING_GRACE + Duration::from_secs(1);
        let previous_cache = PaneCacheEntry {
            normalized_content: "same content".to_string(),
            cols: "same content".lines().map(|l| l.chars().count()).max().unwrap_or(1).max(1) as u16,
            rows: 1,
            last_changed: earlier,
            status: AgentStatus::Working,
        };
        let mut prior = skeleton("a");
        prior.last_activity = "2025-06-01T00:00:00.000Z".to_string();

        let (session, _) = assemble_session(
            skeleton("a"),
            Some(&prior),
            Some(&previous_cache),
            "same content",
            later,
        );
        assert_eq!(session.status, AgentStatus::Waiting);
        assert_eq!(session.last_activity, "2025-06-01T00:00:00.000Z");
    }

    #[test]
    fn changed_content_refreshes_last_activity() {
        let earlier = Instant::now();
        let later = earlier + Duration::from_secs(1);
        let previous_cache = PaneCacheEntry {
            normalized_content: "old".to_string(),
            cols: 3,
            rows: 1,
            last_changed: earlier,
            status: AgentStatus::Waiting,
        };
        let mut prior = skeleton("a");
        prior.last_activity = "2025-06-01T00:00:00.000Z".to_string();

        let (session, _) = assemble_session(skeleton("a"), Some(&prior), Some(&previous_cache), "new", later);
        assert_eq!(session.status, AgentStatus::Working);
        assert_ne!(session.last_activity, "2025-06-01T00:00:00.000Z");
    }
}
