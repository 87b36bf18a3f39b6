//! Session registry: the in-memory authoritative view of currently-visible
//! windows, generalizing `workmux::state::persist_agent_update`'s
//! merge-without-clobbering idea into an async fan-out over
//! `tokio::sync::broadcast` instead of a read-back-from-disk file store.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::debug;

use crate::model::{Session, SessionPatch};

/// Bounded channel capacity for registry events; a slow listener drops the
/// oldest events rather than stalling the registry.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Sessions(Vec<Session>),
    SessionUpdate(Session),
    SessionRemoved(String),
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sessions: Mutex::new(HashMap::new()),
            events: tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Atomic swap: for each surviving ID, preserve the later of the
    /// existing `last_activity` vs. the incoming one, so two data sources
    /// that agree on identity but disagree on recency don't clobber each
    /// other's timestamp.
    pub fn replace_sessions(&self, next: Vec<Session>) {
        let removed_ids;
        let merged;
        {
            let mut sessions = self.sessions.lock().expect("registry lock poisoned");
            let previous: HashMap<String, Session> = std::mem::take(&mut *sessions);

            merged = next
                .into_iter()
                .map(|mut incoming| {
                    if let Some(existing) = previous.get(&incoming.id)
                        && existing.last_activity > incoming.last_activity
                    {
                        incoming.last_activity = existing.last_activity.clone();
                    }
                    (incoming.id.clone(), incoming)
                })
                .collect::<HashMap<_, _>>();

            removed_ids = previous
                .keys()
                .filter(|id| !merged.contains_key(*id))
                .cloned()
                .collect::<Vec<_>>();

            *sessions = merged.clone();
        }

        let snapshot: Vec<Session> = merged.into_values().collect();
        let _ = self.events.send(RegistryEvent::Sessions(snapshot));
        for id in removed_ids {
            let _ = self.events.send(RegistryEvent::SessionRemoved(id));
        }
    }

    /// Merge `patch` into the existing entry, emitting a single
    /// `session-update`. No-op if `id` is no longer present.
    pub fn update_session(&self, id: &str, patch: SessionPatch) {
        let updated = {
            let mut sessions = self.sessions.lock().expect("registry lock poisoned");
            match sessions.get_mut(id) {
                Some(session) => {
                    session.apply_patch(patch);
                    Some(session.clone())
                }
                None => {
                    debug!(session_id = id, "update_session: no-op, session no longer present");
                    None
                }
            }
        };
        if let Some(session) = updated {
            let _ = self.events.send(RegistryEvent::SessionUpdate(session));
        }
    }

    /// Insert a brand new session (e.g. from `session-create`), emitting it
    /// as a `session-update` -- the broker layer decides whether to re-label
    /// it `session-created` for first-seen IDs.
    pub fn insert(&self, session: Session) {
        let mut sessions = self.sessions.lock().expect("registry lock poisoned");
        sessions.insert(session.id.clone(), session.clone());
        drop(sessions);
        let _ = self.events.send(RegistryEvent::SessionUpdate(session));
    }

    pub fn get_all(&self) -> Vec<Session> {
        self.sessions.lock().expect("registry lock poisoned").values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.lock().expect("registry lock poisoned").get(id).cloned()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentStatus, SessionSource};
    use std::path::PathBuf;

    fn session(id: &str, last_activity: &str) -> Session {
        Session {
            id: id.to_string(),
            name: "test".to_string(),
            tmux_window: "@1".to_string(),
            project_path: PathBuf::from("/repo"),
            status: AgentStatus::Unknown,
            last_activity: last_activity.to_string(),
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
            agent_type: None,
            source: SessionSource::Managed,
            command: None,
        }
    }

    #[test]
    fn replace_sessions_preserves_latest_activity() {
        let registry = SessionRegistry::new();
        registry.replace_sessions(vec![session("a", "2026-01-01T00:00:05.000Z")]);
        registry.replace_sessions(vec![session("a", "2026-01-01T00:00:01.000Z")]);
        let got = registry.get("a").unwrap();
        assert_eq!(got.last_activity, "2026-01-01T00:00:05.000Z");
    }

    #[test]
    fn replace_sessions_adopts_newer_activity() {
        let registry = SessionRegistry::new();
        registry.replace_sessions(vec![session("a", "2026-01-01T00:00:01.000Z")]);
        registry.replace_sessions(vec![session("a", "2026-01-01T00:00:05.000Z")]);
        let got = registry.get("a").unwrap();
        assert_eq!(got.last_activity, "2026-01-01T00:00:05.000Z");
    }

    #[test]
    fn replace_sessions_emits_removed_for_dropped_ids() {
        let registry = SessionRegistry::new();
        let mut rx = registry.subscribe();
        registry.replace_sessions(vec![session("a", "t"), session("b", "t")]);
        let _ = rx.try_recv().unwrap();
        registry.replace_sessions(vec![session("a", "t")]);
        let _sessions_event = rx.try_recv().unwrap();
        match rx.try_recv().unwrap() {
            RegistryEvent::SessionRemoved(id) => assert_eq!(id, "b"),
            other => panic!("expected SessionRemoved, got {other:?}"),
        }
    }

    #[test]
    fn update_session_is_noop_for_missing_id() {
        let registry = SessionRegistry::new();
        registry.update_session("missing", SessionPatch::default());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn update_session_merges_patch_fields() {
        let registry = SessionRegistry::new();
        registry.insert(session("a", "t"));
        registry.update_session(
            "a",
            SessionPatch {
                status: Some(AgentStatus::Working),
                ..Default::default()
            },
        );
        let got = registry.get("a").unwrap();
        assert_eq!(got.status, AgentStatus::Working);
        assert_eq!(got.name, "test");
    }
}
