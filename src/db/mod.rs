//! Session database: SQLite persistence of durable
//! `AgentSession` records. The sole writer of these rows -- the refresh
//! worker and the registry never touch this table directly.
//!
//! Grounded on `workmux`'s habit of defensive, idempotent setup
//! (`tmux::ensure_session`, `Multiplexer::ensure_status_format`'s
//! "only touch it if not already present" check): schema creation and the
//! legacy-table migration both run unconditionally and are no-ops when
//! already applied.

mod queries;

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::Connection;

pub use queries::{NewAgentSession, SessionFilter};

use crate::errors::AgentboardError;
use crate::model::{AgentSession, AgentSessionPatch};

pub struct SessionDatabase {
    conn: Mutex<Connection>,
}

impl SessionDatabase {
    /// Open (creating if absent) the database at `path`. The containing
    /// directory is created with owner-only permissions.
    pub fn open(path: &Path) -> Result<Self, AgentboardError> {
        if let Some(parent) = path.parent() {
            create_dir_owner_only(parent).map_err(|e| AgentboardError::DatabaseUnavailable {
                path: path.to_path_buf(),
                source: e,
            })?;
        }
        let conn = Connection::open(path).map_err(|e| AgentboardError::DatabaseUnavailable {
            path: path.to_path_buf(),
            source: e.into(),
        })?;
        migrate_legacy_table(&conn).map_err(|e| AgentboardError::DatabaseUnavailable {
            path: path.to_path_buf(),
            source: e,
        })?;
        create_schema(&conn).map_err(|e| AgentboardError::DatabaseUnavailable {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        create_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn insert_session(&self, new: NewAgentSession) -> Result<AgentSession> {
        let conn = self.conn.lock().expect("db lock poisoned");
        queries::insert_session(&conn, new)
    }

    pub fn update_session(&self, id: i64, patch: AgentSessionPatch) -> Result<()> {
        let conn = self.conn.lock().expect("db lock poisoned");
        queries::update_session(&conn, id, patch)
    }

    pub fn get_session_by_id(&self, session_id: &str) -> Result<Option<AgentSession>> {
        let conn = self.conn.lock().expect("db lock poisoned");
        queries::get_session(&conn, SessionFilter::SessionId(session_id))
    }

    pub fn get_session_by_log_path(&self, log_path: &Path) -> Result<Option<AgentSession>> {
        let conn = self.conn.lock().expect("db lock poisoned");
        queries::get_session(&conn, SessionFilter::LogPath(log_path))
    }

    pub fn get_session_by_window(&self, window: &str) -> Result<Option<AgentSession>> {
        let conn = self.conn.lock().expect("db lock poisoned");
        queries::get_session(&conn, SessionFilter::Window(window))
    }

    pub fn get_active_sessions(&self) -> Result<Vec<AgentSession>> {
        let conn = self.conn.lock().expect("db lock poisoned");
        queries::get_active_sessions(&conn)
    }

    pub fn get_inactive_sessions(&self) -> Result<Vec<AgentSession>> {
        let conn = self.conn.lock().expect("db lock poisoned");
        queries::get_inactive_sessions(&conn)
    }

    pub fn get_pinned_orphans(&self) -> Result<Vec<AgentSession>> {
        let conn = self.conn.lock().expect("db lock poisoned");
        queries::get_pinned_orphans(&conn)
    }

    pub fn orphan_session(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("db lock poisoned");
        queries::orphan_session(&conn, id)
    }

    /// No background threads or connections to release beyond the
    /// underlying `rusqlite::Connection`, which closes on drop; kept as an
    /// explicit, named lifecycle step.
    pub fn close(self) {
        drop(self);
    }
}

#[cfg(unix)]
fn create_dir_owner_only(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
        .with_context(|| format!("setting owner-only permissions on {}", dir.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn create_dir_owner_only(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    Ok(())
}

const CREATE_TABLE_SQL: &str = "
CREATE TABLE IF NOT EXISTS agent_sessions (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id          TEXT NOT NULL UNIQUE,
    log_file_path       TEXT NOT NULL UNIQUE,
    project_path        TEXT NOT NULL,
    agent_type          TEXT NOT NULL CHECK (agent_type IN ('claude', 'codex')),
    display_name        TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    last_activity_at    TEXT NOT NULL,
    current_window      TEXT,
    is_pinned           INTEGER NOT NULL DEFAULT 0,
    last_resume_error   TEXT,
    last_known_log_size INTEGER NOT NULL DEFAULT 0,
    is_codex_exec       INTEGER NOT NULL DEFAULT 0
);
";

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_TABLE_SQL)?;
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_agent_sessions_session_id ON agent_sessions(session_id);
         CREATE INDEX IF NOT EXISTS idx_agent_sessions_log_file_path ON agent_sessions(log_file_path);
         CREATE INDEX IF NOT EXISTS idx_agent_sessions_current_window ON agent_sessions(current_window);",
    )?;
    Ok(())
}

/// One-shot migration: if a legacy `agent_sessions` table still carries a
/// `session_source` column, rename it aside, recreate the current schema,
/// and copy over only the rows where `session_source = 'log'`.
fn migrate_legacy_table(conn: &Connection) -> Result<()> {
    let has_legacy_column: bool = conn
        .prepare("SELECT 1 FROM pragma_table_info('agent_sessions') WHERE name = 'session_source'")
        .ok()
        .and_then(|mut stmt| stmt.exists([]).ok())
        .unwrap_or(false);

    if !has_legacy_column {
        return Ok(());
    }

    conn.execute_batch("ALTER TABLE agent_sessions RENAME TO agent_sessions_legacy;")?;
    create_schema(conn)?;
    conn.execute_batch(
        "INSERT INTO agent_sessions
            (session_id, log_file_path, project_path, agent_type, display_name,
             created_at, last_activity_at, current_window, is_pinned,
             last_resume_error, last_known_log_size, is_codex_exec)
         SELECT session_id, log_file_path, project_path, agent_type, display_name,
                created_at, last_activity_at, current_window, is_pinned,
                last_resume_error, last_known_log_size, is_codex_exec
         FROM agent_sessions_legacy
         WHERE session_source = 'log';",
    )?;
    conn.execute_batch("DROP TABLE agent_sessions_legacy;")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AgentKind;
    use std::path::PathBuf;

    fn sample(session_id: &str, log_path: &str) -> NewAgentSession {
        NewAgentSession {
            session_id: session_id.to_string(),
            log_file_path: PathBuf::from(log_path),
            project_path: PathBuf::from("/repo"),
            agent_type: AgentKind::Claude,
            display_name: "feature-x".to_string(),
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
            last_activity_at: "2026-01-01T00:00:00.000Z".to_string(),
            current_window: None,
            last_known_log_size: 0,
            is_codex_exec: false,
        }
    }

    #[test]
    fn insert_and_fetch_round_trips() {
        let db = SessionDatabase::open_in_memory().unwrap();
        let inserted = db.insert_session(sample("s1", "/logs/s1.jsonl")).unwrap();
        assert_eq!(inserted.session_id, "s1");

        let fetched = db.get_session_by_id("s1").unwrap().unwrap();
        assert_eq!(fetched.log_file_path, PathBuf::from("/logs/s1.jsonl"));
    }

    #[test]
    fn update_session_only_touches_provided_fields() {
        let db = SessionDatabase::open_in_memory().unwrap();
        let inserted = db.insert_session(sample("s1", "/logs/s1.jsonl")).unwrap();

        db.update_session(
            inserted.id,
            AgentSessionPatch {
                display_name: Some("renamed".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        let fetched = db.get_session_by_id("s1").unwrap().unwrap();
        assert_eq!(fetched.display_name, "renamed");
        assert_eq!(fetched.project_path, PathBuf::from("/repo"));
    }

    #[test]
    fn orphan_session_clears_current_window() {
        let db = SessionDatabase::open_in_memory().unwrap();
        let inserted = db.insert_session(sample("s1", "/logs/s1.jsonl")).unwrap();
        db.update_session(
            inserted.id,
            AgentSessionPatch {
                current_window: Some(Some("agentboard:@1".to_string())),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(db.get_active_sessions().unwrap().len(), 1);

        db.orphan_session(inserted.id).unwrap();
        assert_eq!(db.get_active_sessions().unwrap().len(), 0);
        assert_eq!(db.get_inactive_sessions().unwrap().len(), 1);
    }

    #[test]
    fn session_id_and_log_path_are_unique() {
        let db = SessionDatabase::open_in_memory().unwrap();
        db.insert_session(sample("s1", "/logs/s1.jsonl")).unwrap();
        assert!(db.insert_session(sample("s1", "/logs/other.jsonl")).is_err());
        assert!(db.insert_session(sample("s2", "/logs/s1.jsonl")).is_err());
    }

    #[test]
    fn pinned_orphans_are_returned() {
        let db = SessionDatabase::open_in_memory().unwrap();
        let inserted = db.insert_session(sample("s1", "/logs/s1.jsonl")).unwrap();
        assert!(db.get_pinned_orphans().unwrap().is_empty());

        db.update_session(
            inserted.id,
            AgentSessionPatch {
                is_pinned: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(db.get_pinned_orphans().unwrap().len(), 1);
    }
}
