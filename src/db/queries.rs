//! CRUD operations on the `agent_sessions` table.

use std::path::{Path, PathBuf};

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::model::{AgentKind, AgentSession, AgentSessionPatch};

/// Fields needed to insert a brand-new `AgentSession` row.
#[derive(Debug, Clone)]
pub struct NewAgentSession {
    pub session_id: String,
    pub log_file_path: PathBuf,
    pub project_path: PathBuf,
    pub agent_type: AgentKind,
    pub display_name: String,
    pub created_at: String,
    pub last_activity_at: String,
    pub current_window: Option<String>,
    pub last_known_log_size: i64,
    pub is_codex_exec: bool,
}

pub enum SessionFilter<'a> {
    SessionId(&'a str),
    LogPath(&'a Path),
    Window(&'a str),
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<AgentSession> {
    let agent_type_str: String = row.get("agent_type")?;
    let agent_type = match agent_type_str.as_str() {
        "codex" => AgentKind::Codex,
        _ => AgentKind::Claude,
    };
    Ok(AgentSession {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        log_file_path: PathBuf::from(row.get::<_, String>("log_file_path")?),
        project_path: PathBuf::from(row.get::<_, String>("project_path")?),
        agent_type,
        display_name: row.get("display_name")?,
        created_at: row.get("created_at")?,
        last_activity_at: row.get("last_activity_at")?,
        current_window: row.get("current_window")?,
        is_pinned: row.get::<_, i64>("is_pinned")? != 0,
        last_resume_error: row.get("last_resume_error")?,
        last_known_log_size: row.get("last_known_log_size")?,
        is_codex_exec: row.get::<_, i64>("is_codex_exec")? != 0,
    })
}

const SELECT_COLUMNS: &str = "id, session_id, log_file_path, project_path, agent_type, display_name,
     created_at, last_activity_at, current_window, is_pinned, last_resume_error,
     last_known_log_size, is_codex_exec";

pub fn insert_session(conn: &Connection, new: NewAgentSession) -> Result<AgentSession> {
    conn.execute(
        &format!(
            "INSERT INTO agent_sessions
                (session_id, log_file_path, project_path, agent_type, display_name,
                 created_at, last_activity_at, current_window, is_pinned,
                 last_resume_error, last_known_log_size, is_codex_exec)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, NULL, ?9, ?10)"
        ),
        params![
            new.session_id,
            new.log_file_path.to_string_lossy(),
            new.project_path.to_string_lossy(),
            new.agent_type.as_db_str(),
            new.display_name,
            new.created_at,
            new.last_activity_at,
            new.current_window,
            new.last_known_log_size,
            new.is_codex_exec as i64,
        ],
    )?;
    let id = conn.last_insert_rowid();
    get_session(conn, SessionFilter::SessionId(&new.session_id))?
        .ok_or_else(|| anyhow::anyhow!("failed to read back inserted session id={id}"))
}

/// Builds a dynamic `SET` list for only the provided fields.
pub fn update_session(conn: &Connection, id: i64, patch: AgentSessionPatch) -> Result<()> {
    let mut sets: Vec<String> = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(display_name) = patch.display_name {
        sets.push("display_name = ?".to_string());
        values.push(Box::new(display_name));
    }
    if let Some(last_activity_at) = patch.last_activity_at {
        sets.push("last_activity_at = ?".to_string());
        values.push(Box::new(last_activity_at));
    }
    if let Some(current_window) = patch.current_window {
        sets.push("current_window = ?".to_string());
        values.push(Box::new(current_window));
    }
    if let Some(is_pinned) = patch.is_pinned {
        sets.push("is_pinned = ?".to_string());
        values.push(Box::new(is_pinned as i64));
    }
    if let Some(last_resume_error) = patch.last_resume_error {
        sets.push("last_resume_error = ?".to_string());
        values.push(Box::new(last_resume_error));
    }
    if let Some(last_known_log_size) = patch.last_known_log_size {
        sets.push("last_known_log_size = ?".to_string());
        values.push(Box::new(last_known_log_size));
    }

    if sets.is_empty() {
        return Ok(());
    }

    let sql = format!("UPDATE agent_sessions SET {} WHERE id = ?", sets.join(", "));
    values.push(Box::new(id));
    let param_refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
    conn.execute(&sql, param_refs.as_slice())?;
    Ok(())
}

pub fn get_session(conn: &Connection, filter: SessionFilter<'_>) -> Result<Option<AgentSession>> {
    let result = match filter {
        SessionFilter::SessionId(id) => conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM agent_sessions WHERE session_id = ?1"),
                params![id],
                row_to_session,
            )
            .optional()?,
        SessionFilter::LogPath(path) => conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM agent_sessions WHERE log_file_path = ?1"),
                params![path.to_string_lossy()],
                row_to_session,
            )
            .optional()?,
        SessionFilter::Window(window) => conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM agent_sessions WHERE current_window = ?1"),
                params![window],
                row_to_session,
            )
            .optional()?,
    };
    Ok(result)
}

pub fn get_active_sessions(conn: &Connection) -> Result<Vec<AgentSession>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM agent_sessions WHERE current_window IS NOT NULL"
    ))?;
    let rows = stmt.query_map([], row_to_session)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn get_inactive_sessions(conn: &Connection) -> Result<Vec<AgentSession>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM agent_sessions WHERE current_window IS NULL
         ORDER BY last_activity_at DESC"
    ))?;
    let rows = stmt.query_map([], row_to_session)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn get_pinned_orphans(conn: &Connection) -> Result<Vec<AgentSession>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM agent_sessions
         WHERE current_window IS NULL AND is_pinned = 1
         ORDER BY last_activity_at DESC"
    ))?;
    let rows = stmt.query_map([], row_to_session)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn orphan_session(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("UPDATE agent_sessions SET current_window = NULL WHERE id = ?1", params![id])?;
    Ok(())
}

impl AgentKind {
    fn as_db_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
        }
    }
}
