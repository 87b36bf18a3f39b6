//! Core data model.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Working,
    Waiting,
    Permission,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    Managed,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
}

impl From<crate::paths::AgentKind> for AgentKind {
    fn from(k: crate::paths::AgentKind) -> Self {
        match k {
            crate::paths::AgentKind::Claude => AgentKind::Claude,
            crate::paths::AgentKind::Codex => AgentKind::Codex,
        }
    }
}

/// A live multiplexer window, as held by the session registry.
/// Field names mirror the JSON shape sent over the websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// "session:window-id", e.g. "agentboard:@1".
    pub id: String,
    pub name: String,
    #[serde(rename = "tmuxWindow")]
    pub tmux_window: String,
    #[serde(rename = "projectPath")]
    pub project_path: PathBuf,
    pub status: AgentStatus,
    #[serde(rename = "lastActivity")]
    pub last_activity: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "agentType", skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<AgentKind>,
    pub source: SessionSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// A patch applied to an existing `Session` by `SessionRegistry::update_session`.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub name: Option<String>,
    pub status: Option<AgentStatus>,
    pub last_activity: Option<String>,
    pub agent_type: Option<Option<AgentKind>>,
    pub command: Option<Option<String>>,
}

impl Session {
    pub fn apply_patch(&mut self, patch: SessionPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(last_activity) = patch.last_activity {
            self.last_activity = last_activity;
        }
        if let Some(agent_type) = patch.agent_type {
            self.agent_type = agent_type;
        }
        if let Some(command) = patch.command {
            self.command = command;
        }
    }
}

/// A durable, log-anchored session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub id: i64,
    pub session_id: String,
    pub log_file_path: PathBuf,
    pub project_path: PathBuf,
    pub agent_type: AgentKind,
    pub display_name: String,
    pub created_at: String,
    pub last_activity_at: String,
    pub current_window: Option<String>,
    pub is_pinned: bool,
    pub last_resume_error: Option<String>,
    pub last_known_log_size: i64,
    pub is_codex_exec: bool,
}

/// A partial update to an `AgentSession` row; only `Some` fields are written.
#[derive(Debug, Clone, Default)]
pub struct AgentSessionPatch {
    pub display_name: Option<String>,
    pub last_activity_at: Option<String>,
    pub current_window: Option<Option<String>>,
    pub is_pinned: Option<bool>,
    pub last_resume_error: Option<Option<String>>,
    pub last_known_log_size: Option<i64>,
}

/// A single parsed line of `tmux list-windows -a -F <fmt>` output, before
/// classification into managed/external/dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowRow {
    pub session_name: String,
    pub window_id: String,
    pub window_name: String,
    pub pane_path: String,
    pub activity_ts: Option<i64>,
    pub creation_ts: Option<i64>,
    pub start_command: String,
    pub width: Option<u16>,
    pub height: Option<u16>,
    pub source: SessionSource,
}
