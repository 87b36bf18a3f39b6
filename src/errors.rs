//! Error taxonomy: kinds, not type names.
//!
//! `Fatal` variants are the only ones that ever reach `main` and cause a
//! non-zero exit. `Operational` failures are logged and counted but never
//! abort a worker tick. `ClientRequest` failures become a `{"type":"error"}`
//! message on the originating connection without closing it. `Proxy` failures
//! drive the terminal proxy's state machine retries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentboardError {
    #[error("tmux is not available: {0}")]
    PrerequisiteMissing(String),

    #[error("port {0} is already in use")]
    PortInUse(u16),

    #[error("failed to open database at {path}: {source}")]
    DatabaseUnavailable {
        path: std::path::PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid environment configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("invalid tmux target: {0}")]
    InvalidTmuxTarget(String),

    #[error("project path does not exist: {0}")]
    ProjectPathMissing(String),

    #[error("a session with that name already exists")]
    NameCollision,

    #[error("name not allowed: {0}")]
    NameNotAllowed(String),

    #[error("session create failed: {0}")]
    SessionCreateFailed(String),

    #[error("tmux attach failed: {0}")]
    TmuxAttachFailed(String),

    #[error("tmux switch failed: {0}")]
    TmuxSwitchFailed(String),

    #[error("terminal proxy is not ready")]
    NotReady,
}

impl AgentboardError {
    /// True for errors that should terminate the process at startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentboardError::PrerequisiteMissing(_)
                | AgentboardError::PortInUse(_)
                | AgentboardError::DatabaseUnavailable { .. }
                | AgentboardError::InvalidConfig(_)
        )
    }

    /// The message to surface to a client over the wire protocol's `error` message,
    /// for the ClientRequest-kind variants. Other variants are never surfaced directly.
    pub fn client_message(&self) -> String {
        self.to_string()
    }
}
