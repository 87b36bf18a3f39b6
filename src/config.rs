//! Server configuration, loaded once at startup from environment variables.
//! There is no config file: every tunable here is env-driven.

use std::path::PathBuf;

use crate::errors::AgentboardError;

pub const DEFAULT_PORT: u16 = 4040;
pub const DEFAULT_TMUX_SESSION: &str = "agentboard";
pub const DEFAULT_REFRESH_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_LOG_POLL_MS: u64 = 5_000;
pub const MIN_REFRESH_INTERVAL_MS: u64 = 2_000;
pub const MIN_LOG_POLL_MS: u64 = 2_000;
pub const WS_PROXY_PREFIX_SUFFIX: &str = "-ws-";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub tmux_session: String,
    pub refresh_interval_ms: u64,
    /// `None` means polling is disabled (env var set to <= 0).
    pub log_poll_ms: Option<u64>,
    pub discover_prefixes: Vec<String>,
    pub claude_config_dir: Option<PathBuf>,
    pub codex_home: Option<PathBuf>,
    pub db_path: PathBuf,
    pub claude_resume_cmd: Option<String>,
    pub codex_resume_cmd: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, AgentboardError> {
        let port = parse_env_or("PORT", DEFAULT_PORT)?;
        let tmux_session = std::env::var("TMUX_SESSION")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_TMUX_SESSION.to_string());

        let refresh_interval_ms = parse_env_or("REFRESH_INTERVAL_MS", DEFAULT_REFRESH_INTERVAL_MS)?
            .max(MIN_REFRESH_INTERVAL_MS);

        let log_poll_ms = match std::env::var("AGENTBOARD_LOG_POLL_MS") {
            Ok(raw) if !raw.is_empty() => {
                let parsed: i64 = raw.parse().map_err(|_| {
                    AgentboardError::InvalidConfig(format!(
                        "AGENTBOARD_LOG_POLL_MS must be an integer, got {raw:?}"
                    ))
                })?;
                if parsed <= 0 {
                    None
                } else {
                    Some((parsed as u64).max(MIN_LOG_POLL_MS))
                }
            }
            _ => Some(DEFAULT_LOG_POLL_MS),
        };

        let discover_prefixes = std::env::var("DISCOVER_PREFIXES")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let claude_config_dir = std::env::var("CLAUDE_CONFIG_DIR").ok().map(PathBuf::from);
        let codex_home = std::env::var("CODEX_HOME").ok().map(PathBuf::from);

        let db_path = match std::env::var("AGENTBOARD_DB_PATH") {
            Ok(p) if !p.is_empty() => PathBuf::from(p),
            _ => home::home_dir()
                .ok_or_else(|| {
                    AgentboardError::InvalidConfig(
                        "could not determine home directory for default database path".into(),
                    )
                })?
                .join(".local")
                .join("share")
                .join("agentboard")
                .join("agentboard.db"),
        };

        let claude_resume_cmd = std::env::var("CLAUDE_RESUME_CMD").ok().filter(|s| !s.is_empty());
        let codex_resume_cmd = std::env::var("CODEX_RESUME_CMD").ok().filter(|s| !s.is_empty());

        let config = Config {
            port,
            tmux_session,
            refresh_interval_ms,
            log_poll_ms,
            discover_prefixes,
            claude_config_dir,
            codex_home,
            db_path,
            claude_resume_cmd,
            codex_resume_cmd,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AgentboardError> {
        if self.refresh_interval_ms < MIN_REFRESH_INTERVAL_MS {
            return Err(AgentboardError::InvalidConfig(format!(
                "REFRESH_INTERVAL_MS must be >= {MIN_REFRESH_INTERVAL_MS}"
            )));
        }
        if let Some(ms) = self.log_poll_ms
            && ms < MIN_LOG_POLL_MS
        {
            return Err(AgentboardError::InvalidConfig(format!(
                "AGENTBOARD_LOG_POLL_MS must be >= {MIN_LOG_POLL_MS} or <= 0 to disable"
            )));
        }
        Ok(())
    }

    /// The reserved prefix for internal per-connection proxy sessions, derived
    /// from the managed tmux session name.
    pub fn ws_proxy_prefix(&self) -> String {
        format!("{}{}", self.tmux_session, WS_PROXY_PREFIX_SUFFIX)
    }
}

fn parse_env_or<T>(var: &str, default: T) -> Result<T, AgentboardError>
where
    T: std::str::FromStr,
{
    match std::env::var(var) {
        Ok(raw) if !raw.is_empty() => raw.parse().map_err(|_| {
            AgentboardError::InvalidConfig(format!("{var} has an invalid value: {raw:?}"))
        }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for var in [
            "PORT",
            "TMUX_SESSION",
            "REFRESH_INTERVAL_MS",
            "AGENTBOARD_LOG_POLL_MS",
            "DISCOVER_PREFIXES",
            "CLAUDE_CONFIG_DIR",
            "CODEX_HOME",
            "AGENTBOARD_DB_PATH",
            "CLAUDE_RESUME_CMD",
            "CODEX_RESUME_CMD",
        ] {
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    fn defaults_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        unsafe { std::env::set_var("AGENTBOARD_DB_PATH", "/tmp/agentboard-test.db") };
        let config = Config::from_env().unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.tmux_session, DEFAULT_TMUX_SESSION);
        assert_eq!(config.refresh_interval_ms, DEFAULT_REFRESH_INTERVAL_MS);
        assert_eq!(config.log_poll_ms, Some(DEFAULT_LOG_POLL_MS));
    }

    #[test]
    fn refresh_interval_is_clamped_to_minimum() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        unsafe {
            std::env::set_var("AGENTBOARD_DB_PATH", "/tmp/agentboard-test.db");
            std::env::set_var("REFRESH_INTERVAL_MS", "10");
        }
        let config = Config::from_env().unwrap();
        assert_eq!(config.refresh_interval_ms, MIN_REFRESH_INTERVAL_MS);
    }

    #[test]
    fn non_positive_poll_disables_polling() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        unsafe {
            std::env::set_var("AGENTBOARD_DB_PATH", "/tmp/agentboard-test.db");
            std::env::set_var("AGENTBOARD_LOG_POLL_MS", "0");
        }
        let config = Config::from_env().unwrap();
        assert_eq!(config.log_poll_ms, None);
    }

    #[test]
    fn discover_prefixes_split_and_trimmed() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        unsafe {
            std::env::set_var("AGENTBOARD_DB_PATH", "/tmp/agentboard-test.db");
            std::env::set_var("DISCOVER_PREFIXES", "foo, bar ,, baz");
        }
        let config = Config::from_env().unwrap();
        assert_eq!(config.discover_prefixes, vec!["foo", "bar", "baz"]);
    }
}
