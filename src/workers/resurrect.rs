//! Pin-driven auto-resurrection: a one-shot startup sweep
//! that re-spawns tmux windows for pinned sessions orphaned across a
//! restart, grounded on `workmux::workflow::create`'s "resolve path, ensure
//! uniqueness, spawn window" sequence. Runs once, synchronously, before the
//! broker starts listening; a single resume failure never aborts startup.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::config::Config;
use crate::db::SessionDatabase;
use crate::model::{AgentKind, AgentSessionPatch, SessionSource};
use crate::tmux::{self, CreateWindowParams};

pub fn run(config: &Config, db: &SessionDatabase) {
    let pinned = match db.get_pinned_orphans() {
        Ok(rows) => rows,
        Err(e) => {
            warn!(error = %e, "resurrection sweep: failed to load pinned orphans, skipping");
            return;
        }
    };
    if pinned.is_empty() {
        return;
    }

    let mut existing_managed_names = managed_window_names(config);

    for row in pinned {
        let template = match row.agent_type {
            AgentKind::Claude => config.claude_resume_cmd.as_deref(),
            AgentKind::Codex => config.codex_resume_cmd.as_deref(),
        };
        let Some(template) = template else {
            let kind = match row.agent_type {
                AgentKind::Claude => "claude",
                AgentKind::Codex => "codex",
            };
            let message = format!("no resume command configured for {kind}");
            warn!(session_id = row.session_id.as_str(), "resurrection sweep: {message}");
            record_failure(db, row.id, &message);
            continue;
        };
        let command = template.replace("{sessionId}", &row.session_id);

        let result = tmux::create_window(CreateWindowParams {
            session: &config.tmux_session,
            project_path: &row.project_path,
            name: Some(row.display_name.as_str()),
            command: Some(command.as_str()),
            existing_managed_names: &existing_managed_names,
        });

        match result {
            Ok(window_name) => {
                existing_managed_names.insert(window_name.clone());
                let window_id = managed_window_id(config, &window_name);

                let patch = AgentSessionPatch {
                    current_window: Some(window_id.clone()),
                    last_resume_error: Some(None),
                    ..Default::default()
                };
                if let Err(e) = db.update_session(row.id, patch) {
                    warn!(
                        session_id = row.session_id.as_str(),
                        error = %e,
                        "resurrection sweep: resumed window spawned but failed to persist current_window"
                    );
                }
                info!(
                    session_id = row.session_id.as_str(),
                    window_name,
                    window_id = window_id.as_deref().unwrap_or(""),
                    "resurrection sweep: resumed pinned session"
                );
            }
            Err(e) => {
                warn!(session_id = row.session_id.as_str(), error = %e, "resurrection sweep: resume failed");
                record_failure(db, row.id, &e.to_string());
            }
        }
    }
}

fn managed_window_names(config: &Config) -> HashSet<String> {
    tmux::list_windows(config)
        .map(|sessions| {
            sessions
                .into_iter()
                .filter(|s| s.source == SessionSource::Managed)
                .map(|s| s.name)
                .collect()
        })
        .unwrap_or_else(|e| {
            warn!(error = %e, "resurrection sweep: failed to list existing windows, proceeding with an empty set");
            HashSet::new()
        })
}

/// Re-lists windows to resolve `name` to its full `session:@windowId` id --
/// `create_window` only returns the chosen name, not the id tmux assigned it.
fn managed_window_id(config: &Config, name: &str) -> Option<String> {
    tmux::list_windows(config)
        .ok()?
        .into_iter()
        .filter(|s| s.source == SessionSource::Managed && s.name == name)
        .max_by(|a, b| a.created_at.cmp(&b.created_at))
        .map(|s| s.id)
}

fn record_failure(db: &SessionDatabase, id: i64, message: &str) {
    if let Err(e) = db.update_session(
        id,
        AgentSessionPatch { last_resume_error: Some(Some(message.to_string())), ..Default::default() },
    ) {
        warn!(error = %e, "resurrection sweep: failed to record resume error");
    }
}
