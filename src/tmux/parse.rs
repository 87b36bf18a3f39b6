//! Parser for `tmux list-windows -a -F <fmt>` output.

use crate::model::{SessionSource, WindowRow};

/// Field delimiter used by the format string below.
const DELIM: char = '|';

/// Preferred format: session, window id, window name, pane cwd, activity ts,
/// creation ts, pane start command, pane width, pane height.
pub const PREFERRED_FORMAT: &str = "#{session_name}|#{window_id}|#{window_name}|#{pane_current_path}|#{window_activity}|#{window_start_time}|#{pane_start_command}|#{pane_width}|#{pane_height}";

/// Fallback for older tmux versions that don't know `window_start_time` /
/// `pane_start_command`: substitutes activity for creation and the current
/// command for the start command.
pub const FALLBACK_FORMAT: &str = "#{session_name}|#{window_id}|#{window_name}|#{pane_current_path}|#{window_activity}|#{window_activity}|#{pane_current_command}|#{pane_width}|#{pane_height}";

/// Parse one line of `list-windows` output produced by either format string
/// above. Defensively handles short lines by padding missing fields with
/// empty strings rather than erroring.
pub fn parse_window_line(line: &str) -> Option<WindowRow> {
    if line.trim().is_empty() {
        return None;
    }
    let mut fields = line.splitn(9, DELIM);
    let session_name = fields.next().unwrap_or_default().to_string();
    let window_id = fields.next().unwrap_or_default().to_string();
    let window_name = fields.next().unwrap_or_default().to_string();
    let pane_path = fields.next().unwrap_or_default().to_string();
    let activity_ts = fields.next().unwrap_or_default().parse().ok();
    let creation_ts = fields.next().unwrap_or_default().parse().ok();
    let start_command = fields.next().unwrap_or_default().to_string();
    let width = fields.next().unwrap_or_default().parse().ok();
    let height = fields.next().unwrap_or_default().parse().ok();

    if session_name.is_empty() || window_id.is_empty() {
        return None;
    }

    Some(WindowRow {
        session_name,
        window_id,
        window_name,
        pane_path,
        activity_ts,
        creation_ts,
        start_command,
        width,
        height,
        // Filled in by the caller, which knows the managed session name and
        // discover-prefix list.
        source: SessionSource::External,
    })
}

/// Classify a parsed window row as managed/external/dropped:
/// windows in the managed session are `Managed`; windows whose session name
/// matches any discover-prefix are `External`; everything else (including
/// reserved `ws-proxy` windows) is dropped.
pub fn classify(
    row: &WindowRow,
    managed_session: &str,
    discover_prefixes: &[String],
    ws_proxy_prefix: &str,
) -> Option<SessionSource> {
    if row.session_name.starts_with(ws_proxy_prefix) {
        return None;
    }
    if row.session_name == managed_session {
        return Some(SessionSource::Managed);
    }
    if discover_prefixes
        .iter()
        .any(|prefix| row.session_name.starts_with(prefix.as_str()))
    {
        return Some(SessionSource::External);
    }
    None
}
