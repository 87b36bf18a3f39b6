//! Control-mode (`tmux -CC`) protocol parser and proxy backend.
//!
//! The parser decodes the line-based notification/reply stream tmux emits in
//! control mode into typed messages. Lines between a `%begin` and its
//! matching `%end`/`%error` are captured as that command's output;
//! notifications arriving in between are NOT swallowed -- only non-`%` lines
//! are buffered. [`ControlProxy`] drives a live `tmux -CC` child through a
//! PTY pair the same way [`super::direct::DirectProxy`] does, feeding its
//! output through the parser and translating `terminal-input`/`resize` into
//! tmux commands written to the child's stdin instead of raw bytes.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::errors::AgentboardError;
use crate::proxy::direct::ProxyEvent;
use crate::proxy::handshake::ReadyFlag;

/// Leading handshake prefix tmux control mode sometimes emits before the
/// first `%begin`; stripped once and discarded.
const DCS_HANDSHAKE_PREFIX: &str = "\x1bP1000p";
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;
const READ_BUF_SIZE: usize = 8192;

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Output {
        pane_id: String,
        data: Vec<u8>,
    },
    ExtendedOutput {
        pane_id: String,
        latency_ms: u64,
        data: Vec<u8>,
    },
    CommandEnd {
        ts: i64,
        cmd_num: u64,
        flags: String,
        output: Vec<String>,
    },
    CommandError {
        ts: i64,
        cmd_num: u64,
        flags: String,
        output: Vec<String>,
    },
    WindowAdd {
        id: String,
    },
    WindowClose {
        id: String,
    },
    WindowRenamed {
        id: String,
        name: Option<String>,
    },
    SessionChanged {
        id: String,
        name: String,
    },
    Pause {
        pane_id: String,
    },
    Continue {
        pane_id: String,
    },
    Exit {
        reason: Option<String>,
    },
}

/// Decode tmux's `\NNN` octal byte escapes; every other byte passes through
/// unchanged.
pub fn decode_octal_escapes(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1].is_ascii_digit()
            && bytes[i + 2].is_ascii_digit()
            && bytes[i + 3].is_ascii_digit()
        {
            let octal = &s[i + 1..i + 4];
            if let Ok(value) = u8::from_str_radix(octal, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn parse_begin(line: &str) -> Option<(i64, u64, String)> {
    let mut parts = line.trim_start_matches("%begin").split_whitespace();
    let ts = parts.next()?.parse().ok()?;
    let cmd_num = parts.next()?.parse().ok()?;
    let flags = parts.next().unwrap_or("").to_string();
    Some((ts, cmd_num, flags))
}

fn parse_notification(line: &str) -> Option<ControlMessage> {
    if let Some(rest) = line.strip_prefix("%output ") {
        let mut parts = rest.splitn(2, ' ');
        let pane_id = parts.next()?.to_string();
        let data = decode_octal_escapes(parts.next().unwrap_or(""));
        return Some(ControlMessage::Output { pane_id, data });
    }
    if let Some(rest) = line.strip_prefix("%extended-output ") {
        // "<paneId> <latencyMs> : <data>"
        let mut head_and_data = rest.splitn(2, " : ");
        let head = head_and_data.next()?;
        let data_part = head_and_data.next().unwrap_or("");
        let mut head_parts = head.split_whitespace();
        let pane_id = head_parts.next()?.to_string();
        let latency_ms = head_parts.next()?.parse().ok()?;
        return Some(ControlMessage::ExtendedOutput {
            pane_id,
            latency_ms,
            data: decode_octal_escapes(data_part),
        });
    }
    if let Some(rest) = line.strip_prefix("%window-add ") {
        return Some(ControlMessage::WindowAdd { id: rest.trim().to_string() });
    }
    if let Some(rest) = line.strip_prefix("%window-close ") {
        return Some(ControlMessage::WindowClose { id: rest.trim().to_string() });
    }
    if let Some(rest) = line.strip_prefix("%window-renamed ") {
        let mut parts = rest.splitn(2, ' ');
        let id = parts.next()?.to_string();
        let name = parts.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        return Some(ControlMessage::WindowRenamed { id, name });
    }
    if let Some(rest) = line.strip_prefix("%session-changed ") {
        let mut parts = rest.splitn(2, ' ');
        let id = parts.next()?.to_string();
        let name = parts.next().unwrap_or("").to_string();
        return Some(ControlMessage::SessionChanged { id, name });
    }
    if let Some(rest) = line.strip_prefix("%pause ") {
        return Some(ControlMessage::Pause { pane_id: rest.trim().to_string() });
    }
    if let Some(rest) = line.strip_prefix("%continue ") {
        return Some(ControlMessage::Continue { pane_id: rest.trim().to_string() });
    }
    if let Some(rest) = line.strip_prefix("%exit") {
        let reason = rest.trim();
        return Some(ControlMessage::Exit {
            reason: if reason.is_empty() { None } else { Some(reason.to_string()) },
        });
    }
    None
}

/// Stateful line parser for a single control-mode attachment. Feed it raw
/// bytes as they arrive from the PTY; it returns zero or more decoded
/// messages per call.
pub struct ControlModeParser {
    carry: String,
    dcs_stripped: bool,
    pending_header: Option<(i64, u64, String)>,
    pending_output: Vec<String>,
}

impl ControlModeParser {
    pub fn new() -> Self {
        Self {
            carry: String::new(),
            dcs_stripped: false,
            pending_header: None,
            pending_output: Vec::new(),
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ControlMessage> {
        self.carry.push_str(&String::from_utf8_lossy(bytes));
        if !self.dcs_stripped
            && let Some(stripped) = self.carry.strip_prefix(DCS_HANDSHAKE_PREFIX)
        {
            self.carry = stripped.to_string();
            self.dcs_stripped = true;
        }
        self.carry = self.carry.replace("\r\n", "\n");

        let mut messages = Vec::new();
        while let Some(idx) = self.carry.find('\n') {
            let line: String = self.carry.drain(..=idx).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(msg) = self.process_line(line) {
                messages.push(msg);
            }
        }
        messages
    }

    fn process_line(&mut self, line: &str) -> Option<ControlMessage> {
        if self.pending_header.is_some() {
            if line.starts_with("%end") || line.starts_with("%error") {
                let is_error = line.starts_with("%error");
                let (ts, cmd_num, flags) = self.pending_header.take().unwrap();
                let output = std::mem::take(&mut self.pending_output);
                return Some(if is_error {
                    ControlMessage::CommandError { ts, cmd_num, flags, output }
                } else {
                    ControlMessage::CommandEnd { ts, cmd_num, flags, output }
                });
            }
            if let Some(stripped) = line.strip_prefix('%') {
                // A notification arriving mid-block is not swallowed.
                return parse_notification(&format!("%{stripped}"));
            }
            self.pending_output.push(line.to_string());
            return None;
        }

        if line.starts_with("%begin") {
            if let Some(header) = parse_begin(line) {
                self.pending_header = Some(header);
                self.pending_output = Vec::new();
            }
            return None;
        }

        parse_notification(line)
    }
}

impl Default for ControlModeParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Quotes a string for use inside `send-keys -l '<data>'`: only single
/// quotes and backslashes are escaped. Multi-byte control sequences like
/// arrow keys are a known limitation of this path.
pub fn quote_send_keys_literal(data: &str) -> String {
    let mut out = String::with_capacity(data.len() + 2);
    out.push('\'');
    for c in data.chars() {
        match c {
            '\'' => out.push_str("'\\''"),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

/// Control-mode proxy backend: drives a `tmux -CC attach-session` child
/// through a PTY pair, decoding its stdout with [`ControlModeParser`] and
/// translating writes/resizes/switches into tmux commands sent over the
/// child's stdin rather than raw bytes.
pub struct ControlProxy {
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    events: broadcast::Sender<ProxyEvent>,
    ready: ReadyFlag,
    paused_panes: Arc<Mutex<HashSet<String>>>,
}

impl ControlProxy {
    pub fn spawn(target: &str, cols: u16, rows: u16) -> Result<Self, AgentboardError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
            .map_err(|e| AgentboardError::TmuxAttachFailed(format!("{target}: {e}")))?;

        let mut cmd = CommandBuilder::new("tmux");
        cmd.arg("-CC");
        cmd.arg("attach-session");
        cmd.arg("-t");
        cmd.arg(target);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| AgentboardError::TmuxAttachFailed(format!("{target}: {e}")))?;
        let killer = child.clone_killer();
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| AgentboardError::TmuxAttachFailed(format!("{target}: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| AgentboardError::TmuxAttachFailed(format!("{target}: {e}")))?;
        drop(pair.master);

        let (tx, _rx) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let ready = ReadyFlag::new();
        let paused_panes = Arc::new(Mutex::new(HashSet::new()));

        let proxy = Self {
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            events: tx,
            ready: ready.clone(),
            paused_panes: paused_panes.clone(),
        };

        spawn_control_reader_task(proxy.events.clone(), ready, paused_panes, reader);
        spawn_control_wait_task(proxy.events.clone(), child);

        Ok(proxy)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    pub fn ready(&self) -> ReadyFlag {
        self.ready.clone()
    }

    /// True if the multiplexer has told us (via `%pause`) that it has
    /// stopped sending output for `pane_id` until we say otherwise.
    pub fn is_paused(&self, pane_id: &str) -> bool {
        self.paused_panes.lock().expect("paused panes lock poisoned").contains(pane_id)
    }

    /// Explicit flow control: ask the multiplexer to stop sending output for
    /// `pane_id` via `refresh-client -A <pane>:pause`.
    pub fn pause_pane(&self, pane_id: &str) -> std::io::Result<()> {
        self.paused_panes
            .lock()
            .expect("paused panes lock poisoned")
            .insert(pane_id.to_string());
        self.send_flow_control(pane_id, "pause")
    }

    /// Explicit flow control: ask the multiplexer to resume sending output
    /// for `pane_id` via `refresh-client -A <pane>:continue`.
    pub fn resume_pane(&self, pane_id: &str) -> std::io::Result<()> {
        self.paused_panes.lock().expect("paused panes lock poisoned").remove(pane_id);
        self.send_flow_control(pane_id, "continue")
    }

    fn send_flow_control(&self, pane_id: &str, state: &str) -> std::io::Result<()> {
        let command = format!("refresh-client -A {pane_id}:{state}\n");
        let mut writer = self.writer.lock().expect("control proxy writer lock poisoned");
        writer.write_all(command.as_bytes())?;
        writer.flush()
    }

    /// Injects `data` as literal keystrokes into the attached pane via
    /// `send-keys -l`; resize goes through a separate refresh-client command.
    pub fn write(&self, pane_id: &str, data: &[u8]) -> std::io::Result<()> {
        let text = String::from_utf8_lossy(data);
        let command = format!("send-keys -t {pane_id} -l {}\n", quote_send_keys_literal(&text));
        let mut writer = self.writer.lock().expect("control proxy writer lock poisoned");
        writer.write_all(command.as_bytes())?;
        writer.flush()
    }

    /// Issues a `refresh-client -C <cols>,<rows>` resize command; errors are
    /// ignored.
    pub fn resize(&self, cols: u16, rows: u16) {
        let command = format!("refresh-client -C {cols},{rows}\n");
        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.write_all(command.as_bytes());
            let _ = writer.flush();
        }
    }

    /// Switches the attached client's active window without tearing down
    /// the PTY, via `select-window`.
    pub fn select_window(&self, target: &str) -> std::io::Result<()> {
        let command = format!("select-window -t {target}\n");
        let mut writer = self.writer.lock().expect("control proxy writer lock poisoned");
        writer.write_all(command.as_bytes())?;
        writer.flush()
    }

    pub fn dispose(&self) {
        let _ = self.killer.lock().expect("control proxy killer lock poisoned").kill();
    }
}

fn spawn_control_reader_task(
    events: broadcast::Sender<ProxyEvent>,
    ready: ReadyFlag,
    paused_panes: Arc<Mutex<HashSet<String>>>,
    mut reader: Box<dyn Read + Send>,
) {
    tokio::task::spawn_blocking(move || {
        let mut parser = ControlModeParser::new();
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for msg in parser.feed(&buf[..n]) {
                        match msg {
                            ControlMessage::Output { data, .. }
                            | ControlMessage::ExtendedOutput { data, .. } => {
                                ready.signal();
                                let _ = events.send(ProxyEvent::Output(data));
                            }
                            ControlMessage::Pause { pane_id } => {
                                debug!(pane_id, "control proxy: pane paused by multiplexer");
                                paused_panes.lock().expect("paused panes lock poisoned").insert(pane_id);
                            }
                            ControlMessage::Continue { pane_id } => {
                                debug!(pane_id, "control proxy: pane resumed by multiplexer");
                                paused_panes.lock().expect("paused panes lock poisoned").remove(&pane_id);
                            }
                            ControlMessage::Exit { .. } => {
                                let _ = events.send(ProxyEvent::Exit);
                            }
                            _ => {}
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "control proxy reader: read error, ending stream");
                    break;
                }
            }
        }
        debug!("control proxy reader: stream ended");
        let _ = events.send(ProxyEvent::Exit);
    });
}

fn spawn_control_wait_task(events: broadcast::Sender<ProxyEvent>, mut child: Box<dyn Child + Send + Sync>) {
    tokio::task::spawn_blocking(move || {
        let _ = child.wait();
        let _ = events.send(ProxyEvent::Exit);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_octal_escapes() {
        assert_eq!(decode_octal_escapes(r"hello\040world"), b"hello world");
        assert_eq!(decode_octal_escapes(r"tab\011here"), b"tab\there");
    }

    #[test]
    fn quote_send_keys_literal_escapes_only_quotes_and_backslashes() {
        assert_eq!(quote_send_keys_literal("ls\n"), "'ls\n'");
        assert_eq!(quote_send_keys_literal("it's"), "'it'\\''s'");
        assert_eq!(quote_send_keys_literal(r"a\b"), r"'a\\b'");
    }

    #[test]
    fn parses_output_notification() {
        let mut parser = ControlModeParser::new();
        let msgs = parser.feed(b"%output %3 hello\\040world\n");
        assert_eq!(
            msgs,
            vec![ControlMessage::Output {
                pane_id: "%3".to_string(),
                data: b"hello world".to_vec(),
            }]
        );
    }

    #[test]
    fn captures_output_between_begin_and_end() {
        let mut parser = ControlModeParser::new();
        let msgs = parser.feed(b"%begin 123 1 0\nline one\nline two\n%end 123 1 0\n");
        assert_eq!(
            msgs,
            vec![ControlMessage::CommandEnd {
                ts: 123,
                cmd_num: 1,
                flags: "0".to_string(),
                output: vec!["line one".to_string(), "line two".to_string()],
            }]
        );
    }

    #[test]
    fn error_block_reports_command_error() {
        let mut parser = ControlModeParser::new();
        let msgs = parser.feed(b"%begin 1 1 0\nbad command\n%error 1 1 0\n");
        assert_eq!(
            msgs,
            vec![ControlMessage::CommandError {
                ts: 1,
                cmd_num: 1,
                flags: "0".to_string(),
                output: vec!["bad command".to_string()],
            }]
        );
    }

    #[test]
    fn notification_inside_begin_end_is_not_swallowed() {
        let mut parser = ControlModeParser::new();
        let msgs = parser.feed(b"%begin 1 1 0\n%window-add @5\nok\n%end 1 1 0\n");
        assert_eq!(
            msgs,
            vec![
                ControlMessage::WindowAdd { id: "@5".to_string() },
                ControlMessage::CommandEnd {
                    ts: 1,
                    cmd_num: 1,
                    flags: "0".to_string(),
                    output: vec!["ok".to_string()],
                },
            ]
        );
    }

    #[test]
    fn parses_session_changed_and_exit() {
        let mut parser = ControlModeParser::new();
        let msgs = parser.feed(b"%session-changed $1 agentboard\n%exit detached\n");
        assert_eq!(
            msgs,
            vec![
                ControlMessage::SessionChanged {
                    id: "$1".to_string(),
                    name: "agentboard".to_string(),
                },
                ControlMessage::Exit { reason: Some("detached".to_string()) },
            ]
        );
    }

    #[test]
    fn strips_dcs_handshake_prefix() {
        let mut parser = ControlModeParser::new();
        let mut line = DCS_HANDSHAKE_PREFIX.as_bytes().to_vec();
        line.extend_from_slice(b"%pause %2\n");
        let msgs = parser.feed(&line);
        assert_eq!(msgs, vec![ControlMessage::Pause { pane_id: "%2".to_string() }]);
    }

    #[test]
    fn normalizes_crlf_line_endings() {
        let mut parser = ControlModeParser::new();
        let msgs = parser.feed(b"%continue %1\r\n");
        assert_eq!(msgs, vec![ControlMessage::Continue { pane_id: "%1".to_string() }]);
    }

    #[test]
    fn handles_partial_lines_across_feed_calls() {
        let mut parser = ControlModeParser::new();
        assert!(parser.feed(b"%pause ").is_empty());
        let msgs = parser.feed(b"%1\n");
        assert_eq!(msgs, vec![ControlMessage::Pause { pane_id: "%1".to_string() }]);
    }

    #[test]
    fn flow_control_commands_use_refresh_client_prefix() {
        // pause_pane/resume_pane exercise real PTY plumbing via ControlProxy::spawn,
        // which this module's unit tests avoid; the command format is pinned here
        // so a drifting format is caught without spawning a real tmux child.
        let pane_id = "%3";
        assert_eq!(format!("refresh-client -A {pane_id}:pause\n"), "refresh-client -A %3:pause\n");
        assert_eq!(format!("refresh-client -A {pane_id}:continue\n"), "refresh-client -A %3:continue\n");
    }

    #[test]
    fn reader_task_tracks_paused_panes_from_notifications() {
        let paused: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut parser = ControlModeParser::new();

        for msg in parser.feed(b"%pause %2\n") {
            if let ControlMessage::Pause { pane_id } = msg {
                paused.lock().unwrap().insert(pane_id);
            }
        }
        assert!(paused.lock().unwrap().contains("%2"));

        for msg in parser.feed(b"%continue %2\n") {
            if let ControlMessage::Continue { pane_id } = msg {
                paused.lock().unwrap().remove(&pane_id);
            }
        }
        assert!(!paused.lock().unwrap().contains("%2"));
    }

    #[test]
    fn parses_extended_output() {
        let mut parser = ControlModeParser::new();
        let msgs = parser.feed(b"%extended-output %1 42 : hi\\040there\n");
        assert_eq!(
            msgs,
            vec![ControlMessage::ExtendedOutput {
                pane_id: "%1".to_string(),
                latency_ms: 42,
                data: b"hi there".to_vec(),
            }]
        );
    }
}
