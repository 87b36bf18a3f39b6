//! Direct-attach terminal proxy backend: spawns
//! `tmux attach-session -t <target>` inside a pseudo-terminal and forwards
//! bytes verbatim in both directions.
//!
//! Grounded on `canxin121-opencode-studio`'s `TerminalSession`: a
//! `Mutex`-wrapped master/writer/killer trio, a `spawn_blocking` reader loop
//! publishing chunks over a broadcast channel, and a `spawn_blocking` wait
//! task that detects process exit. Unlike that example, there is no shell
//! fallback: if the attach itself fails, the caller reports
//! `ERR_TMUX_ATTACH_FAILED` and does not retry silently.

use std::io::{Read, Write};
use std::sync::Mutex;

use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::errors::AgentboardError;
use crate::proxy::handshake::ReadyFlag;

const OUTPUT_CHANNEL_CAPACITY: usize = 1024;
const READ_BUF_SIZE: usize = 8192;

#[derive(Debug, Clone)]
pub enum ProxyEvent {
    Output(Vec<u8>),
    Exit,
}

/// One live `tmux attach-session` child and the PTY plumbing around it.
pub struct DirectProxy {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    events: broadcast::Sender<ProxyEvent>,
    ready: ReadyFlag,
}

impl DirectProxy {
    /// Spawns the attach child. Returns as soon as the child exists; the
    /// first byte of PTY output signals [`ReadyFlag`] so the caller can emit
    /// `terminal-ready` before forwarding any `terminal-output`: bytes
    /// forwarded before that ack are never emitted.
    pub fn spawn(target: &str, cols: u16, rows: u16) -> Result<Self, AgentboardError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 })
            .map_err(|e| AgentboardError::TmuxAttachFailed(format!("{target}: {e}")))?;

        let mut cmd = CommandBuilder::new("tmux");
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

        let (tx, _rx) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let ready = ReadyFlag::new();

        let proxy = Self {
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            events: tx,
            ready: ready.clone(),
        };

        spawn_reader_task(proxy.events.clone(), ready, reader);
        spawn_wait_task(proxy.events.clone(), child);

        Ok(proxy)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    pub fn ready(&self) -> ReadyFlag {
        self.ready.clone()
    }

    pub fn write(&self, data: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().expect("proxy writer lock poisoned");
        writer.write_all(data)?;
        writer.flush()
    }

    /// Errors are ignored: a resize against an already-dead PTY is a no-op.
    pub fn resize(&self, cols: u16, rows: u16) {
        let master = self.master.lock().expect("proxy master lock poisoned");
        let _ = master.resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 });
    }

    /// Best-effort kill of the attach child. Idempotent: calling this on an
    /// already-dead child is a harmless no-op.
    pub fn dispose(&self) {
        let _ = self.killer.lock().expect("proxy killer lock poisoned").kill();
    }
}

fn spawn_reader_task(
    events: broadcast::Sender<ProxyEvent>,
    ready: ReadyFlag,
    mut reader: Box<dyn Read + Send>,
) {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    ready.signal();
                    if events.send(ProxyEvent::Output(buf[..n].to_vec())).is_err() {
                        debug!("direct proxy reader: no subscribers left, continuing to drain");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "direct proxy reader: read error, ending stream");
                    break;
                }
            }
        }
        let _ = events.send(ProxyEvent::Exit);
    });
}

fn spawn_wait_task(events: broadcast::Sender<ProxyEvent>, mut child: Box<dyn Child + Send + Sync>) {
    tokio::task::spawn_blocking(move || {
        let _ = child.wait();
        let _ = events.send(ProxyEvent::Exit);
    });
}
