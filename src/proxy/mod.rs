//! Terminal proxy state machine: one instance per browser connection
//! currently attached to a tmux window.
//!
//! ```text
//! states:   IDLE → ATTACHING → READY ↔ SWITCHING → READY
//!                                    ↘ DEAD
//! ```
//!
//! Wraps one of two backends -- [`direct::DirectProxy`] (plain PTY attach) or
//! [`control::ControlProxy`] (`tmux -CC`) -- behind a single contract: byte
//! output flows out over a broadcast channel, `write`/`resize` push bytes or
//! commands in, and `switch` changes the attached window without tearing
//! down the child, via `select-window` (direct: a side subprocess; control:
//! a command sent over the same connection).

pub mod control;
pub mod direct;
pub mod handshake;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cmd::Cmd;
use crate::errors::AgentboardError;
use control::ControlProxy;
use direct::{DirectProxy, ProxyEvent};

const FORWARD_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Idle,
    Attaching,
    Ready,
    Switching,
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyVariant {
    Direct,
    Control,
}

enum BackendHandle {
    Direct(DirectProxy),
    Control(ControlProxy),
}

impl BackendHandle {
    fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        match self {
            BackendHandle::Direct(d) => d.subscribe(),
            BackendHandle::Control(c) => c.subscribe(),
        }
    }

    fn ready(&self) -> handshake::ReadyFlag {
        match self {
            BackendHandle::Direct(d) => d.ready(),
            BackendHandle::Control(c) => c.ready(),
        }
    }
}

pub struct TerminalProxy {
    variant: ProxyVariant,
    state: Mutex<ProxyState>,
    start_lock: tokio::sync::Mutex<()>,
    backend: Mutex<Option<BackendHandle>>,
    target: Mutex<String>,
    suppress_output: AtomicBool,
    events: broadcast::Sender<ProxyEvent>,
    exited: AtomicBool,
}

impl TerminalProxy {
    pub fn new(variant: ProxyVariant) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(FORWARD_CHANNEL_CAPACITY);
        Arc::new(Self {
            variant,
            state: Mutex::new(ProxyState::Idle),
            start_lock: tokio::sync::Mutex::new(()),
            backend: Mutex::new(None),
            target: Mutex::new(String::new()),
            suppress_output: AtomicBool::new(false),
            events: tx,
            exited: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> ProxyState {
        *self.state.lock().expect("proxy state lock poisoned")
    }

    /// Bytes forwarded to the consumer, after SWITCHING suppression and
    /// dead-on-exit de-duplication. Emitting nothing before a terminal-ready
    /// ack is the caller's responsibility -- subscribe only after `start`
    /// resolves.
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    /// IDLE → ATTACHING → READY. Idempotent: a second call while already
    /// attaching or ready is a no-op and never spawns a second child,
    /// guarded by `start_lock` so concurrent callers serialize on the same
    /// in-flight attempt.
    pub async fn start(self: &Arc<Self>, target: &str, cols: u16, rows: u16) -> Result<(), AgentboardError> {
        let _guard = self.start_lock.lock().await;
        if self.state() != ProxyState::Idle {
            return Ok(());
        }
        *self.state.lock().expect("proxy state lock poisoned") = ProxyState::Attaching;
        *self.target.lock().expect("proxy target lock poisoned") = target.to_string();
        info!(target, variant = ?self.variant, "terminal_proxy_start");
        let started = Instant::now();

        let variant = self.variant;
        let target_owned = target.to_string();
        let spawned = tokio::task::spawn_blocking(move || match variant {
            ProxyVariant::Direct => DirectProxy::spawn(&target_owned, cols, rows).map(BackendHandle::Direct),
            ProxyVariant::Control => ControlProxy::spawn(&target_owned, cols, rows).map(BackendHandle::Control),
        })
        .await
        .expect("proxy spawn task panicked");

        let backend = match spawned {
            Ok(backend) => backend,
            Err(e) => {
                *self.state.lock().expect("proxy state lock poisoned") = ProxyState::Dead;
                warn!(target, error = %e, "terminal_proxy_dead");
                return Err(e);
            }
        };

        let backend_rx = backend.subscribe();
        let ready = backend.ready();
        *self.backend.lock().expect("proxy backend lock poisoned") = Some(backend);
        *self.state.lock().expect("proxy state lock poisoned") = ProxyState::Ready;

        spawn_forward_task(self.clone(), backend_rx);

        let ready_ok = tokio::task::spawn_blocking(move || ready.wait()).await.unwrap_or(false);
        if !ready_ok {
            warn!(target, "terminal proxy: timed out waiting for first byte of output");
        }
        info!(target, elapsed_ms = started.elapsed().as_millis(), "terminal_proxy_ready");
        Ok(())
    }

    /// READY → SWITCHING → READY. On failure the state still returns to
    /// READY, reporting `ERR_TMUX_SWITCH_FAILED`.
    pub async fn switch(self: &Arc<Self>, new_target: &str) -> Result<(), AgentboardError> {
        {
            let mut state = self.state.lock().expect("proxy state lock poisoned");
            if *state != ProxyState::Ready {
                return Err(AgentboardError::NotReady);
            }
            *state = ProxyState::Switching;
        }
        self.suppress_output.store(true, Ordering::SeqCst);
        info!(new_target, "terminal_switch_attempt");

        let ok = match self.variant {
            ProxyVariant::Direct => {
                let target_owned = new_target.to_string();
                tokio::task::spawn_blocking(move || {
                    Cmd::new("tmux")
                        .args(["select-window", "-t", &target_owned])
                        .run_as_check()
                        .unwrap_or(false)
                })
                .await
                .unwrap_or(false)
            }
            ProxyVariant::Control => {
                let backend = self.backend.lock().expect("proxy backend lock poisoned");
                match backend.as_ref() {
                    Some(BackendHandle::Control(c)) => c.select_window(new_target).is_ok(),
                    _ => false,
                }
            }
        };

        self.suppress_output.store(false, Ordering::SeqCst);
        *self.state.lock().expect("proxy state lock poisoned") = ProxyState::Ready;

        if ok {
            *self.target.lock().expect("proxy target lock poisoned") = new_target.to_string();
            info!(new_target, "terminal_switch_success");
            Ok(())
        } else {
            warn!(new_target, "terminal_switch_failure");
            Err(AgentboardError::TmuxSwitchFailed(new_target.to_string()))
        }
    }

    /// Injects bytes into the attached child. Errors if the proxy is not
    /// currently READY: any operation on a DEAD proxy reports
    /// `ERR_NOT_READY`.
    pub fn write(&self, data: &[u8]) -> Result<(), AgentboardError> {
        if self.state() == ProxyState::Dead {
            return Err(AgentboardError::NotReady);
        }
        let target = self.target.lock().expect("proxy target lock poisoned").clone();
        let backend = self.backend.lock().expect("proxy backend lock poisoned");
        match backend.as_ref() {
            Some(BackendHandle::Direct(d)) => d.write(data).map_err(|_| AgentboardError::NotReady),
            Some(BackendHandle::Control(c)) => {
                c.write(&target, data).map_err(|_| AgentboardError::NotReady)
            }
            None => Err(AgentboardError::NotReady),
        }
    }

    /// Resizes the PTY (direct) or issues `refresh-client -C` (control).
    /// Errors are ignored.
    pub fn resize(&self, cols: u16, rows: u16) {
        let backend = self.backend.lock().expect("proxy backend lock poisoned");
        match backend.as_ref() {
            Some(BackendHandle::Direct(d)) => d.resize(cols, rows),
            Some(BackendHandle::Control(c)) => c.resize(cols, rows),
            None => {}
        }
    }

    /// Transitions to DEAD from any state and kills the backing child.
    /// Idempotent.
    pub fn dispose(&self) {
        let mut state = self.state.lock().expect("proxy state lock poisoned");
        if *state == ProxyState::Dead {
            return;
        }
        *state = ProxyState::Dead;
        drop(state);
        let backend = self.backend.lock().expect("proxy backend lock poisoned");
        match backend.as_ref() {
            Some(BackendHandle::Direct(d)) => d.dispose(),
            Some(BackendHandle::Control(c)) => c.dispose(),
            None => {}
        }
    }
}

fn spawn_forward_task(proxy: Arc<TerminalProxy>, mut backend_rx: broadcast::Receiver<ProxyEvent>) {
    tokio::spawn(async move {
        loop {
            match backend_rx.recv().await {
                Ok(ProxyEvent::Output(data)) => {
                    if proxy.suppress_output.load(Ordering::SeqCst) {
                        continue;
                    }
                    let _ = proxy.events.send(ProxyEvent::Output(data));
                }
                Ok(ProxyEvent::Exit) => {
                    mark_dead_once(&proxy);
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    mark_dead_once(&proxy);
                    break;
                }
            }
        }
    });
}

fn mark_dead_once(proxy: &Arc<TerminalProxy>) {
    if proxy.exited.swap(true, Ordering::SeqCst) {
        return;
    }
    *proxy.state.lock().expect("proxy state lock poisoned") = ProxyState::Dead;
    let _ = proxy.events.send(ProxyEvent::Exit);
    info!("terminal_proxy_dead");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_proxy_starts_idle() {
        let proxy = TerminalProxy::new(ProxyVariant::Direct);
        assert_eq!(proxy.state(), ProxyState::Idle);
    }

    #[tokio::test]
    async fn operations_before_start_report_not_ready() {
        let proxy = TerminalProxy::new(ProxyVariant::Direct);
        assert!(matches!(proxy.write(b"hi"), Err(AgentboardError::NotReady)));
        assert!(matches!(proxy.switch("agentboard:@2").await, Err(AgentboardError::NotReady)));
    }

    #[test]
    fn dispose_is_idempotent_and_reaches_dead() {
        let proxy = TerminalProxy::new(ProxyVariant::Direct);
        proxy.dispose();
        assert_eq!(proxy.state(), ProxyState::Dead);
        proxy.dispose();
        assert_eq!(proxy.state(), ProxyState::Dead);
    }
}
