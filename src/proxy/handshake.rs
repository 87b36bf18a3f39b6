//! Terminal proxy readiness handshake, adapted from
//! `workmux::multiplexer::handshake::PaneHandshake`'s lock/spawn/poll/cleanup
//! shape. There, the wait step blocks on `tmux wait-for` until a shell
//! signals it has started; here there is no shell-startup signal to wait
//! for, only "has the PTY reader produced its first output yet" -- so the
//! wait step polls a flag the reader task sets instead of blocking on a
//! tmux channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// How long `start()` waits for the first byte of output before giving up
/// and reporting `ERR_TMUX_ATTACH_FAILED`.
const READY_TIMEOUT: Duration = Duration::from_secs(5);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A cheap, cloneable readiness signal shared between a proxy's reader task
/// (which calls [`ReadyFlag::signal`] once) and the task driving `start()`
/// (which calls [`ReadyFlag::wait`], blocking).
#[derive(Clone)]
pub struct ReadyFlag(Arc<AtomicBool>);

impl ReadyFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Blocks the calling (blocking) thread until [`signal`] has fired or
    /// [`READY_TIMEOUT`] elapses. Returns `false` on timeout.
    pub fn wait(&self) -> bool {
        let start = Instant::now();
        while !self.is_ready() {
            if start.elapsed() > READY_TIMEOUT {
                return false;
            }
            std::thread::sleep(READY_POLL_INTERVAL);
        }
        true
    }
}

impl Default for ReadyFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_true_once_signaled() {
        let flag = ReadyFlag::new();
        let waiter = flag.clone();
        let handle = std::thread::spawn(move || waiter.wait());
        std::thread::sleep(Duration::from_millis(20));
        flag.signal();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn is_ready_reflects_signal_state() {
        let flag = ReadyFlag::new();
        assert!(!flag.is_ready());
        flag.signal();
        assert!(flag.is_ready());
    }
}
