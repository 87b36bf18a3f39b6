//! Status inference, grounded on
//! `workmux::command::dashboard::monitor::AgentMonitor`'s content-hash
//! diffing and stall timer, reshaped from a 2-way stalled/not-stalled signal
//! into the 3-way `working`/`waiting`/`permission` status (plus `unknown`
//! for a pane never seen before), with its own debounce
//! window rather than an immediate stall flag.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;

use crate::model::AgentStatus;

/// How long a pane's content must stay unchanged before `working` degrades
/// to `waiting` (the "working-grace duration").
pub const DEFAULT_WORKING_GRACE: Duration = Duration::from_secs(10);

/// A single window's pane-cache entry: the previous capture, the
/// previous dimensions, the last time content changed, and the last computed
/// status. Owned exclusively by the refresh worker.
#[derive(Debug, Clone)]
pub struct PaneCacheEntry {
    pub normalized_content: String,
    pub cols: u16,
    pub rows: u16,
    pub last_changed: Instant,
    pub status: AgentStatus,
}

/// Strip ANSI escapes and collapse control characters, so that two captures
/// that differ only in cursor-positioning or color codes compare equal.
pub fn normalize(raw: &str) -> String {
    let stripped = strip_ansi_escapes::strip(raw.as_bytes());
    let text = String::from_utf8_lossy(&stripped).into_owned();
    text.chars()
        .map(|c| if c.is_control() && c != '\n' { ' ' } else { c })
        .collect()
}

static PERMISSION_PROMPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(do you want to|allow this|y/n|\(y/n\)|permission|approve\b|\[a\]llow)")
        .expect("valid regex")
});

/// A separate detector scanning the tail of a capture for a permission-prompt
/// glyph pattern. Operates on the last few lines only,
/// since prompts are always rendered at the bottom of the pane.
fn looks_like_permission_prompt(normalized: &str) -> bool {
    let tail: String = normalized
        .lines()
        .rev()
        .take(6)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join("\n");
    PERMISSION_PROMPT_RE.is_match(&tail)
}

/// Run the 5-step algorithm and return the new status, the
/// (possibly unchanged) last-changed instant, and the replacement cache entry.
/// Writers must replace the prior cache entry atomically per window.
pub fn infer_status(
    previous: Option<&PaneCacheEntry>,
    raw_capture: &str,
    cols: u16,
    rows: u16,
    now: Instant,
    working_grace: Duration,
) -> (AgentStatus, Instant, PaneCacheEntry) {
    let normalized = normalize(raw_capture);

    let Some(prev) = previous else {
        // Step 1: never seen before -- seed the cache and return `unknown`.
        return (
            AgentStatus::Unknown,
            now,
            PaneCacheEntry {
                normalized_content: normalized,
                cols,
                rows,
                last_changed: now,
                status: AgentStatus::Unknown,
            },
        );
    };

    // Step 2: a resize alone does not imply activity -- keep the previous status.
    if prev.cols != cols || prev.rows != rows {
        return (
            prev.status,
            prev.last_changed,
            PaneCacheEntry {
                normalized_content: normalized,
                cols,
                rows,
                last_changed: prev.last_changed,
                status: prev.status,
            },
        );
    }

    let (mut status, last_changed) = if prev.normalized_content != normalized {
        // Step 3: content differs -- working, and the clock resets.
        (AgentStatus::Working, now)
    } else if now.saturating_duration_since(prev.last_changed) > working_grace {
        // Step 4: unchanged for longer than the grace window -- waiting.
        (AgentStatus::Waiting, prev.last_changed)
    } else {
        (prev.status, prev.last_changed)
    };

    // Step 5: permission-prompt override, independent of the working/waiting split.
    if looks_like_permission_prompt(&normalized) {
        status = AgentStatus::Permission;
    }

    (
        status,
        last_changed,
        PaneCacheEntry {
            normalized_content: normalized,
            cols,
            rows,
            last_changed,
            status,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(content: &str, status: AgentStatus, last_changed: Instant) -> PaneCacheEntry {
        PaneCacheEntry {
            normalized_content: content.to_string(),
            cols: 80,
            rows: 24,
            last_changed,
            status,
        }
    }

    #[test]
    fn unseen_pane_is_unknown() {
        let now = Instant::now();
        let (status, _, cache) = infer_status(None, "hello", 80, 24, now, DEFAULT_WORKING_GRACE);
        assert_eq!(status, AgentStatus::Unknown);
        assert_eq!(cache.status, AgentStatus::Unknown);
    }

    #[test]
    fn resize_preserves_previous_status_without_implying_activity() {
        let now = Instant::now();
        let prev = entry("same", AgentStatus::Waiting, now);
        let (status, last_changed, _) = infer_status(Some(&prev), "same", 100, 30, now, DEFAULT_WORKING_GRACE);
        assert_eq!(status, AgentStatus::Waiting);
        assert_eq!(last_changed, now);
    }

    #[test]
    fn differing_content_is_working_and_resets_clock() {
        let earlier = Instant::now();
        let now = earlier + Duration::from_secs(1);
        let prev = entry("old content", AgentStatus::Waiting, earlier);
        let (status, last_changed, cache) =
            infer_status(Some(&prev), "new content", 80, 24, now, DEFAULT_WORKING_GRACE);
        assert_eq!(status, AgentStatus::Working);
        assert_eq!(last_changed, now);
        assert_eq!(cache.normalized_content, "new content");
    }

    #[test]
    fn unchanged_content_past_grace_window_becomes_waiting() {
        let earlier = Instant::now();
        let now = earlier + DEFAULT_WORKING_GRACE + Duration::from_secs(1);
        let prev = entry("same content", AgentStatus::Working, earlier);
        let (status, last_changed, _) =
            infer_status(Some(&prev), "same content", 80, 24, now, DEFAULT_WORKING_GRACE);
        assert_eq!(status, AgentStatus::Waiting);
        assert_eq!(last_changed, earlier);
    }

    #[test]
    fn unchanged_content_within_grace_window_stays_working() {
        let earlier = Instant::now();
        let now = earlier + Duration::from_millis(100);
        let prev = entry("same content", AgentStatus::Working, earlier);
        let (status, _, _) =
            infer_status(Some(&prev), "same content", 80, 24, now, DEFAULT_WORKING_GRACE);
        assert_eq!(status, AgentStatus::Working);
    }

    #[test]
    fn permission_prompt_overrides_working_or_waiting() {
        let now = Instant::now();
        let prev = entry("old", AgentStatus::Working, now);
        let (status, _, _) = infer_status(
            Some(&prev),
            "Do you want to proceed? (y/n)",
            80,
            24,
            now,
            DEFAULT_WORKING_GRACE,
        );
        assert_eq!(status, AgentStatus::Permission);
    }

    #[test]
    fn normalize_strips_ansi_and_control_chars() {
        let raw = "\x1b[31mred\x1b[0m text\x07";
        let normalized = normalize(raw);
        assert!(!normalized.contains('\x1b'));
        assert!(normalized.contains("red"));
        assert!(normalized.contains("text"));
    }
}
