//! Log matcher: decides which candidate log, if any, belongs
//! to which live window, using ordered exact-substring matches of recent
//! user prompts as the only ground truth linking a pane's scrollback to a
//! JSONL conversation log.

pub mod gate;
pub mod prompts;
pub mod rg;

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use regex::Regex;

use prompts::{MIN_PROMPT_LEN_FOR_SOLO_MATCH, prompt_to_pattern};
use rg::{RgRunner, SearchScope};

/// Tail window read for the two-tier search.
const TAIL_BYTES: u64 = 96 * 1024;

/// A window with its extracted prompts (oldest first) and optional
/// disambiguators, ready to be matched against candidate logs.
#[derive(Debug, Clone)]
pub struct WindowCandidate {
    pub id: String,
    pub prompts: Vec<String>,
}

/// Matched-count/matched-length score from ordered user-message matching.
/// Ordered lexicographically: compared as a tuple.
pub type Score = (usize, usize);

/// Counts and durations for each profiled operation. An optional observer,
/// cheap to no-op when absent.
#[derive(Debug, Default)]
pub struct Profiler {
    counts: Mutex<HashMap<&'static str, (u64, Duration)>>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, label: &'static str, elapsed: Duration) {
        let mut counts = self.counts.lock().expect("profiler lock poisoned");
        let entry = counts.entry(label).or_insert((0, Duration::ZERO));
        entry.0 += 1;
        entry.1 += elapsed;
    }

    pub fn snapshot(&self) -> HashMap<&'static str, (u64, Duration)> {
        self.counts.lock().expect("profiler lock poisoned").clone()
    }

    fn time<T>(profiler: Option<&Profiler>, label: &'static str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        if let Some(p) = profiler {
            p.record(label, start.elapsed());
        }
        result
    }
}

/// Step 4: narrow a candidate-log set by progressively intersecting `rg -l`
/// results for the longest prompts first, stopping as soon as the
/// intersection shrinks to one. Returns an empty set if disambiguation was
/// needed but the remaining prompts are all below the solo-match threshold.
fn narrow_candidates(
    prompts: &[String],
    scope: SearchScope<'_>,
    rg: &dyn RgRunner,
    profiler: Option<&Profiler>,
) -> Vec<PathBuf> {
    let mut sorted: Vec<&String> = prompts.iter().collect();
    sorted.sort_by_key(|p| std::cmp::Reverse(p.len()));

    let mut candidates: Option<Vec<PathBuf>> = None;
    let mut prompts_used = 0usize;

    for prompt in &sorted {
        if prompt.len() < MIN_PROMPT_LEN_FOR_SOLO_MATCH {
            if prompts_used == 0 {
                // Not even one usable prompt: nothing to search on.
                return Vec::new();
            }
            // Further prompts are all too short to disambiguate further.
            break;
        }
        let pattern = prompt_to_pattern(prompt);
        let matched = Profiler::time(profiler, "rg_list", || rg.list_matches(&pattern, clone_scope(&scope)));
        prompts_used += 1;

        candidates = Some(match candidates {
            None => matched,
            Some(prev) => prev.into_iter().filter(|p| matched.contains(p)).collect(),
        });

        if candidates.as_ref().map(|c| c.len()).unwrap_or(0) <= 1 {
            break;
        }
    }

    candidates.unwrap_or_default()
}

fn clone_scope<'a>(scope: &SearchScope<'a>) -> SearchScope<'a> {
    match scope {
        SearchScope::Directories(d) => SearchScope::Directories(d),
        SearchScope::Paths(p) => SearchScope::Paths(p),
    }
}

/// Narrows to a single log, or `None` if zero or more than one candidate
/// remain after disambiguation.
pub fn try_exact_match_window_to_log(
    prompts: &[String],
    scope: SearchScope<'_>,
    rg: &dyn RgRunner,
) -> Option<PathBuf> {
    let candidates = narrow_candidates(prompts, scope, rg, None);
    if candidates.len() == 1 { candidates.into_iter().next() } else { None }
}

fn read_tail(path: &Path, max_bytes: u64) -> String {
    let Ok(mut file) = fs::File::open(path) else {
        return String::new();
    };
    let Ok(metadata) = file.metadata() else {
        return String::new();
    };
    let len = metadata.len();
    let start = len.saturating_sub(max_bytes);
    if file.seek(SeekFrom::Start(start)).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Ordered user-message matching: iterate prompts oldest to newest,
/// advancing a cursor through `text`; each prompt found at
/// or after the cursor counts once and contributes its length.
fn score_ordered(prompts: &[String], text: &str) -> Score {
    let mut cursor = 0usize;
    let mut count = 0usize;
    let mut length = 0usize;
    for prompt in prompts {
        if prompt.is_empty() {
            continue;
        }
        let pattern = prompt_to_pattern(prompt);
        let Ok(re) = Regex::new(&pattern) else {
            continue;
        };
        let search_from = cursor.min(text.len());
        if let Some(m) = re.find_at(text, search_from) {
            cursor = m.end();
            count += 1;
            length += prompt.len();
        }
    }
    (count, length)
}

/// Ordered matching over the whole file via `rg --json` line-number matches
/// instead of a loaded buffer: each prompt in turn must match on or after
/// the line of the previous prompt's match, the same ordering rule
/// [`score_ordered`] applies to byte offsets.
fn score_ordered_via_rg(prompts: &[String], candidate: &Path, rg: &dyn RgRunner, profiler: Option<&Profiler>) -> Score {
    let mut cursor_line = 0u64;
    let mut count = 0usize;
    let mut length = 0usize;
    for prompt in prompts {
        if prompt.is_empty() {
            continue;
        }
        let pattern = prompt_to_pattern(prompt);
        let matches =
            Profiler::time(profiler, "rg_json", || rg.json_line_matches(&pattern, candidate));
        if let Some(m) = matches.iter().find(|m| m.line_number >= cursor_line) {
            cursor_line = m.line_number;
            count += 1;
            length += prompt.len();
        }
    }
    (count, length)
}

/// Score `candidate` against `prompts` using the two-tier search: tail first,
/// falling back to a full-file `rg --json` re-score when the tail is
/// ambiguous.
fn score_candidate(prompts: &[String], candidate: &Path, rg: &dyn RgRunner, profiler: Option<&Profiler>) -> Score {
    let tail = Profiler::time(profiler, "tail_read", || read_tail(candidate, TAIL_BYTES));
    let tail_score = score_ordered(prompts, &tail);
    if tail_score.0 >= 2 {
        return tail_score;
    }
    score_ordered_via_rg(prompts, candidate, rg, profiler)
}

/// Full pipeline, minus pane capture/extraction which the caller already
/// performed: given a set of windows (each with its prompts already
/// extracted) and a search scope, returns a map of window id -> matched log
/// path. `candidate_filter`, when supplied, applies agent-kind and
/// project-path filtering; it receives a candidate path and should return
/// `true` to keep it.
pub fn match_windows_to_logs(
    windows: &[WindowCandidate],
    scope: SearchScope<'_>,
    rg: &dyn RgRunner,
    candidate_filter: Option<&dyn Fn(&Path) -> bool>,
    profiler: Option<&Profiler>,
) -> HashMap<String, PathBuf> {
    // log path -> claimants (window id, score)
    let mut claims: HashMap<PathBuf, Vec<(String, Score)>> = HashMap::new();

    for window in windows {
        let mut candidates = narrow_candidates(&window.prompts, clone_scope(&scope), rg, profiler);
        if let Some(filter) = candidate_filter {
            candidates.retain(|c| filter(c));
        }
        if candidates.is_empty() {
            continue;
        }

        let chosen = if candidates.len() == 1 {
            Some(candidates[0].clone())
        } else {
            let mut scored: Vec<(PathBuf, Score)> = candidates
                .iter()
                .map(|c| (c.clone(), score_candidate(&window.prompts, c, rg, profiler)))
                .collect();
            scored.sort_by(|a, b| b.1.cmp(&a.1));
            if scored.len() >= 2 && scored[0].1 == scored[1].1 {
                if let Some(p) = profiler {
                    p.record("tie_break_retry", Duration::ZERO);
                }
                None
            } else {
                scored.first().map(|(p, _)| p.clone())
            }
        };

        if let Some(log) = chosen {
            let score = score_candidate(&window.prompts, &log, rg, profiler);
            claims.entry(log).or_default().push((window.id.clone(), score));
        }
    }

    let mut result = HashMap::new();
    for (log, mut claimants) in claims {
        if claimants.len() == 1 {
            result.insert(claimants.remove(0).0, log);
            continue;
        }
        claimants.sort_by(|a, b| b.1.cmp(&a.1));
        // Final sweep: strict win required, tie drops the log entirely.
        if claimants[0].1 != claimants[1].1 {
            result.insert(claimants[0].0.clone(), log);
        }
    }
    result
}
