//! Scrollback → prompt extraction.
//!
//! Pulls up to [`MAX_PROMPTS`] of the most recent user-typed prompts out of a
//! captured pane's scrollback, rejecting lines that belong to the CLI's
//! currently-being-typed input field rather than a submitted prompt.

use std::sync::LazyLock;

use regex::Regex;

/// Cap on how many recent prompts a single scrollback capture contributes.
pub const MAX_PROMPTS: usize = 8;

/// Below this length a prompt pattern is too ambiguous to search on alone.
pub const MIN_PROMPT_LEN_FOR_SOLO_MATCH: usize = 5;

const PROMPT_GLYPHS: &[char] = &['❯', '›'];
const OPTIONAL_PREFIXES: &[char] = &['>', '#', '*', '$'];
const SEND_HINT_GLYPH: char = '↵';
const UI_GLYPHS_TO_STRIP: &[char] = &['•', '❯', '⏵', '⏺', '↵', '›'];

static CURRENT_INPUT_INDICATOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\?\s*for\s*shortcuts|\[\d{1,3}%\]|\d{1,3}%\s*context\s*left)")
        .expect("valid regex")
});

static TIMER_FRAGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\d+s[^)]*\)").expect("valid regex"));

static WHITESPACE_RUN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// True if `line`, after skipping leading whitespace and any single optional
/// prefix character, starts with one of the prompt glyphs.
fn starts_with_prompt_glyph(line: &str) -> bool {
    let trimmed = line.trim_start();
    let mut chars = trimmed.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if PROMPT_GLYPHS.contains(&first) {
        return true;
    }
    if OPTIONAL_PREFIXES.contains(&first) {
        let rest = chars.as_str().trim_start();
        return rest.chars().next().is_some_and(|c| PROMPT_GLYPHS.contains(&c));
    }
    false
}

fn clean_prompt_text(line: &str) -> String {
    let without_glyphs: String = line.chars().filter(|c| !UI_GLYPHS_TO_STRIP.contains(c)).collect();
    let without_timers = TIMER_FRAGMENT_RE.replace_all(&without_glyphs, " ");
    let collapsed = WHITESPACE_RUN_RE.replace_all(without_timers.trim(), " ");
    collapsed.trim().to_string()
}

/// Extract up to [`MAX_PROMPTS`] most recent user prompts from `scrollback`,
/// oldest first within the returned window. Lines belonging to the current
/// (not-yet-submitted) input field are rejected by checking for a nearby
/// status-line indicator within a few lines of context.
pub fn extract_user_prompts(scrollback: &str) -> Vec<String> {
    let lines: Vec<&str> = scrollback.lines().collect();
    let mut candidates: Vec<String> = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        if !starts_with_prompt_glyph(line) {
            continue;
        }
        if line.contains(SEND_HINT_GLYPH) {
            continue;
        }

        let context_start = i.saturating_sub(2);
        let context_end = (i + 3).min(lines.len());
        let nearby = lines[context_start..context_end].join("\n");
        if CURRENT_INPUT_INDICATOR_RE.is_match(&nearby) {
            continue;
        }

        let cleaned = clean_prompt_text(line);
        if !cleaned.is_empty() {
            candidates.push(cleaned);
        }
    }

    let start = candidates.len().saturating_sub(MAX_PROMPTS);
    candidates.split_off(start)
}

/// Convert a prompt to a regex pattern: escape regex meta-characters, then
/// replace each run of whitespace with `\s+` so it matches across
/// slightly-different whitespace in the log file.
pub fn prompt_to_pattern(prompt: &str) -> String {
    let escaped = regex::escape(prompt);
    let collapsed = WHITESPACE_RUN_RE.replace_all(&escaped, " ");
    collapsed.split(' ').collect::<Vec<_>>().join(r"\s+")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_plain_prompt_line() {
        let scrollback = "some output\n❯ alpha one\nmore output\n";
        let prompts = extract_user_prompts(scrollback);
        assert_eq!(prompts, vec!["alpha one"]);
    }

    #[test]
    fn extracts_in_submission_order_oldest_first() {
        let scrollback = "❯ alpha one\noutput\n❯ alpha two\noutput\n❯ alpha three\n";
        let prompts = extract_user_prompts(scrollback);
        assert_eq!(prompts, vec!["alpha one", "alpha two", "alpha three"]);
    }

    #[test]
    fn caps_at_max_prompts_keeping_most_recent() {
        let mut scrollback = String::new();
        for i in 0..12 {
            scrollback.push_str(&format!("❯ prompt {i}\noutput\n"));
        }
        let prompts = extract_user_prompts(&scrollback);
        assert_eq!(prompts.len(), MAX_PROMPTS);
        assert_eq!(prompts.last().unwrap(), "prompt 11");
        assert_eq!(prompts.first().unwrap(), "prompt 4");
    }

    #[test]
    fn rejects_current_input_field_near_shortcuts_hint() {
        let scrollback = "❯ not yet submitted\n? for shortcuts\n";
        assert!(extract_user_prompts(scrollback).is_empty());
    }

    #[test]
    fn rejects_lines_with_send_hint_glyph() {
        let scrollback = "❯ still typing ↵ to send\n";
        assert!(extract_user_prompts(scrollback).is_empty());
    }

    #[test]
    fn accepts_optional_prefix_before_glyph() {
        let scrollback = "> ❯ alpha one\n";
        assert_eq!(extract_user_prompts(scrollback), vec!["alpha one"]);
    }

    #[test]
    fn collapses_ui_glyphs_and_timer_fragments() {
        let scrollback = "❯ ⏺ alpha (12s elapsed) one\n";
        assert_eq!(extract_user_prompts(scrollback), vec!["alpha one"]);
    }

    #[test]
    fn pattern_matches_across_differing_whitespace() {
        let pattern = prompt_to_pattern("alpha  one");
        let re = Regex::new(&format!("^{pattern}$")).unwrap();
        assert!(re.is_match("alpha one"));
        assert!(re.is_match("alpha\tone"));
        assert!(re.is_match("alpha\n one"));
    }

    #[test]
    fn pattern_escapes_regex_metacharacters() {
        let pattern = prompt_to_pattern("fn foo() -> Result<()>");
        let re = Regex::new(&pattern).unwrap();
        assert!(re.is_match("fn foo() -> Result<()>"));
    }
}
