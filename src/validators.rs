//! Pure predicates on session IDs and tmux targets.
//!
//! Applied before every command-line invocation of tmux to prevent argument
//! injection; failure is a fatal request error reported to the caller.

use std::sync::LazyLock;

use regex::Regex;

/// Upper bound on any string accepted by either validator.
pub const MAX_LEN: usize = 4096;

static SESSION_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.:@-]+$").expect("valid regex"));

// An optional `sessionName:` prefix (alphanumerics, dot, hyphen, underscore),
// followed by either `@<digits>` (a window id) or an alphanumeric/punctuation
// window name.
static TMUX_TARGET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_.-]+:)?(@[0-9]+|[A-Za-z0-9_.:@-]+)$").expect("valid regex")
});

/// True if `s` is a non-empty string of at most [`MAX_LEN`] characters
/// matching `[A-Za-z0-9_.:@-]+`.
pub fn is_valid_session_id(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_LEN {
        return false;
    }
    SESSION_ID_RE.is_match(s)
}

/// True if `s` is a non-empty string of at most [`MAX_LEN`] characters
/// matching the tmux target grammar: an optional `session:` prefix followed
/// by either a `@<digits>` window id or a bare window name.
pub fn is_valid_tmux_target(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_LEN {
        return false;
    }
    TMUX_TARGET_RE.is_match(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("agentboard", true)]
    #[case("claude-session-123", true)]
    #[case("a.b:c@d-e_f", true)]
    #[case("", false)]
    #[case("has space", false)]
    #[case("semi;colon", false)]
    #[case("pipe|here", false)]
    fn session_id_alphabet(#[case] input: &str, #[case] expected: bool) {
        assert_eq!(is_valid_session_id(input), expected);
    }

    #[test]
    fn session_id_rejects_oversize_input() {
        let too_long = "a".repeat(MAX_LEN + 1);
        assert!(!is_valid_session_id(&too_long));
        let exactly_max = "a".repeat(MAX_LEN);
        assert!(is_valid_session_id(&exactly_max));
    }

    #[rstest]
    #[case("agentboard:@1", true)]
    #[case("@3", true)]
    #[case("agentboard:my-window", true)]
    #[case("my-window", true)]
    #[case("", false)]
    #[case("agentboard:@1; rm -rf /", false)]
    #[case("agentboard:`touch pwned`", false)]
    fn tmux_target_grammar(#[case] input: &str, #[case] expected: bool) {
        assert_eq!(is_valid_tmux_target(input), expected);
    }

    #[test]
    fn tmux_target_rejects_oversize_input() {
        let too_long = "a".repeat(MAX_LEN + 1);
        assert!(!is_valid_tmux_target(&too_long));
    }
}
