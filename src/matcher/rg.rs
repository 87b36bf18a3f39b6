//! `rg` subprocess wrappers, built on [`Cmd`].
//!
//! Implements the injected-spawn-function test-double pattern: [`RgRunner`]
//! is a trait with a real subprocess implementation ([`RealRgRunner`]) and a
//! fake implementation for tests.

use std::path::{Path, PathBuf};

use crate::cmd::Cmd;

/// One line-number match from an `rg --json` run, used to order matches
/// during the tail/full-file tie-break re-score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonMatch {
    pub line_number: u64,
}

/// Where an `rg` search should look: a directory tree restricted by a glob,
/// or a caller-supplied list of candidate paths.
#[derive(Debug, Clone)]
pub enum SearchScope<'a> {
    Directories(&'a [PathBuf]),
    Paths(&'a [PathBuf]),
}

pub trait RgRunner: Send + Sync {
    /// `rg -l -e <pattern>`, returning the set of files containing at least
    /// one match. All I/O/exit-code failures are treated as "no match",
    /// never propagated as an error.
    fn list_matches(&self, pattern: &str, scope: SearchScope<'_>) -> Vec<PathBuf>;

    /// `rg --json -e <pattern> <path>`, returning the matched line numbers in
    /// file order. Empty on any failure.
    fn json_line_matches(&self, pattern: &str, path: &Path) -> Vec<JsonMatch>;
}

pub struct RealRgRunner;

impl RgRunner for RealRgRunner {
    fn list_matches(&self, pattern: &str, scope: SearchScope<'_>) -> Vec<PathBuf> {
        let mut cmd = Cmd::new("rg").args(["-l", "-e", pattern]);
        match scope {
            SearchScope::Directories(dirs) => {
                cmd = cmd.args(["--glob", "**/*.jsonl"]);
                for dir in dirs {
                    cmd = cmd.arg(dir.to_string_lossy().into_owned());
                }
            }
            SearchScope::Paths(paths) => {
                for path in paths {
                    cmd = cmd.arg(path.to_string_lossy().into_owned());
                }
            }
        }
        match cmd.run_and_capture_stdout() {
            Ok(out) => out.lines().map(PathBuf::from).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn json_line_matches(&self, pattern: &str, path: &Path) -> Vec<JsonMatch> {
        let out = match Cmd::new("rg")
            .args(["--json", "-e", pattern])
            .arg(path.to_string_lossy().into_owned())
            .run_and_capture_stdout()
        {
            Ok(out) => out,
            Err(_) => return Vec::new(),
        };
        out.lines()
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
            .filter(|v| v.get("type").and_then(|t| t.as_str()) == Some("match"))
            .filter_map(|v| v.pointer("/data/line_number").and_then(|n| n.as_u64()))
            .map(|line_number| JsonMatch { line_number })
            .collect()
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashMap;

    /// A fake [`RgRunner`] whose responses are configured directly, for unit
    /// tests of the matcher orchestration without invoking a real `rg`
    /// subprocess or real files.
    #[derive(Default)]
    pub struct FakeRgRunner {
        pub list_responses: HashMap<String, Vec<PathBuf>>,
        pub json_responses: HashMap<(String, PathBuf), Vec<JsonMatch>>,
    }

    impl RgRunner for FakeRgRunner {
        fn list_matches(&self, pattern: &str, _scope: SearchScope<'_>) -> Vec<PathBuf> {
            self.list_responses.get(pattern).cloned().unwrap_or_default()
        }

        fn json_line_matches(&self, pattern: &str, path: &Path) -> Vec<JsonMatch> {
            self.json_responses
                .get(&(pattern.to_string(), path.to_path_buf()))
                .cloned()
                .unwrap_or_default()
        }
    }
}
