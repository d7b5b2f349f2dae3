//! Result of one delegated task run.

use serde::{Deserialize, Serialize};

/// Inline output above this many characters is head+tail truncated.
pub const OUTPUT_TRUNCATE_CHARS: usize = 50_000;

/// What a single subprocess run produced.
///
/// Serialized to JSON when handed back as a tool result; the history
/// slimmer recognizes the `artifact_path` key and collapses the payload
/// to a one-line summary on later turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub ok: bool,
    /// Configured runner name this outcome came from.
    pub runner: String,
    pub cwd: String,
    /// Process exit code, -1 when the child never exited cleanly.
    pub exit_code: i64,
    /// Full untruncated output on disk, if the write succeeded.
    pub artifact_path: Option<String>,
    /// Inline output, truncated at [`OUTPUT_TRUNCATE_CHARS`].
    pub output: String,
}

impl TaskOutcome {
    pub fn failure(runner: &str, cwd: &str, output: String) -> Self {
        Self {
            ok: false,
            runner: runner.to_string(),
            cwd: cwd.to_string(),
            exit_code: -1,
            artifact_path: None,
            output,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!("{{\"ok\":{},\"runner\":{:?},\"output\":\"\"}}", self.ok, self.runner)
        })
    }
}

/// Head+tail truncation at a character budget, with an omitted-count
/// marker in the middle. Under budget the text passes through untouched.
pub fn truncate_output(text: &str, limit: usize) -> String {
    let total = text.chars().count();
    if total <= limit {
        return text.to_string();
    }
    let keep = limit / 2;
    let head: String = text.chars().take(keep).collect();
    let tail: String = text
        .chars()
        .skip(total - keep)
        .collect();
    let omitted = total - keep * 2;
    format!("{head}\n... [{omitted} chars omitted] ...\n{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_output_passes_through() {
        assert_eq!(truncate_output("hello", 100), "hello");
    }

    #[test]
    fn long_output_keeps_head_and_tail() {
        let text = format!("{}{}{}", "a".repeat(40_000), "MIDDLE", "z".repeat(40_000));
        let truncated = truncate_output(&text, OUTPUT_TRUNCATE_CHARS);
        assert!(truncated.starts_with("aaaa"));
        assert!(truncated.ends_with("zzzz"));
        assert!(truncated.contains("chars omitted"));
        assert!(!truncated.contains("MIDDLE"));
        assert!(truncated.chars().count() < text.chars().count());
    }

    #[test]
    fn omitted_count_is_exact() {
        let text = "x".repeat(60_000);
        let truncated = truncate_output(&text, 50_000);
        assert!(truncated.contains("[10000 chars omitted]"));
    }

    #[test]
    fn outcome_json_carries_artifact_path() {
        let outcome = TaskOutcome {
            ok: true,
            runner: "coder".into(),
            cwd: "/tmp/run".into(),
            exit_code: 0,
            artifact_path: Some("/tmp/run/output.log".into()),
            output: "done".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&outcome.to_json()).unwrap();
        assert_eq!(value["artifact_path"], "/tmp/run/output.log");
        assert_eq!(value["ok"], true);
        assert_eq!(value["exit_code"], 0);
    }
}
