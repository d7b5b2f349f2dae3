//! History slimming — lossy, irreversible reduction of message content
//! before it reaches durable storage (and the live buffer between rounds).
//!
//! Unbounded artifacts (images, delegated-task logs, embedded files) must
//! not accumulate in the replay context or the store; the agent keeps a
//! stable pointer (filename, artifact path, success flag) instead.
//!
//! The transform is idempotent: every placeholder and summary it produces
//! is below the summarization threshold and is never reprocessed.

use krait_config::SlimConfig;
use krait_core::message::{ContentBlock, MessageContent, Role};
use serde_json::Value;

/// Slimming thresholds. These are policy, not contract — tune per deploy.
#[derive(Debug, Clone)]
pub struct SlimPolicy {
    /// Tool-result payloads longer than this get summarized.
    pub threshold: usize,

    /// Characters of raw text kept in a fallback preview.
    pub preview: usize,
}

impl Default for SlimPolicy {
    fn default() -> Self {
        Self {
            threshold: 200,
            preview: 80,
        }
    }
}

impl From<&SlimConfig> for SlimPolicy {
    fn from(config: &SlimConfig) -> Self {
        Self {
            threshold: config.threshold,
            preview: config.preview,
        }
    }
}

impl SlimPolicy {
    pub fn new(threshold: usize, preview: usize) -> Self {
        Self { threshold, preview }
    }

    /// Apply slimming rules to a message payload.
    ///
    /// Plain-text payloads pass through untouched; block payloads are
    /// rewritten block by block. Never fails: a summarization parse error
    /// falls back to a truncated text preview.
    pub fn slim(&self, _role: Role, content: &MessageContent) -> MessageContent {
        let MessageContent::Blocks(blocks) = content else {
            return content.clone();
        };
        let slimmed = blocks.iter().map(|b| self.slim_block(b)).collect();
        MessageContent::Blocks(slimmed)
    }

    fn slim_block(&self, block: &ContentBlock) -> ContentBlock {
        match block {
            ContentBlock::Image { .. } => ContentBlock::text("[image omitted]"),
            ContentBlock::Text { text } => {
                if let Some(name) = embedded_file_name(text) {
                    ContentBlock::text(format!("[file {name} omitted]"))
                } else {
                    block.clone()
                }
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                if self.should_slim_tool_result(content) {
                    ContentBlock::ToolResult {
                        tool_use_id: tool_use_id.clone(),
                        content: self.summarize_tool_result(content),
                        is_error: *is_error,
                    }
                } else {
                    block.clone()
                }
            }
            ContentBlock::ToolUse { .. } => block.clone(),
        }
    }

    /// Results carrying an on-disk artifact reference are always slimmed;
    /// anything else only when it exceeds the length threshold.
    fn should_slim_tool_result(&self, raw: &str) -> bool {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) {
            if map
                .get("artifact_path")
                .and_then(Value::as_str)
                .is_some_and(|p| !p.is_empty())
            {
                return true;
            }
        }
        raw.chars().count() > self.threshold
    }

    fn summarize_tool_result(&self, raw: &str) -> String {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) {
            let artifact = map
                .get("artifact_path")
                .and_then(Value::as_str)
                .filter(|p| !p.is_empty());
            if let (Some(ok), Some(path)) = (map.get("ok").and_then(Value::as_bool), artifact) {
                let runner = map.get("runner").and_then(Value::as_str).unwrap_or("task");
                let status = if ok {
                    "succeeded".to_string()
                } else {
                    let exit = map.get("exit_code").and_then(Value::as_i64).unwrap_or(-1);
                    format!("failed (exit={exit})")
                };
                return self.cap(format!("[{runner} task {status}, full output at {path}]"));
            }
            let keys: Vec<&str> = map.keys().take(5).map(String::as_str).collect();
            return self.cap(format!(
                "[tool result: {{{}…}}, {} chars omitted]",
                keys.join(", "),
                raw.chars().count()
            ));
        }
        let preview: String = raw
            .chars()
            .take(self.preview)
            .map(|c| if c == '\n' { ' ' } else { c })
            .collect();
        self.cap(format!(
            "[tool result: {preview}… ({} chars omitted)]",
            raw.chars().count()
        ))
    }

    /// Keep summaries strictly under the threshold so a second slimming
    /// pass leaves them alone.
    fn cap(&self, summary: String) -> String {
        if summary.chars().count() <= self.threshold {
            summary
        } else {
            let head: String = summary.chars().take(self.threshold.saturating_sub(2)).collect();
            format!("{head}…]")
        }
    }
}

/// Detect the `[file: name]` + fenced-body convention used when a user
/// attachment is inlined into a text block. Returns the filename.
fn embedded_file_name(text: &str) -> Option<&str> {
    let rest = text.strip_prefix("[file: ")?;
    let end = rest.find(']')?;
    if rest[end..].contains("\n```") {
        Some(&rest[..end])
    } else {
        None
    }
}
