//! History truncation — windowing what the model gets to see.
//!
//! Truncation never touches storage; it produces the bounded, well-formed
//! slice replayed on each model call. After windowing, tool-use blocks
//! whose result fell outside the window are dropped, and tool-result
//! blocks whose invocation fell outside likewise, so the replayed
//! sequence never contains an orphan on either side.

use std::collections::HashSet;

use krait_core::message::{ContentBlock, Message, MessageContent, Role};

/// Window `messages` to the most recent `rounds` exchanges.
///
/// A positive bound keeps the last `rounds * 2` messages; a non-positive
/// bound rewinds to the start of the most recent user turn. The result
/// is always orphan-filtered.
pub fn truncate(messages: &[Message], rounds: i64) -> Vec<Message> {
    if messages.is_empty() {
        return Vec::new();
    }
    let window: &[Message] = if rounds <= 0 {
        let start = messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .unwrap_or(0);
        &messages[start..]
    } else {
        let max = (rounds as usize).saturating_mul(2);
        if messages.len() > max {
            &messages[messages.len() - max..]
        } else {
            messages
        }
    };
    tool_safe(window)
}

/// Drop tool-use blocks without a result and tool-result blocks without
/// an invocation; messages left empty disappear entirely.
pub fn tool_safe(messages: &[Message]) -> Vec<Message> {
    let mut result_ids: HashSet<&str> = HashSet::new();
    for message in messages {
        if message.role != Role::ToolResult {
            continue;
        }
        if let MessageContent::Blocks(blocks) = &message.content {
            for block in blocks {
                if let ContentBlock::ToolResult { tool_use_id, .. } = block {
                    result_ids.insert(tool_use_id);
                }
            }
        }
    }

    // First pass: prune unanswered invocations, remember the kept ids.
    let mut kept_use_ids: HashSet<String> = HashSet::new();
    let mut cleaned: Vec<Message> = Vec::new();
    for message in messages {
        if message.role == Role::Assistant {
            if let MessageContent::Blocks(blocks) = &message.content {
                let mut kept: Vec<ContentBlock> = Vec::new();
                for block in blocks {
                    if let ContentBlock::ToolUse { id, .. } = block {
                        if !id.is_empty() && result_ids.contains(id.as_str()) {
                            kept_use_ids.insert(id.clone());
                            kept.push(block.clone());
                        }
                        continue;
                    }
                    kept.push(block.clone());
                }
                if !kept.is_empty() {
                    cleaned.push(Message {
                        role: message.role,
                        content: MessageContent::Blocks(kept),
                    });
                }
                continue;
            }
        }
        cleaned.push(message.clone());
    }

    // Second pass: prune results whose invocation was cut.
    let mut out: Vec<Message> = Vec::new();
    for message in cleaned {
        if message.role != Role::ToolResult {
            out.push(message);
            continue;
        }
        let MessageContent::Blocks(blocks) = &message.content else {
            out.push(message);
            continue;
        };
        let kept: Vec<ContentBlock> = blocks
            .iter()
            .filter(|block| {
                matches!(
                    block,
                    ContentBlock::ToolResult { tool_use_id, .. }
                        if kept_use_ids.contains(tool_use_id)
                )
            })
            .cloned()
            .collect();
        if !kept.is_empty() {
            out.push(Message {
                role: message.role,
                content: MessageContent::Blocks(kept),
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(text: &str) -> Message {
        Message::user(text)
    }

    fn assistant_with_tool(id: &str) -> Message {
        Message::assistant(vec![
            ContentBlock::text("working on it"),
            ContentBlock::tool_use(id, "memory_search", json!({"query": "x"})),
        ])
    }

    fn result_for(id: &str) -> Message {
        Message::tool_results(vec![ContentBlock::tool_result(id, "found it")])
    }

    fn all_tool_ids(messages: &[Message], want_use: bool) -> Vec<String> {
        let mut ids = Vec::new();
        for message in messages {
            if let MessageContent::Blocks(blocks) = &message.content {
                for block in blocks {
                    match block {
                        ContentBlock::ToolUse { id, .. } if want_use => ids.push(id.clone()),
                        ContentBlock::ToolResult { tool_use_id, .. } if !want_use => {
                            ids.push(tool_use_id.clone())
                        }
                        _ => {}
                    }
                }
            }
        }
        ids
    }

    #[test]
    fn positive_bound_keeps_last_rounds_times_two() {
        let messages: Vec<Message> = (0..10)
            .map(|i| {
                if i % 2 == 0 {
                    user(&format!("u{i}"))
                } else {
                    Message::assistant(format!("a{i}"))
                }
            })
            .collect();
        let truncated = truncate(&messages, 2);
        assert_eq!(truncated.len(), 4);
        assert_eq!(truncated[0].text(), "u6");
    }

    #[test]
    fn non_positive_bound_rewinds_to_last_user_turn() {
        let messages = vec![
            user("first"),
            Message::assistant("reply one"),
            user("second"),
            Message::assistant("reply two"),
        ];
        let truncated = truncate(&messages, 0);
        assert_eq!(truncated.len(), 2);
        assert_eq!(truncated[0].text(), "second");
    }

    #[test]
    fn orphaned_tool_use_is_dropped() {
        // The result was cut by the window; the invocation must go too.
        let messages = vec![assistant_with_tool("t1"), user("next question")];
        let cleaned = tool_safe(&messages);
        assert!(all_tool_ids(&cleaned, true).is_empty());
        // The text block survives even though the invocation is gone.
        assert!(cleaned[0].text().contains("working on it"));
    }

    #[test]
    fn orphaned_tool_result_is_dropped() {
        let messages = vec![result_for("t1"), user("hello")];
        let cleaned = tool_safe(&messages);
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].role, Role::User);
    }

    #[test]
    fn matched_pairs_survive() {
        let messages = vec![user("go"), assistant_with_tool("t1"), result_for("t1")];
        let cleaned = tool_safe(&messages);
        assert_eq!(cleaned.len(), 3);
        assert_eq!(all_tool_ids(&cleaned, true), vec!["t1"]);
        assert_eq!(all_tool_ids(&cleaned, false), vec!["t1"]);
    }

    #[test]
    fn no_orphans_survive_any_truncation_boundary() {
        let messages = vec![
            user("one"),
            assistant_with_tool("t1"),
            result_for("t1"),
            Message::assistant("answer one"),
            user("two"),
            assistant_with_tool("t2"),
            result_for("t2"),
            Message::assistant("answer two"),
        ];
        for rounds in 1..=5 {
            let truncated = truncate(&messages, rounds);
            let uses: HashSet<String> = all_tool_ids(&truncated, true).into_iter().collect();
            let results: HashSet<String> = all_tool_ids(&truncated, false).into_iter().collect();
            assert_eq!(uses, results, "rounds={rounds}");
        }
    }

    #[test]
    fn message_left_empty_by_pruning_disappears() {
        let only_tool = Message::assistant(vec![ContentBlock::tool_use(
            "t9",
            "delegate_task",
            json!({}),
        )]);
        let cleaned = tool_safe(&[only_tool]);
        assert!(cleaned.is_empty());
    }

    #[test]
    fn empty_history_is_fine() {
        assert!(truncate(&[], 5).is_empty());
        assert!(truncate(&[], 0).is_empty());
    }
}
