//! Fire-and-forget session title generation.
//!
//! Titles come from a dedicated (usually cheap) model. Generation is
//! retried on a short backoff schedule, gives up immediately on rate
//! limits, and never surfaces a failure to the user.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use tracing::{info, warn};

use krait_core::client::{ChatClient, ChatRequest};
use krait_core::error::Error;
use krait_core::message::{Message, MessageContent};
use krait_store::{MessageRecord, Store};

pub const TITLE_RETRY_DELAYS: [u64; 4] = [0, 3, 15, 60];
pub const TITLE_MAX_LEN: usize = 30;

const TITLE_PROMPT: &str = "Generate a short title (at most five words) for this conversation. \
    Output ONLY the title itself. No quotes, no explanation, no punctuation.";

fn think_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("static regex"))
}

fn think_open_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*").expect("static regex"))
}

/// Strip thinking tags and quotes, take the first non-empty line, cap
/// the length. Unclosed `<think>` blocks happen when the response was
/// cut off by max_tokens.
pub fn clean_title(raw: &str) -> String {
    let text = think_re().replace_all(raw, "");
    let text = think_open_re().replace_all(&text, "");
    let text = text.trim().trim_matches(|c| c == '"' || c == '\'');
    for line in text.split('\n') {
        let line = line.trim();
        if !line.is_empty() {
            return line.chars().take(TITLE_MAX_LEN).collect();
        }
    }
    String::new()
}

fn record_text(record: &MessageRecord) -> String {
    match &record.content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Blocks(_) => {
            let message = Message {
                role: record.role,
                content: record.content.clone(),
            };
            message.text()
        }
    }
}

fn build_title_prompt(rows: &[MessageRecord]) -> String {
    let transcript: Vec<String> = rows
        .iter()
        .map(|r| format!("{}: {}", r.role.as_str(), record_text(r)))
        .collect();
    format!("{TITLE_PROMPT}\n\n{}", transcript.join("\n"))
}

async fn title_from_model(
    client: &Arc<dyn ChatClient>,
    model: Option<String>,
    prompt: String,
) -> Result<String, Error> {
    let request = ChatRequest {
        messages: vec![Message::user(prompt)],
        system: None,
        tools: Vec::new(),
        model,
    };
    let response = client.chat(request).await?;
    Ok(clean_title(&response.text()))
}

/// Generate and persist a title for `session_id`, retrying on the
/// backoff schedule. Rate limits give up immediately; a persist failure
/// is logged only. Meant to run as a spawned background task.
pub async fn generate_title(
    client: Arc<dyn ChatClient>,
    model: Option<String>,
    store: Arc<dyn Store>,
    session_id: i64,
) {
    let rows = match store.messages(session_id, Some(4)).await {
        Ok(rows) if !rows.is_empty() => rows,
        Ok(_) => return,
        Err(e) => {
            warn!(session_id, error = %e, "could not load messages for titling");
            return;
        }
    };
    let prompt = build_title_prompt(&rows);

    for (attempt, delay) in TITLE_RETRY_DELAYS.iter().enumerate() {
        if *delay > 0 {
            tokio::time::sleep(Duration::from_secs(*delay)).await;
        }
        match title_from_model(&client, model.clone(), prompt.clone()).await {
            Ok(title) if !title.is_empty() => {
                if let Err(e) = store.update_session_title(session_id, &title).await {
                    warn!(session_id, error = %e, "failed to persist session title");
                } else {
                    info!(session_id, title = %title, "session titled");
                }
                return;
            }
            Ok(_) => return,
            Err(e) => {
                let text = e.to_string().to_lowercase();
                if text.contains("429") || text.contains("rate") {
                    warn!(session_id, "title generation hit a rate limit, giving up");
                    return;
                }
                warn!(
                    session_id,
                    attempt = attempt + 1,
                    total = TITLE_RETRY_DELAYS.len(),
                    error = %e,
                    "title generation attempt failed"
                );
            }
        }
    }
    warn!(session_id, "title generation failed after all retries");
}

/// Explicit single-shot refresh; errors surface to the caller.
pub async fn regenerate_title(
    client: Arc<dyn ChatClient>,
    model: Option<String>,
    store: Arc<dyn Store>,
    session_id: i64,
) -> Result<Option<String>, Error> {
    let rows = store.messages(session_id, Some(6)).await?;
    if rows.is_empty() {
        return Ok(None);
    }
    let title = title_from_model(&client, model, build_title_prompt(&rows)).await?;
    if title.is_empty() {
        return Ok(None);
    }
    store.update_session_title(session_id, &title).await?;
    Ok(Some(title))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_closed_think_blocks() {
        assert_eq!(
            clean_title("<think>hmm, a title...</think>Weather chat"),
            "Weather chat"
        );
    }

    #[test]
    fn strips_unclosed_think_blocks() {
        assert_eq!(clean_title("Trip planning\n<think>wait, maybe"), "Trip planning");
        assert_eq!(clean_title("<think>cut off by max_tokens"), "");
    }

    #[test]
    fn strips_quotes_wrapping_the_whole_response() {
        assert_eq!(clean_title("\"Rust questions\""), "Rust questions");
        assert_eq!(clean_title("'Trip planning'"), "Trip planning");
    }

    #[test]
    fn takes_the_first_non_empty_line() {
        assert_eq!(clean_title("\n\nRust questions\nsecond line"), "Rust questions");
        // Quote trimming applies to the whole text, not per line, so an
        // interior quote before a newline survives.
        assert_eq!(clean_title("\"Rust questions\"\nsecond line"), "Rust questions\"");
    }

    #[test]
    fn caps_length_in_chars() {
        let long = "x".repeat(100);
        assert_eq!(clean_title(&long).chars().count(), TITLE_MAX_LEN);
    }

    #[test]
    fn empty_input_gives_empty_title() {
        assert_eq!(clean_title("   \n  "), "");
    }
}
