//! System prompt assembly: persona, clock, and recalled memories.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use krait_config::GeneralConfig;
use krait_store::{MemoryRecord, Store};

/// Recall queries are cut to this many characters before searching.
const RECALL_QUERY_MAX_CHARS: usize = 2_000;

const MEMORY_GUIDANCE: &str = "You have long-term memory tools. Use memory_add to save \
    durable facts about the user or ongoing work, and memory_search when past context \
    would help. Do not save transient details.";

/// Read `persona.md` from the data directory. Missing or blank files
/// mean no persona.
pub fn load_persona(data_dir: &Path) -> Option<String> {
    let text = std::fs::read_to_string(data_dir.join("persona.md")).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn format_memories(memories: &[MemoryRecord]) -> String {
    let mut out = String::from("## Recalled Memories\n");
    for (i, memory) in memories.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, memory.text));
    }
    out
}

async fn recall(store: &Arc<dyn Store>, query: &str, k: usize) -> Vec<MemoryRecord> {
    if k == 0 {
        return Vec::new();
    }
    let query: String = query.chars().take(RECALL_QUERY_MAX_CHARS).collect();
    match store.memory_search(&query, k).await {
        Ok(hits) if !hits.is_empty() => hits,
        Ok(_) => store.memory_list(k).await.unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "memory recall failed");
            Vec::new()
        }
    }
}

/// Assemble the system prompt for one chat turn. The persona comes
/// first when present, then the clock, the memory guidance, and the
/// memories recalled against the user's message.
pub async fn build_system_prompt(
    persona: Option<&str>,
    general: &GeneralConfig,
    store: &Arc<dyn Store>,
    user_query: &str,
) -> String {
    let mut sections: Vec<String> = Vec::new();
    if let Some(persona) = persona {
        let persona = persona.trim();
        if !persona.is_empty() {
            sections.push(persona.to_string());
        }
    }
    sections.push(format!(
        "## Current time\n{} ({})",
        Utc::now().to_rfc3339(),
        general.timezone
    ));
    sections.push(MEMORY_GUIDANCE.to_string());
    let memories = recall(store, user_query, general.memory_recall_k).await;
    if !memories.is_empty() {
        sections.push(format_memories(&memories));
    }
    sections.join("\n\n")
}
