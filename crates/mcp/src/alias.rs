//! Tool alias generation.
//!
//! Remote tools are exposed to the model as `{server}_{tool}` so two
//! servers can publish tools with the same name. Aliases must satisfy
//! provider naming rules: `[A-Za-z0-9_-]`, at most 64 chars.

use sha2::{Digest, Sha256};

pub const MAX_ALIAS_LEN: usize = 64;
const SUFFIX_HEX_LEN: usize = 8;

/// Deterministic alias for `tool` on `server`.
///
/// Overlong names are truncated and given an 8-hex digest suffix of the
/// unsanitized input so distinct tools never collapse to one alias.
pub fn tool_alias(server: &str, tool: &str) -> String {
    let raw = format!("{server}_{tool}");
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.len() <= MAX_ALIAS_LEN {
        return sanitized;
    }

    let digest = Sha256::digest(raw.as_bytes());
    let suffix: String = digest
        .iter()
        .take(SUFFIX_HEX_LEN / 2)
        .map(|b| format!("{b:02x}"))
        .collect();
    // Sanitized text is pure ASCII, so byte slicing is char-safe.
    let head = &sanitized[..MAX_ALIAS_LEN - SUFFIX_HEX_LEN - 1];
    format!("{head}_{suffix}")
}
