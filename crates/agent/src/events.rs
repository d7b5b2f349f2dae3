//! Events streamed back to the front end during a chat round.

/// What the caller sees while a round is in flight. Text arrives as the
/// model produces it; a `ToolStarted` is emitted before each tool runs
/// so slow work can be reflected in the UI immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// A streamed piece of assistant text.
    Text(String),

    /// A tool is about to execute.
    ToolStarted { id: String, name: String },

    /// The round loop finished with this stop reason.
    Finished { reason: String },
}
