//! The orchestrator: session state, the tool-use round loop, and the
//! pieces hanging off it (history truncation, built-in tools, title
//! generation, the system prompt).

pub mod events;
pub mod factory;
pub mod history;
pub mod orchestrator;
pub mod prompt;
pub mod titles;
pub mod tools;

pub use events::AgentEvent;
pub use factory::ClientFactory;
pub use orchestrator::{Agent, SessionState, MAX_TOOL_ROUNDS};
