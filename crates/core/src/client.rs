//! ChatClient trait — the abstraction over streaming model backends.
//!
//! The wire-level translation to each provider's request/response format
//! lives outside this workspace; the orchestrator only ever sees this
//! trait and the provider-agnostic `StreamChunk` it yields.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::message::{ContentBlock, Message};
use crate::tool::ToolDefinition;

/// A request to a chat model.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Truncated conversation history, oldest first.
    pub messages: Vec<Message>,

    /// System prompt, if any.
    pub system: Option<String>,

    /// Tools the model may invoke.
    pub tools: Vec<ToolDefinition>,

    /// Model override; `None` means the provider default.
    pub model: Option<String>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            system: None,
            tools: Vec::new(),
            model: None,
        }
    }
}

/// A complete (non-streaming) model response. Used by auxiliary calls
/// such as title generation.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
}

impl ChatResponse {
    pub fn text(&self) -> String {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        parts.join("\n")
    }
}

/// An incremental piece of a streaming model response.
///
/// Text chunks carry `text`; tool-invocation chunks carry the invocation
/// id, tool name, and the accumulated arguments JSON. The final chunk
/// carries `finish_reason`.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub text: String,
    pub tool_use_id: Option<String>,
    pub tool_name: Option<String>,
    pub tool_arguments_json: String,
    pub finish_reason: Option<String>,
}

impl StreamChunk {
    pub fn text_delta(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn tool_use(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments_json: impl Into<String>,
    ) -> Self {
        Self {
            tool_use_id: Some(id.into()),
            tool_name: Some(name.into()),
            tool_arguments_json: arguments_json.into(),
            ..Default::default()
        }
    }

    pub fn finish(reason: impl Into<String>) -> Self {
        Self {
            finish_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    /// True when the finish reason indicates the model wants tool results.
    pub fn is_tool_use_finish(reason: &str) -> bool {
        matches!(reason, "tool_use" | "tool_calls")
    }
}

/// The core chat-model client trait.
///
/// `chat_stream` is the sole non-deterministic external boundary the
/// orchestrator's round state machine is built around.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Send a request and collect a complete response.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Send a request and receive a stream of chunks.
    async fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError>;

    /// Release underlying resources (connection pools, etc.).
    async fn close(&self) {}
}
