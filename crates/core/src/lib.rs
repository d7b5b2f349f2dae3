//! Core domain types and traits for the Krait agent runtime.
//!
//! This crate defines the value objects that flow through the whole system
//! (messages, content blocks, tool calls) and the trait seams the other
//! crates plug into (chat clients, tools, the storage collaborator).
//! It has no I/O of its own.

pub mod client;
pub mod error;
pub mod message;
pub mod tool;

pub use client::{ChatClient, ChatRequest, ChatResponse, StreamChunk};
pub use error::{Error, McpError, ProviderError, Result, RunnerError, StoreError, ToolError};
pub use message::{ContentBlock, Message, MessageContent, Role};
pub use tool::{Tool, ToolCall, ToolDefinition, ToolRegistry, ToolResult};
