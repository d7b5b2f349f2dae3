//! Remote tool servers over JSON-RPC (MCP-style).
//!
//! Each configured server sits behind a [`Transport`] (streamable HTTP
//! or a stdio child process). The [`McpManager`] owns the connections,
//! exposes discovered tools under collision-free aliases, and hides
//! transport failures from the model: a broken call reconnects once and
//! then degrades to an error tool result instead of an `Err`.

pub mod alias;
pub mod manager;
pub mod proxy;
pub mod rpc;
pub mod transport;

pub use alias::tool_alias;
pub use manager::{McpManager, ServerConnection};
pub use proxy::proxy_tools;
pub use transport::{HttpTransport, StdioTransport, Transport, TransportFactory};
