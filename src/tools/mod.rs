//! Tool catalog, invocation pipeline and the MCP surface consumers talk to

pub mod catalog;
pub mod format;
pub mod pipeline;
pub mod server;

pub use catalog::{build_catalog, LocalTool, ToolCatalog, ToolDefinition, ToolTarget};
pub use pipeline::{ToolPipeline, ToolResponse};
pub use server::RelayMcpServer;
