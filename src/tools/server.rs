//! MCP Server Implementation
//!
//! One `RelayMcpServer` is served per consumer connection. Tool listing and
//! calls are delegated to the shared [`ToolPipeline`].

use super::pipeline::{ToolPipeline, ToolResponse};
use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, Content, Implementation, ListToolsResult,
        PaginatedRequestParam, ServerCapabilities, ServerInfo, ToolsCapability,
    },
    service::{NotificationContext, RequestContext, RoleServer},
    ErrorData as McpError,
};
use std::future::Future;
use std::sync::Arc;

/// Design relay MCP server
#[derive(Clone)]
pub struct RelayMcpServer {
    pipeline: Arc<ToolPipeline>,
    /// Consumer session id, for logs
    session_id: String,
}

impl RelayMcpServer {
    pub fn new(pipeline: Arc<ToolPipeline>, session_id: impl Into<String>) -> Self {
        Self {
            pipeline,
            session_id: session_id.into(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// Convert a pipeline response into an MCP result.
pub fn into_call_result(response: ToolResponse) -> CallToolResult {
    let content: Vec<Content> = response.blocks.into_iter().map(Content::text).collect();
    let mut result = if response.is_error {
        CallToolResult::error(content)
    } else {
        CallToolResult::success(content)
    };
    result.structured_content = response.structured;
    result
}

impl rmcp::handler::server::ServerHandler for RelayMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "design-relay".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: Some(
                "Design relay MCP server. Reads live data from the design editor through the \
                relay plugin. The plugin must be open and active; use get_selection or \
                get_document first, then get_node for details. Images are returned as \
                links to the local asset server; resolve hashes with get_assets."
                    .to_string(),
            ),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability::default()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn on_initialized(
        &self,
        _context: NotificationContext<RoleServer>,
    ) -> impl Future<Output = ()> + Send + '_ {
        async move {
            log::info!("MCP client initialized (session={})", self.session_id);
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        async move {
            Ok(ListToolsResult {
                tools: self.pipeline.list_tools(),
                next_cursor: None,
            })
        }
    }

    fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        async move {
            log::info!(
                "Session {} calling tool {}",
                self.session_id,
                request.name
            );
            let response = self.pipeline.invoke(&request.name, request.arguments).await;
            Ok(into_call_result(response))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_response_sets_flag() {
        let result = into_call_result(ToolResponse::failure("UNKNOWN_TOOL", "Unknown tool: x"));
        assert_eq!(result.is_error, Some(true));
        assert!(result.structured_content.is_none());
    }

    #[test]
    fn test_structured_content_is_kept() {
        let response = ToolResponse {
            blocks: vec!["1 cached asset(s)".to_string()],
            structured: Some(json!({ "assets": [] })),
            is_error: false,
        };
        let result = into_call_result(response);
        assert_eq!(result.is_error, Some(false));
        assert_eq!(result.structured_content, Some(json!({ "assets": [] })));
    }
}
