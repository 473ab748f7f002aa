//! MCP server handler implementation.
//!
//! This module defines the main server handler that
//! routes tool calls to the appropriate implementations.
use crate::tools::browser_status::status_impl;
use crate::tools::cache::{CacheGetParams, CachePurgeParams, get_impl, purge_impl};
use crate::tools::render_page::{RenderPageParams, render_impl};

use rendr_client::RenderCoordinator;
use rendr_core::{CacheDb, Error};
use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::{
        tool::{ToolCallContext, ToolRouter},
        wrapper::Parameters,
    },
    model::{
        CallToolRequestParam, CallToolResult, Implementation, ListToolsResult, PaginatedRequestParam, ProtocolVersion,
        ServerCapabilities, ServerInfo,
    },
    service::{RequestContext, RoleServer},
    tool, tool_router,
};

/// The main MCP server handler for mcp-render.
#[derive(Clone)]
pub struct McpRenderServer {
    coordinator: RenderCoordinator,
    cache: Option<CacheDb>,
    tool_router: ToolRouter<Self>,
}

/// Tool router implementation using the #[tool_router] macro.
///
/// This macro generates the routing logic that maps tool names to handler methods.
#[tool_router]
impl McpRenderServer {
    /// Create a new server handler.
    pub fn new(coordinator: RenderCoordinator, cache: Option<CacheDb>) -> Self {
        Self { coordinator, cache, tool_router: Self::tool_router() }
    }

    fn cache(&self) -> Result<&CacheDb, McpError> {
        self.cache
            .as_ref()
            .ok_or_else(|| Error::InvalidInput("render cache is disabled (set RENDR_CACHE_ENABLED=true)".into()).into())
    }

    /// Render a URL in a headless browser.
    #[tool(
        description = "Render a URL in a headless browser after its JavaScript settles. \
                       Returns HTML as text, PNG/JPEG as image content, PDF as base64."
    )]
    async fn render_page(&self, params: Parameters<RenderPageParams>) -> Result<CallToolResult, McpError> {
        render_impl(&self.coordinator, params.0).await
    }

    /// Report the browser instance state.
    #[tool(description = "Report the state of the browser instance: generation, renders served, open tabs, restarts.")]
    async fn browser_status(&self) -> Result<CallToolResult, McpError> {
        status_impl(&self.coordinator)
    }

    /// Retrieve a cached render.
    #[tool(description = "Retrieve a cached render by its cache key.")]
    async fn cache_get(&self, params: Parameters<CacheGetParams>) -> Result<CallToolResult, McpError> {
        get_impl(self.cache()?, params.0).await
    }

    /// Purge cached renders.
    #[tool(description = "Purge cached renders that expired, belong to a domain, or exceed a maximum entry count.")]
    async fn cache_purge(&self, params: Parameters<CachePurgeParams>) -> Result<CallToolResult, McpError> {
        purge_impl(self.cache()?, params.0).await
    }
}

impl ServerHandler for McpRenderServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "mcp-render".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                ..Default::default()
            },
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self, _request: Option<PaginatedRequestParam>, _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, rmcp::model::ErrorData> {
        Ok(ListToolsResult { meta: None, tools: self.tool_router.list_all(), next_cursor: None })
    }

    async fn call_tool(
        &self, request: CallToolRequestParam, context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, rmcp::model::ErrorData> {
        self.tool_router
            .call(ToolCallContext::new(self, request, context))
            .await
    }
}
