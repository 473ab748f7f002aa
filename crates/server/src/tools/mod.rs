//! MCP tool implementations.
//!
//! This module contains all tools exposed by the mcp-render server.

pub mod browser_status;
pub mod cache;
pub mod render_page;

/// Encode binary tool output.
pub(crate) fn encode_base64(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
