//! cache_get tool implementation.
//!
//! Retrieves a cached render by its cache key.

use rendr_core::cache::hash::is_valid_key;
use rendr_core::{CacheDb, CachedRender, Error};
use rmcp::{
    ErrorData as McpError,
    model::{CallToolResult, Content},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::tools::encode_base64;

/// Parameters for the cache_get tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheGetParams {
    /// The cache key of the render to retrieve.
    pub hash: String,
}

/// Output from the cache_get tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheGetOutput {
    /// The cached render's metadata.
    pub render: CachedRender,
    /// Body as text for HTML renders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Body as base64 for binary renders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_base64: Option<String>,
}

/// Implementation of the cache_get tool.
pub async fn get_impl(cache: &CacheDb, params: CacheGetParams) -> Result<CallToolResult, McpError> {
    if !is_valid_key(&params.hash) {
        return Err(Error::InvalidHash.into());
    }

    let render = cache
        .get_render(&params.hash)
        .await?
        .ok_or_else(|| Error::CacheMiss(params.hash.clone()))?;

    let (body, body_base64) = if render.render_type == "html" {
        (Some(String::from_utf8_lossy(&render.body).into_owned()), None)
    } else {
        (None, Some(encode_base64(&render.body)))
    };
    let output = CacheGetOutput { render, body, body_base64 };
    let json = serde_json::to_string_pretty(&output)
        .map_err(|e| Error::InvalidInput(format!("Failed to serialize render: {e}")))?;

    Ok(CallToolResult::success(vec![Content::text(json)]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use rendr_core::cache::compute_cache_key;
    use rendr_core::{RenderResponse, RenderType};

    #[tokio::test]
    async fn test_get_impl_missing() {
        let cache = CacheDb::open_in_memory().await.unwrap();
        let params = CacheGetParams { hash: compute_cache_key("https://example.com/", "html", "") };

        let result = get_impl(&cache, params).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_get_impl_rejects_malformed_key() {
        let cache = CacheDb::open_in_memory().await.unwrap();
        let err = get_impl(&cache, CacheGetParams { hash: "nonexistent".into() }).await.unwrap_err();
        assert_eq!(err.code.0, -32002);
    }

    #[tokio::test]
    async fn test_get_impl_found() {
        let cache = CacheDb::open_in_memory().await.unwrap();

        let hash = compute_cache_key("https://example.com/", "html", "");
        let response = RenderResponse {
            status_code: 200,
            headers: vec![("Content-Type".into(), "text/html; charset=utf-8".into())],
            body: b"<html><body>cached</body></html>".to_vec(),
            render_type: RenderType::Html,
            errors: Vec::new(),
            render_ms: 120,
        };
        let entry =
            CachedRender::from_response(hash.clone(), "https://example.com/", &response, Duration::from_secs(60));
        cache.upsert_render(&entry).await.unwrap();

        let result = get_impl(&cache, CacheGetParams { hash }).await.unwrap();
        let value = serde_json::to_value(&result.content[0]).unwrap();
        let text = value.get("text").and_then(|v| v.as_str()).expect("Expected text field in content");
        let output: serde_json::Value = serde_json::from_str(text).unwrap();
        assert_eq!(output["body"], "<html><body>cached</body></html>");
        assert_eq!(output["render"]["status_code"], 200);
    }
}
