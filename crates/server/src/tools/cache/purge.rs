//! cache_purge tool implementation.
//!
//! Purges cached renders by expiry, domain, or count.

use rendr_core::{CacheDb, Error};
use rmcp::{
    ErrorData as McpError,
    model::{CallToolResult, Content},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the cache_purge tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CachePurgeParams {
    /// Purge renders whose TTL has passed.
    #[serde(default)]
    pub expired: bool,

    /// Purge renders of this domain and its subdomains.
    pub domain: Option<String>,

    /// Keep only the N most recently used renders.
    pub max_entries: Option<usize>,
}

/// Output from the cache_purge tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CachePurgeOutput {
    /// Number of entries deleted.
    pub deleted: u64,
}

/// Implementation of the cache_purge tool.
pub async fn purge_impl(cache: &CacheDb, params: CachePurgeParams) -> Result<CallToolResult, McpError> {
    if !params.expired && params.domain.is_none() && params.max_entries.is_none() {
        return Err(
            Error::InvalidInput("At least one of expired, domain, or max_entries must be specified".to_string()).into(),
        );
    }

    let mut deleted_total = 0u64;

    if params.expired {
        deleted_total += cache.purge_expired_renders().await?;
    }

    if let Some(domain) = params.domain {
        deleted_total += cache.purge_renders_by_domain(&domain).await?;
    }

    if let Some(max_entries) = params.max_entries {
        deleted_total += cache.purge_lru_renders(max_entries).await?;
    }

    tracing::info!(deleted = deleted_total, "Render cache purged");
    let output = CachePurgeOutput { deleted: deleted_total };
    let json = serde_json::to_string_pretty(&output)
        .map_err(|e| Error::InvalidInput(format!("Failed to serialize output: {e}")))?;

    Ok(CallToolResult::success(vec![Content::text(json)]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use rendr_core::cache::compute_cache_key;
    use rendr_core::{CachedRender, RenderResponse, RenderType};

    async fn store(cache: &CacheDb, url: &str) {
        let response = RenderResponse {
            status_code: 200,
            headers: Vec::new(),
            body: b"<html></html>".to_vec(),
            render_type: RenderType::Html,
            errors: Vec::new(),
            render_ms: 10,
        };
        let hash = compute_cache_key(url, "html", "");
        let entry = CachedRender::from_response(hash, url, &response, Duration::from_secs(3600));
        cache.upsert_render(&entry).await.unwrap();
    }

    fn deleted(result: &CallToolResult) -> u64 {
        let content_val = serde_json::to_value(&result.content[0]).unwrap();
        let text = content_val.get("text").and_then(|v| v.as_str()).expect("Expected text field in content");
        let output: CachePurgeOutput = serde_json::from_str(text).unwrap();
        output.deleted
    }

    #[tokio::test]
    async fn test_purge_by_domain() {
        let cache = CacheDb::open_in_memory().await.unwrap();
        store(&cache, "https://example.com/page1").await;
        store(&cache, "https://other.com/page2").await;

        let params = CachePurgeParams { expired: false, domain: Some("example.com".to_string()), max_entries: None };

        let result = purge_impl(&cache, params).await.unwrap();
        assert_eq!(deleted(&result), 1);
    }

    #[tokio::test]
    async fn test_purge_lru() {
        let cache = CacheDb::open_in_memory().await.unwrap();
        store(&cache, "https://example.com/page1").await;
        store(&cache, "https://example.com/page2").await;

        let params = CachePurgeParams { expired: false, domain: None, max_entries: Some(1) };

        let result = purge_impl(&cache, params).await.unwrap();
        assert_eq!(deleted(&result), 1);
    }

    #[tokio::test]
    async fn test_purge_expired_keeps_fresh() {
        let cache = CacheDb::open_in_memory().await.unwrap();
        store(&cache, "https://example.com/").await;

        let params = CachePurgeParams { expired: true, domain: None, max_entries: None };
        assert_eq!(deleted(&purge_impl(&cache, params).await.unwrap()), 0);
    }

    #[tokio::test]
    async fn test_purge_no_params() {
        let cache = CacheDb::open_in_memory().await.unwrap();
        let params = CachePurgeParams { expired: false, domain: None, max_entries: None };

        let result = purge_impl(&cache, params).await;
        assert!(result.is_err());
    }
}
