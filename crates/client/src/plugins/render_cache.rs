//! SQLite backed cache of successful renders.
//!
//! A fresh hit answers at `before_request` and marks the response with
//! `X-Rendr-Cache: HIT`; fresh 200 renders without failure tags are stored at
//! `before_send`. Cache errors are logged and never fail a render.

use std::time::Duration;

use async_trait::async_trait;
use rendr_core::cache::compute_cache_key;
use rendr_core::{AppConfig, CacheDb, CachedRender, Error, RenderRequest, RenderResponse};

use crate::pipeline::{Flow, Hook};

pub const CACHE_HEADER: &str = "X-Rendr-Cache";

#[derive(Debug, Clone)]
pub struct RenderCache {
    db: CacheDb,
    ttl: Duration,
    default_width: u32,
    default_height: u32,
    default_user_agent: Option<String>,
    default_follow_redirects: bool,
}

impl RenderCache {
    pub fn new(db: CacheDb, config: &AppConfig) -> Self {
        Self {
            db,
            ttl: config.cache_ttl(),
            default_width: config.width,
            default_height: config.height,
            default_user_agent: config.user_agent.clone(),
            default_follow_redirects: config.follow_redirects,
        }
    }

    /// Cache key of `req`: URL, render type and every option that changes the output.
    pub fn key_for(&self, req: &RenderRequest) -> String {
        let opts = &req.options;
        let vary = format!(
            "{}x{}|{}|{}",
            opts.width.unwrap_or(self.default_width),
            opts.height.unwrap_or(self.default_height),
            opts.user_agent.as_deref().or(self.default_user_agent.as_deref()).unwrap_or_default(),
            opts.follow_redirects.unwrap_or(self.default_follow_redirects),
        );
        compute_cache_key(&req.url, req.render_type().as_str(), &vary)
    }
}

#[async_trait]
impl Hook for RenderCache {
    fn name(&self) -> &str {
        "render_cache"
    }

    async fn before_request(&self, req: &mut RenderRequest) -> Result<Flow, Error> {
        let key = self.key_for(req);
        let hit = match self.db.get_fresh_render(&key).await {
            Ok(Some(hit)) => hit,
            Ok(None) => return Ok(Flow::Continue),
            Err(e) => {
                tracing::warn!(cache_key = %key, "Cache lookup failed: {e}");
                return Ok(Flow::Continue);
            }
        };

        tracing::debug!(cache_key = %key, rendered_at = %hit.rendered_at, "Cache hit");
        for (name, value) in hit.headers() {
            req.set_header(name, value);
        }
        req.set_header(CACHE_HEADER, "HIT");
        req.respond(hit.status_code, hit.body);
        Ok(Flow::Halt)
    }

    async fn before_send(&self, req: &mut RenderRequest) -> Result<Flow, Error> {
        let cacheable = req.status_code == Some(200) && req.errors().is_empty() && req.header(CACHE_HEADER).is_none();
        let Some(body) = req.content.as_ref().filter(|body| cacheable && !body.is_empty()) else {
            return Ok(Flow::Continue);
        };

        let render_type = req.render_type();
        let mut headers = req.headers.clone();
        if !headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("content-type")) {
            headers.push(("Content-Type".to_string(), render_type.content_type().to_string()));
        }
        let response = RenderResponse {
            status_code: 200,
            headers,
            body: body.clone(),
            render_type,
            errors: Vec::new(),
            render_ms: u64::try_from(req.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        let key = self.key_for(req);
        let entry = CachedRender::from_response(key.clone(), &req.url, &response, self.ttl);
        match self.db.upsert_render(&entry).await {
            Ok(()) => tracing::debug!(cache_key = %key, bytes = entry.body.len(), "Render cached"),
            Err(e) => tracing::warn!(cache_key = %key, "Storing render failed: {e}"),
        }
        Ok(Flow::Continue)
    }
}
