//! Hooks shipped with rendr.

mod domain_filter;
mod http_headers;
mod remove_scripts;
mod render_cache;

use std::sync::Arc;

use rendr_core::{AppConfig, CacheDb};

use crate::pipeline::ExtensionPipeline;

pub use domain_filter::DomainFilter;
pub use http_headers::{HttpHeaders, declared_status_and_headers};
pub use remove_scripts::{RemoveScriptTags, remove_script_tags};
pub use render_cache::{CACHE_HEADER, RenderCache};

/// Assemble the configured hooks.
///
/// Order: domain filter, cache, page-declared headers, script removal.
pub fn default_pipeline(config: &AppConfig, cache: Option<CacheDb>) -> ExtensionPipeline {
    let mut pipeline = ExtensionPipeline::new();

    let filter = DomainFilter::from_config(config);
    if filter.is_active() {
        pipeline.register(Arc::new(filter));
    }
    if let Some(db) = cache {
        pipeline.register(Arc::new(RenderCache::new(db, config)));
    }
    if config.http_headers {
        pipeline.register(Arc::new(HttpHeaders));
    }
    if config.remove_script_tags {
        pipeline.register(Arc::new(RemoveScriptTags));
    }

    tracing::info!(hooks = ?pipeline.hook_names(), "Extension pipeline ready");
    pipeline
}
