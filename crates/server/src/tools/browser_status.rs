//! browser_status tool implementation.
//!
//! Reports the lifecycle manager's view of the browser instance.

use rendr_client::{LifecycleStatus, RenderCoordinator};
use rendr_core::Error;
use rmcp::{
    ErrorData as McpError,
    model::{CallToolResult, Content},
};
use serde::Serialize;

/// Output from the browser_status tool.
#[derive(Debug, Clone, Serialize)]
pub struct BrowserStatusOutput {
    #[serde(flatten)]
    pub lifecycle: LifecycleStatus,
    /// Registered hooks in execution order.
    pub hooks: Vec<String>,
}

/// Implementation of the browser_status tool.
pub fn status_impl(coordinator: &RenderCoordinator) -> Result<CallToolResult, McpError> {
    let output = BrowserStatusOutput {
        lifecycle: coordinator.lifecycle().status(),
        hooks: coordinator.pipeline().hook_names().into_iter().map(str::to_string).collect(),
    };
    let json = serde_json::to_string_pretty(&output)
        .map_err(|e| Error::InvalidInput(format!("Failed to serialize output: {e}")))?;

    Ok(CallToolResult::success(vec![Content::text(json)]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rendr_client::driver::testing::ScriptedDriver;
    use rendr_client::{BrowserLifecycleManager, ExtensionPipeline, LifecyclePolicy, default_pipeline};
    use rendr_core::AppConfig;

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_ready_instance() {
        let config = Arc::new(AppConfig::default());
        let lifecycle =
            BrowserLifecycleManager::new(Arc::new(ScriptedDriver::new()), LifecyclePolicy::from_config(&config));
        let id = lifecycle.start().await.unwrap();
        let pipeline = default_pipeline(&config, None);
        let coordinator = RenderCoordinator::new(config, lifecycle, pipeline);

        let result = status_impl(&coordinator).unwrap();
        let value = serde_json::to_value(&result.content[0]).unwrap();
        let text = value.get("text").and_then(|v| v.as_str()).expect("Expected text field in content");
        let status: serde_json::Value = serde_json::from_str(text).unwrap();

        assert_eq!(status["state"], "ready");
        assert_eq!(status["instance_id"], id.get());
        assert_eq!(status["active_tabs"], 0);
        assert_eq!(status["hooks"], serde_json::json!(["http_headers", "remove_script_tags"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_before_start() {
        let config = Arc::new(AppConfig::default());
        let lifecycle =
            BrowserLifecycleManager::new(Arc::new(ScriptedDriver::new()), LifecyclePolicy::from_config(&config));
        let coordinator = RenderCoordinator::new(config, lifecycle, ExtensionPipeline::new());

        let result = status_impl(&coordinator).unwrap();
        let value = serde_json::to_value(&result.content[0]).unwrap();
        let text = value.get("text").and_then(|v| v.as_str()).expect("Expected text field in content");
        let status: serde_json::Value = serde_json::from_str(text).unwrap();
        assert!(status["instance_id"].is_null());
    }
}
