//! render_page tool implementation.
//!
//! Renders a URL through the coordinator. HTML comes back as text, PNG and
//! JPEG as image content and PDF as base64 in the metadata block.

use rendr_client::RenderCoordinator;
use rendr_core::{Error, FailureTag, RenderOptions, RenderResponse, RenderType};
use rmcp::{
    ErrorData as McpError,
    model::{CallToolResult, Content},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::encode_base64;

/// Input parameters for render_page tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RenderPageParams {
    /// The URL to render.
    pub url: String,

    /// Render options. Unset fields use the server configuration.
    #[serde(flatten)]
    pub options: RenderOptions,
}

/// Metadata returned alongside the rendered body.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RenderPageOutput {
    /// The canonical URL that was rendered.
    pub url: String,
    /// Status the page would be served with.
    pub status_code: u16,
    /// Response headers, including `Location` for unfollowed redirects.
    pub headers: Vec<(String, String)>,
    /// Output format.
    pub render_type: RenderType,
    /// Failure and degradation tags.
    pub errors: Vec<FailureTag>,
    /// Time spent rendering in milliseconds.
    pub render_ms: u64,
    /// Base64 body for PDF output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_base64: Option<String>,
}

impl RenderPageOutput {
    fn new(url: String, response: &RenderResponse) -> Self {
        let body_base64 = (response.render_type == RenderType::Pdf && !response.body.is_empty())
            .then(|| encode_base64(&response.body));
        Self {
            url,
            status_code: response.status_code,
            headers: response.headers.clone(),
            render_type: response.render_type,
            errors: response.errors.clone(),
            render_ms: response.render_ms,
            body_base64,
        }
    }
}

/// Implementation of the render_page tool.
pub async fn render_impl(
    coordinator: &RenderCoordinator, params: RenderPageParams,
) -> Result<CallToolResult, McpError> {
    if params.url.trim().is_empty() {
        return Err(Error::InvalidInput("url must not be empty".into()).into());
    }

    let response = coordinator.render(&params.url, params.options).await;
    let output = RenderPageOutput::new(params.url, &response);
    let json = serde_json::to_string_pretty(&output)
        .map_err(|e| Error::InvalidInput(format!("Failed to serialize output: {e}")))?;

    let mut content = vec![Content::text(json)];
    if !response.body.is_empty() {
        match response.render_type {
            RenderType::Html => content.push(Content::text(String::from_utf8_lossy(&response.body).into_owned())),
            RenderType::Png | RenderType::Jpeg => {
                content.push(Content::image(encode_base64(&response.body), response.render_type.content_type()))
            }
            RenderType::Pdf => {}
        }
    }

    if response.status_code >= 500 {
        Ok(CallToolResult::error(content))
    } else {
        Ok(CallToolResult::success(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rendr_client::driver::testing::{PageScript, ScriptedDriver};
    use rendr_client::{BrowserLifecycleManager, ExtensionPipeline, LifecyclePolicy};
    use rendr_core::AppConfig;

    async fn coordinator(driver: ScriptedDriver) -> RenderCoordinator {
        let config = Arc::new(AppConfig::default());
        let lifecycle = BrowserLifecycleManager::new(Arc::new(driver), LifecyclePolicy::from_config(&config));
        lifecycle.start().await.unwrap();
        RenderCoordinator::new(config, lifecycle, ExtensionPipeline::new())
    }

    fn text_of(result: &CallToolResult, index: usize) -> String {
        let value = serde_json::to_value(&result.content[index]).unwrap();
        value.get("text").and_then(|v| v.as_str()).expect("Expected text field in content").to_string()
    }

    fn params(url: &str, render_type: RenderType) -> RenderPageParams {
        RenderPageParams { url: url.into(), options: RenderOptions::with_type(render_type) }
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_html() {
        let driver = ScriptedDriver::with_default(PageScript::html("<html><body>hi</body></html>"));
        let coordinator = coordinator(driver).await;

        let result = render_impl(&coordinator, params("https://example.com/", RenderType::Html)).await.unwrap();
        assert_ne!(result.is_error, Some(true));

        let output: RenderPageOutput = serde_json::from_str(&text_of(&result, 0)).unwrap();
        assert_eq!(output.status_code, 200);
        assert!(output.body_base64.is_none());
        assert_eq!(text_of(&result, 1), "<html><body>hi</body></html>");
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_png_as_image() {
        let coordinator = coordinator(ScriptedDriver::new()).await;

        let result = render_impl(&coordinator, params("https://example.com/", RenderType::Png)).await.unwrap();
        assert_eq!(result.content.len(), 2);
        let image = serde_json::to_value(&result.content[1]).unwrap();
        assert_eq!(image.get("mimeType").and_then(|v| v.as_str()), Some("image/png"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_pdf_as_base64() {
        let coordinator = coordinator(ScriptedDriver::new()).await;

        let result = render_impl(&coordinator, params("https://example.com/", RenderType::Pdf)).await.unwrap();
        assert_eq!(result.content.len(), 1);
        let output: RenderPageOutput = serde_json::from_str(&text_of(&result, 0)).unwrap();
        assert_eq!(output.body_base64.as_deref().map(|b| b.starts_with("JVBERi0")), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_failure_is_tool_error() {
        let driver = ScriptedDriver::new();
        driver.set_script(
            "https://example.com/down",
            PageScript { navigate_error: Some("net::ERR_CONNECTION_REFUSED".into()), ..Default::default() },
        );
        let coordinator = coordinator(driver).await;

        let result = render_impl(&coordinator, params("https://example.com/down", RenderType::Html)).await.unwrap();
        assert_eq!(result.is_error, Some(true));
        let output: RenderPageOutput = serde_json::from_str(&text_of(&result, 0)).unwrap();
        assert_eq!(output.status_code, 504);
        assert_eq!(output.errors, vec![FailureTag::NavigationFailed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_url_rejected() {
        let coordinator = coordinator(ScriptedDriver::new()).await;
        assert!(render_impl(&coordinator, params("  ", RenderType::Html)).await.is_err());
    }
}
