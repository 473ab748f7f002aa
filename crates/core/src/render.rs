//! The render request model shared by the engine, the hooks and the front ends.
//!
//! A [`RenderRequest`] is owned by exactly one render task for its whole life.
//! Hooks mutate it in place; the coordinator turns it into a [`RenderResponse`]
//! once the render has finished.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::error::Error;

/// Largest viewport dimension accepted from a caller.
pub const MAX_VIEWPORT: u32 = 10_000;

/// Largest per-request timeout override accepted from a caller (5 minutes).
pub const MAX_TIMEOUT_MS: u64 = 300_000;

/// Output format of a render.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RenderType {
    /// Serialized DOM after JavaScript execution.
    #[default]
    Html,
    Jpeg,
    Png,
    Pdf,
}

impl RenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderType::Html => "html",
            RenderType::Jpeg => "jpeg",
            RenderType::Png => "png",
            RenderType::Pdf => "pdf",
        }
    }

    /// MIME type of a body produced for this render type.
    pub fn content_type(&self) -> &'static str {
        match self {
            RenderType::Html => "text/html; charset=utf-8",
            RenderType::Jpeg => "image/jpeg",
            RenderType::Png => "image/png",
            RenderType::Pdf => "application/pdf",
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, RenderType::Jpeg | RenderType::Png)
    }
}

impl fmt::Display for RenderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RenderType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "html" => Ok(RenderType::Html),
            "jpeg" | "jpg" => Ok(RenderType::Jpeg),
            "png" => Ok(RenderType::Png),
            "pdf" => Ok(RenderType::Pdf),
            other => Err(Error::InvalidInput(format!("unknown render type '{other}'"))),
        }
    }
}

/// Per-request options. Every `None` falls back to [`AppConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RenderOptions {
    /// Output format: html (default), jpeg, png or pdf
    #[serde(default)]
    pub render_type: RenderType,

    /// Viewport width in pixels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,

    /// Viewport height in pixels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,

    /// User-Agent override for this render
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// Follow redirects of the primary document instead of returning them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_redirects: Option<bool>,

    /// Poll interval of the completion detector in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_done_check_interval_ms: Option<u64>,

    /// Longest wait for network activity to settle in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_download_timeout_ms: Option<u64>,

    /// Quiet period after the last request before the network counts as idle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_after_last_request_ms: Option<u64>,

    /// Interval between JavaScript readiness checks in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub js_check_interval_ms: Option<u64>,

    /// Budget for the page to signal readiness in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub js_timeout_ms: Option<u64>,

    /// Longest gap without a successful evaluation before the page is considered hung
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_js_execution_timeout_ms: Option<u64>,

    /// Grace period after the readiness flag turns true while requests are still in flight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_grace_delay_ms: Option<u64>,

    /// Overall deadline for the tab-holding part of the render in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_deadline_ms: Option<u64>,
}

impl RenderOptions {
    pub fn with_type(render_type: RenderType) -> Self {
        Self { render_type, ..Default::default() }
    }

    /// Reject caller supplied values the engine cannot honour.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidInput` naming the offending option.
    pub fn validate(&self) -> Result<(), Error> {
        for (name, value) in [("width", self.width), ("height", self.height)] {
            if let Some(v) = value
                && !(1..=MAX_VIEWPORT).contains(&v)
            {
                return Err(Error::InvalidInput(format!("{name} must be between 1 and {MAX_VIEWPORT}")));
            }
        }

        let timeouts = [
            ("page_done_check_interval_ms", self.page_done_check_interval_ms),
            ("resource_download_timeout_ms", self.resource_download_timeout_ms),
            ("wait_after_last_request_ms", self.wait_after_last_request_ms),
            ("js_check_interval_ms", self.js_check_interval_ms),
            ("js_timeout_ms", self.js_timeout_ms),
            ("no_js_execution_timeout_ms", self.no_js_execution_timeout_ms),
            ("ready_grace_delay_ms", self.ready_grace_delay_ms),
            ("render_deadline_ms", self.render_deadline_ms),
        ];
        for (name, value) in timeouts {
            if let Some(v) = value
                && !(1..=MAX_TIMEOUT_MS).contains(&v)
            {
                return Err(Error::InvalidInput(format!("{name} must be between 1 and {MAX_TIMEOUT_MS}")));
            }
        }

        if let Some(ua) = &self.user_agent
            && ua.trim().is_empty()
        {
            return Err(Error::InvalidInput("user_agent must not be empty".into()));
        }

        Ok(())
    }
}

/// Progress of a render. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Downloading,
    EvaluatingJs,
    Done,
}

/// Tags appended to a request's error list. Soft tags do not change the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureTag {
    NavigationFailed,
    StaleBrowserGeneration,
    BrowserConnectionClosed,
    EvaluationFailed,
    SoftTimeout,
    DownloadTimeout,
    HardTimeout,
    BrowserUnavailable,
    DeadlineExceeded,
    HookFailed,
    InvalidUrl,
}

impl FailureTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureTag::NavigationFailed => "NAVIGATION_FAILED",
            FailureTag::StaleBrowserGeneration => "STALE_BROWSER_GENERATION",
            FailureTag::BrowserConnectionClosed => "BROWSER_CONNECTION_CLOSED",
            FailureTag::EvaluationFailed => "EVALUATION_FAILED",
            FailureTag::SoftTimeout => "SOFT_TIMEOUT",
            FailureTag::DownloadTimeout => "DOWNLOAD_TIMEOUT",
            FailureTag::HardTimeout => "HARD_TIMEOUT",
            FailureTag::BrowserUnavailable => "BROWSER_UNAVAILABLE",
            FailureTag::DeadlineExceeded => "DEADLINE_EXCEEDED",
            FailureTag::HookFailed => "HOOK_FAILED",
            FailureTag::InvalidUrl => "INVALID_URL",
        }
    }

    /// Soft tags describe a degraded but successful render.
    pub fn is_soft(&self) -> bool {
        matches!(self, FailureTag::SoftTimeout | FailureTag::DownloadTimeout)
    }
}

impl fmt::Display for FailureTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single render in progress.
#[derive(Debug)]
pub struct RenderRequest {
    /// Normalized target URL.
    pub url: String,
    pub options: RenderOptions,
    stage: Stage,
    pub status_code: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub redirect_url: Option<String>,
    pub content: Option<Vec<u8>>,
    errors: Vec<FailureTag>,
    started_at: Instant,
    pub received_at: DateTime<Utc>,
}

impl RenderRequest {
    pub fn new(url: impl Into<String>, options: RenderOptions) -> Self {
        Self {
            url: url.into(),
            options,
            stage: Stage::Downloading,
            status_code: None,
            headers: Vec::new(),
            redirect_url: None,
            content: None,
            errors: Vec::new(),
            started_at: Instant::now(),
            received_at: Utc::now(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn render_type(&self) -> RenderType {
        self.options.render_type
    }

    /// Move to `stage` if it is strictly ahead of the current one.
    ///
    /// Returns `false` (and changes nothing) otherwise.
    pub fn advance(&mut self, stage: Stage) -> bool {
        if stage <= self.stage {
            return false;
        }
        self.stage = stage;
        true
    }

    /// Mark the render done. A second call is a no-op returning `false`.
    pub fn finish(&mut self) -> bool {
        self.advance(Stage::Done)
    }

    pub fn is_finished(&self) -> bool {
        self.stage == Stage::Done
    }

    pub fn record_error(&mut self, tag: FailureTag) {
        self.errors.push(tag);
    }

    pub fn errors(&self) -> &[FailureTag] {
        &self.errors
    }

    pub fn has_error(&self, tag: FailureTag) -> bool {
        self.errors.contains(&tag)
    }

    /// Produce the response directly and finish, bypassing the browser.
    pub fn respond(&mut self, status: u16, body: impl Into<Vec<u8>>) {
        self.status_code = Some(status);
        self.content = Some(body.into());
        self.finish();
    }

    /// Record `err` as the outcome of this render.
    pub fn fail(&mut self, err: &Error) {
        if let Some(tag) = err.failure_tag() {
            self.record_error(tag);
        }
        self.status_code = Some(err.status_code());
        self.finish();
    }

    /// Set a response header, replacing any existing value case-insensitively.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            Some(existing) => existing.1 = value,
            None => self.headers.push((name, value)),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    /// Captured document as text, when the content is valid UTF-8.
    pub fn html(&self) -> Option<&str> {
        self.content.as_deref().and_then(|c| std::str::from_utf8(c).ok())
    }

    pub fn set_html(&mut self, html: String) {
        self.content = Some(html.into_bytes());
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Convert the finished request into the response sent to the caller.
    ///
    /// A 2xx without a body becomes a 404; a request that never produced a
    /// status falls back to 200 with content and 404 without.
    pub fn into_response(self) -> RenderResponse {
        let render_ms = u64::try_from(self.started_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        let render_type = self.options.render_type;
        let body = self.content.unwrap_or_default();
        let mut headers = self.headers;

        let status_code = match self.status_code {
            Some(status) if (200..300).contains(&status) && body.is_empty() => 404,
            Some(status) => status,
            None if body.is_empty() => 404,
            None => 200,
        };

        if !body.is_empty() && !headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("content-type")) {
            headers.push(("Content-Type".to_string(), render_type.content_type().to_string()));
        }

        RenderResponse { status_code, headers, body, render_type, errors: self.errors, render_ms }
    }
}

/// What a render hands back to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct RenderResponse {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    #[serde(skip)]
    pub body: Vec<u8>,
    pub render_type: RenderType,
    pub errors: Vec<FailureTag>,
    pub render_ms: u64,
}

impl RenderResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Effective tunables of one render: configuration merged with per-request overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderSettings {
    pub render_type: RenderType,
    pub page_done_check_interval: Duration,
    pub resource_download_timeout: Duration,
    pub wait_after_last_request: Duration,
    pub js_check_interval: Duration,
    pub js_timeout: Duration,
    pub no_js_execution_timeout: Duration,
    pub ready_grace_delay: Duration,
    pub render_deadline: Duration,
    pub follow_redirects: bool,
    pub width: u32,
    pub height: u32,
    pub user_agent: Option<String>,
    pub ready_flag: String,
    pub log_requests: bool,
}

impl RenderSettings {
    pub fn resolve(config: &AppConfig, options: &RenderOptions) -> Self {
        // Intervals drive tokio timers, which reject a zero period.
        let interval = |over: Option<u64>, base: u64| Duration::from_millis(over.unwrap_or(base).max(1));
        let timeout = |over: Option<u64>, base: u64| Duration::from_millis(over.unwrap_or(base));

        let resource_download_timeout =
            timeout(options.resource_download_timeout_ms, config.resource_download_timeout_ms);
        let js_timeout = timeout(options.js_timeout_ms, config.js_timeout_ms);
        let render_deadline = match options.render_deadline_ms {
            Some(ms) => Duration::from_millis(ms),
            None => resource_download_timeout + js_timeout + Duration::from_millis(config.render_deadline_margin_ms),
        };

        Self {
            render_type: options.render_type,
            page_done_check_interval: interval(options.page_done_check_interval_ms, config.page_done_check_interval_ms),
            resource_download_timeout,
            wait_after_last_request: timeout(options.wait_after_last_request_ms, config.wait_after_last_request_ms),
            js_check_interval: interval(options.js_check_interval_ms, config.js_check_interval_ms),
            js_timeout,
            no_js_execution_timeout: timeout(options.no_js_execution_timeout_ms, config.no_js_execution_timeout_ms),
            ready_grace_delay: timeout(options.ready_grace_delay_ms, config.ready_grace_delay_ms),
            render_deadline,
            follow_redirects: options.follow_redirects.unwrap_or(config.follow_redirects),
            width: options.width.unwrap_or(config.width),
            height: options.height.unwrap_or(config.height),
            user_agent: options.user_agent.clone().or_else(|| config.user_agent.clone()),
            ready_flag: config.ready_flag.clone(),
            log_requests: config.log_requests,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_is_monotonic() {
        let mut req = RenderRequest::new("https://example.com/", RenderOptions::default());
        assert_eq!(req.stage(), Stage::Downloading);
        assert!(!req.advance(Stage::Downloading));
        assert!(req.advance(Stage::EvaluatingJs));
        assert!(!req.advance(Stage::Downloading));
        assert_eq!(req.stage(), Stage::EvaluatingJs);
    }

    #[test]
    fn test_finish_is_idempotent() {
        let mut req = RenderRequest::new("https://example.com/", RenderOptions::default());
        assert!(req.finish());
        assert!(!req.finish());
        assert!(!req.advance(Stage::EvaluatingJs));
        assert!(req.is_finished());
    }

    #[test]
    fn test_set_header_replaces_case_insensitively() {
        let mut req = RenderRequest::new("https://example.com/", RenderOptions::default());
        req.set_header("Location", "/a");
        req.set_header("location", "/b");
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.header("LOCATION"), Some("/b"));
    }

    #[test]
    fn test_respond_finishes_request() {
        let mut req = RenderRequest::new("https://example.com/", RenderOptions::default());
        req.respond(403, "forbidden");
        assert!(req.is_finished());

        let resp = req.into_response();
        assert_eq!(resp.status_code, 403);
        assert_eq!(resp.body_text(), Some("forbidden"));
    }

    #[test]
    fn test_empty_success_becomes_not_found() {
        let mut req = RenderRequest::new("https://example.com/", RenderOptions::default());
        req.status_code = Some(200);
        req.set_html(String::new());
        assert_eq!(req.into_response().status_code, 404);
    }

    #[test]
    fn test_redirect_keeps_status_without_body() {
        let mut req = RenderRequest::new("https://example.com/old", RenderOptions::default());
        req.status_code = Some(301);
        req.set_header("Location", "/new");
        let resp = req.into_response();
        assert_eq!(resp.status_code, 301);
        assert_eq!(resp.header("location"), Some("/new"));
        assert!(resp.header("content-type").is_none());
    }

    #[test]
    fn test_content_type_follows_render_type() {
        let mut req = RenderRequest::new("https://example.com/", RenderOptions::with_type(RenderType::Png));
        req.status_code = Some(200);
        req.content = Some(vec![0x89, b'P', b'N', b'G']);
        let resp = req.into_response();
        assert_eq!(resp.header("Content-Type"), Some("image/png"));
        assert_eq!(resp.render_type, RenderType::Png);
    }

    #[test]
    fn test_fail_records_tag_and_status() {
        let mut req = RenderRequest::new("https://example.com/", RenderOptions::default());
        req.fail(&Error::HardTimeout("page hung".into()));
        assert_eq!(req.errors(), &[FailureTag::HardTimeout]);
        assert_eq!(req.status_code, Some(504));
        assert!(req.is_finished());
    }

    #[test]
    fn test_render_type_parsing() {
        assert_eq!("PNG".parse::<RenderType>().unwrap(), RenderType::Png);
        assert_eq!("jpg".parse::<RenderType>().unwrap(), RenderType::Jpeg);
        assert!("gif".parse::<RenderType>().is_err());
    }

    #[test]
    fn test_render_options_deserialize_lowercase_type() {
        let options: RenderOptions = serde_json::from_str(r#"{"render_type":"pdf","width":800}"#).unwrap();
        assert_eq!(options.render_type, RenderType::Pdf);
        assert_eq!(options.width, Some(800));
        assert!(options.height.is_none());
    }

    #[test]
    fn test_render_options_validation() {
        assert!(RenderOptions::default().validate().is_ok());
        assert!(RenderOptions { width: Some(0), ..Default::default() }.validate().is_err());
        assert!(RenderOptions { js_timeout_ms: Some(300_001), ..Default::default() }.validate().is_err());
        assert!(RenderOptions { user_agent: Some("  ".into()), ..Default::default() }.validate().is_err());
    }

    #[test]
    fn test_settings_use_config_defaults() {
        let config = AppConfig::default();
        let settings = RenderSettings::resolve(&config, &RenderOptions::default());
        assert_eq!(settings.page_done_check_interval, Duration::from_millis(100));
        assert_eq!(settings.wait_after_last_request, Duration::from_millis(500));
        assert_eq!(settings.render_deadline, Duration::from_millis(20_000 + 10_000 + 5_000));
        assert!(!settings.follow_redirects);
        assert_eq!((settings.width, settings.height), (1440, 718));
        assert_eq!(settings.ready_flag, "window.prerenderReady");
    }

    #[test]
    fn test_settings_apply_overrides() {
        let config = AppConfig::default();
        let options = RenderOptions {
            follow_redirects: Some(true),
            js_timeout_ms: Some(2_000),
            resource_download_timeout_ms: Some(1_000),
            user_agent: Some("bot/1.0".into()),
            ..Default::default()
        };
        let settings = RenderSettings::resolve(&config, &options);
        assert!(settings.follow_redirects);
        assert_eq!(settings.js_timeout, Duration::from_millis(2_000));
        assert_eq!(settings.render_deadline, Duration::from_millis(1_000 + 2_000 + 5_000));
        assert_eq!(settings.user_agent.as_deref(), Some("bot/1.0"));
    }

    #[test]
    fn test_failure_tag_serializes_screaming_snake() {
        let json = serde_json::to_string(&FailureTag::SoftTimeout).unwrap();
        assert_eq!(json, "\"SOFT_TIMEOUT\"");
        assert!(FailureTag::DownloadTimeout.is_soft());
        assert!(!FailureTag::HardTimeout.is_soft());
    }
}
