//! Browser driver capability set.
//!
//! The engine never talks to a browser directly. It goes through three
//! object-safe traits: a [`BrowserDriver`] starts a browser and hands back a
//! [`BrowserHandle`], which opens isolated tabs as [`TabHandle`]s. Each tab
//! comes with a channel of [`TabEvent`]s delivered in protocol order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rendr_core::{Error, RenderSettings};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

#[cfg(feature = "render")]
pub mod chromium;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(feature = "render")]
pub use chromium::ChromiumDriver;

/// Errors raised at the driver boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    /// Failed to launch or connect to the browser.
    #[error("browser launch failed: {0}")]
    Launch(String),

    /// The connection to the browser is gone.
    #[error("browser connection closed")]
    ConnectionClosed,

    /// The browser refused or failed the navigation.
    #[error("navigation failed: {0}")]
    Navigation(String),

    /// Script evaluation failed.
    #[error("evaluation failed: {0}")]
    Evaluation(String),

    /// Document, screenshot or PDF capture failed.
    #[error("capture failed: {0}")]
    Capture(String),

    /// Any other protocol level failure.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::ConnectionClosed => Error::BrowserConnectionClosed,
            DriverError::Navigation(msg) => Error::NavigationFailed(msg),
            DriverError::Launch(_) => Error::BrowserUnavailable { attempts: 1 },
            DriverError::Evaluation(msg) | DriverError::Capture(msg) | DriverError::Protocol(msg) => {
                Error::EvaluationFailed(msg)
            }
        }
    }
}

/// Response that triggered a redirect of a tracked request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectResponse {
    pub status: u16,
    pub location: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl RedirectResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>) -> Self {
        let location = headers.iter().find(|(n, _)| n.eq_ignore_ascii_case("location")).map(|(_, v)| v.clone());
        Self { status, location, headers }
    }
}

/// Network and page events of one tab. Request ids are stable across a
/// redirect chain.
#[derive(Debug, Clone, PartialEq)]
pub enum TabEvent {
    RequestStarted { request_id: String, url: String },
    /// A new leg of a redirect chain; `response` is the redirecting response.
    Redirect { request_id: String, url: String, response: RedirectResponse },
    ResponseReceived { request_id: String, status: u16, headers: Vec<(String, String)> },
    RequestFinished { request_id: String },
    RequestFailed { request_id: String, error_text: String, canceled: bool },
    DomContentLoaded,
    /// The tab's renderer process died.
    Crashed,
}

pub type TabEvents = mpsc::UnboundedReceiver<TabEvent>;

/// Options applied to a tab when it is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabOptions {
    pub width: u32,
    pub height: u32,
    pub user_agent: Option<String>,
    pub follow_redirects: bool,
    pub log_requests: bool,
}

impl TabOptions {
    pub fn from_settings(settings: &RenderSettings) -> Self {
        Self {
            width: settings.width,
            height: settings.height,
            user_agent: settings.user_agent.clone(),
            follow_redirects: settings.follow_redirects,
            log_requests: settings.log_requests,
        }
    }
}

impl Default for TabOptions {
    fn default() -> Self {
        Self { width: 1440, height: 718, user_agent: None, follow_redirects: false, log_requests: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationResult {
    pub url: String,
    pub load_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenshotOptions {
    pub format: ImageFormat,
    /// JPEG quality, ignored for PNG.
    pub quality: Option<u8>,
    pub full_page: bool,
}

impl ScreenshotOptions {
    pub fn png() -> Self {
        Self { format: ImageFormat::Png, quality: None, full_page: true }
    }

    pub fn jpeg(quality: u8) -> Self {
        Self { format: ImageFormat::Jpeg, quality: Some(quality), full_page: true }
    }
}

/// Starts browsers. Spawn versus connect is decided when the driver is built.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<Arc<dyn BrowserHandle>, DriverError>;
}

/// A running browser.
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    /// Open an isolated tab and subscribe to its events.
    async fn open_tab(&self, opts: &TabOptions) -> Result<(Arc<dyn TabHandle>, TabEvents), DriverError>;

    /// Flips to `true` once the connection to the browser is gone.
    fn closed(&self) -> watch::Receiver<bool>;

    async fn close(&self) -> Result<(), DriverError>;
}

/// One tab of a running browser.
#[async_trait]
pub trait TabHandle: Send + Sync {
    fn id(&self) -> &str;

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<NavigationResult, DriverError>;

    async fn stop_loading(&self) -> Result<(), DriverError>;

    /// Evaluate `script`, awaiting promises. `None` for an undefined result.
    async fn evaluate(&self, script: &str) -> Result<Option<Value>, DriverError>;

    /// Serialize the current document.
    async fn extract_document(&self) -> Result<String, DriverError>;

    async fn screenshot(&self, opts: &ScreenshotOptions) -> Result<Vec<u8>, DriverError>;

    async fn print_pdf(&self) -> Result<Vec<u8>, DriverError>;

    async fn close(&self) -> Result<(), DriverError>;
}
