//! Chrome DevTools driver built on chromiumoxide.
//!
//! Every tab lives in its own browser context so cookies and storage never
//! leak between renders. Network and page events of a tab are merged into one
//! ordered channel by a forwarding task owned by the tab.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::inspector::{self, EventTargetCrashed};
use chromiumoxide::cdp::browser_protocol::network::{
    self, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent, EventResponseReceived, Headers,
    SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, EventDomContentEventFired, NavigateParams, PrintToPdfParams, StopLoadingParams,
};
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures_util::StreamExt;
use rendr_core::AppConfig;
use serde_json::Value;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;

use super::{
    BrowserDriver, BrowserHandle, DriverError, ImageFormat, NavigationResult, RedirectResponse, ScreenshotOptions,
    TabEvent, TabEvents, TabHandle, TabOptions,
};

/// How the driver reaches a browser.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Spawn { executable: Option<PathBuf>, flags: Vec<String>, headless: bool, window: (u32, u32) },
    Connect { ws_url: String },
}

/// Spawns a local Chrome/Chromium or connects to a running one.
#[derive(Debug, Clone)]
pub struct ChromiumDriver {
    target: Target,
}

impl ChromiumDriver {
    /// Launch a local browser. The executable is auto-detected when `None`.
    pub fn spawn(executable: Option<PathBuf>, flags: Vec<String>, headless: bool) -> Self {
        Self { target: Target::Spawn { executable, flags, headless, window: (1440, 718) } }
    }

    /// Attach to the DevTools websocket of a running browser.
    pub fn connect(ws_url: impl Into<String>) -> Self {
        Self { target: Target::Connect { ws_url: ws_url.into() } }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        match &config.browser_ws_url {
            Some(ws_url) => Self::connect(ws_url.clone()),
            None => Self {
                target: Target::Spawn {
                    executable: config.chrome_path.clone(),
                    flags: config.chrome_flags.clone(),
                    headless: config.headless,
                    window: (config.width, config.height),
                },
            },
        }
    }

    fn browser_config(&self) -> Result<Option<BrowserConfig>, DriverError> {
        let Target::Spawn { executable, flags, headless, window } = &self.target else {
            return Ok(None);
        };

        let mut builder = BrowserConfig::builder().window_size(window.0, window.1).args(flags.iter());
        if let Some(path) = executable {
            builder = builder.chrome_executable(path);
        }
        if !headless {
            builder = builder.with_head();
        }
        builder.build().map(Some).map_err(DriverError::Launch)
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    fn name(&self) -> &str {
        match self.target {
            Target::Spawn { .. } => "chromium",
            Target::Connect { .. } => "chromium-remote",
        }
    }

    async fn start(&self) -> Result<Arc<dyn BrowserHandle>, DriverError> {
        let (browser, mut handler) = match (&self.target, self.browser_config()?) {
            (Target::Connect { ws_url }, _) => {
                tracing::info!(ws_url = %ws_url, "Connecting to browser");
                Browser::connect(ws_url.clone()).await.map_err(|e| DriverError::Launch(e.to_string()))?
            }
            (Target::Spawn { .. }, Some(config)) => {
                tracing::info!("Launching browser");
                Browser::launch(config).await.map_err(|e| DriverError::Launch(e.to_string()))?
            }
            (Target::Spawn { .. }, None) => return Err(DriverError::Launch("missing browser config".into())),
        };

        let (closed_tx, closed_rx) = watch::channel(false);
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::debug!("browser handler event error: {e}");
                }
            }
            tracing::debug!("Browser handler finished");
            closed_tx.send_replace(true);
        });

        Ok(Arc::new(ChromiumBrowser { browser: Arc::new(RwLock::new(browser)), closed: closed_rx, handler_task }))
    }
}

fn map_cdp(err: CdpError, wrap: fn(String) -> DriverError) -> DriverError {
    match err {
        CdpError::Ws(_) | CdpError::ChannelSendError(_) => DriverError::ConnectionClosed,
        other => wrap(other.to_string()),
    }
}

fn protocol(err: CdpError) -> DriverError {
    map_cdp(err, DriverError::Protocol)
}

pub struct ChromiumBrowser {
    browser: Arc<RwLock<Browser>>,
    closed: watch::Receiver<bool>,
    handler_task: JoinHandle<()>,
}

impl ChromiumBrowser {
    fn ensure_open(&self) -> Result<(), DriverError> {
        if *self.closed.borrow() { Err(DriverError::ConnectionClosed) } else { Ok(()) }
    }
}

#[async_trait]
impl BrowserHandle for ChromiumBrowser {
    async fn open_tab(&self, opts: &TabOptions) -> Result<(Arc<dyn TabHandle>, TabEvents), DriverError> {
        self.ensure_open()?;
        let browser = self.browser.read().await;

        let context_id =
            browser.execute(CreateBrowserContextParams::default()).await.map_err(protocol)?.result.browser_context_id;

        let mut params = CreateTargetParams::new("about:blank");
        params.browser_context_id = Some(context_id.clone());
        let page = match browser.new_page(params).await {
            Ok(page) => page,
            Err(e) => {
                let _ = browser.execute(DisposeBrowserContextParams::new(context_id)).await;
                return Err(protocol(e));
            }
        };
        drop(browser);

        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = match setup_tab(&page, opts, tx).await {
            Ok(forwarder) => forwarder,
            Err(e) => {
                let _ = page.clone().close().await;
                let _ = self.browser.read().await.execute(DisposeBrowserContextParams::new(context_id)).await;
                return Err(e);
            }
        };

        let id = page.target_id().inner().clone();
        tracing::debug!(tab = %id, "Tab opened");
        let tab = ChromiumTab {
            id,
            page,
            context_id,
            browser: Arc::clone(&self.browser),
            closed: self.closed.clone(),
            forwarder,
        };
        Ok((Arc::new(tab), rx))
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }

    async fn close(&self) -> Result<(), DriverError> {
        if !*self.closed.borrow() {
            let mut browser = self.browser.write().await;
            browser.close().await.map_err(protocol)?;
            let _ = browser.wait().await;
        }
        self.handler_task.abort();
        Ok(())
    }
}

impl Drop for ChromiumBrowser {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}

/// Apply tab options and start forwarding events to `tx`.
async fn setup_tab(
    page: &Page, opts: &TabOptions, tx: mpsc::UnboundedSender<TabEvent>,
) -> Result<JoinHandle<()>, DriverError> {
    page.execute(network::EnableParams::default()).await.map_err(protocol)?;
    page.execute(inspector::EnableParams::default()).await.map_err(protocol)?;
    if let Some(ua) = &opts.user_agent {
        page.execute(SetUserAgentOverrideParams::new(ua.clone())).await.map_err(protocol)?;
    }
    let width = i64::from(opts.width);
    let height = i64::from(opts.height);
    page.execute(SetDeviceMetricsOverrideParams::new(width, height, 1.0, false)).await.map_err(protocol)?;

    let mut started = page.event_listener::<EventRequestWillBeSent>().await.map_err(protocol)?;
    let mut responses = page.event_listener::<EventResponseReceived>().await.map_err(protocol)?;
    let mut finished = page.event_listener::<EventLoadingFinished>().await.map_err(protocol)?;
    let mut failed = page.event_listener::<EventLoadingFailed>().await.map_err(protocol)?;
    let mut dom_loaded = page.event_listener::<EventDomContentEventFired>().await.map_err(protocol)?;
    let mut crashed = page.event_listener::<EventTargetCrashed>().await.map_err(protocol)?;
    let log_requests = opts.log_requests;

    Ok(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                Some(_) = crashed.next() => TabEvent::Crashed,
                Some(ev) = started.next() => {
                    let request_id = ev.request_id.inner().clone();
                    let url = ev.request.url.clone();
                    if log_requests {
                        tracing::info!(request_id = %request_id, url = %url, "Request started");
                    }
                    match &ev.redirect_response {
                        Some(response) => TabEvent::Redirect {
                            request_id,
                            url,
                            response: RedirectResponse::new(
                                status_of(response.status),
                                header_pairs(&response.headers),
                            ),
                        },
                        None => TabEvent::RequestStarted { request_id, url },
                    }
                }
                Some(ev) = responses.next() => TabEvent::ResponseReceived {
                    request_id: ev.request_id.inner().clone(),
                    status: status_of(ev.response.status),
                    headers: header_pairs(&ev.response.headers),
                },
                Some(ev) = finished.next() => TabEvent::RequestFinished { request_id: ev.request_id.inner().clone() },
                Some(ev) = failed.next() => TabEvent::RequestFailed {
                    request_id: ev.request_id.inner().clone(),
                    error_text: ev.error_text.clone(),
                    canceled: ev.canceled.unwrap_or(false),
                },
                Some(_) = dom_loaded.next() => TabEvent::DomContentLoaded,
                else => break,
            };
            let crashed = event == TabEvent::Crashed;
            if tx.send(event).is_err() || crashed {
                break;
            }
        }
    }))
}

fn status_of(status: i64) -> u16 {
    u16::try_from(status).unwrap_or(0)
}

fn header_pairs(headers: &Headers) -> Vec<(String, String)> {
    let Some(map) = headers.inner().as_object() else {
        return Vec::new();
    };
    map.iter()
        .map(|(name, value)| {
            let value = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
            (name.clone(), value)
        })
        .collect()
}

pub struct ChromiumTab {
    id: String,
    page: Page,
    context_id: BrowserContextId,
    browser: Arc<RwLock<Browser>>,
    closed: watch::Receiver<bool>,
    forwarder: JoinHandle<()>,
}

impl ChromiumTab {
    fn ensure_open(&self) -> Result<(), DriverError> {
        if *self.closed.borrow() { Err(DriverError::ConnectionClosed) } else { Ok(()) }
    }
}

#[async_trait]
impl TabHandle for ChromiumTab {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<NavigationResult, DriverError> {
        self.ensure_open()?;
        let start = Instant::now();
        let response = tokio::time::timeout(timeout, self.page.execute(NavigateParams::new(url)))
            .await
            .map_err(|_| DriverError::Navigation(format!("navigation not committed within {timeout:?}")))?
            .map_err(|e| map_cdp(e, DriverError::Navigation))?;

        if let Some(error_text) = response.result.error_text.as_ref() {
            return Err(DriverError::Navigation(error_text.clone()));
        }
        Ok(NavigationResult {
            url: url.to_string(),
            load_time_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }

    async fn stop_loading(&self) -> Result<(), DriverError> {
        self.ensure_open()?;
        self.page.execute(StopLoadingParams::default()).await.map_err(protocol)?;
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<Option<Value>, DriverError> {
        self.ensure_open()?;
        let params = EvaluateParams::builder()
            .expression(script)
            .return_by_value(true)
            .await_promise(true)
            .build()
            .map_err(DriverError::Evaluation)?;
        let result = self.page.evaluate_expression(params).await.map_err(|e| map_cdp(e, DriverError::Evaluation))?;
        Ok(result.value().cloned())
    }

    async fn extract_document(&self) -> Result<String, DriverError> {
        self.ensure_open()?;
        self.page.content().await.map_err(|e| map_cdp(e, DriverError::Capture))
    }

    async fn screenshot(&self, opts: &ScreenshotOptions) -> Result<Vec<u8>, DriverError> {
        self.ensure_open()?;
        let format = match opts.format {
            ImageFormat::Png => CaptureScreenshotFormat::Png,
            ImageFormat::Jpeg => CaptureScreenshotFormat::Jpeg,
        };
        let mut builder = ScreenshotParams::builder().format(format).full_page(opts.full_page);
        if let Some(quality) = opts.quality {
            builder = builder.quality(i64::from(quality));
        }
        self.page.screenshot(builder.build()).await.map_err(|e| map_cdp(e, DriverError::Capture))
    }

    async fn print_pdf(&self) -> Result<Vec<u8>, DriverError> {
        self.ensure_open()?;
        self.page.pdf(PrintToPdfParams::default()).await.map_err(|e| map_cdp(e, DriverError::Capture))
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.forwarder.abort();
        if *self.closed.borrow() {
            return Ok(());
        }
        self.page.clone().close().await.map_err(protocol)?;
        let browser = self.browser.read().await;
        browser.execute(DisposeBrowserContextParams::new(self.context_id.clone())).await.map_err(protocol)?;
        Ok(())
    }
}

impl Drop for ChromiumTab {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_picks_target() {
        let config = AppConfig::default();
        assert_eq!(ChromiumDriver::from_config(&config).name(), "chromium");

        let config = AppConfig { browser_ws_url: Some("ws://127.0.0.1:9222/devtools/browser/x".into()), ..config };
        assert_eq!(ChromiumDriver::from_config(&config).name(), "chromium-remote");
    }

    #[test]
    fn test_header_pairs() {
        let headers = Headers::new(serde_json::json!({"Location": "/next", "X-Count": 3}));
        let mut pairs = header_pairs(&headers);
        pairs.sort();
        assert_eq!(pairs, vec![("Location".into(), "/next".into()), ("X-Count".into(), "3".into())]);
    }

    #[test]
    fn test_status_of() {
        assert_eq!(status_of(301), 301);
        assert_eq!(status_of(-1), 0);
    }

    #[tokio::test]
    #[ignore = "requires Chrome/Chromium installation"]
    async fn test_launch_and_render_blank() {
        let driver = ChromiumDriver::from_config(&AppConfig::default());
        let browser = driver.start().await.unwrap();
        let (tab, _events) = browser.open_tab(&TabOptions::default()).await.unwrap();

        tab.navigate("about:blank", Duration::from_secs(10)).await.unwrap();
        let html = tab.extract_document().await.unwrap();
        assert!(html.contains("<html"));

        let png = tab.screenshot(&ScreenshotOptions::png()).await.unwrap();
        assert_eq!(&png[..4], b"\x89PNG");

        tab.close().await.unwrap();
        browser.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires Chrome/Chromium installation"]
    async fn test_renderer_crash_is_forwarded() {
        let driver = ChromiumDriver::from_config(&AppConfig::default());
        let browser = driver.start().await.unwrap();
        let (tab, mut events) = browser.open_tab(&TabOptions::default()).await.unwrap();

        let _ = tab.navigate("chrome://crash", Duration::from_secs(5)).await;
        let crashed = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = events.recv().await {
                if event == TabEvent::Crashed {
                    return true;
                }
            }
            false
        })
        .await;
        assert!(matches!(crashed, Ok(true)));

        let _ = tab.close().await;
        browser.close().await.unwrap();
    }
}
