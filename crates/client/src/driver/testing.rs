//! Scripted in-process browser.
//!
//! [`ScriptedDriver`] plays back a [`PageScript`] per URL: the event sequence a
//! real browser would emit while loading it, the value of the readiness flag
//! over time, and the document handed back on capture. Time is driven by
//! `tokio::time`, so tests can run with a paused clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::{
    BrowserDriver, BrowserHandle, DriverError, ImageFormat, NavigationResult, RedirectResponse, ScreenshotOptions,
    TabEvent, TabEvents, TabHandle, TabOptions,
};

pub const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";
pub const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];
pub const PDF_MAGIC: &[u8] = b"%PDF-1.4";

/// How the page's readiness flag behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyFlag {
    /// The page never defines the flag.
    Absent,
    /// Defined but stays `false`.
    Never,
    /// Turns `true` this long after navigation started.
    TrueAfter(Duration),
}

/// A subresource requested once the primary document finished.
#[derive(Debug, Clone)]
pub struct Subresource {
    pub url: String,
    /// Time from request start to finish. `None` never finishes.
    pub duration: Option<Duration>,
    pub failed: bool,
}

impl Subresource {
    pub fn new(url: impl Into<String>, duration: Duration) -> Self {
        Self { url: url.into(), duration: Some(duration), failed: false }
    }

    pub fn hanging(url: impl Into<String>) -> Self {
        Self { url: url.into(), duration: None, failed: false }
    }
}

/// Behavior of one page.
#[derive(Debug, Clone)]
pub struct PageScript {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub html: String,
    /// Redirecting status and `Location` of the primary document.
    pub redirect: Option<(u16, String)>,
    pub subresources: Vec<Subresource>,
    /// `None` never fires `DOMContentLoaded`.
    pub dom_content_loaded_after: Option<Duration>,
    pub ready_flag: ReadyFlag,
    pub navigate_error: Option<String>,
    /// Script evaluation never resolves.
    pub frozen: bool,
}

impl Default for PageScript {
    fn default() -> Self {
        Self {
            status: 200,
            headers: vec![("Content-Type".into(), "text/html; charset=utf-8".into())],
            html: "<!DOCTYPE html><html><head><title>ok</title></head><body>ok</body></html>".into(),
            redirect: None,
            subresources: Vec::new(),
            dom_content_loaded_after: Some(Duration::from_millis(20)),
            ready_flag: ReadyFlag::Absent,
            navigate_error: None,
            frozen: false,
        }
    }
}

impl PageScript {
    pub fn html(html: impl Into<String>) -> Self {
        Self { html: html.into(), ..Self::default() }
    }

    pub fn redirect(status: u16, location: impl Into<String>) -> Self {
        Self { redirect: Some((status, location.into())), ..Self::default() }
    }

    fn ready_value(&self, elapsed: Duration) -> Option<bool> {
        match self.ready_flag {
            ReadyFlag::Absent => None,
            ReadyFlag::Never => Some(false),
            ReadyFlag::TrueAfter(after) => Some(elapsed >= after),
        }
    }
}

#[derive(Default)]
struct Shared {
    default_script: Mutex<PageScript>,
    scripts: Mutex<HashMap<String, PageScript>>,
    browsers: Mutex<Vec<Arc<ScriptedBrowser>>>,
    launch_delay: Mutex<Duration>,
    fail_launches: AtomicU32,
    launches: AtomicU32,
    tabs_opened: AtomicU32,
    tabs_closed: AtomicU32,
    evaluations: AtomicU32,
}

impl Shared {
    fn script_for(&self, url: &str) -> PageScript {
        let scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        match scripts.get(url) {
            Some(script) => script.clone(),
            None => self.default_script.lock().unwrap_or_else(PoisonError::into_inner).clone(),
        }
    }
}

/// Driver starting [`ScriptedBrowser`]s.
#[derive(Clone, Default)]
pub struct ScriptedDriver {
    shared: Arc<Shared>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(script: PageScript) -> Self {
        let driver = Self::default();
        driver.set_default(script);
        driver
    }

    pub fn set_default(&self, script: PageScript) {
        *self.shared.default_script.lock().unwrap_or_else(PoisonError::into_inner) = script;
    }

    /// Script the page at `url` (exact match on the navigated URL).
    pub fn set_script(&self, url: impl Into<String>, script: PageScript) {
        self.shared.scripts.lock().unwrap_or_else(PoisonError::into_inner).insert(url.into(), script);
    }

    pub fn set_launch_delay(&self, delay: Duration) {
        *self.shared.launch_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Make the next `n` starts fail.
    pub fn fail_next_launches(&self, n: u32) {
        self.shared.fail_launches.store(n, Ordering::SeqCst);
    }

    /// Kill the most recently started browser.
    pub fn crash_latest(&self) {
        let browsers = self.shared.browsers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(browser) = browsers.last() {
            browser.crash();
        }
    }

    /// Start attempts, failed ones included.
    pub fn launches(&self) -> u32 {
        self.shared.launches.load(Ordering::SeqCst)
    }

    pub fn tabs_opened(&self) -> u32 {
        self.shared.tabs_opened.load(Ordering::SeqCst)
    }

    pub fn tabs_closed(&self) -> u32 {
        self.shared.tabs_closed.load(Ordering::SeqCst)
    }

    pub fn evaluations(&self) -> u32 {
        self.shared.evaluations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserDriver for ScriptedDriver {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start(&self) -> Result<Arc<dyn BrowserHandle>, DriverError> {
        self.shared.launches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.shared.launch_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failing =
            self.shared.fail_launches.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok();
        if failing {
            return Err(DriverError::Launch("scripted launch failure".into()));
        }

        let (closed, _) = watch::channel(false);
        let browser =
            Arc::new(ScriptedBrowser { shared: Arc::clone(&self.shared), closed, next_tab: AtomicU32::new(1) });
        self.shared.browsers.lock().unwrap_or_else(PoisonError::into_inner).push(Arc::clone(&browser));
        Ok(browser)
    }
}

pub struct ScriptedBrowser {
    shared: Arc<Shared>,
    closed: watch::Sender<bool>,
    next_tab: AtomicU32,
}

impl ScriptedBrowser {
    pub fn crash(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl BrowserHandle for ScriptedBrowser {
    async fn open_tab(&self, opts: &TabOptions) -> Result<(Arc<dyn TabHandle>, TabEvents), DriverError> {
        if self.is_closed() {
            return Err(DriverError::ConnectionClosed);
        }
        self.shared.tabs_opened.fetch_add(1, Ordering::SeqCst);
        let (events, rx) = mpsc::unbounded_channel();
        let tab = ScriptedTab {
            id: format!("tab-{}", self.next_tab.fetch_add(1, Ordering::SeqCst)),
            shared: Arc::clone(&self.shared),
            browser_closed: self.closed.subscribe(),
            options: opts.clone(),
            events,
            page: Mutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(tab), rx))
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.closed.send_replace(true);
        Ok(())
    }
}

struct LoadedPage {
    script: PageScript,
    started_at: Instant,
}

pub struct ScriptedTab {
    id: String,
    shared: Arc<Shared>,
    browser_closed: watch::Receiver<bool>,
    options: TabOptions,
    events: mpsc::UnboundedSender<TabEvent>,
    page: Mutex<Option<LoadedPage>>,
    stopped: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl ScriptedTab {
    pub fn options(&self) -> &TabOptions {
        &self.options
    }

    fn check_alive(&self) -> Result<(), DriverError> {
        if *self.browser_closed.borrow() || self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::ConnectionClosed);
        }
        Ok(())
    }

    fn loaded<T>(&self, f: impl FnOnce(&LoadedPage) -> T) -> Result<T, DriverError> {
        let page = self.page.lock().unwrap_or_else(PoisonError::into_inner);
        page.as_ref().map(f).ok_or_else(|| DriverError::Evaluation("no document loaded".into()))
    }

    fn frozen(&self) -> bool {
        self.loaded(|page| page.script.frozen).unwrap_or(false)
    }

    /// Timed event schedule for loading `script` from `url`.
    fn schedule(&self, url: &str, script: &PageScript) -> (Vec<(Duration, TabEvent)>, PageScript) {
        let ms = Duration::from_millis;
        let primary = "primary".to_string();
        let mut timeline =
            vec![(ms(0), TabEvent::RequestStarted { request_id: primary.clone(), url: url.to_string() })];
        let mut offset = ms(0);
        let mut document = script.clone();

        if let Some((status, location)) = &script.redirect {
            offset += ms(5);
            let target = url::Url::parse(url)
                .and_then(|base| base.join(location))
                .map(|u| u.to_string())
                .unwrap_or_else(|_| location.clone());
            let response = RedirectResponse::new(*status, vec![("Location".to_string(), location.clone())]);
            timeline.push((offset, TabEvent::Redirect { request_id: primary.clone(), url: target.clone(), response }));
            document = self.shared.script_for(&target);
            document.redirect = None;
        }

        offset += ms(5);
        timeline.push((
            offset,
            TabEvent::ResponseReceived {
                request_id: primary.clone(),
                status: document.status,
                headers: document.headers.clone(),
            },
        ));
        offset += ms(5);
        timeline.push((offset, TabEvent::RequestFinished { request_id: primary }));

        for (i, sub) in document.subresources.iter().enumerate() {
            let request_id = format!("sub-{i}");
            timeline.push((offset, TabEvent::RequestStarted { request_id: request_id.clone(), url: sub.url.clone() }));
            if let Some(duration) = sub.duration {
                let event = if sub.failed {
                    TabEvent::RequestFailed { request_id, error_text: "net::ERR_FAILED".into(), canceled: false }
                } else {
                    TabEvent::RequestFinished { request_id }
                };
                timeline.push((offset + duration, event));
            }
        }

        if let Some(after) = document.dom_content_loaded_after {
            timeline.push((after.max(offset), TabEvent::DomContentLoaded));
        }

        timeline.sort_by_key(|(at, _)| *at);
        (timeline, document)
    }
}

#[async_trait]
impl TabHandle for ScriptedTab {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<NavigationResult, DriverError> {
        self.check_alive()?;
        let script = self.shared.script_for(url);
        if let Some(error) = &script.navigate_error {
            return Err(DriverError::Navigation(error.clone()));
        }

        let (timeline, document) = self.schedule(url, &script);
        let started_at = Instant::now();
        *self.page.lock().unwrap_or_else(PoisonError::into_inner) = Some(LoadedPage { script: document, started_at });

        let events = self.events.clone();
        let stopped = Arc::clone(&self.stopped);
        tokio::spawn(async move {
            for (at, event) in timeline {
                tokio::time::sleep_until(started_at + at).await;
                if stopped.load(Ordering::SeqCst) && !matches!(event, TabEvent::DomContentLoaded) {
                    continue;
                }
                if events.send(event).is_err() {
                    break;
                }
            }
        });

        Ok(NavigationResult { url: url.to_string(), load_time_ms: 0 })
    }

    async fn stop_loading(&self) -> Result<(), DriverError> {
        self.check_alive()?;
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<Option<Value>, DriverError> {
        self.check_alive()?;
        self.shared.evaluations.fetch_add(1, Ordering::SeqCst);
        if self.frozen() {
            std::future::pending::<()>().await;
        }

        let (ready, html) =
            self.loaded(|page| (page.script.ready_value(page.started_at.elapsed()), page.script.html.clone()))?;
        if script.contains("outerHTML") {
            return Ok(Some(json!({ "ready": ready, "html": html })));
        }
        Ok(ready.map(Value::Bool))
    }

    async fn extract_document(&self) -> Result<String, DriverError> {
        self.check_alive()?;
        self.loaded(|page| page.script.html.clone())
    }

    async fn screenshot(&self, opts: &ScreenshotOptions) -> Result<Vec<u8>, DriverError> {
        self.check_alive()?;
        let magic = match opts.format {
            ImageFormat::Png => PNG_MAGIC,
            ImageFormat::Jpeg => JPEG_MAGIC,
        };
        let mut bytes = magic.to_vec();
        bytes.extend_from_slice(format!("{}x{}", self.options.width, self.options.height).as_bytes());
        Ok(bytes)
    }

    async fn print_pdf(&self) -> Result<Vec<u8>, DriverError> {
        self.check_alive()?;
        Ok(PDF_MAGIC.to_vec())
    }

    async fn close(&self) -> Result<(), DriverError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.tabs_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_scripted_tab_emits_timeline() {
        let driver = ScriptedDriver::new();
        let browser = driver.start().await.unwrap();
        let (tab, mut events) = browser.open_tab(&TabOptions::default()).await.unwrap();

        tab.navigate("https://example.com/", Duration::from_secs(5)).await.unwrap();
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            let dom = matches!(event, TabEvent::DomContentLoaded);
            seen.push(event);
            if dom {
                break;
            }
        }
        assert!(matches!(&seen[0], TabEvent::RequestStarted { request_id, .. } if request_id == "primary"));
        assert!(matches!(&seen[1], TabEvent::ResponseReceived { status: 200, .. }));
        assert!(matches!(seen.last(), Some(TabEvent::DomContentLoaded)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_redirect_resolves_location() {
        let driver = ScriptedDriver::new();
        driver.set_script("https://example.com/old", PageScript::redirect(301, "/new"));
        let browser = driver.start().await.unwrap();
        let (tab, mut events) = browser.open_tab(&TabOptions::default()).await.unwrap();

        tab.navigate("https://example.com/old", Duration::from_secs(5)).await.unwrap();
        let _started = events.recv().await;
        match events.recv().await {
            Some(TabEvent::Redirect { url, response, .. }) => {
                assert_eq!(url, "https://example.com/new");
                assert_eq!(response.status, 301);
                assert_eq!(response.location.as_deref(), Some("/new"));
            }
            other => panic!("expected redirect, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_browser_rejects_calls() {
        let driver = ScriptedDriver::new();
        let browser = driver.start().await.unwrap();
        let (tab, _events) = browser.open_tab(&TabOptions::default()).await.unwrap();
        driver.crash_latest();

        assert!(*browser.closed().borrow());
        assert!(matches!(tab.evaluate("1").await, Err(DriverError::ConnectionClosed)));
        assert!(matches!(browser.open_tab(&TabOptions::default()).await, Err(DriverError::ConnectionClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_flag_turns_true() {
        let driver = ScriptedDriver::with_default(PageScript {
            ready_flag: ReadyFlag::TrueAfter(Duration::from_millis(200)),
            ..PageScript::default()
        });
        let browser = driver.start().await.unwrap();
        let (tab, _events) = browser.open_tab(&TabOptions::default()).await.unwrap();
        tab.navigate("https://example.com/", Duration::from_secs(5)).await.unwrap();

        assert_eq!(tab.evaluate("window.prerenderReady").await.unwrap(), Some(Value::Bool(false)));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(tab.evaluate("window.prerenderReady").await.unwrap(), Some(Value::Bool(true)));
    }
}
