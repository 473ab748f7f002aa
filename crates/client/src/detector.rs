//! Render completion detection.
//!
//! Phase one polls the tab every `page_done_check_interval` until the page
//! counts as loaded: DOM content loaded, network idle, readiness flag set (or
//! a redirect, or the download timeout). Phase two evaluates the flag and
//! serializes the document in one round trip every `js_check_interval`,
//! bounded by the JavaScript timeouts.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rendr_core::{Error, RenderSettings};
use serde_json::Value;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::driver::DriverError;
use crate::ledger::LedgerSignal;
use crate::tab::Tab;

/// Consecutive failed capture round trips tolerated before giving up.
const MAX_CONSECUTIVE_EVAL_ERRORS: u32 = 3;

type EvalFuture = Pin<Box<dyn Future<Output = Result<Option<Value>, DriverError>> + Send>>;

/// Detector progress. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DetectorState {
    AwaitingDom,
    AwaitingNetworkIdle,
    AwaitingReadySignal,
    Done,
    Failed,
}

/// Why phase one ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyReason {
    Redirect,
    NetworkIdle,
    ReadyFlag,
    GraceDelay,
    DownloadTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Pending,
    Ready(ReadyReason),
}

/// One observation of the page.
#[derive(Debug, Clone, Copy)]
pub struct Probe {
    pub now: Instant,
    pub redirected: bool,
    pub dom_content_loaded: bool,
    /// `None` when the flag is not a boolean.
    pub ready_flag: Option<bool>,
    pub in_flight: i64,
    pub last_activity_at: Instant,
}

/// Document captured by phase two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub html: String,
    /// Captured after `js_timeout` while the page still ran JavaScript.
    pub soft_timeout: bool,
}

#[derive(Debug)]
pub struct CompletionDetector {
    page_done_check_interval: Duration,
    resource_download_timeout: Duration,
    wait_after_last_request: Duration,
    js_check_interval: Duration,
    js_timeout: Duration,
    no_js_execution_timeout: Duration,
    ready_grace_delay: Duration,
    flag_script: String,
    capture_script: String,
    state: DetectorState,
    started_at: Instant,
    first_ready_at: Option<Instant>,
}

impl CompletionDetector {
    pub fn new(settings: &RenderSettings) -> Self {
        Self {
            page_done_check_interval: settings.page_done_check_interval,
            resource_download_timeout: settings.resource_download_timeout,
            wait_after_last_request: settings.wait_after_last_request,
            js_check_interval: settings.js_check_interval,
            js_timeout: settings.js_timeout,
            no_js_execution_timeout: settings.no_js_execution_timeout,
            ready_grace_delay: settings.ready_grace_delay,
            flag_script: flag_script(&settings.ready_flag),
            capture_script: capture_script(&settings.ready_flag),
            state: DetectorState::AwaitingDom,
            started_at: Instant::now(),
            first_ready_at: None,
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    fn transition(&mut self, next: DetectorState) {
        if next > self.state {
            self.state = next;
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        self.transition(DetectorState::Failed);
        err
    }

    /// Decide from one probe whether phase one is over.
    pub fn decide(&mut self, probe: &Probe) -> Decision {
        if probe.redirected {
            self.transition(DetectorState::Done);
            return Decision::Ready(ReadyReason::Redirect);
        }

        if probe.dom_content_loaded {
            self.transition(DetectorState::AwaitingNetworkIdle);
            let idle = probe.in_flight <= 0
                && probe.now.saturating_duration_since(probe.last_activity_at) > self.wait_after_last_request;

            let ready = match probe.ready_flag {
                None if idle => Some(ReadyReason::NetworkIdle),
                None => None,
                Some(true) => {
                    let first_ready_at = *self.first_ready_at.get_or_insert(probe.now);
                    if idle {
                        Some(ReadyReason::ReadyFlag)
                    } else if probe.now.saturating_duration_since(first_ready_at) > self.ready_grace_delay {
                        Some(ReadyReason::GraceDelay)
                    } else {
                        None
                    }
                }
                Some(false) => {
                    if idle {
                        self.transition(DetectorState::AwaitingReadySignal);
                    }
                    None
                }
            };
            if let Some(reason) = ready {
                self.transition(DetectorState::Done);
                return Decision::Ready(reason);
            }
        }

        if probe.now.saturating_duration_since(self.started_at) > self.resource_download_timeout {
            self.transition(DetectorState::Done);
            return Decision::Ready(ReadyReason::DownloadTimeout);
        }
        Decision::Pending
    }

    /// Phase one: poll until the page is loaded.
    ///
    /// # Errors
    ///
    /// Fails with the teardown error of the owning instance when it crashed
    /// or was recycled, and with `EvaluationFailed` when the tab crashed.
    pub async fn wait_for_page(&mut self, tab: &mut Tab) -> Result<ReadyReason, Error> {
        let token = tab.cancel_token();
        let mut ticker = tokio::time::interval(self.page_done_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(self.fail(tab.teardown_error())),
                _ = ticker.tick() => {}
            }
            tab.ensure_current().map_err(|e| self.fail(e))?;

            if tab.pump() == LedgerSignal::PrimaryRedirected
                && let Err(e) = tab.handle().stop_loading().await
            {
                tracing::debug!(tab_id = tab.id(), "Stopping redirected load failed: {e}");
            }
            if tab.is_crashed() {
                return Err(self.fail(Error::EvaluationFailed("tab crashed".into())));
            }

            let redirected = tab.ledger.redirect().is_some();
            let ready_flag = if tab.dom_content_loaded() && !redirected {
                self.probe_ready_flag(tab, &token).await.map_err(|e| self.fail(e))?
            } else {
                None
            };

            let probe = Probe {
                now: Instant::now(),
                redirected,
                dom_content_loaded: tab.dom_content_loaded(),
                ready_flag,
                in_flight: tab.ledger.in_flight(),
                last_activity_at: tab.ledger.last_activity_at(),
            };
            if let Decision::Ready(reason) = self.decide(&probe) {
                tracing::debug!(
                    tab_id = tab.id(),
                    ?reason,
                    requests = tab.ledger.seen(),
                    "Page loaded"
                );
                return Ok(reason);
            }
        }
    }

    /// Evaluate the readiness flag. A probe that does not return in time
    /// counts as "not ready yet".
    async fn probe_ready_flag(&self, tab: &Tab, token: &CancellationToken) -> Result<Option<bool>, Error> {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(tab.teardown_error()),
            result = tokio::time::timeout(self.js_check_interval, tab.handle().evaluate(&self.flag_script)) => result,
        };
        match result {
            Ok(Ok(value)) => Ok(value.as_ref().and_then(Value::as_bool)),
            Ok(Err(DriverError::ConnectionClosed)) => Err(Error::BrowserConnectionClosed),
            Ok(Err(e)) => {
                tracing::debug!(tab_id = tab.id(), "Ready flag probe failed: {e}");
                Ok(Some(false))
            }
            Err(_) => Ok(Some(false)),
        }
    }

    /// Phase two: wait for JavaScript to settle and capture the document.
    ///
    /// # Errors
    ///
    /// `HardTimeout` when no round trip succeeded within `js_timeout`, or
    /// none succeeded for `no_js_execution_timeout`. Teardown and crash
    /// errors as in [`Self::wait_for_page`].
    pub async fn capture(&mut self, tab: &mut Tab) -> Result<Capture, Error> {
        let token = tab.cancel_token();
        let handle = tab.shared_handle();
        let started_at = Instant::now();
        let mut last_success: Option<Instant> = None;
        let mut last_html: Option<String> = None;
        let mut consecutive_errors = 0;
        let mut pending: Option<EvalFuture> = None;
        let mut ticker = tokio::time::interval(self.js_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(self.fail(tab.teardown_error())),
                result = poll_pending(&mut pending) => {
                    pending = None;
                    match result {
                        Ok(value) => {
                            consecutive_errors = 0;
                            last_success = Some(Instant::now());
                            match parse_capture(value) {
                                Some((ready, html)) if ready != Some(false) => {
                                    self.transition(DetectorState::Done);
                                    return Ok(Capture { html, soft_timeout: false });
                                }
                                Some((_, html)) => last_html = Some(html),
                                None => tracing::debug!(tab_id = tab.id(), "Capture returned no document"),
                            }
                        }
                        Err(DriverError::ConnectionClosed) => {
                            return Err(self.fail(Error::BrowserConnectionClosed));
                        }
                        Err(e) => {
                            consecutive_errors += 1;
                            tracing::warn!(tab_id = tab.id(), consecutive_errors, "Capture round trip failed: {e}");
                            if consecutive_errors >= MAX_CONSECUTIVE_EVAL_ERRORS {
                                return Err(self.fail(Error::EvaluationFailed(e.to_string())));
                            }
                        }
                    }
                }
                _ = ticker.tick() => {
                    tab.ensure_current().map_err(|e| self.fail(e))?;
                    tab.pump();
                    if tab.is_crashed() {
                        return Err(self.fail(Error::EvaluationFailed("tab crashed".into())));
                    }

                    let now = Instant::now();
                    let elapsed = now.saturating_duration_since(started_at);
                    let since_js = now.saturating_duration_since(last_success.unwrap_or(started_at));
                    let never_answered = elapsed > self.js_timeout && last_success.is_none();
                    if since_js > self.no_js_execution_timeout || never_answered {
                        return Err(self.fail(Error::HardTimeout(format!(
                            "no JavaScript round trip for {}ms",
                            since_js.as_millis()
                        ))));
                    }

                    if elapsed > self.js_timeout {
                        pending = None;
                        let extract = tokio::time::timeout(self.no_js_execution_timeout, handle.extract_document());
                        let html = match extract.await {
                            Ok(Ok(html)) => Some(html),
                            Ok(Err(e)) => {
                                tracing::debug!(tab_id = tab.id(), "Extracting document failed: {e}");
                                last_html.take()
                            }
                            Err(_) => last_html.take(),
                        };
                        let html = html.ok_or_else(|| {
                            self.fail(Error::EvaluationFailed("document unavailable after js timeout".into()))
                        })?;
                        tracing::info!(
                            tab_id = tab.id(),
                            js_timeout = ?self.js_timeout,
                            "Soft timeout, capturing current document"
                        );
                        self.transition(DetectorState::Done);
                        return Ok(Capture { html, soft_timeout: true });
                    }

                    if pending.is_none() {
                        let handle = Arc::clone(&handle);
                        let script = self.capture_script.clone();
                        pending = Some(Box::pin(async move { handle.evaluate(&script).await }));
                    }
                }
            }
        }
    }
}

async fn poll_pending(pending: &mut Option<EvalFuture>) -> Result<Option<Value>, DriverError> {
    match pending {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

fn parse_capture(value: Option<Value>) -> Option<(Option<bool>, String)> {
    let value = value?;
    let html = value.get("html")?.as_str()?.to_string();
    Some((value.get("ready").and_then(Value::as_bool), html))
}

fn flag_script(flag: &str) -> String {
    format!(
        "(() => {{ try {{ const v = ({flag}); return typeof v === 'boolean' ? v : undefined; }} \
         catch (e) {{ return undefined; }} }})()"
    )
}

fn capture_script(flag: &str) -> String {
    format!(
        "(() => {{ \
            let ready = null; \
            try {{ const v = ({flag}); ready = typeof v === 'boolean' ? v : null; }} catch (e) {{}} \
            const doctype = document.doctype ? new XMLSerializer().serializeToString(document.doctype) : ''; \
            return {{ ready, html: doctype + document.documentElement.outerHTML }}; \
        }})()"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::TabOptions;
    use crate::driver::testing::{PageScript, ReadyFlag, ScriptedDriver, Subresource};
    use crate::lifecycle::{BrowserLifecycleManager, LifecyclePolicy};
    use rendr_core::{AppConfig, RenderOptions};

    fn settings() -> RenderSettings {
        RenderSettings::resolve(&AppConfig::default(), &RenderOptions::default())
    }

    fn probe(detector: &CompletionDetector, after_ms: u64) -> Probe {
        let now = detector.started_at + Duration::from_millis(after_ms);
        Probe {
            now,
            redirected: false,
            dom_content_loaded: true,
            ready_flag: None,
            in_flight: 0,
            last_activity_at: detector.started_at,
        }
    }

    async fn navigated(script: PageScript) -> (Arc<ScriptedDriver>, BrowserLifecycleManager, Tab) {
        let driver = Arc::new(ScriptedDriver::with_default(script));
        let manager = BrowserLifecycleManager::new(driver.clone(), LifecyclePolicy::default());
        manager.start().await.unwrap();
        let mut tab = manager.acquire_tab(&TabOptions::default()).await.unwrap();
        tab.ledger.touch();
        tab.handle().navigate("https://example.com/", Duration::from_secs(5)).await.unwrap();
        (driver, manager, tab)
    }

    #[test]
    fn test_redirect_is_ready_immediately() {
        let mut detector = CompletionDetector::new(&settings());
        let p = Probe { redirected: true, dom_content_loaded: false, in_flight: 3, ..probe(&detector, 0) };
        assert_eq!(detector.decide(&p), Decision::Ready(ReadyReason::Redirect));
        assert_eq!(detector.state(), DetectorState::Done);
    }

    #[test]
    fn test_network_idle_requires_quiet_period() {
        let mut detector = CompletionDetector::new(&settings());
        assert_eq!(detector.decide(&probe(&detector, 400)), Decision::Pending);
        assert_eq!(detector.state(), DetectorState::AwaitingNetworkIdle);
        assert_eq!(detector.decide(&probe(&detector, 501)), Decision::Ready(ReadyReason::NetworkIdle));
    }

    #[test]
    fn test_in_flight_requests_block_readiness() {
        let mut detector = CompletionDetector::new(&settings());
        let p = Probe { in_flight: 1, ..probe(&detector, 5_000) };
        assert_eq!(detector.decide(&p), Decision::Pending);
    }

    #[test]
    fn test_dom_not_loaded_waits_for_download_timeout() {
        let mut detector = CompletionDetector::new(&settings());
        let p = Probe { dom_content_loaded: false, ..probe(&detector, 19_000) };
        assert_eq!(detector.decide(&p), Decision::Pending);
        assert_eq!(detector.state(), DetectorState::AwaitingDom);

        let p = Probe { dom_content_loaded: false, ..probe(&detector, 20_001) };
        assert_eq!(detector.decide(&p), Decision::Ready(ReadyReason::DownloadTimeout));
    }

    #[test]
    fn test_false_flag_holds_idle_page() {
        let mut detector = CompletionDetector::new(&settings());
        let p = Probe { ready_flag: Some(false), ..probe(&detector, 2_000) };
        assert_eq!(detector.decide(&p), Decision::Pending);
        assert_eq!(detector.state(), DetectorState::AwaitingReadySignal);
    }

    #[test]
    fn test_true_flag_with_busy_network_uses_grace_delay() {
        let mut detector = CompletionDetector::new(&settings());
        let busy =
            |detector: &CompletionDetector, ms| Probe { ready_flag: Some(true), in_flight: 2, ..probe(detector, ms) };

        assert_eq!(detector.decide(&busy(&detector, 100)), Decision::Pending);
        assert_eq!(detector.decide(&busy(&detector, 1_000)), Decision::Pending);
        assert_eq!(detector.decide(&busy(&detector, 1_101)), Decision::Ready(ReadyReason::GraceDelay));
    }

    #[test]
    fn test_true_flag_with_idle_network() {
        let mut detector = CompletionDetector::new(&settings());
        let p = Probe { ready_flag: Some(true), ..probe(&detector, 600) };
        assert_eq!(detector.decide(&p), Decision::Ready(ReadyReason::ReadyFlag));
    }

    #[test]
    fn test_state_never_moves_backwards() {
        let mut detector = CompletionDetector::new(&settings());
        detector.decide(&Probe { ready_flag: Some(false), ..probe(&detector, 2_000) });
        assert_eq!(detector.state(), DetectorState::AwaitingReadySignal);
        detector.decide(&Probe { ready_flag: Some(false), in_flight: 1, ..probe(&detector, 2_100) });
        assert_eq!(detector.state(), DetectorState::AwaitingReadySignal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_idle_page() {
        let (_driver, _manager, mut tab) = navigated(PageScript::default()).await;
        let mut detector = CompletionDetector::new(&settings());
        let started = Instant::now();

        let reason = detector.wait_for_page(&mut tab).await.unwrap();
        assert_eq!(reason, ReadyReason::NetworkIdle);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(tab.ledger.primary_status(), Some(200));
        assert_eq!(tab.ledger.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_subresource_hits_download_timeout() {
        let script = PageScript {
            subresources: vec![Subresource::hanging("https://example.com/slow.js")],
            ..PageScript::default()
        };
        let (_driver, _manager, mut tab) = navigated(script).await;
        let mut detector = CompletionDetector::new(&settings());

        let reason = detector.wait_for_page(&mut tab).await.unwrap();
        assert_eq!(reason, ReadyReason::DownloadTimeout);
        assert_eq!(tab.ledger.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_flag_gates_page() {
        let script = PageScript { ready_flag: ReadyFlag::TrueAfter(Duration::from_secs(2)), ..PageScript::default() };
        let (_driver, _manager, mut tab) = navigated(script).await;
        let mut detector = CompletionDetector::new(&settings());
        let started = Instant::now();

        let reason = detector.wait_for_page(&mut tab).await.unwrap();
        assert_eq!(reason, ReadyReason::ReadyFlag);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_returns_document() {
        let (_driver, _manager, mut tab) = navigated(PageScript::html("<html><body>hi</body></html>")).await;
        let mut detector = CompletionDetector::new(&settings());
        detector.wait_for_page(&mut tab).await.unwrap();

        let capture = detector.capture(&mut tab).await.unwrap();
        assert_eq!(capture.html, "<html><body>hi</body></html>");
        assert!(!capture.soft_timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_soft_timeout_when_flag_stays_false() {
        let script = PageScript { ready_flag: ReadyFlag::Never, ..PageScript::default() };
        let (_driver, _manager, mut tab) = navigated(script).await;
        let mut detector = CompletionDetector::new(&settings());
        let started = Instant::now();

        let capture = detector.capture(&mut tab).await.unwrap();
        assert!(capture.soft_timeout);
        assert!(capture.html.contains("<body>ok</body>"));
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_hard_timeout_when_js_never_returns() {
        let script = PageScript { frozen: true, ..PageScript::default() };
        let (_driver, _manager, mut tab) = navigated(script).await;
        let mut detector = CompletionDetector::new(&settings());

        let err = detector.capture(&mut tab).await.unwrap_err();
        assert!(matches!(err, Error::HardTimeout(_)));
        assert_eq!(detector.state(), DetectorState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_wakes_waiting_detector() {
        let script = PageScript { ready_flag: ReadyFlag::Never, ..PageScript::default() };
        let (driver, _manager, mut tab) = navigated(script).await;
        let mut detector = CompletionDetector::new(&settings());

        let crasher = driver.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            crasher.crash_latest();
        });

        let err = detector.wait_for_page(&mut tab).await.unwrap_err();
        assert!(matches!(err, Error::BrowserConnectionClosed));
    }
}
