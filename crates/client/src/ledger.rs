//! Per-render table of in-flight network requests.
//!
//! The ledger is fed from a tab's event channel and answers two questions for
//! the completion detector: how many requests are still outstanding, and when
//! the network was last active. It also keeps the primary document's status,
//! headers and redirect.

use std::collections::HashMap;

use tokio::time::{Duration, Instant};

use crate::driver::{RedirectResponse, TabEvent};

/// What the owner of a ledger has to act on after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerSignal {
    None,
    /// The primary document redirected and redirects are not followed; the
    /// owner should stop loading.
    PrimaryRedirected,
}

#[derive(Debug)]
struct Entry {
    url: String,
    wall_time: Instant,
}

#[derive(Debug)]
pub struct RequestLedger {
    follow_redirects: bool,
    log_requests: bool,
    requests: HashMap<String, Entry>,
    seen: u64,
    finished: u64,
    failed: u64,
    aborted: u64,
    primary_id: Option<String>,
    primary_url: Option<String>,
    primary_status: Option<u16>,
    primary_headers: Vec<(String, String)>,
    primary_error: Option<String>,
    redirect: Option<RedirectResponse>,
    last_activity_at: Instant,
}

impl RequestLedger {
    pub fn new(follow_redirects: bool, log_requests: bool) -> Self {
        Self {
            follow_redirects,
            log_requests,
            requests: HashMap::new(),
            seen: 0,
            finished: 0,
            failed: 0,
            aborted: 0,
            primary_id: None,
            primary_url: None,
            primary_status: None,
            primary_headers: Vec::new(),
            primary_error: None,
            redirect: None,
            last_activity_at: Instant::now(),
        }
    }

    /// Apply one tab event.
    pub fn apply(&mut self, event: TabEvent) -> LedgerSignal {
        match event {
            TabEvent::RequestStarted { request_id, url } => self.on_request_started(&request_id, &url, None),
            TabEvent::Redirect { request_id, url, response } => {
                self.on_request_started(&request_id, &url, Some(response))
            }
            TabEvent::ResponseReceived { request_id, status, headers } => {
                self.on_response_received(&request_id, status, headers);
                LedgerSignal::None
            }
            TabEvent::RequestFinished { request_id } => {
                self.on_request_finished(&request_id);
                LedgerSignal::None
            }
            TabEvent::RequestFailed { request_id, error_text, canceled } => {
                self.on_request_failed(&request_id, &error_text, canceled);
                LedgerSignal::None
            }
            TabEvent::DomContentLoaded | TabEvent::Crashed => LedgerSignal::None,
        }
    }

    /// Track a request start. `redirect` is set when this start continues a
    /// redirect chain under the same id.
    pub fn on_request_started(
        &mut self, request_id: &str, url: &str, redirect: Option<RedirectResponse>,
    ) -> LedgerSignal {
        let is_primary = match &self.primary_id {
            Some(primary) => primary == request_id,
            None => {
                self.primary_id = Some(request_id.to_string());
                self.primary_url = Some(url.to_string());
                true
            }
        };

        if let Some(response) = redirect {
            // The protocol never reports a finish for the leg that redirected.
            if let Some(entry) = self.requests.remove(request_id) {
                self.finished += 1;
                self.last_activity_at = Instant::now();
                tracing::trace!(request_id, url = %entry.url, status = response.status, "Redirect leg settled");
            }

            if is_primary && !self.follow_redirects {
                tracing::debug!(
                    status = response.status,
                    location = response.location.as_deref().unwrap_or_default(),
                    "Primary document redirected"
                );
                self.redirect = Some(response);
                return LedgerSignal::PrimaryRedirected;
            }

            if is_primary {
                self.primary_url = Some(url.to_string());
            }
        } else if self.requests.contains_key(request_id) {
            tracing::debug!(request_id, url, "Duplicate request start ignored");
            return LedgerSignal::None;
        }

        self.requests.insert(request_id.to_string(), Entry { url: url.to_string(), wall_time: Instant::now() });
        self.seen += 1;
        if self.log_requests {
            tracing::info!(request_id, url, in_flight = self.in_flight(), "Request started");
        }
        LedgerSignal::None
    }

    pub fn on_response_received(&mut self, request_id: &str, status: u16, headers: Vec<(String, String)>) {
        if self.primary_id.as_deref() == Some(request_id) && self.redirect.is_none() {
            self.primary_status = Some(status);
            self.primary_headers = headers;
        }
    }

    pub fn on_request_finished(&mut self, request_id: &str) {
        let Some(entry) = self.requests.remove(request_id) else {
            return;
        };
        self.finished += 1;
        self.last_activity_at = Instant::now();
        if self.log_requests {
            tracing::info!(
                request_id,
                url = %entry.url,
                elapsed_ms = entry.wall_time.elapsed().as_millis() as u64,
                in_flight = self.in_flight(),
                "Request finished"
            );
        }
    }

    /// Track a failed request. Canceled requests count as aborted.
    pub fn on_request_failed(&mut self, request_id: &str, error_text: &str, canceled: bool) {
        let Some(entry) = self.requests.remove(request_id) else {
            return;
        };
        if canceled {
            self.aborted += 1;
        } else {
            self.failed += 1;
        }
        if self.primary_id.as_deref() == Some(request_id) && !canceled {
            self.primary_error = Some(error_text.to_string());
        }
        self.last_activity_at = Instant::now();
        if self.log_requests {
            tracing::info!(request_id, url = %entry.url, error_text, canceled, "Request failed");
        } else {
            tracing::trace!(request_id, url = %entry.url, error_text, canceled, "Request failed");
        }
    }

    /// `seen - finished - failed - aborted`.
    pub fn in_flight(&self) -> i64 {
        let settled = self.finished + self.failed + self.aborted;
        let in_flight = self.seen as i64 - settled as i64;
        debug_assert!(in_flight >= 0, "in-flight request count went negative: {in_flight}");
        if in_flight < 0 {
            tracing::error!(
                seen = self.seen,
                finished = self.finished,
                failed = self.failed,
                aborted = self.aborted,
                "In-flight request count went negative"
            );
        }
        in_flight
    }

    pub fn last_activity_at(&self) -> Instant {
        self.last_activity_at
    }

    /// Reset the quiet-period clock, e.g. right before navigating.
    pub fn touch(&mut self) {
        self.last_activity_at = Instant::now();
    }

    /// No request in flight and nothing settled for longer than `quiet`.
    pub fn is_idle(&self, now: Instant, quiet: Duration) -> bool {
        self.in_flight() <= 0 && now.saturating_duration_since(self.last_activity_at) > quiet
    }

    pub fn primary_url(&self) -> Option<&str> {
        self.primary_url.as_deref()
    }

    pub fn primary_status(&self) -> Option<u16> {
        self.primary_status
    }

    pub fn primary_headers(&self) -> &[(String, String)] {
        &self.primary_headers
    }

    /// Network error of the primary document, if it failed outright.
    pub fn primary_error(&self) -> Option<&str> {
        self.primary_error.as_deref()
    }

    /// Redirect of the primary document when redirects are not followed.
    pub fn redirect(&self) -> Option<&RedirectResponse> {
        self.redirect.as_ref()
    }

    /// Requests tracked so far, including settled ones.
    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn pending_urls(&self) -> Vec<&str> {
        self.requests.values().map(|e| e.url.as_str()).collect()
    }
}
