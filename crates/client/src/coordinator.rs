//! Per-request glue: URL in, `{status, headers, body}` out.

use std::sync::Arc;

use rendr_core::{
    AppConfig, Error, FailureTag, RenderOptions, RenderRequest, RenderResponse, RenderSettings, RenderType, Stage,
};
use tracing::Instrument;

use crate::detector::{CompletionDetector, ReadyReason};
use crate::driver::{ScreenshotOptions, TabOptions};
use crate::lifecycle::BrowserLifecycleManager;
use crate::pipeline::{ExtensionPipeline, Flow};
use crate::tab::Tab;
use crate::url::canonicalize;

const JPEG_QUALITY: u8 = 90;

/// Runs renders against a shared browser. Cheap to clone.
#[derive(Clone)]
pub struct RenderCoordinator {
    config: Arc<AppConfig>,
    lifecycle: BrowserLifecycleManager,
    pipeline: Arc<ExtensionPipeline>,
}

impl RenderCoordinator {
    pub fn new(config: Arc<AppConfig>, lifecycle: BrowserLifecycleManager, pipeline: ExtensionPipeline) -> Self {
        Self { config, lifecycle, pipeline: Arc::new(pipeline) }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &BrowserLifecycleManager {
        &self.lifecycle
    }

    pub fn pipeline(&self) -> &ExtensionPipeline {
        &self.pipeline
    }

    /// Render `url`. Never fails: errors come back as a status code plus
    /// failure tags on the response.
    pub async fn render(&self, url: &str, options: RenderOptions) -> RenderResponse {
        let span = tracing::info_span!("render", url = %url.trim(), render_type = %options.render_type);
        async move {
            let response = self.run(url, options).await;
            tracing::info!(
                status = response.status_code,
                render_ms = response.render_ms,
                errors = ?response.errors,
                "Render finished"
            );
            response
        }
        .instrument(span)
        .await
    }

    async fn run(&self, url: &str, options: RenderOptions) -> RenderResponse {
        let url = match canonicalize(url) {
            Ok(url) => url.to_string(),
            Err(e) => {
                let mut req = RenderRequest::new(url.trim(), options);
                req.fail(&Error::from(e));
                return req.into_response();
            }
        };
        let mut req = RenderRequest::new(url, options);
        if let Err(e) = req.options.validate() {
            req.fail(&e);
            return req.into_response();
        }

        match self.pipeline.before_request(&mut req).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Halt) => {
                req.finish();
                return req.into_response();
            }
            Err(e) => {
                req.fail(&e);
                return req.into_response();
            }
        }

        let settings = RenderSettings::resolve(&self.config, &req.options);
        let mut tab = match self.lifecycle.acquire_tab(&TabOptions::from_settings(&settings)).await {
            Ok(tab) => tab,
            Err(e) => {
                tracing::warn!("Tab acquisition failed: {e}");
                req.fail(&e);
                return req.into_response();
            }
        };

        let token = tab.cancel_token();
        let outcome = tokio::time::timeout(settings.render_deadline, async {
            tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = self.drive(&mut req, &mut tab, &settings) => Some(result),
            }
        })
        .await;

        match outcome {
            Ok(Some(Ok(()))) => {}
            Ok(None) => {
                let e = tab.teardown_error();
                tracing::warn!(tab_id = tab.id(), "Render interrupted by browser teardown: {e}");
                req.fail(&e);
            }
            Ok(Some(Err(e))) => {
                let e = match e {
                    Error::BrowserConnectionClosed if token.is_cancelled() => tab.teardown_error(),
                    e => e,
                };
                if e.is_fatal_to_instance() {
                    self.lifecycle.recycle(tab.instance_id());
                }
                tracing::warn!(tab_id = tab.id(), "Render failed: {e}");
                req.fail(&e);
            }
            Err(_) => {
                let deadline_ms = u64::try_from(settings.render_deadline.as_millis()).unwrap_or(u64::MAX);
                let e = Error::DeadlineExceeded(deadline_ms);
                tracing::warn!(tab_id = tab.id(), "{e}");
                req.fail(&e);
            }
        }

        if let Err(e) = self.pipeline.before_send(&mut req).await {
            req.fail(&e);
        }
        self.lifecycle.release_tab(tab).await;
        req.into_response()
    }

    async fn drive(&self, req: &mut RenderRequest, tab: &mut Tab, settings: &RenderSettings) -> Result<(), Error> {
        if self.pipeline.on_tab_created(req, tab.handle()).await? == Flow::Halt {
            req.finish();
            return Ok(());
        }

        let mut detector = CompletionDetector::new(settings);
        tab.ledger.touch();
        let nav = tab.handle().navigate(&req.url, settings.resource_download_timeout).await?;
        tracing::debug!(tab_id = tab.id(), load_time_ms = nav.load_time_ms, "Navigation committed");

        if detector.wait_for_page(tab).await? == ReadyReason::DownloadTimeout {
            tracing::info!(pending = ?tab.ledger.pending_urls(), "Resource download timeout, continuing");
            req.record_error(FailureTag::DownloadTimeout);
        }

        if let Some(redirect) = tab.ledger.redirect() {
            req.status_code = Some(redirect.status);
            if let Some(location) = redirect.location.clone() {
                req.redirect_url =
                    url::Url::parse(&req.url).and_then(|base| base.join(&location)).ok().map(String::from);
                req.set_header("Location", location);
            }
            req.finish();
            return Ok(());
        }

        req.status_code = Some(tab.ledger.primary_status().unwrap_or(200));
        req.advance(Stage::EvaluatingJs);

        let capture = detector.capture(tab).await?;
        if capture.soft_timeout {
            req.record_error(FailureTag::SoftTimeout);
        }

        match req.render_type() {
            RenderType::Html => req.set_html(capture.html),
            RenderType::Png => req.content = Some(tab.handle().screenshot(&ScreenshotOptions::png()).await?),
            RenderType::Jpeg => {
                req.content = Some(tab.handle().screenshot(&ScreenshotOptions::jpeg(JPEG_QUALITY)).await?)
            }
            RenderType::Pdf => req.content = Some(tab.handle().print_pdf().await?),
        }

        self.pipeline.after_render(req).await?;
        req.finish();
        Ok(())
    }
}

impl std::fmt::Debug for RenderCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderCoordinator").field("pipeline", &self.pipeline).finish_non_exhaustive()
    }
}
