//! Ordered hook chain run at the render's extension points.
//!
//! Each hook method returns a [`Flow`]: `Continue` hands the request to the
//! next hook, `Halt` skips the remaining hooks for that point. A hook that
//! halts at `before_request` usually answered through
//! [`RenderRequest::respond`] already.

use std::sync::Arc;

use async_trait::async_trait;
use rendr_core::{Error, RenderRequest};

use crate::driver::TabHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Halt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionPoint {
    BeforeRequest,
    OnTabCreated,
    AfterRender,
    BeforeSend,
}

impl ExtensionPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtensionPoint::BeforeRequest => "beforeRequest",
            ExtensionPoint::OnTabCreated => "onTabCreated",
            ExtensionPoint::AfterRender => "afterRender",
            ExtensionPoint::BeforeSend => "beforeSend",
        }
    }
}

impl std::fmt::Display for ExtensionPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A render extension. Every method defaults to `Flow::Continue`.
#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    async fn before_request(&self, _req: &mut RenderRequest) -> Result<Flow, Error> {
        Ok(Flow::Continue)
    }

    async fn on_tab_created(&self, _req: &mut RenderRequest, _tab: &dyn TabHandle) -> Result<Flow, Error> {
        Ok(Flow::Continue)
    }

    async fn after_render(&self, _req: &mut RenderRequest) -> Result<Flow, Error> {
        Ok(Flow::Continue)
    }

    async fn before_send(&self, _req: &mut RenderRequest) -> Result<Flow, Error> {
        Ok(Flow::Continue)
    }
}

#[derive(Clone, Default)]
pub struct ExtensionPipeline {
    hooks: Vec<Arc<dyn Hook>>,
}

impl ExtensionPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a hook. Hooks run in registration order.
    pub fn register(&mut self, hook: Arc<dyn Hook>) -> &mut Self {
        tracing::debug!(hook = hook.name(), "Hook registered");
        self.hooks.push(hook);
        self
    }

    pub fn with(mut self, hook: Arc<dyn Hook>) -> Self {
        self.register(hook);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn hook_names(&self) -> Vec<&str> {
        self.hooks.iter().map(|h| h.name()).collect()
    }

    /// Run every hook registered for `point`, strictly in order.
    ///
    /// # Errors
    ///
    /// The first hook error stops the point and is returned as
    /// `Error::HookFailed`. `OnTabCreated` without a tab is
    /// `Error::InvalidInput`.
    pub async fn run(
        &self, point: ExtensionPoint, req: &mut RenderRequest, tab: Option<&dyn TabHandle>,
    ) -> Result<Flow, Error> {
        if point == ExtensionPoint::OnTabCreated && tab.is_none() {
            return Err(Error::InvalidInput(format!("{point} hooks need a tab")));
        }
        for hook in &self.hooks {
            let result = match (point, tab) {
                (ExtensionPoint::BeforeRequest, _) => hook.before_request(req).await,
                (ExtensionPoint::OnTabCreated, Some(tab)) => hook.on_tab_created(req, tab).await,
                (ExtensionPoint::OnTabCreated, None) => continue,
                (ExtensionPoint::AfterRender, _) => hook.after_render(req).await,
                (ExtensionPoint::BeforeSend, _) => hook.before_send(req).await,
            };

            match result {
                Ok(Flow::Continue) => {}
                Ok(Flow::Halt) => {
                    tracing::debug!(hook = hook.name(), %point, "Hook halted the chain");
                    return Ok(Flow::Halt);
                }
                Err(err @ Error::HookFailed { .. }) => return Err(err),
                Err(err) => {
                    tracing::warn!(hook = hook.name(), %point, "Hook failed: {err}");
                    return Err(Error::HookFailed { hook: hook.name().to_string(), message: err.to_string() });
                }
            }
        }
        Ok(Flow::Continue)
    }

    pub async fn before_request(&self, req: &mut RenderRequest) -> Result<Flow, Error> {
        self.run(ExtensionPoint::BeforeRequest, req, None).await
    }

    pub async fn on_tab_created(&self, req: &mut RenderRequest, tab: &dyn TabHandle) -> Result<Flow, Error> {
        self.run(ExtensionPoint::OnTabCreated, req, Some(tab)).await
    }

    pub async fn after_render(&self, req: &mut RenderRequest) -> Result<Flow, Error> {
        self.run(ExtensionPoint::AfterRender, req, None).await
    }

    pub async fn before_send(&self, req: &mut RenderRequest) -> Result<Flow, Error> {
        self.run(ExtensionPoint::BeforeSend, req, None).await
    }
}

impl std::fmt::Debug for ExtensionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionPipeline").field("hooks", &self.hook_names()).finish()
    }
}
