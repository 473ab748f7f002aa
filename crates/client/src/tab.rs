//! A tab leased to one render.

use std::sync::Arc;

use rendr_core::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use crate::driver::{TabEvent, TabEvents, TabHandle};
use crate::ledger::{LedgerSignal, RequestLedger};
use crate::lifecycle::{InstanceId, TabLease};

/// A browser tab owned by exactly one render.
///
/// Hand it back with [`crate::BrowserLifecycleManager::release_tab`]. A tab
/// dropped without release (cancelled render) is closed in the background;
/// either way its lease is settled exactly once when it drops.
pub struct Tab {
    handle: Arc<dyn TabHandle>,
    events: TabEvents,
    pub ledger: RequestLedger,
    dom_content_loaded: bool,
    crashed: bool,
    lease: TabLease,
    released: bool,
}

impl Tab {
    pub(crate) fn new(
        handle: Arc<dyn TabHandle>, events: TabEvents, ledger: RequestLedger, mut lease: TabLease,
    ) -> Self {
        lease.mark_opened();
        Self { handle, events, ledger, dom_content_loaded: false, crashed: false, lease, released: false }
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    /// Browser instance this tab was opened on.
    pub fn instance_id(&self) -> InstanceId {
        self.lease.instance_id()
    }

    pub fn handle(&self) -> &dyn TabHandle {
        self.handle.as_ref()
    }

    pub(crate) fn shared_handle(&self) -> Arc<dyn TabHandle> {
        Arc::clone(&self.handle)
    }

    pub fn dom_content_loaded(&self) -> bool {
        self.dom_content_loaded
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed
    }

    /// Token cancelled when the owning instance crashes or is recycled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.lease.token()
    }

    /// Fail unless the owning instance is still the current, live one.
    pub fn ensure_current(&self) -> Result<(), Error> {
        self.lease.ensure_current()
    }

    /// Error describing why the owning instance went away.
    pub fn teardown_error(&self) -> Error {
        self.lease.teardown_error()
    }

    /// Drain pending events into the ledger.
    pub fn pump(&mut self) -> LedgerSignal {
        let mut signal = LedgerSignal::None;
        loop {
            match self.events.try_recv() {
                Ok(TabEvent::DomContentLoaded) => self.dom_content_loaded = true,
                Ok(TabEvent::Crashed) => {
                    tracing::warn!(tab_id = self.handle.id(), "Tab renderer crashed");
                    self.crashed = true;
                }
                Ok(event) => {
                    if self.ledger.apply(event) == LedgerSignal::PrimaryRedirected {
                        signal = LedgerSignal::PrimaryRedirected;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        signal
    }

    pub(crate) fn mark_released(&mut self) {
        self.released = true;
    }
}

impl Drop for Tab {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let handle = Arc::clone(&self.handle);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = handle.close().await {
                        tracing::debug!(tab_id = handle.id(), "Closing abandoned tab failed: {e}");
                    }
                });
            }
            Err(_) => tracing::warn!(tab_id = handle.id(), "Abandoned tab dropped outside a runtime"),
        }
    }
}

impl std::fmt::Debug for Tab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tab")
            .field("id", &self.handle.id())
            .field("instance_id", &self.lease.instance_id())
            .field("dom_content_loaded", &self.dom_content_loaded)
            .field("in_flight", &self.ledger.in_flight())
            .finish()
    }
}
