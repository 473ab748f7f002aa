//! Render engine for rendr.
//!
//! This crate provides the browser driver interface and its Chromium
//! implementation, browser lifecycle management, completion detection, the
//! extension pipeline and the coordinator that ties them together for the
//! server and CLI.

pub mod coordinator;
pub mod detector;
pub mod driver;
pub mod ledger;
pub mod lifecycle;
pub mod pipeline;
pub mod plugins;
pub mod tab;
pub mod url;

pub use coordinator::RenderCoordinator;
pub use detector::{CompletionDetector, DetectorState, ReadyReason};
pub use driver::{BrowserDriver, BrowserHandle, DriverError, TabEvent, TabHandle, TabOptions};
pub use ledger::RequestLedger;
pub use lifecycle::{BrowserLifecycleManager, InstanceId, InstanceState, LifecyclePolicy, LifecycleStatus};
pub use pipeline::{ExtensionPipeline, ExtensionPoint, Flow, Hook};
pub use plugins::default_pipeline;
pub use tab::Tab;

#[cfg(feature = "render")]
pub use driver::ChromiumDriver;
