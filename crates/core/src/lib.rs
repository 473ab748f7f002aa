//! Core types and shared functionality for rendr.
//!
//! This crate provides:
//! - The render request model shared by the engine, hooks and front ends
//! - Unified error types
//! - Configuration structures
//! - Render cache implementation with SQLite backend

pub mod cache;
pub mod config;
pub mod error;
pub mod render;

pub use cache::{CacheDb, CachedRender};
pub use config::{AppConfig, ConfigError};
pub use error::Error;
pub use render::{FailureTag, RenderOptions, RenderRequest, RenderResponse, RenderSettings, RenderType, Stage};
