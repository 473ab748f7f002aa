//! SQLite-backed cache for rendered pages.
//!
//! This module provides a persistent, content-addressed render cache using
//! SQLite with async access via tokio-rusqlite. It supports:
//!
//! - Keys derived from URL, render type and viewport via SHA-256
//! - Automatic schema migrations
//! - WAL mode for concurrent access
//! - Multiple purge strategies (expiry, domain, LRU)

pub mod connection;
pub mod hash;
pub mod migrations;
pub mod renders;

pub use crate::Error;

pub use connection::CacheDb;
pub use hash::compute_cache_key;
pub use renders::CachedRender;
