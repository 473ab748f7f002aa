//! Unified error types for rendr.
//!
//! Every per-render failure resolves to an HTTP-style status code and a
//! [`FailureTag`] recorded on the request. Nothing here is allowed to take the
//! process down.

use rmcp::model::{ErrorCode, ErrorData as McpError};
use tokio_rusqlite::rusqlite;

use crate::render::FailureTag;

/// Unified error types for the rendr engine and front ends.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input parameters.
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Invalid URL.
    #[error("INVALID_URL: {0}")]
    InvalidUrl(String),

    /// No cache entry found for the given hash.
    #[error("CACHE_MISS: {0}")]
    CacheMiss(String),

    /// Database operation failed.
    #[error("CACHE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("CACHE_ERROR: migration failed: {0}")]
    MigrationFailed(String),

    /// Invalid hash format.
    #[error("CACHE_ERROR: invalid hash format")]
    InvalidHash,

    /// The browser could not navigate to the page.
    #[error("NAVIGATION_FAILED: {0}")]
    NavigationFailed(String),

    /// The tab belongs to a browser instance that has since been recycled.
    #[error("STALE_BROWSER_GENERATION: tab bound to {expected}, current is {}", generation_label(.current))]
    StaleBrowserGeneration { expected: u64, current: Option<u64> },

    /// The browser connection dropped while the render was in progress.
    #[error("BROWSER_CONNECTION_CLOSED")]
    BrowserConnectionClosed,

    /// Script evaluation or document capture failed.
    #[error("EVALUATION_FAILED: {0}")]
    EvaluationFailed(String),

    /// The page stopped executing JavaScript (suspected infinite loop).
    #[error("HARD_TIMEOUT: {0}")]
    HardTimeout(String),

    /// No browser instance became ready within the acquisition budget.
    #[error("BROWSER_UNAVAILABLE: no ready browser after {attempts} attempts")]
    BrowserUnavailable { attempts: u32 },

    /// The render exceeded its overall deadline.
    #[error("DEADLINE_EXCEEDED: render took longer than {0}ms")]
    DeadlineExceeded(u64),

    /// An extension hook returned an error.
    #[error("HOOK_FAILED: {hook}: {message}")]
    HookFailed { hook: String, message: String },
}

fn generation_label(current: &Option<u64>) -> String {
    current.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
}

impl Error {
    /// Status code returned to the caller when a render fails with this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::InvalidInput(_) | Error::InvalidUrl(_) => 400,
            Error::CacheMiss(_) => 404,
            Error::NavigationFailed(_)
            | Error::EvaluationFailed(_)
            | Error::HardTimeout(_)
            | Error::DeadlineExceeded(_) => 504,
            Error::StaleBrowserGeneration { .. }
            | Error::BrowserConnectionClosed
            | Error::BrowserUnavailable { .. } => 503,
            Error::HookFailed { .. } | Error::Database(_) | Error::MigrationFailed(_) | Error::InvalidHash => 500,
        }
    }

    /// Tag appended to [`crate::RenderRequest::errors`] for this failure.
    pub fn failure_tag(&self) -> Option<FailureTag> {
        match self {
            Error::InvalidUrl(_) => Some(FailureTag::InvalidUrl),
            Error::NavigationFailed(_) => Some(FailureTag::NavigationFailed),
            Error::StaleBrowserGeneration { .. } => Some(FailureTag::StaleBrowserGeneration),
            Error::BrowserConnectionClosed => Some(FailureTag::BrowserConnectionClosed),
            Error::EvaluationFailed(_) => Some(FailureTag::EvaluationFailed),
            Error::HardTimeout(_) => Some(FailureTag::HardTimeout),
            Error::BrowserUnavailable { .. } => Some(FailureTag::BrowserUnavailable),
            Error::DeadlineExceeded(_) => Some(FailureTag::DeadlineExceeded),
            Error::HookFailed { .. } => Some(FailureTag::HookFailed),
            _ => None,
        }
    }

    /// Whether the failure is fatal to the browser instance, not just the render.
    pub fn is_fatal_to_instance(&self) -> bool {
        matches!(self, Error::HardTimeout(_))
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}

impl From<Error> for McpError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        let code = match &err {
            Error::InvalidInput(_) | Error::InvalidUrl(_) => -32602,
            Error::CacheMiss(_) => -32001,
            Error::Database(_) | Error::MigrationFailed(_) | Error::InvalidHash => -32002,
            Error::NavigationFailed(_) => -32020,
            Error::StaleBrowserGeneration { .. } => -32021,
            Error::BrowserConnectionClosed => -32022,
            Error::EvaluationFailed(_) => -32023,
            Error::HardTimeout(_) => -32024,
            Error::BrowserUnavailable { .. } => -32025,
            Error::DeadlineExceeded(_) => -32026,
            Error::HookFailed { .. } => -32027,
        };

        McpError { code: ErrorCode(code), message: message.into(), data: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::CacheMiss("abc123".to_string());
        assert!(err.to_string().contains("CACHE_MISS"));
        assert!(err.to_string().contains("abc123"));
    }

    #[test]
    fn test_stale_generation_display() {
        let err = Error::StaleBrowserGeneration { expected: 3, current: Some(4) };
        assert_eq!(err.to_string(), "STALE_BROWSER_GENERATION: tab bound to 3, current is 4");

        let err = Error::StaleBrowserGeneration { expected: 3, current: None };
        assert!(err.to_string().ends_with("current is none"));
    }

    #[test]
    fn test_user_visible_status_codes() {
        assert_eq!(Error::NavigationFailed("net::ERR_NAME_NOT_RESOLVED".into()).status_code(), 504);
        assert_eq!(Error::HardTimeout("no js".into()).status_code(), 504);
        assert_eq!(Error::BrowserUnavailable { attempts: 5 }.status_code(), 503);
        assert_eq!(Error::BrowserConnectionClosed.status_code(), 503);
        assert_eq!(Error::InvalidUrl("ftp://x".into()).status_code(), 400);
        assert_eq!(Error::HookFailed { hook: "cache".into(), message: "boom".into() }.status_code(), 500);
    }

    #[test]
    fn test_failure_tags() {
        assert_eq!(Error::HardTimeout(String::new()).failure_tag(), Some(FailureTag::HardTimeout));
        assert_eq!(
            Error::StaleBrowserGeneration { expected: 1, current: None }.failure_tag(),
            Some(FailureTag::StaleBrowserGeneration)
        );
        assert_eq!(Error::InvalidHash.failure_tag(), None);
    }

    #[test]
    fn test_only_hard_timeout_is_fatal_to_instance() {
        assert!(Error::HardTimeout(String::new()).is_fatal_to_instance());
        assert!(!Error::NavigationFailed(String::new()).is_fatal_to_instance());
        assert!(!Error::BrowserConnectionClosed.is_fatal_to_instance());
    }

    #[test]
    fn test_error_to_mcp_error() {
        let err = Error::CacheMiss("abc123".to_string());
        let mcp_err: McpError = err.into();
        assert_eq!(mcp_err.code.0, -32001);

        let mcp_err: McpError = Error::BrowserUnavailable { attempts: 5 }.into();
        assert_eq!(mcp_err.code.0, -32025);
    }
}
