//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::AppConfig;
use crate::render::{MAX_TIMEOUT_MS, MAX_VIEWPORT};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: reason.into() }
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - a poll interval is 0
    /// - a timeout is below 1ms or exceeds 5 minutes
    /// - the viewport is outside 1..=10000 pixels
    /// - `max_iterations_per_instance` or `acquire_attempts` is 0
    /// - `ready_flag` or `user_agent` is empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("page_done_check_interval_ms", self.page_done_check_interval_ms),
            ("js_check_interval_ms", self.js_check_interval_ms),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(invalid(field, "must be greater than 0"));
            }
        }

        let timeouts = [
            ("resource_download_timeout_ms", self.resource_download_timeout_ms),
            ("wait_after_last_request_ms", self.wait_after_last_request_ms),
            ("js_timeout_ms", self.js_timeout_ms),
            ("no_js_execution_timeout_ms", self.no_js_execution_timeout_ms),
            ("ready_grace_delay_ms", self.ready_grace_delay_ms),
            ("render_deadline_margin_ms", self.render_deadline_margin_ms),
            ("acquire_backoff_ms", self.acquire_backoff_ms),
            ("launch_timeout_ms", self.launch_timeout_ms),
            ("close_timeout_ms", self.close_timeout_ms),
        ];
        for (field, value) in timeouts {
            if value < 1 {
                return Err(invalid(field, "must be at least 1ms"));
            }
            if value > MAX_TIMEOUT_MS {
                return Err(invalid(field, format!("must not exceed 5 minutes ({MAX_TIMEOUT_MS}ms)")));
            }
        }

        for (field, value) in [("width", self.width), ("height", self.height)] {
            if !(1..=MAX_VIEWPORT).contains(&value) {
                return Err(invalid(field, format!("must be between 1 and {MAX_VIEWPORT}")));
            }
        }

        if self.max_iterations_per_instance == 0 {
            return Err(invalid("max_iterations_per_instance", "must be greater than 0"));
        }
        if self.acquire_attempts == 0 {
            return Err(invalid("acquire_attempts", "must be greater than 0"));
        }

        if self.ready_flag.trim().is_empty() {
            return Err(invalid("ready_flag", "must not be empty"));
        }

        if let Some(ua) = &self.user_agent
            && ua.is_empty()
        {
            return Err(invalid("user_agent", "must not be empty when set"));
        }

        if !self.allowlist_domains.is_empty() && !self.denylist_domains.is_empty() {
            tracing::warn!(
                allowlist_count = self.allowlist_domains.len(),
                denylist_count = self.denylist_domains.len(),
                "Both allowlist_domains and denylist_domains are set; \
                 allowlist takes precedence"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_interval() {
        let config = AppConfig { page_done_check_interval_ms: 0, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "page_done_check_interval_ms"));
    }

    #[test]
    fn test_validate_timeout_too_small() {
        let config = AppConfig { no_js_execution_timeout_ms: 0, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "no_js_execution_timeout_ms"));
    }

    #[test]
    fn test_validate_timeout_exceeds_limit() {
        let config = AppConfig { js_timeout_ms: 301_000, ..Default::default() }; // 5min 1sec
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "js_timeout_ms"));
    }

    #[test]
    fn test_validate_viewport_bounds() {
        let config = AppConfig { width: 0, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field, .. }) if field == "width"));

        let config = AppConfig { height: 10_001, ..Default::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field, .. }) if field == "height"));
    }

    #[test]
    fn test_validate_zero_iterations() {
        let config = AppConfig { max_iterations_per_instance: 0, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "max_iterations_per_instance"));
    }

    #[test]
    fn test_validate_empty_ready_flag() {
        let config = AppConfig { ready_flag: "  ".into(), ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "ready_flag"));
    }

    #[test]
    fn test_validate_edge_case_values() {
        let config = AppConfig {
            page_done_check_interval_ms: 1,
            js_timeout_ms: 1,
            close_timeout_ms: 300_000,
            width: 1,
            height: 10_000,
            max_iterations_per_instance: 1,
            acquire_attempts: 1,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }
}
