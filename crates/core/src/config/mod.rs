//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (RENDR_*)
//! 2. TOML config file (if RENDR_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (RENDR_*)
/// 2. TOML config file (if RENDR_CONFIG_FILE set)
/// 3. Built-in defaults
///
/// List values taken from the environment use figment's array syntax,
/// e.g. `RENDR_DENYLIST_DOMAINS='["ads.example.com"]'`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to SQLite render cache database.
    ///
    /// Set via RENDR_DB_PATH environment variable.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Whether successful renders are cached.
    ///
    /// Set via RENDR_CACHE_ENABLED environment variable.
    #[serde(default)]
    pub cache_enabled: bool,

    /// Lifetime of a cached render in seconds.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Chrome/Chromium executable. Auto-detected when unset.
    ///
    /// Set via RENDR_CHROME_PATH environment variable.
    #[serde(default)]
    pub chrome_path: Option<PathBuf>,

    /// DevTools websocket of an already running browser. When set the
    /// driver connects instead of spawning.
    ///
    /// Set via RENDR_BROWSER_WS_URL environment variable.
    #[serde(default)]
    pub browser_ws_url: Option<String>,

    /// Extra command line flags passed to a spawned browser.
    #[serde(default = "default_chrome_flags")]
    pub chrome_flags: Vec<String>,

    /// Run a spawned browser headless.
    #[serde(default = "default_true")]
    pub headless: bool,

    /// User-Agent override applied to every tab.
    ///
    /// Set via RENDR_USER_AGENT environment variable.
    #[serde(default)]
    pub user_agent: Option<String>,

    /// Default viewport width in pixels.
    #[serde(default = "default_width")]
    pub width: u32,

    /// Default viewport height in pixels.
    #[serde(default = "default_height")]
    pub height: u32,

    /// Follow redirects of the primary document instead of returning them.
    #[serde(default)]
    pub follow_redirects: bool,

    /// Completion detector poll interval in milliseconds.
    #[serde(default = "default_page_done_check_interval_ms")]
    pub page_done_check_interval_ms: u64,

    /// Longest wait for the network to settle in milliseconds.
    #[serde(default = "default_resource_download_timeout_ms")]
    pub resource_download_timeout_ms: u64,

    /// Quiet period after the last request before the network counts as idle.
    #[serde(default = "default_wait_after_last_request_ms")]
    pub wait_after_last_request_ms: u64,

    /// Interval between readiness evaluations in milliseconds.
    #[serde(default = "default_js_check_interval_ms")]
    pub js_check_interval_ms: u64,

    /// Budget for the page to signal readiness in milliseconds.
    #[serde(default = "default_js_timeout_ms")]
    pub js_timeout_ms: u64,

    /// Longest gap between successful evaluations before the page is
    /// considered hung and the browser instance is recycled.
    #[serde(default = "default_no_js_execution_timeout_ms")]
    pub no_js_execution_timeout_ms: u64,

    /// Grace period after the readiness flag turns true while requests are
    /// still in flight.
    #[serde(default = "default_ready_grace_delay_ms")]
    pub ready_grace_delay_ms: u64,

    /// Added to the download and JavaScript budgets to form the render deadline.
    #[serde(default = "default_render_deadline_margin_ms")]
    pub render_deadline_margin_ms: u64,

    /// Expression probed for the page readiness flag.
    #[serde(default = "default_ready_flag")]
    pub ready_flag: String,

    /// Renders served by one browser instance before it is restarted.
    #[serde(default = "default_max_iterations_per_instance")]
    pub max_iterations_per_instance: u32,

    /// Wall-clock age after which an instance is restarted. `0` disables.
    #[serde(default = "default_force_restart_period_secs")]
    pub force_restart_period_secs: u64,

    /// Tab acquisition attempts before giving up.
    #[serde(default = "default_acquire_attempts")]
    pub acquire_attempts: u32,

    /// Pause between tab acquisition attempts in milliseconds.
    #[serde(default = "default_acquire_backoff_ms")]
    pub acquire_backoff_ms: u64,

    /// Budget for launching or connecting to a browser in milliseconds.
    #[serde(default = "default_launch_timeout_ms")]
    pub launch_timeout_ms: u64,

    /// Budget for closing a tab or browser in milliseconds.
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,

    /// Log every tracked network request at info level.
    #[serde(default)]
    pub log_requests: bool,

    /// Strip script elements from rendered HTML.
    #[serde(default = "default_true")]
    pub remove_script_tags: bool,

    /// Honour prerender status code and header meta tags.
    #[serde(default = "default_true")]
    pub http_headers: bool,

    /// Domain allowlist for renders.
    ///
    /// Set via RENDR_ALLOWLIST_DOMAINS environment variable.
    #[serde(default)]
    pub allowlist_domains: Vec<String>,

    /// Domain denylist for renders.
    ///
    /// Set via RENDR_DENYLIST_DOMAINS environment variable.
    #[serde(default)]
    pub denylist_domains: Vec<String>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./rendr-cache.sqlite")
}

fn default_cache_ttl_secs() -> u64 {
    86_400
}

fn default_chrome_flags() -> Vec<String> {
    ["--no-sandbox", "--disable-gpu", "--disable-dev-shm-usage", "--hide-scrollbars"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_width() -> u32 {
    1440
}

fn default_height() -> u32 {
    718
}

fn default_page_done_check_interval_ms() -> u64 {
    100
}

fn default_resource_download_timeout_ms() -> u64 {
    20_000
}

fn default_wait_after_last_request_ms() -> u64 {
    500
}

fn default_js_check_interval_ms() -> u64 {
    300
}

fn default_js_timeout_ms() -> u64 {
    10_000
}

fn default_no_js_execution_timeout_ms() -> u64 {
    3_000
}

fn default_ready_grace_delay_ms() -> u64 {
    1_000
}

fn default_render_deadline_margin_ms() -> u64 {
    5_000
}

fn default_ready_flag() -> String {
    "window.prerenderReady".into()
}

fn default_max_iterations_per_instance() -> u32 {
    40
}

fn default_force_restart_period_secs() -> u64 {
    3_600
}

fn default_acquire_attempts() -> u32 {
    5
}

fn default_acquire_backoff_ms() -> u64 {
    500
}

fn default_launch_timeout_ms() -> u64 {
    30_000
}

fn default_close_timeout_ms() -> u64 {
    5_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            cache_enabled: false,
            cache_ttl_secs: default_cache_ttl_secs(),
            chrome_path: None,
            browser_ws_url: None,
            chrome_flags: default_chrome_flags(),
            headless: true,
            user_agent: None,
            width: default_width(),
            height: default_height(),
            follow_redirects: false,
            page_done_check_interval_ms: default_page_done_check_interval_ms(),
            resource_download_timeout_ms: default_resource_download_timeout_ms(),
            wait_after_last_request_ms: default_wait_after_last_request_ms(),
            js_check_interval_ms: default_js_check_interval_ms(),
            js_timeout_ms: default_js_timeout_ms(),
            no_js_execution_timeout_ms: default_no_js_execution_timeout_ms(),
            ready_grace_delay_ms: default_ready_grace_delay_ms(),
            render_deadline_margin_ms: default_render_deadline_margin_ms(),
            ready_flag: default_ready_flag(),
            max_iterations_per_instance: default_max_iterations_per_instance(),
            force_restart_period_secs: default_force_restart_period_secs(),
            acquire_attempts: default_acquire_attempts(),
            acquire_backoff_ms: default_acquire_backoff_ms(),
            launch_timeout_ms: default_launch_timeout_ms(),
            close_timeout_ms: default_close_timeout_ms(),
            log_requests: false,
            remove_script_tags: true,
            http_headers: true,
            allowlist_domains: Vec::new(),
            denylist_domains: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Cache entry lifetime as Duration.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Forced restart period, `None` when disabled.
    pub fn force_restart_period(&self) -> Option<Duration> {
        (self.force_restart_period_secs > 0).then(|| Duration::from_secs(self.force_restart_period_secs))
    }

    pub fn acquire_backoff(&self) -> Duration {
        Duration::from_millis(self.acquire_backoff_ms)
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `RENDR_`
    /// 2. TOML file from `RENDR_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("RENDR_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("RENDR_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load() -> figment::Result<AppConfig> {
        AppConfig::load().map_err(|e| figment::Error::from(e.to_string()))
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.db_path, PathBuf::from("./rendr-cache.sqlite"));
        assert!(!config.cache_enabled);
        assert!(config.chrome_path.is_none());
        assert!(config.browser_ws_url.is_none());
        assert!(config.headless);
        assert_eq!(config.chrome_flags.len(), 4);
        assert_eq!((config.width, config.height), (1440, 718));
        assert_eq!(config.page_done_check_interval_ms, 100);
        assert_eq!(config.js_timeout_ms, 10_000);
        assert_eq!(config.max_iterations_per_instance, 40);
        assert!(config.remove_script_tags);
        assert!(config.allowlist_domains.is_empty());
    }

    #[test]
    fn test_durations() {
        let config = AppConfig::default();
        assert_eq!(config.cache_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.acquire_backoff(), Duration::from_millis(500));
        assert_eq!(config.force_restart_period(), Some(Duration::from_secs(3_600)));

        let config = AppConfig { force_restart_period_secs: 0, ..Default::default() };
        assert!(config.force_restart_period().is_none());
    }

    #[test]
    fn test_load_env_overrides() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("RENDR_JS_TIMEOUT_MS", "2500");
            jail.set_env("RENDR_FOLLOW_REDIRECTS", "true");
            jail.set_env("RENDR_BROWSER_WS_URL", "ws://127.0.0.1:9222/devtools/browser/abc");

            let config = load()?;
            assert_eq!(config.js_timeout_ms, 2_500);
            assert!(config.follow_redirects);
            assert_eq!(config.browser_ws_url.as_deref(), Some("ws://127.0.0.1:9222/devtools/browser/abc"));
            Ok(())
        });
    }

    #[test]
    fn test_load_toml_file_then_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("rendr.toml", "max_iterations_per_instance = 7\nwidth = 800\n")?;
            jail.set_env("RENDR_CONFIG_FILE", "rendr.toml");
            jail.set_env("RENDR_WIDTH", "1024");

            let config = load()?;
            assert_eq!(config.max_iterations_per_instance, 7);
            assert_eq!(config.width, 1024);
            Ok(())
        });
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("RENDR_ACQUIRE_ATTEMPTS", "0");
            assert!(matches!(
                AppConfig::load(),
                Err(ConfigError::Invalid { field, .. }) if field == "acquire_attempts"
            ));
            Ok(())
        });
    }
}
