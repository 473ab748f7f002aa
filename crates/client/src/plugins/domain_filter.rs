//! Host based allow/deny filtering.

use async_trait::async_trait;
use rendr_core::{AppConfig, Error, RenderRequest};

use crate::pipeline::{Flow, Hook};

/// Rejects renders of hosts outside the allowlist or inside the denylist with
/// a 403. A non-empty allowlist takes precedence over the denylist.
#[derive(Debug, Clone, Default)]
pub struct DomainFilter {
    allowlist: Vec<String>,
    denylist: Vec<String>,
}

impl DomainFilter {
    pub fn new(allowlist: Vec<String>, denylist: Vec<String>) -> Self {
        let normalize = |domains: Vec<String>| -> Vec<String> {
            domains
                .into_iter()
                .map(|d| d.trim().trim_start_matches("*.").trim_end_matches('.').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect()
        };
        Self { allowlist: normalize(allowlist), denylist: normalize(denylist) }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.allowlist_domains.clone(), config.denylist_domains.clone())
    }

    pub fn is_active(&self) -> bool {
        !self.allowlist.is_empty() || !self.denylist.is_empty()
    }

    /// Whether `host` may be rendered.
    pub fn allows(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        if !self.allowlist.is_empty() {
            return self.allowlist.iter().any(|d| matches_domain(&host, d));
        }
        !self.denylist.iter().any(|d| matches_domain(&host, d))
    }
}

fn matches_domain(host: &str, domain: &str) -> bool {
    host == domain || host.strip_suffix(domain).is_some_and(|prefix| prefix.ends_with('.'))
}

#[async_trait]
impl Hook for DomainFilter {
    fn name(&self) -> &str {
        "domain_filter"
    }

    async fn before_request(&self, req: &mut RenderRequest) -> Result<Flow, Error> {
        let host = url::Url::parse(&req.url).ok().and_then(|u| u.host_str().map(str::to_string)).unwrap_or_default();
        if self.allows(&host) {
            return Ok(Flow::Continue);
        }
        tracing::info!(host = %host, "Render blocked by domain filter");
        req.respond(403, Vec::new());
        Ok(Flow::Halt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rendr_core::RenderOptions;

    fn domains(list: &[&str]) -> Vec<String> {
        list.iter().map(|d| d.to_string()).collect()
    }

    #[test]
    fn test_allowlist_matches_subdomains() {
        let filter = DomainFilter::new(domains(&["example.com"]), Vec::new());
        assert!(filter.allows("example.com"));
        assert!(filter.allows("www.Example.com"));
        assert!(!filter.allows("notexample.com"));
        assert!(!filter.allows("other.org"));
    }

    #[test]
    fn test_allowlist_takes_precedence() {
        let filter = DomainFilter::new(domains(&["example.com"]), domains(&["example.com"]));
        assert!(filter.allows("example.com"));
    }

    #[test]
    fn test_denylist() {
        let filter = DomainFilter::new(Vec::new(), domains(&["*.ads.example"]));
        assert!(!filter.allows("ads.example"));
        assert!(!filter.allows("cdn.ads.example"));
        assert!(filter.allows("example.com"));
    }

    #[tokio::test]
    async fn test_blocked_request_halts_with_forbidden() {
        let filter = DomainFilter::new(Vec::new(), domains(&["blocked.example"]));
        let mut req = RenderRequest::new("https://blocked.example/page", RenderOptions::default());

        assert_eq!(filter.before_request(&mut req).await.unwrap(), Flow::Halt);
        assert_eq!(req.status_code, Some(403));
        assert!(req.is_finished());

        let mut req = RenderRequest::new("https://fine.example/", RenderOptions::default());
        assert_eq!(filter.before_request(&mut req).await.unwrap(), Flow::Continue);
        assert!(!req.is_finished());
    }
}
