//! URL canonicalization at render ingress.
//!
//! Every render URL is normalized exactly once, before any hook sees it, so
//! cache keys and allow/deny decisions agree on the same string.

use rendr_core::Error;

const ESCAPED_FRAGMENT: &str = "_escaped_fragment_";

/// Error type for URL canonicalization failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UrlError {
    #[error("empty URL")]
    Empty,

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<UrlError> for Error {
    fn from(err: UrlError) -> Self {
        Error::InvalidUrl(err.to_string())
    }
}

/// Canonicalize a URL string for rendering.
///
/// Normalization steps:
/// 1. Trim leading/trailing whitespace
/// 2. Default scheme to https:// if missing
/// 3. Lowercase the host
/// 4. Drop any fragment
/// 5. Turn an `_escaped_fragment_=<v>` query parameter into a `#!<v>` hashbang
///    (dropped entirely when `<v>` is empty)
/// 6. Keep the remaining query string intact (do not reorder)
pub fn canonicalize(input: &str) -> Result<url::Url, UrlError> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(UrlError::Empty);
    }

    let url_str = if trimmed.contains("://") { trimmed.to_string() } else { format!("https://{trimmed}") };

    let mut parsed = url::Url::parse(&url_str).map_err(|e| UrlError::InvalidUrl(e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlError::UnsupportedScheme(scheme.to_string())),
    }

    if let Some(host) = parsed.host_str() {
        let host = host.to_lowercase();
        parsed.set_host(Some(&host)).map_err(|e| UrlError::InvalidUrl(e.to_string()))?;
    }

    parsed.set_fragment(None);
    apply_escaped_fragment(&mut parsed);

    Ok(parsed)
}

fn apply_escaped_fragment(url: &mut url::Url) {
    let mut hashbang = None;
    let mut rest = Vec::new();
    for (key, value) in url.query_pairs() {
        if key == ESCAPED_FRAGMENT {
            hashbang = Some(value.into_owned());
        } else {
            rest.push((key.into_owned(), value.into_owned()));
        }
    }

    let Some(hashbang) = hashbang else {
        return;
    };

    if rest.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(rest);
    }

    if !hashbang.is_empty() {
        url.set_fragment(Some(&format!("!{hashbang}")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_basic() {
        let url = canonicalize("https://example.com").unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.host_str(), Some("example.com"));
    }

    #[test]
    fn test_canonicalize_default_scheme() {
        let url = canonicalize("example.com").unwrap();
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.host_str(), Some("example.com"));
    }

    #[test]
    fn test_canonicalize_lowercase_host() {
        let url = canonicalize("https://EXAMPLE.COM").unwrap();
        assert_eq!(url.host_str(), Some("example.com"));
    }

    #[test]
    fn test_canonicalize_remove_fragment() {
        let url = canonicalize("https://example.com/path/to/resource?query=value#fragment").unwrap();
        assert_eq!(url.path(), "/path/to/resource");
        assert_eq!(url.query(), Some("query=value"));
        assert_eq!(url.fragment(), None);
    }

    #[test]
    fn test_canonicalize_trim_whitespace() {
        let url = canonicalize("  https://example.com  ").unwrap();
        assert_eq!(url.as_str(), "https://example.com/");
    }

    #[test]
    fn test_canonicalize_unsupported_scheme() {
        let result = canonicalize("file:///etc/passwd");
        assert!(matches!(result, Err(UrlError::UnsupportedScheme(_))));
    }

    #[test]
    fn test_canonicalize_empty() {
        assert!(matches!(canonicalize(""), Err(UrlError::Empty)));
        assert!(matches!(canonicalize("   "), Err(UrlError::Empty)));
    }

    #[test]
    fn test_escaped_fragment_becomes_hashbang() {
        let url = canonicalize("https://example.com/app?_escaped_fragment_=/profile/42").unwrap();
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), Some("!/profile/42"));
    }

    #[test]
    fn test_escaped_fragment_keeps_other_params() {
        let url = canonicalize("https://example.com/app?lang=en&_escaped_fragment_=home").unwrap();
        assert_eq!(url.query(), Some("lang=en"));
        assert_eq!(url.fragment(), Some("!home"));
    }

    #[test]
    fn test_empty_escaped_fragment_is_dropped() {
        let url = canonicalize("https://example.com/?_escaped_fragment_=").unwrap();
        assert_eq!(url.as_str(), "https://example.com/");
    }

    #[test]
    fn test_url_error_maps_to_invalid_url() {
        let err: Error = UrlError::UnsupportedScheme("ftp".into()).into();
        assert_eq!(err.status_code(), 400);
    }
}
