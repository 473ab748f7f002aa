//! Content-addressed cache key generation.

use sha2::{Digest, Sha256};

/// Compute the cache key of a render.
///
/// `vary` carries everything besides URL and type that changes the output,
/// e.g. viewport and user agent.
pub fn compute_cache_key(url: &str, render_type: &str, vary: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(b"\n");
    hasher.update(render_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(vary.as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether `hash` looks like a key produced by [`compute_cache_key`].
pub fn is_valid_key(hash: &str) -> bool {
    hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_stability() {
        let hash1 = compute_cache_key("https://example.com/", "html", "1440x718");
        let hash2 = compute_cache_key("https://example.com/", "html", "1440x718");
        assert_eq!(hash1, hash2);
    }

    #[test]
    fn test_hash_different_render_type() {
        let html = compute_cache_key("https://example.com/", "html", "");
        let png = compute_cache_key("https://example.com/", "png", "");
        assert_ne!(html, png);
    }

    #[test]
    fn test_hash_different_vary() {
        let desktop = compute_cache_key("https://example.com/", "html", "1440x718");
        let mobile = compute_cache_key("https://example.com/", "html", "375x812");
        assert_ne!(desktop, mobile);
    }

    #[test]
    fn test_hash_format() {
        let hash = compute_cache_key("https://example.com/", "html", "");
        assert!(is_valid_key(&hash));
        assert!(!is_valid_key("not-a-hash"));
    }
}
