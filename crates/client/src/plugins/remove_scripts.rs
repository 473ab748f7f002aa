//! Strip scripts from rendered HTML.
//!
//! JSON-LD blocks are kept. HTML imports are removed along with the scripts.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::{Captures, Regex};
use rendr_core::{Error, RenderRequest, RenderType};

use crate::pipeline::{Flow, Hook};

static SCRIPT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("invalid regex"));
static JSON_LD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)type\s*=\s*["']?application/ld\+json"#).expect("invalid regex"));
static HTML_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)<link\b[^>]*\brel\s*=\s*["']?import["']?[^>]*>"#).expect("invalid regex"));

pub fn remove_script_tags(html: &str) -> String {
    let without_scripts = SCRIPT_TAG.replace_all(html, |caps: &Captures<'_>| {
        let tag = &caps[0];
        let open = &tag[..tag.find('>').unwrap_or(tag.len())];
        if JSON_LD.is_match(open) { tag.to_string() } else { String::new() }
    });
    HTML_IMPORT.replace_all(&without_scripts, "").into_owned()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveScriptTags;

#[async_trait]
impl Hook for RemoveScriptTags {
    fn name(&self) -> &str {
        "remove_script_tags"
    }

    async fn after_render(&self, req: &mut RenderRequest) -> Result<Flow, Error> {
        if req.render_type() != RenderType::Html {
            return Ok(Flow::Continue);
        }
        if let Some(html) = req.html() {
            let stripped = remove_script_tags(html);
            req.set_html(stripped);
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_scripts_keeps_json_ld() {
        let html = r#"<html><head>
            <script src="/app.js"></script>
            <SCRIPT type="text/javascript">var a = "</div>";</SCRIPT>
            <script type="application/ld+json">{"@type":"Organization"}</script>
            <link rel="import" href="/component.html">
            <link rel="stylesheet" href="/site.css">
        </head><body><div>kept</div></body></html>"#;

        let out = remove_script_tags(html);
        assert!(!out.contains("app.js"));
        assert!(!out.contains("var a"));
        assert!(out.contains(r#"{"@type":"Organization"}"#));
        assert!(!out.contains("component.html"));
        assert!(out.contains("site.css"));
        assert!(out.contains("<div>kept</div>"));
    }

    #[test]
    fn test_multiline_script() {
        let html = "<p>a</p><script>\nline1\nline2\n</script><p>b</p>";
        assert_eq!(remove_script_tags(html), "<p>a</p><p>b</p>");
    }
}
