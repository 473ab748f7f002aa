//! Status code and response headers declared by the page itself.
//!
//! `<meta name="prerender-status-code" content="404">` overrides the status;
//! each `<meta name="prerender-header" content="Name: value">` sets a header.

use async_trait::async_trait;
use rendr_core::{Error, RenderRequest, RenderType};
use scraper::{Html, Selector};

use crate::pipeline::{Flow, Hook};

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpHeaders;

/// Status and headers found in `html`.
pub fn declared_status_and_headers(html: &str) -> (Option<u16>, Vec<(String, String)>) {
    let document = Html::parse_document(html);
    let status_selector = Selector::parse(r#"meta[name="prerender-status-code"]"#).expect("invalid selector");
    let header_selector = Selector::parse(r#"meta[name="prerender-header"]"#).expect("invalid selector");

    let status = document
        .select(&status_selector)
        .filter_map(|el| el.value().attr("content"))
        .filter_map(|content| content.trim().parse::<u16>().ok())
        .find(|status| (100..=599).contains(status));

    let headers = document
        .select(&header_selector)
        .filter_map(|el| el.value().attr("content"))
        .filter_map(|content| {
            let (name, value) = content.split_once(':')?;
            let name = name.trim();
            (!name.is_empty()).then(|| (name.to_string(), value.trim().to_string()))
        })
        .collect();

    (status, headers)
}

#[async_trait]
impl Hook for HttpHeaders {
    fn name(&self) -> &str {
        "http_headers"
    }

    async fn after_render(&self, req: &mut RenderRequest) -> Result<Flow, Error> {
        if req.render_type() != RenderType::Html {
            return Ok(Flow::Continue);
        }
        let Some(html) = req.html() else {
            return Ok(Flow::Continue);
        };

        let (status, headers) = declared_status_and_headers(html);
        if let Some(status) = status {
            tracing::debug!(status, "Page declared its status code");
            req.status_code = Some(status);
        }
        for (name, value) in headers {
            req.set_header(name, value);
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rendr_core::RenderOptions;

    const PAGE: &str = r#"<!DOCTYPE html>
        <html><head>
            <meta name="prerender-status-code" content="301">
            <meta name="prerender-header" content="Location: https://example.com/moved">
            <meta name="prerender-header" content="Cache-Control: max-age=60">
            <meta name="prerender-header" content="broken">
        </head><body></body></html>"#;

    #[test]
    fn test_declared_status_and_headers() {
        let (status, headers) = declared_status_and_headers(PAGE);
        assert_eq!(status, Some(301));
        assert_eq!(
            headers,
            vec![
                ("Location".to_string(), "https://example.com/moved".to_string()),
                ("Cache-Control".to_string(), "max-age=60".to_string()),
            ]
        );
    }

    #[test]
    fn test_out_of_range_status_is_ignored() {
        let (status, _) = declared_status_and_headers(r#"<meta name="prerender-status-code" content="999">"#);
        assert_eq!(status, None);
    }

    #[tokio::test]
    async fn test_after_render_applies_declarations() {
        let mut req = RenderRequest::new("https://example.com/old", RenderOptions::default());
        req.status_code = Some(200);
        req.set_html(PAGE.to_string());

        HttpHeaders.after_render(&mut req).await.unwrap();
        assert_eq!(req.status_code, Some(301));
        assert_eq!(req.header("location"), Some("https://example.com/moved"));
    }
}
