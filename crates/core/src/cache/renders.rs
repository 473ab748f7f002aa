//! Cached render CRUD operations.
//!
//! Timestamps are stored as RFC 3339 strings in UTC so that lexical order in
//! SQLite matches chronological order.

use std::time::Duration;

use super::connection::CacheDb;
use crate::Error;
use crate::render::{RenderResponse, RenderType};
use serde::{Deserialize, Serialize};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite;

/// A stored render.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CachedRender {
    pub hash: String,
    pub url: String,
    pub render_type: String,
    pub status_code: u16,
    pub content_type: Option<String>,
    pub headers_json: Option<String>,
    #[serde(skip)]
    pub body: Vec<u8>,
    pub rendered_at: String,
    pub expires_at: Option<String>,
    pub render_ms: Option<i64>,
}

impl CachedRender {
    /// Build a cache entry from a finished render.
    pub fn from_response(hash: String, url: &str, response: &RenderResponse, ttl: Duration) -> Self {
        let now = chrono::Utc::now();
        let expires_at = chrono::Duration::from_std(ttl).ok().map(|ttl| (now + ttl).to_rfc3339());
        Self {
            hash,
            url: url.to_string(),
            render_type: response.render_type.as_str().to_string(),
            status_code: response.status_code,
            content_type: response.header("content-type").map(str::to_string),
            headers_json: serde_json::to_string(&response.headers).ok(),
            body: response.body.clone(),
            rendered_at: now.to_rfc3339(),
            expires_at,
            render_ms: i64::try_from(response.render_ms).ok(),
        }
    }

    /// Stored headers, empty when missing or unreadable.
    pub fn headers(&self) -> Vec<(String, String)> {
        self.headers_json.as_deref().and_then(|json| serde_json::from_str(json).ok()).unwrap_or_default()
    }

    /// Rebuild the response this entry was stored from.
    pub fn to_response(&self) -> RenderResponse {
        RenderResponse {
            status_code: self.status_code,
            headers: self.headers(),
            body: self.body.clone(),
            render_type: self.render_type.parse().unwrap_or(RenderType::Html),
            errors: Vec::new(),
            render_ms: 0,
        }
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CachedRender> {
    Ok(CachedRender {
        hash: row.get(0)?,
        url: row.get(1)?,
        render_type: row.get(2)?,
        status_code: row.get(3)?,
        content_type: row.get(4)?,
        headers_json: row.get(5)?,
        body: row.get(6)?,
        rendered_at: row.get(7)?,
        expires_at: row.get(8)?,
        render_ms: row.get(9)?,
    })
}

const SELECT_COLUMNS: &str = "SELECT hash, url, render_type, status_code, content_type, headers_json,
        body, rendered_at, expires_at, render_ms FROM renders";

impl CacheDb {
    /// Insert or replace a cached render.
    pub async fn upsert_render(&self, render: &CachedRender) -> Result<(), Error> {
        let render = render.clone();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO renders (
                    hash, url, render_type, status_code, content_type, headers_json,
                    body, rendered_at, expires_at, last_accessed_at, render_ms
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?8, ?10)
                ON CONFLICT(hash) DO UPDATE SET
                    url = excluded.url,
                    render_type = excluded.render_type,
                    status_code = excluded.status_code,
                    content_type = excluded.content_type,
                    headers_json = excluded.headers_json,
                    body = excluded.body,
                    rendered_at = excluded.rendered_at,
                    expires_at = excluded.expires_at,
                    last_accessed_at = excluded.last_accessed_at,
                    render_ms = excluded.render_ms",
                    params![
                        &render.hash,
                        &render.url,
                        &render.render_type,
                        render.status_code,
                        &render.content_type,
                        &render.headers_json,
                        &render.body,
                        &render.rendered_at,
                        &render.expires_at,
                        &render.render_ms,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Get a render by hash, fresh or not.
    pub async fn get_render(&self, hash: &str) -> Result<Option<CachedRender>, Error> {
        let hash = hash.to_string();
        self.conn
            .call(move |conn| -> Result<Option<CachedRender>, Error> {
                let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE hash = ?1"))?;
                match stmt.query_row(params![hash], read_row) {
                    Ok(r) => Ok(Some(r)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    /// Get a render that has not expired yet, marking it as recently used.
    pub async fn get_fresh_render(&self, hash: &str) -> Result<Option<CachedRender>, Error> {
        let hash = hash.to_string();
        let now = chrono::Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| -> Result<Option<CachedRender>, Error> {
                let mut stmt = conn
                    .prepare(&format!("{SELECT_COLUMNS} WHERE hash = ?1 AND (expires_at IS NULL OR expires_at > ?2)"))?;
                let render = match stmt.query_row(params![hash, now], read_row) {
                    Ok(r) => r,
                    Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
                    Err(e) => return Err(e.into()),
                };
                conn.execute("UPDATE renders SET last_accessed_at = ?2 WHERE hash = ?1", params![hash, now])?;
                Ok(Some(render))
            })
            .await
            .map_err(Error::from)
    }

    /// Delete expired renders.
    ///
    /// Returns the number of deleted entries.
    pub async fn purge_expired_renders(&self) -> Result<u64, Error> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count =
                    conn.execute("DELETE FROM renders WHERE expires_at IS NOT NULL AND expires_at < ?1", params![now])?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete renders whose host is `domain` or one of its subdomains.
    ///
    /// Returns the number of deleted entries.
    pub async fn purge_renders_by_domain(&self, domain: &str) -> Result<u64, Error> {
        let domain = domain.trim().trim_start_matches("*.").to_ascii_lowercase();
        if domain.is_empty() {
            return Err(Error::InvalidInput("domain must not be empty".into()));
        }
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count = conn.execute(
                    "DELETE FROM renders WHERE
                        url LIKE '%://' || ?1 || '/%'
                        OR url LIKE '%://' || ?1 || ':%'
                        OR url LIKE '%.' || ?1 || '/%'
                        OR url LIKE '%.' || ?1 || ':%'",
                    params![domain],
                )?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Evict least recently used renders until at most `max_entries` remain.
    ///
    /// Returns the number of deleted entries.
    pub async fn purge_lru_renders(&self, max_entries: usize) -> Result<u64, Error> {
        let max = i64::try_from(max_entries).unwrap_or(i64::MAX);
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count: i64 = conn.query_row("SELECT COUNT(*) FROM renders", [], |row| row.get(0))?;
                if count <= max {
                    return Ok(0);
                }

                let deleted = conn.execute(
                    "DELETE FROM renders WHERE hash IN (
                    SELECT hash FROM renders ORDER BY last_accessed_at ASC, rendered_at ASC LIMIT ?1
                )",
                    params![count - max],
                )?;
                Ok(deleted as u64)
            })
            .await
            .map_err(Error::from)
    }
}
