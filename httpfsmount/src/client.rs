//! Typed transport facade over the wire protocol.
//!
//! Each method is one request/response exchange; there is no session state on
//! the server, so reads and writes are independent ranged operations.

use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED, RANGE};
use reqwest::{Method, Response, StatusCode};
use scraper::{Html, Selector};
use tracing::debug;

use common::{Entry, Stat, X_FILE_MODE, X_IS_DIR};

use crate::error::ClientError;

/// The file operations the adapter needs from a backend. Implemented by
/// [`HttpClient`]; tests substitute a recording in-memory double.
#[async_trait]
pub trait FileOps: Send + Sync + 'static {
    async fn stat(&self, path: &str) -> Result<Stat, ClientError>;
    async fn readdir(&self, path: &str) -> Result<Vec<Entry>, ClientError>;
    async fn mkdir(&self, path: &str, perm: u32) -> Result<(), ClientError>;
    async fn link(&self, path: &str, new_path: &str) -> Result<(), ClientError>;
    async fn symlink(&self, target: &str, new_path: &str) -> Result<(), ClientError>;
    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), ClientError>;
    async fn delete(&self, path: &str) -> Result<(), ClientError>;
    async fn chmod(&self, path: &str, mode: u32) -> Result<(), ClientError>;
    async fn truncate(&self, path: &str, size: u64) -> Result<(), ClientError>;
    /// Ranged read; returns the bytes actually received, at most `size`.
    async fn read_at(&self, path: &str, size: usize, offset: u64) -> Result<Vec<u8>, ClientError>;
    /// Offset write; returns the byte count the server reports written.
    async fn write_at(
        &self,
        path: &str,
        data: &[u8],
        flags: i32,
        perm: u32,
        offset: i64,
    ) -> Result<usize, ClientError>;
}

/// reqwest-backed transport. Lives for the life of the mount.
#[derive(Debug)]
pub struct HttpClient {
    base: String,
    http: reqwest::Client,
}

impl HttpClient {
    /// `tls_verify = false` skips peer verification for https bases.
    pub fn new(url: &str, tls_verify: bool) -> Result<Self, ClientError> {
        let base = url.trim_end_matches('/').to_string();
        let mut builder = reqwest::Client::builder();
        if base.starts_with("https://") && !tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        Ok(Self {
            base,
            http: builder.build()?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, encode_path(path))
    }

    async fn expect_ok(&self, resp: Response) -> Result<(), ClientError> {
        if resp.status() == StatusCode::OK {
            Ok(())
        } else {
            Err(ClientError::from_status(resp.status()))
        }
    }
}

#[async_trait]
impl FileOps for HttpClient {
    async fn stat(&self, path: &str) -> Result<Stat, ClientError> {
        let resp = self.http.head(self.url(path)).send().await?;
        if resp.status() != StatusCode::OK {
            return Err(ClientError::from_status(resp.status()));
        }

        let headers = resp.headers();
        let size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mtime = headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(common::time::parse_http_date)
            .unwrap_or(0);
        let mode = headers
            .get(X_FILE_MODE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let is_dir = headers
            .get(X_IS_DIR)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "true")
            .unwrap_or(false);

        Ok(Stat {
            size,
            mtime,
            mode,
            is_dir,
        })
    }

    async fn readdir(&self, path: &str) -> Result<Vec<Entry>, ClientError> {
        let resp = self.http.get(self.url(path)).send().await?;
        if resp.status() != StatusCode::OK {
            return Err(ClientError::from_status(resp.status()));
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or("").trim().to_string())
            .unwrap_or_default();

        match content_type.as_str() {
            "application/json" => {
                let body = resp.bytes().await?;
                serde_json::from_slice(&body)
                    .map_err(|err| ClientError::Protocol(format!("listing decode: {err}")))
            }
            "text/html" => {
                let body = resp.text().await?;
                Ok(parse_html_listing(&body))
            }
            other => Err(ClientError::Protocol(format!(
                "unsupported directory listing content type {other:?}"
            ))),
        }
    }

    async fn mkdir(&self, path: &str, perm: u32) -> Result<(), ClientError> {
        let resp = self
            .http
            .request(verb("MKDIR"), self.url(path))
            .query(&[("perm", perm.to_string())])
            .send()
            .await?;
        self.expect_ok(resp).await
    }

    async fn link(&self, path: &str, new_path: &str) -> Result<(), ClientError> {
        let resp = self
            .http
            .request(verb("LINK"), self.url(path))
            .query(&[("name", new_path)])
            .send()
            .await?;
        self.expect_ok(resp).await
    }

    async fn symlink(&self, target: &str, new_path: &str) -> Result<(), ClientError> {
        let resp = self
            .http
            .request(verb("LINK"), self.url(target))
            .query(&[("name", new_path), ("soft", "1")])
            .send()
            .await?;
        self.expect_ok(resp).await
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), ClientError> {
        let resp = self
            .http
            .request(verb("RENAME"), self.url(old_path))
            .query(&[("name", new_path)])
            .send()
            .await?;
        self.expect_ok(resp).await
    }

    async fn delete(&self, path: &str) -> Result<(), ClientError> {
        let resp = self.http.delete(self.url(path)).send().await?;
        self.expect_ok(resp).await
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), ClientError> {
        let resp = self
            .http
            .request(verb("CHMOD"), self.url(path))
            .query(&[("mode", mode.to_string())])
            .send()
            .await?;
        self.expect_ok(resp).await
    }

    async fn truncate(&self, path: &str, size: u64) -> Result<(), ClientError> {
        let resp = self
            .http
            .request(verb("TRUNCATE"), self.url(path))
            .query(&[("size", size.to_string())])
            .send()
            .await?;
        self.expect_ok(resp).await
    }

    async fn read_at(&self, path: &str, size: usize, offset: u64) -> Result<Vec<u8>, ClientError> {
        let resp = self
            .http
            .get(self.url(path))
            .header(RANGE, format!("bytes={offset}-"))
            .send()
            .await?;
        if resp.status() != StatusCode::PARTIAL_CONTENT {
            debug!(target: "httpfsmount::client", status = %resp.status(), path, "ranged read refused");
            return Err(ClientError::from_status(resp.status()));
        }

        let mut data = resp.bytes().await?.to_vec();
        data.truncate(size);
        Ok(data)
    }

    async fn write_at(
        &self,
        path: &str,
        data: &[u8],
        flags: i32,
        perm: u32,
        offset: i64,
    ) -> Result<usize, ClientError> {
        let resp = self
            .http
            .put(self.url(path))
            .query(&[
                ("flags", flags.to_string()),
                ("perm", perm.to_string()),
                ("offset", offset.to_string()),
            ])
            .body(data.to_vec())
            .send()
            .await?;

        match resp.status() {
            StatusCode::OK => Ok(data.len()),
            StatusCode::PARTIAL_CONTENT => {
                let body = resp.text().await?;
                body.trim()
                    .parse()
                    .map_err(|_| ClientError::Protocol(format!("partial write count {body:?}")))
            }
            status => Err(ClientError::from_status(status)),
        }
    }
}

fn verb(name: &'static str) -> Method {
    Method::from_bytes(name.as_bytes()).expect("verb is a valid method token")
}

/// Unreserved characters survive; everything else in a segment is escaped.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| utf8_percent_encode(segment, SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Decode an HTML `<a href>` listing. A trailing `/` marks a directory and is
/// trimmed from the name; size, mode and mtime are unknown and left zero.
fn parse_html_listing(body: &str) -> Vec<Entry> {
    let doc = Html::parse_document(body);
    let anchors = Selector::parse("a").expect("static selector");

    doc.select(&anchors)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| {
            let is_dir = href.ends_with('/');
            let name = percent_decode_str(href).decode_utf8_lossy();
            let name = name.trim_end_matches('/').to_string();
            if name.is_empty() {
                return None;
            }
            Some(Entry {
                name,
                size: 0,
                mode: 0,
                mtime: 0,
                is_dir,
            })
        })
        .collect()
}
