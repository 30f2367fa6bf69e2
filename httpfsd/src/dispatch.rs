//! Request dispatcher: one fallback handler routes on the request verb and
//! performs the matching filesystem operation under the configured root.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Json, Response};
use axum::Router;
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use common::time::format_http_date;

use crate::fsutil::{open_options, read_dir_entries};

/// The directory being served. All request paths are cleaned and re-rooted
/// under it; `..` cannot climb out.
pub struct ServeRoot {
    root: PathBuf,
}

impl ServeRoot {
    /// Resolve a raw (still percent-encoded) URL path to a local path.
    fn local_path(&self, raw: &str) -> PathBuf {
        let decoded = percent_decode_str(raw).decode_utf8_lossy();
        self.local_join(&decoded)
    }

    /// Re-root an already-decoded server-relative path under the root.
    fn local_join(&self, path: &str) -> PathBuf {
        let clean = common::path::clean_path(path);
        self.root.join(clean.trim_start_matches('/'))
    }
}

/// Build the verb router over a root directory.
pub fn router(root: impl Into<PathBuf>) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(DefaultBodyLimit::disable())
        .with_state(Arc::new(ServeRoot { root: root.into() }))
}

async fn dispatch(
    State(state): State<Arc<ServeRoot>>,
    method: Method,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let local = state.local_path(uri.path());
    debug!(target: "httpfsd", %method, path = %uri.path(), "request");

    match method.as_str() {
        "HEAD" => head(&local).await,
        "GET" => get(&local, &uri, &headers).await,
        "PUT" => put(&local, &params, &headers, &body).await,
        "DELETE" => delete(&local).await,
        "CHMOD" => chmod(&local, &params).await,
        "MKDIR" => mkdir(&local, &params).await,
        "LINK" => link(&state, &local, &params).await,
        "RENAME" => rename(&state, &local, &params).await,
        "TRUNCATE" => truncate(&local, &params).await,
        _ => (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed").into_response(),
    }
}

async fn head(local: &Path) -> Response {
    match tokio::fs::symlink_metadata(local).await {
        Ok(md) => (StatusCode::OK, stat_headers(&md)).into_response(),
        Err(err) => io_error(err),
    }
}

async fn get(local: &Path, uri: &Uri, headers: &HeaderMap) -> Response {
    let md = match tokio::fs::metadata(local).await {
        Ok(md) => md,
        Err(err) => return io_error(err),
    };

    if md.is_dir() {
        if !uri.path().ends_with('/') {
            let location = format!("{}/", uri.path());
            return (
                StatusCode::FOUND,
                [(header::LOCATION, location)],
            )
                .into_response();
        }
        return match read_dir_entries(local).await {
            Ok(entries) => Json(entries).into_response(),
            Err(err) => io_error(err),
        };
    }

    serve_file(local, &md, headers).await
}

/// Serve a regular file, honouring a `bytes=N-` / `bytes=N-M` range.
async fn serve_file(local: &Path, md: &std::fs::Metadata, headers: &HeaderMap) -> Response {
    let mut file = match tokio::fs::File::open(local).await {
        Ok(f) => f,
        Err(err) => return io_error(err),
    };

    let total = md.len();
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range);

    let mut response_headers = stat_headers(md);
    match range {
        Some((start, end)) => {
            let len = range_len(start, end, total);
            if len > 0 {
                if let Err(err) = file.seek(SeekFrom::Start(start)).await {
                    return io_error(err);
                }
                let content_range = format!("bytes {}-{}/{}", start, start + len - 1, total);
                response_headers.insert(
                    header::CONTENT_RANGE,
                    HeaderValue::from_str(&content_range).expect("ascii header"),
                );
            }
            response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            let body = Body::from_stream(ReaderStream::new(file.take(len)));
            (StatusCode::PARTIAL_CONTENT, response_headers, body).into_response()
        }
        None => {
            let body = Body::from_stream(ReaderStream::new(file));
            (StatusCode::OK, response_headers, body).into_response()
        }
    }
}

async fn put(
    local: &Path,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
    body: &Bytes,
) -> Response {
    let perm = param_u32(params, "perm", 0o666);
    let flags = param_i64(params, "flags", default_put_flags() as i64) as i32;
    let offset = param_i64(params, "offset", 0);

    let mut file = match open_options(flags, perm).open(local).await {
        Ok(f) => f,
        Err(err) => return io_error(err),
    };

    if offset != 0 {
        let seek = if offset < 0 {
            SeekFrom::End(offset)
        } else {
            SeekFrom::Start(offset as u64)
        };
        if let Err(err) = file.seek(seek).await {
            return io_error(err);
        }
    }

    let written = match copy_body(&mut file, body).await {
        Ok(n) => n,
        Err(err) => return io_error(err),
    };

    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    // A genuine short write is partial no matter what the request declared.
    if (written as usize) < body.len() {
        return short_write_response(written, body.len() as u64);
    }
    short_write_response(written, declared)
}

/// Chunk size for the body copy loop, matching common copy buffer sizes.
const WRITE_CHUNK: usize = 32 * 1024;

/// Copy the request body into the file through bounded writes, flushing each
/// chunk so the fd's verdict is known before the next one. Stops at the first
/// short or failed write; an error after partial progress yields the count of
/// bytes that landed rather than a failure.
async fn copy_body(file: &mut tokio::fs::File, data: &[u8]) -> io::Result<u64> {
    let mut written: usize = 0;
    while written < data.len() {
        let end = (written + WRITE_CHUNK).min(data.len());
        let n = match file.write(&data[written..end]).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if written == 0 => return Err(err),
            Err(_) => break,
        };
        match file.flush().await {
            Ok(()) => written += n,
            Err(err) if written == 0 => return Err(err),
            Err(_) => break,
        }
    }
    Ok(written as u64)
}

async fn delete(local: &Path) -> Response {
    let md = match tokio::fs::symlink_metadata(local).await {
        Ok(md) => md,
        Err(err) => return io_error(err),
    };
    let removed = if md.is_dir() {
        tokio::fs::remove_dir_all(local).await
    } else {
        tokio::fs::remove_file(local).await
    };
    match removed {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => io_error(err),
    }
}

async fn chmod(local: &Path, params: &HashMap<String, String>) -> Response {
    let mode = param_u32(params, "mode", 0);
    match tokio::fs::set_permissions(local, PermissionsExt::from_mode(mode)).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => io_error(err),
    }
}

async fn mkdir(local: &Path, params: &HashMap<String, String>) -> Response {
    let perm = param_u32(params, "perm", 0o777);
    let mut builder = tokio::fs::DirBuilder::new();
    builder.mode(perm);
    match builder.create(local).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => io_error(err),
    }
}

async fn link(state: &ServeRoot, local: &Path, params: &HashMap<String, String>) -> Response {
    let Some(name) = params.get("name") else {
        return bad_request();
    };
    let to_path = state.local_join(name);
    let soft = params.get("soft").map(|v| param_bool(v)).unwrap_or(false);

    let linked = if soft {
        tokio::fs::symlink(local, &to_path).await
    } else {
        tokio::fs::hard_link(local, &to_path).await
    };
    match linked {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => io_error(err),
    }
}

async fn rename(state: &ServeRoot, local: &Path, params: &HashMap<String, String>) -> Response {
    let Some(name) = params.get("name") else {
        return bad_request();
    };
    let to_path = state.local_join(name);
    match tokio::fs::rename(local, &to_path).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => io_error(err),
    }
}

async fn truncate(local: &Path, params: &HashMap<String, String>) -> Response {
    let Some(size) = params.get("size").and_then(|v| v.parse::<u64>().ok()) else {
        return bad_request();
    };
    let file = match tokio::fs::OpenOptions::new().write(true).open(local).await {
        Ok(f) => f,
        Err(err) => return io_error(err),
    };
    match file.set_len(size).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => io_error(err),
    }
}

/// Full write → plain 200; anything short of the declared length → 206 with
/// the byte count as the body. A declared length of zero means "don't check".
fn short_write_response(written: u64, declared: u64) -> Response {
    if declared == 0 || written == declared {
        StatusCode::OK.into_response()
    } else {
        (StatusCode::PARTIAL_CONTENT, written.to_string()).into_response()
    }
}

/// Stat headers attached to HEAD responses and file GETs.
fn stat_headers(md: &std::fs::Metadata) -> HeaderMap {
    let mut h = HeaderMap::new();
    h.insert(header::CONTENT_LENGTH, HeaderValue::from(md.len()));
    h.insert(
        header::LAST_MODIFIED,
        HeaderValue::from_str(&format_http_date(md.mtime())).expect("ascii header"),
    );
    h.insert(
        HeaderName::from_static(common::X_FILE_MODE),
        HeaderValue::from(md.mode()),
    );
    h.insert(
        HeaderName::from_static(common::X_IS_DIR),
        HeaderValue::from_static(if md.is_dir() { "true" } else { "false" }),
    );
    h
}

fn default_put_flags() -> i32 {
    libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL
}

/// Parse `bytes=N-` or `bytes=N-M`.
fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let raw = value.strip_prefix("bytes=")?;
    let (start, end) = raw.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let end = end.trim();
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    Some((start, end))
}

/// Number of bytes a range selects out of `total`; zero at or past EOF.
fn range_len(start: u64, end: Option<u64>, total: u64) -> u64 {
    if start >= total {
        return 0;
    }
    match end {
        Some(end) => end.min(total - 1).saturating_sub(start) + 1,
        None => total - start,
    }
}

fn io_error(err: io::Error) -> Response {
    let status = match err.kind() {
        io::ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
        io::ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let msg = match status {
        StatusCode::FORBIDDEN => "Forbidden",
        StatusCode::NOT_FOUND => "File Not Found",
        StatusCode::CONFLICT => "File Already Exists",
        _ => "Internal Server Error",
    };
    (status, msg).into_response()
}

fn bad_request() -> Response {
    (StatusCode::BAD_REQUEST, "Bad Request").into_response()
}

fn param_i64(params: &HashMap<String, String>, key: &str, default: i64) -> i64 {
    params
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn param_u32(params: &HashMap<String, String>, key: &str, default: u32) -> u32 {
    params
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn param_bool(value: &str) -> bool {
    matches!(value, "1" | "t" | "T" | "true" | "TRUE" | "True")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_parsing() {
        assert_eq!(parse_range("bytes=5-"), Some((5, None)));
        assert_eq!(parse_range("bytes=5-9"), Some((5, Some(9))));
        assert_eq!(parse_range("bytes=abc-"), None);
        assert_eq!(parse_range("items=5-"), None);
    }

    #[test]
    fn range_length() {
        assert_eq!(range_len(0, None, 10), 10);
        assert_eq!(range_len(5, None, 10), 5);
        assert_eq!(range_len(5, Some(7), 10), 3);
        assert_eq!(range_len(5, Some(100), 10), 5);
        // At or past EOF selects nothing.
        assert_eq!(range_len(10, None, 10), 0);
        assert_eq!(range_len(42, None, 10), 0);
    }

    #[test]
    fn short_writes() {
        assert_eq!(short_write_response(5, 5).status(), StatusCode::OK);
        assert_eq!(
            short_write_response(3, 5).status(),
            StatusCode::PARTIAL_CONTENT
        );
        // Zero declared length disables the check.
        assert_eq!(short_write_response(3, 0).status(), StatusCode::OK);
    }

    #[test]
    fn param_defaults() {
        let params = HashMap::new();
        assert_eq!(param_u32(&params, "perm", 0o666), 0o666);
        assert_eq!(param_i64(&params, "offset", 0), 0);
        assert!(param_bool("1"));
        assert!(param_bool("true"));
        assert!(!param_bool("0"));
        assert!(!param_bool("yes"));
    }
}
