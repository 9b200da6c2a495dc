//! HTTP reverse proxy to a session backend on `localhost:<port>`.
//!
//! The request keeps its method, path, query and end-to-end headers; only the
//! authority changes. Bodies stream in both directions. Any failure to reach
//! the backend becomes a 502 with a short HTML body.

use axum::{
    body::Body,
    http::{
        header, uri::InvalidUri, HeaderMap, HeaderValue, Method, Request, Response, StatusCode,
        Uri, Version,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::StreamExt;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use thiserror::Error;

/// Hop-by-hop headers, never forwarded in either direction.
///
/// `connection` and `upgrade` pass through; upgrade requests go to the bridge.
pub const HOP_BY_HOP: [&str; 7] = [
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "proxy-connection",
];

/// Upstream response bodies are re-chunked to at most this many bytes.
pub const RESPONSE_CHUNK_SIZE: usize = 4096;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Content type of the browser POSTs that may arrive without a length.
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=UTF-8";

const MAX_FORM_BODY: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("invalid upstream uri: {0}")]
    InvalidUri(#[from] InvalidUri),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error("failed to read request body: {0}")]
    Body(#[from] axum::Error),
}

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Restore `;key=value` matrix parameters that arrive percent-encoded.
///
/// Only the first `%3B` is turned back into `;`; `%3D` after it becomes `=`.
pub fn fix_matrix_params(path: &str) -> String {
    match path.split_once("%3B") {
        Some((head, arg)) => format!("{};{}", head, arg.replace("%3D", "=")),
        None => path.to_string(),
    }
}

/// The URI of `uri` on the backend at `localhost:<port>`.
pub fn upstream_uri(uri: &Uri, port: u16) -> Result<Uri, InvalidUri> {
    let path = fix_matrix_params(uri.path());
    let target = match uri.query() {
        Some(query) => format!("http://localhost:{port}{path}?{query}"),
        None => format!("http://localhost:{port}{path}"),
    };
    target.parse()
}

/// Split a body chunk into pieces of at most [`RESPONSE_CHUNK_SIZE`] bytes.
pub fn split_chunks(data: Bytes) -> Vec<Bytes> {
    (0..data.len())
        .step_by(RESPONSE_CHUNK_SIZE)
        .map(|start| data.slice(start..(start + RESPONSE_CHUNK_SIZE).min(data.len())))
        .collect()
}

/// Decode a form-encoded body and drop the stray `=` some clients append to
/// a JSON payload. Bodies that do not decode are returned unchanged.
pub fn repair_form_body(raw: &[u8]) -> Bytes {
    let Ok(text) = std::str::from_utf8(raw) else {
        tracing::warn!("form body is not UTF-8, forwarding as is");
        return Bytes::copy_from_slice(raw);
    };
    let decoded = match urlencoding::decode(&text.replace('+', " ")) {
        Ok(decoded) => decoded.into_owned(),
        Err(e) => {
            tracing::warn!(error = %e, "could not decode form body, forwarding as is");
            return Bytes::copy_from_slice(raw);
        }
    };
    if decoded.starts_with('{') && decoded.ends_with("}=") {
        Bytes::from(decoded[..decoded.len() - 1].to_string())
    } else {
        Bytes::from(decoded)
    }
}

fn needs_form_repair(method: &Method, headers: &HeaderMap) -> bool {
    method == Method::POST
        && !headers.contains_key(header::CONTENT_LENGTH)
        && headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == FORM_CONTENT_TYPE)
            .unwrap_or(false)
}

/// 502 page shown when the backend cannot be reached.
pub fn bad_gateway(port: u16) -> Response<Body> {
    (
        StatusCode::BAD_GATEWAY,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        format!("<h1>Could not proxy notebook running on localhost:{port}</h1>"),
    )
        .into_response()
}

/// Forwards requests to session backends over a pooled HTTP/1 client.
#[derive(Clone)]
pub struct ReverseProxy {
    client: Client<HttpConnector, Body>,
}

impl Default for ReverseProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl ReverseProxy {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { client }
    }

    /// Forward `req` to `localhost:<port>` and stream the response back.
    ///
    /// Never fails: upstream errors turn into a 502 response.
    pub async fn forward(&self, req: Request<Body>, port: u16) -> Response<Body> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        match self.try_forward(req, port).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(%method, %path, port, error = %e, "could not proxy request");
                bad_gateway(port)
            }
        }
    }

    async fn try_forward(&self, req: Request<Body>, port: u16) -> Result<Response<Body>, ProxyError> {
        let (mut parts, body) = req.into_parts();
        parts.uri = upstream_uri(&parts.uri, port)?;
        parts.version = Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers);

        if !parts.headers.contains_key(header::HOST) {
            if let Ok(host) = HeaderValue::from_str(&format!("localhost:{port}")) {
                parts.headers.insert(header::HOST, host);
            }
        }

        let body = if needs_form_repair(&parts.method, &parts.headers) {
            let raw = axum::body::to_bytes(body, MAX_FORM_BODY).await?;
            let repaired = repair_form_body(&raw);
            parts
                .headers
                .insert(header::CONTENT_LENGTH, HeaderValue::from(repaired.len()));
            Body::from(repaired)
        } else {
            body
        };

        tracing::debug!(method = %parts.method, uri = %parts.uri, "proxying request");
        let upstream = self
            .client
            .request(Request::from_parts(parts, body))
            .await?;

        // Extensions carry a non-canonical reason phrase through to the client.
        let (mut parts, incoming) = upstream.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        let chunks = Body::new(incoming)
            .into_data_stream()
            .flat_map(|frame| {
                let pieces: Vec<Result<Bytes, axum::Error>> = match frame {
                    Ok(data) => split_chunks(data).into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                futures::stream::iter(pieces)
            });
        Ok(Response::from_parts(parts, Body::from_stream(chunks)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_is_case_insensitive() {
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("KEEP-ALIVE"));
        assert!(is_hop_by_hop("te"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("connection"));
        assert!(!is_hop_by_hop("upgrade"));
    }

    #[test]
    fn strip_keeps_end_to_end_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic x"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.insert("x-custom", HeaderValue::from_static("1"));
        strip_hop_by_hop(&mut headers);
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("proxy-authorization").is_none());
        assert_eq!(headers["content-type"], "text/plain");
        assert_eq!(headers["x-custom"], "1");
    }

    #[test]
    fn upstream_uri_keeps_path_and_query() {
        let uri: Uri = "http://gate.example.com/session/alice/api/kernels?x=1&y=2"
            .parse()
            .unwrap();
        assert_eq!(
            upstream_uri(&uri, 40001).unwrap().to_string(),
            "http://localhost:40001/session/alice/api/kernels?x=1&y=2"
        );
        let relative: Uri = "/session/alice/".parse().unwrap();
        assert_eq!(
            upstream_uri(&relative, 40002).unwrap().to_string(),
            "http://localhost:40002/session/alice/"
        );
    }

    #[test]
    fn matrix_params_are_restored() {
        assert_eq!(
            fix_matrix_params("/files/a.txt%3Bsession%3Dabc"),
            "/files/a.txt;session=abc"
        );
        assert_eq!(fix_matrix_params("/plain/path"), "/plain/path");
    }

    #[test]
    fn chunks_are_bounded() {
        let data = Bytes::from(vec![7u8; RESPONSE_CHUNK_SIZE * 2 + 10]);
        let chunks = split_chunks(data);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), RESPONSE_CHUNK_SIZE);
        assert_eq!(chunks[2].len(), 10);
        assert!(split_chunks(Bytes::new()).is_empty());
    }

    #[test]
    fn form_body_trailing_equals_is_dropped() {
        let raw = b"%7B%22name%22%3A+%22x%22%7D=";
        assert_eq!(repair_form_body(raw), Bytes::from(r#"{"name": "x"}"#));
    }

    #[test]
    fn form_body_without_json_is_only_decoded() {
        assert_eq!(repair_form_body(b"a%3Db=c"), Bytes::from("a=b=c"));
    }

    #[test]
    fn form_repair_only_for_lengthless_form_posts() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
        assert!(needs_form_repair(&Method::POST, &headers));
        assert!(!needs_form_repair(&Method::PUT, &headers));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(3));
        assert!(!needs_form_repair(&Method::POST, &headers));
    }

    #[tokio::test]
    async fn bad_gateway_is_html() {
        let response = bad_gateway(40009);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/html"));
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("localhost:40009"));
    }
}
