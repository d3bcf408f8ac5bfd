//! Outbound HTTP transport.
//!
//! Plugins never open sockets.  When a plugin issues an HTTP call, the
//! [`CapabilityBridge`](crate::bridge::CapabilityBridge) resolves the named
//! upstream to a [`Url`] and hands the request to an [`HttpTransport`].
//! [`ReqwestTransport`] is the default implementation.  Transport failures
//! are returned as a typed [`CallFailure`] so they can be delivered back into
//! the sandbox instead of failing the request.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use url::Url;

/// Ordered header list; names may repeat.
pub type HeaderList = Vec<(String, String)>;

/// An outbound request addressed relative to an upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpCallRequest {
    pub method: String,
    /// Path and optional query, e.g. `/ok?x=1`.
    pub path: String,
    /// Regular headers; pseudo-headers are stripped on construction.
    pub headers: HeaderList,
    pub body: Vec<u8>,
    /// `None` means "use the host default".
    pub timeout: Option<Duration>,
}

impl HttpCallRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
            body: Vec::new(),
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    /// Build a request from a proxy-wasm style header list where `:method`
    /// and `:path` are carried as pseudo-headers.
    pub fn from_pseudo_headers(headers: HeaderList, body: Vec<u8>) -> Self {
        let mut method = String::from("GET");
        let mut path = String::from("/");
        let mut regular = Vec::with_capacity(headers.len());
        for (name, value) in headers {
            match name.as_str() {
                ":method" => method = value,
                ":path" => path = value,
                // The authority is fixed by the upstream.
                ":authority" | ":scheme" => {}
                _ => regular.push((name, value)),
            }
        }
        Self {
            method,
            path,
            headers: regular,
            body,
            timeout: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Resolve this request's path against an upstream base URL.
    ///
    /// The upstream's own path is kept as a prefix, so an upstream of
    /// `http://svc/api` and a request path of `/ok` yield `http://svc/api/ok`.
    pub fn url_for(&self, upstream: &Url) -> Url {
        let (path, query) = match self.path.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (self.path.as_str(), None),
        };
        let prefix = upstream.path().trim_end_matches('/');
        let path = if path.starts_with('/') {
            format!("{prefix}{path}")
        } else {
            format!("{prefix}/{path}")
        };
        let mut url = upstream.clone();
        url.set_path(&path);
        url.set_query(query);
        url
    }
}

/// Response to an outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpCallResponse {
    pub status: u16,
    pub headers: HeaderList,
    pub body: Vec<u8>,
}

impl HttpCallResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// Why an outbound call produced no response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallFailureKind {
    Connect,
    Timeout,
    Reset,
    Other,
}

/// A transport-level failure of an outbound call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct CallFailure {
    pub kind: CallFailureKind,
    pub message: String,
}

impl CallFailure {
    pub fn new(kind: CallFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// What the sandbox receives for a completed call.
pub type CallOutcome = std::result::Result<HttpCallResponse, CallFailure>;

/// Performs outbound HTTP calls on behalf of plugins.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, upstream: &Url, request: HttpCallRequest) -> CallOutcome;
}

/// [`HttpTransport`] backed by a shared [`reqwest::Client`].
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent("proxywasm-host/0.1")
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, upstream: &Url, request: HttpCallRequest) -> CallOutcome {
        let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|e| {
            CallFailure::new(
                CallFailureKind::Other,
                format!("invalid method `{}`: {e}", request.method),
            )
        })?;
        let url = request.url_for(upstream);

        let mut builder = self.client.request(method, url.clone());
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        tracing::debug!(method = %request.method, url = %url, "sending upstream call");

        let start = Instant::now();
        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let headers: HeaderList = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or("<binary>").to_string(),
                )
            })
            .collect();
        let body = response.bytes().await.map_err(classify)?.to_vec();

        tracing::debug!(
            url = %url,
            status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            body_bytes = body.len(),
            "upstream call completed"
        );

        Ok(HttpCallResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify(err: reqwest::Error) -> CallFailure {
    let kind = if err.is_timeout() {
        CallFailureKind::Timeout
    } else if err.is_connect() {
        CallFailureKind::Connect
    } else if err.is_body() || err.is_decode() || err.is_request() {
        CallFailureKind::Reset
    } else {
        CallFailureKind::Other
    };
    CallFailure::new(kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudo_headers_become_method_and_path() {
        let req = HttpCallRequest::from_pseudo_headers(
            vec![
                (":method".into(), "POST".into()),
                (":path".into(), "/check".into()),
                (":authority".into(), "limitador".into()),
                ("x-id".into(), "7".into()),
            ],
            b"payload".to_vec(),
        );
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/check");
        assert_eq!(req.headers, vec![("x-id".to_string(), "7".to_string())]);
        assert_eq!(req.body, b"payload");
    }

    #[test]
    fn missing_pseudo_headers_default_to_get_root() {
        let req = HttpCallRequest::from_pseudo_headers(Vec::new(), Vec::new());
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/");
    }

    #[test]
    fn url_for_joins_upstream_prefix_and_query() {
        let upstream = Url::parse("http://localhost:8081").unwrap();
        let url = HttpCallRequest::get("/ok").url_for(&upstream);
        assert_eq!(url.as_str(), "http://localhost:8081/ok");

        let upstream = Url::parse("http://svc:9000/api/").unwrap();
        let url = HttpCallRequest::get("v1/items?limit=2").url_for(&upstream);
        assert_eq!(url.as_str(), "http://svc:9000/api/v1/items?limit=2");
    }

    #[test]
    fn builders_accumulate() {
        let req = HttpCallRequest::new("PUT", "/x")
            .with_header("a", "1")
            .with_body("b")
            .with_timeout(Duration::from_millis(10));
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.body, b"b");
        assert_eq!(req.timeout, Some(Duration::from_millis(10)));

        let resp = HttpCallResponse::new(204).with_header("k", "v").with_body("z");
        assert_eq!(resp.status, 204);
        assert_eq!(resp.body, b"z");
    }

    #[tokio::test]
    async fn refused_connection_is_a_typed_failure() {
        // Bind then drop a listener so the port is known to be closed.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let upstream = Url::parse(&format!("http://127.0.0.1:{port}")).unwrap();
        let outcome = ReqwestTransport::new()
            .send(
                &upstream,
                HttpCallRequest::get("/").with_timeout(Duration::from_secs(2)),
            )
            .await;
        let failure = outcome.expect_err("closed port must fail");
        assert!(matches!(
            failure.kind,
            CallFailureKind::Connect | CallFailureKind::Other
        ));
    }

    #[tokio::test]
    async fn invalid_method_is_rejected_before_sending() {
        let upstream = Url::parse("http://127.0.0.1:9").unwrap();
        let outcome = ReqwestTransport::new()
            .send(&upstream, HttpCallRequest::new("BAD METHOD", "/"))
            .await;
        assert_eq!(outcome.unwrap_err().kind, CallFailureKind::Other);
    }
}
