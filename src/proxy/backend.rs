// src/proxy/backend.rs
use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::{DateTime, Utc};
use hyper::client::HttpConnector;
use hyper::header::{HeaderMap, HeaderName, CONNECTION, HOST};
use hyper::{Body, Client, Request, Response, Uri, Version};
use hyper_tls::HttpsConnector;
use serde::Serialize;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

use super::ticket;
use crate::config::ProbeConfig;

/// Latency reported for backends that were never measured or are offline,
/// so that they rank after every measured one.
pub const UNMEASURED_LATENCY_MS: u64 = 900_000;

/// Client used to relay proxied traffic.
pub type HttpClient = Client<HttpsConnector<HttpConnector>, Body>;

pub fn http_client() -> HttpClient {
    Client::builder().build(HttpsConnector::new())
}

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to reach backend: {0}")]
    Connect(#[source] hyper::Error),

    #[error("client request body failed: {0}")]
    ClientAborted(#[source] hyper::Error),

    #[error("invalid upstream target: {0}")]
    InvalidTarget(String),
}

/// One license server and its last observed health.
///
/// Each field is updated on its own without a lock. A sweep and a proxied
/// request may race on the same backend; the last write wins.
#[derive(Debug)]
pub struct Backend {
    endpoint: Url,
    online: AtomicBool,
    available: AtomicBool,
    last_latency_ms: AtomicU64,
    last_status: ArcSwap<String>,
    last_checked: ArcSwapOption<DateTime<Utc>>,
}

/// Public JSON view of a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendStatus {
    pub url: String,
    pub online: bool,
    pub available: bool,
    pub ping: Option<u64>,
    pub status: String,
}

impl Backend {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            online: AtomicBool::new(false),
            available: AtomicBool::new(false),
            last_latency_ms: AtomicU64::new(UNMEASURED_LATENCY_MS),
            last_status: ArcSwap::from_pointee("not checked".to_string()),
            last_checked: ArcSwapOption::empty(),
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    /// Online and the last ticket response was a success.
    pub fn is_available(&self) -> bool {
        self.is_online() && self.available.load(Ordering::Relaxed)
    }

    pub fn last_latency_ms(&self) -> u64 {
        self.last_latency_ms.load(Ordering::Relaxed)
    }

    pub fn last_status(&self) -> String {
        (*self.last_status.load_full()).clone()
    }

    /// When availability was last (re)computed. `None` until the first
    /// ticket response has been classified.
    pub fn last_checked(&self) -> Option<DateTime<Utc>> {
        self.last_checked.load_full().map(|at| *at)
    }

    pub fn status(&self) -> BackendStatus {
        let online = self.is_online();
        BackendStatus {
            url: self.endpoint.to_string(),
            online,
            available: self.is_available(),
            ping: online.then(|| self.last_latency_ms()),
            status: self.last_status(),
        }
    }

    pub(crate) fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    pub(crate) fn set_latency(&self, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.last_latency_ms.store(ms, Ordering::Relaxed);
    }

    pub(crate) fn set_status(&self, status: impl Into<String>) {
        self.last_status.store(Arc::new(status.into()));
    }

    /// Assigns availability and stamps the check time.
    pub(crate) fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
        self.last_checked.store(Some(Arc::new(Utc::now())));
    }

    /// Network failure: offline, availability left as it was.
    fn mark_unreachable(&self, detail: impl Display) {
        self.set_online(false);
        self.last_latency_ms
            .store(UNMEASURED_LATENCY_MS, Ordering::Relaxed);
        self.set_status(format!("connection error: {detail}"));
    }

    /// Classifies an obtain-ticket response body and records the verdict.
    pub fn classify(&self, body: &str) -> bool {
        let verdict = ticket::classify(body);
        self.set_status(verdict.status);
        self.set_available(verdict.available);
        verdict.available
    }

    /// Probes the server with a synthetic obtain-ticket request.
    pub async fn check(&self, client: &reqwest::Client, probe: &ProbeConfig) {
        let url = match ticket::probe_url(&self.endpoint, probe) {
            Ok(url) => url,
            Err(e) => {
                self.mark_unreachable(e);
                return;
            }
        };

        let mut request = client.get(url);
        if let Some(timeout) = probe.timeout() {
            request = request.timeout(timeout);
        }

        let start = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(backend = %self.endpoint, error = %e, "probe failed");
                self.mark_unreachable(e);
                return;
            }
        };

        self.set_online(response.status().is_success());
        self.set_latency(start.elapsed());
        self.set_status("connected");

        match response.text().await {
            Ok(body) => {
                let available = self.classify(&body);
                debug!(
                    backend = %self.endpoint,
                    available,
                    latency_ms = self.last_latency_ms(),
                    status = %self.last_status(),
                    "probe complete"
                );
            }
            Err(e) => {
                warn!(backend = %self.endpoint, error = %e, "probe body unreadable");
                self.mark_unreachable(e);
            }
        }
    }

    /// Relays `req` to this server at `path` (path and query).
    ///
    /// For ticket requests the status and headers are returned at once but
    /// the body is withheld until it has been read in full and classified.
    /// Everything else is streamed through untouched.
    pub async fn proxy(
        self: &Arc<Self>,
        client: &HttpClient,
        req: Request<Body>,
        path: &str,
    ) -> Result<Response<Body>, BackendError> {
        let is_ticket = ticket::is_obtain_ticket_request(path);

        let (mut parts, body) = req.into_parts();
        parts.uri = self.upstream_uri(path)?;
        parts.version = Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers);
        parts.headers.remove(HOST);

        let start = Instant::now();
        let response = match client.request(Request::from_parts(parts, body)).await {
            Ok(response) => response,
            // The inbound body broke, the backend did nothing wrong.
            Err(e) if e.is_user() => return Err(BackendError::ClientAborted(e)),
            Err(e) => {
                warn!(backend = %self.endpoint, error = %e, "proxy connection failed");
                self.mark_unreachable(&e);
                return Err(BackendError::Connect(e));
            }
        };
        self.set_online(true);

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        if !is_ticket {
            return Ok(Response::from_parts(parts, body));
        }

        self.set_latency(start.elapsed());
        let (mut sink, relayed) = Body::channel();
        let backend = Arc::clone(self);
        tokio::spawn(async move {
            let bytes = match hyper::body::to_bytes(body).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(backend = %backend.endpoint, error = %e, "ticket response body failed");
                    sink.abort();
                    return;
                }
            };
            let available = backend.classify(&String::from_utf8_lossy(&bytes));
            debug!(backend = %backend.endpoint, available, "classified proxied ticket response");

            if sink.send_data(bytes).await.is_err() {
                debug!(backend = %backend.endpoint, "client left before the ticket response was relayed");
            }
        });

        Ok(Response::from_parts(parts, relayed))
    }

    fn upstream_uri(&self, path: &str) -> Result<Uri, BackendError> {
        let host = self
            .endpoint
            .host_str()
            .ok_or_else(|| BackendError::InvalidTarget(format!("{} has no host", self.endpoint)))?;
        let authority = match self.endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        Uri::builder()
            .scheme(self.endpoint.scheme())
            .authority(authority)
            .path_and_query(path)
            .build()
            .map_err(|e| BackendError::InvalidTarget(e.to_string()))
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;
    use hyper::StatusCode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn backend(url: &str) -> Backend {
        Backend::new(Url::parse(url).unwrap())
    }

    /// Accepts connections and reads requests but never answers.
    async fn silent_server() -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while matches!(socket.read(&mut buf).await, Ok(n) if n > 0) {}
                });
            }
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    /// Answers once with `head` followed by `body`, then hangs up.
    async fn one_shot_server(head: &'static str, body: &'static str) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(body.as_bytes()).await;
            let _ = socket.shutdown().await;
        });
        Url::parse(&format!("http://{addr}/")).unwrap()
    }

    #[tokio::test]
    async fn aborted_client_body_leaves_backend_online() {
        let b = Arc::new(Backend::new(silent_server().await));
        b.set_online(true);

        let (mut tx, body) = Body::channel();
        tx.send_data("partial".into()).await.unwrap();
        tx.abort();
        let req = Request::post("/rpc/releaseTicket.action").body(body).unwrap();

        let result = b.proxy(&http_client(), req, "/rpc/releaseTicket.action").await;
        assert!(matches!(result, Err(BackendError::ClientAborted(_))), "{result:?}");
        assert!(b.is_online());
        assert!(!b.last_status().starts_with("connection error"));
    }

    #[tokio::test]
    async fn ticket_response_is_classified_before_body_is_released() {
        let ticket = "<ObtainTicketResponse><responseCode>OK</responseCode></ObtainTicketResponse>";
        let url = one_shot_server(
            "HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nContent-Length: 76\r\nConnection: close\r\n\r\n",
            ticket,
        )
        .await;
        let b = Arc::new(Backend::new(url));

        let req = Request::get("/").body(Body::empty()).unwrap();
        let response = b
            .proxy(&http_client(), req, "/rpc/obtainTicket.action?salt=1")
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/xml");

        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&body[..], ticket.as_bytes());
        assert!(b.is_available());
        assert!(b.last_checked().is_some());
    }

    #[tokio::test]
    async fn truncated_ticket_response_fails_the_relay_without_reclassifying() {
        let url = one_shot_server(
            "HTTP/1.1 200 OK\r\nContent-Type: text/xml\r\nContent-Length: 500\r\nConnection: close\r\n\r\n",
            "<ObtainTicketResponse><responseCode>OK",
        )
        .await;
        let b = Arc::new(Backend::new(url));

        let req = Request::get("/").body(Body::empty()).unwrap();
        let response = b
            .proxy(&http_client(), req, "/rpc/obtainTicket.action")
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(b.is_online());

        assert!(hyper::body::to_bytes(response.into_body()).await.is_err());
        assert!(b.last_checked().is_none());
        assert!(!b.is_available());
        assert_eq!(b.last_status(), "not checked");
    }

    #[test]
    fn starts_offline_and_unmeasured() {
        let b = backend("http://license.example:8080");
        assert!(!b.is_online());
        assert!(!b.is_available());
        assert_eq!(b.last_latency_ms(), UNMEASURED_LATENCY_MS);
        assert!(b.last_checked().is_none());
        assert_eq!(
            b.status(),
            BackendStatus {
                url: "http://license.example:8080/".to_string(),
                online: false,
                available: false,
                ping: None,
                status: "not checked".to_string(),
            }
        );
    }

    #[test]
    fn availability_requires_online() {
        let b = backend("http://license.example");
        b.set_available(true);
        assert!(!b.is_available());

        b.set_online(true);
        assert!(b.is_available());

        b.set_online(false);
        assert!(!b.is_available());
    }

    #[test]
    fn only_classification_stamps_check_time() {
        let b = backend("http://license.example");
        b.set_online(true);
        b.set_online(false);
        assert!(b.last_checked().is_none());

        assert!(b.classify("<ObtainTicketResponse><responseCode>OK</responseCode></ObtainTicketResponse>"));
        assert!(b.last_checked().is_some());
        assert_eq!(b.last_status(), "OK");
    }

    #[test]
    fn unreachable_keeps_previous_availability() {
        let b = backend("http://license.example");
        b.set_online(true);
        b.set_latency(Duration::from_millis(40));
        b.classify("<ObtainTicketResponse><responseCode>OK</responseCode></ObtainTicketResponse>");
        let checked = b.last_checked();

        b.mark_unreachable("connection refused");
        assert!(!b.is_online());
        assert!(b.available.load(Ordering::Relaxed));
        assert!(!b.is_available());
        assert_eq!(b.last_latency_ms(), UNMEASURED_LATENCY_MS);
        assert_eq!(b.last_checked(), checked);
        assert_eq!(b.last_status(), "connection error: connection refused");
    }

    #[test]
    fn ping_is_reported_only_when_online() {
        let b = backend("http://license.example");
        b.set_online(true);
        b.set_latency(Duration::from_millis(120));
        assert_eq!(b.status().ping, Some(120));

        b.set_online(false);
        assert_eq!(b.status().ping, None);
    }

    #[test]
    fn status_serializes_to_public_shape() {
        let b = backend("https://license.example/");
        let json = serde_json::to_value(b.status()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "url": "https://license.example/",
                "online": false,
                "available": false,
                "ping": null,
                "status": "not checked",
            })
        );
    }

    #[test]
    fn upstream_uri_keeps_scheme_and_port_but_not_base_path() {
        let b = backend("https://license.example:8443/base/");
        let uri = b.upstream_uri("/rpc/ping.action?salt=1").unwrap();
        assert_eq!(uri.to_string(), "https://license.example:8443/rpc/ping.action?salt=1");

        let b = backend("http://license.example");
        assert_eq!(b.upstream_uri("/").unwrap().to_string(), "http://license.example/");
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("content-type", HeaderValue::from_static("text/xml"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers["content-type"], "text/xml");
    }
}
