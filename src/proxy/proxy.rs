// ────────────────────────────────
// src/proxy/proxy.rs
// Front door: introspection routes, token gate, dispatch to the best backend
// ────────────────────────────────

use chrono::Utc;
use hyper::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Body, Request, Response, StatusCode, Uri};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, Instrument};
use uuid::Uuid;

use super::backend::{http_client, Backend, BackendError, BackendStatus, HttpClient};
use super::pool::BackendPool;
use crate::metrics::MetricsCollector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Root,
    AvailableJson,
    AvailableText,
    AllJson,
    AllText,
    Proxy,
}

impl Route {
    fn resolve(path: &str) -> Self {
        match path {
            "/" => Route::Root,
            "/servers/available.json" => Route::AvailableJson,
            "/servers/available.txt" => Route::AvailableText,
            "/servers/all.json" => Route::AllJson,
            "/servers/all.txt" => Route::AllText,
            _ => Route::Proxy,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Route::Root => "root",
            Route::AvailableJson | Route::AvailableText | Route::AllJson | Route::AllText => {
                "servers"
            }
            Route::Proxy => "proxy",
        }
    }
}

pub struct Proxy {
    pool: Arc<BackendPool>,
    tokens: HashSet<String>,
    client: HttpClient,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Proxy {
    pub fn new(
        pool: Arc<BackendPool>,
        tokens: Vec<String>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let tokens: HashSet<String> = tokens.into_iter().collect();
        info!(
            "Registered {} token{}",
            tokens.len(),
            if tokens.len() == 1 { "" } else { "s" }
        );

        Self {
            pool,
            tokens,
            client: http_client(),
            metrics,
        }
    }

    /// Handles one request, turning every failure into a response.
    pub async fn respond(&self, req: Request<Body>) -> Response<Body> {
        let route = Route::resolve(req.uri().path());
        let response = match self.handle(req).await {
            Ok(response) => response,
            Err(e @ ProxyError::NoAvailableBackends { .. }) => {
                debug!("no backend available");
                e.into()
            }
            Err(e @ ProxyError::NotFound) => e.into(),
            Err(e) => {
                error!(error = %e, "proxy error");
                e.into()
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_request(route.label(), response.status().as_u16());
        }
        response
    }

    pub async fn handle(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        match Route::resolve(req.uri().path()) {
            Route::Root => Ok(with_status(Body::empty(), StatusCode::NO_CONTENT)),
            Route::AvailableJson => json(&self.pool.available_ranked()),
            Route::AvailableText => Ok(text(&self.pool.available_ranked())),
            Route::AllJson => json(&self.pool.all_ranked()),
            Route::AllText => Ok(text(&self.pool.all_ranked())),
            Route::Proxy => self.forward(req).await,
        }
    }

    async fn forward(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let target = self.target_path(req.uri())?;

        let Some(backend) = self.pool.best() else {
            return Err(ProxyError::NoAvailableBackends {
                retry_after_secs: self.pool.retry_after_secs(Utc::now()),
            });
        };

        let span = tracing::info_span!(
            "proxy_request",
            request_id = %Uuid::new_v4(),
            method = %req.method(),
            path = %target
        );

        async {
            debug!(backend = %backend.endpoint(), "dispatching");
            let start = Instant::now();
            let result = backend.proxy(&self.client, req, &target).await;
            if let Some(metrics) = &self.metrics {
                metrics.record_upstream(backend.endpoint().as_str(), start.elapsed());
            }
            result.map_err(ProxyError::from)
        }
        .instrument(span)
        .await
    }

    /// The path to forward, with the access token segment removed when
    /// tokens are configured.
    fn target_path(&self, uri: &Uri) -> Result<String, ProxyError> {
        if self.tokens.is_empty() {
            return Ok(uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()));
        }

        let path = uri.path();
        let rest = path.strip_prefix('/').unwrap_or(path);
        let (token, remainder) = match rest.find('/') {
            Some(i) => rest.split_at(i),
            None => (rest, ""),
        };
        if token.is_empty() || !self.tokens.contains(token) {
            return Err(ProxyError::NotFound);
        }

        let mut target = if remainder.is_empty() {
            "/".to_string()
        } else {
            remainder.to_string()
        };
        if let Some(query) = uri.query() {
            target.push('?');
            target.push_str(query);
        }
        Ok(target)
    }
}

fn with_status(body: Body, status: StatusCode) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

fn plain(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = with_status(Body::from(message), status);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn json(backends: &[Arc<Backend>]) -> Result<Response<Body>, ProxyError> {
    let statuses: Vec<BackendStatus> = backends.iter().map(|b| b.status()).collect();
    let mut response = Response::new(Body::from(serde_json::to_vec(&statuses)?));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}

fn text(backends: &[Arc<Backend>]) -> Response<Body> {
    let lines: Vec<&str> = backends.iter().map(|b| b.endpoint().as_str()).collect();
    let mut response = Response::new(Body::from(lines.join("\n")));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

// Custom error type for proxy operations
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Not found")]
    NotFound,

    #[error("No servers available, retry in {retry_after_secs}s")]
    NoAvailableBackends { retry_after_secs: u64 },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("failed to encode response: {0}")]
    Serialize(#[from] serde_json::Error),
}

// Convert ProxyError to Hyper Response for error handling
impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::NotFound => plain(StatusCode::NOT_FOUND, "Not found"),
            ProxyError::NoAvailableBackends { retry_after_secs } => {
                let mut response =
                    plain(StatusCode::SERVICE_UNAVAILABLE, "No servers available");
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
                response
            }
            ProxyError::Backend(_) | ProxyError::Serialize(_) => {
                plain(StatusCode::INTERNAL_SERVER_ERROR, "Server error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeConfig;
    use std::time::Duration;
    use url::Url;

    fn proxy(servers: &[&str], tokens: &[&str]) -> Proxy {
        let urls = servers.iter().map(|s| Url::parse(s).unwrap()).collect();
        let pool = BackendPool::new(urls, Duration::from_secs(600), ProbeConfig::default()).unwrap();
        Proxy::new(
            Arc::new(pool),
            tokens.iter().map(|t| t.to_string()).collect(),
            None,
        )
    }

    fn get(path: &str) -> Request<Body> {
        Request::get(path).body(Body::empty()).unwrap()
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn routes_match_on_path_only() {
        assert_eq!(Route::resolve("/"), Route::Root);
        assert_eq!(Route::resolve("/servers/all.json"), Route::AllJson);
        assert_eq!(Route::resolve("/servers/available.txt"), Route::AvailableText);
        assert_eq!(Route::resolve("/servers/all.jsonx"), Route::Proxy);
        assert_eq!(Route::resolve("/abc/rpc/ping.action"), Route::Proxy);
    }

    #[tokio::test]
    async fn root_is_no_content() {
        let response = proxy(&["http://a.example"], &[]).respond(get("/")).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(body_string(response).await.is_empty());
    }

    #[tokio::test]
    async fn all_listing_includes_unprobed_backends() {
        let proxy = proxy(&["http://a.example", "http://b.example:8080"], &[]);

        let response = proxy.respond(get("/servers/all.txt")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
        assert_eq!(body_string(response).await, "http://a.example/\nhttp://b.example:8080/");

        let response = proxy.respond(get("/servers/all.json")).await;
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        let value: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(value.as_array().unwrap().len(), 2);
        assert_eq!(value[0]["ping"], serde_json::Value::Null);
        assert_eq!(value[0]["available"], false);
    }

    #[tokio::test]
    async fn available_listing_is_empty_before_sweep() {
        let proxy = proxy(&["http://a.example"], &[]);
        let response = proxy.respond(get("/servers/available.json")).await;
        assert_eq!(body_string(response).await, "[]");

        let response = proxy.respond(get("/servers/available.txt")).await;
        assert_eq!(body_string(response).await, "");
    }

    #[tokio::test]
    async fn no_backend_is_service_unavailable() {
        let response = proxy(&["http://a.example"], &[]).respond(get("/rpc/ping.action")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[RETRY_AFTER], "0");
        assert_eq!(body_string(response).await, "No servers available");
    }

    #[tokio::test]
    async fn token_gate() {
        let proxy = proxy(&["http://a.example"], &["abc"]);

        let response = proxy.respond(get("/abc/foo")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let retry: u64 = response.headers()[RETRY_AFTER].to_str().unwrap().parse().unwrap();
        assert_eq!(retry, 0);

        let response = proxy.respond(get("/xyz/foo")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_string(response).await, "Not found");

        let response = proxy.respond(get("//foo")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // introspection routes stay open
        let response = proxy.respond(get("/servers/all.txt")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn token_segment_is_stripped() {
        let proxy = proxy(&["http://a.example"], &["abc"]);
        let target = |uri: &str| proxy.target_path(&uri.parse::<Uri>().unwrap());

        assert_eq!(target("/abc/rpc/obtainTicket.action?x=1").unwrap(), "/rpc/obtainTicket.action?x=1");
        assert_eq!(target("/abc").unwrap(), "/");
        assert_eq!(target("/abc?x=1").unwrap(), "/?x=1");
        assert!(matches!(target("/abcd/foo"), Err(ProxyError::NotFound)));
        assert!(matches!(target("/"), Err(ProxyError::NotFound)));
    }

    #[test]
    fn path_is_kept_without_tokens() {
        let proxy = proxy(&["http://a.example"], &[]);
        let uri: Uri = "/abc/rpc/ping.action?salt=1".parse().unwrap();
        assert_eq!(proxy.target_path(&uri).unwrap(), "/abc/rpc/ping.action?salt=1");
    }

    #[tokio::test]
    async fn aborted_upload_is_server_error_and_backend_stays_online() {
        use tokio::io::AsyncReadExt;
        use tokio::net::TcpListener;

        // a backend that reads requests and never answers
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

        let url = format!("http://{addr}/");
        let proxy = proxy(&[url.as_str()], &[]);
        let backend = proxy.pool.backends()[0].clone();
        backend.set_online(true);
        backend.set_available(true);

        let (mut tx, body) = Body::channel();
        tx.send_data("ticketId=".into()).await.unwrap();
        tx.abort();
        let request = Request::post("/rpc/releaseTicket.action").body(body).unwrap();

        let response = proxy.respond(request).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_string(response).await, "Server error");
        assert!(backend.is_online());
        assert!(proxy.pool.best().is_some());
    }

    #[test]
    fn backend_failures_become_server_errors() {
        let response: Response<Body> =
            ProxyError::Backend(BackendError::InvalidTarget("nope".into())).into();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
    }
}
