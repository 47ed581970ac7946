// ────────────────────────────────
// src/server/builder.rs
// ────────────────────────────────
use crate::server::listener::bind_tcp;
use anyhow::{anyhow, Context, Result};
use hyper::server::conn::{AddrIncoming, AddrStream};
use hyper::service::make_service_fn;
use hyper::{Body, Request, Response, Server};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower::Service;

/// Builder pattern so `main.rs` can inject its front door (or any handler).
pub struct ServerBuilder<H>
where
    H: Service<Request<Body>, Response = Response<Body>> + Send + Clone + 'static,
    H::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H::Future: Send + 'static,
{
    addr: SocketAddr,
    listener: Option<TcpListener>,
    handler: Option<H>,
}

impl<H> ServerBuilder<H>
where
    H: Service<Request<Body>, Response = Response<Body>> + Send + Clone + 'static,
    H::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H::Future: Send + 'static,
{
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            listener: None,
            handler: None,
        }
    }

    /// Serve on a socket that is already bound.
    pub fn from_listener(listener: TcpListener) -> Result<Self> {
        let addr = listener.local_addr()?;
        Ok(Self {
            addr,
            listener: Some(listener),
            handler: None,
        })
    }

    pub fn with_handler(mut self, handler: H) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Serve until `signal` resolves, then stop accepting and let in-flight
    /// connections drain.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let handler = self
            .handler
            .ok_or_else(|| anyhow!("handler must be set via with_handler()"))?;

        let listener = match self.listener {
            Some(listener) => listener,
            None => bind_tcp(self.addr).await?,
        };
        let mut incoming = AddrIncoming::from_listener(listener)?;
        incoming.set_nodelay(true);
        tracing::info!("Listening on {}", self.addr);

        let make_service = make_service_fn(move |conn: &AddrStream| {
            tracing::trace!(peer = %conn.remote_addr(), "accepted connection");
            let svc = handler.clone();
            async move { Ok::<_, Infallible>(svc) }
        });

        Server::builder(incoming)
            .serve(make_service)
            .with_graceful_shutdown(signal)
            .await
            .context("HTTP server error")
    }
}
