// ────────────────────────────────
// src/server/listener.rs
// Low-level TCP bind for the front door and the metrics endpoint.
// ────────────────────────────────
use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::net::TcpListener;

pub async fn bind_tcp(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))
}
