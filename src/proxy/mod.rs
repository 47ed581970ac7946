//
// src/proxy/mod.rs
//
mod backend;
mod pool;
mod proxy;
pub mod ticket;

pub use backend::{http_client, Backend, BackendError, BackendStatus, HttpClient, UNMEASURED_LATENCY_MS};
pub use pool::{BackendPool, SweepSummary};
pub use proxy::{Proxy, ProxyError};
