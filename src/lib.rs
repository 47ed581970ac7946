// src/lib.rs
//! Probes a pool of license servers and proxies client traffic to the
//! fastest one currently handing out tickets.
pub mod config;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod server;
