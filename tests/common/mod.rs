//! Shared helpers for integration tests.
#![allow(dead_code)]

use license_proxy::config::ProbeConfig;
use license_proxy::proxy::BackendPool;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use url::Url;

pub const OK_TICKET: &str = "<!-- SHA1withRSA-00ff -->\n<ObtainTicketResponse>\
    <message></message><prolongationPeriod>607875500</prolongationPeriod>\
    <responseCode>OK</responseCode></ObtainTicketResponse>";

pub const NO_LICENSE: &str = "<ObtainTicketResponse><responseCode>ERROR_DETAILS</responseCode>\
    <message>No license</message></ObtainTicketResponse>";

/// A license server that answers every request with `body` and can be
/// stopped, after which connections are refused.
pub struct StoppableServer {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl StoppableServer {
    pub async fn start(status: u16, body: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let task = tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {status} X\r\nContent-Type: text/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { addr, task }
    }

    pub fn url(&self) -> Url {
        Url::parse(&format!("http://{}/", self.addr)).unwrap()
    }

    /// Closes the listening socket.
    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

pub fn pool(urls: Vec<Url>) -> Arc<BackendPool> {
    Arc::new(BackendPool::new(urls, Duration::from_secs(600), ProbeConfig::default()).unwrap())
}

/// An address nothing listens on.
pub async fn refused_url() -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Url::parse(&format!("http://{addr}/")).unwrap()
}
