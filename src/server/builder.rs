// ────────────────────────────────
// src/server/builder.rs
// ────────────────────────────────
use crate::server::handler::RequestHandler;
use anyhow::{Context, Result};
use hyper::server::conn::Http;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;

/// Hard cap on draining in-flight connections at shutdown.
const DRAIN_CAP: Duration = Duration::from_secs(10);

pub struct ServerBuilder {
    addr: SocketAddr,
    handler: Option<RequestHandler>,
}

impl ServerBuilder {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: RequestHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Consume the builder, boot the TCP listener, spawn one Hyper task per
    /// connection. Accepting stops when the shutdown channel flips; open
    /// connections then get up to `DRAIN_CAP` to finish.
    pub async fn serve_until(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let handler = self.handler.expect("handler must be set via with_handler()");

        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("failed to bind {}", self.addr))?;
        tracing::info!("HTTP server listening on {}", self.addr);

        let open = Arc::new(AtomicUsize::new(0));
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted.context("accept failed")?;
                    let svc = handler.clone().with_peer(peer);
                    let open = open.clone();
                    open.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        let http = Http::new();
                        if let Err(err) = http.serve_connection(stream, svc).await {
                            tracing::debug!(%peer, %err, "connection error");
                        }
                        open.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let deadline = Instant::now() + DRAIN_CAP;
        while open.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let remaining = open.load(Ordering::SeqCst);
        if remaining > 0 {
            tracing::warn!("drain cap reached with {remaining} connection(s) still open");
        }
        Ok(())
    }
}
