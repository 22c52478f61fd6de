//! HTTP and HTTPS serving on top of the shared listener

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use std::net::SocketAddr;
use tidemail_core::{AsyncStream, SessionHandler};
use tracing::debug;

/// Serves an axum router on every accepted connection
pub struct HttpHandler {
    router: Router,
}

impl HttpHandler {
    pub fn new(router: Router) -> Self {
        Self { router }
    }
}

#[async_trait]
impl SessionHandler for HttpHandler {
    async fn handle(&self, stream: Box<dyn AsyncStream>, peer: SocketAddr) -> Result<()> {
        debug!(peer = %peer, "HTTP connection");
        let service = TowerToHyperService::new(self.router.clone());
        Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(stream), service)
            .await
            .map_err(|e| anyhow!("HTTP connection error: {}", e))
    }
}
