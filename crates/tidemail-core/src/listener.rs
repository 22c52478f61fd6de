//! TCP accept loop shared by every protocol listener

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Plain or TLS connection stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Protocol side of a listener: serves one accepted connection
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: Box<dyn AsyncStream>, peer: SocketAddr) -> anyhow::Result<()>;
}

/// A running listener
pub struct ListenerHandle {
    name: String,
    local_addr: SocketAddr,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting; sessions already accepted keep running
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            error!(listener = %self.name, "Listener task failed: {}", e);
        }
        info!(listener = %self.name, "Listener stopped");
    }
}

/// Bind `addr` and serve every connection on its own task
pub async fn spawn_listener(
    name: &str,
    addr: &str,
    tls: Option<TlsAcceptor>,
    handler: Arc<dyn SessionHandler>,
) -> std::io::Result<ListenerHandle> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let token = CancellationToken::new();

    info!(
        listener = %name,
        addr = %local_addr,
        tls = tls.is_some(),
        "Listener started"
    );

    let task = tokio::spawn(accept_loop(
        name.to_string(),
        listener,
        tls,
        handler,
        token.clone(),
    ));

    Ok(ListenerHandle {
        name: name.to_string(),
        local_addr,
        token,
        task,
    })
}

async fn accept_loop(
    name: String,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    handler: Arc<dyn SessionHandler>,
    token: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                error!(listener = %name, "Failed to accept connection: {}", e);
                continue;
            }
        };
        debug!(listener = %name, peer = %peer, "Connection accepted");

        let handler = handler.clone();
        let tls = tls.clone();
        let name = name.clone();
        tokio::spawn(async move {
            let stream: Box<dyn AsyncStream> = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => Box::new(stream),
                    Err(e) => {
                        warn!(listener = %name, peer = %peer, "TLS handshake failed: {}", e);
                        return;
                    }
                },
                None => Box::new(stream),
            };

            if let Err(e) = handler.handle(stream, peer).await {
                warn!(listener = %name, peer = %peer, "Session error: {}", e);
            }
        });
    }
}
