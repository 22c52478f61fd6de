//! Plugin channel: one plugin endpoint and the RPC call made against it

use super::types::{HookEnvelope, HookPoint, HookReply, PluginError, PluginResult};
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::debug;

/// Byte-level request/response seam between a channel and its endpoint
#[async_trait]
pub trait HookTransport: Send + Sync {
    /// Send one encoded envelope for `hook` and return the encoded response
    async fn call(&self, hook: HookPoint, body: Vec<u8>) -> PluginResult<Vec<u8>>;
}

/// HTTP/1.1 over a Unix stream socket
#[derive(Debug, Clone)]
pub struct UnixSocketTransport {
    endpoint: PathBuf,
}

impl UnixSocketTransport {
    pub fn new(endpoint: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    /// Whether the endpoint currently accepts connections
    pub async fn is_reachable(&self) -> bool {
        UnixStream::connect(&self.endpoint).await.is_ok()
    }
}

#[async_trait]
impl HookTransport for UnixSocketTransport {
    async fn call(&self, hook: HookPoint, body: Vec<u8>) -> PluginResult<Vec<u8>> {
        let stream = UnixStream::connect(&self.endpoint)
            .await
            .map_err(|e| {
                PluginError::Transport(format!("connect {}: {}", self.endpoint.display(), e))
            })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| PluginError::Transport(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Plugin connection closed with error: {}", e);
            }
        });

        let request = Request::builder()
            .method(Method::POST)
            .uri(hook.path())
            .header(HOST, "localhost")
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| PluginError::Transport(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| PluginError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PluginError::Status(status.as_u16()));
        }

        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| PluginError::Transport(e.to_string()))?
            .to_bytes();

        Ok(bytes.to_vec())
    }
}

/// A registered plugin reachable through a transport
pub struct PluginChannel {
    name: String,
    endpoint: PathBuf,
    transport: Arc<dyn HookTransport>,
    timeout: Duration,
}

impl PluginChannel {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<PathBuf>,
        transport: Arc<dyn HookTransport>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            transport,
            timeout,
        }
    }

    /// Channel speaking HTTP over the given Unix socket
    pub fn unix(name: impl Into<String>, endpoint: impl Into<PathBuf>, timeout: Duration) -> Self {
        let endpoint = endpoint.into();
        let transport = Arc::new(UnixSocketTransport::new(endpoint.clone()));
        Self::new(name, endpoint, transport, timeout)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Call the plugin at a hook point, bounded by the per-call timeout
    pub async fn invoke(
        &self,
        hook: HookPoint,
        envelope: &HookEnvelope,
    ) -> PluginResult<HookReply> {
        let body = serde_json::to_vec(envelope).map_err(|e| PluginError::Encode(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.transport.call(hook, body))
            .await
            .map_err(|_| PluginError::Timeout(self.timeout.as_secs()))??;

        serde_json::from_slice(&response).map_err(|e| PluginError::Decode(e.to_string()))
    }
}

impl std::fmt::Debug for PluginChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginChannel")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::Response;
    use std::convert::Infallible;
    use tidemail_common::types::RequestContext;
    use tokio::net::UnixListener;

    /// Serve a single plugin endpoint that stamps the request path into the log id
    fn serve_echo(listener: UnixListener) {
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        let path = req.uri().path().to_string();
                        let body = req.into_body().collect().await.unwrap().to_bytes();
                        let mut env: HookEnvelope = serde_json::from_slice(&body).unwrap();
                        env.ctx.log_id = path;
                        let out = serde_json::to_vec(&env).unwrap();
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(out))))
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
    }

    #[tokio::test]
    async fn test_unix_socket_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = dir.path().join("echo.socket");
        serve_echo(UnixListener::bind(&endpoint).unwrap());

        let channel = PluginChannel::unix("echo", &endpoint, Duration::from_secs(5));
        let env = HookEnvelope::with_bytes(RequestContext::default(), b"data".to_vec());
        let out = channel.invoke(HookPoint::ReceiveParseBefore, &env).await.unwrap();

        assert_eq!(out.ctx.unwrap().log_id, "/ReceiveParseBefore");
        assert_eq!(out.email_byte.unwrap(), b"data".to_vec());
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let channel =
            PluginChannel::unix("ghost", dir.path().join("ghost.socket"), Duration::from_secs(1));
        let result = channel.invoke(HookPoint::SendBefore, &HookEnvelope::default()).await;
        assert!(matches!(result, Err(PluginError::Transport(_))));
    }

    struct Stalled;

    #[async_trait]
    impl HookTransport for Stalled {
        async fn call(&self, _hook: HookPoint, _body: Vec<u8>) -> PluginResult<Vec<u8>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout() {
        let channel =
            PluginChannel::new("slow", "/dev/null", Arc::new(Stalled), Duration::from_secs(10));
        let result = channel.invoke(HookPoint::SendAfter, &HookEnvelope::default()).await;
        assert!(matches!(result, Err(PluginError::Timeout(10))));
    }
}
