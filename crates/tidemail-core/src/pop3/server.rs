//! POP3 connection handler

use super::command::Pop3Parser;
use super::response::Pop3Response;
use super::session::{Pop3Backend, Pop3Session};
use crate::listener::{AsyncStream, SessionHandler};
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

/// Longest command line accepted, terminator excluded
const MAX_LINE_LENGTH: usize = 512;

/// Serves POP3 on accepted connections (plain or TLS)
pub struct Pop3Handler {
    backend: Pop3Backend,
    server_name: String,
    timeout: Duration,
}

impl Pop3Handler {
    pub fn new(backend: Pop3Backend, server_name: impl Into<String>, timeout_minutes: u64) -> Self {
        Self {
            backend,
            server_name: server_name.into(),
            timeout: Duration::from_secs(timeout_minutes * 60),
        }
    }

    fn timestamp(&self) -> String {
        format!(
            "<{}.{}@{}>",
            std::process::id(),
            chrono::Utc::now().timestamp(),
            self.server_name
        )
    }
}

#[async_trait]
impl SessionHandler for Pop3Handler {
    async fn handle(&self, stream: Box<dyn AsyncStream>, peer: SocketAddr) -> Result<()> {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let mut session = Pop3Session::new(self.backend.clone(), self.timestamp());
        info!(log_id = %session.log_id(), peer = %peer, "POP3 connection");

        let greeting = Pop3Response::greeting(&self.server_name, session.timestamp());
        writer.write_all(greeting.as_bytes()).await?;
        writer.flush().await?;

        loop {
            match tokio::time::timeout(self.timeout, lines.next()).await {
                Ok(None) => {
                    debug!(log_id = %session.log_id(), "POP3 client disconnected");
                    break;
                }
                Ok(Some(Ok(line))) => {
                    let (reply, quit) = session.handle(Pop3Parser::parse(&line)).await;
                    writer.write_all(reply.as_bytes()).await?;
                    writer.flush().await?;
                    if quit {
                        break;
                    }
                }
                Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                    warn!(log_id = %session.log_id(), peer = %peer, "POP3 command line too long");
                    writer.write_all(Pop3Response::err("line too long").as_bytes()).await?;
                    writer.flush().await?;
                    break;
                }
                Ok(Some(Err(LinesCodecError::Io(e)))) => {
                    warn!(log_id = %session.log_id(), "POP3 read error: {}", e);
                    break;
                }
                Err(_) => {
                    warn!(log_id = %session.log_id(), peer = %peer, "POP3 session timeout");
                    writer.write_all(Pop3Response::err("session timeout").as_bytes()).await?;
                    writer.flush().await?;
                    break;
                }
            }
        }

        info!(log_id = %session.log_id(), "POP3 connection closed");
        Ok(())
    }
}
