//! SMTP session handler

use crate::listener::{AsyncStream, SessionHandler};
use crate::receive::ReceivePipeline;
use anyhow::Result;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tidemail_common::types::{EmailAddress, RequestContext};
use tidemail_common::Config;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, FramedRead};
use tracing::{debug, info, warn};

/// Longest command or text line accepted, terminator included
const MAX_LINE_LENGTH: usize = 8192;

type LineResult = Result<<AnyDelimiterCodec as Decoder>::Item, AnyDelimiterCodecError>;

fn line_codec() -> AnyDelimiterCodec {
    AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\r\n".to_vec(), MAX_LINE_LENGTH)
}

/// Line content without its `\r`
fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// SMTP session state
#[derive(Debug, Clone, Copy, PartialEq)]
enum SessionState {
    Connected,
    Greeted,
    MailFrom,
    RcptTo,
}

#[derive(Debug, Default)]
struct Envelope {
    from: Option<EmailAddress>,
    to: Vec<EmailAddress>,
}

impl Envelope {
    fn clear(&mut self) {
        self.from = None;
        self.to.clear();
    }
}

enum DataError {
    TooLarge,
    LineTooLong,
    Closed,
}

/// Inbound SMTP for the configured local domains
pub struct SmtpHandler {
    config: Arc<Config>,
    pipeline: ReceivePipeline,
}

impl SmtpHandler {
    pub fn new(config: Arc<Config>, pipeline: ReceivePipeline) -> Self {
        Self { config, pipeline }
    }

    fn hostname(&self) -> &str {
        if self.config.domain.is_empty() {
            "localhost"
        } else {
            &self.config.domain
        }
    }

    async fn session<R, W>(
        &self,
        reader: R,
        writer: &mut BufWriter<W>,
        peer: SocketAddr,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut lines = FramedRead::new(reader, line_codec());
        let ctx = RequestContext::new();
        let timeout = Duration::from_secs(self.config.smtp.timeout_secs);
        let mut state = SessionState::Connected;
        let mut envelope = Envelope::default();

        info!(log_id = %ctx.log_id, peer = %peer, "SMTP connection");
        reply(writer, 220, &format!("{} ESMTP Tidemail", self.hostname())).await?;

        loop {
            let chunk = match tokio::time::timeout(timeout, lines.next()).await {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded))) => {
                    warn!(log_id = %ctx.log_id, peer = %peer, "SMTP command line too long");
                    reply(writer, 500, "5.5.2 Line too long").await?;
                    break;
                }
                Ok(Some(Err(AnyDelimiterCodecError::Io(e)))) => return Err(e.into()),
                Ok(None) => {
                    debug!(log_id = %ctx.log_id, "SMTP client disconnected");
                    break;
                }
                Err(_) => {
                    reply(writer, 421, "4.4.2 Idle timeout").await?;
                    break;
                }
            };

            let line = String::from_utf8_lossy(strip_cr(&chunk));
            let (command, args) = parse_command(line.trim());
            match command.to_uppercase().as_str() {
                "HELO" => {
                    state = SessionState::Greeted;
                    envelope.clear();
                    reply(writer, 250, &format!("{} Hello {}", self.hostname(), args)).await?;
                }
                "EHLO" => {
                    state = SessionState::Greeted;
                    envelope.clear();
                    let lines = [
                        format!("{} Hello {}", self.hostname(), args),
                        format!("SIZE {}", self.config.smtp.max_message_size),
                        "8BITMIME".to_string(),
                        "ENHANCEDSTATUSCODES".to_string(),
                    ];
                    reply_multi(writer, 250, &lines).await?;
                }
                "MAIL" => {
                    if state != SessionState::Greeted {
                        reply(writer, 503, "5.5.1 Bad sequence of commands").await?;
                        continue;
                    }
                    match parse_mail_from(args) {
                        Some(from) => {
                            envelope.from = from;
                            state = SessionState::MailFrom;
                            reply(writer, 250, "2.1.0 OK").await?;
                        }
                        None => reply(writer, 501, "5.1.7 Bad sender address syntax").await?,
                    }
                }
                "RCPT" => {
                    if state != SessionState::MailFrom && state != SessionState::RcptTo {
                        reply(writer, 503, "5.5.1 Bad sequence of commands").await?;
                        continue;
                    }
                    let Some(to) = parse_rcpt_to(args) else {
                        reply(writer, 501, "5.1.3 Bad recipient address syntax").await?;
                        continue;
                    };
                    if !self.config.is_local_domain(&to.domain) {
                        reply(writer, 550, "5.7.1 Relaying denied").await?;
                    } else if envelope.to.len() >= self.config.smtp.max_recipients {
                        reply(writer, 452, "4.5.3 Too many recipients").await?;
                    } else {
                        envelope.to.push(to);
                        state = SessionState::RcptTo;
                        reply(writer, 250, "2.1.5 OK").await?;
                    }
                }
                "DATA" => {
                    if state != SessionState::RcptTo {
                        reply(writer, 503, "5.5.1 Bad sequence of commands").await?;
                        continue;
                    }
                    reply(writer, 354, "Start mail input; end with <CRLF>.<CRLF>").await?;

                    match read_data(&mut lines, self.config.smtp.max_message_size).await {
                        Ok(data) => {
                            match self.pipeline.receive(ctx.clone(), data).await {
                                Ok(id) => {
                                    let sender = envelope
                                        .from
                                        .as_ref()
                                        .map(ToString::to_string)
                                        .unwrap_or_default();
                                    info!(
                                        log_id = %ctx.log_id,
                                        message_id = id,
                                        sender = %sender,
                                        recipients = envelope.to.len(),
                                        "Message accepted"
                                    );
                                    let text = format!("2.0.0 OK: queued as {}", id);
                                    reply(writer, 250, &text).await?;
                                }
                                Err(e) => {
                                    let code = e.smtp_code();
                                    let text = if code == 554 {
                                        "5.6.0 Message could not be parsed"
                                    } else {
                                        "4.3.0 Temporary error"
                                    };
                                    reply(writer, code, text).await?;
                                }
                            }
                        }
                        Err(DataError::TooLarge) => {
                            warn!(log_id = %ctx.log_id, "Message exceeds size limit");
                            reply(writer, 552, "5.3.4 Message size exceeds limit").await?;
                        }
                        Err(DataError::LineTooLong) => {
                            warn!(log_id = %ctx.log_id, "Message line exceeds length limit");
                            reply(writer, 500, "5.5.2 Line too long").await?;
                            break;
                        }
                        Err(DataError::Closed) => {
                            debug!(log_id = %ctx.log_id, "Connection closed during DATA");
                            break;
                        }
                    }

                    state = SessionState::Greeted;
                    envelope.clear();
                }
                "RSET" => {
                    envelope.clear();
                    if state != SessionState::Connected {
                        state = SessionState::Greeted;
                    }
                    reply(writer, 250, "2.0.0 OK").await?;
                }
                "NOOP" => reply(writer, 250, "2.0.0 OK").await?,
                "VRFY" => reply(writer, 252, "2.5.2 Cannot VRFY user").await?,
                "QUIT" => {
                    reply(writer, 221, "2.0.0 Bye").await?;
                    break;
                }
                _ => reply(writer, 500, "5.5.2 Command not recognized").await?,
            }
        }

        Ok(())
    }
}

#[async_trait]
impl SessionHandler for SmtpHandler {
    async fn handle(&self, stream: Box<dyn AsyncStream>, peer: SocketAddr) -> Result<()> {
        let (reader, writer) = tokio::io::split(stream);
        let mut writer = BufWriter::new(writer);
        self.session(reader, &mut writer, peer).await
    }
}

async fn reply<W>(writer: &mut BufWriter<W>, code: u16, message: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(format!("{} {}\r\n", code, message).as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn reply_multi<W>(writer: &mut BufWriter<W>, code: u16, lines: &[String]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    for (i, line) in lines.iter().enumerate() {
        let sep = if i + 1 == lines.len() { ' ' } else { '-' };
        writer.write_all(format!("{}{}{}\r\n", code, sep, line).as_bytes()).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read DATA until `<CRLF>.<CRLF>`, removing dot-stuffing.
///
/// An oversized message is drained to the terminator before reporting.
/// Lines are stored with CRLF endings.
async fn read_data<S>(lines: &mut S, max_size: usize) -> Result<Vec<u8>, DataError>
where
    S: Stream<Item = LineResult> + Unpin,
{
    let mut data = Vec::new();
    let mut too_large = false;

    loop {
        let chunk = match lines.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                return Err(DataError::LineTooLong)
            }
            Some(Err(AnyDelimiterCodecError::Io(_))) | None => return Err(DataError::Closed),
        };
        let line = strip_cr(&chunk);
        if line == b"." {
            break;
        }
        if too_large {
            continue;
        }

        let content = if line.starts_with(b"..") { &line[1..] } else { line };
        data.extend_from_slice(content);
        data.extend_from_slice(b"\r\n");
        if data.len() > max_size {
            too_large = true;
            data.clear();
        }
    }

    if too_large {
        Err(DataError::TooLarge)
    } else {
        Ok(data)
    }
}

fn parse_command(line: &str) -> (&str, &str) {
    match line.split_once(' ') {
        Some((cmd, args)) => (cmd, args.trim()),
        None => (line, ""),
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = prefix.len();
    if s.len() >= head && s.is_char_boundary(head) && s[..head].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

fn extract_path(addr_part: &str) -> Option<&str> {
    let addr_part = addr_part.trim();
    if let Some(rest) = addr_part.strip_prefix('<') {
        let end = rest.find('>')?;
        Some(&rest[..end])
    } else {
        addr_part.split_whitespace().next()
    }
}

/// Parse `FROM:<address>`; `Some(None)` is the null sender
fn parse_mail_from(args: &str) -> Option<Option<EmailAddress>> {
    let path = extract_path(strip_prefix_ci(args.trim(), "FROM:")?)?;
    if path.is_empty() {
        Some(None)
    } else {
        EmailAddress::parse(path).map(Some)
    }
}

/// Parse `TO:<address>`
fn parse_rcpt_to(args: &str) -> Option<EmailAddress> {
    EmailAddress::parse(extract_path(strip_prefix_ci(args.trim(), "TO:")?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::HookRegistry;
    use pretty_assertions::assert_eq;
    use tidemail_storage::{DatabasePool, DbMessageRepository, MessageRepository};
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_parse_mail_from() {
        assert_eq!(
            parse_mail_from("FROM:<user@example.com>"),
            Some(Some(EmailAddress::new("user", "example.com")))
        );
        assert_eq!(
            parse_mail_from("from: <user@example.com> SIZE=100"),
            Some(Some(EmailAddress::new("user", "example.com")))
        );
        assert_eq!(parse_mail_from("FROM:<>"), Some(None));
        assert_eq!(parse_mail_from("invalid"), None);
    }

    #[test]
    fn test_parse_rcpt_to() {
        assert_eq!(
            parse_rcpt_to("TO:<User@Example.COM>"),
            Some(EmailAddress::new("User", "example.com"))
        );
        assert_eq!(parse_rcpt_to("TO:<>"), None);
    }

    fn framed(input: &'static [u8]) -> FramedRead<&'static [u8], AnyDelimiterCodec> {
        FramedRead::new(input, line_codec())
    }

    #[tokio::test]
    async fn test_read_data_unstuffs() {
        let mut lines = framed(b"Subject: x\r\n\r\n..dot\r\nend\n.\r\nNOOP\r\n");
        let data = read_data(&mut lines, 1024).await.ok().unwrap();
        assert_eq!(data, b"Subject: x\r\n\r\n.dot\r\nend\r\n");
        assert_eq!(&lines.next().await.unwrap().unwrap()[..], b"NOOP\r");
    }

    #[tokio::test]
    async fn test_read_data_size_cap() {
        let mut lines = framed(b"0123456789\r\n0123456789\r\n.\r\nQUIT\r\n");
        assert!(matches!(read_data(&mut lines, 16).await, Err(DataError::TooLarge)));
        assert_eq!(&lines.next().await.unwrap().unwrap()[..], b"QUIT\r");
    }

    #[tokio::test]
    async fn test_read_data_keeps_eight_bit_bytes() {
        let mut lines = framed(b"caf\xe9\r\n.\r\n");
        let data = read_data(&mut lines, 1024).await.ok().unwrap();
        assert_eq!(data, b"caf\xe9\r\n");
    }

    async fn run(script: &[u8]) -> (String, Arc<DbMessageRepository>) {
        let db = DatabasePool::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let repo = Arc::new(DbMessageRepository::new(db));
        let config = Config {
            domain: "example.com".to_string(),
            domains: vec!["example.com".to_string()],
            ..Default::default()
        };
        let handler = SmtpHandler::new(
            Arc::new(config),
            ReceivePipeline::new(repo.clone(), HookRegistry::empty()),
        );

        let (client, server) = tokio::io::duplex(64 * 1024);
        let peer: SocketAddr = "127.0.0.1:2525".parse().unwrap();
        let task = tokio::spawn(async move { handler.handle(Box::new(server), peer).await });

        let (mut read_half, mut write_half) = tokio::io::split(client);
        write_half.write_all(script).await.unwrap();
        let mut out = String::new();
        read_half.read_to_string(&mut out).await.unwrap();
        task.await.unwrap().unwrap();
        (out, repo)
    }

    #[tokio::test]
    async fn test_session_accepts_local_mail() {
        let (out, repo) = run(b"EHLO client\r\n\
MAIL FROM:<alice@remote.test>\r\n\
RCPT TO:<bob@example.com>\r\n\
DATA\r\n\
From: alice@remote.test\r\n\
To: bob@example.com\r\n\
Subject: hi\r\n\
\r\n\
hello\r\n\
.\r\n\
QUIT\r\n")
        .await;

        assert!(out.starts_with("220 example.com ESMTP Tidemail\r\n"));
        assert!(out.contains("250-example.com Hello client\r\n"));
        assert!(out.contains("354 "));
        assert!(out.contains("250 2.0.0 OK: queued as "));
        assert!(out.ends_with("221 2.0.0 Bye\r\n"));
        assert_eq!(repo.stat().await.unwrap().num, 1);
    }

    #[tokio::test]
    async fn test_session_rejects_relay() {
        let (out, repo) = run(b"HELO client\r\n\
MAIL FROM:<alice@remote.test>\r\n\
RCPT TO:<carol@elsewhere.test>\r\n\
DATA\r\n\
QUIT\r\n")
        .await;

        assert!(out.contains("550 5.7.1 Relaying denied\r\n"));
        assert!(out.contains("503 5.5.1 Bad sequence of commands\r\n"));
        assert_eq!(repo.stat().await.unwrap().num, 0);
    }

    #[tokio::test]
    async fn test_session_requires_greeting() {
        let (out, _) = run(b"MAIL FROM:<a@b.test>\r\nQUIT\r\n").await;
        assert!(out.contains("503 "));
    }

    #[tokio::test]
    async fn test_session_rejects_overlong_line() {
        let mut script = b"EHLO client\r\nNOOP ".to_vec();
        script.extend(std::iter::repeat(b'x').take(MAX_LINE_LENGTH * 2));
        script.extend_from_slice(b"\r\nQUIT\r\n");

        let (out, _) = run(&script).await;
        assert!(out.ends_with("500 5.5.2 Line too long\r\n"));
        assert!(!out.contains("221 "));
    }
}
