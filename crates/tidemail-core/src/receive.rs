//! Inbound receive pipeline

use crate::plugins::HookRegistry;
use mail_parser::{Address as ParsedAddress, MessageParser, MimeHeaders, PartType};
use std::sync::Arc;
use thiserror::Error;
use tidemail_common::types::{
    Attachment, Email, MailDirection, MessageId, MessageStatus, Participant, RequestContext,
    Verdict,
};
use tidemail_storage::MessageRepository;
use tracing::{info, warn};

/// Receive failure, mapped to an SMTP reply by the session
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("message could not be parsed")]
    Parse,
    #[error("message could not be stored: {0}")]
    Store(#[from] tidemail_common::Error),
}

impl ReceiveError {
    /// SMTP reply code for this failure
    pub fn smtp_code(&self) -> u16 {
        match self {
            ReceiveError::Parse => 554,
            ReceiveError::Store(_) => 451,
        }
    }
}

fn participants(address: Option<&ParsedAddress<'_>>) -> Vec<Participant> {
    let addrs: Vec<&mail_parser::Addr<'_>> = match address {
        Some(ParsedAddress::List(list)) => list.iter().collect(),
        Some(ParsedAddress::Group(groups)) => {
            groups.iter().flat_map(|g| g.addresses.iter()).collect()
        }
        None => Vec::new(),
    };

    addrs
        .into_iter()
        .filter_map(|a| {
            let address = a.address.as_deref()?;
            Some(Participant::new(a.name.as_deref().unwrap_or_default(), address))
        })
        .collect()
}

/// Parse raw RFC 5322 bytes into an inbound message
pub fn parse_message(raw: &[u8]) -> Option<Email> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return None;
    }
    let message = MessageParser::default().parse(raw)?;

    let text = message
        .text_bodies()
        .find_map(|p| match &p.body {
            PartType::Text(t) => Some(t.to_string()),
            _ => None,
        })
        .unwrap_or_default();
    let html = message
        .html_bodies()
        .find_map(|p| match &p.body {
            PartType::Html(h) => Some(h.to_string()),
            _ => None,
        })
        .unwrap_or_default();

    let attachments = message
        .attachments()
        .map(|part| Attachment {
            filename: part.attachment_name().unwrap_or("attachment").to_string(),
            content_type: part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            content: part.contents().to_vec(),
        })
        .collect();

    let created_at = message
        .date()
        .and_then(|d| chrono::DateTime::from_timestamp(d.to_timestamp(), 0));

    Some(Email {
        direction: MailDirection::Inbound,
        subject: message.subject().unwrap_or_default().to_string(),
        from: participants(message.from()).into_iter().next().unwrap_or_default(),
        to: participants(message.to()),
        cc: participants(message.cc()),
        bcc: participants(message.bcc()),
        reply_to: participants(message.reply_to()),
        sender: participants(message.sender()).into_iter().next(),
        text,
        html,
        attachments,
        spf_check: Verdict::Unknown,
        dkim_check: Verdict::Unknown,
        status: MessageStatus::Received,
        created_at,
        ..Default::default()
    })
}

/// `ReceiveParseBefore -> parse -> ReceiveParseAfter -> persist -> ReceiveSaveAfter`
#[derive(Clone)]
pub struct ReceivePipeline {
    messages: Arc<dyn MessageRepository>,
    hooks: Arc<HookRegistry>,
}

impl ReceivePipeline {
    pub fn new(messages: Arc<dyn MessageRepository>, hooks: Arc<HookRegistry>) -> Self {
        Self { messages, hooks }
    }

    pub async fn receive(
        &self,
        ctx: RequestContext,
        raw: Vec<u8>,
    ) -> Result<MessageId, ReceiveError> {
        let (ctx, raw) = self.hooks.receive_parse_before(ctx, raw).await;

        let email = parse_message(&raw).ok_or_else(|| {
            warn!(log_id = %ctx.log_id, size = raw.len(), "Inbound message could not be parsed");
            ReceiveError::Parse
        })?;

        let (ctx, mut email) = self.hooks.receive_parse_after(ctx, email).await;
        email.id = 0;
        email.direction = MailDirection::Inbound;
        email.status = MessageStatus::Received;
        if email.created_at.is_none() {
            email.created_at = Some(chrono::Utc::now());
        }

        let id = self.messages.insert(&email).await.map_err(|e| {
            warn!(log_id = %ctx.log_id, "Failed to store inbound message: {}", e);
            ReceiveError::Store(e)
        })?;
        email.id = id;

        info!(
            log_id = %ctx.log_id,
            message_id = id,
            from = %email.from.address,
            "Inbound message stored"
        );

        self.hooks.receive_save_after(ctx, email).await;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{HookEnvelope, HookPoint, HookTransport, PluginChannel, PluginResult};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tidemail_storage::{DatabasePool, DbMessageRepository};

    const RAW: &[u8] = b"From: Alice <alice@remote.test>\r\n\
To: bob@example.com\r\n\
Subject: Lunch\r\n\
Content-Type: text/plain\r\n\
\r\n\
Noon at the usual place.\r\n";

    async fn repo() -> Arc<DbMessageRepository> {
        let db = DatabasePool::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        Arc::new(DbMessageRepository::new(db))
    }

    /// Rewrites the subject after parsing
    struct SubjectPrefixer;

    #[async_trait]
    impl HookTransport for SubjectPrefixer {
        async fn call(&self, hook: HookPoint, body: Vec<u8>) -> PluginResult<Vec<u8>> {
            let mut env: HookEnvelope = serde_json::from_slice(&body).unwrap();
            if hook == HookPoint::ReceiveParseAfter {
                if let Some(email) = env.email.as_mut() {
                    email.subject = format!("[ext] {}", email.subject);
                }
            }
            Ok(serde_json::to_vec(&env).unwrap())
        }
    }

    #[test]
    fn test_parse_message() {
        let email = parse_message(RAW).unwrap();
        assert_eq!(email.subject, "Lunch");
        assert_eq!(email.from, Participant::new("Alice", "alice@remote.test"));
        assert_eq!(email.to, vec![Participant::new("", "bob@example.com")]);
        assert_eq!(email.text.trim(), "Noon at the usual place.");
        assert!(email.html.is_empty());
        assert_eq!(email.direction, MailDirection::Inbound);
    }

    #[test]
    fn test_parse_message_attachment() {
        let raw = b"From: Alice <alice@remote.test>\r\n\
To: bob@example.com\r\n\
Subject: Report\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"sep\"\r\n\
\r\n\
--sep\r\n\
Content-Type: text/plain\r\n\
\r\n\
See attached.\r\n\
--sep\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
aGVsbG8=\r\n\
--sep--\r\n";

        let email = parse_message(raw).unwrap();
        assert_eq!(email.text.trim(), "See attached.");
        assert_eq!(email.attachments.len(), 1);
        assert_eq!(email.attachments[0].filename, "report.pdf");
        assert_eq!(email.attachments[0].content_type, "application/pdf");
        assert_eq!(email.attachments[0].content, b"hello");
    }

    #[tokio::test]
    async fn test_receive_persists_inbound() {
        let repo = repo().await;
        let hooks = HookRegistry::with_channels(vec![PluginChannel::new(
            "prefix",
            "/tmp/prefix.socket",
            Arc::new(SubjectPrefixer),
            Duration::from_secs(10),
        )]);
        let pipeline = ReceivePipeline::new(repo.clone(), hooks);

        let id = pipeline.receive(RequestContext::new(), RAW.to_vec()).await.unwrap();
        let stored = repo.get(id).await.unwrap().unwrap();
        assert_eq!(stored.subject, "[ext] Lunch");
        assert_eq!(stored.status, MessageStatus::Received);
        assert_eq!(stored.direction, MailDirection::Inbound);
    }

    #[tokio::test]
    async fn test_unparseable_message() {
        let pipeline = ReceivePipeline::new(repo().await, HookRegistry::empty());
        let err = pipeline.receive(RequestContext::new(), Vec::new()).await.unwrap_err();
        assert_eq!(err.smtp_code(), 554);
    }
}
