//! Outbound send pipeline
//!
//! `validate -> persist -> detached { SendBefore -> deliver -> SendAfter -> reconcile }`.
//! The caller gets the persisted id as soon as the insert succeeds.

use crate::delivery::{DeliveryReport, DeliveryTransport};
use crate::plugins::HookRegistry;
use crate::render::render;
use base64::Engine;
use serde::Deserialize;
use std::sync::Arc;
use tidemail_common::types::{
    Attachment, Email, MailDirection, MessageId, MessageStatus, Participant, RequestContext, UserId,
    Verdict,
};
use tidemail_common::{Error, Result};
use tidemail_storage::MessageRepository;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Attachment as submitted by API clients
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttachmentInput {
    #[serde(default)]
    pub name: String,
    /// `data:<content-type>;base64,<payload>`
    #[serde(default)]
    pub data: String,
}

/// Outbound send request
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SendRequest {
    pub from: Participant,
    pub to: Vec<Participant>,
    pub cc: Vec<Participant>,
    pub bcc: Vec<Participant>,
    pub reply_to: Vec<Participant>,
    pub sender: Option<Participant>,
    pub subject: String,
    pub text: String,
    pub html: String,
    #[serde(rename = "attrs")]
    pub attachments: Vec<AttachmentInput>,
    pub read_receipt: Vec<String>,
}

impl SendRequest {
    /// Validate the request and build the outbound message
    pub fn into_email(self, primary_domain: &str, user_id: UserId) -> Result<Email> {
        let mut from = self.from;
        if from.address.is_empty() && !from.name.is_empty() {
            from.address = format!("{}@{}", from.name, primary_domain);
        }
        if from.address.is_empty() {
            return Err(Error::Params("sender is required".to_string()));
        }
        if self.subject.is_empty() {
            return Err(Error::Params("subject is required".to_string()));
        }
        if self.to.is_empty() {
            return Err(Error::Params("at least one recipient is required".to_string()));
        }

        let attachments = self
            .attachments
            .into_iter()
            .map(decode_attachment)
            .collect::<Result<Vec<_>>>()?;

        Ok(Email {
            direction: MailDirection::Outbound,
            subject: self.subject,
            from,
            to: self.to,
            cc: self.cc,
            bcc: self.bcc,
            reply_to: self.reply_to,
            sender: self.sender.filter(|s| !s.address.is_empty()),
            text: self.text,
            html: self.html,
            attachments,
            read_receipt: self.read_receipt,
            spf_check: Verdict::Pass,
            dkim_check: Verdict::Pass,
            status: MessageStatus::Queued,
            user_id,
            ..Default::default()
        })
    }
}

/// Decode a `data:<content-type>;base64,<payload>` attachment
pub fn decode_attachment(input: AttachmentInput) -> Result<Attachment> {
    let data = input.data.strip_prefix("data:").unwrap_or(&input.data);
    let (content_type, payload) = data
        .split_once(';')
        .ok_or_else(|| Error::Params(format!("attachment {} is malformed", input.name)))?;
    let payload = payload.strip_prefix("base64,").unwrap_or(payload);

    let content = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| {
            Error::Params(format!("attachment {} could not be decoded: {}", input.name, e))
        })?;

    Ok(Attachment {
        filename: input.name,
        content_type: content_type.to_string(),
        content,
    })
}

/// Handle to a submitted message
#[derive(Debug)]
pub struct SendReceipt {
    pub message_id: MessageId,
    /// Completion of delivery and reconciliation; dropping it detaches the task
    pub completion: JoinHandle<()>,
}

/// Outbound send pipeline
#[derive(Clone)]
pub struct SendPipeline {
    messages: Arc<dyn MessageRepository>,
    hooks: Arc<HookRegistry>,
    transport: Arc<dyn DeliveryTransport>,
    domain: String,
    tasks: TaskTracker,
}

impl SendPipeline {
    pub fn new(
        messages: Arc<dyn MessageRepository>,
        hooks: Arc<HookRegistry>,
        transport: Arc<dyn DeliveryTransport>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            messages,
            hooks,
            transport,
            domain: domain.into(),
            tasks: TaskTracker::new(),
        }
    }

    /// Wait for every background phase started so far to reconcile
    pub async fn drain(&self) {
        self.tasks.close();
        if !self.tasks.is_empty() {
            info!(pending = self.tasks.len(), "Waiting for in-flight sends");
        }
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Validate, persist and hand the request to the background phase
    pub async fn send(&self, ctx: RequestContext, request: SendRequest) -> Result<SendReceipt> {
        let email = request.into_email(&self.domain, ctx.user_id)?;
        self.submit(ctx, email).await
    }

    /// Persist an already validated message and start its background phase
    pub async fn submit(&self, ctx: RequestContext, mut email: Email) -> Result<SendReceipt> {
        email.id = 0;
        email.direction = MailDirection::Outbound;
        email.status = MessageStatus::Queued;
        email.created_at = Some(chrono::Utc::now());

        let id = self.messages.insert(&email).await.map_err(|e| {
            error!(log_id = %ctx.log_id, "Failed to persist outbound message: {}", e);
            e
        })?;
        email.id = id;

        info!(log_id = %ctx.log_id, message_id = id, "Outbound message queued");

        let pipeline = self.clone();
        let completion = self
            .tasks
            .spawn(async move { pipeline.complete(ctx, email).await });

        Ok(SendReceipt {
            message_id: id,
            completion,
        })
    }

    async fn complete(self, ctx: RequestContext, email: Email) {
        let id = email.id;

        debug!(log_id = %ctx.log_id, message_id = id, "Running SendBefore hooks");
        let (ctx, mut email) = self.hooks.send_before(ctx, email).await;
        if email.id != id {
            warn!(
                log_id = %ctx.log_id,
                message_id = id,
                returned = email.id,
                "Plugin changed the message id, restoring"
            );
            email.id = id;
        }

        let report = match render(&email, &self.domain) {
            Ok(raw) => self.transport.deliver(&email, &raw).await,
            Err(e) => {
                let mut report = DeliveryReport::default();
                report.record("render", e);
                report
            }
        };

        debug!(log_id = %ctx.log_id, message_id = id, "Running SendAfter hooks");
        self.hooks
            .send_after(ctx.clone(), email, report.errors.clone())
            .await;

        self.reconcile(&ctx, id, &report).await;
    }

    async fn reconcile(&self, ctx: &RequestContext, id: MessageId, report: &DeliveryReport) {
        let result = if report.is_success() {
            self.messages.mark_sent(id).await
        } else {
            let text = report.error_text();
            warn!(log_id = %ctx.log_id, message_id = id, error = %text, "Delivery failed");
            self.messages.mark_failed(id, &text).await
        };

        match result {
            Ok(true) => info!(
                log_id = %ctx.log_id,
                message_id = id,
                sent = report.is_success(),
                "Send status reconciled"
            ),
            Ok(false) => warn!(
                log_id = %ctx.log_id,
                message_id = id,
                "Message already in a terminal state"
            ),
            Err(e) => error!(
                log_id = %ctx.log_id,
                message_id = id,
                "Failed to record send status: {}",
                e
            ),
        }
    }
}
