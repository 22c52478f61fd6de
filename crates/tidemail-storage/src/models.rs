//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tidemail_common::types::{
    Attachment, Email, MailDirection, MessageId, MessageStatus, Participant, UserId, Verdict,
};
use tidemail_common::{Error, Result};

/// Row of the `email` table
#[derive(Debug, Clone, FromRow)]
pub struct EmailRow {
    pub id: MessageId,
    #[sqlx(rename = "type")]
    pub kind: i32,
    pub subject: String,
    pub reply_to: String,
    pub from_name: String,
    pub from_address: String,
    pub to_addresses: String,
    pub cc_addresses: String,
    pub bcc_addresses: String,
    pub text: String,
    pub html: String,
    pub sender: String,
    pub attachments: String,
    pub spf_check: i32,
    pub dkim_check: i32,
    pub status: i32,
    pub error: String,
    pub send_user_id: UserId,
    pub create_time: DateTime<Utc>,
}

impl EmailRow {
    /// Decode the JSON columns into a domain message
    pub fn into_email(self) -> Result<Email> {
        Ok(Email {
            id: self.id,
            direction: MailDirection::from_i32(self.kind),
            subject: self.subject,
            from: Participant::new(self.from_name, self.from_address),
            to: decode_json::<Vec<Participant>>(&self.to_addresses, "to_addresses")?,
            cc: decode_json::<Vec<Participant>>(&self.cc_addresses, "cc_addresses")?,
            bcc: decode_json::<Vec<Participant>>(&self.bcc_addresses, "bcc_addresses")?,
            reply_to: decode_json::<Vec<Participant>>(&self.reply_to, "reply_to")?,
            sender: decode_json::<Option<Participant>>(&self.sender, "sender")?,
            text: self.text,
            html: self.html,
            attachments: decode_json::<Vec<Attachment>>(&self.attachments, "attachments")?,
            read_receipt: Vec::new(),
            spf_check: Verdict::from_i32(self.spf_check),
            dkim_check: Verdict::from_i32(self.dkim_check),
            status: MessageStatus::from_i32(self.status),
            error: self.error,
            user_id: self.send_user_id,
            created_at: Some(self.create_time),
        })
    }
}

fn decode_json<T: serde::de::DeserializeOwned>(raw: &str, column: &str) -> Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| Error::Database(format!("Corrupt {} column: {}", column, e)))
}

pub(crate) fn encode_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(Error::from)
}

/// Row of the `user` table
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub account: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub is_admin: bool,
    pub disabled: bool,
}

/// Message size listing entry (POP3 `LIST`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow)]
pub struct MessageSize {
    pub id: MessageId,
    pub size: i64,
}

/// Mailbox totals (POP3 `STAT`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow)]
pub struct MailboxStat {
    pub num: i64,
    pub size: i64,
}

/// Delivery status of a single message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageStatusRecord {
    pub id: MessageId,
    pub status: MessageStatus,
    pub error: String,
}
