//! Common types for Tidemail

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for messages (database primary key)
pub type MessageId = i64;

/// Unique identifier for accounts
pub type UserId = i64;

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address from a string
    pub fn parse(s: &str) -> Option<Self> {
        let (local, domain) = s.trim().rsplit_once('@')?;
        if local.is_empty() || domain.is_empty() {
            return None;
        }
        Some(Self::new(local, domain.to_lowercase()))
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| crate::Error::Params("Invalid email address".to_string()))
    }
}

/// Strip a trailing `@domain` from a login name
pub fn local_part(login: &str) -> &str {
    match login.split_once('@') {
        Some((local, _)) => local,
        None => login,
    }
}

/// A named mail participant (sender or recipient)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "email")]
    pub address: String,
}

impl Participant {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// Domain part of the address, lowercased
    pub fn domain(&self) -> Option<String> {
        EmailAddress::parse(&self.address).map(|a| a.domain)
    }
}

/// Attachment carried by a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    #[serde(with = "base64_serde::bytes")]
    pub content: Vec<u8>,
}

/// Verification verdict attached to a message (SPF, DKIM)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
    #[default]
    Unknown,
}

impl Verdict {
    pub fn as_i32(self) -> i32 {
        match self {
            Verdict::Pass => 1,
            Verdict::Fail => 0,
            Verdict::Unknown => -1,
        }
    }

    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => Verdict::Pass,
            0 => Verdict::Fail,
            _ => Verdict::Unknown,
        }
    }
}

impl From<bool> for Verdict {
    fn from(ok: bool) -> Self {
        if ok {
            Verdict::Pass
        } else {
            Verdict::Fail
        }
    }
}

/// Direction of a stored message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailDirection {
    #[default]
    Inbound,
    Outbound,
}

impl MailDirection {
    pub fn as_i32(self) -> i32 {
        match self {
            MailDirection::Inbound => 0,
            MailDirection::Outbound => 1,
        }
    }

    pub fn from_i32(v: i32) -> Self {
        if v == 1 {
            MailDirection::Outbound
        } else {
            MailDirection::Inbound
        }
    }
}

/// Lifecycle status of a message
///
/// Outbound messages move `Queued -> Sent` or `Queued -> Failed` and never
/// leave a terminal state. Inbound messages are stored as `Received`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Queued,
    Sent,
    Failed,
    Received,
}

impl MessageStatus {
    pub fn as_i32(self) -> i32 {
        match self {
            MessageStatus::Queued => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Failed => 2,
            MessageStatus::Received => 3,
        }
    }

    pub fn from_i32(v: i32) -> Self {
        match v {
            1 => MessageStatus::Sent,
            2 => MessageStatus::Failed,
            3 => MessageStatus::Received,
            _ => MessageStatus::Queued,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, MessageStatus::Queued)
    }

    /// Whether moving from `self` to `next` is an allowed transition
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        matches!(
            (self, next),
            (MessageStatus::Queued, MessageStatus::Sent)
                | (MessageStatus::Queued, MessageStatus::Failed)
        )
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageStatus::Queued => "queued",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
            MessageStatus::Received => "received",
        };
        f.write_str(s)
    }
}

/// A mail message as it flows through the pipelines and the plugin envelope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Email {
    /// Zero until the message has been persisted
    #[serde(default)]
    pub id: MessageId,
    #[serde(default)]
    pub direction: MailDirection,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub from: Participant,
    #[serde(default)]
    pub to: Vec<Participant>,
    #[serde(default)]
    pub cc: Vec<Participant>,
    #[serde(default)]
    pub bcc: Vec<Participant>,
    #[serde(default)]
    pub reply_to: Vec<Participant>,
    /// Envelope sender override
    #[serde(default)]
    pub sender: Option<Participant>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub read_receipt: Vec<String>,
    #[serde(default)]
    pub spf_check: Verdict,
    #[serde(default)]
    pub dkim_check: Verdict,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub user_id: UserId,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Email {
    /// Every recipient across To, Cc and Bcc
    pub fn all_recipients(&self) -> impl Iterator<Item = &Participant> {
        self.to.iter().chain(self.cc.iter()).chain(self.bcc.iter())
    }

    /// Size used for POP3 listings: text plus HTML body length
    pub fn body_size(&self) -> i64 {
        (self.text.len() + self.html.len()) as i64
    }
}

/// Request-scoped context threaded through pipelines and sent to plugins
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Correlation id used in every log line of the request
    #[serde(default)]
    pub log_id: String,
    #[serde(default)]
    pub user_id: UserId,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub user_account: String,
    #[serde(default)]
    pub lang: String,
}

impl RequestContext {
    /// Create a context with a fresh log id
    pub fn new() -> Self {
        Self {
            log_id: new_log_id(),
            ..Default::default()
        }
    }

    /// Bind an authenticated account
    pub fn with_user(
        mut self,
        id: UserId,
        name: impl Into<String>,
        account: impl Into<String>,
    ) -> Self {
        self.user_id = id;
        self.user_name = name.into();
        self.user_account = account.into();
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id > 0
    }
}

/// Generate a correlation id for log lines
pub fn new_log_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Serde helpers encoding raw bytes as base64 strings in JSON
pub mod base64_serde {
    pub mod bytes {
        use base64::Engine;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
            s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(v))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
            let s = String::deserialize(d)?;
            base64::engine::general_purpose::STANDARD
                .decode(s.as_bytes())
                .map_err(serde::de::Error::custom)
        }
    }

    pub mod option {
        use base64::Engine;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
            match v {
                Some(bytes) => {
                    s.serialize_some(&base64::engine::general_purpose::STANDARD.encode(bytes))
                }
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
            let s: Option<String> = Option::deserialize(d)?;
            s.map(|s| {
                base64::engine::general_purpose::STANDARD
                    .decode(s.as_bytes())
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
        }
    }
}
