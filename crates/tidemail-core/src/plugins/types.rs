//! Plugin Types
//!
//! Hook points, the invocation envelope and the plugin error type.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tidemail_common::types::{base64_serde, Email, RequestContext};

/// Plugin error types
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Plugin spawn failed: {0}")]
    Spawn(String),
    #[error("Plugin endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("Plugin communication error: {0}")]
    Transport(String),
    #[error("Plugin returned HTTP status {0}")]
    Status(u16),
    #[error("Plugin timeout after {0}s")]
    Timeout(u64),
    #[error("Plugin payload encoding error: {0}")]
    Encode(String),
    #[error("Plugin response decoding error: {0}")]
    Decode(String),
}

/// Plugin result type
pub type PluginResult<T> = Result<T, PluginError>;

impl From<PluginError> for tidemail_common::Error {
    fn from(e: PluginError) -> Self {
        tidemail_common::Error::Plugin(e.to_string())
    }
}

/// Named extension points in the mail pipelines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookPoint {
    /// Raw inbound bytes, before parsing
    ReceiveParseBefore,
    /// Parsed inbound message, before persisting
    ReceiveParseAfter,
    /// Persisted inbound message
    ReceiveSaveAfter,
    /// Outbound message, before delivery
    SendBefore,
    /// Outbound message and per-domain delivery errors
    SendAfter,
}

impl HookPoint {
    pub const ALL: [HookPoint; 5] = [
        HookPoint::ReceiveParseBefore,
        HookPoint::ReceiveParseAfter,
        HookPoint::ReceiveSaveAfter,
        HookPoint::SendBefore,
        HookPoint::SendAfter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::ReceiveParseBefore => "ReceiveParseBefore",
            HookPoint::ReceiveParseAfter => "ReceiveParseAfter",
            HookPoint::ReceiveSaveAfter => "ReceiveSaveAfter",
            HookPoint::SendBefore => "SendBefore",
            HookPoint::SendAfter => "SendAfter",
        }
    }

    /// Request path on the plugin endpoint
    pub fn path(&self) -> String {
        format!("/{}", self.as_str())
    }

    /// Whether plugin responses at this point feed the pipeline
    pub fn is_observe_only(&self) -> bool {
        matches!(self, HookPoint::SendAfter | HookPoint::ReceiveSaveAfter)
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON document exchanged with a plugin on every hook call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookEnvelope {
    #[serde(default)]
    pub ctx: RequestContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<Email>,
    #[serde(default, with = "base64_serde::option", skip_serializing_if = "Option::is_none")]
    pub email_byte: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_map: Option<HashMap<String, String>>,
}

impl HookEnvelope {
    pub fn with_email(ctx: RequestContext, email: Email) -> Self {
        Self {
            ctx,
            email: Some(email),
            ..Default::default()
        }
    }

    pub fn with_bytes(ctx: RequestContext, raw: Vec<u8>) -> Self {
        Self {
            ctx,
            email_byte: Some(raw),
            ..Default::default()
        }
    }

    /// Adopt a plugin reply, keeping every slot the reply left out
    pub fn merge(self, reply: HookReply) -> Self {
        Self {
            ctx: reply.ctx.unwrap_or(self.ctx),
            email: reply.email.or(self.email),
            email_byte: reply.email_byte.or(self.email_byte),
            err_map: reply.err_map.or(self.err_map),
        }
    }
}

/// Plugin response body; absent fields leave the envelope untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HookReply {
    #[serde(default)]
    pub ctx: Option<RequestContext>,
    #[serde(default)]
    pub email: Option<Email>,
    #[serde(default, with = "base64_serde::option")]
    pub email_byte: Option<Vec<u8>>,
    #[serde(default)]
    pub err_map: Option<HashMap<String, String>>,
}
