//! Tidemail Core - mail pipelines, protocol listeners and the plugin system
//!
//! This crate provides the send and receive pipelines, the SMTP and POP3
//! session handlers, outbound delivery, and the out-of-process hook plugins.

pub mod delivery;
pub mod fanout;
pub mod listener;
pub mod plugins;
pub mod pop3;
pub mod receive;
pub mod render;
pub mod send;
pub mod smtp;
pub mod tls;

pub use delivery::{DeliveryError, DeliveryReport, DeliveryTransport, SmtpDelivery};
pub use fanout::FanOut;
pub use listener::{spawn_listener, AsyncStream, ListenerHandle, SessionHandler};
pub use plugins::{
    HookEnvelope, HookPoint, HookRegistry, HookReply, PluginChannel, PluginError, RegistryConfig,
};
pub use pop3::{Pop3Backend, Pop3Handler};
pub use receive::{ReceiveError, ReceivePipeline};
pub use send::{AttachmentInput, SendPipeline, SendReceipt, SendRequest};
pub use smtp::SmtpHandler;
pub use tls::{load_acceptor, ChallengeStore};
