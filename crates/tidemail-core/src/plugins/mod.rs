//! Plugin System
//!
//! Out-of-process plugins: each executable in the plugin directory is spawned
//! with a private Unix socket path and answers one HTTP `POST` per hook point.

mod channel;
mod registry;
mod types;

pub use channel::{HookTransport, PluginChannel, UnixSocketTransport};
pub use registry::{HookRegistry, RegistryConfig};
pub use types::{HookEnvelope, HookPoint, HookReply, PluginError, PluginResult};
