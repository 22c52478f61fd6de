//! Shared handler state

use std::path::PathBuf;
use std::sync::Arc;
use tidemail_common::Config;
use tidemail_core::{ChallengeStore, SendPipeline};
use tidemail_storage::{MessageRepository, UserRepository};
use tokio::sync::{Mutex, Notify};

/// Signals the HTTP surface raises towards the supervisor
#[derive(Debug, Clone, Default)]
pub struct LifecycleSignals {
    /// Fired once the setup wizard wrote a complete configuration
    pub setup_finished: Arc<Notify>,
    /// Fired when a restart of every listener is requested
    pub restart: Arc<Notify>,
}

impl LifecycleSignals {
    pub fn new() -> Self {
        Self::default()
    }
}

/// State of a running server generation
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub send: SendPipeline,
    pub messages: Arc<dyn MessageRepository>,
    pub users: Arc<dyn UserRepository>,
    pub challenges: ChallengeStore,
    pub signals: LifecycleSignals,
}

/// State of the first-run setup wizard
///
/// The wizard edits a working copy of the configuration and writes it to
/// `config_path` after every `set` action.
pub struct SetupState {
    pub config_path: PathBuf,
    pub config: Mutex<Config>,
    pub challenges: ChallengeStore,
    pub signals: LifecycleSignals,
}

impl SetupState {
    pub fn new(
        config_path: PathBuf,
        config: Config,
        challenges: ChallengeStore,
        signals: LifecycleSignals,
    ) -> Self {
        Self {
            config_path,
            config: Mutex::new(config),
            challenges,
            signals,
        }
    }
}
