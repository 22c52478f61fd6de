//! Hook registry
//!
//! Owns the plugin processes of one server generation and dispatches hook
//! calls to their channels. A failing plugin is logged and skipped; it never
//! aborts the calling pipeline.

use super::channel::{PluginChannel, UnixSocketTransport};
use super::types::{HookEnvelope, HookPoint, PluginError, PluginResult};
use crate::fanout::FanOut;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tidemail_common::config::PluginConfig;
use tidemail_common::types::{Email, RequestContext};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Registry settings derived from the plugin configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub plugin_dir: PathBuf,
    pub startup_attempts: u32,
    pub startup_interval: Duration,
    pub call_timeout: Duration,
}

impl From<&PluginConfig> for RegistryConfig {
    fn from(config: &PluginConfig) -> Self {
        Self {
            plugin_dir: config.plugin_dir.clone(),
            startup_attempts: config.startup_attempts.max(1),
            startup_interval: Duration::from_millis(config.startup_interval_ms),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
        }
    }
}

/// Ordered set of active plugin channels
pub struct HookRegistry {
    channels: RwLock<Vec<Arc<PluginChannel>>>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl HookRegistry {
    /// Registry with no plugins
    pub fn empty() -> Arc<Self> {
        Self::with_channels(Vec::new())
    }

    /// Registry over already-connected channels, in the given order
    pub fn with_channels(channels: Vec<PluginChannel>) -> Arc<Self> {
        Arc::new(Self {
            channels: RwLock::new(channels.into_iter().map(Arc::new).collect()),
            watchers: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Scan the plugin directory, spawn every eligible executable and register
    /// the ones whose endpoint comes up within the startup window
    pub async fn init(config: RegistryConfig) -> Arc<Self> {
        let registry = Self::empty();

        let candidates = match discover(&config.plugin_dir) {
            Ok(candidates) => candidates,
            Err(e) => {
                info!(
                    dir = %config.plugin_dir.display(),
                    "Plugin directory not readable, continuing without plugins: {}",
                    e
                );
                return registry;
            }
        };

        for (number, (name, path)) in (1..).zip(candidates) {
            let endpoint = endpoint_for(&config.plugin_dir, number);
            match registry.start_plugin(&config, &name, &path, endpoint).await {
                Ok(()) => info!(plugin = %name, "Plugin registered"),
                Err(e) => warn!(plugin = %name, "Plugin not registered: {}", e),
            }
        }

        info!(count = registry.len().await, "Hook registry initialized");
        registry
    }

    async fn start_plugin(
        self: &Arc<Self>,
        config: &RegistryConfig,
        name: &str,
        path: &Path,
        endpoint: PathBuf,
    ) -> PluginResult<()> {
        if endpoint.exists() {
            std::fs::remove_file(&endpoint)
                .map_err(|e| PluginError::Spawn(format!("remove stale endpoint: {}", e)))?;
        }

        let mut child = Command::new(path)
            .arg(&endpoint)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PluginError::Spawn(e.to_string()))?;

        let transport = UnixSocketTransport::new(endpoint.clone());
        if !wait_for_endpoint(&transport, config.startup_attempts, config.startup_interval).await {
            if let Err(e) = child.kill().await {
                debug!(plugin = %name, "Kill after failed startup: {}", e);
            }
            let _ = std::fs::remove_file(&endpoint);
            return Err(PluginError::Unreachable(endpoint.display().to_string()));
        }

        let channel = PluginChannel::unix(name, endpoint.clone(), config.call_timeout);
        self.channels.write().await.push(Arc::new(channel));

        let watcher = tokio::spawn(watch_process(
            Arc::downgrade(self),
            name.to_string(),
            endpoint,
            child,
            self.shutdown.clone(),
        ));
        self.watchers.lock().await.push(watcher);

        Ok(())
    }

    /// Snapshot of the active channels in registration order
    pub async fn channels(&self) -> Vec<Arc<PluginChannel>> {
        self.channels.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.channels.read().await.is_empty()
    }

    /// Drop a channel by plugin name
    pub async fn remove(&self, name: &str) -> bool {
        let mut channels = self.channels.write().await;
        let before = channels.len();
        channels.retain(|c| c.name() != name);
        channels.len() != before
    }

    /// Run a hook on every channel in order, feeding each output into the next
    pub async fn run_sequential(
        &self,
        hook: HookPoint,
        mut envelope: HookEnvelope,
    ) -> HookEnvelope {
        for channel in self.channels().await {
            match channel.invoke(hook, &envelope).await {
                Ok(response) => {
                    debug!(
                        plugin = channel.name(),
                        hook = %hook,
                        log_id = %envelope.ctx.log_id,
                        "Hook call completed"
                    );
                    if !hook.is_observe_only() {
                        envelope = envelope.merge(response);
                    }
                }
                Err(e) => warn!(
                    plugin = channel.name(),
                    hook = %hook,
                    log_id = %envelope.ctx.log_id,
                    "Hook call failed, skipping: {}",
                    e
                ),
            }
        }
        envelope
    }

    /// Run a hook on every channel concurrently and wait for all of them
    pub async fn run_parallel(&self, hook: HookPoint, envelope: HookEnvelope) {
        let envelope = Arc::new(envelope);
        let mut fan: FanOut = FanOut::new();

        for channel in self.channels().await {
            let envelope = envelope.clone();
            fan.spawn(channel, move |channel| async move {
                if let Err(e) = channel.invoke(hook, &envelope).await {
                    warn!(
                        plugin = channel.name(),
                        hook = %hook,
                        log_id = %envelope.ctx.log_id,
                        "Hook call failed: {}",
                        e
                    );
                }
            });
        }

        let _ = fan.wait().await;
    }

    /// `ReceiveParseBefore`: raw inbound bytes
    pub async fn receive_parse_before(
        &self,
        ctx: RequestContext,
        raw: Vec<u8>,
    ) -> (RequestContext, Vec<u8>) {
        let out = self
            .run_sequential(HookPoint::ReceiveParseBefore, HookEnvelope::with_bytes(ctx, raw))
            .await;
        (out.ctx, out.email_byte.unwrap_or_default())
    }

    /// `ReceiveParseAfter`: parsed inbound message
    pub async fn receive_parse_after(
        &self,
        ctx: RequestContext,
        email: Email,
    ) -> (RequestContext, Email) {
        let out = self
            .run_sequential(HookPoint::ReceiveParseAfter, HookEnvelope::with_email(ctx, email))
            .await;
        (out.ctx, out.email.unwrap_or_default())
    }

    /// `ReceiveSaveAfter`: persisted inbound message, observed only
    pub async fn receive_save_after(&self, ctx: RequestContext, email: Email) {
        self.run_sequential(HookPoint::ReceiveSaveAfter, HookEnvelope::with_email(ctx, email))
            .await;
    }

    /// `SendBefore`: outbound message before delivery
    pub async fn send_before(&self, ctx: RequestContext, email: Email) -> (RequestContext, Email) {
        let out = self
            .run_sequential(HookPoint::SendBefore, HookEnvelope::with_email(ctx, email))
            .await;
        (out.ctx, out.email.unwrap_or_default())
    }

    /// `SendAfter`: outbound message with its delivery error map, fanned out
    pub async fn send_after(
        &self,
        ctx: RequestContext,
        email: Email,
        err_map: HashMap<String, String>,
    ) {
        let envelope = HookEnvelope {
            ctx,
            email: Some(email),
            email_byte: None,
            err_map: Some(err_map),
        };
        self.run_parallel(HookPoint::SendAfter, envelope).await;
    }

    /// Kill every plugin process and wait for the watchers to finish
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let watchers = std::mem::take(&mut *self.watchers.lock().await);
        for watcher in watchers {
            let _ = watcher.await;
        }
        self.channels.write().await.clear();
        info!("Hook registry shut down");
    }
}

/// Eligible plugin executables under `dir`, sorted by file name
fn discover(dir: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                debug!(file = %name, "Skipping unreadable plugin entry: {}", e);
                continue;
            }
        };
        if is_eligible(&name, &metadata) {
            found.push((name, entry.path()));
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

fn is_eligible(name: &str, metadata: &std::fs::Metadata) -> bool {
    if !metadata.is_file() {
        return false;
    }
    if name.contains('.') && !name.ends_with(".exe") {
        return false;
    }
    is_executable(metadata)
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

/// `<dir>/<n>.socket`, numbered from 1 in discovery order
fn endpoint_for(dir: &Path, number: usize) -> PathBuf {
    dir.join(format!("{}.socket", number))
}

async fn wait_for_endpoint(
    transport: &UnixSocketTransport,
    attempts: u32,
    interval: Duration,
) -> bool {
    for attempt in 1..=attempts {
        if transport.is_reachable().await {
            return true;
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    false
}

async fn watch_process(
    registry: Weak<HookRegistry>,
    name: String,
    endpoint: PathBuf,
    mut child: Child,
    shutdown: CancellationToken,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = shutdown.cancelled() => None,
    };

    match exited {
        Some(status) => {
            match status {
                Ok(status) => warn!(plugin = %name, %status, "Plugin process exited"),
                Err(e) => warn!(plugin = %name, "Plugin process wait failed: {}", e),
            }
            if let Some(registry) = registry.upgrade() {
                registry.remove(&name).await;
            }
        }
        None => {
            if let Err(e) = child.kill().await {
                debug!(plugin = %name, "Plugin kill failed: {}", e);
            }
        }
    }

    let _ = std::fs::remove_file(&endpoint);
}
