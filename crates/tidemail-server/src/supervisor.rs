//! Server lifecycle: setup gating, listener generations and restarts

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tidemail_api::{
    create_router, create_setup_router, AppState, HttpHandler, LifecycleSignals, SetupState,
};
use tidemail_common::config::ensure_directories;
use tidemail_common::Config;
use tidemail_core::{
    load_acceptor, spawn_listener, ChallengeStore, HookRegistry, ListenerHandle, Pop3Backend,
    Pop3Handler, ReceivePipeline, RegistryConfig, SendPipeline, SessionHandler, SmtpDelivery,
    SmtpHandler,
};
use tidemail_storage::{DatabasePool, DbMessageRepository, DbUserRepository};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

/// What ended a running generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Restart,
    Shutdown,
}

/// Everything started for one configuration snapshot
pub struct Generation {
    number: u64,
    listeners: Vec<ListenerHandle>,
    send: SendPipeline,
    hooks: Arc<HookRegistry>,
    db: DatabasePool,
}

impl Generation {
    pub fn listener_names(&self) -> Vec<&str> {
        self.listeners.iter().map(|l| l.name()).collect()
    }

    /// Stop accepting, let queued sends reconcile, then stop the plugins
    ///
    /// The pool is released rather than closed: sessions accepted by this
    /// generation hold their own handle and finish against it.
    pub async fn stop(self) {
        for listener in self.listeners {
            listener.stop().await;
        }
        self.send.drain().await;
        self.hooks.shutdown().await;
        drop(self.db);
        info!(generation = self.number, "Generation stopped");
    }
}

pub struct Supervisor {
    config_path: PathBuf,
    signals: LifecycleSignals,
    challenges: ChallengeStore,
}

impl Supervisor {
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            config_path,
            signals: LifecycleSignals::new(),
            challenges: ChallengeStore::new(),
        }
    }

    pub fn signals(&self) -> &LifecycleSignals {
        &self.signals
    }

    /// Run until shutdown; only setup and storage failures are returned
    pub async fn run(self) -> Result<()> {
        let config = Config::load_or_default(&self.config_path)?;
        if !config.is_initialized() && self.await_setup(config).await? == Event::Shutdown {
            return Ok(());
        }

        let mut number = 0;
        loop {
            number += 1;
            let config = Arc::new(
                Config::from_file(&self.config_path)
                    .with_context(|| format!("loading {}", self.config_path.display()))?,
            );
            let generation = self.start(number, config).await?;

            let event = wait_for_event(&self.signals).await;
            info!(generation = number, event = ?event, "Stopping listeners");
            generation.stop().await;

            if event == Event::Shutdown {
                break;
            }
        }

        info!("Tidemail shutdown complete");
        Ok(())
    }

    /// Serve only the setup wizard until it reports completion
    async fn await_setup(&self, config: Config) -> Result<Event> {
        let root = self.config_path.parent().unwrap_or_else(|| Path::new("."));
        ensure_directories(root).with_context(|| format!("creating {}", root.display()))?;

        let addr = format!("{}:{}", config.bind_host, config.ports.http);
        let state = Arc::new(SetupState::new(
            self.config_path.clone(),
            config,
            self.challenges.clone(),
            self.signals.clone(),
        ));
        let handler = Arc::new(HttpHandler::new(create_setup_router(state)));
        let listener = spawn_listener("setup", &addr, None, handler)
            .await
            .with_context(|| format!("binding setup listener on {}", addr))?;
        info!(addr = %addr, "Waiting for the setup wizard");

        let event = tokio::select! {
            _ = self.signals.setup_finished.notified() => Event::Restart,
            _ = tokio::signal::ctrl_c() => Event::Shutdown,
        };
        listener.stop().await;
        Ok(event)
    }

    /// Bring up storage, plugins and every listener for one generation
    pub async fn start(&self, number: u64, config: Arc<Config>) -> Result<Generation> {
        info!(generation = number, domain = %config.domain, "Starting generation");

        let tls = load_acceptor(&config.tls);

        let db = DatabasePool::new(&config.database).await.context("connecting to database")?;
        db.migrate().await.context("running migrations")?;

        let hooks = HookRegistry::init(RegistryConfig::from(&config.plugins)).await;
        info!(plugins = hooks.len().await, "Hook registry ready");

        let messages = Arc::new(DbMessageRepository::new(db.clone()));
        let users = Arc::new(DbUserRepository::new(db.clone()));

        let send = SendPipeline::new(
            messages.clone(),
            hooks.clone(),
            Arc::new(SmtpDelivery::system_or_default()),
            config.domain.clone(),
        );
        let receive = ReceivePipeline::new(messages.clone(), hooks.clone());

        let state = Arc::new(AppState {
            config: config.clone(),
            send: send.clone(),
            messages: messages.clone(),
            users: users.clone(),
            challenges: self.challenges.clone(),
            signals: self.signals.clone(),
        });

        let smtp: Arc<dyn SessionHandler> = Arc::new(SmtpHandler::new(config.clone(), receive));
        let http: Arc<dyn SessionHandler> = Arc::new(HttpHandler::new(create_router(state)));
        let pop3: Arc<dyn SessionHandler> = Arc::new(Pop3Handler::new(
            Pop3Backend {
                messages,
                users,
                domain: config.domain.clone(),
            },
            config.domain.clone(),
            config.pop3.timeout_minutes,
        ));

        let ports = &config.ports;
        let plans: [(&str, u16, bool, &Arc<dyn SessionHandler>); 6] = [
            ("smtp", ports.smtp, false, &smtp),
            ("smtps", ports.smtps, true, &smtp),
            ("http", ports.http, false, &http),
            ("https", ports.https, true, &http),
            ("pop3", ports.pop3, false, &pop3),
            ("pop3s", ports.pop3s, true, &pop3),
        ];

        let mut listeners = Vec::new();
        for (name, port, secure, handler) in plans {
            if name == "https" && config.tls.https_disabled() {
                info!(listener = name, "HTTPS disabled by configuration");
                continue;
            }
            let acceptor: Option<TlsAcceptor> = match (secure, &tls) {
                (false, _) => None,
                (true, Some(acceptor)) => Some(acceptor.clone()),
                (true, None) => {
                    warn!(listener = name, "No certificate material, listener skipped");
                    continue;
                }
            };

            let addr = format!("{}:{}", config.bind_host, port);
            match spawn_listener(name, &addr, acceptor, handler.clone()).await {
                Ok(handle) => listeners.push(handle),
                Err(e) => error!(listener = name, addr = %addr, "Failed to bind: {}", e),
            }
        }

        info!(generation = number, listeners = listeners.len(), "Tidemail started");
        Ok(Generation {
            number,
            listeners,
            send,
            hooks,
            db,
        })
    }
}

#[cfg(unix)]
async fn hangup() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::hangup()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            warn!("Cannot listen for SIGHUP: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn hangup() {
    std::future::pending::<()>().await;
}

/// Block until a restart is requested or the process is asked to stop
pub async fn wait_for_event(signals: &LifecycleSignals) -> Event {
    tokio::select! {
        _ = signals.restart.notified() => Event::Restart,
        _ = hangup() => Event::Restart,
        _ = tokio::signal::ctrl_c() => Event::Shutdown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn test_config(dir: &Path) -> Config {
        let mut config = Config {
            domain: "example.com".to_string(),
            domains: vec!["example.com".to_string()],
            is_init: true,
            bind_host: "127.0.0.1".to_string(),
            ..Default::default()
        };
        config.ports.smtp = 0;
        config.ports.smtps = 0;
        config.ports.http = 0;
        config.ports.https = 0;
        config.ports.pop3 = 0;
        config.ports.pop3s = 0;
        config.database.dsn = format!("sqlite://{}", dir.join("mail.db").display());
        config.plugins.plugin_dir = dir.join("plugins");
        config.tls.cert_path = dir.join("ssl/public.crt");
        config.tls.key_path = dir.join("ssl/private.key");
        config
    }

    #[tokio::test]
    async fn test_restart_signal_ends_generation() {
        let signals = LifecycleSignals::new();
        signals.restart.notify_one();
        let event = tokio::time::timeout(Duration::from_secs(1), wait_for_event(&signals))
            .await
            .unwrap();
        assert_eq!(event, Event::Restart);
    }

    #[tokio::test]
    async fn test_generation_skips_tls_listeners_without_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(dir.path().join("config.toml"));

        let generation = supervisor
            .start(1, Arc::new(test_config(dir.path())))
            .await
            .unwrap();
        assert_eq!(generation.listener_names(), vec!["smtp", "http", "pop3"]);
        generation.stop().await;
    }

    #[tokio::test]
    async fn test_generation_fails_on_bad_database() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(dir.path().join("config.toml"));
        let mut config = test_config(dir.path());
        config.database.backend = "postgres".to_string();

        assert!(supervisor.start(1, Arc::new(config)).await.is_err());
    }

    #[tokio::test]
    async fn test_stopped_generation_leaves_live_sessions_their_storage() {
        use tidemail_common::types::Email;
        use tidemail_storage::MessageRepository;

        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(dir.path().join("config.toml"));
        let generation = supervisor
            .start(1, Arc::new(test_config(dir.path())))
            .await
            .unwrap();

        let session_repo = DbMessageRepository::new(generation.db.clone());
        generation.stop().await;

        let id = session_repo.insert(&Email::default()).await.unwrap();
        assert!(session_repo.mark_sent(id).await.unwrap());
        assert_eq!(session_repo.stat().await.unwrap().num, 1);
    }

    #[tokio::test]
    async fn test_generations_restart_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(dir.path().join("config.toml"));
        let config = Arc::new(test_config(dir.path()));

        let first = supervisor.start(1, config.clone()).await.unwrap();
        first.stop().await;
        let second = supervisor.start(2, config).await.unwrap();
        assert_eq!(second.listener_names().len(), 3);
        second.stop().await;
    }
}
