//! Configuration for Tidemail
//!
//! The configuration is read once per supervisor generation and is treated as
//! read-only afterwards. The setup wizard is the only writer.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory holding the configuration file, DKIM keys and certificates
pub const CONFIG_DIR: &str = "./config";

/// Certificate mode: issued automatically through ACME
pub const SSL_TYPE_AUTO: &str = "0";
/// Certificate mode: files provided by the operator
pub const SSL_TYPE_USER: &str = "1";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Primary mail domain, used to complete bare sender names
    #[serde(default)]
    pub domain: String,

    /// Every domain this server receives mail for
    #[serde(default)]
    pub domains: Vec<String>,

    /// Domain the admin HTTP surface is served on
    #[serde(default)]
    pub web_domain: String,

    /// Path to the DKIM private key
    #[serde(default = "default_dkim_key_path")]
    pub dkim_private_key_path: PathBuf,

    /// Set by the setup wizard once every step is complete
    #[serde(default)]
    pub is_init: bool,

    /// Spam filter level: 0 off, 1 reject when SPF and DKIM both fail, 2 reject on SPF failure
    #[serde(default)]
    pub spam_filter_level: u8,

    /// Bind host for every listener
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Listener ports
    #[serde(default)]
    pub ports: PortsConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// TLS configuration
    #[serde(default)]
    pub tls: TlsConfig,

    /// Plugin configuration
    #[serde(default)]
    pub plugins: PluginConfig,

    /// Third-party push credentials
    #[serde(default)]
    pub push: PushConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Limits for the inbound SMTP listener
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Limits for the POP3 listener
    #[serde(default)]
    pub pop3: Pop3Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: String::new(),
            domains: Vec::new(),
            web_domain: String::new(),
            dkim_private_key_path: default_dkim_key_path(),
            is_init: false,
            spam_filter_level: 0,
            bind_host: default_bind_host(),
            ports: PortsConfig::default(),
            database: DatabaseConfig::default(),
            tls: TlsConfig::default(),
            plugins: PluginConfig::default(),
            push: PushConfig::default(),
            logging: LoggingConfig::default(),
            smtp: SmtpConfig::default(),
            pop3: Pop3Config::default(),
        }
    }
}

fn default_dkim_key_path() -> PathBuf {
    PathBuf::from("./config/dkim/dkim.priv")
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

/// Listener ports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_smtp_port")]
    pub smtp: u16,
    #[serde(default = "default_smtps_port")]
    pub smtps: u16,
    #[serde(default = "default_http_port")]
    pub http: u16,
    #[serde(default = "default_https_port")]
    pub https: u16,
    #[serde(default = "default_pop3_port")]
    pub pop3: u16,
    #[serde(default = "default_pop3s_port")]
    pub pop3s: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            smtp: default_smtp_port(),
            smtps: default_smtps_port(),
            http: default_http_port(),
            https: default_https_port(),
            pop3: default_pop3_port(),
            pop3s: default_pop3s_port(),
        }
    }
}

fn default_smtp_port() -> u16 {
    25
}

fn default_smtps_port() -> u16 {
    465
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_pop3_port() -> u16 {
    110
}

fn default_pop3s_port() -> u16 {
    995
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend. Only "sqlite" is supported.
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Connection string
    #[serde(default = "default_db_dsn")]
    pub dsn: String,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_db_backend(),
            dsn: default_db_dsn(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_db_backend() -> String {
    "sqlite".to_string()
}

fn default_db_dsn() -> String {
    "sqlite://./config/tidemail.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    10
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Certificate mode, see [`SSL_TYPE_AUTO`] and [`SSL_TYPE_USER`]
    #[serde(default = "default_ssl_type")]
    pub ssl_type: String,

    /// Path to certificate file
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,

    /// Path to private key file
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,

    /// Admin HTTPS: 0 default (on), 1 on, 2 off
    #[serde(default)]
    pub https_enabled: u8,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            ssl_type: default_ssl_type(),
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            https_enabled: 0,
        }
    }
}

impl TlsConfig {
    pub fn https_disabled(&self) -> bool {
        self.https_enabled == 2
    }
}

fn default_ssl_type() -> String {
    SSL_TYPE_AUTO.to_string()
}

fn default_cert_path() -> PathBuf {
    PathBuf::from("./config/ssl/public.crt")
}

fn default_key_path() -> PathBuf {
    PathBuf::from("./config/ssl/private.key")
}

/// Plugin system configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Directory scanned for plugin executables
    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: PathBuf,

    /// Attempts made waiting for a plugin endpoint to appear
    #[serde(default = "default_startup_attempts")]
    pub startup_attempts: u32,

    /// Spacing between those attempts, in milliseconds
    #[serde(default = "default_startup_interval")]
    pub startup_interval_ms: u64,

    /// Per-call timeout in seconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            plugin_dir: default_plugin_dir(),
            startup_attempts: default_startup_attempts(),
            startup_interval_ms: default_startup_interval(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("./plugins")
}

fn default_startup_attempts() -> u32 {
    5
}

fn default_startup_interval() -> u64 {
    1000
}

fn default_call_timeout() -> u64 {
    10
}

/// Third-party push credentials, handed to plugins that need them
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushConfig {
    #[serde(default)]
    pub wechat_app_id: String,
    #[serde(default)]
    pub wechat_secret: String,
    #[serde(default)]
    pub wechat_template_id: String,
    #[serde(default)]
    pub wechat_user_id: String,
    #[serde(default)]
    pub telegram_bot_token: String,
    #[serde(default)]
    pub telegram_chat_id: String,
    #[serde(default)]
    pub web_push_url: String,
    #[serde(default)]
    pub web_push_token: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// SMTP listener limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Maximum message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum recipients per message
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Idle timeout in seconds
    #[serde(default = "default_smtp_timeout")]
    pub timeout_secs: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            max_recipients: default_max_recipients(),
            timeout_secs: default_smtp_timeout(),
        }
    }
}

fn default_max_message_size() -> usize {
    25 * 1024 * 1024 // 25 MB
}

fn default_max_recipients() -> usize {
    100
}

fn default_smtp_timeout() -> u64 {
    300
}

/// POP3 listener limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pop3Config {
    /// Session idle timeout in minutes
    #[serde(default = "default_pop3_timeout")]
    pub timeout_minutes: u64,
}

impl Default for Pop3Config {
    fn default() -> Self {
        Self {
            timeout_minutes: default_pop3_timeout(),
        }
    }
}

fn default_pop3_timeout() -> u64 {
    10
}

impl Config {
    /// Path of the configuration file, `config.dev.toml` in dev mode
    pub fn path(dev: bool) -> PathBuf {
        let name = if dev { "config.dev.toml" } else { "config.toml" };
        Path::new(CONFIG_DIR).join(name)
    }

    /// Whether the process was started in dev mode (last argument is `dev`)
    pub fn dev_mode_from_args() -> bool {
        let args: Vec<String> = std::env::args().collect();
        args.len() >= 2 && args.last().map(|a| a == "dev").unwrap_or(false)
    }

    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.normalize();
        Ok(config)
    }

    /// Load configuration, falling back to an uninitialized default when no
    /// file exists yet (first run, before the setup wizard)
    pub fn load_or_default(path: &Path) -> crate::Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::info!(path = %path.display(), "No configuration file found, using defaults");
            Ok(Self::default())
        }
    }

    /// Write configuration to file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::Error::Config(format!("Failed to create config dir: {}", e)))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config file: {}", e)))?;
        Ok(())
    }

    /// Whether the first-run setup has completed
    pub fn is_initialized(&self) -> bool {
        !self.domain.is_empty() && self.is_init
    }

    /// Whether `domain` is one this server receives mail for
    pub fn is_local_domain(&self, domain: &str) -> bool {
        self.domains.iter().any(|d| d.eq_ignore_ascii_case(domain))
    }

    fn normalize(&mut self) {
        if self.domains.is_empty() && !self.domain.is_empty() {
            self.domains = vec![self.domain.clone()];
        }
    }
}

/// Create the on-disk directories required before the setup wizard runs
pub fn ensure_directories(root: &Path) -> std::io::Result<()> {
    for dir in [root.to_path_buf(), root.join("dkim"), root.join("ssl")] {
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
    }
    Ok(())
}
