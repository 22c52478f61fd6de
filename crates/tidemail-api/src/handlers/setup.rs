//! First-run setup wizard

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tidemail_common::config::{SSL_TYPE_AUTO, SSL_TYPE_USER};
use tidemail_common::{password, Config, Error, Result};
use tidemail_storage::{DatabasePool, DbUserRepository, UserRepository};
use tracing::info;

use crate::response::{ApiResponse, ApiResult};
use crate::state::SetupState;

/// `{step, action, ...}`; each step reads only the fields it needs
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SetupRequest {
    pub step: String,
    pub action: String,
    pub db_type: String,
    pub db_dsn: String,
    pub account: String,
    pub password: String,
    pub smtp_domain: String,
    pub web_domain: String,
    pub ssl_type: String,
}

/// A record the operator has to publish before mail flows
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsRecord {
    pub host: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    pub ttl: u32,
}

/// Records required for `config.domain`, served from `config.web_domain`
pub fn dns_records(config: &Config) -> Vec<DnsRecord> {
    let record = |host: &str, kind: &str, value: &str| DnsRecord {
        host: host.to_string(),
        kind: kind.to_string(),
        value: value.to_string(),
        ttl: 3600,
    };
    let mail_host = if config.web_domain.is_empty() {
        config.domain.as_str()
    } else {
        config.web_domain.as_str()
    };

    vec![
        record("@", "MX", mail_host),
        record("@", "TXT", "v=spf1 a mx ~all"),
        record("_dmarc", "TXT", "v=DMARC1;p=quarantine;"),
    ]
}

async fn open_users(config: &Config) -> Result<DbUserRepository> {
    let db = DatabasePool::new(&config.database).await?;
    db.migrate().await?;
    Ok(DbUserRepository::new(db))
}

fn save(state: &SetupState, config: &Config) -> Result<()> {
    config.save(&state.config_path)?;
    info!(path = %state.config_path.display(), "Configuration saved");
    Ok(())
}

/// POST /api/setup
pub async fn setup(
    State(state): State<Arc<SetupState>>,
    Json(req): Json<SetupRequest>,
) -> ApiResult<Value> {
    let mut config = state.config.lock().await;

    let data = match (req.step.as_str(), req.action.as_str()) {
        ("database", "get") => json!({
            "db_type": config.database.backend,
            "db_dsn": config.database.dsn,
        }),
        ("database", "set") => {
            if req.db_type.is_empty() || req.db_dsn.is_empty() {
                return Err(Error::Params("db_type and db_dsn are required".to_string()).into());
            }
            let mut database = config.database.clone();
            database.backend = req.db_type;
            database.dsn = req.db_dsn;
            // fail early on a DSN the server could not open
            DatabasePool::new(&database).await?.close().await;
            config.database = database;
            save(&state, &config)?;
            json!("Succ")
        }
        ("password", "get") => json!(open_users(&config).await?.has_admin().await?),
        ("password", "set") => {
            if req.account.is_empty() || req.password.is_empty() {
                return Err(Error::Params("account and password are required".to_string()).into());
            }
            let users = open_users(&config).await?;
            let hash = password::encode(&req.password);
            if users.find_by_account(&req.account).await?.is_some() {
                users.update_password(&req.account, &hash).await?;
            } else {
                users.create(&req.account, &req.account, &hash, true).await?;
            }
            info!(account = %req.account, "Administrator account set");
            json!("Succ")
        }
        ("domain", "get") => json!({
            "smtp_domain": config.domain,
            "web_domain": config.web_domain,
        }),
        ("domain", "set") => {
            if req.smtp_domain.is_empty() {
                return Err(Error::Params("smtp_domain is required".to_string()).into());
            }
            config.domain = req.smtp_domain.to_lowercase();
            config.domains = vec![config.domain.clone()];
            config.web_domain = req.web_domain.to_lowercase();
            save(&state, &config)?;
            json!("Succ")
        }
        ("dns", "get") => {
            if config.domain.is_empty() {
                return Err(Error::Params("domain is not configured".to_string()).into());
            }
            serde_json::to_value(dns_records(&config)).map_err(Error::from)?
        }
        ("ssl", "get") => json!(config.tls.ssl_type),
        ("ssl", "set") => {
            if req.ssl_type != SSL_TYPE_AUTO && req.ssl_type != SSL_TYPE_USER {
                return Err(Error::Params("unknown ssl_type".to_string()).into());
            }
            config.tls.ssl_type = req.ssl_type;
            config.is_init = true;
            save(&state, &config)?;

            info!("Setup finished");
            state.signals.setup_finished.notify_one();
            json!("Succ")
        }
        _ => {
            let step = format!("unknown setup step {}/{}", req.step, req.action);
            return Err(Error::Params(step).into());
        }
    };

    Ok(ApiResponse::success(data))
}
