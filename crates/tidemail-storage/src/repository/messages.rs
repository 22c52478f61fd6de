//! Message repository

use crate::db::DatabasePool;
use crate::models::{encode_json, EmailRow, MailboxStat, MessageSize, MessageStatusRecord};
use async_trait::async_trait;
use sqlx::{QueryBuilder, Sqlite};
use tidemail_common::types::{Email, MessageId, MessageStatus};
use tidemail_common::{Error, Result};

/// Body size expression shared by `STAT` and `LIST`
const SIZE_EXPR: &str = "LENGTH(CAST(text AS BLOB)) + LENGTH(CAST(html AS BLOB))";

/// Message repository trait
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Persist a message and return the identifier assigned by the database
    async fn insert(&self, email: &Email) -> Result<MessageId>;

    /// Get a message by ID
    async fn get(&self, id: MessageId) -> Result<Option<Email>>;

    /// Move a queued message to `sent`. Returns false when the row was not queued.
    async fn mark_sent(&self, id: MessageId) -> Result<bool>;

    /// Move a queued message to `failed` with an error text
    async fn mark_failed(&self, id: MessageId, error: &str) -> Result<bool>;

    /// Current status and error text
    async fn status(&self, id: MessageId) -> Result<Option<MessageStatusRecord>>;

    /// Message count and total body size
    async fn stat(&self) -> Result<MailboxStat>;

    /// Per-message body sizes, either every message or a single one
    async fn list_sizes(&self, id: Option<MessageId>) -> Result<Vec<MessageSize>>;

    /// Delete a set of messages in a single statement
    async fn delete_many(&self, ids: &[MessageId]) -> Result<u64>;
}

/// Database message repository
#[derive(Clone)]
pub struct DbMessageRepository {
    pool: DatabasePool,
}

impl DbMessageRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn transition(&self, id: MessageId, next: MessageStatus, error: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE email SET status = ?, error = ? WHERE id = ? AND status = ?")
                .bind(next.as_i32())
                .bind(error)
                .bind(id)
                .bind(MessageStatus::Queued.as_i32())
                .execute(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl MessageRepository for DbMessageRepository {
    async fn insert(&self, email: &Email) -> Result<MessageId> {
        let created_at = email.created_at.unwrap_or_else(chrono::Utc::now);

        let result = sqlx::query(
            r#"
            INSERT INTO email (
                type, subject, reply_to, from_name, from_address,
                to_addresses, cc_addresses, bcc_addresses, text, html,
                sender, attachments, spf_check, dkim_check, status,
                error, send_user_id, create_time
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(email.direction.as_i32())
        .bind(&email.subject)
        .bind(encode_json(&email.reply_to)?)
        .bind(&email.from.name)
        .bind(&email.from.address)
        .bind(encode_json(&email.to)?)
        .bind(encode_json(&email.cc)?)
        .bind(encode_json(&email.bcc)?)
        .bind(&email.text)
        .bind(&email.html)
        .bind(encode_json(&email.sender)?)
        .bind(encode_json(&email.attachments)?)
        .bind(email.spf_check.as_i32())
        .bind(email.dkim_check.as_i32())
        .bind(email.status.as_i32())
        .bind(&email.error)
        .bind(email.user_id)
        .bind(created_at)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        let id = result.last_insert_rowid();
        if id <= 0 {
            return Err(Error::Database(format!("Invalid message id assigned: {}", id)));
        }
        Ok(id)
    }

    async fn get(&self, id: MessageId) -> Result<Option<Email>> {
        let row = sqlx::query_as::<_, EmailRow>("SELECT * FROM email WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        row.map(EmailRow::into_email).transpose()
    }

    async fn mark_sent(&self, id: MessageId) -> Result<bool> {
        self.transition(id, MessageStatus::Sent, "").await
    }

    async fn mark_failed(&self, id: MessageId, error: &str) -> Result<bool> {
        self.transition(id, MessageStatus::Failed, error).await
    }

    async fn status(&self, id: MessageId) -> Result<Option<MessageStatusRecord>> {
        let row: Option<(i32, String)> =
            sqlx::query_as("SELECT status, error FROM email WHERE id = ?")
                .bind(id)
                .fetch_optional(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        Ok(row.map(|(status, error)| MessageStatusRecord {
            id,
            status: MessageStatus::from_i32(status),
            error,
        }))
    }

    async fn stat(&self) -> Result<MailboxStat> {
        let sql = format!(
            "SELECT COUNT(1) AS num, COALESCE(SUM({}), 0) AS size FROM email",
            SIZE_EXPR
        );
        sqlx::query_as::<_, MailboxStat>(&sql)
            .fetch_one(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_sizes(&self, id: Option<MessageId>) -> Result<Vec<MessageSize>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT id, {} AS size FROM email", SIZE_EXPR));
        if let Some(id) = id {
            builder.push(" WHERE id = ").push_bind(id);
        }
        builder.push(" ORDER BY id");

        builder
            .build_query_as::<MessageSize>()
            .fetch_all(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn delete_many(&self, ids: &[MessageId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM email WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let result = builder
            .build()
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}
