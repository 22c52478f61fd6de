//! Account repository

use crate::db::DatabasePool;
use crate::models::User;
use async_trait::async_trait;
use tidemail_common::types::UserId;
use tidemail_common::{Error, Result};

/// Account repository trait
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Look up an enabled account by login and hashed secret
    async fn find_by_credentials(&self, account: &str, password_hash: &str) -> Result<Option<User>>;

    /// Look up an enabled account by login
    async fn find_by_account(&self, account: &str) -> Result<Option<User>>;

    /// Create an account and return it
    async fn create(
        &self,
        account: &str,
        name: &str,
        password_hash: &str,
        is_admin: bool,
    ) -> Result<User>;

    /// Replace the hashed secret of an account
    async fn update_password(&self, account: &str, password_hash: &str) -> Result<bool>;

    /// Whether any administrator exists
    async fn has_admin(&self) -> Result<bool>;
}

/// Database account repository
#[derive(Clone)]
pub struct DbUserRepository {
    pool: DatabasePool,
}

impl DbUserRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn get(&self, id: UserId) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}

#[async_trait]
impl UserRepository for DbUserRepository {
    async fn find_by_credentials(
        &self,
        account: &str,
        password_hash: &str,
    ) -> Result<Option<User>> {
        sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE account = ? AND password = ? AND disabled = 0",
        )
        .bind(account)
        .bind(password_hash)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn find_by_account(&self, account: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE account = ? AND disabled = 0")
            .bind(account)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn create(
        &self,
        account: &str,
        name: &str,
        password_hash: &str,
        is_admin: bool,
    ) -> Result<User> {
        let result = sqlx::query(
            "INSERT INTO users (account, name, password, is_admin, disabled) \
             VALUES (?, ?, ?, ?, 0)",
        )
        .bind(account)
        .bind(name)
        .bind(password_hash)
        .bind(is_admin)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        self.get(result.last_insert_rowid())
            .await?
            .ok_or_else(|| Error::Internal("Failed to create user".to_string()))
    }

    async fn update_password(&self, account: &str, password_hash: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE users SET password = ? WHERE account = ?")
            .bind(password_hash)
            .bind(account)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn has_admin(&self) -> Result<bool> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(1) FROM users WHERE is_admin = 1")
            .fetch_one(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(count > 0)
    }
}
