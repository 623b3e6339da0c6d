//! Ports to the credential store.
//!
//! Services receive these as trait objects, so the orchestrator runs against
//! PostgreSQL in production and against memory in tests.

#[cfg(test)]
pub mod memory;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::types::Json;

use crate::audit::Level;
use crate::error::{Result, ServerError};
use crate::mfa::{BackupCodes, MfaState};

pub type UserId = i64;
pub type RoleId = i64;

/// Stored account.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct UserRecord {
    pub id: UserId,
    pub name: String,
    pub surname: String,
    pub email: String,
    /// Argon2id PHC string.
    pub password: String,
    pub role_id: RoleId,
    pub birth_date: Option<NaiveDate>,
    pub mfa_enabled: bool,
    pub mfa_secret: Option<String>,
    pub backup_codes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserRecord {
    pub fn mfa_state(&self) -> Result<MfaState> {
        MfaState::from_columns(
            self.mfa_enabled,
            self.mfa_secret.as_deref(),
            self.backup_codes.as_deref(),
        )
    }

    /// Projection safe to send to clients.
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            name: self.name.clone(),
            surname: self.surname.clone(),
            email: self.email.clone(),
            role_id: self.role_id,
            birth_date: self.birth_date,
            mfa_enabled: self.mfa_enabled,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Account without password hash, secret or backup codes.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
    pub surname: String,
    pub email: String,
    pub role_id: RoleId,
    pub birth_date: Option<NaiveDate>,
    pub mfa_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Account about to be inserted.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub surname: String,
    pub email: String,
    pub password: String,
    pub role_id: RoleId,
    pub birth_date: Option<NaiveDate>,
}

/// Administrative changes to an account. `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub surname: Option<String>,
    pub email: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub role_id: Option<RoleId>,
}

/// Role row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub active: bool,
}

/// Refresh token about to be persisted.
#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub user_id: UserId,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub ip_address: Option<String>,
}

/// Persisted audit event.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize, sqlx::FromRow)]
pub struct LogRecord {
    pub id: i64,
    pub level: String,
    pub message: String,
    pub email: Option<String>,
    pub role: Option<String>,
    pub ip_address: Option<String>,
    pub attributes: Json<BTreeMap<String, String>>,
    pub created_at: DateTime<Utc>,
}

/// Filters and page of an audit log read.
#[derive(Debug, Clone)]
pub struct LogFilter {
    pub level: Option<Level>,
    /// Case-insensitive substring of the email.
    pub email: Option<String>,
    pub ip: Option<String>,
    /// Starts at 1.
    pub page: u32,
    pub limit: u32,
}

impl LogFilter {
    pub fn offset(&self) -> i64 {
        i64::from(self.page.saturating_sub(1)) * i64::from(self.limit)
    }
}

/// Accounts and their MFA columns.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>>;

    async fn find_by_id(&self, id: UserId) -> Result<Option<UserRecord>>;

    async fn list(&self) -> Result<Vec<UserRecord>>;

    async fn email_exists(&self, email: &str) -> Result<bool>;

    /// Insert an account. A duplicate email yields [`ServerError::Conflict`].
    async fn insert(&self, user: NewUser) -> Result<UserRecord>;

    async fn update_password(&self, id: UserId, password: &str) -> Result<()>;

    /// Apply `changes`. `None` when the account does not exist, a duplicate
    /// email yields [`ServerError::Conflict`].
    async fn update(&self, id: UserId, changes: UserUpdate) -> Result<Option<UserRecord>>;

    /// Delete an account and its refresh tokens. Returns `false` when it
    /// did not exist.
    async fn delete(&self, id: UserId) -> Result<bool>;

    /// Store an unconfirmed secret, only while MFA is not enabled. Returns
    /// `false` when the account was enabled in the meantime.
    async fn store_pending_mfa(
        &self,
        id: UserId,
        secret: &str,
        codes: &BackupCodes,
    ) -> Result<bool>;

    /// Replace the secret of an enabled account, keeping it enabled, only if
    /// `current` is still the stored secret.
    async fn rekey_mfa(
        &self,
        id: UserId,
        current: &str,
        secret: &str,
        codes: &BackupCodes,
    ) -> Result<bool>;

    /// Flip `mfa_enabled` only if `secret` is still the stored one.
    async fn confirm_mfa(&self, id: UserId, secret: &str) -> Result<bool>;

    /// Replace backup codes only if the stored set still equals `expected`.
    async fn swap_backup_codes(
        &self,
        id: UserId,
        expected: &BackupCodes,
        remaining: &BackupCodes,
    ) -> Result<bool>;

    async fn clear_mfa(&self, id: UserId) -> Result<()>;
}

/// Refresh token records.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn store(&self, token: NewRefreshToken) -> Result<()>;

    /// Revoke `old` if it is live and owned by `user_id`, then persist
    /// `replacement`, as one unit. Returns `false` when `old` was not live.
    async fn rotate(
        &self,
        old: &str,
        user_id: UserId,
        replacement: NewRefreshToken,
    ) -> Result<bool>;

    async fn revoke_all_for_user(&self, user_id: UserId) -> Result<u64>;

    async fn revoke_all(&self) -> Result<u64>;
}

/// Roles and their permissions.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    /// Active role of an account.
    async fn find_user_role(&self, user_id: UserId) -> Result<Option<Role>>;

    async fn find_role_by_name(&self, name: &str) -> Result<Option<Role>>;

    async fn find_role(&self, id: RoleId) -> Result<Option<Role>>;

    /// Whether an active role holds `permission`.
    async fn role_has_permission(
        &self,
        role_id: RoleId,
        permission: &str,
    ) -> Result<bool>;
}

/// Read side of the audit trail.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Newest first, with the number of matching events.
    async fn list_logs(&self, filter: &LogFilter) -> Result<(Vec<LogRecord>, i64)>;
}

/// Store handles shared by every service.
#[derive(Clone)]
pub struct Stores {
    pub credentials: Arc<dyn CredentialStore>,
    pub tokens: Arc<dyn RefreshTokenStore>,
    pub permissions: Arc<dyn PermissionStore>,
    pub logs: Arc<dyn LogStore>,
    timeout: Duration,
}

impl Stores {
    /// Create a new [`Stores`].
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        tokens: Arc<dyn RefreshTokenStore>,
        permissions: Arc<dyn PermissionStore>,
        logs: Arc<dyn LogStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            credentials,
            tokens,
            permissions,
            logs,
            timeout,
        }
    }

    /// Run a store call under the configured deadline.
    pub async fn within<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(timeout = ?self.timeout, "store call timed out");
                Err(ServerError::StoreTimeout)
            },
        }
    }
}
