//! In-memory store used by tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;

use crate::audit::{AuditEvent, AuditSink};
use crate::error::{Result, ServerError};
use crate::mfa::BackupCodes;
use crate::store::{
    CredentialStore, LogFilter, LogRecord, LogStore, NewRefreshToken, NewUser,
    PermissionStore, RefreshTokenStore, Role, RoleId, UserId, UserRecord, UserUpdate,
};

pub const ADMIN_ROLE: RoleId = 1;
pub const DOCTOR_ROLE: RoleId = 2;
pub const PATIENT_ROLE: RoleId = 4;
pub const RETIRED_ROLE: RoleId = 5;

#[derive(Debug, Clone)]
pub struct TokenRow {
    pub user_id: UserId,
    pub token: String,
    pub expires_at: chrono::DateTime<Utc>,
    pub ip_address: Option<String>,
    pub revoked: bool,
}

struct Inner {
    next_user: UserId,
    users: Vec<UserRecord>,
    tokens: Vec<TokenRow>,
    roles: Vec<Role>,
    grants: Vec<(RoleId, &'static str)>,
}

impl Inner {
    fn next_id(&mut self) -> UserId {
        let id = self.next_user;
        self.next_user += 1;
        id
    }
}

/// Every store trait over plain vectors.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    failing_permissions: AtomicBool,
    interleaving: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let role = |id, name: &str, active| Role {
            id,
            name: name.into(),
            active,
        };
        let mut grants = vec![
            (DOCTOR_ROLE, "users_read"),
            (3, "users_read"),
            (RETIRED_ROLE, "users_read"),
        ];
        for permission in [
            "users_read",
            "users_write",
            "users_delete",
            "sessions_revoke",
            "logs_read",
        ] {
            grants.push((ADMIN_ROLE, permission));
        }

        Self {
            inner: Mutex::new(Inner {
                next_user: 1,
                users: Vec::new(),
                tokens: Vec::new(),
                roles: vec![
                    role(ADMIN_ROLE, "admin", true),
                    role(DOCTOR_ROLE, "doctor", true),
                    role(3, "nurse", true),
                    role(PATIENT_ROLE, "patient", true),
                    role(RETIRED_ROLE, "retired", false),
                ],
                grants,
            }),
            failing_permissions: AtomicBool::new(false),
            interleaving: AtomicBool::new(false),
        }
    }
}

impl MemoryStore {
    /// Insert an account directly.
    pub fn seed_user(&self, email: &str, password_hash: &str, role_id: RoleId) -> UserRecord {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let user = UserRecord {
            id: inner.next_id(),
            name: "Test".into(),
            surname: "User".into(),
            email: email.into(),
            password: password_hash.into(),
            role_id,
            birth_date: None,
            mfa_enabled: false,
            mfa_secret: None,
            backup_codes: None,
            created_at: now,
            updated_at: now,
        };
        inner.users.push(user.clone());
        user
    }

    pub fn user(&self, id: UserId) -> Option<UserRecord> {
        self.inner.lock().unwrap().users.iter().find(|u| u.id == id).cloned()
    }

    pub fn user_by_email(&self, email: &str) -> Option<UserRecord> {
        self.inner
            .lock()
            .unwrap()
            .users
            .iter()
            .find(|u| u.email == email)
            .cloned()
    }

    /// Overwrite MFA columns of an account.
    pub fn set_mfa(&self, id: UserId, enabled: bool, secret: Option<&str>, codes: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(user) = inner.users.iter_mut().find(|u| u.id == id) {
            user.mfa_enabled = enabled;
            user.mfa_secret = secret.map(str::to_owned);
            user.backup_codes = codes.map(str::to_owned);
        }
    }

    pub fn tokens(&self) -> Vec<TokenRow> {
        self.inner.lock().unwrap().tokens.clone()
    }

    /// Make every permission lookup fail.
    pub fn fail_permissions(&self) {
        self.failing_permissions.store(true, Ordering::SeqCst);
    }

    /// Yield to the scheduler after every account read and before every
    /// rotation, so joined futures read the same row before either writes.
    pub fn interleave(&self) {
        self.interleaving.store(true, Ordering::SeqCst);
    }

    async fn pause(&self) {
        if self.interleaving.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let user = self.user_by_email(email);
        self.pause().await;
        Ok(user)
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<UserRecord>> {
        let user = self.user(id);
        self.pause().await;
        Ok(user)
    }

    async fn list(&self) -> Result<Vec<UserRecord>> {
        Ok(self.inner.lock().unwrap().users.clone())
    }

    async fn email_exists(&self, email: &str) -> Result<bool> {
        Ok(self.user_by_email(email).is_some())
    }

    async fn insert(&self, user: NewUser) -> Result<UserRecord> {
        let mut inner = self.inner.lock().unwrap();
        if inner.users.iter().any(|u| u.email == user.email) {
            return Err(ServerError::Conflict("Email is already registered.".into()));
        }

        let now = Utc::now();
        let record = UserRecord {
            id: inner.next_id(),
            name: user.name,
            surname: user.surname,
            email: user.email,
            password: user.password,
            role_id: user.role_id,
            birth_date: user.birth_date,
            mfa_enabled: false,
            mfa_secret: None,
            backup_codes: None,
            created_at: now,
            updated_at: now,
        };
        inner.users.push(record.clone());
        Ok(record)
    }

    async fn update_password(&self, id: UserId, password: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let user = inner
            .users
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or(ServerError::NotFound)?;
        user.password = password.into();
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn update(&self, id: UserId, changes: UserUpdate) -> Result<Option<UserRecord>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(email) = &changes.email {
            if inner.users.iter().any(|u| u.id != id && &u.email == email) {
                return Err(ServerError::Conflict("Email is already registered.".into()));
            }
        }

        let Some(user) = inner.users.iter_mut().find(|u| u.id == id) else {
            return Ok(None);
        };
        if let Some(name) = changes.name {
            user.name = name;
        }
        if let Some(surname) = changes.surname {
            user.surname = surname;
        }
        if let Some(email) = changes.email {
            user.email = email;
        }
        if let Some(birth_date) = changes.birth_date {
            user.birth_date = Some(birth_date);
        }
        if let Some(role_id) = changes.role_id {
            user.role_id = role_id;
        }
        user.updated_at = Utc::now();
        Ok(Some(user.clone()))
    }

    async fn delete(&self, id: UserId) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.users.len();
        inner.users.retain(|u| u.id != id);
        if inner.users.len() == before {
            return Ok(false);
        }

        inner.tokens.retain(|t| t.user_id != id);
        Ok(true)
    }

    async fn store_pending_mfa(
        &self,
        id: UserId,
        secret: &str,
        codes: &BackupCodes,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.users.iter_mut().find(|u| u.id == id && !u.mfa_enabled) {
            Some(user) => {
                user.mfa_secret = Some(secret.into());
                user.backup_codes = codes.to_column();
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn rekey_mfa(
        &self,
        id: UserId,
        current: &str,
        secret: &str,
        codes: &BackupCodes,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.users.iter_mut().find(|u| {
            u.id == id && u.mfa_enabled && u.mfa_secret.as_deref() == Some(current)
        }) {
            Some(user) => {
                user.mfa_secret = Some(secret.into());
                user.backup_codes = codes.to_column();
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn confirm_mfa(&self, id: UserId, secret: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.users.iter_mut().find(|u| {
            u.id == id && !u.mfa_enabled && u.mfa_secret.as_deref() == Some(secret)
        }) {
            Some(user) => {
                user.mfa_enabled = true;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn swap_backup_codes(
        &self,
        id: UserId,
        expected: &BackupCodes,
        remaining: &BackupCodes,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let expected = expected.to_column();
        match inner
            .users
            .iter_mut()
            .find(|u| u.id == id && u.backup_codes == expected)
        {
            Some(user) => {
                user.backup_codes = remaining.to_column();
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn clear_mfa(&self, id: UserId) -> Result<()> {
        self.set_mfa(id, false, None, None);
        Ok(())
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryStore {
    async fn store(&self, token: NewRefreshToken) -> Result<()> {
        self.inner.lock().unwrap().tokens.push(TokenRow {
            user_id: token.user_id,
            token: token.token,
            expires_at: token.expires_at,
            ip_address: token.ip_address,
            revoked: false,
        });
        Ok(())
    }

    async fn rotate(
        &self,
        old: &str,
        user_id: UserId,
        replacement: NewRefreshToken,
    ) -> Result<bool> {
        self.pause().await;
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let Some(row) = inner.tokens.iter_mut().find(|t| {
            t.token == old && t.user_id == user_id && !t.revoked && t.expires_at > now
        }) else {
            return Ok(false);
        };

        row.revoked = true;
        inner.tokens.push(TokenRow {
            user_id: replacement.user_id,
            token: replacement.token,
            expires_at: replacement.expires_at,
            ip_address: replacement.ip_address,
            revoked: false,
        });
        Ok(true)
    }

    async fn revoke_all_for_user(&self, user_id: UserId) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let mut count = 0;
        for row in inner.tokens.iter_mut().filter(|t| t.user_id == user_id && !t.revoked) {
            row.revoked = true;
            count += 1;
        }
        Ok(count)
    }

    async fn revoke_all(&self) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let mut count = 0;
        for row in inner.tokens.iter_mut().filter(|t| !t.revoked) {
            row.revoked = true;
            count += 1;
        }
        Ok(count)
    }
}

#[async_trait]
impl PermissionStore for MemoryStore {
    async fn find_user_role(&self, user_id: UserId) -> Result<Option<Role>> {
        let inner = self.inner.lock().unwrap();
        let Some(user) = inner.users.iter().find(|u| u.id == user_id) else {
            return Ok(None);
        };
        Ok(inner
            .roles
            .iter()
            .find(|r| r.id == user.role_id && r.active)
            .cloned())
    }

    async fn find_role_by_name(&self, name: &str) -> Result<Option<Role>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .roles
            .iter()
            .find(|r| r.name == name)
            .cloned())
    }

    async fn find_role(&self, id: RoleId) -> Result<Option<Role>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .roles
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn role_has_permission(
        &self,
        role_id: RoleId,
        permission: &str,
    ) -> Result<bool> {
        if self.failing_permissions.load(Ordering::SeqCst) {
            return Err(ServerError::Sql(sqlx::Error::PoolTimedOut));
        }

        let inner = self.inner.lock().unwrap();
        let active = inner.roles.iter().any(|r| r.id == role_id && r.active);
        Ok(active
            && inner
                .grants
                .iter()
                .any(|(id, name)| *id == role_id && *name == permission))
    }
}

/// Audit sink keeping every event for assertions.
#[derive(Default)]
pub struct RecordingAudit {
    events: Mutex<Vec<(AuditEvent, DateTime<Utc>)>>,
}

impl RecordingAudit {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(event, _)| event.clone())
            .collect()
    }
}

impl AuditSink for RecordingAudit {
    fn record(&self, event: AuditEvent) {
        self.events.lock().unwrap().push((event, Utc::now()));
    }
}

#[async_trait]
impl LogStore for RecordingAudit {
    async fn list_logs(&self, filter: &LogFilter) -> Result<(Vec<LogRecord>, i64)> {
        let events = self.events.lock().unwrap();
        let email = filter.email.as_ref().map(|email| email.to_lowercase());
        let matching: Vec<LogRecord> = events
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, (event, _))| {
                filter.level.is_none_or(|level| event.level == level)
                    && email.as_ref().is_none_or(|email| {
                        event
                            .email
                            .as_ref()
                            .is_some_and(|e| e.to_lowercase().contains(email.as_str()))
                    })
                    && filter
                        .ip
                        .as_ref()
                        .is_none_or(|ip| event.ip.as_ref() == Some(ip))
            })
            .map(|(index, (event, created_at))| LogRecord {
                id: index as i64 + 1,
                level: event.level.as_str().to_owned(),
                message: event.message.clone(),
                email: event.email.clone(),
                role: event.role.clone(),
                ip_address: event.ip.clone(),
                attributes: Json(event.attributes.clone()),
                created_at: *created_at,
            })
            .collect();

        let total = matching.len() as i64;
        let page = matching
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.limit as usize)
            .collect();
        Ok((page, total))
    }
}
