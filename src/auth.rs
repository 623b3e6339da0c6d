//! Authentication orchestrator.
//!
//! Every operation reading or writing credentials goes through
//! [`Authenticator`], which owns the store handles, the session service and
//! the audit sink.

mod account;
mod login;
mod mfa;

use std::sync::Arc;

pub use account::Registration;
pub use login::{LoginOutcome, LoginRequest};

use crate::audit::{AuditEvent, AuditSink};
use crate::config::Configuration;
use crate::crypto::PasswordManager;
use crate::error::{Result, ServerError};
use crate::mfa::{Enrollment, MfaState, Verification};
use crate::password::PasswordPolicy;
use crate::session::SessionService;
use crate::store::{Stores, UserId, UserRecord};
use crate::totp::Totp;

/// Why an attempt failed, kept for the audit trail only. Clients only see
/// `error`.
struct Rejection {
    reason: &'static str,
    error: ServerError,
}

impl Rejection {
    fn new(reason: &'static str, error: ServerError) -> Self {
        Self { reason, error }
    }
}

impl From<ServerError> for Rejection {
    fn from(error: ServerError) -> Self {
        Self {
            reason: "dependency_failure",
            error,
        }
    }
}

/// Credential check, MFA state machine and account operations.
#[derive(Clone)]
pub struct Authenticator {
    stores: Stores,
    sessions: SessionService,
    passwords: Arc<PasswordManager>,
    policy: PasswordPolicy,
    totp: Totp,
    audit: Arc<dyn AuditSink>,
    default_role: String,
}

impl Authenticator {
    /// Create a new [`Authenticator`].
    pub fn new(
        stores: Stores,
        sessions: SessionService,
        passwords: Arc<PasswordManager>,
        audit: Arc<dyn AuditSink>,
        config: &Configuration,
    ) -> Self {
        Self {
            stores,
            sessions,
            passwords,
            policy: PasswordPolicy::new(config.password.min_length),
            totp: Totp::new(&config.totp),
            audit,
            default_role: config.registration.default_role.clone(),
        }
    }

    pub fn sessions(&self) -> &SessionService {
        &self.sessions
    }

    fn record(&self, event: AuditEvent) {
        self.audit.record(event);
    }

    async fn current_user(&self, id: UserId) -> Result<UserRecord> {
        self.stores
            .within(self.stores.credentials.find_by_id(id))
            .await?
            .ok_or(ServerError::NotFound)
    }

    /// Issue a new unconfirmed secret, replacing any other unconfirmed one.
    /// `None` when MFA was enabled in the meantime.
    async fn enroll(&self, user: &UserRecord) -> Result<Option<Enrollment>> {
        let (enrollment, codes) = Enrollment::issue(&self.totp, &user.email);
        let stored = self
            .stores
            .within(self.stores.credentials.store_pending_mfa(
                user.id,
                enrollment.secret.as_str(),
                &codes,
            ))
            .await?;

        Ok(stored.then_some(enrollment))
    }

    /// Accept a TOTP code or burn one backup code. Returns the factor used.
    async fn second_factor(
        &self,
        user_id: UserId,
        state: &MfaState,
        code: &str,
    ) -> std::result::Result<&'static str, Rejection> {
        match state.verify(&self.totp, code) {
            Verification::Totp => Ok("totp"),
            Verification::BackupCode {
                expected,
                remaining,
            } => {
                let swapped = self
                    .stores
                    .within(self.stores.credentials.swap_backup_codes(
                        user_id,
                        &expected,
                        &remaining,
                    ))
                    .await?;

                if swapped {
                    Ok("backup_code")
                } else {
                    // Another request consumed a code first.
                    Err(Rejection::new(
                        "backup_code_race",
                        ServerError::InvalidMfaCode,
                    ))
                }
            },
            Verification::Rejected => Err(Rejection::new(
                "invalid_mfa_code",
                ServerError::InvalidMfaCode,
            )),
        }
    }
}

fn count_attempt(outcome: &'static str, reason: &'static str) {
    metrics::counter!("auth_attempts_total", "outcome" => outcome, "reason" => reason)
        .increment(1);
}
