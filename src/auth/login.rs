//! Login state machine.

use crate::audit::{AuditEvent, Level};
use crate::auth::{Authenticator, Rejection, count_attempt};
use crate::error::{Result, ServerError};
use crate::mfa::{Enrollment, MfaState};
use crate::store::UserProfile;
use crate::token::TokenPair;

/// Credentials submitted to `POST /auth/login`.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    pub mfa_code: Option<String>,
    pub ip: Option<String>,
}

/// Tokens handed out at the end of a successful login.
#[derive(Debug, Clone)]
pub struct Session {
    pub tokens: TokenPair,
    pub user: UserProfile,
}

/// Where a login attempt stopped.
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    /// No confirmed MFA yet: a new secret was stored and must be confirmed by
    /// logging in again with a code.
    EnrollmentRequired(Enrollment),
    /// MFA is enabled and no code was submitted.
    CodeRequired,
    Authenticated(Box<Session>),
}

impl LoginOutcome {
    fn label(&self) -> (Level, &'static str, &'static str) {
        match self {
            LoginOutcome::EnrollmentRequired(_) => {
                (Level::Info, "mfa enrollment issued", "enrollment_required")
            },
            LoginOutcome::CodeRequired => (Level::Info, "mfa code requested", "code_required"),
            LoginOutcome::Authenticated(_) => (Level::Success, "login succeeded", "authenticated"),
        }
    }
}

impl Authenticator {
    /// Run one login round trip. Emits exactly one audit event.
    pub async fn login(&self, request: LoginRequest) -> Result<LoginOutcome> {
        let ip = request.ip.as_deref();

        match self.attempt(&request).await {
            Ok((outcome, factor)) => {
                let (level, message, label) = outcome.label();
                count_attempt(label, factor);

                let mut event = AuditEvent::new(level, message)
                    .email(&request.email)
                    .ip(ip)
                    .attribute("outcome", label);
                if let LoginOutcome::Authenticated(session) = &outcome {
                    event = event
                        .attribute("user_id", session.user.id)
                        .attribute("factor", factor);
                }
                self.record(event);

                Ok(outcome)
            },
            Err(Rejection { reason, error }) => {
                count_attempt("rejected", reason);
                let level = if error.is_dependency() {
                    Level::Error
                } else {
                    Level::Warning
                };
                self.record(
                    AuditEvent::new(level, "login rejected")
                        .email(&request.email)
                        .ip(ip)
                        .attribute("outcome", "rejected")
                        .attribute("reason", reason),
                );

                Err(error)
            },
        }
    }

    async fn attempt(
        &self,
        request: &LoginRequest,
    ) -> std::result::Result<(LoginOutcome, &'static str), Rejection> {
        let code = request
            .mfa_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty());

        let user = self
            .stores
            .within(self.stores.credentials.find_by_email(&request.email))
            .await?;
        let Some(user) = user else {
            self.passwords.decoy(&request.password);
            return Err(Rejection::new(
                "unknown_email",
                ServerError::InvalidCredentials,
            ));
        };

        if !self.passwords.verify_password(&request.password, &user.password) {
            return Err(Rejection::new(
                "wrong_password",
                ServerError::InvalidCredentials,
            ));
        }

        let state = user
            .mfa_state()
            .map_err(|error| Rejection::new("unreadable_mfa_state", error))?;

        let factor = match (state, code) {
            (MfaState::Enabled { .. }, None) => {
                return Ok((LoginOutcome::CodeRequired, "none"));
            },
            (MfaState::Disabled | MfaState::Pending { .. }, None) => {
                return match self.enroll(&user).await? {
                    Some(enrollment) => {
                        Ok((LoginOutcome::EnrollmentRequired(enrollment), "none"))
                    },
                    // Confirmed by a concurrent login.
                    None => Ok((LoginOutcome::CodeRequired, "none")),
                };
            },
            (MfaState::Disabled, Some(_)) => {
                return Err(Rejection::new(
                    "mfa_not_enrolled",
                    ServerError::InvalidMfaCode,
                ));
            },
            (MfaState::Pending { secret, .. }, Some(code)) => {
                if !self.totp.verify(&secret, code) {
                    return Err(Rejection::new(
                        "invalid_enrollment_code",
                        ServerError::InvalidMfaCode,
                    ));
                }

                let confirmed = self
                    .stores
                    .within(self.stores.credentials.confirm_mfa(user.id, secret.as_str()))
                    .await?;
                if !confirmed {
                    // A concurrent login replaced the secret.
                    return Err(Rejection::new(
                        "enrollment_superseded",
                        ServerError::InvalidMfaCode,
                    ));
                }

                "totp_enrollment"
            },
            (state @ MfaState::Enabled { .. }, Some(code)) => {
                self.second_factor(user.id, &state, code).await?
            },
        };

        let tokens = self
            .sessions
            .open(user.id, user.role_id, request.ip.as_deref())
            .await?;
        let mut profile = user.profile();
        profile.mfa_enabled = true;

        Ok((
            LoginOutcome::Authenticated(Box::new(Session {
                tokens,
                user: profile,
            })),
            factor,
        ))
    }
}
