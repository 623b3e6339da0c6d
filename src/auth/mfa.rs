//! MFA management for signed-in accounts.

use crate::audit::{AuditEvent, Level};
use crate::auth::{Authenticator, Rejection};
use crate::error::{Result, ServerError};
use crate::mfa::{Enrollment, MfaState};
use crate::middleware::Identity;

impl Authenticator {
    /// Issue a new secret after checking the password again.
    ///
    /// Without confirmed MFA the secret stays pending until
    /// [`Authenticator::verify_mfa`] succeeds. An enabled account must also
    /// present its current TOTP or a backup code, and stays enabled under the
    /// new secret.
    pub async fn setup_mfa(
        &self,
        identity: &Identity,
        password: &str,
        code: Option<&str>,
        ip: Option<&str>,
    ) -> Result<Enrollment> {
        let user = self.current_user(identity.user_id).await?;

        if !self.passwords.verify_password(password, &user.password) {
            self.setup_rejected(&user.email, identity, ip, "wrong_password");
            return Err(ServerError::InvalidCredentials);
        }

        let state = user.mfa_state()?;
        let issued = match &state {
            MfaState::Enabled { secret, .. } => {
                let code = code.map(str::trim).filter(|code| !code.is_empty());
                let proof = match code {
                    Some(code) => self.second_factor(user.id, &state, code).await,
                    None => Err(Rejection::new("mfa_code_required", ServerError::InvalidMfaCode)),
                };
                if let Err(rejection) = proof {
                    self.setup_rejected(&user.email, identity, ip, rejection.reason);
                    return Err(rejection.error);
                }

                let (enrollment, codes) = Enrollment::issue(&self.totp, &user.email);
                let rekeyed = self
                    .stores
                    .within(self.stores.credentials.rekey_mfa(
                        user.id,
                        secret.as_str(),
                        enrollment.secret.as_str(),
                        &codes,
                    ))
                    .await?;
                rekeyed.then_some(enrollment)
            },
            MfaState::Disabled | MfaState::Pending { .. } => self.enroll(&user).await?,
        };

        let Some(enrollment) = issued else {
            self.setup_rejected(&user.email, identity, ip, "enrollment_superseded");
            return Err(ServerError::InvalidMfaCode);
        };

        let message = if matches!(state, MfaState::Enabled { .. }) {
            "mfa rekeyed"
        } else {
            "mfa setup started"
        };
        self.record(
            AuditEvent::new(Level::Info, message)
                .email(&user.email)
                .role(&identity.role)
                .ip(ip),
        );

        Ok(enrollment)
    }

    fn setup_rejected(&self, email: &str, identity: &Identity, ip: Option<&str>, reason: &str) {
        self.record(
            AuditEvent::new(Level::Warning, "mfa setup rejected")
                .email(email)
                .role(&identity.role)
                .ip(ip)
                .attribute("reason", reason),
        );
    }

    /// Confirm a pending secret.
    pub async fn verify_mfa(
        &self,
        identity: &Identity,
        code: &str,
        ip: Option<&str>,
    ) -> Result<()> {
        let user = self.current_user(identity.user_id).await?;
        let code = code.trim();

        let result = match user.mfa_state()? {
            MfaState::Disabled => Err(Rejection::new(
                "mfa_not_enrolled",
                ServerError::InvalidMfaCode,
            )),
            MfaState::Enabled { secret, .. } => {
                if self.totp.verify(&secret, code) {
                    Ok("already_enabled")
                } else {
                    Err(Rejection::new("invalid_mfa_code", ServerError::InvalidMfaCode))
                }
            },
            MfaState::Pending { secret, .. } => {
                if !self.totp.verify(&secret, code) {
                    Err(Rejection::new("invalid_mfa_code", ServerError::InvalidMfaCode))
                } else if self
                    .stores
                    .within(self.stores.credentials.confirm_mfa(user.id, secret.as_str()))
                    .await?
                {
                    Ok("enabled")
                } else {
                    Err(Rejection::new(
                        "enrollment_superseded",
                        ServerError::InvalidMfaCode,
                    ))
                }
            },
        };

        self.finish(result, &user.email, identity, ip, "mfa verified", "mfa verification rejected")
    }

    /// Clear every MFA column. Requires a valid TOTP or backup code.
    pub async fn disable_mfa(
        &self,
        identity: &Identity,
        code: &str,
        ip: Option<&str>,
    ) -> Result<()> {
        let user = self.current_user(identity.user_id).await?;
        let state = user.mfa_state()?;

        let result = if matches!(state, MfaState::Disabled) {
            Err(Rejection::new(
                "mfa_not_enrolled",
                ServerError::Conflict("MFA is not enabled.".into()),
            ))
        } else {
            match self.second_factor(user.id, &state, code.trim()).await {
                Ok(factor) => {
                    self.stores
                        .within(self.stores.credentials.clear_mfa(user.id))
                        .await?;
                    Ok(factor)
                },
                Err(rejection) => Err(rejection),
            }
        };

        self.finish(result, &user.email, identity, ip, "mfa disabled", "mfa disable rejected")
    }

    fn finish(
        &self,
        result: std::result::Result<&'static str, Rejection>,
        email: &str,
        identity: &Identity,
        ip: Option<&str>,
        success: &str,
        failure: &str,
    ) -> Result<()> {
        let event = match &result {
            Ok(detail) => AuditEvent::new(Level::Success, success).attribute("detail", detail),
            Err(rejection) => AuditEvent::new(Level::Warning, failure)
                .attribute("reason", rejection.reason),
        };
        self.record(event.email(email).role(&identity.role).ip(ip));

        result.map(|_| ()).map_err(|rejection| rejection.error)
    }
}
