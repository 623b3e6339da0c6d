//! Registration, password changes and session sweeps.

use chrono::NaiveDate;

use crate::audit::{AuditEvent, Level};
use crate::auth::Authenticator;
use crate::error::{Result, ServerError};
use crate::middleware::Identity;
use crate::store::{NewUser, UserId, UserProfile, UserUpdate};

/// Data needed to create an account.
#[derive(Debug, Clone)]
pub struct Registration {
    pub name: String,
    pub surname: String,
    pub email: String,
    pub password: String,
    pub birth_date: Option<NaiveDate>,
    pub ip: Option<String>,
}

impl Authenticator {
    /// Create an account with the configured default role.
    pub async fn register(&self, registration: Registration) -> Result<UserProfile> {
        self.policy.validate(&registration.password)?;

        let exists = self
            .stores
            .within(self.stores.credentials.email_exists(&registration.email))
            .await?;
        if exists {
            self.record(
                AuditEvent::new(Level::Warning, "registration rejected")
                    .email(&registration.email)
                    .ip(registration.ip.as_deref())
                    .attribute("reason", "duplicate_email"),
            );
            return Err(ServerError::Conflict("Email is already registered.".into()));
        }

        let role = self
            .stores
            .within(self.stores.permissions.find_role_by_name(&self.default_role))
            .await?
            .filter(|role| role.active)
            .ok_or_else(|| ServerError::Internal {
                details: format!("default role `{}` is missing or inactive", self.default_role),
                source: None,
            })?;

        let password = self.passwords.hash_password(&registration.password)?;
        let user = self
            .stores
            .within(self.stores.credentials.insert(NewUser {
                name: registration.name,
                surname: registration.surname,
                email: registration.email,
                password,
                role_id: role.id,
                birth_date: registration.birth_date,
            }))
            .await?;

        self.record(
            AuditEvent::new(Level::Success, "account registered")
                .email(&user.email)
                .role(&role.name)
                .ip(registration.ip.as_deref())
                .attribute("user_id", user.id),
        );

        Ok(user.profile())
    }

    /// Replace the password after checking the current one. Every refresh
    /// token of the account is revoked; returns how many.
    pub async fn change_password(
        &self,
        identity: &Identity,
        current: &str,
        new: &str,
        ip: Option<&str>,
    ) -> Result<u64> {
        let user = self.current_user(identity.user_id).await?;

        if !self.passwords.verify_password(current, &user.password) {
            self.record(
                AuditEvent::new(Level::Warning, "password change rejected")
                    .email(&user.email)
                    .role(&identity.role)
                    .ip(ip)
                    .attribute("reason", "wrong_password"),
            );
            return Err(ServerError::InvalidCredentials);
        }
        self.policy.validate(new)?;

        let password = self.passwords.hash_password(new)?;
        self.stores
            .within(self.stores.credentials.update_password(user.id, &password))
            .await?;
        let revoked = self.sessions.revoke_user(user.id).await?;

        self.record(
            AuditEvent::new(Level::Success, "password changed")
                .email(&user.email)
                .role(&identity.role)
                .ip(ip)
                .attribute("revoked_sessions", revoked),
        );

        Ok(revoked)
    }

    /// Revoke every refresh token of the caller.
    pub async fn logout(&self, identity: &Identity, ip: Option<&str>) -> Result<u64> {
        let revoked = self.sessions.revoke_user(identity.user_id).await?;
        self.record(
            AuditEvent::new(Level::Info, "logged out")
                .role(&identity.role)
                .ip(ip)
                .attribute("user_id", identity.user_id)
                .attribute("revoked_sessions", revoked),
        );

        Ok(revoked)
    }

    /// Revoke every refresh token of every account.
    pub async fn revoke_all_sessions(&self, identity: &Identity, ip: Option<&str>) -> Result<u64> {
        let revoked = self.sessions.revoke_everyone().await?;
        self.record(
            AuditEvent::new(Level::Warning, "all sessions revoked")
                .role(&identity.role)
                .ip(ip)
                .attribute("user_id", identity.user_id)
                .attribute("revoked_sessions", revoked),
        );

        Ok(revoked)
    }

    /// Apply administrative changes to an account. A new role must exist and
    /// be active.
    pub async fn update_user(
        &self,
        identity: &Identity,
        id: UserId,
        changes: UserUpdate,
        ip: Option<&str>,
    ) -> Result<UserProfile> {
        let fields = changed_fields(&changes);
        if fields.is_empty() {
            return Err(ServerError::InvalidField {
                field: "body",
                message: "At least one field must be provided.".into(),
            });
        }

        if let Some(role_id) = changes.role_id {
            let role = self
                .stores
                .within(self.stores.permissions.find_role(role_id))
                .await?;
            if !role.is_some_and(|role| role.active) {
                return Err(ServerError::InvalidField {
                    field: "role_id",
                    message: "Role does not exist or is inactive.".into(),
                });
            }
        }

        let user = self
            .stores
            .within(self.stores.credentials.update(id, changes))
            .await?
            .ok_or(ServerError::NotFound)?;

        self.record(
            AuditEvent::new(Level::Info, "user updated")
                .email(&user.email)
                .role(&identity.role)
                .ip(ip)
                .attribute("user_id", user.id)
                .attribute("updated_by", identity.user_id)
                .attribute("fields", fields.join(",")),
        );

        Ok(user.profile())
    }

    /// Delete another account along with its sessions.
    pub async fn delete_user(&self, identity: &Identity, id: UserId, ip: Option<&str>) -> Result<()> {
        if id == identity.user_id {
            return Err(ServerError::Conflict("An account cannot delete itself.".into()));
        }

        let user = self.current_user(id).await?;
        let deleted = self
            .stores
            .within(self.stores.credentials.delete(id))
            .await?;
        if !deleted {
            return Err(ServerError::NotFound);
        }

        self.record(
            AuditEvent::new(Level::Warning, "user deleted")
                .email(&user.email)
                .role(&identity.role)
                .ip(ip)
                .attribute("user_id", id)
                .attribute("deleted_by", identity.user_id),
        );

        Ok(())
    }

    pub async fn profile(&self, id: UserId) -> Result<UserProfile> {
        Ok(self.current_user(id).await?.profile())
    }

    pub async fn users(&self) -> Result<Vec<UserProfile>> {
        Ok(self
            .stores
            .within(self.stores.credentials.list())
            .await?
            .iter()
            .map(|user| user.profile())
            .collect())
    }
}

fn changed_fields(changes: &UserUpdate) -> Vec<&'static str> {
    [
        ("name", changes.name.is_some()),
        ("surname", changes.surname.is_some()),
        ("email", changes.email.is_some()),
        ("birth_date", changes.birth_date.is_some()),
        ("role_id", changes.role_id.is_some()),
    ]
    .into_iter()
    .filter_map(|(field, changed)| changed.then_some(field))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::LoginOutcome;
    use crate::auth::tests::{Harness, PASSWORD};
    use crate::password::PolicyError;
    use crate::store::memory::{ADMIN_ROLE, DOCTOR_ROLE, PATIENT_ROLE, RETIRED_ROLE};
    use crate::totp::TotpSecret;

    fn registration(email: &str, password: &str) -> Registration {
        Registration {
            name: "Alice".into(),
            surname: "Liddell".into(),
            email: email.into(),
            password: password.into(),
            birth_date: NaiveDate::from_ymd_opt(1990, 5, 4),
            ip: None,
        }
    }

    #[tokio::test]
    async fn test_register() {
        let harness = Harness::new();
        let profile = harness
            .auth
            .register(registration("alice@example.com", "Sup3r-Secret-Pass"))
            .await
            .unwrap();

        assert_eq!(profile.role_id, PATIENT_ROLE);
        assert!(!profile.mfa_enabled);
        let stored = harness.store.user(profile.id).unwrap();
        assert!(stored.password.starts_with("$argon2id$"));
        assert_ne!(stored.password, "Sup3r-Secret-Pass");
    }

    #[tokio::test]
    async fn test_register_rejects_weak_and_duplicate() {
        let harness = Harness::new();

        let weak = harness
            .auth
            .register(registration("alice@example.com", "Abc12345!@x"))
            .await;
        assert!(matches!(weak, Err(ServerError::Policy(PolicyError::TooShort(12)))));

        harness
            .auth
            .register(registration("alice@example.com", "Sup3r-Secret-Pass"))
            .await
            .unwrap();
        let duplicate = harness
            .auth
            .register(registration("alice@example.com", "Sup3r-Secret-Pass"))
            .await;
        assert!(matches!(duplicate, Err(ServerError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_change_password_revokes_sessions() {
        let harness = Harness::new();
        let user = harness.user("jack@example.com");
        let secret = TotpSecret::generate();
        harness.store.set_mfa(user.id, true, Some(secret.as_str()), None);
        let code = harness.totp.generate(&secret).unwrap();
        let LoginOutcome::Authenticated(session) = harness
            .auth
            .login(harness.login("jack@example.com", Some(&code)))
            .await
            .unwrap()
        else {
            panic!("expected tokens");
        };

        let identity = Identity {
            user_id: user.id,
            role_id: user.role_id,
            role: "patient".into(),
        };
        let revoked = harness
            .auth
            .change_password(&identity, PASSWORD, "Brand-New-Pass-7", None)
            .await
            .unwrap();
        assert_eq!(revoked, 1);
        assert!(
            harness
                .auth
                .sessions()
                .rotate(&session.tokens.refresh_token, None)
                .await
                .is_err()
        );

        let stored = harness.store.user(user.id).unwrap();
        assert!(harness.passwords.verify_password("Brand-New-Pass-7", &stored.password));
    }

    #[tokio::test]
    async fn test_change_password_checks_current_and_policy() {
        let harness = Harness::new();
        let user = harness.user("kate@example.com");
        let identity = Identity {
            user_id: user.id,
            role_id: user.role_id,
            role: "patient".into(),
        };

        let wrong = harness
            .auth
            .change_password(&identity, "Wrong-Current-1", "Brand-New-Pass-7", None)
            .await;
        assert!(matches!(wrong, Err(ServerError::InvalidCredentials)));

        let weak = harness
            .auth
            .change_password(&identity, PASSWORD, "weakpassword", None)
            .await;
        assert!(matches!(weak, Err(ServerError::Policy(_))));
    }

    fn admin(harness: &Harness) -> Identity {
        let user = harness.store.seed_user("root@example.com", "hash", ADMIN_ROLE);
        Identity {
            user_id: user.id,
            role_id: ADMIN_ROLE,
            role: "admin".into(),
        }
    }

    #[tokio::test]
    async fn test_update_user() {
        let harness = Harness::new();
        let admin = admin(&harness);
        let user = harness.user("liam@example.com");

        let profile = harness
            .auth
            .update_user(
                &admin,
                user.id,
                UserUpdate {
                    surname: Some("Gallagher".into()),
                    role_id: Some(DOCTOR_ROLE),
                    ..Default::default()
                },
                Some("10.0.0.9"),
            )
            .await
            .unwrap();
        assert_eq!(profile.surname, "Gallagher");
        assert_eq!(profile.role_id, DOCTOR_ROLE);
        assert_eq!(profile.name, user.name);
        assert_eq!(profile.email, user.email);

        let events = harness.audit.events();
        let event = events.last().unwrap();
        assert_eq!(event.message, "user updated");
        assert_eq!(event.attributes["fields"], "surname,role_id");
        assert_eq!(event.attributes["updated_by"], admin.user_id.to_string());
    }

    #[tokio::test]
    async fn test_update_user_rejections() {
        let harness = Harness::new();
        let admin = admin(&harness);
        let user = harness.user("mia@example.com");
        harness.user("noah@example.com");

        let empty = harness
            .auth
            .update_user(&admin, user.id, UserUpdate::default(), None)
            .await;
        assert!(matches!(empty, Err(ServerError::InvalidField { field: "body", .. })));

        for role_id in [RETIRED_ROLE, 99] {
            let role = harness
                .auth
                .update_user(
                    &admin,
                    user.id,
                    UserUpdate {
                        role_id: Some(role_id),
                        ..Default::default()
                    },
                    None,
                )
                .await;
            assert!(matches!(role, Err(ServerError::InvalidField { field: "role_id", .. })));
        }
        assert_eq!(harness.store.user(user.id).unwrap().role_id, PATIENT_ROLE);

        let taken = harness
            .auth
            .update_user(
                &admin,
                user.id,
                UserUpdate {
                    email: Some("noah@example.com".into()),
                    ..Default::default()
                },
                None,
            )
            .await;
        assert!(matches!(taken, Err(ServerError::Conflict(_))));

        let missing = harness
            .auth
            .update_user(
                &admin,
                999,
                UserUpdate {
                    name: Some("Ghost".into()),
                    ..Default::default()
                },
                None,
            )
            .await;
        assert!(matches!(missing, Err(ServerError::NotFound)));
    }

    #[tokio::test]
    async fn test_delete_user_revokes_sessions() {
        let harness = Harness::new();
        let admin = admin(&harness);
        let user = harness.user("olga@example.com");
        let session = harness.auth.sessions().open(user.id, user.role_id, None).await.unwrap();

        harness.auth.delete_user(&admin, user.id, None).await.unwrap();
        assert!(harness.store.user(user.id).is_none());
        assert!(harness.store.tokens().is_empty());
        assert!(
            harness
                .auth
                .sessions()
                .rotate(&session.refresh_token, None)
                .await
                .is_err()
        );

        let event = harness.audit.events().pop().unwrap();
        assert_eq!(event.level, Level::Warning);
        assert_eq!(event.email.as_deref(), Some("olga@example.com"));

        let again = harness.auth.delete_user(&admin, user.id, None).await;
        assert!(matches!(again, Err(ServerError::NotFound)));
        let own = harness.auth.delete_user(&admin, admin.user_id, None).await;
        assert!(matches!(own, Err(ServerError::Conflict(_))));
    }
}
