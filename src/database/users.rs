//! Accounts and their MFA columns.

use async_trait::async_trait;

use super::{Database, is_unique_violation};
use crate::error::{Result, ServerError};
use crate::mfa::BackupCodes;
use crate::store::{CredentialStore, NewUser, UserId, UserRecord, UserUpdate};

const USER_COLUMNS: &str = "id, name, surname, email, password, role_id, birth_date, \
    mfa_enabled, mfa_secret, backup_codes, created_at, updated_at";

#[async_trait]
impl CredentialStore for Database {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        Ok(
            sqlx::query_as::<_, UserRecord>(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
            ))
            .bind(email)
            .fetch_optional(&self.postgres)
            .await?,
        )
    }

    async fn find_by_id(&self, id: UserId) -> Result<Option<UserRecord>> {
        Ok(
            sqlx::query_as::<_, UserRecord>(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
            ))
            .bind(id)
            .fetch_optional(&self.postgres)
            .await?,
        )
    }

    async fn list(&self) -> Result<Vec<UserRecord>> {
        Ok(
            sqlx::query_as::<_, UserRecord>(&format!(
                "SELECT {USER_COLUMNS} FROM users ORDER BY id"
            ))
            .fetch_all(&self.postgres)
            .await?,
        )
    }

    async fn email_exists(&self, email: &str) -> Result<bool> {
        Ok(
            sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM users WHERE email = $1)")
                .bind(email)
                .fetch_one(&self.postgres)
                .await?,
        )
    }

    async fn insert(&self, user: NewUser) -> Result<UserRecord> {
        sqlx::query_as::<_, UserRecord>(&format!(
            r#"INSERT INTO users (name, surname, email, password, role_id, birth_date)
            VALUES ($1, $2, $3, $4, $5, $6) RETURNING {USER_COLUMNS}"#
        ))
        .bind(&user.name)
        .bind(&user.surname)
        .bind(&user.email)
        .bind(&user.password)
        .bind(user.role_id)
        .bind(user.birth_date)
        .fetch_one(&self.postgres)
        .await
        .map_err(|error| {
            // Two registrations raced past the existence check.
            if is_unique_violation(&error) {
                ServerError::Conflict("Email is already registered.".into())
            } else {
                error.into()
            }
        })
    }

    async fn update_password(&self, id: UserId, password: &str) -> Result<()> {
        let result = sqlx::query("UPDATE users SET password = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(password)
            .execute(&self.postgres)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ServerError::NotFound);
        }
        Ok(())
    }

    async fn update(&self, id: UserId, changes: UserUpdate) -> Result<Option<UserRecord>> {
        sqlx::query_as::<_, UserRecord>(&format!(
            r#"UPDATE users SET
                name = COALESCE($2, name),
                surname = COALESCE($3, surname),
                email = COALESCE($4, email),
                birth_date = COALESCE($5, birth_date),
                role_id = COALESCE($6, role_id),
                updated_at = NOW()
            WHERE id = $1 RETURNING {USER_COLUMNS}"#
        ))
        .bind(id)
        .bind(changes.name)
        .bind(changes.surname)
        .bind(changes.email)
        .bind(changes.birth_date)
        .bind(changes.role_id)
        .fetch_optional(&self.postgres)
        .await
        .map_err(|error| {
            if is_unique_violation(&error) {
                ServerError::Conflict("Email is already registered.".into())
            } else {
                error.into()
            }
        })
    }

    async fn delete(&self, id: UserId) -> Result<bool> {
        // `refresh_tokens` rows go with the account (ON DELETE CASCADE).
        let result = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(&self.postgres)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn store_pending_mfa(
        &self,
        id: UserId,
        secret: &str,
        codes: &BackupCodes,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE users SET mfa_secret = $2, backup_codes = $3, updated_at = NOW()
            WHERE id = $1 AND mfa_enabled = FALSE"#,
        )
        .bind(id)
        .bind(secret)
        .bind(codes.to_column())
        .execute(&self.postgres)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn rekey_mfa(
        &self,
        id: UserId,
        current: &str,
        secret: &str,
        codes: &BackupCodes,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE users SET mfa_secret = $3, backup_codes = $4, updated_at = NOW()
            WHERE id = $1 AND mfa_enabled = TRUE AND mfa_secret = $2"#,
        )
        .bind(id)
        .bind(current)
        .bind(secret)
        .bind(codes.to_column())
        .execute(&self.postgres)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn confirm_mfa(&self, id: UserId, secret: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE users SET mfa_enabled = TRUE, updated_at = NOW()
            WHERE id = $1 AND mfa_secret = $2 AND mfa_enabled = FALSE"#,
        )
        .bind(id)
        .bind(secret)
        .execute(&self.postgres)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn swap_backup_codes(
        &self,
        id: UserId,
        expected: &BackupCodes,
        remaining: &BackupCodes,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"UPDATE users SET backup_codes = $3, updated_at = NOW()
            WHERE id = $1 AND backup_codes = $2"#,
        )
        .bind(id)
        .bind(expected.to_column())
        .bind(remaining.to_column())
        .execute(&self.postgres)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn clear_mfa(&self, id: UserId) -> Result<()> {
        sqlx::query(
            r#"UPDATE users SET mfa_enabled = FALSE, mfa_secret = NULL, backup_codes = NULL,
            updated_at = NOW() WHERE id = $1"#,
        )
        .bind(id)
        .execute(&self.postgres)
        .await?;

        Ok(())
    }
}
