//! Refresh token records.

use async_trait::async_trait;

use super::Database;
use crate::error::Result;
use crate::store::{NewRefreshToken, RefreshTokenStore, UserId};

const INSERT_TOKEN: &str = r#"INSERT INTO refresh_tokens (user_id, token, expires_at, ip_address)
    VALUES ($1, $2, $3, $4)"#;

#[async_trait]
impl RefreshTokenStore for Database {
    async fn store(&self, token: NewRefreshToken) -> Result<()> {
        sqlx::query(INSERT_TOKEN)
            .bind(token.user_id)
            .bind(&token.token)
            .bind(token.expires_at)
            .bind(&token.ip_address)
            .execute(&self.postgres)
            .await?;

        Ok(())
    }

    async fn rotate(
        &self,
        old: &str,
        user_id: UserId,
        replacement: NewRefreshToken,
    ) -> Result<bool> {
        let mut tx = self.postgres.begin().await?;

        // Only one concurrent caller can flip the row.
        let revoked = sqlx::query_scalar::<_, i64>(
            r#"UPDATE refresh_tokens SET revoked = TRUE
            WHERE token = $1 AND user_id = $2 AND revoked = FALSE AND expires_at > NOW()
            RETURNING id"#,
        )
        .bind(old)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        if revoked.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(INSERT_TOKEN)
            .bind(replacement.user_id)
            .bind(&replacement.token)
            .bind(replacement.expires_at)
            .bind(&replacement.ip_address)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(true)
    }

    async fn revoke_all_for_user(&self, user_id: UserId) -> Result<u64> {
        Ok(sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE WHERE user_id = $1 AND revoked = FALSE",
        )
        .bind(user_id)
        .execute(&self.postgres)
        .await?
        .rows_affected())
    }

    async fn revoke_all(&self) -> Result<u64> {
        Ok(
            sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE revoked = FALSE")
                .execute(&self.postgres)
                .await?
                .rows_affected(),
        )
    }
}
