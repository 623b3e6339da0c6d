//! Audit events persisted in the `logs` table.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::types::Json;
use tokio::runtime::Handle;

use super::Database;
use crate::audit::{AuditEvent, AuditSink};
use crate::error::Result;
use crate::store::{LogFilter, LogRecord, LogStore};

const LOG_FILTER: &str = r#"($1::TEXT IS NULL OR level = $1)
    AND ($2::TEXT IS NULL OR email ILIKE '%' || $2 || '%')
    AND ($3::TEXT IS NULL OR ip_address = $3)"#;

/// Sink inserting every event in the background.
#[derive(Clone)]
pub struct PgAudit {
    postgres: PgPool,
}

impl PgAudit {
    /// Create a new [`PgAudit`].
    pub fn new(database: &Database) -> Self {
        Self {
            postgres: database.postgres.clone(),
        }
    }
}

impl AuditSink for PgAudit {
    fn record(&self, event: AuditEvent) {
        let Ok(handle) = Handle::try_current() else {
            tracing::warn!(event = %event.message, "no runtime, audit event dropped");
            return;
        };

        let postgres = self.postgres.clone();
        handle.spawn(async move {
            let result = sqlx::query(
                r#"INSERT INTO logs (level, message, email, role, ip_address, attributes)
                VALUES ($1, $2, $3, $4, $5, $6)"#,
            )
            .bind(event.level.as_str())
            .bind(&event.message)
            .bind(&event.email)
            .bind(&event.role)
            .bind(&event.ip)
            .bind(Json(&event.attributes))
            .execute(&postgres)
            .await;

            if let Err(error) = result {
                tracing::warn!(%error, event = %event.message, "failed to persist audit event");
            }
        });
    }
}

#[async_trait]
impl LogStore for Database {
    async fn list_logs(&self, filter: &LogFilter) -> Result<(Vec<LogRecord>, i64)> {
        let level = filter.level.map(|level| level.as_str());

        let total = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM logs WHERE {LOG_FILTER}"
        ))
        .bind(level)
        .bind(filter.email.as_deref())
        .bind(filter.ip.as_deref())
        .fetch_one(&self.postgres)
        .await?;

        let logs = sqlx::query_as::<_, LogRecord>(&format!(
            r#"SELECT id, level, message, email, role, ip_address, attributes, created_at
            FROM logs WHERE {LOG_FILTER}
            ORDER BY created_at DESC, id DESC
            LIMIT $4 OFFSET $5"#
        ))
        .bind(level)
        .bind(filter.email.as_deref())
        .bind(filter.ip.as_deref())
        .bind(i64::from(filter.limit))
        .bind(filter.offset())
        .fetch_all(&self.postgres)
        .await?;

        Ok((logs, total))
    }
}
