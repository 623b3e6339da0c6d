//! PostgreSQL adapters for every store port.
mod audit;
mod roles;
mod tokens;
mod users;

pub use audit::PgAudit;

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::store::Stores;

pub const DEFAULT_CREDENTIALS: &str = "postgres";
pub const DEFAULT_DATABASE_NAME: &str = "hospital";
pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Shared connection pool.
#[derive(Clone)]
pub struct Database {
    pub postgres: PgPool,
}

impl Database {
    /// Init database connections.
    pub async fn new(
        hostname: &str,
        username: &str,
        password: &str,
        db: &str,
        pool: u32,
    ) -> Result<Self, sqlx::Error> {
        let addr = format!("postgres://{username}:{password}@{hostname}/{db}");
        let pool = PgPoolOptions::new().max_connections(pool);
        let postgres = pool.connect(&addr).await?;

        tracing::info!(%hostname, %db, "postgres connected");

        Ok(Self { postgres })
    }

    /// Bundle the pool behind every store port, audit log reads included.
    pub fn stores(&self, timeout: Duration) -> Stores {
        let database = Arc::new(self.clone());
        Stores::new(
            database.clone(),
            database.clone(),
            database.clone(),
            database,
            timeout,
        )
    }
}

/// Whether `error` is a unique constraint violation.
fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .is_some_and(|error| error.is_unique_violation())
}
