//! Database connection pool, migrations, and health check.
//!
//! One Postgres pool backs the pgmq lane queues, the `task_results` table
//! and the `task_events` notification channel.

pub mod pgmq;
pub mod results;

use crate::error::{Error, Result};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Check the connection and that the pgmq extension is installed.
    pub async fn health_check(&self) -> Result<()> {
        let installed: Option<(String,)> =
            sqlx::query_as("SELECT extversion FROM pg_extension WHERE extname = 'pgmq'")
                .fetch_optional(&self.pool)
                .await?;
        if installed.is_none() {
            return Err(Error::Broker("pgmq extension is not installed".to_string()));
        }
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
