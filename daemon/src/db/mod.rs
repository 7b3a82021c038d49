//! Persistent store: pool bootstrap, transactions, and advisory locking.
//!
//! Repositories are free functions over a transaction or the pool, one module
//! per entity. Admission-critical sections serialize on transaction-scoped
//! advisory locks keyed by a stable 64-bit hash, released automatically on
//! commit or rollback.

use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::Result;

pub mod budget_repo;
pub mod event_repo;
pub mod project_repo;
pub mod runner_repo;
pub mod session_repo;

/// Handle over the connection pool; cheap to clone.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    pub async fn connect(cfg: &DatabaseConfig) -> std::result::Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .min_connections(cfg.pool_min)
            .max_connections(cfg.pool_max)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&cfg.url())
            .await?;

        info!(
            host = %cfg.host,
            database = %cfg.database,
            pool_max = cfg.pool_max,
            "connected to database"
        );

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Round-trip probe for readiness checks.
    pub async fn check(&self) -> std::result::Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.map(|_| ())
    }
}

/// Stable 64-bit advisory-lock key for (keyspace, key).
///
/// Derived from SHA-256 rather than a process-local hasher so every daemon
/// instance sharing the database maps the same logical section to the same
/// lock.
pub fn advisory_key(keyspace: &str, key: &str) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(keyspace.as_bytes());
    hasher.update(b":");
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Acquire a transaction-scoped advisory lock; Postgres releases it on
/// commit or rollback.
pub async fn advisory_lock(
    tx: &mut Transaction<'_, Postgres>,
    keyspace: &str,
    key: &str,
) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(advisory_key(keyspace, key))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_key_is_deterministic() {
        let a = advisory_key("project", "p-1");
        let b = advisory_key("project", "p-1");
        assert_eq!(a, b);
    }

    #[test]
    fn advisory_key_separates_keyspaces() {
        assert_ne!(advisory_key("project", "x"), advisory_key("budget", "x"));
    }

    #[test]
    fn advisory_key_is_not_prefix_ambiguous() {
        // ("ab", "c") must not collide with ("a", "bc")
        assert_ne!(advisory_key("ab", "c"), advisory_key("a", "bc"));
    }
}
