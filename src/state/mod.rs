/// Database state layer for the gateway.
///
/// Manages PostgreSQL connections and provides typed access to:
/// - Registration tasks and their status history
/// - The preburn transaction pool
/// - The public registration-ticket index
/// - Account balances
pub mod models;
pub mod repository;

use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres};

use crate::error::Result;

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

/// Session-scoped advisory lock held by a control loop.
///
/// The lock lives as long as the underlying connection; dropping the
/// guard returns the connection and releases the lock with it.
pub struct LoopLock {
    conn: PoolConnection<Postgres>,
    key: i64,
}

/// Stable advisory-lock key for a loop name.
fn lock_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    i64::from_be_bytes(digest[..8].try_into().unwrap())
}

impl Database {
    /// Connect to PostgreSQL.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Run pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                crate::error::GatewayError::Config(format!("migration failed: {e}"))
            })
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Try to become the single runner of a named control loop.
    ///
    /// Returns None when another session already holds the lock.
    pub async fn try_loop_lock(&self, name: &str) -> Result<Option<LoopLock>> {
        let mut conn = self.pool.acquire().await?;
        let key = lock_key(name);
        let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;

        if locked {
            Ok(Some(LoopLock { conn, key }))
        } else {
            Ok(None)
        }
    }
}

impl LoopLock {
    /// Release the lock explicitly instead of waiting for session end.
    pub async fn release(mut self) -> Result<()> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key_is_stable() {
        assert_eq!(lock_key("finisher"), lock_key("finisher"));
        assert_ne!(lock_key("finisher"), lock_key("re_processor"));
        assert_ne!(lock_key("finisher"), lock_key("fee_pre_burner"));
    }
}
