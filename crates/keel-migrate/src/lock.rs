//! Migration lock.
//!
//! At most one run may inspect the ledger or execute statements at a time.
//! Dialects with native advisory locks use them; the others insert a row into
//! a dedicated lock table whose primary key rejects a second holder.
//!
//! A lock-table row survives a crashed process. Delete it by hand once no
//! migration run is active.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use sqlx::AnyConnection;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::dialect::{Dialect, LockStrategy};
use crate::error::{MigrateError, Result};
use crate::schema::{Column, ColumnType, Table, TableRef};

/// Default time to wait for the lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The lock guarding one history table.
#[derive(Debug, Clone)]
pub struct MigrationLock {
    dialect: Arc<dyn Dialect>,
    key: String,
    table: TableRef,
    timeout: Duration,
    poll_interval: Duration,
}

impl MigrationLock {
    /// Lock for runs against the ledger `history`.
    ///
    /// The key is `keel_migrate:<history>`; the lock table, where one is
    /// needed, is `<history>_lock` in the same schema.
    pub fn for_history(dialect: Arc<dyn Dialect>, history: &TableRef, timeout: Duration) -> Self {
        Self {
            dialect,
            key: format!("keel_migrate:{history}"),
            table: TableRef {
                name: format!("{}_lock", history.name),
                schema: history.schema.clone(),
            },
            timeout,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Sets how often a contended lock is retried.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Lock key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Lock table used by [`LockStrategy::Table`].
    #[must_use]
    pub fn table(&self) -> &TableRef {
        &self.table
    }

    /// Acquisition timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Takes the lock on `conn`, waiting up to the timeout.
    pub async fn acquire(&self, conn: &mut AnyConnection) -> Result<()> {
        let strategy = self.dialect.lock_strategy(&self.key);
        if strategy == LockStrategy::Table {
            self.ensure_table(conn).await?;
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let acquired = match &strategy {
                LockStrategy::Advisory { acquire, .. } => {
                    let taken: i64 = sqlx::query_scalar(acquire).fetch_one(&mut *conn).await?;
                    taken == 1
                }
                LockStrategy::Table => self.try_insert(conn).await?,
            };
            if acquired {
                info!(lock = %self.key, "Acquired migration lock");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(lock = %self.key, timeout = ?self.timeout, "Migration lock is held elsewhere");
                return Err(MigrateError::LockAcquisitionFailed {
                    lock: self.key.clone(),
                    timeout: self.timeout,
                });
            }
            debug!(lock = %self.key, "Migration lock busy, retrying");
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Releases the lock held on `conn`.
    pub async fn release(&self, conn: &mut AnyConnection) -> Result<()> {
        match self.dialect.lock_strategy(&self.key) {
            LockStrategy::Advisory { release, .. } => {
                sqlx::query(&release).execute(&mut *conn).await?;
            }
            LockStrategy::Table => {
                let sql = format!(
                    "DELETE FROM {} WHERE {} = {}",
                    self.dialect.table_name(&self.table),
                    self.dialect.identifier("name"),
                    self.dialect.placeholder(1)
                );
                sqlx::query(&sql)
                    .bind(self.key.clone())
                    .execute(&mut *conn)
                    .await?;
            }
        }
        info!(lock = %self.key, "Released migration lock");
        Ok(())
    }

    fn definition(&self) -> Table {
        let mut table = Table::new(self.table.name.clone())
            .column(Column::new("name", ColumnType::String).length(255).primary_key())
            .column(Column::new("acquired_at", ColumnType::String).length(40).not_null());
        table.schema = self.table.schema.clone();
        table
    }

    async fn table_exists(&self, conn: &mut AnyConnection) -> Result<bool> {
        let sql = self.dialect.table_exists_sql(&self.table);
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&mut *conn).await?;
        Ok(count > 0)
    }

    async fn ensure_table(&self, conn: &mut AnyConnection) -> Result<()> {
        if self.table_exists(conn).await? {
            return Ok(());
        }
        for sql in self.dialect.create_table(&self.definition())? {
            if let Err(err) = sqlx::query(&sql).execute(&mut *conn).await {
                // Another run may have created it in the meantime.
                if self.table_exists(conn).await? {
                    return Ok(());
                }
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Inserts the lock row; false when another holder's row is in the way.
    async fn try_insert(&self, conn: &mut AnyConnection) -> Result<bool> {
        let sql = format!(
            "INSERT INTO {} ({}, {}) VALUES ({}, {})",
            self.dialect.table_name(&self.table),
            self.dialect.identifier("name"),
            self.dialect.identifier("acquired_at"),
            self.dialect.placeholder(1),
            self.dialect.placeholder(2)
        );
        let result = sqlx::query(&sql)
            .bind(self.key.clone())
            .bind(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true))
            .execute(&mut *conn)
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                debug!(lock = %self.key, error = %err, "Lock row insert rejected");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{MySqlDialect, SqliteDialect};
    use sqlx::any::AnyPoolOptions;
    use sqlx::AnyPool;
    use tempfile::TempDir;

    async fn file_pool(dir: &TempDir) -> AnyPool {
        sqlx::any::install_default_drivers();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("lock.db").display());
        AnyPoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .unwrap()
    }

    fn lock(timeout: Duration) -> MigrationLock {
        MigrationLock::for_history(
            Arc::new(SqliteDialect::new()),
            &TableRef::new("schema_history"),
            timeout,
        )
        .with_poll_interval(Duration::from_millis(20))
    }

    #[test]
    fn test_names() {
        let lock = MigrationLock::for_history(
            Arc::new(MySqlDialect::new()),
            &TableRef::new("schema_history").in_schema("app"),
            DEFAULT_LOCK_TIMEOUT,
        );
        assert_eq!(lock.key(), "keel_migrate:app.schema_history");
        assert_eq!(lock.table().name, "schema_history_lock");
        assert_eq!(lock.table().schema.as_deref(), Some("app"));
    }

    #[tokio::test]
    async fn test_second_holder_times_out() {
        let dir = TempDir::new().unwrap();
        let pool = file_pool(&dir).await;
        let mut first = pool.acquire().await.unwrap();
        let mut second = pool.acquire().await.unwrap();

        lock(Duration::from_secs(5)).acquire(&mut first).await.unwrap();

        let err = lock(Duration::from_millis(150))
            .acquire(&mut second)
            .await
            .unwrap_err();
        match err {
            MigrateError::LockAcquisitionFailed { lock, timeout } => {
                assert_eq!(lock, "keel_migrate:schema_history");
                assert_eq!(timeout, Duration::from_millis(150));
            }
            other => panic!("unexpected error {other}"),
        }

        lock(Duration::from_secs(5)).release(&mut first).await.unwrap();
        lock(Duration::from_secs(5)).acquire(&mut second).await.unwrap();
        lock(Duration::from_secs(5)).release(&mut second).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_insert_is_not_reported_as_busy() {
        let dir = TempDir::new().unwrap();
        let pool = file_pool(&dir).await;
        let mut conn = pool.acquire().await.unwrap();
        sqlx::query(
            "CREATE TABLE schema_history_lock (name TEXT PRIMARY KEY, acquired_at TEXT NOT NULL CHECK (acquired_at = 'never'))",
        )
        .execute(&mut *conn)
        .await
        .unwrap();

        let started = Instant::now();
        let err = lock(Duration::from_secs(5))
            .acquire(&mut conn)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Database(_)), "got {err}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let dir = TempDir::new().unwrap();
        let pool = file_pool(&dir).await;
        let mut first = pool.acquire().await.unwrap();
        let mut second = pool.acquire().await.unwrap();

        lock(Duration::from_secs(5)).acquire(&mut first).await.unwrap();
        let waiter = tokio::spawn(async move {
            let result = lock(Duration::from_secs(5)).acquire(&mut second).await;
            (result, second)
        });
        sleep(Duration::from_millis(100)).await;
        lock(Duration::from_secs(5)).release(&mut first).await.unwrap();

        let (result, _second) = waiter.await.unwrap();
        result.unwrap();
    }
}
