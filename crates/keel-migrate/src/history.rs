//! Migration history ledger.
//!
//! The ledger (`schema_history` by default) holds one row per migration
//! version that was ever applied. Reverting keeps the row and clears its
//! `applied` flag so the ledger stays a durable record of what has run.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::AnyConnection;
use tracing::debug;

use crate::dialect::Dialect;
use crate::error::{MigrateError, Result};
use crate::schema::{Column, ColumnType, Table, TableRef};
use crate::script::MigrationScript;

/// Default ledger table name.
pub const DEFAULT_HISTORY_TABLE: &str = "schema_history";

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    /// Migration version.
    pub version: String,
    /// Description at the time it was applied.
    pub description: String,
    /// Checksum of the applied up statements.
    pub checksum: String,
    /// When it was (last) applied.
    pub applied_at: DateTime<Utc>,
    /// False once reverted.
    pub applied: bool,
}

impl HistoryRecord {
    /// Converts the row into a statement-less script carrying the ledger state.
    #[must_use]
    pub fn to_script(&self) -> MigrationScript {
        let mut script = MigrationScript::new(self.version.clone(), self.description.clone())
            .created_at(self.applied_at);
        script.applied_at = Some(self.applied_at);
        script.applied = self.applied;
        script
    }
}

const DESCRIPTION_LENGTH: usize = 255;

type HistoryRow = (String, String, String, String, i64);

/// Reads and writes the ledger through the dialect of the target database.
#[derive(Debug, Clone)]
pub struct MigrationHistory {
    dialect: Arc<dyn Dialect>,
    table: TableRef,
}

impl MigrationHistory {
    /// Creates a ledger handle on `table`.
    pub fn new(dialect: Arc<dyn Dialect>, table: TableRef) -> Self {
        Self { dialect, table }
    }

    /// Ledger table reference.
    #[must_use]
    pub fn table(&self) -> &TableRef {
        &self.table
    }

    /// The ledger as a schema-model table.
    #[must_use]
    pub fn definition(&self) -> Table {
        let mut table = Table::new(self.table.name.clone())
            .column(
                Column::new("version", ColumnType::String)
                    .length(50)
                    .primary_key(),
            )
            .column(
                Column::new("description", ColumnType::String)
                    .length(DESCRIPTION_LENGTH as i32)
                    .not_null(),
            )
            .column(Column::new("checksum", ColumnType::String).length(64).not_null())
            .column(Column::new("applied_at", ColumnType::String).length(40).not_null())
            .column(Column::new("applied", ColumnType::Long).not_null());
        table.schema = self.table.schema.clone();
        table
    }

    /// Returns true if the ledger table exists.
    pub async fn exists(&self, conn: &mut AnyConnection) -> Result<bool> {
        let sql = self.dialect.table_exists_sql(&self.table);
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&mut *conn).await?;
        Ok(count > 0)
    }

    /// Creates the ledger table if it is absent.
    pub async fn ensure_table(&self, conn: &mut AnyConnection) -> Result<()> {
        if self.exists(conn).await? {
            return Ok(());
        }
        for sql in self.dialect.create_table(&self.definition())? {
            debug!(sql = %sql, "Creating history table");
            sqlx::query(&sql).execute(&mut *conn).await?;
        }
        Ok(())
    }

    /// Every ledger row, ascending by version.
    pub async fn records(&self, conn: &mut AnyConnection) -> Result<Vec<HistoryRecord>> {
        let sql = format!(
            "SELECT {}, {}, {}, {}, {} FROM {} ORDER BY {}",
            self.col("version"),
            self.col("description"),
            self.col("checksum"),
            self.col("applied_at"),
            self.col("applied"),
            self.table_name(),
            self.col("version"),
        );
        let rows: Vec<HistoryRow> = sqlx::query_as(&sql).fetch_all(&mut *conn).await?;
        rows.into_iter().map(parse_row).collect()
    }

    /// Versions whose row is currently applied.
    pub async fn applied_versions(&self, conn: &mut AnyConnection) -> Result<BTreeSet<String>> {
        Ok(self
            .records(conn)
            .await?
            .into_iter()
            .filter(|r| r.applied)
            .map(|r| r.version)
            .collect())
    }

    /// The most recently applied row still marked applied.
    pub async fn last_applied(&self, conn: &mut AnyConnection) -> Result<Option<HistoryRecord>> {
        Ok(self
            .records(conn)
            .await?
            .into_iter()
            .filter(|r| r.applied)
            .max_by(|a, b| {
                a.applied_at
                    .cmp(&b.applied_at)
                    .then_with(|| a.version.cmp(&b.version))
            }))
    }

    /// Rows ordered by applied time, most recent first, at most `limit`.
    pub async fn history(
        &self,
        conn: &mut AnyConnection,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>> {
        let mut records = self.records(conn).await?;
        records.sort_by(|a, b| {
            b.applied_at
                .cmp(&a.applied_at)
                .then_with(|| b.version.cmp(&a.version))
        });
        records.truncate(limit);
        Ok(records)
    }

    /// Records `script` as applied at `at`, inserting or flipping its row.
    pub async fn record_applied(
        &self,
        conn: &mut AnyConnection,
        script: &MigrationScript,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let applied_at = at.to_rfc3339_opts(SecondsFormat::Micros, true);
        let description: String = script.description.chars().take(DESCRIPTION_LENGTH).collect();
        let existing: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE {} = {}",
            self.table_name(),
            self.col("version"),
            self.dialect.placeholder(1)
        ))
        .bind(script.version.clone())
        .fetch_one(&mut *conn)
        .await?;

        if existing > 0 {
            let sql = format!(
                "UPDATE {} SET {} = {}, {} = {}, {} = {}, {} = 1 WHERE {} = {}",
                self.table_name(),
                self.col("description"),
                self.dialect.placeholder(1),
                self.col("checksum"),
                self.dialect.placeholder(2),
                self.col("applied_at"),
                self.dialect.placeholder(3),
                self.col("applied"),
                self.col("version"),
                self.dialect.placeholder(4),
            );
            sqlx::query(&sql)
                .bind(description)
                .bind(script.checksum())
                .bind(applied_at)
                .bind(script.version.clone())
                .execute(&mut *conn)
                .await?;
        } else {
            let sql = format!(
                "INSERT INTO {} ({}, {}, {}, {}, {}) VALUES ({}, {}, {}, {}, 1)",
                self.table_name(),
                self.col("version"),
                self.col("description"),
                self.col("checksum"),
                self.col("applied_at"),
                self.col("applied"),
                self.dialect.placeholder(1),
                self.dialect.placeholder(2),
                self.dialect.placeholder(3),
                self.dialect.placeholder(4),
            );
            sqlx::query(&sql)
                .bind(script.version.clone())
                .bind(description)
                .bind(script.checksum())
                .bind(applied_at)
                .execute(&mut *conn)
                .await?;
        }
        debug!(version = %script.version, "Recorded migration as applied");
        Ok(())
    }

    /// Clears the `applied` flag of `version`.
    pub async fn record_reverted(&self, conn: &mut AnyConnection, version: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET {} = 0 WHERE {} = {} AND {} = 1",
            self.table_name(),
            self.col("applied"),
            self.col("version"),
            self.dialect.placeholder(1),
            self.col("applied"),
        );
        let result = sqlx::query(&sql)
            .bind(version.to_string())
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MigrateError::MigrationNotFound(version.to_string()));
        }
        debug!(version = %version, "Recorded migration as reverted");
        Ok(())
    }

    fn table_name(&self) -> String {
        self.dialect.table_name(&self.table)
    }

    fn col(&self, name: &str) -> String {
        self.dialect.identifier(name)
    }
}

fn parse_row((version, description, checksum, applied_at, applied): HistoryRow) -> Result<HistoryRecord> {
    let applied_at = DateTime::parse_from_rfc3339(&applied_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            MigrateError::InvalidState(format!(
                "ledger row {version} has an invalid applied_at '{applied_at}': {e}"
            ))
        })?;
    Ok(HistoryRecord {
        version,
        description,
        checksum,
        applied_at,
        applied: applied != 0,
    })
}
