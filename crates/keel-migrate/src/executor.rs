//! Migration executor.
//!
//! This module applies and reverts migration scripts against a live
//! database. Every mutating operation runs on one dedicated connection that
//! first takes the migration lock, so the ledger has a single writer.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::any::AnyPoolOptions;
use sqlx::{Any, AnyConnection, AnyPool, Connection, Transaction};
use tracing::{debug, error, info, warn};

use crate::dialect::{DatabaseType, Dialect, DialectRegistry};
use crate::error::{MigrateError, Result};
use crate::files::{split_statements, ScriptSource, DEFAULT_SEPARATOR};
use crate::history::{HistoryRecord, MigrationHistory, DEFAULT_HISTORY_TABLE};
use crate::lock::{MigrationLock, DEFAULT_LOCK_TIMEOUT};
use crate::schema::TableRef;
use crate::script::{compare_versions, is_executable, MigrationScript};
use crate::state::{MigrationRun, MigrationState};

/// Executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Ledger table.
    pub history_table: TableRef,
    /// How long to wait for the migration lock.
    pub lock_timeout: Duration,
    /// Raw SQL run before a batch of pending migrations.
    pub before_migrate: Option<String>,
    /// Raw SQL run after a batch of pending migrations.
    pub after_migrate: Option<String>,
    /// Separator for hook SQL.
    pub separator: char,
    /// Run each migration in one transaction on databases whose DDL can be
    /// rolled back. Elsewhere a failed migration is undone change by change.
    pub transactional: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            history_table: TableRef::new(DEFAULT_HISTORY_TABLE),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            before_migrate: None,
            after_migrate: None,
            separator: DEFAULT_SEPARATOR,
            transactional: true,
        }
    }
}

/// Ledger view of one migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    /// Migration version.
    pub version: String,
    /// Description from the script, or from the ledger if the file is gone.
    pub description: String,
    /// `PENDING`, `APPLIED` or `REVERTED`.
    pub state: MigrationState,
    /// Last time it was applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    /// Whether a script file exists for it.
    pub script_present: bool,
}

/// A disagreement between the ledger and the script files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationIssue {
    /// An applied script was edited after it ran.
    ChecksumMismatch {
        /// Migration version.
        version: String,
        /// Checksum in the ledger.
        expected: String,
        /// Checksum of the script.
        actual: String,
    },
    /// An applied version has no script.
    MissingScript {
        /// Migration version.
        version: String,
    },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChecksumMismatch {
                version,
                expected,
                actual,
            } => write!(
                f,
                "{version}: checksum mismatch (ledger {expected}, script {actual})"
            ),
            Self::MissingScript { version } => {
                write!(f, "{version}: applied but no migration script found")
            }
        }
    }
}

/// Executes migrations against a database.
pub struct MigrationExecutor {
    pool: AnyPool,
    dialect: Arc<dyn Dialect>,
    source: Arc<dyn ScriptSource>,
    history: MigrationHistory,
    lock: MigrationLock,
    options: ExecutorOptions,
}

impl fmt::Debug for MigrationExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationExecutor")
            .field("dialect", &self.dialect.name())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl MigrationExecutor {
    /// Creates an executor on an existing pool.
    pub fn new(
        pool: AnyPool,
        dialect: Arc<dyn Dialect>,
        source: Arc<dyn ScriptSource>,
        options: ExecutorOptions,
    ) -> Self {
        let history = MigrationHistory::new(dialect.clone(), options.history_table.clone());
        let lock = MigrationLock::for_history(
            dialect.clone(),
            &options.history_table,
            options.lock_timeout,
        );
        Self {
            pool,
            dialect,
            source,
            history,
            lock,
            options,
        }
    }

    /// Connects to `url`, resolving its dialect through `registry`.
    ///
    /// Only PostgreSQL, MySQL and SQLite can be executed against; other
    /// databases fail with [`MigrateError::UnsupportedDatabase`].
    pub async fn connect(
        url: &str,
        registry: &DialectRegistry,
        source: Arc<dyn ScriptSource>,
        options: ExecutorOptions,
    ) -> Result<Self> {
        let database = DatabaseType::from_url(url)?;
        if !database.is_executable() {
            return Err(MigrateError::UnsupportedDatabase(format!(
                "{database}: migrations can be generated but not executed (no driver)"
            )));
        }
        let dialect = registry.get(database)?;

        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new().max_connections(2).connect(url).await?;
        info!(database = %database, "Connected");
        Ok(Self::new(pool, dialect, source, options))
    }

    /// Returns the dialect.
    #[must_use]
    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    /// Returns the ledger.
    #[must_use]
    pub fn history_ledger(&self) -> &MigrationHistory {
        &self.history
    }

    /// Applies every pending script up to and including `target`.
    ///
    /// Returns the scripts applied, in order. Nothing pending is not an error.
    pub async fn apply_pending(&self, target: Option<&str>) -> Result<Vec<MigrationScript>> {
        let mut conn = self.pool.acquire().await?;
        self.lock.acquire(&mut conn).await?;
        let result = self.apply_locked(&mut conn, target).await;
        finish(result, self.lock.release(&mut conn).await)
    }

    /// Reverts the most recently applied migration, if any.
    pub async fn undo_last(&self) -> Result<Option<MigrationScript>> {
        let mut conn = self.pool.acquire().await?;
        self.lock.acquire(&mut conn).await?;
        let result = self.undo_locked(&mut conn).await;
        finish(result, self.lock.release(&mut conn).await)
    }

    /// Reverts every applied migration newer than `version`, newest first.
    pub async fn revert_to_version(&self, version: &str) -> Result<Vec<MigrationScript>> {
        let mut conn = self.pool.acquire().await?;
        self.lock.acquire(&mut conn).await?;
        let result = self.revert_locked(&mut conn, version).await;
        finish(result, self.lock.release(&mut conn).await)
    }

    /// Scripts that [`Self::apply_pending`] would apply.
    pub async fn pending(&self, target: Option<&str>) -> Result<Vec<MigrationScript>> {
        let mut conn = self.pool.acquire().await?;
        let records = self.read_records(&mut conn).await?;
        plan_pending(self.source.load_all()?, &records, target)
    }

    /// Script that [`Self::undo_last`] would revert.
    pub async fn undo_candidate(&self) -> Result<Option<MigrationScript>> {
        let mut conn = self.pool.acquire().await?;
        let records = self.read_records(&mut conn).await?;
        match last_applied(&records) {
            Some(record) => Ok(Some(self.script_for(&self.source.load_all()?, record)?)),
            None => Ok(None),
        }
    }

    /// Scripts that [`Self::revert_to_version`] would revert, newest first.
    pub async fn revert_candidates(&self, version: &str) -> Result<Vec<MigrationScript>> {
        let mut conn = self.pool.acquire().await?;
        let records = self.read_records(&mut conn).await?;
        self.plan_revert(&records, version)
    }

    /// Ledger entries, most recently applied first, at most `limit`.
    pub async fn history(&self, limit: usize) -> Result<Vec<MigrationScript>> {
        let mut conn = self.pool.acquire().await?;
        if !self.history.exists(&mut conn).await? {
            return Ok(Vec::new());
        }
        Ok(self
            .history
            .history(&mut conn, limit)
            .await?
            .iter()
            .map(HistoryRecord::to_script)
            .collect())
    }

    /// Every known migration with its ledger state, ascending by version.
    pub async fn status(&self) -> Result<Vec<MigrationStatus>> {
        let mut conn = self.pool.acquire().await?;
        let records = self.read_records(&mut conn).await?;
        let mut by_version: BTreeMap<String, HistoryRecord> = records
            .into_iter()
            .map(|r| (r.version.clone(), r))
            .collect();

        let mut statuses = Vec::new();
        for script in self.source.load_all()? {
            let record = by_version.remove(&script.version);
            statuses.push(MigrationStatus {
                state: record_state(record.as_ref()),
                applied_at: record.as_ref().map(|r| r.applied_at),
                version: script.version,
                description: script.description,
                script_present: true,
            });
        }
        for record in by_version.into_values() {
            statuses.push(MigrationStatus {
                state: record_state(Some(&record)),
                applied_at: Some(record.applied_at),
                version: record.version,
                description: record.description,
                script_present: false,
            });
        }
        statuses.sort_by(|a, b| compare_versions(&a.version, &b.version));
        Ok(statuses)
    }

    /// Compares applied ledger rows with the scripts on disk.
    pub async fn validate(&self) -> Result<Vec<ValidationIssue>> {
        let mut conn = self.pool.acquire().await?;
        let records = self.read_records(&mut conn).await?;
        Ok(find_issues(&self.source.load_all()?, &records))
    }

    async fn read_records(&self, conn: &mut AnyConnection) -> Result<Vec<HistoryRecord>> {
        if self.history.exists(conn).await? {
            self.history.records(conn).await
        } else {
            Ok(Vec::new())
        }
    }

    async fn apply_locked(
        &self,
        conn: &mut AnyConnection,
        target: Option<&str>,
    ) -> Result<Vec<MigrationScript>> {
        self.history.ensure_table(conn).await?;
        let scripts = self.source.load_all()?;
        let records = self.history.records(conn).await?;

        for issue in find_issues(&scripts, &records) {
            if let ValidationIssue::ChecksumMismatch {
                version,
                expected,
                actual,
            } = issue
            {
                return Err(MigrateError::ChecksumMismatch {
                    version,
                    expected,
                    actual,
                });
            }
        }

        let pending = plan_pending(scripts, &records, target)?;
        if pending.is_empty() {
            info!("Database is up to date");
            return Ok(Vec::new());
        }
        info!(count = pending.len(), "Applying pending migrations");

        if let Some(hook) = &self.options.before_migrate {
            self.run_hook(conn, "before_migrate", hook).await?;
        }
        let mut applied = Vec::with_capacity(pending.len());
        for script in pending {
            applied.push(self.apply_one(conn, script).await?);
        }
        if let Some(hook) = &self.options.after_migrate {
            self.run_hook(conn, "after_migrate", hook).await?;
        }
        Ok(applied)
    }

    /// Whether migrations run inside a database transaction.
    fn transactional(&self) -> bool {
        self.options.transactional && self.dialect.transactional_ddl()
    }

    async fn apply_one(
        &self,
        conn: &mut AnyConnection,
        mut script: MigrationScript,
    ) -> Result<MigrationScript> {
        let mut run = MigrationRun::new(script.version.clone(), MigrationState::Pending);
        run.advance(MigrationState::Applying)?;
        let transactional = self.transactional();
        info!(
            version = %script.version,
            description = %script.description,
            transactional,
            "Applying migration"
        );

        let at = Utc::now();
        let failure = if transactional {
            self.apply_in_transaction(conn, &script, at).await?
        } else {
            self.apply_by_change(conn, &script, at).await?
        };
        if let Some(failure) = failure {
            return Err(failure.settle(&mut run, &script.version)?);
        }

        run.advance(MigrationState::Applied)?;
        script.mark_applied(at);
        info!(version = %script.version, "Migration applied successfully");
        Ok(script)
    }

    /// Runs the up statements and the ledger update in one transaction.
    async fn apply_in_transaction(
        &self,
        conn: &mut AnyConnection,
        script: &MigrationScript,
        at: DateTime<Utc>,
    ) -> Result<Option<Failure>> {
        let mut tx = conn.begin().await?;
        for statement in script.executable_up() {
            debug!(sql = %statement, "Executing SQL");
            if let Err(source) = sqlx::raw_sql(statement).execute(&mut *tx).await {
                let original = statement_failed(script, statement, source);
                let rollback = tx.rollback().await.map_err(MigrateError::from);
                return Ok(Some(Failure { original, rollback }));
            }
        }
        if let Err(err) = self.history.record_applied(&mut *tx, script, at).await {
            abandon(tx).await;
            return Err(err);
        }
        tx.commit().await?;
        Ok(None)
    }

    /// Runs the up statements change by change, reverting the completed
    /// changes when one fails.
    async fn apply_by_change(
        &self,
        conn: &mut AnyConnection,
        script: &MigrationScript,
        at: DateTime<Utc>,
    ) -> Result<Option<Failure>> {
        let mut completed = Vec::new();
        for block in script.up_blocks() {
            for (ran, statement) in block.statements.iter().copied().enumerate() {
                debug!(sql = %statement, change = ?block.change, "Executing SQL");
                if let Err(source) = sqlx::raw_sql(statement).execute(&mut *conn).await {
                    let original = statement_failed(script, statement, source);
                    let rollback = self
                        .undo_changes(conn, script, &completed, block.change, ran > 0)
                        .await;
                    return Ok(Some(Failure { original, rollback }));
                }
            }
            completed.push(block.change);
        }
        self.history.record_applied(conn, script, at).await?;
        Ok(None)
    }

    /// Reverts the changes of a failed migration that ran to completion.
    ///
    /// A script without change markers is reverted as a whole once any of
    /// its statements has run. A change that ran only in part cannot be
    /// reverted and is reported as a rollback failure.
    async fn undo_changes(
        &self,
        conn: &mut AnyConnection,
        script: &MigrationScript,
        completed: &[Option<usize>],
        failed: Option<usize>,
        partial: bool,
    ) -> Result<()> {
        if !script.has_change_markers() {
            if !partial {
                return Ok(());
            }
            let statements: Vec<&str> = script.executable_down().collect();
            return self.run_statements(conn, script, &statements).await;
        }

        let statements: Vec<&str> = script
            .down_blocks()
            .into_iter()
            .filter(|block| block.change.is_some() && completed.contains(&block.change))
            .flat_map(|block| block.statements)
            .collect();
        self.run_statements(conn, script, &statements).await?;
        if partial {
            let change = failed.map_or_else(|| "preamble".to_string(), |n| format!("change {n}"));
            return Err(MigrateError::InvalidState(format!(
                "{}: {change} was only partly applied and cannot be reverted automatically",
                script.version
            )));
        }
        Ok(())
    }

    async fn undo_locked(&self, conn: &mut AnyConnection) -> Result<Option<MigrationScript>> {
        let records = self.read_records(conn).await?;
        let Some(record) = last_applied(&records) else {
            info!("Nothing to undo");
            return Ok(None);
        };
        let script = self.script_for(&self.source.load_all()?, record)?;
        Ok(Some(self.revert_one(conn, script, record).await?))
    }

    async fn revert_locked(
        &self,
        conn: &mut AnyConnection,
        version: &str,
    ) -> Result<Vec<MigrationScript>> {
        let records = self.read_records(conn).await?;
        let scripts = self.plan_revert(&records, version)?;
        if scripts.is_empty() {
            info!(version = %version, "Nothing to revert");
            return Ok(Vec::new());
        }

        let by_version: BTreeMap<&str, &HistoryRecord> =
            records.iter().map(|r| (r.version.as_str(), r)).collect();
        let mut reverted = Vec::with_capacity(scripts.len());
        for script in scripts {
            let record = by_version
                .get(script.version.as_str())
                .copied()
                .ok_or_else(|| MigrateError::MigrationNotFound(script.version.clone()))?;
            reverted.push(self.revert_one(conn, script, record).await?);
        }
        Ok(reverted)
    }

    async fn revert_one(
        &self,
        conn: &mut AnyConnection,
        mut script: MigrationScript,
        record: &HistoryRecord,
    ) -> Result<MigrationScript> {
        let mut run = MigrationRun::new(script.version.clone(), MigrationState::Applied);
        run.advance(MigrationState::Reverting)?;
        info!(version = %script.version, "Reverting migration");

        let result = if self.transactional() {
            self.revert_in_transaction(conn, &script).await
        } else {
            self.revert_directly(conn, &script).await
        };
        if let Err(err) = result {
            run.advance(MigrationState::Failed)?;
            error!(version = %script.version, error = %err, "Revert failed");
            return Err(err);
        }

        run.advance(MigrationState::Reverted)?;
        script.applied_at = Some(record.applied_at);
        script.mark_reverted();
        info!(version = %script.version, "Migration reverted");
        Ok(script)
    }

    async fn revert_in_transaction(
        &self,
        conn: &mut AnyConnection,
        script: &MigrationScript,
    ) -> Result<()> {
        let mut tx = conn.begin().await?;
        let statements: Vec<&str> = script.executable_down().collect();
        let result = match self.run_statements(&mut *tx, script, &statements).await {
            Ok(()) => self.history.record_reverted(&mut *tx, &script.version).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            abandon(tx).await;
            return Err(err);
        }
        tx.commit().await?;
        Ok(())
    }

    async fn revert_directly(&self, conn: &mut AnyConnection, script: &MigrationScript) -> Result<()> {
        let statements: Vec<&str> = script.executable_down().collect();
        self.run_statements(conn, script, &statements).await?;
        self.history.record_reverted(conn, &script.version).await
    }

    async fn run_statements(
        &self,
        conn: &mut AnyConnection,
        script: &MigrationScript,
        statements: &[&str],
    ) -> Result<()> {
        for statement in statements.iter().copied() {
            debug!(sql = %statement, "Executing rollback SQL");
            sqlx::raw_sql(statement)
                .execute(&mut *conn)
                .await
                .map_err(|source| MigrateError::StatementExecutionFailed {
                    version: script.version.clone(),
                    statement: statement.to_string(),
                    source,
                })?;
        }
        Ok(())
    }

    async fn run_hook(&self, conn: &mut AnyConnection, name: &str, sql: &str) -> Result<()> {
        for statement in split_statements(sql, self.options.separator)
            .iter()
            .filter(|s| is_executable(s))
        {
            debug!(hook = name, sql = %statement, "Executing hook");
            sqlx::raw_sql(statement).execute(&mut *conn).await?;
        }
        Ok(())
    }

    fn plan_revert(&self, records: &[HistoryRecord], version: &str) -> Result<Vec<MigrationScript>> {
        let scripts = self.source.load_all()?;
        let mut newer: Vec<&HistoryRecord> = records
            .iter()
            .filter(|r| r.applied && compare_versions(&r.version, version) == Ordering::Greater)
            .collect();
        newer.sort_by(|a, b| compare_versions(&b.version, &a.version));
        newer
            .into_iter()
            .map(|record| self.script_for(&scripts, record))
            .collect()
    }

    fn script_for(&self, scripts: &[MigrationScript], record: &HistoryRecord) -> Result<MigrationScript> {
        scripts
            .iter()
            .find(|s| s.version == record.version)
            .cloned()
            .ok_or_else(|| MigrateError::MigrationNotFound(record.version.clone()))
    }
}

/// A failed up statement and the outcome of undoing its migration.
struct Failure {
    original: MigrateError,
    rollback: Result<()>,
}

impl Failure {
    /// Moves `run` to its final state and returns the error to report.
    fn settle(self, run: &mut MigrationRun, version: &str) -> Result<MigrateError> {
        run.advance(MigrationState::Failed)?;
        match self.rollback {
            Ok(()) => {
                run.advance(MigrationState::RolledBack)?;
                warn!(version = %version, "Migration rolled back");
                Ok(self.original)
            }
            Err(rollback) => {
                error!(
                    version = %version,
                    error = %rollback,
                    "Migration failed and rollback also failed; manual intervention required"
                );
                Ok(MigrateError::RollbackFailed {
                    version: version.to_string(),
                    original: Box::new(self.original),
                    rollback: Box::new(rollback),
                })
            }
        }
    }
}

/// Rolls back a transaction whose error is already being reported.
async fn abandon(tx: Transaction<'_, Any>) {
    if let Err(err) = tx.rollback().await {
        warn!(error = %err, "Failed to roll back migration transaction");
    }
}

fn statement_failed(script: &MigrationScript, statement: &str, source: sqlx::Error) -> MigrateError {
    error!(
        version = %script.version,
        sql = %statement,
        error = %source,
        "Migration statement failed, rolling back"
    );
    MigrateError::StatementExecutionFailed {
        version: script.version.clone(),
        statement: statement.to_string(),
        source,
    }
}

/// Keeps the operation's error over a release error.
fn finish<T>(result: Result<T>, released: Result<()>) -> Result<T> {
    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release)) => {
            warn!(error = %release, "Failed to release migration lock");
            Err(err)
        }
    }
}

fn plan_pending(
    scripts: Vec<MigrationScript>,
    records: &[HistoryRecord],
    target: Option<&str>,
) -> Result<Vec<MigrationScript>> {
    if let Some(target) = target {
        let known = scripts.iter().any(|s| s.version == target)
            || records.iter().any(|r| r.version == target);
        if !known {
            return Err(MigrateError::MigrationNotFound(target.to_string()));
        }
    }
    let mut pending: Vec<MigrationScript> = scripts
        .into_iter()
        .filter(|s| !records.iter().any(|r| r.applied && r.version == s.version))
        .filter(|s| match target {
            Some(t) => compare_versions(&s.version, t) != Ordering::Greater,
            None => true,
        })
        .collect();
    pending.sort_by(|a, b| compare_versions(&a.version, &b.version));
    Ok(pending)
}

fn last_applied(records: &[HistoryRecord]) -> Option<&HistoryRecord> {
    records.iter().filter(|r| r.applied).max_by(|a, b| {
        a.applied_at
            .cmp(&b.applied_at)
            .then_with(|| compare_versions(&a.version, &b.version))
    })
}

fn record_state(record: Option<&HistoryRecord>) -> MigrationState {
    match record {
        Some(r) if r.applied => MigrationState::Applied,
        Some(_) => MigrationState::Reverted,
        None => MigrationState::Pending,
    }
}

fn find_issues(scripts: &[MigrationScript], records: &[HistoryRecord]) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    for record in records.iter().filter(|r| r.applied) {
        match scripts.iter().find(|s| s.version == record.version) {
            Some(script) => {
                let actual = script.checksum();
                if actual != record.checksum {
                    issues.push(ValidationIssue::ChecksumMismatch {
                        version: record.version.clone(),
                        expected: record.checksum.clone(),
                        actual,
                    });
                }
            }
            None => issues.push(ValidationIssue::MissingScript {
                version: record.version.clone(),
            }),
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Change;
    use crate::dialect::SqliteDialect;
    use crate::generator::MigrationGenerator;
    use crate::schema::{Column, ColumnType, Table};
    use crate::script::{change_marker, revert_marker};
    use tempfile::TempDir;

    async fn memory_pool() -> AnyPool {
        sqlx::any::install_default_drivers();
        AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    fn executor(pool: AnyPool, scripts: Vec<MigrationScript>) -> MigrationExecutor {
        executor_with(pool, scripts, ExecutorOptions::default())
    }

    fn executor_with(
        pool: AnyPool,
        scripts: Vec<MigrationScript>,
        options: ExecutorOptions,
    ) -> MigrationExecutor {
        MigrationExecutor::new(pool, Arc::new(SqliteDialect::new()), Arc::new(scripts), options)
    }

    fn change_by_change() -> ExecutorOptions {
        ExecutorOptions {
            transactional: false,
            ..ExecutorOptions::default()
        }
    }

    /// A generated script creating `audit`, then `customers`.
    fn audit_and_customers() -> MigrationScript {
        let table = |name: &str| {
            Table::new(name)
                .column(Column::new("id", ColumnType::Long).primary_key())
                .column(Column::new("note", ColumnType::String))
        };
        let changes = vec![
            Change::create_table(table("customers")),
            Change::create_table(table("audit")),
        ];
        MigrationGenerator::new(Arc::new(SqliteDialect::new()))
            .generate(&changes, "audit and customers")
            .unwrap()
            .unwrap()
    }

    /// An existing `customers` table holding one row.
    async fn seed_customers(pool: &AnyPool) {
        sqlx::query("CREATE TABLE customers (id INTEGER PRIMARY KEY)")
            .execute(pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO customers (id) VALUES (42)")
            .execute(pool)
            .await
            .unwrap();
    }

    async fn customer_ids(pool: &AnyPool) -> Vec<i64> {
        sqlx::query_scalar("SELECT id FROM customers")
            .fetch_all(pool)
            .await
            .unwrap()
    }

    fn assert_failed_on_customers(err: &MigrateError) {
        match err {
            MigrateError::StatementExecutionFailed { statement, .. } => {
                assert!(statement.starts_with("CREATE TABLE customers"), "{statement}");
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(!err.is_fatal());
    }

    fn create(version: &str, table: &str) -> MigrationScript {
        MigrationScript::new(version, format!("create {table}"))
            .up("BEGIN TRANSACTION")
            .up(format!("-- Create table {table}"))
            .up(format!("CREATE TABLE {table} (id INTEGER PRIMARY KEY)"))
            .up("COMMIT")
            .down(format!("DROP TABLE {table}"))
    }

    async fn table_exists(pool: &AnyPool, table: &str) -> bool {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = '{table}'"
        ))
        .fetch_one(pool)
        .await
        .unwrap();
        count > 0
    }

    #[tokio::test]
    async fn test_apply_pending_in_version_order() {
        let pool = memory_pool().await;
        let exec = executor(
            pool.clone(),
            vec![create("3", "c"), create("1", "a"), create("2", "b")],
        );

        let applied = exec.apply_pending(None).await.unwrap();
        let versions: Vec<&str> = applied.iter().map(|s| s.version.as_str()).collect();
        assert_eq!(versions, vec!["1", "2", "3"]);
        assert!(applied.iter().all(|s| s.applied && s.applied_at.is_some()));
        assert!(table_exists(&pool, "a").await);
        assert!(table_exists(&pool, "c").await);

        // Idempotent.
        assert!(exec.apply_pending(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_up_to_target() {
        let pool = memory_pool().await;
        let exec = executor(pool.clone(), vec![create("1", "a"), create("2", "b")]);

        let applied = exec.apply_pending(Some("1")).await.unwrap();
        assert_eq!(applied.len(), 1);
        assert!(!table_exists(&pool, "b").await);
        assert_eq!(exec.pending(None).await.unwrap().len(), 1);

        let err = exec.apply_pending(Some("9")).await.unwrap_err();
        assert!(matches!(err, MigrateError::MigrationNotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_migration_is_rolled_back() {
        let pool = memory_pool().await;
        let broken = MigrationScript::new("2", "broken")
            .up("CREATE TABLE partial (id INTEGER)")
            .up("INSERT INTO missing_table VALUES (1)")
            .down("DROP TABLE partial");
        let exec = executor(pool.clone(), vec![create("1", "a"), broken]);

        let err = exec.apply_pending(None).await.unwrap_err();
        match &err {
            MigrateError::StatementExecutionFailed {
                version, statement, ..
            } => {
                assert_eq!(version, "2");
                assert_eq!(statement, "INSERT INTO missing_table VALUES (1)");
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(!err.is_fatal());
        assert!(table_exists(&pool, "a").await);
        assert!(!table_exists(&pool, "partial").await);

        let status = exec.status().await.unwrap();
        assert_eq!(status[0].state, MigrationState::Applied);
        assert_eq!(status[1].state, MigrationState::Pending);
    }

    #[tokio::test]
    async fn test_transaction_keeps_tables_the_migration_did_not_create() {
        let pool = memory_pool().await;
        seed_customers(&pool).await;
        let exec = executor(pool.clone(), vec![audit_and_customers()]);

        let err = exec.apply_pending(None).await.unwrap_err();
        assert_failed_on_customers(&err);
        assert!(!table_exists(&pool, "audit").await);
        assert_eq!(customer_ids(&pool).await, vec![42]);
        assert_eq!(exec.pending(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_only_completed_changes_are_reverted() {
        let pool = memory_pool().await;
        seed_customers(&pool).await;
        let exec = executor_with(pool.clone(), vec![audit_and_customers()], change_by_change());

        let err = exec.apply_pending(None).await.unwrap_err();
        assert_failed_on_customers(&err);
        assert!(!table_exists(&pool, "audit").await);
        assert_eq!(customer_ids(&pool).await, vec![42]);
        assert_eq!(exec.pending(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_partly_applied_change_needs_an_operator() {
        let pool = memory_pool().await;
        let script = MigrationScript::new("1", "two changes")
            .up(change_marker(1, "Create table a"))
            .up("CREATE TABLE a (id INTEGER PRIMARY KEY)")
            .up(change_marker(2, "Create table b"))
            .up("CREATE TABLE b (id INTEGER PRIMARY KEY)")
            .up("CREATE INDEX idx_b_missing ON missing_table (id)")
            .down(revert_marker(2, "Create table b"))
            .down("DROP TABLE b")
            .down(revert_marker(1, "Create table a"))
            .down("DROP TABLE a");
        let exec = executor_with(pool.clone(), vec![script], change_by_change());

        let err = exec.apply_pending(None).await.unwrap_err();
        match &err {
            MigrateError::RollbackFailed { original, rollback, .. } => {
                assert!(matches!(**original, MigrateError::StatementExecutionFailed { .. }));
                assert!(rollback.to_string().contains("change 2 was only partly applied"));
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(err.requires_operator());
        assert!(!table_exists(&pool, "a").await);
        assert!(table_exists(&pool, "b").await);
    }

    #[tokio::test]
    async fn test_failed_revert_changes_nothing() {
        let pool = memory_pool().await;
        let script = create("1", "kept").down("DROP TABLE missing_table");
        let exec = executor(pool.clone(), vec![script]);
        exec.apply_pending(None).await.unwrap();

        let err = exec.undo_last().await.unwrap_err();
        assert!(matches!(err, MigrateError::StatementExecutionFailed { .. }));
        assert!(table_exists(&pool, "kept").await);
        let status = exec.status().await.unwrap();
        assert_eq!(status[0].state, MigrationState::Applied);
    }

    #[tokio::test]
    async fn test_failed_rollback_is_fatal() {
        let pool = memory_pool().await;
        let broken = MigrationScript::new("1", "broken")
            .up("CREATE TABLE partial (id INTEGER)")
            .up("INSERT INTO missing_table VALUES (1)")
            .down("DROP TABLE also_missing");
        let exec = executor_with(pool.clone(), vec![broken], change_by_change());

        let err = exec.apply_pending(None).await.unwrap_err();
        assert!(err.is_fatal(), "{err}");
        assert!(err.to_string().contains("manual intervention"));
        // The lock was released despite the failure.
        assert!(exec.pending(None).await.unwrap().len() == 1);
        assert!(exec.apply_pending(None).await.is_err());
    }

    #[tokio::test]
    async fn test_undo_and_revert() {
        let pool = memory_pool().await;
        let exec = executor(
            pool.clone(),
            vec![create("1", "a"), create("2", "b"), create("3", "c")],
        );
        assert!(exec.undo_last().await.unwrap().is_none());
        exec.apply_pending(None).await.unwrap();

        let undone = exec.undo_last().await.unwrap().unwrap();
        assert_eq!(undone.version, "3");
        assert!(!undone.applied);
        assert!(!table_exists(&pool, "c").await);

        let reverted = exec.revert_to_version("0").await.unwrap();
        let versions: Vec<&str> = reverted.iter().map(|s| s.version.as_str()).collect();
        assert_eq!(versions, vec!["2", "1"]);
        assert!(!table_exists(&pool, "a").await);

        let status = exec.status().await.unwrap();
        assert!(status.iter().all(|s| s.state == MigrationState::Reverted));

        // Reverted migrations are pending again.
        assert_eq!(exec.apply_pending(None).await.unwrap().len(), 3);
        let history = exec.history(10).await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|s| s.applied));
    }

    #[tokio::test]
    async fn test_hooks_run_around_batch() {
        let pool = memory_pool().await;
        let options = ExecutorOptions {
            before_migrate: Some(
                "CREATE TABLE IF NOT EXISTS hook_log (event TEXT); \
                 INSERT INTO hook_log VALUES ('before')"
                    .into(),
            ),
            after_migrate: Some("INSERT INTO hook_log VALUES ('after');".into()),
            ..ExecutorOptions::default()
        };
        let exec = MigrationExecutor::new(
            pool.clone(),
            Arc::new(SqliteDialect::new()),
            Arc::new(vec![create("1", "a")]),
            options,
        );
        exec.apply_pending(None).await.unwrap();
        exec.apply_pending(None).await.unwrap();

        let events: Vec<String> = sqlx::query_scalar("SELECT event FROM hook_log")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(events, vec!["before", "after"]);
    }

    #[tokio::test]
    async fn test_validate_reports_edits_and_missing_files() {
        let pool = memory_pool().await;
        executor(pool.clone(), vec![create("1", "a"), create("2", "b")])
            .apply_pending(None)
            .await
            .unwrap();

        let edited = create("1", "a").up("CREATE INDEX idx_a ON a (id)");
        let exec = executor(pool.clone(), vec![edited]);
        let issues = exec.validate().await.unwrap();
        assert_eq!(issues.len(), 2);
        assert!(matches!(issues[0], ValidationIssue::ChecksumMismatch { .. }));
        assert_eq!(
            issues[1],
            ValidationIssue::MissingScript {
                version: "2".into()
            }
        );

        let err = exec.apply_pending(None).await.unwrap_err();
        assert!(matches!(err, MigrateError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_runs_apply_once() {
        let dir = TempDir::new().unwrap();
        sqlx::any::install_default_drivers();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("app.db").display());
        let scripts = vec![create("1", "a"), create("2", "b")];

        let mut executors = Vec::new();
        for _ in 0..2 {
            let pool = AnyPoolOptions::new()
                .max_connections(2)
                .connect(&url)
                .await
                .unwrap();
            executors.push(executor(pool, scripts.clone()));
        }

        let (first, second) = tokio::join!(
            executors[0].apply_pending(None),
            executors[1].apply_pending(None)
        );
        let total = first.unwrap().len() + second.unwrap().len();
        assert_eq!(total, 2);

        let history = executors[0].history(10).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_connect_rejects_generation_only_databases() {
        let err = MigrationExecutor::connect(
            "sqlserver://localhost/app",
            &DialectRegistry::standard(),
            Arc::new(Vec::<MigrationScript>::new()),
            ExecutorOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MigrateError::UnsupportedDatabase(_)));
    }
}
