//! Engine configuration.
//!
//! Values are layered: built-in defaults, then a TOML file (`keel.toml` or
//! `--config`), then environment variables and command-line flags applied by
//! the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dialect::DatabaseType;
use crate::differ::{DifferOptions, DEFAULT_RENAME_THRESHOLD};
use crate::error::{MigrateError, Result};
use crate::executor::ExecutorOptions;
use crate::files::DEFAULT_SEPARATOR;
use crate::history::DEFAULT_HISTORY_TABLE;
use crate::schema::TableRef;

/// File looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "keel.toml";

/// Migration engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrateConfig {
    /// Connection URL of the target database.
    pub database_url: Option<String>,
    /// Dialect name, overriding detection from the URL.
    pub dialect: Option<String>,
    /// JSON document with the desired schema.
    pub entity_source: Option<PathBuf>,
    /// JSON document with the current schema; empty schema when unset.
    pub current_schema: Option<PathBuf>,
    /// Directory holding the migration files.
    pub migrations_dir: PathBuf,
    /// Ledger table name.
    pub history_table: String,
    /// Schema of the ledger table.
    pub history_schema: Option<String>,
    /// Seconds to wait for the migration lock.
    pub lock_timeout_secs: u64,
    /// Generate destructive changes without explicit confirmation.
    pub allow_destructive: bool,
    /// SQL run before a batch of migrations.
    pub before_migrate: Option<String>,
    /// SQL run after a batch of migrations.
    pub after_migrate: Option<String>,
    /// Statement separator in migration files and hooks.
    pub statement_separator: char,
    /// Detect table and column renames.
    pub detect_renames: bool,
    /// Name similarity above which a drop + add pair is a rename.
    pub rename_threshold: f64,
    /// Run each migration in a transaction where the database allows DDL in
    /// one.
    pub transactional: bool,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            dialect: None,
            entity_source: None,
            current_schema: None,
            migrations_dir: PathBuf::from("migrations"),
            history_table: DEFAULT_HISTORY_TABLE.to_string(),
            history_schema: None,
            lock_timeout_secs: 30,
            allow_destructive: false,
            before_migrate: None,
            after_migrate: None,
            statement_separator: DEFAULT_SEPARATOR,
            detect_renames: true,
            rename_threshold: DEFAULT_RENAME_THRESHOLD,
            transactional: true,
        }
    }
}

impl MigrateConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| MigrateError::Config(e.to_string()))
    }

    /// Reads a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MigrateError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
            .map_err(|e| MigrateError::Config(format!("{}: {e}", path.display())))
    }

    /// Reads `path`, or `keel.toml` if present, or falls back to defaults.
    pub fn discover(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::load(Path::new(DEFAULT_CONFIG_FILE))
            }
            None => Ok(Self::default()),
        }
    }

    /// Checks values that cannot be expressed in the types.
    pub fn validate(&self) -> Result<()> {
        if self.history_table.is_empty() {
            return Err(MigrateError::Config("history_table must not be empty".into()));
        }
        if !is_identifier(&self.history_table) {
            return Err(MigrateError::Config(format!(
                "history_table '{}' is not a plain identifier",
                self.history_table
            )));
        }
        if !(self.rename_threshold > 0.0 && self.rename_threshold <= 1.0) {
            return Err(MigrateError::Config(format!(
                "rename_threshold must be in (0, 1], got {}",
                self.rename_threshold
            )));
        }
        if self.statement_separator.is_whitespace() || self.statement_separator == '-' {
            return Err(MigrateError::Config(format!(
                "statement_separator {:?} cannot separate statements",
                self.statement_separator
            )));
        }
        Ok(())
    }

    /// Database type from the `dialect` override or the URL.
    pub fn database_type(&self) -> Result<DatabaseType> {
        match (&self.dialect, &self.database_url) {
            (Some(name), _) => name.parse(),
            (None, Some(url)) => DatabaseType::from_url(url),
            (None, None) => Err(MigrateError::Config(
                "either database_url or dialect must be set".into(),
            )),
        }
    }

    /// Ledger table reference.
    #[must_use]
    pub fn history_table_ref(&self) -> TableRef {
        TableRef {
            name: self.history_table.clone(),
            schema: self.history_schema.clone(),
        }
    }

    /// Lock timeout as a duration.
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Differ options derived from this configuration.
    #[must_use]
    pub fn differ_options(&self) -> DifferOptions {
        DifferOptions {
            detect_renames: self.detect_renames,
            rename_threshold: self.rename_threshold,
            ..DifferOptions::default()
        }
    }

    /// Executor options derived from this configuration.
    #[must_use]
    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            history_table: self.history_table_ref(),
            lock_timeout: self.lock_timeout(),
            before_migrate: self.before_migrate.clone(),
            after_migrate: self.after_migrate.clone(),
            separator: self.statement_separator,
            transactional: self.transactional,
        }
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
