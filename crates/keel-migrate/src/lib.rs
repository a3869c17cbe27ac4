//! Dialect-aware database schema migrations.
//!
//! `keel-migrate` turns the difference between two schema models into
//! versioned SQL migration scripts and applies them safely:
//! - Changes are classified by risk, and destructive ones carry a
//!   confirmation message
//! - DDL is generated for MySQL, PostgreSQL, Oracle, SQL Server and SQLite
//! - Execution is serialized by a database lock and recorded in a ledger
//!
//! # Architecture
//!
//! - **Schema** - Tables, columns, indexes and foreign keys
//! - **Differ** - Compares two schemas into a list of changes, with rename detection
//! - **Generator** - Orders changes and renders up/down scripts through a dialect
//! - **Dialect** - Database-specific DDL
//! - **Files** - Reads and writes `V<version>__<description>.sql` files
//! - **Executor** - Applies, undoes and reverts scripts, tracking history
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use keel_migrate::prelude::*;
//!
//! let old = Schema::new("app")
//!     .table(Table::new("users").column(Column::new("id", ColumnType::Long).primary_key()));
//! let new = Schema::new("app").table(
//!     Table::new("users")
//!         .column(Column::new("id", ColumnType::Long).primary_key())
//!         .column(Column::new("email", ColumnType::String).length(255).unique().not_null()),
//! );
//!
//! let changes = SchemaDiffer::new().compare(&old, &new).unwrap();
//! let script = MigrationGenerator::new(Arc::new(MySqlDialect::new()))
//!     .generate(&changes, "add email")
//!     .unwrap()
//!     .unwrap();
//! assert!(script
//!     .up
//!     .contains(&"ALTER TABLE users ADD COLUMN email VARCHAR(255) NOT NULL UNIQUE".to_string()));
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Generate a migration from two schema documents
//! keel-migrate generate --from current.json --to desired.json -d "add email"
//!
//! # Apply pending migrations
//! keel-migrate apply
//!
//! # Show migration status
//! keel-migrate status
//!
//! # Revert the last migration
//! keel-migrate undo
//! ```

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]

pub mod change;
pub mod config;
pub mod dialect;
pub mod differ;
pub mod error;
pub mod executor;
pub mod files;
pub mod generator;
pub mod history;
pub mod lock;
pub mod schema;
pub mod script;
pub mod similarity;
pub mod state;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::change::{Change, ChangeKind, ChangeType, RiskLevel};
    pub use crate::config::MigrateConfig;
    pub use crate::dialect::{
        DatabaseType, Dialect, DialectRegistry, MySqlDialect, OracleDialect, PostgresDialect,
        SqlServerDialect, SqliteDialect,
    };
    pub use crate::differ::{DifferOptions, SchemaDiffer};
    pub use crate::error::{MigrateError, Result};
    pub use crate::executor::{ExecutorOptions, MigrationExecutor, MigrationStatus, ValidationIssue};
    pub use crate::files::{MigrationDirectory, ScriptSource};
    pub use crate::generator::{GeneratorOptions, MigrationGenerator};
    pub use crate::history::MigrationHistory;
    pub use crate::schema::{
        Column, ColumnType, ForeignKey, ForeignKeyAction, GenerationStrategy, Index, Schema, Table,
        TableRef,
    };
    pub use crate::script::MigrationScript;
    pub use crate::state::MigrationState;
}
