//! Database dialect implementations.
//!
//! Each dialect knows how to render schema changes as DDL for one database
//! product. The shared rendering lives in default methods of [`Dialect`];
//! concrete dialects override the hooks where their syntax or capabilities
//! differ.

mod mysql;
mod oracle;
mod postgres;
mod sqlite;
mod sqlserver;

pub use mysql::MySqlDialect;
pub use oracle::OracleDialect;
pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;
pub use sqlserver::SqlServerDialect;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::change::ChangeKind;
use crate::error::{MigrateError, Result};
use crate::schema::{
    Column, ForeignKey, ForeignKeyAction, GenerationStrategy, Index, Table, TableRef,
};

/// Supported database products.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// MySQL / MariaDB.
    MySql,
    /// PostgreSQL.
    Postgres,
    /// Oracle Database.
    Oracle,
    /// Microsoft SQL Server.
    SqlServer,
    /// SQLite.
    Sqlite,
}

impl DatabaseType {
    /// All database types.
    pub const ALL: [Self; 5] = [
        Self::MySql,
        Self::Postgres,
        Self::Oracle,
        Self::SqlServer,
        Self::Sqlite,
    ];

    /// Canonical lower-case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Postgres => "postgresql",
            Self::Oracle => "oracle",
            Self::SqlServer => "sqlserver",
            Self::Sqlite => "sqlite",
        }
    }

    /// Detects the database type from a connection URL.
    ///
    /// Accepts plain URLs (`postgres://..`, `sqlite::memory:`) and their
    /// `jdbc:` prefixed forms.
    pub fn from_url(url: &str) -> Result<Self> {
        let trimmed = url.trim();
        let lower = trimmed.to_ascii_lowercase();
        let rest = lower.strip_prefix("jdbc:").unwrap_or(&lower);
        let scheme = rest.split(':').next().unwrap_or_default();
        scheme
            .parse()
            .map_err(|_| MigrateError::UnsupportedDatabase(trimmed.to_string()))
    }

    /// Returns true if the engine can connect to this database and run
    /// migrations, not just generate them.
    #[must_use]
    pub fn is_executable(&self) -> bool {
        matches!(self, Self::MySql | Self::Postgres | Self::Sqlite)
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseType {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Self::MySql),
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "oracle" => Ok(Self::Oracle),
            "sqlserver" | "mssql" => Ok(Self::SqlServer),
            "sqlite" | "sqlite3" => Ok(Self::Sqlite),
            other => Err(MigrateError::UnsupportedDatabase(other.to_string())),
        }
    }
}

/// How a dialect serializes concurrent migration runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStrategy {
    /// A native advisory lock.
    ///
    /// `acquire` is a non-blocking try-lock query returning a single integer
    /// row, `1` when the lock was taken. `release` frees it.
    Advisory {
        /// Try-lock query.
        acquire: String,
        /// Unlock statement.
        release: String,
    },
    /// A row in a dedicated lock table, whose primary key makes the insert
    /// fail while another run holds it.
    Table,
}

/// Trait for database-specific DDL generation.
///
/// Every DDL method returns the complete, ordered statement list for one
/// change. Operations the database cannot express fail with
/// [`MigrateError::UnsupportedOperation`].
pub trait Dialect: Send + Sync + fmt::Debug {
    /// The database this dialect targets.
    fn database_type(&self) -> DatabaseType;

    /// Returns the dialect name.
    fn name(&self) -> &'static str {
        self.database_type().as_str()
    }

    /// Opening and closing identifier quote characters.
    fn quote_chars(&self) -> (char, char) {
        ('"', '"')
    }

    /// Quotes an identifier, doubling any embedded closing quote character.
    fn quote_identifier(&self, name: &str) -> String {
        let (open, close) = self.quote_chars();
        let mut quoted = String::with_capacity(name.len() + 2);
        quoted.push(open);
        for ch in name.chars() {
            if ch == close {
                quoted.push(close);
            }
            quoted.push(ch);
        }
        quoted.push(close);
        quoted
    }

    /// Renders an identifier, quoting it only when it needs quoting.
    fn identifier(&self, name: &str) -> String {
        if is_plain_identifier(name) {
            name.to_string()
        } else {
            self.quote_identifier(name)
        }
    }

    /// Renders a possibly schema-qualified table name.
    fn table_name(&self, table: &TableRef) -> String {
        match &table.schema {
            Some(schema) => format!("{}.{}", self.identifier(schema), self.identifier(&table.name)),
            None => self.identifier(&table.name),
        }
    }

    /// Maps a column's semantic type and dimensions to a native type.
    fn map_type(&self, column: &Column) -> Result<String>;

    /// Type plus generation clause for an identity column.
    ///
    /// `inline_primary_key` is set when the column is the table's only
    /// primary key column and the dialect declared it inlines it.
    fn identity_definition(&self, column: &Column, inline_primary_key: bool) -> Result<String> {
        let _ = inline_primary_key;
        Ok(format!("{} GENERATED BY DEFAULT AS IDENTITY", self.map_type(column)?))
    }

    /// Whether the primary key is declared on this column instead of in a
    /// table-level clause, when it is the only primary key column.
    fn inlines_primary_key(&self, column: &Column) -> bool {
        let _ = column;
        false
    }

    /// Whether the database has sequences.
    fn supports_sequences(&self) -> bool {
        false
    }

    /// Statement creating a sequence.
    fn create_sequence(&self, name: &str) -> String {
        format!("CREATE SEQUENCE {name} START WITH 1 INCREMENT BY 1")
    }

    /// Expression drawing the next sequence value.
    fn next_value(&self, sequence: &str) -> String {
        format!("NEXT VALUE FOR {sequence}")
    }

    /// Inline column comment clause, where the dialect has one.
    fn inline_comment(&self, comment: &str) -> Option<String> {
        let _ = comment;
        None
    }

    /// Whether comments are set with `COMMENT ON` statements.
    fn supports_comment_on(&self) -> bool {
        false
    }

    /// Trailing CREATE TABLE options.
    fn table_options(&self, table: &Table) -> String {
        let _ = table;
        String::new()
    }

    /// ON DELETE rendering for an action, `None` when unsupported.
    fn on_delete_action(&self, action: ForeignKeyAction) -> Option<&'static str> {
        Some(action.to_sql())
    }

    /// ON UPDATE rendering for an action, `None` when unsupported.
    fn on_update_action(&self, action: ForeignKeyAction) -> Option<&'static str> {
        Some(action.to_sql())
    }

    /// Whether constraints can be DEFERRABLE.
    fn supports_deferrable(&self) -> bool {
        false
    }

    /// Whether DDL statements can be rolled back as part of a transaction.
    fn transactional_ddl(&self) -> bool {
        false
    }

    /// Statement opening the migration transaction.
    fn begin_transaction(&self) -> &'static str {
        "BEGIN TRANSACTION"
    }

    /// Statement committing the migration transaction.
    fn commit_transaction(&self) -> &'static str {
        "COMMIT"
    }

    /// Bind parameter marker for the `n`th (1-based) parameter.
    fn placeholder(&self, n: usize) -> String {
        let _ = n;
        "?".to_string()
    }

    /// Query returning a single integer row, non-zero when `table` exists.
    fn table_exists_sql(&self, table: &TableRef) -> String;

    /// Lock strategy for the given lock key.
    fn lock_strategy(&self, key: &str) -> LockStrategy {
        let _ = key;
        LockStrategy::Table
    }

    /// ALTER TABLE clause adding a rendered column definition.
    fn add_column_clause(&self, definition: &str) -> String {
        format!("ADD COLUMN {definition}")
    }

    /// Inline `UNIQUE` constraint of a column definition.
    fn unique_clause(&self, table: &TableRef, column: &Column) -> String {
        let _ = (table, column);
        "UNIQUE".to_string()
    }

    /// Inline `DEFAULT` of a column definition.
    fn default_clause(&self, table: &TableRef, column: &Column, default: &str) -> String {
        let _ = (table, column);
        format!("DEFAULT {default}")
    }

    /// Ways in which the database will not store `change` as declared.
    ///
    /// The generator copies these into the script's warnings.
    fn change_warnings(&self, change: &ChangeKind) -> Vec<String> {
        let _ = change;
        Vec::new()
    }

    /// Renders one column definition.
    fn render_column(
        &self,
        table: &TableRef,
        column: &Column,
        inline_primary_key: bool,
    ) -> Result<String> {
        let column = column.normalized();
        column.validate()?;

        let mut sql = self.identifier(&column.name);
        sql.push(' ');

        let mut default = column.default_value.clone();
        match effective_generation(self, &column) {
            GenerationStrategy::Identity => {
                sql.push_str(&self.identity_definition(&column, inline_primary_key)?);
                default = None;
            }
            GenerationStrategy::Sequence => {
                sql.push_str(&self.map_type(&column)?);
                let sequence = sequence_ref(self, table, &column);
                default = sequence.map(|s| self.next_value(&s));
            }
            GenerationStrategy::None => sql.push_str(&self.map_type(&column)?),
        }

        if let Some(default) = default {
            sql.push(' ');
            sql.push_str(&self.default_clause(table, &column, &default));
        }
        if !column.nullable && !column.primary_key {
            sql.push_str(" NOT NULL");
        }
        if column.unique && !column.primary_key {
            sql.push(' ');
            sql.push_str(&self.unique_clause(table, &column));
        }
        if let Some(comment) = column.comment.as_deref().and_then(|c| self.inline_comment(c)) {
            sql.push(' ');
            sql.push_str(&comment);
        }
        Ok(sql)
    }

    /// Renders a column definition as used by ADD COLUMN.
    fn column_definition(&self, table: &TableRef, column: &Column) -> Result<String> {
        self.render_column(table, column, column.primary_key && self.inlines_primary_key(column))
    }

    /// Renders a `CONSTRAINT .. FOREIGN KEY ..` clause.
    fn foreign_key_constraint(&self, fk: &ForeignKey) -> String {
        let mut sql = format!(
            "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
            self.identifier(&fk.name),
            column_list(self, &fk.columns),
            self.identifier(&fk.referenced_table),
            column_list(self, &fk.referenced_columns),
        );
        if let Some(action) = fk.on_delete.and_then(|a| self.on_delete_action(a)) {
            sql.push_str(" ON DELETE ");
            sql.push_str(action);
        }
        if let Some(action) = fk.on_update.and_then(|a| self.on_update_action(a)) {
            sql.push_str(" ON UPDATE ");
            sql.push_str(action);
        }
        if fk.deferrable && self.supports_deferrable() {
            sql.push_str(" DEFERRABLE");
            if fk.initially_deferred {
                sql.push_str(" INITIALLY DEFERRED");
            }
        }
        sql
    }

    /// `COMMENT ON` statements for a table and its columns.
    fn comment_statements(&self, table: &Table) -> Vec<String> {
        if !self.supports_comment_on() {
            return Vec::new();
        }
        let reference = table.reference();
        let name = self.table_name(&reference);
        let mut statements = Vec::new();
        if let Some(comment) = &table.comment {
            statements.push(format!(
                "COMMENT ON TABLE {name} IS {}",
                string_literal(comment)
            ));
        }
        for column in &table.columns {
            statements.extend(self.column_comment(&reference, column));
        }
        statements
    }

    /// `COMMENT ON COLUMN` for one column, if it has a comment.
    fn column_comment(&self, table: &TableRef, column: &Column) -> Option<String> {
        if !self.supports_comment_on() {
            return None;
        }
        column.comment.as_ref().map(|comment| {
            format!(
                "COMMENT ON COLUMN {}.{} IS {}",
                self.table_name(table),
                self.identifier(&column.name),
                string_literal(comment)
            )
        })
    }

    /// CREATE TABLE, including its sequences, indexes and comments.
    fn create_table(&self, table: &Table) -> Result<Vec<String>> {
        table.validate()?;
        let reference = table.reference();
        let mut statements = Vec::new();

        for column in &table.columns {
            if let Some(sequence) = sequence_ref(self, &reference, column) {
                statements.push(self.create_sequence(&sequence));
            }
        }

        let primary_key = table.primary_key_columns();
        let inline = primary_key.len() == 1 && self.inlines_primary_key(primary_key[0]);

        let mut lines = Vec::with_capacity(table.columns.len() + 1);
        for column in &table.columns {
            lines.push(self.render_column(&reference, column, inline && column.primary_key)?);
        }
        if !primary_key.is_empty() && !inline {
            let names: Vec<String> = primary_key.iter().map(|c| c.name.clone()).collect();
            lines.push(format!("PRIMARY KEY ({})", column_list(self, &names)));
        }
        for fk in table.effective_foreign_keys() {
            lines.push(self.foreign_key_constraint(&fk));
        }

        statements.push(format!(
            "CREATE TABLE {} (\n    {}\n){}",
            self.table_name(&reference),
            lines.join(",\n    "),
            self.table_options(table)
        ));

        for index in &table.indexes {
            statements.extend(self.create_index(&reference, index)?);
        }
        statements.extend(self.comment_statements(table));
        Ok(statements)
    }

    /// DROP TABLE, followed by the table's sequences.
    fn drop_table(&self, table: &Table) -> Result<Vec<String>> {
        let reference = table.reference();
        let mut statements = vec![format!("DROP TABLE {}", self.table_name(&reference))];
        for column in &table.columns {
            if let Some(sequence) = sequence_ref(self, &reference, column) {
                statements.push(format!("DROP SEQUENCE {sequence}"));
            }
        }
        Ok(statements)
    }

    /// Renames a table.
    fn rename_table(&self, from: &TableRef, to: &TableRef) -> Result<Vec<String>> {
        Ok(vec![format!(
            "ALTER TABLE {} RENAME TO {}",
            self.table_name(from),
            self.identifier(&to.name)
        )])
    }

    /// Adds a column, creating its sequence first if it draws from one.
    fn add_column(&self, table: &TableRef, column: &Column) -> Result<Vec<String>> {
        let mut statements = Vec::new();
        if let Some(sequence) = sequence_ref(self, table, column) {
            statements.push(self.create_sequence(&sequence));
        }
        let definition = self.column_definition(table, column)?;
        statements.push(format!(
            "ALTER TABLE {} {}",
            self.table_name(table),
            self.add_column_clause(&definition)
        ));
        statements.extend(self.column_comment(table, column));
        Ok(statements)
    }

    /// Drops a column, then its sequence.
    fn drop_column(&self, table: &TableRef, column: &Column) -> Result<Vec<String>> {
        let mut statements = vec![format!(
            "ALTER TABLE {} DROP COLUMN {}",
            self.table_name(table),
            self.identifier(&column.name)
        )];
        if let Some(sequence) = sequence_ref(self, table, column) {
            statements.push(format!("DROP SEQUENCE {sequence}"));
        }
        Ok(statements)
    }

    /// Changes a column's definition from `old` to `new`.
    fn modify_column(&self, table: &TableRef, old: &Column, new: &Column) -> Result<Vec<String>>;

    /// Renames a column.
    fn rename_column(&self, table: &TableRef, old: &Column, new: &Column) -> Result<Vec<String>> {
        Ok(vec![format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            self.table_name(table),
            self.identifier(&old.name),
            self.identifier(&new.name)
        )])
    }

    /// Creates an index.
    fn create_index(&self, table: &TableRef, index: &Index) -> Result<Vec<String>> {
        if index.columns.is_empty() {
            return Err(MigrateError::InvalidState(format!(
                "index '{}' has no columns",
                index.name
            )));
        }
        Ok(vec![format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.unique { "UNIQUE " } else { "" },
            self.identifier(&index.name),
            self.table_name(table),
            column_list(self, &index.columns)
        )])
    }

    /// Drops an index.
    fn drop_index(&self, table: &TableRef, index: &Index) -> Result<Vec<String>> {
        let qualified = TableRef {
            name: index.name.clone(),
            schema: table.schema.clone(),
        };
        Ok(vec![format!("DROP INDEX {}", self.table_name(&qualified))])
    }

    /// Renames an index.
    fn rename_index(&self, table: &TableRef, old: &Index, new: &Index) -> Result<Vec<String>> {
        let qualified = TableRef {
            name: old.name.clone(),
            schema: table.schema.clone(),
        };
        Ok(vec![format!(
            "ALTER INDEX {} RENAME TO {}",
            self.table_name(&qualified),
            self.identifier(&new.name)
        )])
    }

    /// Adds a foreign key constraint to an existing table.
    fn add_foreign_key(&self, table: &TableRef, fk: &ForeignKey) -> Result<Vec<String>> {
        Ok(vec![format!(
            "ALTER TABLE {} ADD {}",
            self.table_name(table),
            self.foreign_key_constraint(fk)
        )])
    }

    /// Drops a foreign key constraint.
    fn drop_foreign_key(&self, table: &TableRef, fk: &ForeignKey) -> Result<Vec<String>> {
        Ok(vec![format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            self.table_name(table),
            self.identifier(&fk.name)
        )])
    }
}

/// Explicitly constructed mapping from database type to dialect.
#[derive(Debug, Clone, Default)]
pub struct DialectRegistry {
    dialects: BTreeMap<DatabaseType, Arc<dyn Dialect>>,
}

impl DialectRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with all five built-in dialects.
    #[must_use]
    pub fn standard() -> Self {
        Self::new()
            .with(Arc::new(MySqlDialect::new()))
            .with(Arc::new(PostgresDialect::new()))
            .with(Arc::new(OracleDialect::new()))
            .with(Arc::new(SqlServerDialect::new()))
            .with(Arc::new(SqliteDialect::new()))
    }

    /// Registers a dialect under its own database type.
    #[must_use]
    pub fn with(mut self, dialect: Arc<dyn Dialect>) -> Self {
        self.register(dialect);
        self
    }

    /// Registers a dialect, replacing any previous one for the same type.
    pub fn register(&mut self, dialect: Arc<dyn Dialect>) {
        self.dialects.insert(dialect.database_type(), dialect);
    }

    /// Looks up a dialect by database type.
    pub fn get(&self, database: DatabaseType) -> Result<Arc<dyn Dialect>> {
        self.dialects
            .get(&database)
            .cloned()
            .ok_or_else(|| MigrateError::UnsupportedDatabase(database.to_string()))
    }

    /// Resolves the dialect for a connection URL.
    pub fn for_url(&self, url: &str) -> Result<Arc<dyn Dialect>> {
        self.get(DatabaseType::from_url(url)?)
    }

    /// Registered database types, in order.
    pub fn database_types(&self) -> impl Iterator<Item = DatabaseType> + '_ {
        self.dialects.keys().copied()
    }
}

/// Words that are reserved in at least one supported dialect.
///
/// Sorted, so lookups can binary search.
const RESERVED_WORDS: &[&str] = &[
    "access", "add", "all", "alter", "and", "any", "as", "asc", "audit", "authorization",
    "backup", "begin", "between", "by", "cascade", "case", "check", "cluster", "column",
    "comment", "commit", "compress", "constraint", "create", "cross", "current",
    "current_date", "current_time", "current_timestamp", "current_user", "database",
    "date", "default", "delete", "desc", "distinct", "drop", "else", "end", "except",
    "exclusive", "exists", "file", "for", "foreign", "from", "full", "grant", "group",
    "having", "identified", "identity", "immediate", "in", "increment", "index",
    "initial", "inner", "insert", "intersect", "into", "is", "join", "key", "left",
    "level", "like", "limit", "lock", "long", "maxextents", "minus", "mode", "modify",
    "natural", "not", "null", "number", "of", "offline", "offset", "on", "online",
    "option", "or", "order", "outer", "pctfree", "primary", "prior", "privileges",
    "procedure", "public", "range", "raw", "references", "rename", "resource", "revoke",
    "right", "row", "rowid", "rownum", "rows", "schema", "select", "session", "set",
    "share", "size", "start", "successful", "synonym", "sysdate", "table", "then", "to",
    "top", "transaction", "trigger", "truncate", "union", "unique", "update", "user",
    "using", "validate", "values", "varchar", "varchar2", "view", "whenever", "where",
    "with",
];

/// Returns true if `word` is reserved in any supported dialect.
#[must_use]
pub fn is_reserved_word(word: &str) -> bool {
    RESERVED_WORDS
        .binary_search(&word.to_ascii_lowercase().as_str())
        .is_ok()
}

/// Lower-case `[a-z_][a-z0-9_]*` identifiers that are not reserved words.
#[must_use]
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !is_reserved_word(name)
}

/// Renders a single-quoted SQL string literal.
#[must_use]
pub fn string_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Comma-separated rendered identifiers.
pub(crate) fn column_list<D: Dialect + ?Sized>(dialect: &D, columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| dialect.identifier(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Generation strategy after accounting for missing sequence support.
pub(crate) fn effective_generation<D: Dialect + ?Sized>(
    dialect: &D,
    column: &Column,
) -> GenerationStrategy {
    match column.generation {
        GenerationStrategy::Sequence if !dialect.supports_sequences() => {
            GenerationStrategy::Identity
        }
        other => other,
    }
}

/// Rendered, schema-qualified sequence name backing `column`, if any.
pub(crate) fn sequence_ref<D: Dialect + ?Sized>(
    dialect: &D,
    table: &TableRef,
    column: &Column,
) -> Option<String> {
    if effective_generation(dialect, column) != GenerationStrategy::Sequence {
        return None;
    }
    column.sequence_name_for(&table.name).map(|name| {
        dialect.table_name(&TableRef {
            name,
            schema: table.schema.clone(),
        })
    })
}

/// Name given to a column's single-column unique constraint.
pub(crate) fn unique_constraint_name(table: &TableRef, column: &str) -> String {
    format!("uq_{}_{column}", table.name)
}

/// Rejects column changes that ALTER cannot express in place.
///
/// Moving a column in or out of the primary key, or changing how its values
/// are generated, needs a hand-written migration.
pub(crate) fn ensure_modifiable<D: Dialect + ?Sized>(
    dialect: &D,
    old: &Column,
    new: &Column,
) -> Result<()> {
    if old.primary_key != new.primary_key {
        return Err(MigrateError::unsupported(
            dialect.name(),
            "MODIFY COLUMN",
            format!("'{}' changes primary key membership", new.name),
        ));
    }
    if effective_generation(dialect, old) != effective_generation(dialect, new) {
        return Err(MigrateError::unsupported(
            dialect.name(),
            "MODIFY COLUMN",
            format!("'{}' changes its value generation strategy", new.name),
        ));
    }
    Ok(())
}

/// Declared length, or `default` when unset.
pub(crate) fn length_or(column: &Column, default: i32) -> i32 {
    column.length.unwrap_or(default)
}

/// Precision and scale, defaulting to (19, 2).
pub(crate) fn decimal_dimensions(column: &Column) -> (i32, i32) {
    match (column.precision, column.scale) {
        (Some(p), Some(s)) => (p, s),
        (Some(p), None) => (p, 0),
        (None, Some(s)) => (19.max(s), s),
        (None, None) => (19, 2),
    }
}
