//! Schema representation types.
//!
//! These types describe tables, columns, indexes and foreign keys as plain
//! structured metadata. A [`Schema`] is produced by an upstream collaborator
//! (entity extraction for the desired state, database introspection for the
//! current state) and is only ever read by the differ.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};

/// Semantic column types, independent of any SQL dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ColumnType {
    /// Character data.
    String,
    /// 32-bit integer.
    Integer,
    /// 64-bit integer.
    Long,
    /// Boolean.
    Boolean,
    /// Single precision floating point.
    Float,
    /// Double precision floating point.
    Double,
    /// Exact numeric with precision and scale.
    Decimal,
    /// Date only.
    Date,
    /// Time only.
    Time,
    /// Date and time.
    DateTime,
    /// Binary data.
    Binary,
    /// Enumerated value stored by name.
    Enum,
}

impl ColumnType {
    /// All semantic types, in declaration order.
    pub const ALL: [Self; 12] = [
        Self::String,
        Self::Integer,
        Self::Long,
        Self::Boolean,
        Self::Float,
        Self::Double,
        Self::Decimal,
        Self::Date,
        Self::Time,
        Self::DateTime,
        Self::Binary,
        Self::Enum,
    ];

    /// Returns the canonical upper-case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "STRING",
            Self::Integer => "INTEGER",
            Self::Long => "LONG",
            Self::Boolean => "BOOLEAN",
            Self::Float => "FLOAT",
            Self::Double => "DOUBLE",
            Self::Decimal => "DECIMAL",
            Self::Date => "DATE",
            Self::Time => "TIME",
            Self::DateTime => "DATETIME",
            Self::Binary => "BINARY",
            Self::Enum => "ENUM",
        }
    }

    /// Returns true for types whose `length` is meaningful.
    #[must_use]
    pub fn uses_length(&self) -> bool {
        matches!(self, Self::String | Self::Binary | Self::Enum)
    }

    /// Returns true for integral types that can carry an identity.
    #[must_use]
    pub fn is_integral(&self) -> bool {
        matches!(self, Self::Integer | Self::Long)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColumnType {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == upper)
            .ok_or_else(|| MigrateError::invalid_column("<type>", format!("unknown type '{s}'")))
    }
}

/// How a column's value is generated on insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationStrategy {
    /// Supplied by the application.
    #[default]
    None,
    /// Identity / auto-increment column.
    Identity,
    /// Drawn from a database sequence.
    Sequence,
}

/// Foreign key action (ON DELETE, ON UPDATE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForeignKeyAction {
    /// No action (error if referenced row is deleted/updated).
    NoAction,
    /// Restrict (same as NoAction but checked immediately).
    Restrict,
    /// Cascade the delete/update to referencing rows.
    Cascade,
    /// Set the foreign key column to NULL.
    SetNull,
    /// Set the foreign key column to its default value.
    SetDefault,
}

impl ForeignKeyAction {
    /// Returns the SQL representation of this action.
    #[must_use]
    pub fn to_sql(&self) -> &'static str {
        match self {
            Self::NoAction => "NO ACTION",
            Self::Restrict => "RESTRICT",
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
        }
    }
}

/// Column-level foreign-key linkage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnReference {
    /// Referenced table.
    pub table: String,
    /// Referenced column.
    pub column: String,
}

/// Schema definition for a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Semantic type.
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    /// Whether the column allows NULL values.
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Whether this column has a UNIQUE constraint.
    #[serde(default)]
    pub unique: bool,
    /// Whether this column is part of the primary key.
    #[serde(default)]
    pub primary_key: bool,
    /// Length for character and binary types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<i32>,
    /// Precision for decimal types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<i32>,
    /// Scale for decimal types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<i32>,
    /// Raw SQL literal used as DEFAULT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    /// Value generation strategy.
    #[serde(default)]
    pub generation: GenerationStrategy,
    /// Explicit sequence name for [`GenerationStrategy::Sequence`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_name: Option<String>,
    /// Foreign-key linkage declared on the column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<ColumnReference>,
    /// Free-text comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Column {
    /// Creates a new nullable column.
    #[must_use]
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            unique: false,
            primary_key: false,
            length: None,
            precision: None,
            scale: None,
            default_value: None,
            generation: GenerationStrategy::None,
            sequence_name: None,
            references: None,
            comment: None,
        }
    }

    /// Sets the column as NOT NULL.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Sets the column as nullable.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Sets the column as unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Marks the column as (part of) the primary key.
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Sets the length.
    #[must_use]
    pub fn length(mut self, length: i32) -> Self {
        self.length = Some(length);
        self
    }

    /// Sets precision and scale.
    #[must_use]
    pub fn precision(mut self, precision: i32, scale: i32) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    /// Sets the raw SQL default.
    #[must_use]
    pub fn default_value(mut self, sql: impl Into<String>) -> Self {
        self.default_value = Some(sql.into());
        self
    }

    /// Makes this an identity column.
    #[must_use]
    pub fn identity(mut self) -> Self {
        self.generation = GenerationStrategy::Identity;
        self
    }

    /// Draws values from a sequence (named, or `<table>_<column>_seq`).
    #[must_use]
    pub fn sequence(mut self, name: Option<&str>) -> Self {
        self.generation = GenerationStrategy::Sequence;
        self.sequence_name = name.map(str::to_string);
        self
    }

    /// Declares a column-level foreign key.
    #[must_use]
    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.references = Some(ColumnReference {
            table: table.into(),
            column: column.into(),
        });
        self
    }

    /// Sets the comment.
    #[must_use]
    pub fn comment(mut self, text: impl Into<String>) -> Self {
        self.comment = Some(text.into());
        self
    }

    /// Returns true if the column carries foreign-key linkage.
    #[must_use]
    pub fn is_foreign_key(&self) -> bool {
        self.references.is_some()
    }

    /// Returns true if values are generated by the database.
    #[must_use]
    pub fn is_generated(&self) -> bool {
        self.generation != GenerationStrategy::None
    }

    /// Returns a copy with primary-key-implied nullability resolved.
    #[must_use]
    pub fn normalized(&self) -> Self {
        let mut column = self.clone();
        if column.primary_key {
            column.nullable = false;
        }
        column
    }

    /// Returns the sequence backing this column, if it uses one.
    #[must_use]
    pub fn sequence_name_for(&self, table: &str) -> Option<String> {
        if self.generation != GenerationStrategy::Sequence {
            return None;
        }
        Some(
            self.sequence_name
                .clone()
                .unwrap_or_else(|| format!("{}_{}_seq", table, self.name)),
        )
    }

    /// Checks length/precision/scale and generation metadata.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MigrateError::invalid_column("<unnamed>", "column name is empty"));
        }
        if let Some(length) = self.length {
            if length <= 0 {
                return Err(MigrateError::invalid_column(
                    &self.name,
                    format!("length must be positive, got {length}"),
                ));
            }
        }
        if let Some(precision) = self.precision {
            if precision <= 0 {
                return Err(MigrateError::invalid_column(
                    &self.name,
                    format!("precision must be positive, got {precision}"),
                ));
            }
        }
        if let Some(scale) = self.scale {
            if scale < 0 {
                return Err(MigrateError::invalid_column(
                    &self.name,
                    format!("scale must not be negative, got {scale}"),
                ));
            }
            if let Some(precision) = self.precision {
                if scale > precision {
                    return Err(MigrateError::invalid_column(
                        &self.name,
                        format!("scale {scale} exceeds precision {precision}"),
                    ));
                }
            }
        }
        if self.generation == GenerationStrategy::Sequence {
            if let Some(name) = &self.sequence_name {
                if name.trim().is_empty() {
                    return Err(MigrateError::invalid_column(
                        &self.name,
                        "sequence name is empty",
                    ));
                }
            }
        }
        if self.is_generated() && !self.column_type.is_integral() {
            return Err(MigrateError::invalid_column(
                &self.name,
                format!("{} column cannot be database-generated", self.column_type),
            ));
        }
        Ok(())
    }

    /// Compares everything that ends up in the column's DDL definition.
    ///
    /// The name and comment do not take part.
    #[must_use]
    pub fn same_definition(&self, other: &Self) -> bool {
        let a = self.normalized();
        let b = other.normalized();
        a.column_type == b.column_type
            && a.nullable == b.nullable
            && a.length == b.length
            && a.precision == b.precision
            && a.scale == b.scale
            && a.unique == b.unique
            && a.primary_key == b.primary_key
            && a.generation == b.generation
            && a.default_value == b.default_value
    }
}

/// Schema definition for an index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Index {
    /// Index name.
    pub name: String,
    /// Whether this is a unique index.
    #[serde(default)]
    pub unique: bool,
    /// Indexed columns; order is part of the index identity.
    pub columns: Vec<String>,
}

impl Index {
    /// Creates a non-unique index.
    #[must_use]
    pub fn new(name: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            unique: false,
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
        }
    }

    /// Makes the index unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Same columns in the same order, same uniqueness.
    #[must_use]
    pub fn same_definition(&self, other: &Self) -> bool {
        self.unique == other.unique && self.columns == other.columns
    }
}

/// Schema definition for a foreign key constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Constraint name.
    pub name: String,
    /// Column(s) in the referencing table.
    pub columns: Vec<String>,
    /// Referenced table name.
    pub referenced_table: String,
    /// Referenced column(s), paired with `columns`.
    pub referenced_columns: Vec<String>,
    /// Action on delete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<ForeignKeyAction>,
    /// Action on update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_update: Option<ForeignKeyAction>,
    /// DEFERRABLE, where supported.
    #[serde(default)]
    pub deferrable: bool,
    /// INITIALLY DEFERRED, where supported.
    #[serde(default)]
    pub initially_deferred: bool,
}

impl ForeignKey {
    /// Creates a single-column foreign key.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        column: impl Into<String>,
        referenced_table: impl Into<String>,
        referenced_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            columns: vec![column.into()],
            referenced_table: referenced_table.into(),
            referenced_columns: vec![referenced_column.into()],
            on_delete: None,
            on_update: None,
            deferrable: false,
            initially_deferred: false,
        }
    }

    /// Adds another (column, referenced column) pair.
    #[must_use]
    pub fn pair(mut self, column: impl Into<String>, referenced: impl Into<String>) -> Self {
        self.columns.push(column.into());
        self.referenced_columns.push(referenced.into());
        self
    }

    /// Sets the ON DELETE action.
    #[must_use]
    pub fn on_delete(mut self, action: ForeignKeyAction) -> Self {
        self.on_delete = Some(action);
        self
    }

    /// Sets the ON UPDATE action.
    #[must_use]
    pub fn on_update(mut self, action: ForeignKeyAction) -> Self {
        self.on_update = Some(action);
        self
    }

    /// Marks the constraint deferrable, optionally initially deferred.
    #[must_use]
    pub fn deferrable(mut self, initially_deferred: bool) -> Self {
        self.deferrable = true;
        self.initially_deferred = initially_deferred;
        self
    }

    /// Iterates (column, referenced column) pairs.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.referenced_columns.iter().map(String::as_str))
    }

    /// Compares the fields that define the constraint.
    #[must_use]
    pub fn same_definition(&self, other: &Self) -> bool {
        self.columns == other.columns
            && self.referenced_table == other.referenced_table
            && self.referenced_columns == other.referenced_columns
            && self.on_delete == other.on_delete
            && self.on_update == other.on_update
    }
}

/// A table name with its optional qualifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    /// Table name.
    pub name: String,
    /// Schema qualifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

impl TableRef {
    /// Creates an unqualified table reference.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: None,
        }
    }

    /// Qualifies the reference with a schema.
    #[must_use]
    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Complete schema definition for a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Table name.
    pub name: String,
    /// Schema qualifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// Catalog qualifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<String>,
    /// Columns in declaration order.
    #[serde(default)]
    pub columns: Vec<Column>,
    /// Index definitions.
    #[serde(default)]
    pub indexes: Vec<Index>,
    /// Foreign key definitions.
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    /// Table comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Table {
    /// Creates a new table schema.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: None,
            catalog: None,
            columns: Vec::new(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
            comment: None,
        }
    }

    /// Sets the schema qualifier.
    #[must_use]
    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Adds a column to the table.
    #[must_use]
    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Adds an index.
    #[must_use]
    pub fn index(mut self, index: Index) -> Self {
        self.indexes.push(index);
        self
    }

    /// Adds a foreign key.
    #[must_use]
    pub fn foreign_key(mut self, fk: ForeignKey) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    /// Sets the table comment.
    #[must_use]
    pub fn comment(mut self, text: impl Into<String>) -> Self {
        self.comment = Some(text.into());
        self
    }

    /// Returns the name and schema qualifier of this table.
    #[must_use]
    pub fn reference(&self) -> TableRef {
        TableRef {
            name: self.name.clone(),
            schema: self.schema.clone(),
        }
    }

    /// Gets a column by name.
    #[must_use]
    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Gets an index by name.
    #[must_use]
    pub fn get_index(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Primary-key columns in declaration order.
    #[must_use]
    pub fn primary_key_columns(&self) -> Vec<&Column> {
        self.columns.iter().filter(|c| c.primary_key).collect()
    }

    /// Explicit foreign keys plus those declared through column linkage.
    #[must_use]
    pub fn effective_foreign_keys(&self) -> Vec<ForeignKey> {
        let mut keys = self.foreign_keys.clone();
        for column in &self.columns {
            let Some(reference) = &column.references else {
                continue;
            };
            let covered = keys.iter().any(|fk| {
                fk.columns.len() == 1
                    && fk.columns[0] == column.name
                    && fk.referenced_table == reference.table
            });
            if !covered {
                keys.push(ForeignKey::new(
                    format!("fk_{}_{}", self.name, column.name),
                    column.name.clone(),
                    reference.table.clone(),
                    reference.column.clone(),
                ));
            }
        }
        keys
    }

    /// Checks name uniqueness and column metadata.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(MigrateError::InvalidState("table name is empty".into()));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            column.validate()?;
            if !seen.insert(column.name.as_str()) {
                return Err(MigrateError::InvalidState(format!(
                    "duplicate column '{}' in table '{}'",
                    column.name, self.name
                )));
            }
        }

        let mut seen = HashSet::new();
        for index in &self.indexes {
            if !seen.insert(index.name.as_str()) {
                return Err(MigrateError::InvalidState(format!(
                    "duplicate index '{}' in table '{}'",
                    index.name, self.name
                )));
            }
            if index.columns.is_empty() {
                return Err(MigrateError::InvalidState(format!(
                    "index '{}' on '{}' has no columns",
                    index.name, self.name
                )));
            }
            if let Some(missing) = index.columns.iter().find(|c| self.get_column(c).is_none()) {
                return Err(MigrateError::InvalidState(format!(
                    "index '{}' references unknown column '{}.{}'",
                    index.name, self.name, missing
                )));
            }
        }

        let mut seen = HashSet::new();
        for fk in &self.foreign_keys {
            if !seen.insert(fk.name.as_str()) {
                return Err(MigrateError::InvalidState(format!(
                    "duplicate foreign key '{}' in table '{}'",
                    fk.name, self.name
                )));
            }
            if fk.columns.is_empty() || fk.columns.len() != fk.referenced_columns.len() {
                return Err(MigrateError::InvalidState(format!(
                    "foreign key '{}' on '{}' must pair each column with a referenced column",
                    fk.name, self.name
                )));
            }
        }

        Ok(())
    }
}

/// A named, ordered collection of tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Schema name.
    #[serde(default)]
    pub name: String,
    /// All tables, in insertion order.
    #[serde(default)]
    pub tables: Vec<Table>,
}

impl Schema {
    /// Creates a new empty schema.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: Vec::new(),
        }
    }

    /// Adds a table to the schema.
    #[must_use]
    pub fn table(mut self, table: Table) -> Self {
        self.tables.push(table);
        self
    }

    /// Gets a table by name (case-sensitive).
    #[must_use]
    pub fn get_table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Returns table names in insertion order.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(|t| t.name.as_str())
    }

    /// Validates every table and table-name uniqueness.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for table in &self.tables {
            if !seen.insert(table.name.as_str()) {
                return Err(MigrateError::InvalidState(format!(
                    "duplicate table '{}' in schema '{}'",
                    table.name, self.name
                )));
            }
            table.validate()?;
        }
        Ok(())
    }

    /// Parses a schema document produced by an upstream collaborator.
    pub fn from_json(json: &str) -> Result<Self> {
        let schema: Self = serde_json::from_str(json)?;
        schema.validate()?;
        Ok(schema)
    }
}
