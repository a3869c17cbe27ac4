//! Microsoft SQL Server dialect.
//!
//! Inline `DEFAULT` and `UNIQUE` constraints are named `df_<table>_<column>`
//! and `uq_<table>_<column>` so later migrations can drop them.

use crate::error::Result;
use crate::schema::{Column, ColumnType, ForeignKeyAction, GenerationStrategy, Index, TableRef};

use super::{
    decimal_dimensions, effective_generation, ensure_modifiable, length_or, sequence_ref,
    string_literal, unique_constraint_name, DatabaseType, Dialect, LockStrategy,
};

/// Longest string stored as `VARCHAR(n)` before switching to `NVARCHAR(MAX)`.
const VARCHAR_LIMIT: i32 = 8000;

/// SQL Server migration dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerDialect;

impl SqlServerDialect {
    /// Creates a new SQL Server dialect.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Dotted object path as `sp_rename` expects it.
    fn object_path(table: &TableRef, object: Option<&str>) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(3);
        if let Some(schema) = &table.schema {
            parts.push(schema);
        }
        parts.push(&table.name);
        if let Some(object) = object {
            parts.push(object);
        }
        string_literal(&parts.join("."))
    }

    fn default_constraint_name(table: &TableRef, column: &str) -> String {
        format!("df_{}_{column}", table.name)
    }

    /// The DEFAULT expression a column definition renders, if any.
    fn default_expression(&self, table: &TableRef, column: &Column) -> Option<String> {
        match effective_generation(self, column) {
            GenerationStrategy::Identity => None,
            GenerationStrategy::Sequence => {
                sequence_ref(self, table, column).map(|s| self.next_value(&s))
            }
            GenerationStrategy::None => column.default_value.clone(),
        }
    }

    /// `sp_rename` of a constraint named after the column.
    fn rename_constraint(&self, table: &TableRef, old: &str, new: &str) -> String {
        let constraint = TableRef {
            name: old.to_string(),
            schema: table.schema.clone(),
        };
        format!(
            "EXEC sp_rename {}, {}, 'OBJECT'",
            Self::object_path(&constraint, None),
            string_literal(new)
        )
    }
}

impl Dialect for SqlServerDialect {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::SqlServer
    }

    fn quote_chars(&self) -> (char, char) {
        ('[', ']')
    }

    fn map_type(&self, column: &Column) -> Result<String> {
        column.validate()?;
        Ok(match column.column_type {
            ColumnType::String => {
                let length = length_or(column, 255);
                if length > VARCHAR_LIMIT {
                    "NVARCHAR(MAX)".to_string()
                } else {
                    format!("VARCHAR({length})")
                }
            }
            ColumnType::Integer => "INT".to_string(),
            ColumnType::Long => "BIGINT".to_string(),
            ColumnType::Boolean => "BIT".to_string(),
            ColumnType::Float => "REAL".to_string(),
            ColumnType::Double => "FLOAT".to_string(),
            ColumnType::Decimal => {
                let (precision, scale) = decimal_dimensions(column);
                format!("DECIMAL({precision},{scale})")
            }
            ColumnType::Date => "DATE".to_string(),
            ColumnType::Time => "TIME".to_string(),
            ColumnType::DateTime => "DATETIME2".to_string(),
            ColumnType::Binary => match column.length {
                Some(n) if n <= VARCHAR_LIMIT => format!("VARBINARY({n})"),
                _ => "VARBINARY(MAX)".to_string(),
            },
            ColumnType::Enum => format!("VARCHAR({})", length_or(column, 255)),
        })
    }

    fn identity_definition(&self, column: &Column, _inline_primary_key: bool) -> Result<String> {
        Ok(format!("{} IDENTITY(1,1)", self.map_type(column)?))
    }

    fn supports_sequences(&self) -> bool {
        true
    }

    fn create_sequence(&self, name: &str) -> String {
        format!("CREATE SEQUENCE {name} AS BIGINT START WITH 1 INCREMENT BY 1")
    }

    fn on_delete_action(&self, action: ForeignKeyAction) -> Option<&'static str> {
        Some(match action {
            ForeignKeyAction::Restrict => ForeignKeyAction::NoAction.to_sql(),
            other => other.to_sql(),
        })
    }

    fn on_update_action(&self, action: ForeignKeyAction) -> Option<&'static str> {
        self.on_delete_action(action)
    }

    fn placeholder(&self, n: usize) -> String {
        format!("@p{n}")
    }

    fn table_exists_sql(&self, table: &TableRef) -> String {
        let schema = match &table.schema {
            Some(schema) => string_literal(schema),
            None => "SCHEMA_NAME()".to_string(),
        };
        format!(
            "SELECT COUNT(*) FROM INFORMATION_SCHEMA.TABLES WHERE TABLE_SCHEMA = {schema} AND TABLE_NAME = {}",
            string_literal(&table.name)
        )
    }

    fn lock_strategy(&self, key: &str) -> LockStrategy {
        let key = string_literal(key);
        LockStrategy::Advisory {
            acquire: format!(
                "DECLARE @result INT; \
                 EXEC @result = sp_getapplock @Resource = {key}, @LockMode = 'Exclusive', \
                 @LockOwner = 'Session', @LockTimeout = 0; \
                 SELECT CAST(CASE WHEN @result >= 0 THEN 1 ELSE 0 END AS BIGINT)"
            ),
            release: format!("EXEC sp_releaseapplock @Resource = {key}, @LockOwner = 'Session'"),
        }
    }

    fn add_column_clause(&self, definition: &str) -> String {
        format!("ADD {definition}")
    }

    fn unique_clause(&self, table: &TableRef, column: &Column) -> String {
        format!(
            "CONSTRAINT {} UNIQUE",
            self.identifier(&unique_constraint_name(table, &column.name))
        )
    }

    fn default_clause(&self, table: &TableRef, column: &Column, default: &str) -> String {
        format!(
            "CONSTRAINT {} DEFAULT {default}",
            self.identifier(&Self::default_constraint_name(table, &column.name))
        )
    }

    fn rename_table(&self, from: &TableRef, to: &TableRef) -> Result<Vec<String>> {
        Ok(vec![format!(
            "EXEC sp_rename {}, {}",
            Self::object_path(from, None),
            string_literal(&to.name)
        )])
    }

    /// Constraints that depend on the column are dropped before ALTER COLUMN
    /// and recreated after it.
    fn modify_column(&self, table: &TableRef, old: &Column, new: &Column) -> Result<Vec<String>> {
        ensure_modifiable(self, old, new)?;
        let old = old.normalized();
        let new = new.normalized();
        let name = self.table_name(table);
        let column = self.identifier(&new.name);
        let default_constraint = self.identifier(&Self::default_constraint_name(table, &new.name));
        let unique_constraint = self.identifier(&unique_constraint_name(table, &new.name));

        let new_type = self.map_type(&new)?;
        let altered = self.map_type(&old)? != new_type || old.nullable != new.nullable;
        let old_default = self.default_expression(table, &old);
        let new_default = self.default_expression(table, &new);
        let default_moves = old_default != new_default || altered;
        let was_unique = old.unique && !old.primary_key;
        let is_unique = new.unique && !new.primary_key;
        let unique_moves = was_unique != is_unique || altered;

        let mut statements = Vec::new();
        if old_default.is_some() && default_moves {
            statements.push(format!("ALTER TABLE {name} DROP CONSTRAINT {default_constraint}"));
        }
        if was_unique && unique_moves {
            statements.push(format!("ALTER TABLE {name} DROP CONSTRAINT {unique_constraint}"));
        }
        if altered {
            statements.push(format!(
                "ALTER TABLE {name} ALTER COLUMN {column} {new_type}{}",
                if new.nullable { " NULL" } else { " NOT NULL" }
            ));
        }
        if let Some(default) = new_default.filter(|_| default_moves) {
            statements.push(format!(
                "ALTER TABLE {name} ADD CONSTRAINT {default_constraint} DEFAULT {default} FOR {column}"
            ));
        }
        if is_unique && unique_moves {
            statements.push(format!(
                "ALTER TABLE {name} ADD CONSTRAINT {unique_constraint} UNIQUE ({column})"
            ));
        }
        Ok(statements)
    }

    /// Renames the column and the constraints named after it.
    fn rename_column(&self, table: &TableRef, old: &Column, new: &Column) -> Result<Vec<String>> {
        let mut statements = vec![format!(
            "EXEC sp_rename {}, {}, 'COLUMN'",
            Self::object_path(table, Some(&old.name)),
            string_literal(&new.name)
        )];
        if self.default_expression(table, old).is_some() {
            statements.push(self.rename_constraint(
                table,
                &Self::default_constraint_name(table, &old.name),
                &Self::default_constraint_name(table, &new.name),
            ));
        }
        if old.unique && !old.primary_key {
            statements.push(self.rename_constraint(
                table,
                &unique_constraint_name(table, &old.name),
                &unique_constraint_name(table, &new.name),
            ));
        }
        Ok(statements)
    }

    fn drop_index(&self, table: &TableRef, index: &Index) -> Result<Vec<String>> {
        Ok(vec![format!(
            "DROP INDEX {} ON {}",
            self.identifier(&index.name),
            self.table_name(table)
        )])
    }

    fn rename_index(&self, table: &TableRef, old: &Index, new: &Index) -> Result<Vec<String>> {
        Ok(vec![format!(
            "EXEC sp_rename {}, {}, 'INDEX'",
            Self::object_path(table, Some(&old.name)),
            string_literal(&new.name)
        )])
    }
}
