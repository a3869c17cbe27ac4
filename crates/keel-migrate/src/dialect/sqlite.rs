//! SQLite dialect.
//!
//! SQLite has limited ALTER TABLE support: columns cannot be dropped,
//! renamed or modified and foreign keys cannot be added or dropped once the
//! table exists. Those operations fail with
//! [`MigrateError::UnsupportedOperation`]; rebuilding the table is left to
//! the operator.

use crate::change::ChangeKind;
use crate::error::{MigrateError, Result};
use crate::schema::{Column, ColumnType, ForeignKey, GenerationStrategy, Index, TableRef};

use super::{effective_generation, string_literal, unique_constraint_name, DatabaseType, Dialect};

const REBUILD: &str = "SQLite requires rebuilding the table for this change";

/// SQLite migration dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqliteDialect {
    /// Creates a new SQLite dialect.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn plain_integer_warning(table: &TableRef, column: &Column) -> String {
        format!(
            "Column {table}.{} is created as a plain INTEGER: SQLite only generates values for a lone INTEGER PRIMARY KEY",
            column.name
        )
    }
}

impl Dialect for SqliteDialect {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sqlite
    }

    fn map_type(&self, column: &Column) -> Result<String> {
        column.validate()?;
        Ok(match column.column_type {
            ColumnType::String | ColumnType::Enum => "TEXT",
            ColumnType::Integer | ColumnType::Long | ColumnType::Boolean => "INTEGER",
            ColumnType::Float | ColumnType::Double => "REAL",
            ColumnType::Decimal => "NUMERIC",
            ColumnType::Date | ColumnType::Time | ColumnType::DateTime => "TEXT",
            ColumnType::Binary => "BLOB",
        }
        .to_string())
    }

    fn identity_definition(&self, column: &Column, inline_primary_key: bool) -> Result<String> {
        if inline_primary_key {
            Ok("INTEGER PRIMARY KEY AUTOINCREMENT".to_string())
        } else {
            self.map_type(column)
        }
    }

    fn inlines_primary_key(&self, column: &Column) -> bool {
        column.is_generated()
    }

    fn supports_deferrable(&self) -> bool {
        true
    }

    fn transactional_ddl(&self) -> bool {
        true
    }

    fn change_warnings(&self, change: &ChangeKind) -> Vec<String> {
        let generated = |c: &Column| effective_generation(self, c) != GenerationStrategy::None;
        let mut warnings = Vec::new();
        match change {
            ChangeKind::CreateTable { table } => {
                let reference = table.reference();
                let primary_key = table.primary_key_columns();
                for column in table.columns.iter().filter(|c| generated(c)) {
                    if !(column.primary_key && primary_key.len() == 1) {
                        warnings.push(Self::plain_integer_warning(&reference, column));
                    }
                }
            }
            ChangeKind::AddColumn { table, column } => {
                let column = column.normalized();
                if generated(&column) {
                    warnings.push(Self::plain_integer_warning(table, &column));
                }
                if !column.nullable && column.default_value.is_none() {
                    warnings.push(format!(
                        "Column {table}.{} is added as nullable: SQLite cannot add a NOT NULL column without a default",
                        column.name
                    ));
                }
            }
            _ => {}
        }
        warnings
    }

    fn table_exists_sql(&self, table: &TableRef) -> String {
        format!(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = {}",
            string_literal(&table.name)
        )
    }

    /// SQLite cannot add a `UNIQUE` column, nor a `NOT NULL` one without a
    /// default. Uniqueness moves to a separate unique index and such a
    /// column is added nullable.
    fn add_column(&self, table: &TableRef, column: &Column) -> Result<Vec<String>> {
        let mut column = column.normalized();
        if column.primary_key {
            return Err(MigrateError::unsupported(
                self.name(),
                "ADD COLUMN",
                "a PRIMARY KEY column can only be declared when the table is created",
            ));
        }
        let unique = std::mem::take(&mut column.unique);
        if !column.nullable && column.default_value.is_none() {
            column.nullable = true;
        }

        let mut statements = vec![format!(
            "ALTER TABLE {} {}",
            self.table_name(table),
            self.add_column_clause(&self.column_definition(table, &column)?)
        )];
        if unique {
            let index = Index {
                name: unique_constraint_name(table, &column.name),
                unique: true,
                columns: vec![column.name.clone()],
            };
            statements.extend(self.create_index(table, &index)?);
        }
        Ok(statements)
    }

    fn drop_column(&self, _table: &TableRef, _column: &Column) -> Result<Vec<String>> {
        Err(MigrateError::unsupported(self.name(), "DROP COLUMN", REBUILD))
    }

    fn modify_column(&self, _table: &TableRef, _old: &Column, _new: &Column) -> Result<Vec<String>> {
        Err(MigrateError::unsupported(self.name(), "MODIFY COLUMN", REBUILD))
    }

    fn rename_column(&self, _table: &TableRef, _old: &Column, _new: &Column) -> Result<Vec<String>> {
        Err(MigrateError::unsupported(self.name(), "RENAME COLUMN", REBUILD))
    }

    fn rename_index(&self, table: &TableRef, old: &Index, new: &Index) -> Result<Vec<String>> {
        let mut statements = self.drop_index(table, old)?;
        statements.extend(self.create_index(table, new)?);
        Ok(statements)
    }

    fn add_foreign_key(&self, _table: &TableRef, _fk: &ForeignKey) -> Result<Vec<String>> {
        Err(MigrateError::unsupported(
            self.name(),
            "ADD FOREIGN KEY",
            "foreign keys can only be declared when the table is created",
        ))
    }

    fn drop_foreign_key(&self, _table: &TableRef, _fk: &ForeignKey) -> Result<Vec<String>> {
        Err(MigrateError::unsupported(self.name(), "DROP FOREIGN KEY", REBUILD))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ForeignKeyAction, Table};

    fn dialect() -> SqliteDialect {
        SqliteDialect::new()
    }

    #[test]
    fn test_create_table_inlines_identity_primary_key() {
        let table = Table::new("users")
            .column(Column::new("id", ColumnType::Long).primary_key().identity())
            .column(Column::new("name", ColumnType::String).length(255).not_null());
        let sql = dialect().create_table(&table).unwrap();
        assert_eq!(
            sql,
            vec!["CREATE TABLE users (\n    id INTEGER PRIMARY KEY AUTOINCREMENT,\n    name TEXT NOT NULL\n)"]
        );
    }

    #[test]
    fn test_primary_key_never_gets_not_null() {
        let table = Table::new("memberships")
            .column(Column::new("user_id", ColumnType::Long).primary_key())
            .column(Column::new("group_id", ColumnType::Long).primary_key());
        let sql = dialect().create_table(&table).unwrap();
        assert!(!sql[0].contains("NOT NULL"));
        assert!(sql[0].contains("PRIMARY KEY (user_id, group_id)"));
    }

    #[test]
    fn test_foreign_keys_inline_at_creation() {
        let table = Table::new("posts")
            .column(Column::new("id", ColumnType::Long).primary_key())
            .column(Column::new("user_id", ColumnType::Long).references("users", "id"))
            .foreign_key(
                ForeignKey::new("fk_posts_user", "user_id", "users", "id")
                    .on_delete(ForeignKeyAction::Cascade)
                    .deferrable(false),
            );
        let sql = dialect().create_table(&table).unwrap();
        assert!(sql[0].contains(
            "CONSTRAINT fk_posts_user FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE DEFERRABLE"
        ));
        assert_eq!(sql[0].matches("FOREIGN KEY").count(), 1);
    }

    #[test]
    fn test_unsupported_operations() {
        let d = dialect();
        let table = TableRef::new("users");
        let col = Column::new("email", ColumnType::String);
        let fk = ForeignKey::new("fk", "team_id", "teams", "id");
        let results = [
            d.drop_column(&table, &col),
            d.rename_column(&table, &col, &Column::new("mail", ColumnType::String)),
            d.modify_column(&table, &col, &col.clone().not_null()),
            d.add_foreign_key(&table, &fk),
            d.drop_foreign_key(&table, &fk),
        ];
        for result in results {
            let err = result.unwrap_err();
            assert!(
                matches!(err, MigrateError::UnsupportedOperation { dialect: "sqlite", .. }),
                "{err}"
            );
        }
    }

    #[test]
    fn test_add_unique_not_null_column() {
        let email = Column::new("email", ColumnType::String)
            .length(255)
            .unique()
            .not_null();
        let sql = dialect().add_column(&TableRef::new("users"), &email).unwrap();
        assert_eq!(
            sql,
            vec![
                "ALTER TABLE users ADD COLUMN email TEXT",
                "CREATE UNIQUE INDEX uq_users_email ON users (email)",
            ]
        );

        let flag = Column::new("active", ColumnType::Boolean)
            .not_null()
            .default_value("1");
        let sql = dialect().add_column(&TableRef::new("users"), &flag).unwrap();
        assert_eq!(
            sql,
            vec!["ALTER TABLE users ADD COLUMN active INTEGER DEFAULT 1 NOT NULL"]
        );
    }

    #[test]
    fn test_warns_about_degraded_columns() {
        let d = dialect();
        let users = TableRef::new("users");
        let email = Column::new("email", ColumnType::String).not_null();
        let warnings = d.change_warnings(&ChangeKind::AddColumn {
            table: users.clone(),
            column: email,
        });
        assert_eq!(
            warnings,
            vec!["Column users.email is added as nullable: SQLite cannot add a NOT NULL column without a default"]
        );

        let defaulted = Column::new("active", ColumnType::Boolean)
            .not_null()
            .default_value("1");
        assert!(d
            .change_warnings(&ChangeKind::AddColumn {
                table: users,
                column: defaulted,
            })
            .is_empty());

        let table = Table::new("orders")
            .column(Column::new("id", ColumnType::Long).primary_key().identity())
            .column(Column::new("ticket", ColumnType::Long).identity());
        let warnings = d.change_warnings(&ChangeKind::CreateTable { table });
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("Column orders.ticket is created as a plain INTEGER"));
    }

    #[test]
    fn test_rename_index_recreates() {
        let d = dialect();
        let old = Index::new("idx_old", &["email"]);
        let new = Index::new("idx_new", &["email"]);
        assert_eq!(
            d.rename_index(&TableRef::new("users"), &old, &new).unwrap(),
            vec![
                "DROP INDEX idx_old",
                "CREATE INDEX idx_new ON users (email)",
            ]
        );
    }

    #[test]
    fn test_rename_table() {
        let sql = dialect()
            .rename_table(&TableRef::new("user"), &TableRef::new("users"))
            .unwrap();
        assert_eq!(sql, vec!["ALTER TABLE \"user\" RENAME TO users"]);
    }
}
