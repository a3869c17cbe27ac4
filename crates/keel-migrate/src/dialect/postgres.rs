//! PostgreSQL dialect.

use crate::error::Result;
use crate::schema::{Column, ColumnType, TableRef};

use super::{
    decimal_dimensions, ensure_modifiable, length_or, string_literal, DatabaseType, Dialect,
    LockStrategy,
};

/// Longest string stored as `VARCHAR` before switching to `TEXT`.
const VARCHAR_LIMIT: i32 = 255;

/// PostgreSQL migration dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    /// Creates a new PostgreSQL dialect.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Name PostgreSQL gives an inline `UNIQUE` constraint.
    fn unique_constraint(table: &TableRef, column: &str) -> String {
        format!("{}_{}_key", table.name, column)
    }
}

impl Dialect for PostgresDialect {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    fn map_type(&self, column: &Column) -> Result<String> {
        column.validate()?;
        Ok(match column.column_type {
            ColumnType::String => {
                let length = length_or(column, VARCHAR_LIMIT);
                if length > VARCHAR_LIMIT {
                    "TEXT".to_string()
                } else {
                    format!("VARCHAR({length})")
                }
            }
            ColumnType::Integer => "INTEGER".to_string(),
            ColumnType::Long => "BIGINT".to_string(),
            ColumnType::Boolean => "BOOLEAN".to_string(),
            ColumnType::Float => "REAL".to_string(),
            ColumnType::Double => "DOUBLE PRECISION".to_string(),
            ColumnType::Decimal => {
                let (precision, scale) = decimal_dimensions(column);
                format!("NUMERIC({precision},{scale})")
            }
            ColumnType::Date => "DATE".to_string(),
            ColumnType::Time => "TIME".to_string(),
            ColumnType::DateTime => "TIMESTAMP".to_string(),
            ColumnType::Binary => "BYTEA".to_string(),
            ColumnType::Enum => format!("VARCHAR({})", length_or(column, VARCHAR_LIMIT)),
        })
    }

    fn identity_definition(&self, column: &Column, _inline_primary_key: bool) -> Result<String> {
        Ok(match column.column_type {
            ColumnType::Integer => "SERIAL".to_string(),
            ColumnType::Long => "BIGSERIAL".to_string(),
            _ => format!("{} GENERATED BY DEFAULT AS IDENTITY", self.map_type(column)?),
        })
    }

    fn supports_sequences(&self) -> bool {
        true
    }

    fn next_value(&self, sequence: &str) -> String {
        format!("nextval({})", string_literal(sequence))
    }

    fn supports_comment_on(&self) -> bool {
        true
    }

    fn supports_deferrable(&self) -> bool {
        true
    }

    fn transactional_ddl(&self) -> bool {
        true
    }

    fn begin_transaction(&self) -> &'static str {
        "BEGIN"
    }

    fn placeholder(&self, n: usize) -> String {
        format!("${n}")
    }

    fn table_exists_sql(&self, table: &TableRef) -> String {
        let schema = match &table.schema {
            Some(schema) => string_literal(schema),
            None => "current_schema()".to_string(),
        };
        format!(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = {schema} AND table_name = {}",
            string_literal(&table.name)
        )
    }

    fn lock_strategy(&self, key: &str) -> LockStrategy {
        let key = string_literal(key);
        LockStrategy::Advisory {
            acquire: format!(
                "SELECT CAST(CASE WHEN pg_try_advisory_lock(hashtext({key})) THEN 1 ELSE 0 END AS BIGINT)"
            ),
            release: format!(
                "SELECT CAST(CASE WHEN pg_advisory_unlock(hashtext({key})) THEN 1 ELSE 0 END AS BIGINT)"
            ),
        }
    }

    fn modify_column(&self, table: &TableRef, old: &Column, new: &Column) -> Result<Vec<String>> {
        ensure_modifiable(self, old, new)?;
        let old = old.normalized();
        let new = new.normalized();
        let name = self.table_name(table);
        let column = self.identifier(&new.name);
        let mut statements = Vec::new();

        let new_type = self.map_type(&new)?;
        if self.map_type(&old)? != new_type {
            statements.push(format!(
                "ALTER TABLE {name} ALTER COLUMN {column} TYPE {new_type}"
            ));
        }
        if old.nullable != new.nullable && !new.primary_key {
            let action = if new.nullable { "DROP" } else { "SET" };
            statements.push(format!(
                "ALTER TABLE {name} ALTER COLUMN {column} {action} NOT NULL"
            ));
        }
        if old.default_value != new.default_value {
            statements.push(match &new.default_value {
                Some(default) => {
                    format!("ALTER TABLE {name} ALTER COLUMN {column} SET DEFAULT {default}")
                }
                None => format!("ALTER TABLE {name} ALTER COLUMN {column} DROP DEFAULT"),
            });
        }
        if old.unique != new.unique && !new.primary_key {
            let constraint = self.identifier(&Self::unique_constraint(table, &new.name));
            statements.push(if new.unique {
                format!("ALTER TABLE {name} ADD CONSTRAINT {constraint} UNIQUE ({column})")
            } else {
                format!("ALTER TABLE {name} DROP CONSTRAINT {constraint}")
            });
        }
        if old.comment != new.comment {
            statements.push(format!(
                "COMMENT ON COLUMN {name}.{column} IS {}",
                new.comment
                    .as_deref()
                    .map_or_else(|| "NULL".to_string(), string_literal)
            ));
        }
        Ok(statements)
    }

    /// The inline unique constraint keeps its name across a column rename,
    /// so it is renamed along with the column.
    fn rename_column(&self, table: &TableRef, old: &Column, new: &Column) -> Result<Vec<String>> {
        let name = self.table_name(table);
        let mut statements = vec![format!(
            "ALTER TABLE {name} RENAME COLUMN {} TO {}",
            self.identifier(&old.name),
            self.identifier(&new.name)
        )];
        if old.unique && !old.primary_key {
            statements.push(format!(
                "ALTER TABLE {name} RENAME CONSTRAINT {} TO {}",
                self.identifier(&Self::unique_constraint(table, &old.name)),
                self.identifier(&Self::unique_constraint(table, &new.name))
            ));
        }
        Ok(statements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ForeignKey, ForeignKeyAction, Index, Table};

    fn dialect() -> PostgresDialect {
        PostgresDialect::new()
    }

    #[test]
    fn test_identity_uses_serial_types() {
        let d = dialect();
        let long = Column::new("id", ColumnType::Long).primary_key().identity();
        let int = Column::new("id", ColumnType::Integer).primary_key().identity();
        let table = TableRef::new("users");
        assert_eq!(d.column_definition(&table, &long).unwrap(), "id BIGSERIAL");
        assert_eq!(d.column_definition(&table, &int).unwrap(), "id SERIAL");
    }

    #[test]
    fn test_create_table_with_index_and_comment() {
        let table = Table::new("users")
            .column(Column::new("id", ColumnType::Long).primary_key().identity())
            .column(
                Column::new("email", ColumnType::String)
                    .length(255)
                    .not_null()
                    .comment("login"),
            )
            .index(Index::new("idx_users_email", &["email"]).unique())
            .comment("accounts");
        let sql = dialect().create_table(&table).unwrap();
        assert_eq!(
            sql,
            vec![
                "CREATE TABLE users (\n    id BIGSERIAL,\n    email VARCHAR(255) NOT NULL,\n    PRIMARY KEY (id)\n)"
                    .to_string(),
                "CREATE UNIQUE INDEX idx_users_email ON users (email)".to_string(),
                "COMMENT ON TABLE users IS 'accounts'".to_string(),
                "COMMENT ON COLUMN users.email IS 'login'".to_string(),
            ]
        );
    }

    #[test]
    fn test_type_names() {
        let d = dialect();
        assert_eq!(
            d.map_type(&Column::new("bio", ColumnType::String).length(1000))
                .unwrap(),
            "TEXT"
        );
        assert_eq!(
            d.map_type(&Column::new("n", ColumnType::String)).unwrap(),
            "VARCHAR(255)"
        );
        assert_eq!(
            d.map_type(&Column::new("d", ColumnType::Double)).unwrap(),
            "DOUBLE PRECISION"
        );
        assert_eq!(
            d.map_type(&Column::new("b", ColumnType::Binary)).unwrap(),
            "BYTEA"
        );
        assert_eq!(
            d.map_type(&Column::new("p", ColumnType::Decimal).precision(12, 3))
                .unwrap(),
            "NUMERIC(12,3)"
        );
    }

    #[test]
    fn test_sequence_column() {
        let table = Table::new("orders").column(
            Column::new("id", ColumnType::Long)
                .primary_key()
                .sequence(None),
        );
        let d = dialect();
        let sql = d.create_table(&table).unwrap();
        assert_eq!(sql[0], "CREATE SEQUENCE orders_id_seq START WITH 1 INCREMENT BY 1");
        assert!(sql[1].contains("id BIGINT DEFAULT nextval('orders_id_seq')"));

        let drop = d.drop_table(&table).unwrap();
        assert_eq!(drop, vec!["DROP TABLE orders", "DROP SEQUENCE orders_id_seq"]);
    }

    #[test]
    fn test_modify_column_emits_one_statement_per_change() {
        let old = Column::new("name", ColumnType::String).length(100);
        let new = Column::new("name", ColumnType::String)
            .length(200)
            .not_null()
            .unique()
            .default_value("''");
        let sql = dialect()
            .modify_column(&TableRef::new("users"), &old, &new)
            .unwrap();
        assert_eq!(
            sql,
            vec![
                "ALTER TABLE users ALTER COLUMN name TYPE VARCHAR(200)",
                "ALTER TABLE users ALTER COLUMN name SET NOT NULL",
                "ALTER TABLE users ALTER COLUMN name SET DEFAULT ''",
                "ALTER TABLE users ADD CONSTRAINT users_name_key UNIQUE (name)",
            ]
        );
    }

    #[test]
    fn test_modify_can_render_nothing() {
        let old = Column::new("bio", ColumnType::String).length(1000);
        let new = Column::new("bio", ColumnType::String).length(2000);
        let sql = dialect()
            .modify_column(&TableRef::new("users"), &old, &new)
            .unwrap();
        assert!(sql.is_empty());
    }

    #[test]
    fn test_rename_unique_column_renames_constraint() {
        let old = Column::new("mail", ColumnType::String).unique();
        let new = Column::new("email", ColumnType::String).unique();
        let sql = dialect()
            .rename_column(&TableRef::new("users"), &old, &new)
            .unwrap();
        assert_eq!(
            sql,
            vec![
                "ALTER TABLE users RENAME COLUMN mail TO email",
                "ALTER TABLE users RENAME CONSTRAINT users_mail_key TO users_email_key",
            ]
        );
    }

    #[test]
    fn test_deferrable_foreign_key() {
        let fk = ForeignKey::new("fk_posts_user", "user_id", "users", "id")
            .on_delete(ForeignKeyAction::SetNull)
            .on_update(ForeignKeyAction::Cascade)
            .deferrable(true);
        let sql = dialect()
            .add_foreign_key(&TableRef::new("posts"), &fk)
            .unwrap();
        assert_eq!(
            sql[0],
            "ALTER TABLE posts ADD CONSTRAINT fk_posts_user FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE SET NULL ON UPDATE CASCADE DEFERRABLE INITIALLY DEFERRED"
        );
    }

    #[test]
    fn test_schema_qualified_names() {
        let d = dialect();
        let table = TableRef {
            name: "users".into(),
            schema: Some("app".into()),
        };
        let index = Index::new("idx_a", &["a"]);
        assert_eq!(d.drop_index(&table, &index).unwrap(), vec!["DROP INDEX app.idx_a"]);
        assert_eq!(
            d.rename_table(&table, &TableRef::new("accounts")).unwrap(),
            vec!["ALTER TABLE app.users RENAME TO accounts"]
        );
        assert!(d.table_exists_sql(&table).contains("table_schema = 'app'"));
    }

    #[test]
    fn test_placeholders_and_markers() {
        let d = dialect();
        assert_eq!(d.placeholder(3), "$3");
        assert_eq!(d.begin_transaction(), "BEGIN");
        assert_eq!(d.commit_transaction(), "COMMIT");
    }
}
