//! Oracle dialect.
//!
//! Oracle DDL commits implicitly, so the transaction markers are comments.
//! Unquoted identifiers are folded to upper case by the database, which the
//! catalog queries account for.

use crate::error::Result;
use crate::schema::{Column, ColumnType, ForeignKeyAction, TableRef};

use super::{
    decimal_dimensions, ensure_modifiable, is_plain_identifier, length_or, string_literal,
    unique_constraint_name, DatabaseType, Dialect,
};

/// Longest string stored as `VARCHAR2` before switching to `CLOB`.
const VARCHAR2_LIMIT: i32 = 4000;

/// Longest binary value stored as `RAW`.
const RAW_LIMIT: i32 = 2000;

/// Oracle migration dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct OracleDialect;

impl OracleDialect {
    /// Creates a new Oracle dialect.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Catalog spelling of an identifier.
    fn catalog_name(name: &str) -> String {
        if is_plain_identifier(name) {
            name.to_ascii_uppercase()
        } else {
            name.to_string()
        }
    }

    fn unique_constraint(&self, table: &TableRef, column: &str) -> String {
        self.identifier(&unique_constraint_name(table, column))
    }
}

impl Dialect for OracleDialect {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Oracle
    }

    fn map_type(&self, column: &Column) -> Result<String> {
        column.validate()?;
        Ok(match column.column_type {
            ColumnType::String => {
                let length = length_or(column, 255);
                if length > VARCHAR2_LIMIT {
                    "CLOB".to_string()
                } else {
                    format!("VARCHAR2({length})")
                }
            }
            ColumnType::Integer => "NUMBER(10)".to_string(),
            ColumnType::Long => "NUMBER(19)".to_string(),
            ColumnType::Boolean => "NUMBER(1)".to_string(),
            ColumnType::Float => "BINARY_FLOAT".to_string(),
            ColumnType::Double => "BINARY_DOUBLE".to_string(),
            ColumnType::Decimal => {
                let (precision, scale) = decimal_dimensions(column);
                format!("NUMBER({precision},{scale})")
            }
            ColumnType::Date => "DATE".to_string(),
            ColumnType::Time | ColumnType::DateTime => "TIMESTAMP".to_string(),
            ColumnType::Binary => match column.length {
                Some(n) if n <= RAW_LIMIT => format!("RAW({n})"),
                _ => "BLOB".to_string(),
            },
            ColumnType::Enum => format!("VARCHAR2({})", length_or(column, 255)),
        })
    }

    fn identity_definition(&self, column: &Column, _inline_primary_key: bool) -> Result<String> {
        Ok(format!("{} GENERATED ALWAYS AS IDENTITY", self.map_type(column)?))
    }

    fn supports_sequences(&self) -> bool {
        true
    }

    fn next_value(&self, sequence: &str) -> String {
        format!("{sequence}.NEXTVAL")
    }

    fn supports_comment_on(&self) -> bool {
        true
    }

    fn on_delete_action(&self, action: ForeignKeyAction) -> Option<&'static str> {
        match action {
            ForeignKeyAction::Cascade | ForeignKeyAction::SetNull => Some(action.to_sql()),
            _ => None,
        }
    }

    fn on_update_action(&self, _action: ForeignKeyAction) -> Option<&'static str> {
        None
    }

    fn supports_deferrable(&self) -> bool {
        true
    }

    fn begin_transaction(&self) -> &'static str {
        "-- Oracle DDL commits implicitly; no transaction is opened"
    }

    fn commit_transaction(&self) -> &'static str {
        "-- end of migration"
    }

    fn placeholder(&self, n: usize) -> String {
        format!(":{n}")
    }

    fn table_exists_sql(&self, table: &TableRef) -> String {
        let name = string_literal(&Self::catalog_name(&table.name));
        match &table.schema {
            Some(schema) => format!(
                "SELECT COUNT(*) FROM all_tables WHERE owner = {} AND table_name = {name}",
                string_literal(&Self::catalog_name(schema))
            ),
            None => format!("SELECT COUNT(*) FROM user_tables WHERE table_name = {name}"),
        }
    }

    fn add_column_clause(&self, definition: &str) -> String {
        format!("ADD ({definition})")
    }

    fn unique_clause(&self, table: &TableRef, column: &Column) -> String {
        format!("CONSTRAINT {} UNIQUE", self.unique_constraint(table, &column.name))
    }

    fn modify_column(&self, table: &TableRef, old: &Column, new: &Column) -> Result<Vec<String>> {
        ensure_modifiable(self, old, new)?;
        let old = old.normalized();
        let new = new.normalized();
        let name = self.table_name(table);
        let column = self.identifier(&new.name);
        let mut statements = Vec::new();

        let mut clause = format!("{column} {}", self.map_type(&new)?);
        if old.default_value != new.default_value {
            clause.push_str(" DEFAULT ");
            clause.push_str(new.default_value.as_deref().unwrap_or("NULL"));
        }
        if old.nullable != new.nullable {
            clause.push_str(if new.nullable { " NULL" } else { " NOT NULL" });
        }
        statements.push(format!("ALTER TABLE {name} MODIFY ({clause})"));

        if old.unique != new.unique && !new.primary_key {
            let constraint = self.unique_constraint(table, &new.name);
            statements.push(if new.unique {
                format!("ALTER TABLE {name} ADD CONSTRAINT {constraint} UNIQUE ({column})")
            } else {
                format!("ALTER TABLE {name} DROP CONSTRAINT {constraint}")
            });
        }
        if old.comment != new.comment {
            statements.push(format!(
                "COMMENT ON COLUMN {name}.{column} IS {}",
                string_literal(new.comment.as_deref().unwrap_or_default())
            ));
        }
        Ok(statements)
    }

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
                self.unique_constraint(table, &old.name),
                self.unique_constraint(table, &new.name)
            ));
        }
        Ok(statements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ForeignKey, Table};

    fn dialect() -> OracleDialect {
        OracleDialect::new()
    }

    #[test]
    fn test_type_names() {
        let d = dialect();
        assert_eq!(
            d.map_type(&Column::new("s", ColumnType::String).length(4000))
                .unwrap(),
            "VARCHAR2(4000)"
        );
        assert_eq!(
            d.map_type(&Column::new("s", ColumnType::String).length(4001))
                .unwrap(),
            "CLOB"
        );
        assert_eq!(
            d.map_type(&Column::new("b", ColumnType::Boolean)).unwrap(),
            "NUMBER(1)"
        );
        assert_eq!(
            d.map_type(&Column::new("r", ColumnType::Binary).length(16))
                .unwrap(),
            "RAW(16)"
        );
    }

    #[test]
    fn test_identity_and_sequence() {
        let d = dialect();
        let table = TableRef::new("users");
        let identity = Column::new("id", ColumnType::Long).primary_key().identity();
        assert_eq!(
            d.column_definition(&table, &identity).unwrap(),
            "id NUMBER(19) GENERATED ALWAYS AS IDENTITY"
        );

        let seq = Column::new("ref_no", ColumnType::Long).sequence(Some("ref_seq"));
        let sql = d.add_column(&table, &seq).unwrap();
        assert_eq!(
            sql,
            vec![
                "CREATE SEQUENCE ref_seq START WITH 1 INCREMENT BY 1",
                "ALTER TABLE users ADD (ref_no NUMBER(19) DEFAULT ref_seq.NEXTVAL)",
            ]
        );
    }

    #[test]
    fn test_modify_only_states_changed_nullability() {
        let d = dialect();
        let table = TableRef::new("users");
        let old = Column::new("name", ColumnType::String).length(100).not_null();
        let wider = Column::new("name", ColumnType::String).length(200).not_null();
        assert_eq!(
            d.modify_column(&table, &old, &wider).unwrap(),
            vec!["ALTER TABLE users MODIFY (name VARCHAR2(200))"]
        );

        let relaxed = Column::new("name", ColumnType::String).length(100);
        assert_eq!(
            d.modify_column(&table, &old, &relaxed).unwrap(),
            vec!["ALTER TABLE users MODIFY (name VARCHAR2(100) NULL)"]
        );
    }

    #[test]
    fn test_unique_constraint_is_named_where_it_is_created() {
        let d = dialect();
        let table = TableRef::new("users");
        let email = Column::new("email", ColumnType::String).unique();
        assert_eq!(
            d.add_column(&table, &email).unwrap(),
            vec!["ALTER TABLE users ADD (email VARCHAR2(255) CONSTRAINT uq_users_email UNIQUE)"]
        );

        let plain = Column::new("email", ColumnType::String);
        assert_eq!(
            d.modify_column(&table, &email, &plain).unwrap(),
            vec![
                "ALTER TABLE users MODIFY (email VARCHAR2(255))",
                "ALTER TABLE users DROP CONSTRAINT uq_users_email",
            ]
        );

        let renamed = Column::new("mail", ColumnType::String).unique();
        assert_eq!(
            d.rename_column(&table, &email, &renamed).unwrap(),
            vec![
                "ALTER TABLE users RENAME COLUMN email TO mail",
                "ALTER TABLE users RENAME CONSTRAINT uq_users_email TO uq_users_mail",
            ]
        );
    }

    #[test]
    fn test_foreign_key_actions_are_restricted() {
        let fk = ForeignKey::new("fk_posts_user", "user_id", "users", "id")
            .on_delete(ForeignKeyAction::Restrict)
            .on_update(ForeignKeyAction::Cascade);
        let sql = dialect()
            .add_foreign_key(&TableRef::new("posts"), &fk)
            .unwrap();
        assert_eq!(
            sql[0],
            "ALTER TABLE posts ADD CONSTRAINT fk_posts_user FOREIGN KEY (user_id) REFERENCES users (id)"
        );

        let cascade = fk.clone().on_delete(ForeignKeyAction::Cascade);
        let sql = dialect()
            .add_foreign_key(&TableRef::new("posts"), &cascade)
            .unwrap();
        assert!(sql[0].ends_with("ON DELETE CASCADE"));
    }

    #[test]
    fn test_catalog_query_folds_case() {
        let d = dialect();
        assert_eq!(
            d.table_exists_sql(&TableRef::new("schema_history")),
            "SELECT COUNT(*) FROM user_tables WHERE table_name = 'SCHEMA_HISTORY'"
        );
        assert!(d
            .table_exists_sql(&TableRef::new("MixedCase"))
            .ends_with("table_name = 'MixedCase'"));
    }

    #[test]
    fn test_transaction_markers_are_comments() {
        let d = dialect();
        assert!(d.begin_transaction().starts_with("--"));
        assert!(d.commit_transaction().starts_with("--"));
    }

    #[test]
    fn test_comment_on() {
        let table = Table::new("users")
            .column(Column::new("id", ColumnType::Long).primary_key())
            .comment("people");
        let sql = dialect().create_table(&table).unwrap();
        assert_eq!(sql[1], "COMMENT ON TABLE users IS 'people'");
    }
}
