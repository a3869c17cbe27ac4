//! MySQL / MariaDB dialect.

use crate::error::Result;
use crate::schema::{Column, ColumnType, ForeignKey, Index, Table, TableRef};

use super::{
    decimal_dimensions, ensure_modifiable, length_or, string_literal, DatabaseType, Dialect,
    LockStrategy,
};

/// Longest string stored as `VARCHAR` before switching to `TEXT`.
const VARCHAR_LIMIT: i32 = 255;

/// MySQL migration dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl MySqlDialect {
    /// Creates a new MySQL dialect.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// MODIFY/CHANGE definition without the inline `UNIQUE`, which would add
    /// a second unique index on every run.
    fn altered_definition(&self, table: &TableRef, column: &Column) -> Result<String> {
        let column = Column {
            unique: false,
            ..column.clone()
        };
        self.column_definition(table, &column)
    }

    /// Index statements moving the column's unique index from `old` to `new`.
    ///
    /// An inline `UNIQUE` creates an index named after the column.
    fn unique_index_changes(&self, table: &TableRef, old: &Column, new: &Column) -> Vec<String> {
        let name = self.table_name(table);
        let was_unique = old.unique && !old.primary_key;
        let is_unique = new.unique && !new.primary_key;
        let mut statements = Vec::new();
        match (was_unique, is_unique) {
            (true, true) if old.name != new.name => statements.push(format!(
                "ALTER TABLE {name} RENAME INDEX {} TO {}",
                self.identifier(&old.name),
                self.identifier(&new.name)
            )),
            (true, false) => statements.push(format!(
                "ALTER TABLE {name} DROP INDEX {}",
                self.identifier(&old.name)
            )),
            (false, true) => statements.push(format!(
                "ALTER TABLE {name} ADD UNIQUE INDEX {} ({})",
                self.identifier(&new.name),
                self.identifier(&new.name)
            )),
            _ => {}
        }
        statements
    }
}

impl Dialect for MySqlDialect {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySql
    }

    fn quote_chars(&self) -> (char, char) {
        ('`', '`')
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
            ColumnType::Integer => "INT".to_string(),
            ColumnType::Long => "BIGINT".to_string(),
            ColumnType::Boolean => "BOOLEAN".to_string(),
            ColumnType::Float => "FLOAT".to_string(),
            ColumnType::Double => "DOUBLE".to_string(),
            ColumnType::Decimal => {
                let (precision, scale) = decimal_dimensions(column);
                format!("DECIMAL({precision},{scale})")
            }
            ColumnType::Date => "DATE".to_string(),
            ColumnType::Time => "TIME".to_string(),
            ColumnType::DateTime => "DATETIME".to_string(),
            ColumnType::Binary => match column.length {
                Some(n) if n <= VARCHAR_LIMIT => format!("VARBINARY({n})"),
                _ => "BLOB".to_string(),
            },
            ColumnType::Enum => format!("VARCHAR({})", length_or(column, VARCHAR_LIMIT)),
        })
    }

    fn identity_definition(&self, column: &Column, _inline_primary_key: bool) -> Result<String> {
        Ok(format!("{} AUTO_INCREMENT", self.map_type(column)?))
    }

    fn inline_comment(&self, comment: &str) -> Option<String> {
        Some(format!("COMMENT {}", string_literal(comment)))
    }

    fn table_options(&self, table: &Table) -> String {
        match &table.comment {
            Some(comment) => format!(" COMMENT={}", string_literal(comment)),
            None => String::new(),
        }
    }

    fn begin_transaction(&self) -> &'static str {
        "START TRANSACTION"
    }

    fn table_exists_sql(&self, table: &TableRef) -> String {
        let schema = match &table.schema {
            Some(schema) => string_literal(schema),
            None => "DATABASE()".to_string(),
        };
        format!(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = {schema} AND table_name = {}",
            string_literal(&table.name)
        )
    }

    fn lock_strategy(&self, key: &str) -> LockStrategy {
        let key = string_literal(key);
        LockStrategy::Advisory {
            acquire: format!("SELECT CAST(COALESCE(GET_LOCK({key}, 0), 0) AS SIGNED)"),
            release: format!("SELECT CAST(COALESCE(RELEASE_LOCK({key}), 0) AS SIGNED)"),
        }
    }

    fn rename_table(&self, from: &TableRef, to: &TableRef) -> Result<Vec<String>> {
        Ok(vec![format!(
            "RENAME TABLE {} TO {}",
            self.table_name(from),
            self.table_name(to)
        )])
    }

    fn modify_column(&self, table: &TableRef, old: &Column, new: &Column) -> Result<Vec<String>> {
        ensure_modifiable(self, old, new)?;
        let mut statements = vec![format!(
            "ALTER TABLE {} MODIFY COLUMN {}",
            self.table_name(table),
            self.altered_definition(table, new)?
        )];
        statements.extend(self.unique_index_changes(table, old, new));
        Ok(statements)
    }

    fn rename_column(&self, table: &TableRef, old: &Column, new: &Column) -> Result<Vec<String>> {
        let mut statements = vec![format!(
            "ALTER TABLE {} CHANGE COLUMN {} {}",
            self.table_name(table),
            self.identifier(&old.name),
            self.altered_definition(table, new)?
        )];
        statements.extend(self.unique_index_changes(table, old, new));
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
            "ALTER TABLE {} RENAME INDEX {} TO {}",
            self.table_name(table),
            self.identifier(&old.name),
            self.identifier(&new.name)
        )])
    }

    fn drop_foreign_key(&self, table: &TableRef, fk: &ForeignKey) -> Result<Vec<String>> {
        Ok(vec![format!(
            "ALTER TABLE {} DROP FOREIGN KEY {}",
            self.table_name(table),
            self.identifier(&fk.name)
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ForeignKeyAction;

    fn dialect() -> MySqlDialect {
        MySqlDialect::new()
    }

    fn users() -> Table {
        Table::new("users")
            .column(Column::new("id", ColumnType::Long).primary_key().identity())
            .column(Column::new("name", ColumnType::String).length(255))
    }

    #[test]
    fn test_create_table_with_identity() {
        let sql = dialect().create_table(&users()).unwrap();
        assert_eq!(sql.len(), 1);
        assert_eq!(
            sql[0],
            "CREATE TABLE users (\n    id BIGINT AUTO_INCREMENT,\n    name VARCHAR(255),\n    PRIMARY KEY (id)\n)"
        );
    }

    #[test]
    fn test_type_names() {
        let d = dialect();
        let long_text = Column::new("bio", ColumnType::String).length(256);
        assert_eq!(d.map_type(&long_text).unwrap(), "TEXT");
        let short = Column::new("code", ColumnType::String).length(10);
        assert_eq!(d.map_type(&short).unwrap(), "VARCHAR(10)");
        assert_eq!(
            d.map_type(&Column::new("active", ColumnType::Boolean)).unwrap(),
            "BOOLEAN"
        );
        assert_eq!(
            d.map_type(&Column::new("price", ColumnType::Decimal)).unwrap(),
            "DECIMAL(19,2)"
        );
        assert_eq!(
            d.map_type(&Column::new("status", ColumnType::Enum).length(20))
                .unwrap(),
            "VARCHAR(20)"
        );
    }

    #[test]
    fn test_add_email_column() {
        let email = Column::new("email", ColumnType::String)
            .length(255)
            .unique()
            .not_null();
        let sql = dialect().add_column(&TableRef::new("users"), &email).unwrap();
        assert_eq!(
            sql,
            vec!["ALTER TABLE users ADD COLUMN email VARCHAR(255) NOT NULL UNIQUE"]
        );
        let down = dialect().drop_column(&TableRef::new("users"), &email).unwrap();
        assert_eq!(down, vec!["ALTER TABLE users DROP COLUMN email"]);
    }

    #[test]
    fn test_reserved_names_are_quoted() {
        let table = Table::new("user").column(Column::new("order", ColumnType::Integer));
        let sql = dialect().create_table(&table).unwrap();
        assert!(sql[0].starts_with("CREATE TABLE `user` ("));
        assert!(sql[0].contains("`order` INT"));
    }

    #[test]
    fn test_rename_statements() {
        let d = dialect();
        let table = TableRef::new("users");
        assert_eq!(
            d.rename_table(&TableRef::new("user"), &table).unwrap(),
            vec!["RENAME TABLE `user` TO users"]
        );

        let old = Column::new("firstname", ColumnType::String).length(100);
        let new = Column::new("first_name", ColumnType::String).length(100);
        assert_eq!(
            d.rename_column(&table, &old, &new).unwrap(),
            vec!["ALTER TABLE users CHANGE COLUMN firstname first_name VARCHAR(100)"]
        );

        let a = Index::new("idx_a", &["email"]);
        let b = Index::new("idx_b", &["email"]);
        assert_eq!(
            d.rename_index(&table, &a, &b).unwrap(),
            vec!["ALTER TABLE users RENAME INDEX idx_a TO idx_b"]
        );
        assert_eq!(
            d.drop_index(&table, &a).unwrap(),
            vec!["DROP INDEX idx_a ON users"]
        );
    }

    #[test]
    fn test_foreign_keys() {
        let d = dialect();
        let fk = ForeignKey::new("fk_posts_user", "user_id", "users", "id")
            .on_delete(ForeignKeyAction::Cascade)
            .deferrable(true);
        let add = d.add_foreign_key(&TableRef::new("posts"), &fk).unwrap();
        assert_eq!(
            add[0],
            "ALTER TABLE posts ADD CONSTRAINT fk_posts_user FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE"
        );
        let drop = d.drop_foreign_key(&TableRef::new("posts"), &fk).unwrap();
        assert_eq!(drop[0], "ALTER TABLE posts DROP FOREIGN KEY fk_posts_user");
    }

    #[test]
    fn test_comments_are_inline() {
        let table = Table::new("users")
            .column(Column::new("id", ColumnType::Long).primary_key().comment("it's the key"))
            .comment("people");
        let sql = dialect().create_table(&table).unwrap();
        assert_eq!(sql.len(), 1);
        assert!(sql[0].contains("id BIGINT COMMENT 'it''s the key'"));
        assert!(sql[0].ends_with(") COMMENT='people'"));
    }

    #[test]
    fn test_modify_column() {
        let old = Column::new("name", ColumnType::String).length(100);
        let new = Column::new("name", ColumnType::String).length(200).not_null();
        let sql = dialect()
            .modify_column(&TableRef::new("users"), &old, &new)
            .unwrap();
        assert_eq!(
            sql,
            vec!["ALTER TABLE users MODIFY COLUMN name VARCHAR(200) NOT NULL"]
        );
    }

    #[test]
    fn test_modify_unique_column_keeps_one_index() {
        let d = dialect();
        let table = TableRef::new("users");
        let old = Column::new("email", ColumnType::String).unique();
        let required = old.clone().not_null();
        assert_eq!(
            d.modify_column(&table, &old, &required).unwrap(),
            vec!["ALTER TABLE users MODIFY COLUMN email VARCHAR(255) NOT NULL"]
        );

        let plain = Column::new("email", ColumnType::String);
        assert_eq!(
            d.modify_column(&table, &old, &plain).unwrap(),
            vec![
                "ALTER TABLE users MODIFY COLUMN email VARCHAR(255)",
                "ALTER TABLE users DROP INDEX email",
            ]
        );
        assert_eq!(
            d.modify_column(&table, &plain, &old).unwrap(),
            vec![
                "ALTER TABLE users MODIFY COLUMN email VARCHAR(255)",
                "ALTER TABLE users ADD UNIQUE INDEX email (email)",
            ]
        );
    }

    #[test]
    fn test_rename_unique_column_renames_index() {
        let old = Column::new("mail", ColumnType::String).unique();
        let new = Column::new("email", ColumnType::String).unique();
        assert_eq!(
            dialect()
                .rename_column(&TableRef::new("users"), &old, &new)
                .unwrap(),
            vec![
                "ALTER TABLE users CHANGE COLUMN mail email VARCHAR(255)",
                "ALTER TABLE users RENAME INDEX mail TO email",
            ]
        );
    }

    #[test]
    fn test_sequence_falls_back_to_identity() {
        let column = Column::new("id", ColumnType::Long).primary_key().sequence(None);
        let table = Table::new("orders").column(column);
        let sql = dialect().create_table(&table).unwrap();
        assert_eq!(sql.len(), 1);
        assert!(sql[0].contains("id BIGINT AUTO_INCREMENT"));
    }

    #[test]
    fn test_advisory_lock() {
        match dialect().lock_strategy("keel") {
            LockStrategy::Advisory { acquire, release } => {
                assert!(acquire.contains("GET_LOCK('keel', 0)"));
                assert!(release.contains("RELEASE_LOCK('keel')"));
            }
            LockStrategy::Table => panic!("expected advisory lock"),
        }
    }
}
