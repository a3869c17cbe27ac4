//! Differ -> generator -> files -> executor, end to end.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use tempfile::TempDir;

use keel_migrate::prelude::*;

fn users_v1() -> Schema {
    Schema::new("app").table(
        Table::new("users")
            .column(Column::new("id", ColumnType::Long).primary_key().identity())
            .column(Column::new("name", ColumnType::String).length(100).not_null()),
    )
}

fn users_with_email() -> Schema {
    Schema::new("app").table(
        Table::new("users")
            .column(Column::new("id", ColumnType::Long).primary_key().identity())
            .column(Column::new("name", ColumnType::String).length(100).not_null())
            .column(
                Column::new("email", ColumnType::String)
                    .length(255)
                    .unique()
                    .not_null(),
            ),
    )
}

async fn memory_pool() -> AnyPool {
    sqlx::any::install_default_drivers();
    AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}

async fn index_count(pool: &AnyPool) -> i64 {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'idx_users_name'",
    )
    .fetch_one(pool)
    .await
    .unwrap()
}

#[test]
fn identical_schemas_produce_no_migration() {
    let changes = SchemaDiffer::new()
        .compare(&users_v1(), &users_v1())
        .unwrap();
    assert!(changes.is_empty());

    let generator = MigrationGenerator::new(Arc::new(PostgresDialect::new()));
    assert!(generator.generate(&changes, "").unwrap().is_none());
}

#[test]
fn add_email_column_on_mysql() {
    let changes = SchemaDiffer::new()
        .compare(&users_v1(), &users_with_email())
        .unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].change_type(), ChangeType::AddColumn);
    assert_eq!(changes[0].risk, RiskLevel::Low);

    let script = MigrationGenerator::new(Arc::new(MySqlDialect::new()))
        .generate(&changes, "add email")
        .unwrap()
        .unwrap();
    let up: Vec<&str> = script.executable_up().collect();
    assert_eq!(
        up,
        vec!["ALTER TABLE users ADD COLUMN email VARCHAR(255) NOT NULL UNIQUE"]
    );
    let down: Vec<&str> = script.executable_down().collect();
    assert_eq!(down, vec!["ALTER TABLE users DROP COLUMN email"]);
    assert_eq!(script.up.first().map(String::as_str), Some("START TRANSACTION"));
    assert_eq!(script.up.last().map(String::as_str), Some("COMMIT"));
    assert!(script.file_name().ends_with("__add_email.sql"));
}

#[test]
fn add_email_column_on_sqlite() {
    let changes = SchemaDiffer::new()
        .compare(&users_v1(), &users_with_email())
        .unwrap();
    let script = MigrationGenerator::new(Arc::new(SqliteDialect::new()))
        .generate(&changes, "add email")
        .unwrap()
        .unwrap();
    let up: Vec<&str> = script.executable_up().collect();
    assert_eq!(
        up,
        vec![
            "ALTER TABLE users ADD COLUMN email TEXT",
            "CREATE UNIQUE INDEX uq_users_email ON users (email)",
        ]
    );
    assert_eq!(script.executable_down().count(), 0);
    assert_eq!(script.warnings.len(), 2);
    assert!(script.warnings[0].contains("added as nullable"));
}

#[test]
fn renamed_table_needs_confirmation() {
    let old = Schema::new("app").table(
        Table::new("user").column(Column::new("id", ColumnType::Long).primary_key()),
    );
    let new = Schema::new("app").table(
        Table::new("users").column(Column::new("id", ColumnType::Long).primary_key()),
    );

    let changes = SchemaDiffer::new().compare(&old, &new).unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].change_type(), ChangeType::RenameTable);
    assert!(changes[0].requires_confirmation);
    assert!(changes[0].confirmation_message.is_some());

    let generator = MigrationGenerator::new(Arc::new(PostgresDialect::new()));
    let script = generator.generate(&changes, "rename users").unwrap().unwrap();
    assert!(script
        .up
        .contains(&"ALTER TABLE \"user\" RENAME TO users".to_string()));
    assert!(script
        .down
        .contains(&"ALTER TABLE users RENAME TO \"user\"".to_string()));

    let strict = generator.with_options(GeneratorOptions {
        require_confirmation: true,
    });
    assert!(matches!(
        strict.generate(&changes, "rename users"),
        Err(MigrateError::DestructiveChangeRejected { .. })
    ));

    let exact = SchemaDiffer::with_options(DifferOptions::exact())
        .compare(&old, &new)
        .unwrap();
    let kinds: Vec<ChangeType> = exact.iter().map(Change::change_type).collect();
    assert!(kinds.contains(&ChangeType::DropTable));
    assert!(kinds.contains(&ChangeType::CreateTable));
}

#[tokio::test]
async fn generated_files_apply_and_undo_on_sqlite() {
    let tmp = TempDir::new().unwrap();
    let directory = MigrationDirectory::new(tmp.path().join("migrations"));
    let generator = MigrationGenerator::new(Arc::new(SqliteDialect::new()));
    let differ = SchemaDiffer::new();

    let initial = differ.compare(&Schema::default(), &users_v1()).unwrap();
    let first = generator
        .generate_at(
            &initial,
            "create users",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )
        .unwrap()
        .unwrap();
    directory.write(&first).unwrap();

    let indexed = Schema::new("app").table(
        Table::new("users")
            .column(Column::new("id", ColumnType::Long).primary_key().identity())
            .column(Column::new("name", ColumnType::String).length(100).not_null())
            .index(Index::new("idx_users_name", &["name"])),
    );
    let second_changes = differ.compare(&users_v1(), &indexed).unwrap();
    let second = generator
        .generate_at(
            &second_changes,
            "index user names",
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
        )
        .unwrap()
        .unwrap();
    directory.write(&second).unwrap();

    let pool = memory_pool().await;
    let executor = MigrationExecutor::new(
        pool.clone(),
        Arc::new(SqliteDialect::new()),
        Arc::new(directory.clone()),
        ExecutorOptions::default(),
    );

    let applied = executor.apply_pending(None).await.unwrap();
    let versions: Vec<&str> = applied.iter().map(|s| s.version.as_str()).collect();
    assert_eq!(versions, vec!["20240101000000", "20240102000000"]);

    sqlx::query("INSERT INTO users (name) VALUES ('ada')")
        .execute(&pool)
        .await
        .unwrap();

    assert_eq!(index_count(&pool).await, 1);

    let undone = executor.undo_last().await.unwrap().unwrap();
    assert_eq!(undone.version, "20240102000000");
    assert_eq!(index_count(&pool).await, 0);

    let status = executor.status().await.unwrap();
    assert_eq!(status.len(), 2);
    assert_eq!(status[0].state, MigrationState::Applied);
    assert_eq!(status[1].state, MigrationState::Reverted);
    assert!(executor.validate().await.unwrap().is_empty());

    let history = executor.history(1).await.unwrap();
    assert_eq!(history.len(), 1);
}
