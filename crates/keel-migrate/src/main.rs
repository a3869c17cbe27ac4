//! keel-migrate CLI
//!
//! Command-line tool for generating and applying schema migrations.

#![allow(clippy::too_many_lines)]
#![allow(clippy::doc_markdown)]

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use keel_migrate::prelude::*;

/// Dialect-aware database schema migrations.
#[derive(Parser)]
#[command(name = "keel-migrate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to keel.toml when present).
    #[arg(short, long, env = "KEEL_CONFIG")]
    config: Option<PathBuf>,

    /// Database connection URL.
    #[arg(long, env = "KEEL_DATABASE_URL")]
    database_url: Option<String>,

    /// Migrations directory.
    #[arg(short, long, env = "KEEL_MIGRATIONS_DIR")]
    migrations_dir: Option<PathBuf>,

    /// History table name.
    #[arg(long, env = "KEEL_HISTORY_TABLE")]
    history_table: Option<String>,

    /// Seconds to wait for the migration lock.
    #[arg(long, env = "KEEL_LOCK_TIMEOUT")]
    lock_timeout: Option<u64>,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a migration from the difference between two schemas.
    Generate {
        /// Migration description.
        #[arg(short, long, default_value = "auto")]
        description: String,

        /// Current schema JSON (empty schema if not given).
        #[arg(long, env = "KEEL_CURRENT_SCHEMA")]
        from: Option<PathBuf>,

        /// Desired schema JSON.
        #[arg(long, env = "KEEL_ENTITY_SOURCE")]
        to: Option<PathBuf>,

        /// Target dialect (detected from the database URL if not given).
        #[arg(long, env = "KEEL_DIALECT")]
        dialect: Option<String>,

        /// Print the script instead of writing it.
        #[arg(long)]
        dry_run: bool,

        /// Accept destructive changes without asking.
        #[arg(short, long)]
        yes: bool,
    },

    /// Apply pending migrations.
    Apply {
        /// Apply up to and including this version.
        #[arg(short, long)]
        target: Option<String>,

        /// Show SQL without executing (dry run).
        #[arg(long)]
        dry_run: bool,
    },

    /// Show migration status.
    Status {
        /// Print JSON.
        #[arg(long)]
        json: bool,
    },

    /// Check applied migrations against the files on disk.
    Validate,

    /// Revert the most recently applied migration.
    Undo {
        /// Show SQL without executing (dry run).
        #[arg(long)]
        dry_run: bool,
    },

    /// Revert every migration newer than a version.
    Revert {
        /// Version to revert to (exclusive).
        version: String,

        /// Show SQL without executing (dry run).
        #[arg(long)]
        dry_run: bool,
    },

    /// Show applied migrations, most recent first.
    History {
        /// Maximum number of entries.
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Print JSON.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let result = run(cli).await;
    if let Err(err) = &result {
        if let Some(migrate) = err.downcast_ref::<MigrateError>() {
            if migrate.requires_operator() {
                error!("Manual intervention required: {migrate}");
            }
        }
    }
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = MigrateConfig::discover(cli.config.as_deref())?;
    if let Some(url) = cli.database_url {
        config.database_url = Some(url);
    }
    if let Some(dir) = cli.migrations_dir {
        config.migrations_dir = dir;
    }
    if let Some(table) = cli.history_table {
        config.history_table = table;
    }
    if let Some(secs) = cli.lock_timeout {
        config.lock_timeout_secs = secs;
    }
    config.validate()?;

    match cli.command {
        Commands::Generate {
            description,
            from,
            to,
            dialect,
            dry_run,
            yes,
        } => {
            if dialect.is_some() {
                config.dialect = dialect;
            }
            generate(&config, &description, from, to, dry_run, yes)
        }

        Commands::Apply { target, dry_run } => {
            let executor = connect(&config).await?;
            if dry_run {
                info!("Dry run mode - SQL will be printed but not executed.");
                let pending = executor.pending(target.as_deref()).await?;
                if pending.is_empty() {
                    info!("No pending migrations.");
                }
                for script in &pending {
                    print_statements(&script.version, &script.description, script.executable_up());
                }
                return Ok(());
            }

            let applied = executor.apply_pending(target.as_deref()).await?;
            if applied.is_empty() {
                info!("No pending migrations.");
            } else {
                info!("Applied {} migration(s).", applied.len());
            }
            Ok(())
        }

        Commands::Status { json } => {
            let executor = connect(&config).await?;
            let statuses = executor.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
                return Ok(());
            }
            if statuses.is_empty() {
                info!("No migrations found.");
                return Ok(());
            }
            println!("\nMigrations:");
            println!("{:-<72}", "");
            for status in &statuses {
                let mark = match status.state {
                    MigrationState::Applied => "[X]",
                    MigrationState::Reverted => "[R]",
                    _ => "[ ]",
                };
                let applied_at = status
                    .applied_at
                    .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                let missing = if status.script_present { "" } else { " (file missing)" };
                println!(
                    " {mark} {} {} {applied_at}{missing}",
                    status.version, status.description
                );
            }
            println!();
            Ok(())
        }

        Commands::Validate => {
            let executor = connect(&config).await?;
            let issues = executor.validate().await?;
            if issues.is_empty() {
                info!("All applied migrations match their files.");
                return Ok(());
            }
            for issue in &issues {
                warn!("{issue}");
            }
            bail!("{} validation issue(s) found", issues.len())
        }

        Commands::Undo { dry_run } => {
            let executor = connect(&config).await?;
            if dry_run {
                match executor.undo_candidate().await? {
                    Some(script) => print_statements(
                        &script.version,
                        &script.description,
                        script.executable_down(),
                    ),
                    None => info!("Nothing to undo."),
                }
                return Ok(());
            }
            match executor.undo_last().await? {
                Some(script) => info!("Reverted {} ({}).", script.version, script.description),
                None => info!("Nothing to undo."),
            }
            Ok(())
        }

        Commands::Revert { version, dry_run } => {
            let executor = connect(&config).await?;
            if dry_run {
                for script in executor.revert_candidates(&version).await? {
                    print_statements(&script.version, &script.description, script.executable_down());
                }
                return Ok(());
            }
            let reverted = executor.revert_to_version(&version).await?;
            info!("Reverted {} migration(s).", reverted.len());
            Ok(())
        }

        Commands::History { limit, json } => {
            let executor = connect(&config).await?;
            let history = executor.history(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&history)?);
                return Ok(());
            }
            if history.is_empty() {
                info!("No migrations have been applied yet.");
                return Ok(());
            }
            for script in &history {
                let applied_at = script
                    .applied_at
                    .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                let state = if script.applied { "applied" } else { "reverted" };
                println!(
                    " {} {} [{state}] {applied_at}",
                    script.version, script.description
                );
            }
            Ok(())
        }
    }
}

fn generate(
    config: &MigrateConfig,
    description: &str,
    from: Option<PathBuf>,
    to: Option<PathBuf>,
    dry_run: bool,
    yes: bool,
) -> anyhow::Result<()> {
    let current = match from.or_else(|| config.current_schema.clone()) {
        Some(path) => read_schema(&path)?,
        None => Schema::default(),
    };
    let desired_path = to
        .or_else(|| config.entity_source.clone())
        .ok_or_else(|| anyhow!("desired schema not set (--to, KEEL_ENTITY_SOURCE or entity_source)"))?;
    let desired = read_schema(&desired_path)?;

    let dialect = DialectRegistry::standard().get(config.database_type()?)?;
    let changes = SchemaDiffer::with_options(config.differ_options()).compare(&current, &desired)?;
    if changes.is_empty() {
        info!("No changes detected.");
        return Ok(());
    }

    for change in &changes {
        info!("[{}] {}", change.risk, change.describe());
    }
    let confirmed = yes || config.allow_destructive || confirm(&changes)?;
    let generator = MigrationGenerator::new(dialect).with_options(GeneratorOptions {
        require_confirmation: !confirmed,
    });
    let Some(script) = generator.generate(&changes, description)? else {
        return Ok(());
    };
    for warning in &script.warnings {
        warn!("{warning}");
    }

    let directory =
        MigrationDirectory::new(&config.migrations_dir).with_separator(config.statement_separator);
    if dry_run {
        println!("Would create migration: {}\n", script.file_name());
        println!("{}", directory.render(&script));
    } else {
        let path = directory.write(&script)?;
        info!("Created migration: {}", path.display());
    }
    Ok(())
}

/// Asks on the terminal for every change that needs confirmation.
fn confirm(changes: &[Change]) -> anyhow::Result<bool> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    for change in changes.iter().filter(|c| c.requires_confirmation) {
        let message = change
            .confirmation_message
            .clone()
            .unwrap_or_else(|| change.describe());
        print!("{message}\nProceed? [y/N] ");
        io::stdout().flush()?;
        let answer = lines.next().transpose()?.unwrap_or_default();
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            return Ok(false);
        }
    }
    Ok(true)
}

fn read_schema(path: &Path) -> anyhow::Result<Schema> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read schema {}", path.display()))?;
    Ok(Schema::from_json(&json)?)
}

async fn connect(config: &MigrateConfig) -> anyhow::Result<MigrationExecutor> {
    let url = config.database_url.as_deref().ok_or_else(|| {
        anyhow!("database URL not set (--database-url, KEEL_DATABASE_URL or database_url)")
    })?;
    let source = MigrationDirectory::new(&config.migrations_dir)
        .with_separator(config.statement_separator);
    let executor = MigrationExecutor::connect(
        url,
        &DialectRegistry::standard(),
        Arc::new(source),
        config.executor_options(),
    )
    .await?;
    Ok(executor)
}

fn print_statements<'a>(version: &str, description: &str, statements: impl Iterator<Item = &'a str>) {
    println!("-- {version}: {description}");
    for statement in statements {
        println!("{statement};");
    }
    println!();
}
