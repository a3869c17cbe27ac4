//! Migration script generation.
//!
//! The generator orders changes by [`ChangeType::priority`], renders each one
//! with the configured [`Dialect`] and wraps the result in transaction
//! markers. Down statements are derived from the change itself where possible;
//! drops cannot be reversed from the change alone and get a placeholder.
//!
//! Each change's statements open with a numbered `-- Change <n>:` comment and
//! its reverse with the matching `-- Revert <n>:`, so a failed migration can
//! be undone change by change.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::change::{Change, ChangeKind, ChangeType};
use crate::dialect::Dialect;
use crate::error::{MigrateError, Result};
use crate::script::{change_marker, revert_marker, MigrationScript};

/// Generation policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneratorOptions {
    /// Reject any change that requires confirmation instead of generating it.
    pub require_confirmation: bool,
}

/// Turns changes into migration scripts for one dialect.
#[derive(Debug, Clone)]
pub struct MigrationGenerator {
    dialect: Arc<dyn Dialect>,
    options: GeneratorOptions,
}

impl MigrationGenerator {
    /// Creates a generator for a dialect.
    #[must_use]
    pub fn new(dialect: Arc<dyn Dialect>) -> Self {
        Self {
            dialect,
            options: GeneratorOptions::default(),
        }
    }

    /// Sets the generation policy.
    #[must_use]
    pub fn with_options(mut self, options: GeneratorOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the dialect.
    #[must_use]
    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    /// Generates a script versioned with the current UTC time.
    ///
    /// Returns `None` when there is nothing to migrate.
    pub fn generate(&self, changes: &[Change], description: &str) -> Result<Option<MigrationScript>> {
        self.generate_at(changes, description, Utc::now())
    }

    /// Generates a script versioned with `now`.
    pub fn generate_at(
        &self,
        changes: &[Change],
        description: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<MigrationScript>> {
        if changes.is_empty() {
            debug!("No changes, no migration generated");
            return Ok(None);
        }

        if self.options.require_confirmation {
            if let Some(change) = changes.iter().find(|c| c.requires_confirmation) {
                return Err(MigrateError::DestructiveChangeRejected {
                    message: change
                        .confirmation_message
                        .clone()
                        .unwrap_or_else(|| change.describe()),
                });
            }
        }

        let ordered = order_changes(changes);
        let dialect = self.dialect();
        let mut script = MigrationScript::new(MigrationScript::version_at(now), description)
            .created_at(now)
            .up(dialect.begin_transaction());

        let mut down_blocks = Vec::with_capacity(ordered.len());
        for change in &ordered {
            let up = self.up_statements(change)?;
            if up.is_empty() {
                debug!(change = %change.describe(), "Change renders no statements, skipped");
                continue;
            }
            let number = down_blocks.len() + 1;
            script.up.push(change_marker(number, &change.describe()));
            script.up.extend(up);
            script.warnings.extend(dialect.change_warnings(&change.kind));

            let mut block = vec![revert_marker(number, &change.describe())];
            match self.down_statements(change) {
                Ok(Some(statements)) => block.extend(statements),
                Ok(None) => block.push(format!(
                    "-- {}: the original definition cannot be restored automatically",
                    change.describe()
                )),
                Err(MigrateError::UnsupportedOperation { reason, operation, .. }) => {
                    block.push(format!(
                        "-- {}: {} is not supported by {}; write the reverse by hand",
                        change.describe(),
                        operation,
                        dialect.name()
                    ));
                    script.warnings.push(format!(
                        "Down migration for '{}' must be written by hand: {reason}",
                        change.describe()
                    ));
                }
                Err(err) => return Err(err),
            }
            down_blocks.push(block);

            if change.destructive || change.data_loss {
                script.warnings.push(format!(
                    "[{}] {}",
                    change.risk,
                    change
                        .confirmation_message
                        .clone()
                        .unwrap_or_else(|| change.describe())
                ));
            }
        }
        if down_blocks.is_empty() {
            debug!("No change renders any statement, no migration generated");
            return Ok(None);
        }
        script.up.push(dialect.commit_transaction().to_string());

        script.down.push(dialect.begin_transaction().to_string());
        for block in down_blocks.into_iter().rev() {
            script.down.extend(block);
        }
        script.down.push(dialect.commit_transaction().to_string());

        info!(
            version = %script.version,
            changes = ordered.len(),
            warnings = script.warnings.len(),
            dialect = dialect.name(),
            "Generated migration"
        );
        Ok(Some(script))
    }

    /// Forward statements for one change.
    pub fn up_statements(&self, change: &Change) -> Result<Vec<String>> {
        let d = self.dialect();
        match &change.kind {
            ChangeKind::CreateTable { table } => d.create_table(table),
            ChangeKind::DropTable { table } => d.drop_table(table),
            ChangeKind::RenameTable { from, to } => d.rename_table(from, to),
            ChangeKind::AddColumn { table, column } => d.add_column(table, column),
            ChangeKind::DropColumn { table, column } => d.drop_column(table, column),
            ChangeKind::ModifyColumn { table, old, new } => d.modify_column(table, old, new),
            ChangeKind::RenameColumn { table, old, new } => d.rename_column(table, old, new),
            ChangeKind::AddIndex { table, index } => d.create_index(table, index),
            ChangeKind::DropIndex { table, index } => d.drop_index(table, index),
            ChangeKind::RenameIndex { table, old, new } => d.rename_index(table, old, new),
            ChangeKind::AddForeignKey { table, foreign_key } => {
                d.add_foreign_key(table, foreign_key)
            }
            ChangeKind::DropForeignKey { table, foreign_key } => {
                d.drop_foreign_key(table, foreign_key)
            }
        }
    }

    /// Reverse statements for one change, `None` for drops.
    pub fn down_statements(&self, change: &Change) -> Result<Option<Vec<String>>> {
        let d = self.dialect();
        let statements = match &change.kind {
            ChangeKind::CreateTable { table } => d.drop_table(table)?,
            ChangeKind::RenameTable { from, to } => d.rename_table(to, from)?,
            ChangeKind::AddColumn { table, column } => d.drop_column(table, column)?,
            ChangeKind::ModifyColumn { table, old, new } => d.modify_column(table, new, old)?,
            ChangeKind::RenameColumn { table, old, new } => d.rename_column(table, new, old)?,
            ChangeKind::AddIndex { table, index } => d.drop_index(table, index)?,
            ChangeKind::RenameIndex { table, old, new } => d.rename_index(table, new, old)?,
            ChangeKind::AddForeignKey { table, foreign_key } => {
                d.drop_foreign_key(table, foreign_key)?
            }
            ChangeKind::DropTable { .. }
            | ChangeKind::DropColumn { .. }
            | ChangeKind::DropIndex { .. }
            | ChangeKind::DropForeignKey { .. } => return Ok(None),
        };
        Ok(Some(statements))
    }
}

/// Stable sort by priority; new tables are additionally ordered so that
/// referenced tables come first.
fn order_changes(changes: &[Change]) -> Vec<&Change> {
    let mut ordered: Vec<&Change> = changes.iter().collect();
    ordered.sort_by_key(|c| c.change_type().priority());

    let creates: Vec<&Change> = ordered
        .iter()
        .copied()
        .filter(|c| c.change_type() == ChangeType::CreateTable)
        .collect();
    if creates.len() < 2 {
        return ordered;
    }

    let sorted = creation_order(&creates);
    let mut sorted = sorted.into_iter();
    for slot in ordered.iter_mut() {
        if slot.change_type() == ChangeType::CreateTable {
            if let Some(next) = sorted.next() {
                *slot = next;
            }
        }
    }
    ordered
}

/// Dependency order of CREATE TABLE changes by foreign key, lexical among
/// independent tables. Tables in a reference cycle keep lexical order.
fn creation_order<'a>(creates: &[&'a Change]) -> Vec<&'a Change> {
    let by_name: BTreeMap<&str, &'a Change> =
        creates.iter().map(|c| (c.table_name(), *c)).collect();

    let mut pending: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
    for (&name, change) in &by_name {
        let ChangeKind::CreateTable { table } = &change.kind else {
            continue;
        };
        let deps = table
            .effective_foreign_keys()
            .into_iter()
            .map(|fk| fk.referenced_table)
            .filter(|t| t != name && by_name.contains_key(t.as_str()))
            .collect();
        pending.insert(name, deps);
    }

    let mut order = Vec::with_capacity(by_name.len());
    while !pending.is_empty() {
        let ready = pending
            .iter()
            .find(|(_, deps)| deps.is_empty())
            .map(|(name, _)| *name)
            .or_else(|| pending.keys().next().copied());
        let Some(name) = ready else {
            break;
        };
        pending.remove(name);
        for deps in pending.values_mut() {
            deps.remove(name);
        }
        if let Some(change) = by_name.get(name) {
            order.push(*change);
        }
    }
    order
}
