//! Schema comparison.
//!
//! [`SchemaDiffer::compare`] turns two [`Schema`] values into the list of
//! [`Change`]s that transform the old one into the new one. The result is
//! deterministic: every collection is walked in lexical order and the final
//! list is sorted by table name, change priority and object name.
//!
//! Renames are heuristic. A dropped table (or column) is paired with an
//! added one whose name is similar enough; such suggestions always require
//! confirmation.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::change::{Change, RiskLevel};
use crate::error::Result;
use crate::schema::{Column, ColumnType, Index, Schema, Table, TableRef};
use crate::similarity::similarity;

/// Default similarity a name pair must exceed to count as a rename.
pub const DEFAULT_RENAME_THRESHOLD: f64 = 0.6;

/// Length assumed for string columns that declare none.
const DEFAULT_LENGTH: i32 = 255;

/// Tuning of the rename heuristics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DifferOptions {
    /// Whether to look for renamed tables, columns and indexes at all.
    pub detect_renames: bool,
    /// Similarity a name pair must exceed to count as a rename.
    pub rename_threshold: f64,
    /// Risk assigned to suggested table renames.
    pub table_rename_risk: RiskLevel,
    /// Risk assigned to suggested column renames.
    pub column_rename_risk: RiskLevel,
}

impl Default for DifferOptions {
    fn default() -> Self {
        Self {
            detect_renames: true,
            rename_threshold: DEFAULT_RENAME_THRESHOLD,
            table_rename_risk: RiskLevel::Medium,
            column_rename_risk: RiskLevel::High,
        }
    }
}

impl DifferOptions {
    /// Options that never suggest renames: every difference is a drop and
    /// a create.
    #[must_use]
    pub fn exact() -> Self {
        Self {
            detect_renames: false,
            ..Self::default()
        }
    }

    /// Sets the rename similarity threshold.
    #[must_use]
    pub fn rename_threshold(mut self, threshold: f64) -> Self {
        self.rename_threshold = threshold;
        self
    }
}

/// Computes changes between two schemas.
#[derive(Debug, Clone, Default)]
pub struct SchemaDiffer {
    options: DifferOptions,
}

impl SchemaDiffer {
    /// Creates a differ with the default heuristics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a differ with explicit options.
    #[must_use]
    pub fn with_options(options: DifferOptions) -> Self {
        Self { options }
    }

    /// Returns the options in use.
    #[must_use]
    pub fn options(&self) -> &DifferOptions {
        &self.options
    }

    /// Compares `old` against `new`.
    ///
    /// Both schemas are validated first; malformed input is reported before
    /// any change is computed.
    pub fn compare(&self, old: &Schema, new: &Schema) -> Result<Vec<Change>> {
        old.validate()?;
        new.validate()?;

        let old_tables: BTreeMap<&str, &Table> =
            old.tables.iter().map(|t| (t.name.as_str(), t)).collect();
        let new_tables: BTreeMap<&str, &Table> =
            new.tables.iter().map(|t| (t.name.as_str(), t)).collect();

        let mut created: BTreeSet<&str> = new_tables
            .keys()
            .copied()
            .filter(|name| !old_tables.contains_key(name))
            .collect();

        let mut changes = Vec::new();

        for (&name, &old_table) in &old_tables {
            if let Some(&new_table) = new_tables.get(name) {
                self.diff_table(old_table, new_table, &mut changes);
                continue;
            }

            if let Some(target) = self.rename_candidate(name, &created) {
                let new_table = new_tables[target];
                debug!(from = name, to = target, "Detected probable table rename");
                created.remove(target);
                changes.push(Change::rename_table(
                    old_table.reference(),
                    new_table.reference(),
                    self.options.table_rename_risk,
                ));
                self.diff_table(old_table, new_table, &mut changes);
                continue;
            }

            changes.push(Change::drop_table(old_table.clone()));
        }

        for name in created {
            changes.push(Change::create_table(new_tables[name].clone()));
        }

        sort_changes(&mut changes);
        debug!(count = changes.len(), "Schema comparison complete");
        Ok(changes)
    }

    /// First name in `candidates` (lexical order) similar enough to `name`.
    fn rename_candidate<'a>(&self, name: &str, candidates: &BTreeSet<&'a str>) -> Option<&'a str> {
        if !self.options.detect_renames {
            return None;
        }
        candidates
            .iter()
            .copied()
            .find(|candidate| similarity(name, candidate) > self.options.rename_threshold)
    }

    /// Changes inside one table.
    ///
    /// Drop-type changes are addressed to the old table name, since they run
    /// before any rename; everything else to the new name.
    fn diff_table(&self, old: &Table, new: &Table, changes: &mut Vec<Change>) {
        let old_ref = old.reference();
        let new_ref = new.reference();
        self.diff_columns(old, new, &old_ref, &new_ref, changes);
        self.diff_indexes(old, new, &old_ref, &new_ref, changes);
        diff_foreign_keys(old, new, &old_ref, &new_ref, changes);
    }

    fn diff_columns(
        &self,
        old: &Table,
        new: &Table,
        old_ref: &TableRef,
        new_ref: &TableRef,
        changes: &mut Vec<Change>,
    ) {
        let old_names: BTreeSet<&str> = old.columns.iter().map(|c| c.name.as_str()).collect();
        let new_names: BTreeSet<&str> = new.columns.iter().map(|c| c.name.as_str()).collect();

        let mut added: BTreeSet<&str> = new_names.difference(&old_names).copied().collect();

        for &name in old_names.difference(&new_names) {
            let Some(old_column) = old.get_column(name) else {
                continue;
            };
            let renamed = self
                .options
                .detect_renames
                .then(|| {
                    added.iter().copied().find(|candidate| {
                        new.get_column(candidate)
                            .is_some_and(|c| c.column_type == old_column.column_type)
                            && similarity(name, candidate) > self.options.rename_threshold
                    })
                })
                .flatten();

            match renamed.and_then(|target| new.get_column(target)) {
                Some(new_column) => {
                    debug!(table = %new_ref, from = name, to = %new_column.name, "Detected probable column rename");
                    added.remove(new_column.name.as_str());
                    changes.push(Change::rename_column(
                        new_ref.clone(),
                        old_column.clone(),
                        new_column.clone(),
                        self.options.column_rename_risk,
                    ));
                    if let Some(change) = modify(new_ref, old_column, new_column) {
                        changes.push(change);
                    }
                }
                None => changes.push(Change::drop_column(old_ref.clone(), old_column.clone())),
            }
        }

        for name in added {
            if let Some(column) = new.get_column(name) {
                changes.push(Change::add_column(new_ref.clone(), column.clone()));
            }
        }

        for &name in old_names.intersection(&new_names) {
            if let (Some(old_column), Some(new_column)) = (old.get_column(name), new.get_column(name))
            {
                if let Some(change) = modify(new_ref, old_column, new_column) {
                    changes.push(change);
                }
            }
        }
    }

    fn diff_indexes(
        &self,
        old: &Table,
        new: &Table,
        old_ref: &TableRef,
        new_ref: &TableRef,
        changes: &mut Vec<Change>,
    ) {
        let mut old_left: BTreeMap<&str, &Index> = old
            .indexes
            .iter()
            .map(|i| (i.name.as_str(), i))
            .collect();
        let mut new_left: BTreeMap<&str, &Index> = new
            .indexes
            .iter()
            .map(|i| (i.name.as_str(), i))
            .collect();

        // Unchanged indexes.
        let unchanged: Vec<&str> = old_left
            .iter()
            .filter(|(name, index)| new_left.get(*name).is_some_and(|n| n.same_definition(index)))
            .map(|(name, _)| *name)
            .collect();
        for name in unchanged {
            old_left.remove(name);
            new_left.remove(name);
        }

        // Same definition under a name that is free on both sides.
        if self.options.detect_renames {
            let candidates: Vec<&Index> = old_left.values().copied().collect();
            for old_index in candidates {
                if new.get_index(&old_index.name).is_some() {
                    continue;
                }
                let target = new_left
                    .values()
                    .copied()
                    .find(|n| old.get_index(&n.name).is_none() && n.same_definition(old_index));
                if let Some(new_index) = target {
                    old_left.remove(old_index.name.as_str());
                    new_left.remove(new_index.name.as_str());
                    changes.push(Change::rename_index(
                        new_ref.clone(),
                        old_index.clone(),
                        new_index.clone(),
                    ));
                }
            }
        }

        for index in old_left.into_values() {
            changes.push(Change::drop_index(old_ref.clone(), index.clone()));
        }
        for index in new_left.into_values() {
            changes.push(Change::add_index(new_ref.clone(), index.clone()));
        }
    }
}

/// Foreign keys are matched by constraint name; any difference is a drop
/// followed by an add.
fn diff_foreign_keys(
    old: &Table,
    new: &Table,
    old_ref: &TableRef,
    new_ref: &TableRef,
    changes: &mut Vec<Change>,
) {
    let old_keys: BTreeMap<String, _> = old
        .effective_foreign_keys()
        .into_iter()
        .map(|fk| (fk.name.clone(), fk))
        .collect();
    let new_keys: BTreeMap<String, _> = new
        .effective_foreign_keys()
        .into_iter()
        .map(|fk| (fk.name.clone(), fk))
        .collect();

    for (name, old_fk) in &old_keys {
        match new_keys.get(name) {
            Some(new_fk) if new_fk.same_definition(old_fk) => {}
            Some(new_fk) => {
                changes.push(Change::drop_foreign_key(old_ref.clone(), old_fk.clone()));
                changes.push(Change::add_foreign_key(new_ref.clone(), new_fk.clone()));
            }
            None => changes.push(Change::drop_foreign_key(old_ref.clone(), old_fk.clone())),
        }
    }
    for (name, new_fk) in &new_keys {
        if !old_keys.contains_key(name) {
            changes.push(Change::add_foreign_key(new_ref.clone(), new_fk.clone()));
        }
    }
}

/// MODIFY_COLUMN for a column whose definition or comment changed.
fn modify(table: &TableRef, old: &Column, new: &Column) -> Option<Change> {
    if old.same_definition(new) && old.comment == new.comment {
        return None;
    }
    Some(Change::modify_column(
        table.clone(),
        old.clone(),
        new.clone(),
        is_narrowing(old, new),
    ))
}

/// True if moving from `old` to `new` can reject or truncate stored values.
fn is_narrowing(old: &Column, new: &Column) -> bool {
    let old = old.normalized();
    let new = new.normalized();

    let type_widens = matches!(
        (old.column_type, new.column_type),
        (ColumnType::Integer, ColumnType::Long) | (ColumnType::Float, ColumnType::Double)
    );
    if old.column_type != new.column_type && !type_widens {
        return true;
    }
    if old.nullable && !new.nullable {
        return true;
    }
    if old.column_type.uses_length()
        && new.length.unwrap_or(DEFAULT_LENGTH) < old.length.unwrap_or(DEFAULT_LENGTH)
    {
        return true;
    }
    if shrinks(old.precision, new.precision) || shrinks(old.scale, new.scale) {
        return true;
    }
    (new.unique && !old.unique) || old.primary_key != new.primary_key || old.generation != new.generation
}

fn shrinks(old: Option<i32>, new: Option<i32>) -> bool {
    matches!((old, new), (Some(o), Some(n)) if n < o)
}

/// Sorts by table name, change priority, then object name.
fn sort_changes(changes: &mut [Change]) {
    changes.sort_by(|a, b| {
        a.table_name()
            .cmp(b.table_name())
            .then_with(|| a.change_type().priority().cmp(&b.change_type().priority()))
            .then_with(|| a.object_name().cmp(b.object_name()))
    });
}
