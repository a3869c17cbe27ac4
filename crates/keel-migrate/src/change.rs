//! Structural differences between two schemas.
//!
//! A [`Change`] is produced by the differ and consumed by the generator. It is
//! an immutable value: the constructors fix its risk classification and
//! confirmation requirements once.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::schema::{Column, ForeignKey, Index, Table, TableRef};

/// How likely a change is to lose data or need a human decision.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    /// No risk.
    #[default]
    None,
    /// Additive change.
    Low,
    /// Reversible structural change, may need checking.
    Medium,
    /// Likely data loss or truncation.
    High,
    /// Certain loss of a whole table.
    Critical,
}

impl RiskLevel {
    /// Upper-case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The tag of a [`ChangeKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    /// CREATE TABLE.
    CreateTable,
    /// DROP TABLE.
    DropTable,
    /// RENAME TABLE.
    RenameTable,
    /// ADD COLUMN.
    AddColumn,
    /// DROP COLUMN.
    DropColumn,
    /// MODIFY COLUMN.
    ModifyColumn,
    /// RENAME COLUMN.
    RenameColumn,
    /// CREATE INDEX.
    AddIndex,
    /// DROP INDEX.
    DropIndex,
    /// RENAME INDEX.
    RenameIndex,
    /// ADD FOREIGN KEY.
    AddForeignKey,
    /// DROP FOREIGN KEY.
    DropForeignKey,
}

impl ChangeType {
    /// Execution priority inside one migration; lower runs first.
    ///
    /// Drops run before renames, renames before creates, and creates before
    /// the additions that depend on them.
    #[must_use]
    pub fn priority(&self) -> u8 {
        match self {
            Self::DropForeignKey => 1,
            Self::DropIndex => 2,
            Self::DropColumn => 3,
            Self::DropTable => 4,
            Self::RenameTable => 5,
            Self::CreateTable => 6,
            Self::AddColumn => 7,
            Self::RenameColumn => 8,
            Self::ModifyColumn => 9,
            Self::AddIndex => 10,
            Self::RenameIndex => 11,
            Self::AddForeignKey => 12,
        }
    }

    /// Upper-case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateTable => "CREATE_TABLE",
            Self::DropTable => "DROP_TABLE",
            Self::RenameTable => "RENAME_TABLE",
            Self::AddColumn => "ADD_COLUMN",
            Self::DropColumn => "DROP_COLUMN",
            Self::ModifyColumn => "MODIFY_COLUMN",
            Self::RenameColumn => "RENAME_COLUMN",
            Self::AddIndex => "ADD_INDEX",
            Self::DropIndex => "DROP_INDEX",
            Self::RenameIndex => "RENAME_INDEX",
            Self::AddForeignKey => "ADD_FOREIGN_KEY",
            Self::DropForeignKey => "DROP_FOREIGN_KEY",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What changed, with the affected objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    /// A new table.
    CreateTable {
        /// The full table definition.
        table: Table,
    },
    /// A removed table.
    DropTable {
        /// The table as it was.
        table: Table,
    },
    /// A table that was renamed.
    RenameTable {
        /// Old name.
        from: TableRef,
        /// New name.
        to: TableRef,
    },
    /// A new column.
    AddColumn {
        /// Owning table.
        table: TableRef,
        /// New column.
        column: Column,
    },
    /// A removed column.
    DropColumn {
        /// Owning table.
        table: TableRef,
        /// The column as it was.
        column: Column,
    },
    /// A column whose definition changed.
    ModifyColumn {
        /// Owning table.
        table: TableRef,
        /// Old definition.
        old: Column,
        /// New definition.
        new: Column,
    },
    /// A column that was renamed.
    RenameColumn {
        /// Owning table.
        table: TableRef,
        /// Old definition.
        old: Column,
        /// New definition.
        new: Column,
    },
    /// A new index.
    AddIndex {
        /// Owning table.
        table: TableRef,
        /// The index.
        index: Index,
    },
    /// A removed index.
    DropIndex {
        /// Owning table.
        table: TableRef,
        /// The index as it was.
        index: Index,
    },
    /// An index that was renamed.
    RenameIndex {
        /// Owning table.
        table: TableRef,
        /// Old definition.
        old: Index,
        /// New definition.
        new: Index,
    },
    /// A new foreign key.
    AddForeignKey {
        /// Owning table.
        table: TableRef,
        /// The constraint.
        foreign_key: ForeignKey,
    },
    /// A removed foreign key.
    DropForeignKey {
        /// Owning table.
        table: TableRef,
        /// The constraint as it was.
        foreign_key: ForeignKey,
    },
}

/// One atomic structural difference with its risk classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// The difference itself.
    pub kind: ChangeKind,
    /// Risk classification.
    pub risk: RiskLevel,
    /// Whether applying the change removes a schema object.
    pub destructive: bool,
    /// Whether applying the change can lose stored data.
    pub data_loss: bool,
    /// Whether a human must confirm the change.
    pub requires_confirmation: bool,
    /// Message shown when asking for confirmation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_message: Option<String>,
}

impl Change {
    fn new(kind: ChangeKind, risk: RiskLevel) -> Self {
        Self {
            kind,
            risk,
            destructive: false,
            data_loss: false,
            requires_confirmation: false,
            confirmation_message: None,
        }
    }

    fn confirm(mut self, message: String) -> Self {
        self.requires_confirmation = true;
        self.confirmation_message = Some(message);
        self
    }

    fn destructive(mut self) -> Self {
        self.destructive = true;
        self.data_loss = true;
        self
    }

    /// CREATE TABLE, risk LOW.
    #[must_use]
    pub fn create_table(table: Table) -> Self {
        Self::new(ChangeKind::CreateTable { table }, RiskLevel::Low)
    }

    /// DROP TABLE, risk CRITICAL.
    #[must_use]
    pub fn drop_table(table: Table) -> Self {
        let message = format!(
            "Table '{}' will be dropped together with all of its data",
            table.name
        );
        Self::new(ChangeKind::DropTable { table }, RiskLevel::Critical)
            .destructive()
            .confirm(message)
    }

    /// RENAME TABLE suggested by the heuristic.
    #[must_use]
    pub fn rename_table(from: TableRef, to: TableRef, risk: RiskLevel) -> Self {
        let message = format!(
            "Table '{}' appears to have been renamed to '{}'; confirm this is a rename and not a drop + create",
            from.name, to.name
        );
        Self::new(ChangeKind::RenameTable { from, to }, risk).confirm(message)
    }

    /// ADD COLUMN, risk LOW.
    #[must_use]
    pub fn add_column(table: TableRef, column: Column) -> Self {
        Self::new(ChangeKind::AddColumn { table, column }, RiskLevel::Low)
    }

    /// DROP COLUMN, risk HIGH.
    #[must_use]
    pub fn drop_column(table: TableRef, column: Column) -> Self {
        let message = format!(
            "Column '{}.{}' will be dropped together with its data",
            table.name, column.name
        );
        Self::new(ChangeKind::DropColumn { table, column }, RiskLevel::High)
            .destructive()
            .confirm(message)
    }

    /// MODIFY COLUMN; `narrowing` decides between LOW and HIGH.
    #[must_use]
    pub fn modify_column(table: TableRef, old: Column, new: Column, narrowing: bool) -> Self {
        if !narrowing {
            return Self::new(ChangeKind::ModifyColumn { table, old, new }, RiskLevel::Low);
        }
        let message = format!(
            "Column '{}.{}' is being narrowed; existing values may be truncated or rejected",
            table.name, new.name
        );
        let mut change =
            Self::new(ChangeKind::ModifyColumn { table, old, new }, RiskLevel::High).confirm(message);
        change.data_loss = true;
        change
    }

    /// RENAME COLUMN suggested by the heuristic.
    #[must_use]
    pub fn rename_column(table: TableRef, old: Column, new: Column, risk: RiskLevel) -> Self {
        let message = format!(
            "Column '{}.{}' appears to have been renamed to '{}'; confirm this is a rename and not a drop + add",
            table.name, old.name, new.name
        );
        Self::new(ChangeKind::RenameColumn { table, old, new }, risk).confirm(message)
    }

    /// CREATE INDEX, risk LOW.
    #[must_use]
    pub fn add_index(table: TableRef, index: Index) -> Self {
        Self::new(ChangeKind::AddIndex { table, index }, RiskLevel::Low)
    }

    /// DROP INDEX, risk HIGH.
    #[must_use]
    pub fn drop_index(table: TableRef, index: Index) -> Self {
        let message = format!(
            "Index '{}' on '{}' will be dropped",
            index.name, table.name
        );
        let mut change =
            Self::new(ChangeKind::DropIndex { table, index }, RiskLevel::High).confirm(message);
        change.destructive = true;
        change
    }

    /// RENAME INDEX, risk MEDIUM.
    #[must_use]
    pub fn rename_index(table: TableRef, old: Index, new: Index) -> Self {
        Self::new(ChangeKind::RenameIndex { table, old, new }, RiskLevel::Medium)
    }

    /// ADD FOREIGN KEY, risk MEDIUM (existing rows may violate it).
    #[must_use]
    pub fn add_foreign_key(table: TableRef, foreign_key: ForeignKey) -> Self {
        Self::new(
            ChangeKind::AddForeignKey { table, foreign_key },
            RiskLevel::Medium,
        )
    }

    /// DROP FOREIGN KEY, risk MEDIUM.
    #[must_use]
    pub fn drop_foreign_key(table: TableRef, foreign_key: ForeignKey) -> Self {
        Self::new(
            ChangeKind::DropForeignKey { table, foreign_key },
            RiskLevel::Medium,
        )
    }

    /// Returns the change's tag.
    #[must_use]
    pub fn change_type(&self) -> ChangeType {
        match &self.kind {
            ChangeKind::CreateTable { .. } => ChangeType::CreateTable,
            ChangeKind::DropTable { .. } => ChangeType::DropTable,
            ChangeKind::RenameTable { .. } => ChangeType::RenameTable,
            ChangeKind::AddColumn { .. } => ChangeType::AddColumn,
            ChangeKind::DropColumn { .. } => ChangeType::DropColumn,
            ChangeKind::ModifyColumn { .. } => ChangeType::ModifyColumn,
            ChangeKind::RenameColumn { .. } => ChangeType::RenameColumn,
            ChangeKind::AddIndex { .. } => ChangeType::AddIndex,
            ChangeKind::DropIndex { .. } => ChangeType::DropIndex,
            ChangeKind::RenameIndex { .. } => ChangeType::RenameIndex,
            ChangeKind::AddForeignKey { .. } => ChangeType::AddForeignKey,
            ChangeKind::DropForeignKey { .. } => ChangeType::DropForeignKey,
        }
    }

    /// Name of the table the change applies to.
    ///
    /// For renames this is the old name.
    #[must_use]
    pub fn table_name(&self) -> &str {
        match &self.kind {
            ChangeKind::CreateTable { table } | ChangeKind::DropTable { table } => &table.name,
            ChangeKind::RenameTable { from, .. } => &from.name,
            ChangeKind::AddColumn { table, .. }
            | ChangeKind::DropColumn { table, .. }
            | ChangeKind::ModifyColumn { table, .. }
            | ChangeKind::RenameColumn { table, .. }
            | ChangeKind::AddIndex { table, .. }
            | ChangeKind::DropIndex { table, .. }
            | ChangeKind::RenameIndex { table, .. }
            | ChangeKind::AddForeignKey { table, .. }
            | ChangeKind::DropForeignKey { table, .. } => &table.name,
        }
    }

    /// Name of the affected object inside the table (or the table itself).
    #[must_use]
    pub fn object_name(&self) -> &str {
        match &self.kind {
            ChangeKind::CreateTable { table } | ChangeKind::DropTable { table } => &table.name,
            ChangeKind::RenameTable { from, .. } => &from.name,
            ChangeKind::AddColumn { column, .. } | ChangeKind::DropColumn { column, .. } => {
                &column.name
            }
            ChangeKind::ModifyColumn { new, .. } => &new.name,
            ChangeKind::RenameColumn { old, .. } => &old.name,
            ChangeKind::AddIndex { index, .. } | ChangeKind::DropIndex { index, .. } => {
                &index.name
            }
            ChangeKind::RenameIndex { old, .. } => &old.name,
            ChangeKind::AddForeignKey { foreign_key, .. }
            | ChangeKind::DropForeignKey { foreign_key, .. } => &foreign_key.name,
        }
    }

    /// One-line human description, used as the SQL comment in scripts.
    #[must_use]
    pub fn describe(&self) -> String {
        match &self.kind {
            ChangeKind::CreateTable { table } => format!("Create table {}", table.reference()),
            ChangeKind::DropTable { table } => format!("Drop table {}", table.reference()),
            ChangeKind::RenameTable { from, to } => format!("Rename table {from} to {to}"),
            ChangeKind::AddColumn { table, column } => {
                format!("Add column {} to {}", column.name, table)
            }
            ChangeKind::DropColumn { table, column } => {
                format!("Drop column {} from {}", column.name, table)
            }
            ChangeKind::ModifyColumn { table, new, .. } => {
                format!("Modify column {}.{}", table, new.name)
            }
            ChangeKind::RenameColumn { table, old, new } => {
                format!("Rename column {}.{} to {}", table, old.name, new.name)
            }
            ChangeKind::AddIndex { table, index } => {
                format!("Add index {} on {}", index.name, table)
            }
            ChangeKind::DropIndex { table, index } => {
                format!("Drop index {} on {}", index.name, table)
            }
            ChangeKind::RenameIndex { table, old, new } => {
                format!("Rename index {} on {} to {}", old.name, table, new.name)
            }
            ChangeKind::AddForeignKey { table, foreign_key } => {
                format!("Add foreign key {} on {}", foreign_key.name, table)
            }
            ChangeKind::DropForeignKey { table, foreign_key } => {
                format!("Drop foreign key {} on {}", foreign_key.name, table)
            }
        }
    }
}
