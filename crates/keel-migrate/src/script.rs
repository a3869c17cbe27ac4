//! Versioned migration scripts.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// `chrono` format of migration versions (UTC `yyyyMMddHHmmss`).
pub const VERSION_FORMAT: &str = "%Y%m%d%H%M%S";

/// Comment opening the up statements of one change: `-- Change <n>: ...`.
pub const CHANGE_MARKER: &str = "-- Change ";

/// Comment opening the down statements that revert change `n`:
/// `-- Revert <n>: ...`.
pub const REVERT_MARKER: &str = "-- Revert ";

/// The executable statements between two change markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptBlock<'a> {
    /// Number from the opening marker, `None` before the first marker.
    pub change: Option<usize>,
    /// Statements sent to the database, in order.
    pub statements: Vec<&'a str>,
}

/// A versioned pair of up/down statement lists.
///
/// Up and down lists may contain `--` comment lines and transaction markers.
/// Only [`MigrationScript::executable_up`] / [`MigrationScript::executable_down`]
/// are sent to the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationScript {
    /// Sortable version, canonically a UTC timestamp.
    pub version: String,
    /// Human description.
    pub description: String,
    /// Forward statements.
    pub up: Vec<String>,
    /// Reverse statements.
    pub down: Vec<String>,
    /// Warnings attached at generation time.
    #[serde(default)]
    pub warnings: Vec<String>,
    /// When the script was generated.
    pub created_at: DateTime<Utc>,
    /// When the script was last applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    /// Whether the script is currently applied.
    #[serde(default)]
    pub applied: bool,
}

impl MigrationScript {
    /// Creates an empty, unapplied script.
    #[must_use]
    pub fn new(version: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            description: description.into(),
            up: Vec::new(),
            down: Vec::new(),
            warnings: Vec::new(),
            created_at: Utc::now(),
            applied_at: None,
            applied: false,
        }
    }

    /// Sets the creation time.
    #[must_use]
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Appends an up statement.
    #[must_use]
    pub fn up(mut self, sql: impl Into<String>) -> Self {
        self.up.push(sql.into());
        self
    }

    /// Appends a down statement.
    #[must_use]
    pub fn down(mut self, sql: impl Into<String>) -> Self {
        self.down.push(sql.into());
        self
    }

    /// Appends a warning.
    #[must_use]
    pub fn warning(mut self, text: impl Into<String>) -> Self {
        self.warnings.push(text.into());
        self
    }

    /// Version string for a point in time.
    #[must_use]
    pub fn version_at(at: DateTime<Utc>) -> String {
        at.format(VERSION_FORMAT).to_string()
    }

    /// `V<version>__<sanitized description>.sql`.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!(
            "V{}__{}.sql",
            self.version,
            sanitize_description(&self.description)
        )
    }

    /// Up statements that are sent to the database.
    pub fn executable_up(&self) -> impl Iterator<Item = &str> {
        self.up.iter().map(String::as_str).filter(|s| is_executable(s))
    }

    /// Down statements that are sent to the database.
    pub fn executable_down(&self) -> impl Iterator<Item = &str> {
        self.down.iter().map(String::as_str).filter(|s| is_executable(s))
    }

    /// Up statements grouped by `-- Change <n>:` markers.
    #[must_use]
    pub fn up_blocks(&self) -> Vec<ScriptBlock<'_>> {
        blocks(&self.up, CHANGE_MARKER)
    }

    /// Down statements grouped by `-- Revert <n>:` markers.
    #[must_use]
    pub fn down_blocks(&self) -> Vec<ScriptBlock<'_>> {
        blocks(&self.down, REVERT_MARKER)
    }

    /// Whether the up statements are grouped by change.
    #[must_use]
    pub fn has_change_markers(&self) -> bool {
        self.up
            .iter()
            .any(|s| marker_number(s, CHANGE_MARKER).is_some())
    }

    /// SHA-256 hex digest of the executable up statements.
    ///
    /// Comments and transaction markers do not take part, so editing them in
    /// the file does not invalidate an applied migration.
    #[must_use]
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for statement in self.executable_up() {
            hasher.update(statement.trim().as_bytes());
            hasher.update(b"\n");
        }
        format!("{:x}", hasher.finalize())
    }

    /// Marks the script applied at `at`.
    pub fn mark_applied(&mut self, at: DateTime<Utc>) {
        self.applied = true;
        self.applied_at = Some(at);
    }

    /// Marks the script reverted.
    pub fn mark_reverted(&mut self) {
        self.applied = false;
    }
}

/// `-- Change <n>: <description>`.
#[must_use]
pub fn change_marker(n: usize, description: &str) -> String {
    format!("{CHANGE_MARKER}{n}: {description}")
}

/// `-- Revert <n>: <description>`.
#[must_use]
pub fn revert_marker(n: usize, description: &str) -> String {
    format!("{REVERT_MARKER}{n}: {description}")
}

fn marker_number(statement: &str, marker: &str) -> Option<usize> {
    let (number, _) = statement.trim().strip_prefix(marker)?.split_once(':')?;
    number.trim().parse().ok()
}

fn blocks<'a>(statements: &'a [String], marker: &str) -> Vec<ScriptBlock<'a>> {
    let mut blocks = vec![ScriptBlock {
        change: None,
        statements: Vec::new(),
    }];
    for statement in statements {
        if let Some(n) = marker_number(statement, marker) {
            blocks.push(ScriptBlock {
                change: Some(n),
                statements: Vec::new(),
            });
        } else if is_executable(statement) {
            if let Some(block) = blocks.last_mut() {
                block.statements.push(statement.as_str());
            }
        }
    }
    blocks.retain(|b| b.change.is_some() || !b.statements.is_empty());
    blocks
}

/// Orders versions numerically when both are all digits, lexically otherwise.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let numeric = |v: &str| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit());
    if numeric(a) && numeric(b) {
        let a = a.trim_start_matches('0');
        let b = b.trim_start_matches('0');
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    } else {
        a.cmp(b)
    }
}

/// Lower-cases `description` and collapses runs of non-alphanumeric
/// characters into single underscores.
#[must_use]
pub fn sanitize_description(description: &str) -> String {
    let mut out = String::with_capacity(description.len());
    let mut pending_separator = false;
    for ch in description.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_separator && !out.is_empty() {
                out.push('_');
            }
            pending_separator = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_separator = true;
        }
    }
    if out.is_empty() {
        out.push_str("unnamed");
    }
    out
}

/// Returns true for statements that reach the database: not blank, not a
/// `--` comment and not a transaction marker.
#[must_use]
pub fn is_executable(statement: &str) -> bool {
    let trimmed = statement.trim();
    !trimmed.is_empty() && !trimmed.starts_with("--") && !is_transaction_marker(trimmed)
}

/// Returns true for BEGIN / START TRANSACTION / COMMIT / ROLLBACK.
#[must_use]
pub fn is_transaction_marker(statement: &str) -> bool {
    let normalized = statement
        .trim()
        .trim_end_matches(';')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase();
    matches!(
        normalized.as_str(),
        "BEGIN"
            | "BEGIN TRANSACTION"
            | "BEGIN WORK"
            | "START TRANSACTION"
            | "COMMIT"
            | "COMMIT TRANSACTION"
            | "COMMIT WORK"
            | "END"
            | "ROLLBACK"
    )
}
