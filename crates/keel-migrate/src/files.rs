//! Migration files on disk.
//!
//! Each migration is a single `V<version>__<description>.sql` file:
//!
//! ```text
//! -- Migration: add email
//! -- Version: 20240501123000
//! -- Created: 2024-05-01T12:30:00+00:00
//!
//! -- migrate:up
//! START TRANSACTION;
//! -- Change 1: Add column email to users
//! ALTER TABLE users ADD COLUMN email VARCHAR(255) NOT NULL UNIQUE;
//! COMMIT;
//!
//! -- migrate:down
//! START TRANSACTION;
//! -- Revert 1: Add column email to users
//! ALTER TABLE users DROP COLUMN email;
//! COMMIT;
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use tracing::{debug, info};

use crate::error::{MigrateError, Result};
use crate::script::{compare_versions, MigrationScript, VERSION_FORMAT};

/// Default statement separator.
pub const DEFAULT_SEPARATOR: char = ';';

const UP_MARKER: &str = "-- migrate:up";
const DOWN_MARKER: &str = "-- migrate:down";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Header,
    Up,
    Down,
}

static FILE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^V([0-9]+)__([A-Za-z0-9_]+)\.sql$").expect("valid regex"));

/// Anything that can list migration scripts.
pub trait ScriptSource: Send + Sync {
    /// Every known script, ascending by version.
    fn load_all(&self) -> Result<Vec<MigrationScript>>;
}

impl ScriptSource for Vec<MigrationScript> {
    fn load_all(&self) -> Result<Vec<MigrationScript>> {
        let mut scripts = self.clone();
        scripts.sort_by(|a, b| compare_versions(&a.version, &b.version));
        Ok(scripts)
    }
}

/// A directory of migration files.
#[derive(Debug, Clone)]
pub struct MigrationDirectory {
    path: PathBuf,
    separator: char,
}

impl MigrationDirectory {
    /// Creates a handle on `path`. The directory does not have to exist yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            separator: DEFAULT_SEPARATOR,
        }
    }

    /// Sets the statement separator.
    #[must_use]
    pub fn with_separator(mut self, separator: char) -> Self {
        self.separator = separator;
        self
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the directory if it does not exist.
    pub fn ensure_exists(&self) -> Result<()> {
        fs::create_dir_all(&self.path)?;
        Ok(())
    }

    /// Writes a new migration file and returns its path.
    ///
    /// Never overwrites: an existing file, or any file with the same version,
    /// fails with [`MigrateError::MigrationExists`].
    pub fn write(&self, script: &MigrationScript) -> Result<PathBuf> {
        self.ensure_exists()?;
        let prefix = format!("V{}__", script.version);
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                return Err(MigrateError::MigrationExists(entry.path()));
            }
        }

        let path = self.path.join(script.file_name());
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(MigrateError::MigrationExists(path));
            }
            Err(err) => return Err(err.into()),
        };
        file.write_all(self.render(script).as_bytes())?;
        info!(path = %path.display(), "Wrote migration");
        Ok(path)
    }

    /// Renders a script in the migration file format.
    #[must_use]
    pub fn render(&self, script: &MigrationScript) -> String {
        let mut out = String::new();
        out.push_str(&format!("-- Migration: {}\n", one_line(&script.description)));
        out.push_str(&format!("-- Version: {}\n", script.version));
        out.push_str(&format!("-- Created: {}\n", script.created_at.to_rfc3339()));
        for warning in &script.warnings {
            out.push_str(&format!("-- Warning: {}\n", one_line(warning)));
        }
        out.push('\n');

        out.push_str(UP_MARKER);
        out.push('\n');
        self.render_statements(&mut out, &script.up);
        out.push('\n');
        out.push_str(DOWN_MARKER);
        out.push('\n');
        self.render_statements(&mut out, &script.down);
        out
    }

    fn render_statements(&self, out: &mut String, statements: &[String]) {
        for statement in statements {
            let statement = statement.trim();
            if statement.starts_with("--") {
                out.push_str(&one_line(statement));
            } else {
                out.push_str(statement);
                out.push(self.separator);
            }
            out.push('\n');
        }
    }

    /// Parses the content of a migration file named by `path`.
    pub fn parse(&self, path: &Path, content: &str) -> Result<MigrationScript> {
        let parse_error = |message: String| MigrateError::ParseError {
            path: path.to_path_buf(),
            message,
        };

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let captures = FILE_NAME
            .captures(&file_name)
            .ok_or_else(|| parse_error("file name must match V<version>__<description>.sql".into()))?;
        let version = captures[1].to_string();
        let mut description = captures[2].replace('_', " ");
        let mut created_at = None;
        let mut warnings = Vec::new();

        let mut header = String::new();
        let mut up_body = String::new();
        let mut down_body = String::new();
        let mut section = Section::Header;
        for line in content.lines() {
            match (line.trim(), section) {
                (UP_MARKER, Section::Header) => section = Section::Up,
                (UP_MARKER, _) => {
                    return Err(parse_error("duplicate '-- migrate:up' section".into()));
                }
                (DOWN_MARKER, Section::Up) => section = Section::Down,
                (DOWN_MARKER, _) => {
                    return Err(parse_error(
                        "'-- migrate:down' must follow '-- migrate:up'".into(),
                    ));
                }
                _ => {
                    let buffer = match section {
                        Section::Header => &mut header,
                        Section::Up => &mut up_body,
                        Section::Down => &mut down_body,
                    };
                    buffer.push_str(line);
                    buffer.push('\n');
                }
            }
        }
        if section == Section::Header {
            return Err(parse_error("missing '-- migrate:up' section".into()));
        }

        for line in header.lines() {
            let line = line.trim();
            if let Some(value) = line.strip_prefix("-- Migration:") {
                description = value.trim().to_string();
            } else if let Some(value) = line.strip_prefix("-- Version:") {
                if value.trim() != version {
                    return Err(parse_error(format!(
                        "header version {} does not match file name version {version}",
                        value.trim()
                    )));
                }
            } else if let Some(value) = line.strip_prefix("-- Created:") {
                let parsed = DateTime::parse_from_rfc3339(value.trim())
                    .map_err(|e| parse_error(format!("invalid creation time: {e}")))?;
                created_at = Some(parsed.with_timezone(&Utc));
            } else if let Some(value) = line.strip_prefix("-- Warning:") {
                warnings.push(value.trim().to_string());
            }
        }

        let created_at = match created_at {
            Some(at) => at,
            None => NaiveDateTime::parse_from_str(&version, VERSION_FORMAT)
                .map(|at| at.and_utc())
                .map_err(|_| parse_error("missing '-- Created:' header".into()))?,
        };

        let mut script = MigrationScript::new(version, description).created_at(created_at);
        script.up = split_statements(&up_body, self.separator);
        script.down = split_statements(&down_body, self.separator);
        script.warnings = warnings;
        Ok(script)
    }

    /// Reads one migration file.
    pub fn read(&self, path: &Path) -> Result<MigrationScript> {
        let content = fs::read_to_string(path)?;
        self.parse(path, &content)
    }

    /// Finds the script with the given version.
    pub fn find(&self, version: &str) -> Result<MigrationScript> {
        self.load_all()?
            .into_iter()
            .find(|s| s.version == version)
            .ok_or_else(|| MigrateError::MigrationNotFound(version.to_string()))
    }
}

impl ScriptSource for MigrationDirectory {
    fn load_all(&self) -> Result<Vec<MigrationScript>> {
        if !self.path.is_dir() {
            return Err(MigrateError::MigrationsDirNotFound(self.path.clone()));
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "sql") {
                paths.push(path);
            }
        }

        let mut scripts = Vec::with_capacity(paths.len());
        for path in paths {
            scripts.push(self.read(&path)?);
        }
        scripts.sort_by(|a, b| compare_versions(&a.version, &b.version));

        if let Some(pair) = scripts
            .windows(2)
            .find(|w| compare_versions(&w[0].version, &w[1].version).is_eq())
        {
            return Err(MigrateError::ParseError {
                path: self.path.join(pair[1].file_name()),
                message: format!("duplicate migration version {}", pair[1].version),
            });
        }

        debug!(count = scripts.len(), dir = %self.path.display(), "Loaded migrations");
        Ok(scripts)
    }
}

/// Splits SQL text into statements on `separator`.
///
/// Separators inside `'...'`, `"..."` and `` `...` `` literals or `--`
/// comments do not split. A comment line that starts a statement becomes its
/// own entry.
#[must_use]
pub fn split_statements(sql: &str, separator: char) -> Vec<String> {
    let mut statements = Vec::new();
    let mut buffer = String::new();
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();

    while let Some(ch) = chars.next() {
        if let Some(q) = quote {
            buffer.push(ch);
            if ch == q {
                quote = None;
            }
            continue;
        }

        match ch {
            '\'' | '"' | '`' => {
                quote = Some(ch);
                buffer.push(ch);
            }
            '-' if chars.peek() == Some(&'-') => {
                let mut comment = String::from("-");
                for next in chars.by_ref() {
                    if next == '\n' {
                        break;
                    }
                    comment.push(next);
                }
                if buffer.trim().is_empty() {
                    buffer.clear();
                    statements.push(comment.trim_end().to_string());
                } else {
                    buffer.push_str(&comment);
                    buffer.push('\n');
                }
            }
            c if c == separator => {
                let statement = buffer.trim();
                if !statement.is_empty() {
                    statements.push(statement.to_string());
                }
                buffer.clear();
            }
            _ => buffer.push(ch),
        }
    }

    let rest = buffer.trim();
    if !rest.is_empty() {
        statements.push(rest.to_string());
    }
    statements
}

fn one_line(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}
