//! Remote text files as line-oriented record stores
//!
//! Postfix maps, the Dovecot users file and the Rspamd whitelist are all
//! plain text with one record per line. [`RecordStore`] reads them over
//! the [`Remote`] seam and mutates them with `tee` and `sed`, one round
//! trip per mutation. There is no locking: concurrent edits to the same
//! file race at the file level.

use crate::error::{Error, Result};
use crate::remote::Remote;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Which lines a delete or replace applies to.
///
/// Every variant holds a literal; regex metacharacters and `/` are
/// escaped when the pattern is rendered for `sed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinePattern {
    /// The whole line, ignoring trailing whitespace.
    Exact(String),
    /// Lines starting with the literal.
    Prefix(String),
    /// Lines whose first whitespace-separated field is the literal.
    Key(String),
    /// Lines whose last whitespace- or comma-separated field is the
    /// literal, as in the destination list of an alias map.
    Destination(String),
}

impl LinePattern {
    /// The pattern as a POSIX basic regular expression, safe to embed
    /// between `/` delimiters.
    #[must_use]
    pub fn to_sed(&self) -> String {
        match self {
            Self::Exact(s) => format!("^{}[[:space:]]*$", escape_regex(s)),
            Self::Prefix(s) => format!("^{}", escape_regex(s)),
            Self::Key(s) => format!("^{}[[:space:]]", escape_regex(s)),
            Self::Destination(s) => format!("[[:space:],]{}[[:space:]]*$", escape_regex(s)),
        }
    }
}

impl fmt::Display for LinePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_sed())
    }
}

/// Line-oriented access to remote text files.
#[derive(Clone)]
pub struct RecordStore {
    remote: Arc<dyn Remote>,
}

impl RecordStore {
    #[must_use]
    pub fn new(remote: Arc<dyn Remote>) -> Self {
        Self { remote }
    }

    /// The underlying remote, for commands that are not file edits.
    #[must_use]
    pub fn remote(&self) -> &dyn Remote {
        self.remote.as_ref()
    }

    /// Read a whole file, privileged first, then as the login user.
    ///
    /// # Errors
    ///
    /// Returns the remote error if neither read succeeds.
    pub async fn read_all(&self, path: &str) -> Result<String> {
        let cmd = format!(
            "{} 2>/dev/null || cat {path}",
            self.remote.privileged(&format!("cat {path}"))
        );
        self.remote.execute(&cmd).await
    }

    /// Non-blank, non-comment lines of a file, trimmed.
    ///
    /// # Errors
    ///
    /// Same as [`RecordStore::read_all`].
    pub async fn records(&self, path: &str) -> Result<Vec<String>> {
        Ok(parse_records(&self.read_all(path).await?))
    }

    /// Append exactly one line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `line` spans several lines.
    pub async fn append_line(&self, path: &str, line: &str) -> Result<()> {
        ensure_single_line(line)?;
        debug!("Appending record to {}", path);
        let cmd = format!(
            "printf '%s\\n' {} | {} > /dev/null",
            shell_quote(line),
            self.remote.privileged(&format!("tee -a {path}"))
        );
        self.remote.execute(&cmd).await.map(drop)
    }

    /// Append `line` unless a record for which `exists` returns true is
    /// already present. Returns whether the line was written.
    ///
    /// The check and the append are two round trips; a concurrent writer
    /// can slip in between.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or the append fails.
    pub async fn insert_if_absent<F>(&self, path: &str, line: &str, exists: F) -> Result<bool>
    where
        F: Fn(&str) -> bool + Send,
    {
        if self.records(path).await?.iter().any(|r| exists(r)) {
            return Ok(false);
        }
        self.append_line(path, line).await?;
        Ok(true)
    }

    /// Replace the entire contents of a file.
    ///
    /// # Errors
    ///
    /// Returns the remote error from `tee`.
    pub async fn overwrite(&self, path: &str, content: &str) -> Result<()> {
        debug!("Overwriting {}", path);
        let cmd = format!(
            "printf '%s\\n' {} | {} > /dev/null",
            shell_quote(content.trim_end_matches('\n')),
            self.remote.privileged(&format!("tee {path}"))
        );
        self.remote.execute(&cmd).await.map(drop)
    }

    /// Remove every line matching `pattern`. Matching nothing is not an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns the remote error from `sed`, e.g. for a missing file.
    pub async fn delete_matching_lines(&self, path: &str, pattern: &LinePattern) -> Result<()> {
        debug!("Deleting lines matching {} from {}", pattern, path);
        let script = format!("/{}/d", pattern.to_sed());
        let cmd = self
            .remote
            .privileged(&format!("sed -i {} {path}", shell_quote(&script)));
        self.remote.execute(&cmd).await.map(drop)
    }

    /// Replace every line matching `pattern` with `replacement`, in place.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if `replacement` spans several lines.
    pub async fn replace_matching_line(
        &self,
        path: &str,
        pattern: &LinePattern,
        replacement: &str,
    ) -> Result<()> {
        ensure_single_line(replacement)?;
        debug!("Replacing lines matching {} in {}", pattern, path);
        let script = format!(
            "s/{}.*/{}/",
            pattern.to_sed(),
            escape_replacement(replacement)
        );
        let cmd = self
            .remote
            .privileged(&format!("sed -i {} {path}", shell_quote(&script)));
        self.remote.execute(&cmd).await.map(drop)
    }
}

/// Split file content into records, skipping blanks and `#` comments.
#[must_use]
pub fn parse_records(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToString::to_string)
        .collect()
}

/// Wrap `s` in single quotes for a POSIX shell.
#[must_use]
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn escape_regex(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '/' | '.' | '*' | '[' | ']' | '^' | '$') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn escape_replacement(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '\\' | '/' | '&') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn ensure_single_line(line: &str) -> Result<()> {
    if line.contains(['\n', '\r']) {
        return Err(Error::Validation("record must be a single line".into()));
    }
    Ok(())
}
