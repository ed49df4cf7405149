//! Input normalization and validation
//!
//! Everything here runs locally, before any remote command is built.
//! Domain names and local parts end up in shell commands and `sed`
//! scripts, so the accepted character sets are deliberately narrow.

use crate::error::{Error, Result};

/// Minimum accepted length for a mailbox secret.
pub const MIN_SECRET_LEN: usize = 8;

/// Trim and case-fold a domain name, then validate it.
///
/// ```
/// use mailhub_admin::validate::normalize_domain;
///
/// assert_eq!(normalize_domain("Example.COM ").unwrap(), "example.com");
/// assert!(normalize_domain("localhost").is_err());
/// ```
///
/// # Errors
///
/// [`Error::Validation`] for a name outside 3-253 characters, without a
/// dot, with characters other than letters, digits, `.` and `-`, or
/// with an empty label.
pub fn normalize_domain(raw: &str) -> Result<String> {
    let domain = raw.trim().to_ascii_lowercase();

    if !(3..=253).contains(&domain.len()) {
        return Err(Error::Validation(format!(
            "invalid domain format: {domain} (must be 3-253 characters)"
        )));
    }
    if !domain.contains('.') {
        return Err(Error::Validation(format!(
            "invalid domain format: {domain} (missing '.')"
        )));
    }
    if !domain
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-')
    {
        return Err(Error::Validation(format!("invalid domain format: {domain}")));
    }
    if domain.starts_with(['.', '-']) || domain.ends_with(['.', '-']) || domain.contains("..") {
        return Err(Error::Validation(format!("invalid domain format: {domain}")));
    }

    Ok(domain)
}

/// Trim and case-fold a mailbox local part, then validate it.
///
/// # Errors
///
/// [`Error::Validation`] unless the result is 1-64 characters of
/// letters, digits, `.`, `_` and `-`.
pub fn normalize_local_part(raw: &str) -> Result<String> {
    let local = raw.trim().to_ascii_lowercase();

    if local.is_empty() || local.len() > 64 {
        return Err(Error::Validation(format!(
            "invalid username: {local} (must be 1-64 characters)"
        )));
    }
    if !local
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(Error::Validation(format!("invalid username: {local}")));
    }

    Ok(local)
}

/// Check a mailbox secret before it is written to the credential file.
///
/// # Errors
///
/// [`Error::Validation`] if it is shorter than [`MIN_SECRET_LEN`] or
/// contains control characters.
pub fn validate_secret(secret: &str) -> Result<()> {
    if secret.chars().count() < MIN_SECRET_LEN {
        return Err(Error::Validation(format!(
            "password must be at least {MIN_SECRET_LEN} characters"
        )));
    }
    if secret.chars().any(char::is_control) {
        return Err(Error::Validation(
            "password must not contain control characters".into(),
        ));
    }
    Ok(())
}

/// Check a whitelist entry: one non-empty token without whitespace.
///
/// # Errors
///
/// [`Error::Validation`] for an empty entry or one with inner whitespace.
pub fn normalize_whitelist_entry(raw: &str) -> Result<String> {
    let entry = raw.trim();
    if entry.is_empty() {
        return Err(Error::Validation("whitelist entry cannot be empty".into()));
    }
    if entry.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::Validation(format!(
            "whitelist entry must be a single token: {entry}"
        )));
    }
    Ok(entry.to_string())
}
