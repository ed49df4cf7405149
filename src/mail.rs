//! Domain and mailbox lifecycle on the Postfix/Dovecot host
//!
//! Every workflow is a fixed sequence of remote file edits followed by
//! the service reload that activates them. There is no transaction:
//! when a step of an add workflow fails, the records it already
//! appended are removed again on a best-effort basis and the original
//! error is returned. Delete workflows stop at the first failure.

use crate::audit::Auditor;
use crate::error::{Error, Result};
use crate::records::{LinePattern, RecordStore};
use crate::remote::Remote;
use crate::validate::{normalize_domain, normalize_local_part, validate_secret};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Domains accepted by Postfix (`virtual_mailbox_domains`).
pub const VIRTUAL_DOMAINS_FILE: &str = "/etc/postfix/virtual_domains";
/// Address to maildir routing map (`virtual_mailbox_maps`).
pub const VIRTUAL_MAILBOX_FILE: &str = "/etc/postfix/virtual_mailbox";
/// Alias map (`virtual_alias_maps`).
pub const VIRTUAL_ALIAS_FILE: &str = "/etc/postfix/virtual_alias";
/// Dovecot passwd-file with one credential per line.
pub const DOVECOT_USERS_FILE: &str = "/etc/dovecot/users";
/// Root of the per-domain maildir trees.
pub const MAILBOX_BASE: &str = "/var/mail/vhosts";
/// uid:gid owning the maildirs.
pub const VMAIL_OWNER: &str = "5000:5000";

const POSTFIX_RELOAD: &str = "postfix reload";
const DOVECOT_RELOAD: &str = "doveadm reload";

/// A mail domain and the number of mailboxes routed to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Domain {
    pub name: String,
    pub mailbox_count: usize,
}

/// A mailbox address split into its parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mailbox {
    pub email: String,
    pub local_part: String,
    pub domain: String,
}

impl Mailbox {
    fn new(local_part: &str, domain: &str) -> Self {
        Self {
            email: format!("{local_part}@{domain}"),
            local_part: local_part.to_string(),
            domain: domain.to_string(),
        }
    }

    /// Parse the address field of a routing record.
    fn from_record(line: &str) -> Option<Self> {
        let email = line.split_whitespace().next()?;
        let (local, domain) = email.split_once('@')?;
        if local.is_empty() || domain.is_empty() {
            return None;
        }
        Some(Self::new(local, domain))
    }

    fn routing_record(&self) -> String {
        format!("{}    {}/{}/", self.email, self.domain, self.local_part)
    }

    fn credential_key(&self) -> String {
        format!("{}:", self.email)
    }

    fn maildir(&self) -> String {
        format!("{MAILBOX_BASE}/{}/{}", self.domain, self.local_part)
    }
}

/// Credential line in Dovecot passwd-file format. The secret is stored
/// with the `{PLAIN}` scheme the deployed Dovecot expects.
fn credential_record(mailbox: &Mailbox, secret: &str) -> String {
    format!("{}{{PLAIN}}{secret}", mailbox.credential_key())
}

/// Domain and mailbox administration over a [`Remote`].
#[derive(Clone)]
pub struct MailAdmin {
    store: RecordStore,
    auditor: Auditor,
}

impl MailAdmin {
    #[must_use]
    pub fn new(remote: Arc<dyn Remote>, auditor: Auditor) -> Self {
        Self {
            store: RecordStore::new(remote),
            auditor,
        }
    }

    /// All domains, sorted by name, with their mailbox counts.
    ///
    /// An unreadable mailbox map counts as empty.
    ///
    /// # Errors
    ///
    /// Fails if the domains file cannot be read.
    pub async fn list_domains(&self) -> Result<Vec<Domain>> {
        let names = self
            .store
            .records(VIRTUAL_DOMAINS_FILE)
            .await
            .map_err(|e| e.context("failed to read domains"))?;

        let routing = match self.store.records(VIRTUAL_MAILBOX_FILE).await {
            Ok(records) => records,
            Err(e) => {
                warn!("Could not read mailbox map, counting zero mailboxes: {}", e);
                Vec::new()
            }
        };

        let mut counts: HashMap<String, usize> = HashMap::new();
        for mailbox in routing.iter().filter_map(|r| Mailbox::from_record(r)) {
            *counts.entry(mailbox.domain.to_ascii_lowercase()).or_default() += 1;
        }

        let mut domains: Vec<Domain> = names
            .into_iter()
            .map(|name| Domain {
                mailbox_count: counts.get(&name.to_ascii_lowercase()).copied().unwrap_or(0),
                name,
            })
            .collect();
        domains.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(domains)
    }

    /// Mailboxes routed to `domain`, sorted by local part.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a malformed domain, or the
    /// remote error if the mailbox map cannot be read.
    pub async fn list_mailboxes(&self, domain: &str) -> Result<Vec<Mailbox>> {
        let domain = normalize_domain(domain)?;
        self.mailboxes_of(&domain).await
    }

    /// Declare a new domain and create its maildir root.
    ///
    /// Returns the normalized domain name.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for a malformed name, [`Error::Conflict`] if
    /// the domain is already declared, otherwise the first remote error.
    pub async fn add_domain(&self, actor: &str, name: &str) -> Result<String> {
        let result = self.create_domain(name).await;
        self.auditor.outcome(actor, "add_domain", name.trim(), &result).await;
        result
    }

    /// Delete a domain, every mailbox routed to it, and its maildir root.
    ///
    /// Mailboxes are deleted one by one before the domain itself. The
    /// first mailbox that fails to delete aborts the workflow.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for a malformed name, otherwise the first
    /// remote error.
    pub async fn delete_domain(&self, actor: &str, name: &str) -> Result<()> {
        let result = self.remove_domain(actor, name).await;
        self.auditor.outcome(actor, "delete_domain", name.trim(), &result).await;
        result
    }

    /// Create a mailbox: routing record, maildir, credential, reloads.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for a malformed local part or a short
    /// secret (no remote command is sent), [`Error::NotFound`] if the
    /// domain is not declared, [`Error::Conflict`] if the mailbox exists,
    /// otherwise the first remote error.
    pub async fn add_mailbox(&self, actor: &str, domain: &str, local: &str, secret: &str) -> Result<Mailbox> {
        let result = self.create_mailbox(domain, local, secret).await;
        let target = format!("{}@{}", local.trim(), domain.trim());
        self.auditor.outcome(actor, "add_mailbox", &target, &result).await;
        result
    }

    /// Remove a mailbox's credential, routing and alias records.
    ///
    /// The maildir is left on disk so no mail is destroyed.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for malformed input, otherwise the first
    /// remote error. Alias cleanup failures are ignored.
    pub async fn delete_mailbox(&self, actor: &str, domain: &str, local: &str) -> Result<()> {
        let result = self.remove_mailbox(domain, local).await;
        let target = format!("{}@{}", local.trim(), domain.trim());
        self.auditor.outcome(actor, "delete_mailbox", &target, &result).await;
        result
    }

    /// Replace a mailbox's credential in place and reload Dovecot.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for malformed input or a short secret,
    /// [`Error::NotFound`] if there is no credential for the mailbox,
    /// otherwise the first remote error.
    pub async fn change_password(&self, actor: &str, domain: &str, local: &str, secret: &str) -> Result<()> {
        let result = self.rotate_secret(domain, local, secret).await;
        let target = format!("{}@{}", local.trim(), domain.trim());
        self.auditor.outcome(actor, "change_password", &target, &result).await;
        result
    }

    /// Check that the mail host answers a trivial command.
    ///
    /// # Errors
    ///
    /// Returns the remote error, or [`Error::Connection`] if the host
    /// answered with nothing.
    pub async fn test_connection(&self) -> Result<()> {
        let hostname = self
            .store
            .remote()
            .execute("hostname")
            .await
            .map_err(|e| e.context("connection test failed"))?;

        if hostname.is_empty() {
            return Err(Error::Connection("empty response from server".into()));
        }
        info!("Mail host {} reachable", hostname);
        Ok(())
    }

    // -- workflows --

    async fn create_domain(&self, name: &str) -> Result<String> {
        let domain = normalize_domain(name)?;

        if self.domain_declared(&domain).await? {
            return Err(Error::Conflict(format!("domain already exists: {domain}")));
        }

        self.store
            .append_line(VIRTUAL_DOMAINS_FILE, &domain)
            .await
            .map_err(|e| e.context("failed to add domain"))?;

        let mut undo = Compensation::new(&self.store);
        undo.delete_line(VIRTUAL_DOMAINS_FILE, LinePattern::Exact(domain.clone()), false);

        let steps = async {
            let maildir = format!("{MAILBOX_BASE}/{domain}");
            let mkdir = format!("mkdir -p {maildir}");
            let chown = format!("chown {VMAIL_OWNER} {maildir}");
            self.privileged_chain(&[mkdir.as_str(), chown.as_str()])
                .await
                .map_err(|e| e.context("failed to create maildir"))?;

            self.privileged(POSTFIX_RELOAD)
                .await
                .map_err(|e| e.context("failed to reload postfix"))?;
            Ok::<(), Error>(())
        }
        .await;

        if let Err(e) = steps {
            undo.rollback().await;
            return Err(e);
        }

        info!("Added domain {}", domain);
        Ok(domain)
    }

    async fn remove_domain(&self, actor: &str, name: &str) -> Result<()> {
        let domain = normalize_domain(name)?;

        // Records are deleted by their exact address, whatever its case
        // or charset, so none survive the domain.
        for mailbox in self.mailboxes_of(&domain).await? {
            let result = self.remove_mailbox_records(&mailbox).await;
            self.auditor
                .outcome(actor, "delete_mailbox", &mailbox.email, &result)
                .await;
            result.map_err(|e| e.context(&format!("failed to delete user {}", mailbox.email)))?;
        }

        self.store
            .delete_matching_lines(VIRTUAL_DOMAINS_FILE, &LinePattern::Exact(domain.clone()))
            .await
            .map_err(|e| e.context("failed to remove domain"))?;

        self.privileged(&format!("rm -rf {MAILBOX_BASE}/{domain}"))
            .await
            .map_err(|e| e.context("failed to remove maildir"))?;

        self.privileged(POSTFIX_RELOAD)
            .await
            .map_err(|e| e.context("failed to reload postfix"))?;

        info!("Deleted domain {}", domain);
        Ok(())
    }

    async fn create_mailbox(&self, domain: &str, local: &str, secret: &str) -> Result<Mailbox> {
        let domain = normalize_domain(domain)?;
        let local = normalize_local_part(local)?;
        validate_secret(secret)?;
        let mailbox = Mailbox::new(&local, &domain);

        if !self.domain_declared(&domain).await? {
            return Err(Error::NotFound(format!("domain not found: {domain}")));
        }
        if self.mailboxes_of(&domain).await?.iter().any(|m| m.local_part == local) {
            return Err(Error::Conflict(format!("user already exists: {}", mailbox.email)));
        }
        if self.credential_exists(&mailbox).await? {
            return Err(Error::Conflict(format!(
                "credential already exists: {}",
                mailbox.email
            )));
        }

        self.store
            .append_line(VIRTUAL_MAILBOX_FILE, &mailbox.routing_record())
            .await
            .map_err(|e| e.context("failed to add mailbox to postfix"))?;

        let mut undo = Compensation::new(&self.store);
        undo.delete_line(VIRTUAL_MAILBOX_FILE, LinePattern::Key(mailbox.email.clone()), true);

        let steps = async {
            self.postmap(VIRTUAL_MAILBOX_FILE).await?;

            let maildir = mailbox.maildir();
            let mkdir = format!("mkdir -p {maildir}");
            let chown = format!("chown -R {VMAIL_OWNER} {maildir}");
            self.privileged_chain(&[mkdir.as_str(), chown.as_str()])
                .await
                .map_err(|e| e.context("failed to create maildir"))?;

            self.store
                .append_line(DOVECOT_USERS_FILE, &credential_record(&mailbox, secret))
                .await
                .map_err(|e| e.redact(secret).context("failed to add user to dovecot"))?;
            undo.delete_line(DOVECOT_USERS_FILE, LinePattern::Prefix(mailbox.credential_key()), false);

            self.reload_mail_services().await
        }
        .await;

        if let Err(e) = steps {
            undo.rollback().await;
            return Err(e);
        }

        info!("Added mailbox {}", mailbox.email);
        Ok(mailbox)
    }

    async fn remove_mailbox(&self, domain: &str, local: &str) -> Result<()> {
        let domain = normalize_domain(domain)?;
        let local = normalize_local_part(local)?;
        self.remove_mailbox_records(&Mailbox::new(&local, &domain)).await
    }

    /// Delete the records of `mailbox` exactly as addressed, without
    /// normalizing it again.
    async fn remove_mailbox_records(&self, mailbox: &Mailbox) -> Result<()> {
        self.store
            .delete_matching_lines(DOVECOT_USERS_FILE, &LinePattern::Prefix(mailbox.credential_key()))
            .await
            .map_err(|e| e.context("failed to remove from dovecot"))?;

        self.store
            .delete_matching_lines(VIRTUAL_MAILBOX_FILE, &LinePattern::Key(mailbox.email.clone()))
            .await
            .map_err(|e| e.context("failed to remove from postfix"))?;

        // A mailbox may have no aliases, or no alias map may exist.
        match self
            .store
            .delete_matching_lines(VIRTUAL_ALIAS_FILE, &LinePattern::Destination(mailbox.email.clone()))
            .await
        {
            Ok(()) => {
                if let Err(e) = self.postmap(VIRTUAL_ALIAS_FILE).await {
                    warn!("Could not rebuild alias map: {}", e);
                }
            }
            Err(e) => warn!("Alias cleanup for {} skipped: {}", mailbox.email, e),
        }

        self.postmap(VIRTUAL_MAILBOX_FILE).await?;
        self.reload_mail_services().await?;

        info!("Deleted mailbox {}", mailbox.email);
        Ok(())
    }

    async fn rotate_secret(&self, domain: &str, local: &str, secret: &str) -> Result<()> {
        validate_secret(secret)?;
        let domain = normalize_domain(domain)?;
        let local = normalize_local_part(local)?;
        let mailbox = Mailbox::new(&local, &domain);

        if !self.credential_exists(&mailbox).await? {
            return Err(Error::NotFound(format!("user not found: {}", mailbox.email)));
        }

        self.store
            .replace_matching_line(
                DOVECOT_USERS_FILE,
                &LinePattern::Prefix(mailbox.credential_key()),
                &credential_record(&mailbox, secret),
            )
            .await
            .map_err(|e| e.redact(secret).context("failed to update password"))?;

        self.privileged(DOVECOT_RELOAD)
            .await
            .map_err(|e| e.context("failed to reload dovecot"))?;

        info!("Changed password for {}", mailbox.email);
        Ok(())
    }

    // -- private helpers --

    async fn mailboxes_of(&self, domain: &str) -> Result<Vec<Mailbox>> {
        let records = self
            .store
            .records(VIRTUAL_MAILBOX_FILE)
            .await
            .map_err(|e| e.context("failed to read mailboxes"))?;

        let mut mailboxes: Vec<Mailbox> = records
            .iter()
            .filter_map(|r| Mailbox::from_record(r))
            .filter(|m| m.domain.eq_ignore_ascii_case(domain))
            .collect();
        mailboxes.sort_by(|a, b| a.local_part.cmp(&b.local_part));
        Ok(mailboxes)
    }

    async fn domain_declared(&self, domain: &str) -> Result<bool> {
        let names = self
            .store
            .records(VIRTUAL_DOMAINS_FILE)
            .await
            .map_err(|e| e.context("failed to read domains"))?;
        Ok(names.iter().any(|n| n.eq_ignore_ascii_case(domain)))
    }

    async fn credential_exists(&self, mailbox: &Mailbox) -> Result<bool> {
        let key = mailbox.credential_key();
        let records = self
            .store
            .records(DOVECOT_USERS_FILE)
            .await
            .map_err(|e| e.context("failed to read dovecot users"))?;
        Ok(records.iter().any(|r| r.starts_with(&key)))
    }

    async fn privileged(&self, command: &str) -> Result<String> {
        let remote = self.store.remote();
        remote.execute(&remote.privileged(command)).await
    }

    async fn privileged_chain(&self, commands: &[&str]) -> Result<String> {
        let remote = self.store.remote();
        let chained = commands
            .iter()
            .map(|c| remote.privileged(c))
            .collect::<Vec<_>>()
            .join(" && ");
        remote.execute(&chained).await
    }

    async fn postmap(&self, path: &str) -> Result<()> {
        self.privileged(&format!("postmap {path}"))
            .await
            .map(drop)
            .map_err(|e| e.context("failed to postmap"))
    }

    async fn reload_mail_services(&self) -> Result<()> {
        self.privileged_chain(&[POSTFIX_RELOAD, DOVECOT_RELOAD])
            .await
            .map(drop)
            .map_err(|e| e.context("failed to reload services"))
    }
}

/// A record appended by a workflow that must be removed again if a
/// later step fails.
struct UndoStep {
    path: &'static str,
    pattern: LinePattern,
    remap: bool,
}

/// Best-effort reversal of appended records, newest first.
struct Compensation<'a> {
    store: &'a RecordStore,
    steps: Vec<UndoStep>,
}

impl<'a> Compensation<'a> {
    const fn new(store: &'a RecordStore) -> Self {
        Self {
            store,
            steps: Vec::new(),
        }
    }

    /// Remember to delete lines matching `pattern`; with `remap`, the
    /// file's lookup table is rebuilt afterwards.
    fn delete_line(&mut self, path: &'static str, pattern: LinePattern, remap: bool) {
        self.steps.push(UndoStep { path, pattern, remap });
    }

    async fn rollback(self) {
        let remote = self.store.remote();
        for step in self.steps.into_iter().rev() {
            warn!("Rolling back {} in {}", step.pattern, step.path);
            if let Err(e) = self.store.delete_matching_lines(step.path, &step.pattern).await {
                warn!("Rollback of {} failed: {}", step.path, e);
                continue;
            }
            if step.remap {
                let cmd = remote.privileged(&format!("postmap {}", step.path));
                if let Err(e) = remote.execute(&cmd).await {
                    warn!("Rollback postmap of {} failed: {}", step.path, e);
                }
            }
        }
    }
}
