//! Remote administration of a Postfix, Dovecot and Rspamd mail host
//!
//! All state lives on the mail host: Postfix lookup tables, the Dovecot
//! passwd-file and the Rspamd configuration are plain text files edited
//! over SSH. [`MailAdmin`] manages virtual domains and mailboxes,
//! [`Antispam`] inspects and controls Rspamd, and both report every
//! mutation to an optional [`AuditLog`].
//!
//! Commands reach the host through the [`Remote`] trait. The production
//! implementation is [`SshConnection`], which keeps one SSH session
//! alive (optionally through a jump host) and reconnects on demand.

pub mod antispam;
pub mod audit;
mod config;
mod connection;
mod error;
pub mod mail;
pub mod records;
mod remote;
pub mod validate;

pub use antispam::Antispam;
pub use audit::{AuditLog, Auditor};
pub use config::{AdminConfig, JumpHostConfig, SshConfig};
pub use connection::{CommandOutput, SshConnection};
pub use error::{Error, Result};
pub use mail::{Domain, MailAdmin, Mailbox};
pub use remote::Remote;
