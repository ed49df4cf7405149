#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! CLI for administering the mail host over SSH

use clap::{Args as ClapArgs, Parser, Subcommand};
use mailhub_admin::antispam::{AntispamConfig, LogEntry};
use mailhub_admin::audit::AuditEntry;
use mailhub_admin::{AdminConfig, Antispam, AuditLog, Auditor, Domain, MailAdmin, Mailbox, SshConnection};
use serde::Serialize;
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

const PASSWORD_ENV: &str = "MAILHUB_PASSWORD";

#[derive(Parser)]
#[command(name = "mailhub-cli")]
#[command(about = "Manage Postfix, Dovecot and Rspamd on the mail host over SSH")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Name recorded in the audit log
    #[arg(long, global = true, default_value = "cli")]
    actor: String,
}

#[derive(Subcommand)]
enum Command {
    /// Check that the mail host and Rspamd are reachable
    Check,

    /// Manage virtual domains
    Domains {
        #[command(subcommand)]
        command: DomainCommand,
    },

    /// Manage mailboxes
    Mailboxes {
        #[command(subcommand)]
        command: MailboxCommand,
    },

    /// Inspect and control Rspamd
    Antispam {
        #[command(subcommand)]
        command: AntispamCommand,
    },

    /// Show recent audit log entries
    Audit {
        /// Maximum number of entries to show
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum DomainCommand {
    /// List domains with their mailbox counts
    List,
    /// Add a domain
    Add { name: String },
    /// Delete a domain and all of its mailboxes
    Delete { name: String },
}

#[derive(Subcommand)]
enum MailboxCommand {
    /// List mailboxes of a domain
    List { domain: String },
    /// Create a mailbox. The password (at least 8 characters) is read
    /// from `MAILHUB_PASSWORD`, or else from the first line of stdin.
    Add { domain: String, local_part: String },
    /// Delete a mailbox (storage is kept)
    Delete { domain: String, local_part: String },
    /// Change a mailbox password, read like `add` does
    Passwd { domain: String, local_part: String },
}

#[derive(Subcommand)]
enum AntispamCommand {
    /// Service status and resource usage
    Status,
    /// Scan counters
    Metrics,
    /// Current worker, feature and Redis settings
    Config,
    /// Rewrite the worker settings and reload
    SetConfig(WorkerSettings),
    /// Show the sender whitelist
    Whitelist,
    /// Add a whitelist entry (domain pattern, email or IP)
    Allow { entry: String },
    /// Remove a whitelist entry
    Disallow { entry: String },
    /// Show recent log lines
    Logs {
        #[arg(long, default_value = "50")]
        lines: usize,
    },
    /// Start Rspamd
    Start,
    /// Stop Rspamd
    Stop,
    /// Restart Rspamd
    Restart,
    /// Reload Rspamd configuration
    Reload,
    /// Print status, metrics and config as JSON
    Export,
}

#[derive(ClapArgs)]
struct WorkerSettings {
    #[arg(long)]
    max_tasks: Option<u32>,
    #[arg(long)]
    count: Option<u32>,
    /// Task timeout in seconds
    #[arg(long)]
    timeout: Option<u32>,
}

struct App {
    mail: MailAdmin,
    antispam: Antispam,
    audit: Arc<AuditLog>,
    json: bool,
    actor: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = AdminConfig::from_env()?;

    let audit = Arc::new(AuditLog::open(&config.audit_path).await?);
    let auditor = Auditor::new(audit.clone());
    let connection = Arc::new(SshConnection::new(config.ssh));

    let app = App {
        mail: MailAdmin::new(connection.clone(), auditor.clone()),
        antispam: Antispam::new(connection.clone(), auditor),
        audit,
        json: args.json,
        actor: args.actor,
    };

    let result = match args.command {
        Command::Check => cmd_check(&app).await,
        Command::Domains { command } => cmd_domains(&app, command).await,
        Command::Mailboxes { command } => cmd_mailboxes(&app, command).await,
        Command::Antispam { command } => cmd_antispam(&app, command).await,
        Command::Audit { limit } => cmd_audit(&app, limit).await,
    };

    if let Err(e) = connection.close().await {
        warn!("Failed to close SSH connection: {}", e);
    }

    result
}

async fn cmd_check(app: &App) -> anyhow::Result<()> {
    app.mail.test_connection().await?;
    println!("Mail host: reachable");

    match app.antispam.test_connection().await {
        Ok(()) => println!("Rspamd:    running"),
        Err(e) => {
            warn!("Rspamd check failed: {}", e);
            println!("Rspamd:    not running");
        }
    }

    Ok(())
}

async fn cmd_domains(app: &App, command: DomainCommand) -> anyhow::Result<()> {
    match command {
        DomainCommand::List => {
            let domains = app.mail.list_domains().await?;
            if app.json {
                print_json(&domains)?;
            } else {
                print_domain_table(&domains);
            }
        }
        DomainCommand::Add { name } => {
            let name = app.mail.add_domain(&app.actor, &name).await?;
            println!("Added domain {name}");
        }
        DomainCommand::Delete { name } => {
            app.mail.delete_domain(&app.actor, &name).await?;
            println!("Deleted domain {}", name.trim().to_lowercase());
        }
    }
    Ok(())
}

async fn cmd_mailboxes(app: &App, command: MailboxCommand) -> anyhow::Result<()> {
    match command {
        MailboxCommand::List { domain } => {
            let mailboxes = app.mail.list_mailboxes(&domain).await?;
            if app.json {
                print_json(&mailboxes)?;
            } else {
                print_mailbox_table(&mailboxes);
            }
        }
        MailboxCommand::Add { domain, local_part } => {
            let password = read_password().await?;
            let mailbox = app
                .mail
                .add_mailbox(&app.actor, &domain, &local_part, &password)
                .await?;
            println!("Created mailbox {}", mailbox.email);
        }
        MailboxCommand::Delete { domain, local_part } => {
            app.mail
                .delete_mailbox(&app.actor, &domain, &local_part)
                .await?;
            println!("Deleted mailbox {local_part}@{domain}");
        }
        MailboxCommand::Passwd { domain, local_part } => {
            let password = read_password().await?;
            app.mail
                .change_password(&app.actor, &domain, &local_part, &password)
                .await?;
            println!("Password changed for {local_part}@{domain}");
        }
    }
    Ok(())
}

/// Mailbox password from `MAILHUB_PASSWORD` or the first line of stdin,
/// so it never appears in argv.
async fn read_password() -> anyhow::Result<String> {
    if let Ok(password) = env::var(PASSWORD_ENV)
        && !password.is_empty()
    {
        return Ok(password);
    }

    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    let password = line.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        anyhow::bail!("no password given: set {PASSWORD_ENV} or pipe it on stdin");
    }
    Ok(password.to_string())
}

async fn cmd_antispam(app: &App, command: AntispamCommand) -> anyhow::Result<()> {
    let spam = &app.antispam;
    match command {
        AntispamCommand::Status => {
            let status = spam.status().await?;
            if app.json {
                print_json(&status)?;
            } else {
                println!("Running: {}", if status.is_running { "yes" } else { "no" });
                println!("Version: {}", or_dash(&status.version));
                println!(
                    "PID:     {}",
                    status.process_id.map_or_else(|| "-".to_string(), |p| p.to_string())
                );
                println!("Memory:  {}", or_dash(&status.memory));
                println!("CPU:     {}", or_dash(&status.cpu));
                println!("Uptime:  {}", or_dash(&status.uptime));
            }
        }
        AntispamCommand::Metrics => {
            let m = spam.metrics().await?;
            if app.json {
                print_json(&m)?;
            } else {
                println!("Messages: {}", m.message_count);
                println!("Spam:     {} ({:.1}%)", m.spam_count, m.spam_percentage);
                println!("Ham:      {}", m.ham_count);
                println!("Learned:  {}", m.learned);
            }
        }
        AntispamCommand::Config => {
            let cfg = spam.config().await?;
            if app.json {
                print_json(&cfg)?;
            } else {
                print_antispam_config(&cfg);
            }
        }
        AntispamCommand::SetConfig(settings) => {
            let mut cfg = spam.config().await?;
            if let Some(v) = settings.max_tasks {
                cfg.worker_max_tasks = v;
            }
            if let Some(v) = settings.count {
                cfg.worker_count = v;
            }
            if let Some(v) = settings.timeout {
                cfg.worker_timeout = v;
            }
            spam.update_config(&app.actor, &cfg).await?;
            println!("Worker configuration updated, Rspamd reloaded");
        }
        AntispamCommand::Whitelist => {
            let list = spam.whitelist().await?;
            if app.json {
                print_json(&list)?;
            } else {
                print_section("Domains", &list.domains);
                print_section("Emails", &list.emails);
                print_section("IPs", &list.ips);
            }
        }
        AntispamCommand::Allow { entry } => {
            spam.add_to_whitelist(&app.actor, &entry).await?;
            println!("Whitelisted {}", entry.trim());
        }
        AntispamCommand::Disallow { entry } => {
            spam.remove_from_whitelist(&app.actor, &entry).await?;
            println!("Removed {} from whitelist", entry.trim());
        }
        AntispamCommand::Logs { lines } => {
            let entries = spam.logs(lines).await?;
            if app.json {
                print_json(&entries)?;
            } else {
                print_log_entries(&entries);
            }
        }
        AntispamCommand::Start => {
            spam.start(&app.actor).await?;
            println!("Rspamd started");
        }
        AntispamCommand::Stop => {
            spam.stop(&app.actor).await?;
            println!("Rspamd stopped");
        }
        AntispamCommand::Restart => {
            spam.restart(&app.actor).await?;
            println!("Rspamd restarted");
        }
        AntispamCommand::Reload => {
            spam.control(&app.actor, mailhub_admin::antispam::ServiceAction::Reload)
                .await?;
            println!("Rspamd reloaded");
        }
        AntispamCommand::Export => {
            println!("{}", spam.export_json().await?);
        }
    }
    Ok(())
}

async fn cmd_audit(app: &App, limit: usize) -> anyhow::Result<()> {
    let entries = app.audit.entries(limit).await?;
    if app.json {
        print_json(&entries)?;
    } else {
        print_audit_table(&entries);
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_domain_table(domains: &[Domain]) {
    if domains.is_empty() {
        println!("No domains found.");
        return;
    }

    println!("{:<40} {}", "Domain", "Mailboxes");
    println!("{}", "-".repeat(52));
    for d in domains {
        println!("{:<40} {}", truncate(&d.name, 38), d.mailbox_count);
    }
    println!("\n{} domain(s)", domains.len());
}

fn print_mailbox_table(mailboxes: &[Mailbox]) {
    if mailboxes.is_empty() {
        println!("No mailboxes found.");
        return;
    }

    for m in mailboxes {
        println!("{}", m.email);
    }
    println!("\n{} mailbox(es)", mailboxes.len());
}

fn print_antispam_config(cfg: &AntispamConfig) {
    println!("Worker max tasks: {}", cfg.worker_max_tasks);
    println!("Worker count:     {}", cfg.worker_count);
    println!("Worker timeout:   {}s", cfg.worker_timeout);
    println!("Redis memory:     {}", cfg.redis_memory);
    println!("SPF:              {}", on_off(cfg.spf_enabled));
    println!("DKIM:             {}", on_off(cfg.dkim_enabled));
    println!("SURBL:            {}", on_off(cfg.surbl_enabled));
    println!("Fuzzy:            {}", on_off(cfg.fuzzy_enabled));
}

fn print_section(title: &str, entries: &[String]) {
    println!("{title}:");
    if entries.is_empty() {
        println!("  (none)");
    }
    for e in entries {
        println!("  {e}");
    }
}

fn print_log_entries(entries: &[LogEntry]) {
    if entries.is_empty() {
        println!("No log entries.");
        return;
    }
    for e in entries {
        println!("{:<5} {}", e.level, truncate(&e.message, 160));
    }
}

fn print_audit_table(entries: &[AuditEntry]) {
    if entries.is_empty() {
        println!("No audit entries.");
        return;
    }

    println!(
        "{:<6} {:<20} {:<16} {:<22} {:<30} {}",
        "ID", "Time", "Actor", "Action", "Target", "Status"
    );
    println!("{}", "-".repeat(104));
    for e in entries {
        println!(
            "{:<6} {:<20} {:<16} {:<22} {:<30} {}",
            e.id,
            e.timestamp.format("%Y-%m-%d %H:%M:%S"),
            truncate(&e.actor, 14),
            e.action,
            truncate(&e.target, 28),
            e.status,
        );
    }
}

const fn on_off(enabled: bool) -> &'static str {
    if enabled { "enabled" } else { "disabled" }
}

fn or_dash(s: &str) -> &str {
    if s.is_empty() { "-" } else { s }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}
