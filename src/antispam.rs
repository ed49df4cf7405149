//! Rspamd status, metrics, configuration and service control
//!
//! Nothing is cached: every query goes over the wire and is parsed from
//! process listings, the stat endpoint, config files or the log tail.

use crate::audit::Auditor;
use crate::error::{Error, Result};
use crate::records::{LinePattern, RecordStore};
use crate::remote::Remote;
use crate::validate::normalize_whitelist_entry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const RSPAMD_WORKER_CONF: &str = "/etc/rspamd/local.d/worker-normal.conf";
pub const RSPAMD_OPTIONS_CONF: &str = "/etc/rspamd/local.d/options.inc";
pub const REDIS_CONF: &str = "/etc/redis.conf";
pub const RSPAMD_WHITELIST: &str = "/etc/rspamd/spf_whitelist.txt";
pub const RSPAMD_LOG: &str = "/var/log/rspamd/rspamd.log";

const STAT_URL: &str = "http://127.0.0.1:11334/stat";
const METRICS_LOG_LINES: usize = 1000;

/// Log lines returned when the caller asks for zero.
pub const DEFAULT_LOG_LINES: usize = 50;

/// Process-level view of the Rspamd service. Fields a lookup could not
/// fill are left empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AntispamStatus {
    pub is_running: bool,
    pub version: String,
    pub memory: String,
    pub cpu: String,
    pub process_id: Option<u32>,
    pub uptime: String,
}

/// Where a metrics snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricsSource {
    Stat,
    Log,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AntispamMetrics {
    pub message_count: u64,
    pub spam_count: u64,
    pub ham_count: u64,
    pub spam_percentage: f64,
    pub learned: u64,
    pub source: MetricsSource,
}

impl AntispamMetrics {
    fn new(message_count: u64, spam_count: u64, ham_count: u64, learned: u64, source: MetricsSource) -> Self {
        Self {
            message_count,
            spam_count,
            ham_count,
            spam_percentage: spam_percentage(spam_count, message_count),
            learned,
            source,
        }
    }
}

/// Spam share in percent; zero when nothing was scanned.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn spam_percentage(spam: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        spam as f64 / total as f64 * 100.0
    }
}

/// Tunables read from the worker, options and Redis config files.
#[allow(
    clippy::struct_excessive_bools,
    reason = "one independent toggle per Rspamd check, flat in the JSON export"
)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AntispamConfig {
    pub worker_max_tasks: u32,
    pub worker_count: u32,
    pub worker_timeout: u32,
    pub redis_memory: String,
    pub spf_enabled: bool,
    pub dkim_enabled: bool,
    pub surbl_enabled: bool,
    pub fuzzy_enabled: bool,
}

impl Default for AntispamConfig {
    fn default() -> Self {
        Self {
            worker_max_tasks: 20,
            worker_count: 1,
            worker_timeout: 30,
            redis_memory: "256mb".to_string(),
            spf_enabled: true,
            dkim_enabled: true,
            surbl_enabled: true,
            fuzzy_enabled: true,
        }
    }
}

impl AntispamConfig {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("max_tasks", self.worker_max_tasks),
            ("count", self.worker_count),
            ("timeout", self.worker_timeout),
        ] {
            if value == 0 {
                return Err(Error::Validation(format!("worker {name} must be at least 1")));
            }
        }
        Ok(())
    }

    /// Full replacement content for the worker config file.
    #[must_use]
    pub fn render_worker_config(&self) -> String {
        format!(
            "# Worker configuration, managed by mailhub-admin\n\
             worker \"normal\" {{\n  \
             max_tasks = {};\n  \
             count = {};\n  \
             timeout = {}s;\n\
             }}\n",
            self.worker_max_tasks, self.worker_count, self.worker_timeout
        )
    }

    fn apply_worker_config(&mut self, content: &str) {
        for line in content.lines().map(str::trim) {
            if let Some(v) = setting(line, "max_tasks") {
                self.worker_max_tasks = v;
            } else if let Some(v) = setting(line, "count") {
                self.worker_count = v;
            } else if let Some(v) = setting(line, "timeout") {
                self.worker_timeout = v;
            }
        }
    }

    fn apply_options(&mut self, content: &str) {
        for line in content.lines().map(str::trim) {
            if line.starts_with('#') || !(line.contains("yes") || line.contains("true")) {
                continue;
            }
            if line.contains("disable_spf") {
                self.spf_enabled = false;
            }
            if line.contains("disable_dkim") {
                self.dkim_enabled = false;
            }
            if line.contains("disable_surbl") {
                self.surbl_enabled = false;
            }
            if line.contains("disable_fuzzy") {
                self.fuzzy_enabled = false;
            }
        }
    }

    fn apply_redis(&mut self, content: &str) {
        for line in content.lines().map(str::trim) {
            if let Some(rest) = line.strip_prefix("maxmemory ")
                && let Some(value) = rest.split_whitespace().next()
            {
                self.redis_memory = value.to_string();
            }
        }
    }
}

/// `key = 30s;` style setting: the leading digits after `=`.
fn setting(line: &str, key: &str) -> Option<u32> {
    let rest = line.strip_prefix(key)?.trim_start();
    let value = rest.strip_prefix('=')?.trim_start();
    let digits: String = value.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Whitelisted senders grouped by shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Whitelist {
    pub domains: Vec<String>,
    pub emails: Vec<String>,
    pub ips: Vec<String>,
}

impl Whitelist {
    fn from_records(records: &[String]) -> Self {
        let mut list = Self::default();
        for entry in records {
            if entry.contains('*') {
                list.domains.push(entry.clone());
            } else if entry.contains('@') {
                list.emails.push(entry.clone());
            } else {
                list.ips.push(entry.clone());
            }
        }
        list
    }

    #[must_use]
    pub fn contains(&self, entry: &str) -> bool {
        self.domains
            .iter()
            .chain(&self.emails)
            .chain(&self.ips)
            .any(|e| e == entry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub timestamp: Option<String>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    fn parse(line: &str) -> Self {
        let mut tokens = line.split_whitespace();
        let timestamp = match (tokens.next(), tokens.next()) {
            (Some(date), Some(time)) => Some(format!("{date} {time}")),
            _ => None,
        };

        let level = if line.contains("ERROR") || line.contains("error") {
            LogLevel::Error
        } else if line.contains("WARN") || line.contains("warn") {
            LogLevel::Warn
        } else {
            LogLevel::Info
        };

        Self {
            timestamp,
            level,
            message: line.to_string(),
        }
    }
}

/// Service-manager verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Reload,
}

impl ServiceAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Reload => "reload",
        }
    }
}

/// Everything known about the service at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct AntispamSnapshot {
    pub exported_at: DateTime<Utc>,
    pub status: AntispamStatus,
    pub metrics: AntispamMetrics,
    pub config: AntispamConfig,
}

/// Subset of the Rspamd `/stat` response.
#[derive(Debug, Default, Deserialize)]
struct StatResponse {
    #[serde(default)]
    scanned: u64,
    #[serde(default)]
    learned: u64,
    spam_count: Option<u64>,
    ham_count: Option<u64>,
    #[serde(default)]
    actions: HashMap<String, u64>,
}

impl StatResponse {
    fn into_metrics(self) -> AntispamMetrics {
        let action = |name: &str| self.actions.get(name).copied().unwrap_or(0);
        let spam = self
            .spam_count
            .unwrap_or_else(|| action("reject") + action("add header") + action("rewrite subject"));
        let ham = self.ham_count.unwrap_or_else(|| action("no action"));
        AntispamMetrics::new(self.scanned, spam, ham, self.learned, MetricsSource::Stat)
    }
}

/// Only classified lines are messages. A line mentioning both words is
/// spam, so `spam_count + ham_count == message_count` always holds.
fn metrics_from_log(content: &str) -> AntispamMetrics {
    let (mut spam, mut ham) = (0, 0);
    for line in content.lines().map(str::to_ascii_lowercase) {
        if line.contains("spam") {
            spam += 1;
        } else if line.contains("ham") {
            ham += 1;
        }
    }
    AntispamMetrics::new(spam + ham, spam, ham, 0, MetricsSource::Log)
}

/// Rspamd administration over a [`Remote`].
#[derive(Clone)]
pub struct Antispam {
    store: RecordStore,
    auditor: Auditor,
}

impl Antispam {
    #[must_use]
    pub fn new(remote: Arc<dyn Remote>, auditor: Auditor) -> Self {
        Self {
            store: RecordStore::new(remote),
            auditor,
        }
    }

    /// Whether Rspamd runs, and if so its version and resource usage.
    ///
    /// # Errors
    ///
    /// Fails only if the service-manager status query cannot be run.
    pub async fn status(&self) -> Result<AntispamStatus> {
        let output = self
            .privileged("rc-service rspamd status 2>&1 || true")
            .await
            .map_err(|e| e.context("failed to check Rspamd status"))?;

        let mut status = AntispamStatus {
            is_running: output.contains("started"),
            ..AntispamStatus::default()
        };
        if !status.is_running {
            return Ok(status);
        }

        status.version = self.try_output("rspamd --version | head -1").await;

        let ps = self
            .try_output(&format!(
                "{} | grep '[r]spamd: main' | head -1 | awk '{{print $2, $6}}'",
                self.store.remote().privileged("ps aux")
            ))
            .await;
        let mut fields = ps.split_whitespace();
        status.process_id = fields.next().and_then(|pid| pid.parse().ok());
        if let Some(rss) = fields.next() {
            status.memory = format_rss(rss);
        }

        let cpu = self
            .try_output(&format!(
                "{} | grep rspamd | head -1 | awk '{{print $9}}'",
                self.store.remote().privileged("top -bn 1")
            ))
            .await;
        if !cpu.is_empty() {
            status.cpu = format!("{cpu}%");
        }

        if let Some(pid) = status.process_id {
            status.uptime = self.try_output(&format!("ps -o etime= -p {pid}")).await;
        }

        Ok(status)
    }

    /// Scan counters from the stat endpoint, or estimated from the log.
    ///
    /// # Errors
    ///
    /// Fails if neither the stat endpoint nor the log can be read.
    pub async fn metrics(&self) -> Result<AntispamMetrics> {
        let stat = self
            .store
            .remote()
            .execute(&format!("wget -q -O - {STAT_URL}"))
            .await
            .and_then(|body| serde_json::from_str::<StatResponse>(&body).map_err(Error::from));

        match stat {
            Ok(stat) => Ok(stat.into_metrics()),
            Err(e) => {
                debug!("Stat endpoint unavailable, falling back to log: {}", e);
                let tail = self
                    .privileged(&format!("tail -n {METRICS_LOG_LINES} {RSPAMD_LOG}"))
                    .await
                    .map_err(|e| e.context("failed to read Rspamd logs"))?;
                Ok(metrics_from_log(&tail))
            }
        }
    }

    /// Current tunables; files that cannot be read keep their defaults.
    ///
    /// # Errors
    ///
    /// Never fails today; the `Result` leaves room for stricter parsing.
    pub async fn config(&self) -> Result<AntispamConfig> {
        let mut config = AntispamConfig::default();

        match self.store.read_all(RSPAMD_WORKER_CONF).await {
            Ok(content) => config.apply_worker_config(&content),
            Err(e) => warn!("Using default worker settings: {}", e),
        }
        match self.store.read_all(RSPAMD_OPTIONS_CONF).await {
            Ok(content) => config.apply_options(&content),
            Err(e) => warn!("Using default feature toggles: {}", e),
        }
        match self.store.read_all(REDIS_CONF).await {
            Ok(content) => config.apply_redis(&content),
            Err(e) => warn!("Using default Redis memory limit: {}", e),
        }

        Ok(config)
    }

    /// Rewrite the worker config from `config` and reload Rspamd.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for zero-valued worker settings, otherwise
    /// the first remote error.
    pub async fn update_config(&self, actor: &str, config: &AntispamConfig) -> Result<()> {
        let result = async {
            config.validate()?;
            self.store
                .overwrite(RSPAMD_WORKER_CONF, &config.render_worker_config())
                .await
                .map_err(|e| e.context("failed to update worker config"))?;
            self.service(ServiceAction::Reload).await
        }
        .await;
        self.auditor
            .outcome(actor, "update_antispam_config", RSPAMD_WORKER_CONF, &result)
            .await;
        result
    }

    /// Whitelist entries grouped into domain patterns, emails and IPs.
    ///
    /// # Errors
    ///
    /// Fails if the whitelist file cannot be read.
    pub async fn whitelist(&self) -> Result<Whitelist> {
        let records = self
            .store
            .records(RSPAMD_WHITELIST)
            .await
            .map_err(|e| e.context("failed to read whitelist"))?;
        Ok(Whitelist::from_records(&records))
    }

    /// Append an entry to the whitelist.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for an empty or multi-token entry,
    /// [`Error::Conflict`] if it is already listed.
    pub async fn add_to_whitelist(&self, actor: &str, entry: &str) -> Result<()> {
        let result = async {
            let entry = normalize_whitelist_entry(entry)?;
            let inserted = self
                .store
                .insert_if_absent(RSPAMD_WHITELIST, &entry, |r| r == entry)
                .await
                .map_err(|e| e.context("failed to add to whitelist"))?;
            if !inserted {
                return Err(Error::Conflict(format!("entry already in whitelist: {entry}")));
            }
            info!("Whitelisted {}", entry);
            Ok::<(), Error>(())
        }
        .await;
        self.auditor
            .outcome(actor, "whitelist_add", entry.trim(), &result)
            .await;
        result
    }

    /// Remove every line equal to `entry` from the whitelist.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for an empty entry, otherwise the remote error.
    pub async fn remove_from_whitelist(&self, actor: &str, entry: &str) -> Result<()> {
        let result = async {
            let entry = normalize_whitelist_entry(entry)?;
            self.store
                .delete_matching_lines(RSPAMD_WHITELIST, &LinePattern::Exact(entry))
                .await
                .map_err(|e| e.context("failed to remove from whitelist"))
        }
        .await;
        self.auditor
            .outcome(actor, "whitelist_remove", entry.trim(), &result)
            .await;
        result
    }

    /// The last `lines` lines of the Rspamd log, classified by level.
    ///
    /// # Errors
    ///
    /// Fails if the log cannot be read.
    pub async fn logs(&self, lines: usize) -> Result<Vec<LogEntry>> {
        let lines = if lines == 0 { DEFAULT_LOG_LINES } else { lines };
        let tail = self
            .privileged(&format!("tail -n {lines} {RSPAMD_LOG}"))
            .await
            .map_err(|e| e.context("failed to read logs"))?;

        Ok(tail
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(LogEntry::parse)
            .collect())
    }

    /// Run a service-manager verb against Rspamd.
    ///
    /// # Errors
    ///
    /// Returns the remote error on a non-zero exit.
    pub async fn control(&self, actor: &str, action: ServiceAction) -> Result<()> {
        let result = self.service(action).await;
        self.auditor
            .outcome(actor, &format!("antispam_{}", action.as_str()), "rspamd", &result)
            .await;
        result
    }

    /// # Errors
    ///
    /// See [`control`](Self::control).
    pub async fn start(&self, actor: &str) -> Result<()> {
        self.control(actor, ServiceAction::Start).await
    }

    /// # Errors
    ///
    /// See [`control`](Self::control).
    pub async fn stop(&self, actor: &str) -> Result<()> {
        self.control(actor, ServiceAction::Stop).await
    }

    /// # Errors
    ///
    /// See [`control`](Self::control).
    pub async fn restart(&self, actor: &str) -> Result<()> {
        self.control(actor, ServiceAction::Restart).await
    }

    /// Status, metrics and config in one snapshot.
    ///
    /// # Errors
    ///
    /// Fails if any of the three queries fails.
    pub async fn export(&self) -> Result<AntispamSnapshot> {
        Ok(AntispamSnapshot {
            exported_at: Utc::now(),
            status: self.status().await?,
            metrics: self.metrics().await?,
            config: self.config().await?,
        })
    }

    /// [`export`](Self::export) as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Fails if the export fails.
    pub async fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export().await?)?)
    }

    /// Check that the service manager reports Rspamd as started.
    ///
    /// # Errors
    ///
    /// Returns the remote error if Rspamd is not running.
    pub async fn test_connection(&self) -> Result<()> {
        self.privileged("rc-service rspamd status | grep -q started")
            .await
            .map(drop)
    }

    // -- private helpers --

    async fn service(&self, action: ServiceAction) -> Result<()> {
        self.privileged(&format!("rc-service rspamd {}", action.as_str()))
            .await
            .map_err(|e| e.context(&format!("failed to {} Rspamd", action.as_str())))?;
        info!("Rspamd {} done", action.as_str());
        Ok(())
    }

    async fn privileged(&self, command: &str) -> Result<String> {
        let remote = self.store.remote();
        remote.execute(&remote.privileged(command)).await
    }

    /// Run a best-effort lookup; failures yield an empty string.
    async fn try_output(&self, command: &str) -> String {
        match self.store.remote().execute(command).await {
            Ok(out) => out.trim().to_string(),
            Err(e) => {
                debug!("Status lookup `{}` failed: {}", command, e);
                String::new()
            }
        }
    }
}

/// `ps` RSS (KiB) as a short human-readable size.
#[allow(clippy::cast_precision_loss)]
fn format_rss(kib: &str) -> String {
    match kib.parse::<u64>() {
        Ok(k) if k >= 1024 => format!("{:.1} MB", k as f64 / 1024.0),
        Ok(k) => format!("{k} KB"),
        Err(_) => kib.to_string(),
    }
}
