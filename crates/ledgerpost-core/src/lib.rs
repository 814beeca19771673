//! Persisted state, run log, and shared types for the forwarding engine.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, FixedOffset, Local, LocalResult};
use serde::{Deserialize, Serialize};

/// Environment variable that overrides the credential stored in the config.
pub const PASSWORD_ENV: &str = "LEDGERPOST_PASSWORD";
/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "LEDGERPOST_CONFIG";

/// Subject prefix stamped on every forwarded message. Messages carrying it
/// are recognized as our own output and never forwarded again.
pub const FORWARD_SUBJECT_PREFIX: &str = "Invoice/Receipt: ";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub skip_tls_verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionEndpoint {
    pub host: String,
    pub ports: Vec<u16>,
    #[serde(default)]
    pub skip_tls_verify: bool,
}

/// Persisted engine configuration. Mutated only by cutoff advancement;
/// written back at the end of a run if any account's cutoff changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub imap: RetrievalEndpoint,
    pub smtp: SubmissionEndpoint,
    pub accounts: Vec<String>,
    #[serde(default)]
    pub password: String,
    pub recipient: String,
    #[serde(default)]
    pub cutoff_by_account: BTreeMap<String, String>,
    #[serde(default)]
    pub accounting_mailboxes: Vec<String>,
}

impl SyncConfig {
    /// First-run template written to disk so the user has something to edit.
    pub fn template() -> Self {
        Self {
            imap: RetrievalEndpoint {
                host: "127.0.0.1".to_string(),
                port: 1143,
                skip_tls_verify: false,
            },
            smtp: SubmissionEndpoint {
                host: "127.0.0.1".to_string(),
                ports: vec![1025, 1465],
                skip_tls_verify: false,
            },
            accounts: Vec::new(),
            password: std::env::var(PASSWORD_ENV).unwrap_or_default(),
            recipient: "accounting@example.com".to_string(),
            cutoff_by_account: BTreeMap::new(),
            accounting_mailboxes: vec![
                "Folders/Accounting".to_string(),
                "Labels/Accounting".to_string(),
            ],
        }
    }
}

/// Loads the config, creating the default template on first use. Fails only
/// when no credential can be resolved from the environment or the file; the
/// template is written before that check so it survives an aborted first run.
pub fn load_or_init(path: &Path) -> Result<SyncConfig> {
    load_or_init_with_env(path, std::env::var(PASSWORD_ENV).ok())
}

fn load_or_init_with_env(path: &Path, env_credential: Option<String>) -> Result<SyncConfig> {
    let mut cfg = if path.exists() {
        read_config(path)?
    } else {
        let cfg = SyncConfig::template();
        save_config(path, &cfg)?;
        log_debug(&format!("state_store wrote template {}", path.display()));
        cfg
    };

    // Accounts added by hand get a cutoff on their first load.
    let default_cutoff = yesterday_midnight_local().to_rfc3339();
    for account in &cfg.accounts {
        cfg.cutoff_by_account
            .entry(account.clone())
            .or_insert_with(|| default_cutoff.clone());
    }

    match resolve_credential(env_credential, &cfg.password) {
        Some(credential) => cfg.password = credential,
        None => bail!(
            "no credential found: set {} or add \"password\" to {}",
            PASSWORD_ENV,
            path.display()
        ),
    }
    Ok(cfg)
}

/// Reads the config without touching credentials or writing anything.
pub fn read_config(path: &Path) -> Result<SyncConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn save_config(path: &Path, cfg: &SyncConfig) -> Result<()> {
    let mut text = serde_json::to_string_pretty(cfg)?;
    text.push('\n');
    write_text_atomic(path, &text)
}

fn resolve_credential(env_value: Option<String>, stored: &str) -> Option<String> {
    if let Some(value) = env_value {
        if !value.is_empty() {
            return Some(value);
        }
    }
    if stored.is_empty() {
        None
    } else {
        Some(stored.to_string())
    }
}

pub fn config_path(override_path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path;
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    xdg_config_dir().join("ledgerpost").join("config.json")
}

pub fn run_log_path() -> PathBuf {
    xdg_state_dir().join("ledgerpost").join("run_log.jsonl")
}

pub fn xdg_config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

pub fn xdg_state_dir() -> PathBuf {
    std::env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local").join("state"))
        })
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    // Preserve ownership when updating an existing user-owned config file.
    if path.exists() {
        let mut file = fs::OpenOptions::new().write(true).truncate(true).open(path)?;
        file.write_all(content.as_bytes())?;
        return Ok(());
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content.as_bytes())?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Default cutoff for accounts that never ran: start of the previous local day.
pub fn yesterday_midnight_local() -> DateTime<Local> {
    let today = Local::now().date_naive();
    let day = today.pred_opt().unwrap_or(today);
    match day.and_hms_opt(0, 0, 0).map(|naive| naive.and_local_timezone(Local)) {
        Some(LocalResult::Single(dt)) | Some(LocalResult::Ambiguous(dt, _)) => dt,
        _ => Local::now(),
    }
}

pub fn parse_cutoff(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw).ok()
}

/// One attachment ready to forward, with the context lines for the cover body
/// and the owning message's server arrival timestamp.
#[derive(Debug, Clone)]
pub struct ForwardableAttachment {
    pub filename: String,
    pub data: Vec<u8>,
    pub subject: String,
    pub sender: String,
    pub date_header: String,
    pub received_at: DateTime<FixedOffset>,
}

pub fn forward_subject(item: &ForwardableAttachment) -> String {
    let subject = if item.subject.is_empty() {
        item.filename.as_str()
    } else {
        item.subject.as_str()
    };
    format!("{}{}", FORWARD_SUBJECT_PREFIX, subject)
}

pub fn forward_body(item: &ForwardableAttachment) -> String {
    format!(
        "Forwarding invoice/receipt.\nFrom: {}\nDate: {}\nOriginal subject: {}\n",
        item.sender, item.date_header, item.subject
    )
}

/// Maximum arrival timestamp in a batch; drives cutoff advancement, which
/// only ever looks at the prefix actually transmitted.
pub fn latest_received(items: &[ForwardableAttachment]) -> Option<DateTime<FixedOffset>> {
    items.iter().map(|item| item.received_at).max()
}

/// Terminal per-account state recorded in the run log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    NoMailbox,
    NoPdfs,
    SkippedByUser,
    SmtpFailed,
    Sent,
    PartialSend,
    RateLimited,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::NoMailbox => "no_mailbox",
            Outcome::NoPdfs => "no_pdfs",
            Outcome::SkippedByUser => "skipped_by_user",
            Outcome::SmtpFailed => "smtp_failed",
            Outcome::Sent => "sent",
            Outcome::PartialSend => "partial_send",
            Outcome::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentNote {
    pub filename: String,
    pub subject: String,
    pub sender: String,
    pub date: String,
    pub received_at: String,
}

impl From<&ForwardableAttachment> for AttachmentNote {
    fn from(item: &ForwardableAttachment) -> Self {
        Self {
            filename: item.filename.clone(),
            subject: item.subject.clone(),
            sender: item.sender.clone(),
            date: item.date_header.clone(),
            received_at: item.received_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub account: String,
    pub cutoff_used: String,
    pub new_cutoff: Option<String>,
    pub mailboxes: Vec<String>,
    pub pdfs_found: usize,
    pub pdfs_sent: usize,
    pub status: Outcome,
    pub attachments: Vec<AttachmentNote>,
}

/// One run-log line: every account's record for a single invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub ran_at: String,
    pub accounts: Vec<AccountRecord>,
}

pub fn append_run_log(path: &Path, entry: &RunLogEntry) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let line = serde_json::to_string(entry)?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{}", line)?;
    Ok(())
}

/// Last `limit` entries, oldest first. Lines that fail to parse are skipped.
pub fn read_run_log(path: &Path, limit: usize) -> Result<Vec<RunLogEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RunLogEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(err) => log_debug(&format!("run_log bad line skipped: {}", err)),
        }
    }
    let skip = entries.len().saturating_sub(limit);
    Ok(entries.split_off(skip))
}

static LOG_FILE: OnceLock<Mutex<Option<std::fs::File>>> = OnceLock::new();

pub fn log_debug(msg: &str) {
    if std::env::var("LEDGERPOST_LOG").is_err() {
        return;
    }
    let path = xdg_state_dir().join("ledgerpost").join("debug.log");
    let lock = LOG_FILE.get_or_init(|| {
        let _ = fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new("/tmp")));
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .ok();
        Mutex::new(file)
    });
    if let Ok(mut guard) = lock.lock() {
        if let Some(file) = guard.as_mut() {
            let ts = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let _ = writeln!(file, "[{}] {}", ts, msg);
        }
    }
}
