//! IMAP retrieval and SMTP submission for the forwarding engine.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Datelike, FixedOffset};
use imap::{ClientBuilder, ConnectionMode};
use imap_proto::BodyStructure;
use lettre::{
    SmtpTransport, Transport,
    message::{Attachment, Mailbox, Message, MultiPart, SinglePart, header::ContentType},
    transport::smtp::{
        authentication::Credentials,
        client::{Tls, TlsParameters},
    },
};

use ledgerpost_core::{ForwardableAttachment, forward_body, forward_subject, log_debug};

const FETCH_CHUNK: usize = 200;

/// Accounting mailboxes for an account: the configured hints that exist on
/// the server (hint order preserved), otherwise every mailbox whose name
/// contains "accounting" case-insensitively. Empty means the account has no
/// accounting mailbox; the caller treats that as a terminal outcome.
pub fn resolve_accounting_mailboxes(available: &[String], hints: &[String]) -> Vec<String> {
    if !hints.is_empty() {
        let found: Vec<String> = hints
            .iter()
            .filter(|hint| available.iter().any(|name| name == *hint))
            .cloned()
            .collect();
        if !found.is_empty() {
            return found;
        }
    }
    available
        .iter()
        .filter(|name| name.to_lowercase().contains("accounting"))
        .cloned()
        .collect()
}

/// A message's structural description reduced to the fields filename
/// extraction needs: per part, the Content-Type `name` parameter and the
/// Content-Disposition `filename` parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartDescriptor {
    Part {
        name: Option<String>,
        filename: Option<String>,
    },
    Group(Vec<PartDescriptor>),
}

type Params<'a> = Option<Vec<(Cow<'a, str>, Cow<'a, str>)>>;

impl PartDescriptor {
    pub fn from_body_structure(body: &BodyStructure<'_>) -> Self {
        match body {
            BodyStructure::Multipart { bodies, .. } => PartDescriptor::Group(
                bodies
                    .iter()
                    .map(PartDescriptor::from_body_structure)
                    .collect(),
            ),
            // message/rfc822: the wrapper part can carry a filename of its
            // own and the embedded message contributes its parts too.
            BodyStructure::Message { common, body, .. } => PartDescriptor::Group(vec![
                leaf_from_common(common),
                PartDescriptor::from_body_structure(body),
            ]),
            BodyStructure::Basic { common, .. } | BodyStructure::Text { common, .. } => {
                leaf_from_common(common)
            }
        }
    }

    /// Declared ".pdf" filenames across the whole tree, deduplicated
    /// case-insensitively, first spelling wins, order preserved.
    pub fn pdf_filenames(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        self.collect_pdfs(&mut seen, &mut out);
        out
    }

    fn collect_pdfs(&self, seen: &mut HashSet<String>, out: &mut Vec<String>) {
        match self {
            PartDescriptor::Part { name, filename } => {
                for value in [filename.as_deref(), name.as_deref()].into_iter().flatten() {
                    let trimmed = value.trim();
                    if !trimmed.to_lowercase().ends_with(".pdf") {
                        continue;
                    }
                    if seen.insert(trimmed.to_lowercase()) {
                        out.push(trimmed.to_string());
                    }
                }
            }
            PartDescriptor::Group(children) => {
                for child in children {
                    child.collect_pdfs(seen, out);
                }
            }
        }
    }
}

fn leaf_from_common(common: &imap_proto::BodyContentCommon<'_>) -> PartDescriptor {
    let name = param_value_ci(&common.ty.params, "name");
    let filename = common
        .disposition
        .as_ref()
        .and_then(|disposition| param_value_ci(&disposition.params, "filename"));
    PartDescriptor::Part { name, filename }
}

fn param_value_ci(params: &Params<'_>, key: &str) -> Option<String> {
    params.as_ref().and_then(|params| {
        params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.to_string())
    })
}

/// Lightweight scan result for one message: identity, server arrival
/// timestamp, and the PDF filenames its structural description declares.
#[derive(Debug, Clone)]
pub struct MessageSketch {
    pub uid: u32,
    pub received_at: Option<DateTime<FixedOffset>>,
    pub pdf_names: Vec<String>,
}

/// A message that passed the date and has-PDF filters.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub uid: u32,
    pub received_at: DateTime<FixedOffset>,
    pub pdf_names: Vec<String>,
}

/// The server-side SINCE search has day granularity, so every sketch is
/// re-checked against the exact cutoff: only strictly-later arrivals pass.
/// Sketches with an unparsable arrival timestamp are dropped.
pub fn filter_candidates(
    sketches: Vec<MessageSketch>,
    cutoff: DateTime<FixedOffset>,
) -> Vec<Candidate> {
    sketches
        .into_iter()
        .filter_map(|sketch| {
            let received_at = sketch.received_at?;
            if received_at <= cutoff || sketch.pdf_names.is_empty() {
                return None;
            }
            Some(Candidate {
                uid: sketch.uid,
                received_at,
                pdf_names: sketch.pdf_names,
            })
        })
        .collect()
}

/// Read-only view of one account's mailboxes. The engine runs against this
/// seam so tests can inject fixtures instead of a live session.
pub trait MailSource {
    /// Selectable mailbox names visible on the account.
    fn mailboxes(&mut self) -> Result<Vec<String>>;
    /// Day-granular scan of one mailbox: every message arrived on/after the
    /// given instant's calendar day, structure only, no bodies.
    fn scan(&mut self, mailbox: &str, since: DateTime<FixedOffset>) -> Result<Vec<MessageSketch>>;
    /// Full RFC822 text of one message in the given mailbox.
    fn fetch_raw(&mut self, mailbox: &str, uid: u32) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct ImapSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub skip_tls_verify: bool,
}

pub struct ImapSource {
    session: imap::Session<imap::Connection>,
    selected: Option<String>,
}

impl ImapSource {
    pub fn connect(settings: &ImapSettings) -> Result<Self> {
        log_debug(&format!(
            "imap_connect start host={} port={} user={}",
            settings.host, settings.port, settings.username
        ));
        let client = ClientBuilder::new(settings.host.as_str(), settings.port)
            .tls_kind(imap::TlsKind::Native)
            .mode(ConnectionMode::AutoTls)
            .danger_skip_tls_verify(settings.skip_tls_verify)
            .connect()?;
        let session = client
            .login(&settings.username, &settings.password)
            .map_err(|e| e.0)?;
        log_debug("imap_connect login ok");
        Ok(Self {
            session,
            selected: None,
        })
    }

    fn select(&mut self, mailbox: &str) -> Result<()> {
        if self.selected.as_deref() == Some(mailbox) {
            return Ok(());
        }
        self.session.select(mailbox)?;
        self.selected = Some(mailbox.to_string());
        Ok(())
    }
}

impl Drop for ImapSource {
    fn drop(&mut self) {
        let _ = self.session.logout();
    }
}

impl MailSource for ImapSource {
    fn mailboxes(&mut self) -> Result<Vec<String>> {
        let list = self.session.list(None, Some("*"))?;
        let mut names = Vec::new();
        for folder in list.iter() {
            if folder
                .attributes()
                .iter()
                .any(|attr| matches!(attr, imap_proto::NameAttribute::NoSelect))
            {
                continue;
            }
            names.push(folder.name().to_string());
        }
        log_debug(&format!("imap_list mailboxes count={}", names.len()));
        Ok(names)
    }

    fn scan(&mut self, mailbox: &str, since: DateTime<FixedOffset>) -> Result<Vec<MessageSketch>> {
        self.select(mailbox)?;
        let query = format!(
            "SINCE {}",
            imap_date_from_parts(since.year(), since.month(), since.day())
        );
        log_debug(&format!("imap_scan mailbox={} query={}", mailbox, query));
        let uids = self.session.uid_search(&query)?;
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let mut uid_list: Vec<u32> = uids.into_iter().collect();
        uid_list.sort_unstable();
        let mut sketches = Vec::new();
        for chunk in uid_list.chunks(FETCH_CHUNK) {
            let uid_set = chunk
                .iter()
                .map(|uid| uid.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let fetches = self
                .session
                .uid_fetch(uid_set, "(UID INTERNALDATE BODYSTRUCTURE)")?;
            for fetch in fetches.iter() {
                let uid = match fetch.uid {
                    Some(uid) => uid,
                    None => continue,
                };
                let pdf_names = fetch
                    .bodystructure()
                    .map(|body| PartDescriptor::from_body_structure(body).pdf_filenames())
                    .unwrap_or_default();
                sketches.push(MessageSketch {
                    uid,
                    received_at: fetch.internal_date(),
                    pdf_names,
                });
            }
        }
        log_debug(&format!(
            "imap_scan mailbox={} sketches={}",
            mailbox,
            sketches.len()
        ));
        Ok(sketches)
    }

    fn fetch_raw(&mut self, mailbox: &str, uid: u32) -> Result<Vec<u8>> {
        self.select(mailbox)?;
        let fetches = self.session.uid_fetch(uid.to_string(), "RFC822")?;
        // Some servers split the literal across untagged responses; keep
        // every fragment, in order.
        let mut raw = Vec::new();
        for fetch in fetches.iter() {
            if let Some(body) = fetch.body() {
                raw.extend_from_slice(body);
            }
        }
        if raw.is_empty() {
            return Err(anyhow!("no body returned for UID {}", uid));
        }
        Ok(raw)
    }
}

/// IMAP date-text for SEARCH SINCE, e.g. "10-Aug-2026".
pub fn imap_date_from_parts(year: i32, month: u32, day: u32) -> String {
    let month = match month {
        1 => "Jan",
        2 => "Feb",
        3 => "Mar",
        4 => "Apr",
        5 => "May",
        6 => "Jun",
        7 => "Jul",
        8 => "Aug",
        9 => "Sep",
        10 => "Oct",
        11 => "Nov",
        12 => "Dec",
        _ => "Jan",
    };
    format!("{}-{}-{}", day, month, year)
}

/// Submission failure classification; selects the terminal outcome tag.
#[derive(Debug)]
pub enum SendFailure {
    /// 4yz responses, rate limits: retrying on a later run can succeed.
    Transient(String),
    Permanent(String),
}

impl fmt::Display for SendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendFailure::Transient(msg) => write!(f, "transient: {}", msg),
            SendFailure::Permanent(msg) => write!(f, "permanent: {}", msg),
        }
    }
}

impl std::error::Error for SendFailure {}

/// Authenticated submission channel. `handshake` must report a working port
/// before `send` is called.
pub trait Courier {
    /// Probes the configured ports in order; Some(port) once one accepts the
    /// login, None when they all refuse.
    fn handshake(&mut self) -> Option<u16>;
    fn send(&mut self, recipient: &str, item: &ForwardableAttachment) -> Result<(), SendFailure>;
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub ports: Vec<u16>,
    pub username: String,
    pub password: String,
    pub skip_tls_verify: bool,
}

pub struct SmtpCourier {
    settings: SmtpSettings,
    transport: Option<SmtpTransport>,
}

impl SmtpCourier {
    pub fn new(settings: SmtpSettings) -> Self {
        Self {
            settings,
            transport: None,
        }
    }

    fn transport_for_port(&self, port: u16) -> Result<SmtpTransport> {
        let mut tls_builder = TlsParameters::builder(self.settings.host.clone());
        if self.settings.skip_tls_verify {
            tls_builder = tls_builder
                .dangerous_accept_invalid_certs(true)
                .dangerous_accept_invalid_hostnames(true);
        }
        let tls_parameters = tls_builder.build()?;
        // 465-style ports speak TLS from the first byte; the rest are
        // STARTTLS submission ports.
        let tls = if port == 465 || port == 1465 {
            Tls::Wrapper(tls_parameters)
        } else {
            Tls::Required(tls_parameters)
        };
        let creds = Credentials::new(
            self.settings.username.clone(),
            self.settings.password.clone(),
        );
        Ok(SmtpTransport::builder_dangerous(self.settings.host.as_str())
            .port(port)
            .tls(tls)
            .credentials(creds)
            .build())
    }
}

impl Courier for SmtpCourier {
    fn handshake(&mut self) -> Option<u16> {
        for &port in &self.settings.ports {
            let transport = match self.transport_for_port(port) {
                Ok(transport) => transport,
                Err(err) => {
                    log_debug(&format!("smtp_probe port={} tls setup failed: {}", port, err));
                    continue;
                }
            };
            match transport.test_connection() {
                Ok(true) => {
                    log_debug(&format!("smtp_probe port={} login ok", port));
                    self.transport = Some(transport);
                    return Some(port);
                }
                Ok(false) => log_debug(&format!("smtp_probe port={} not connected", port)),
                Err(err) => log_debug(&format!("smtp_probe port={} failed: {}", port, err)),
            }
        }
        None
    }

    fn send(&mut self, recipient: &str, item: &ForwardableAttachment) -> Result<(), SendFailure> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| SendFailure::Permanent("send before successful handshake".to_string()))?;
        let email = build_forward_message(&self.settings.username, recipient, item)
            .map_err(|err| SendFailure::Permanent(err.to_string()))?;
        match transport.send(&email) {
            Ok(_) => Ok(()),
            Err(err) if err.is_transient() => Err(SendFailure::Transient(err.to_string())),
            Err(err) => Err(SendFailure::Permanent(err.to_string())),
        }
    }
}

/// One multipart message per attachment: prefixed subject, plain-text cover
/// body, and the original file under its original name.
pub fn build_forward_message(
    from: &str,
    to: &str,
    item: &ForwardableAttachment,
) -> Result<Message> {
    let from_addr: Mailbox = from
        .parse()
        .map_err(|err| anyhow!("bad sender address {}: {}", from, err))?;
    let to_addr: Mailbox = to
        .parse()
        .map_err(|err| anyhow!("bad recipient address {}: {}", to, err))?;
    let pdf = ContentType::parse("application/pdf")
        .map_err(|err| anyhow!("content type: {}", err))?;
    let multipart = MultiPart::mixed()
        .singlepart(SinglePart::plain(forward_body(item)))
        .singlepart(Attachment::new(item.filename.clone()).body(item.data.clone(), pdf));
    Ok(Message::builder()
        .from(from_addr)
        .to(to_addr)
        .subject(forward_subject(item))
        .multipart(multipart)?)
}
