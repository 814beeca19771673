//! Full-message MIME parsing: turns fetched messages into forwardable
//! attachments, with the per-run dedup register and the forward-loop guard.

use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, FixedOffset};
use mailparse::{MailHeaderMap, ParsedMail, parse_mail};

use ledgerpost_core::{FORWARD_SUBJECT_PREFIX, ForwardableAttachment};

/// Decoded header context for one message. `get_first_value` reverses
/// RFC 2047 encoded words, so these are display-ready.
#[derive(Debug, Clone)]
pub struct MessageSummary {
    pub message_id: Option<String>,
    pub subject: String,
    pub sender: String,
    pub date_header: String,
}

pub fn message_summary(parsed: &ParsedMail) -> MessageSummary {
    MessageSummary {
        message_id: parsed.headers.get_first_value("Message-ID"),
        subject: parsed
            .headers
            .get_first_value("Subject")
            .unwrap_or_default(),
        sender: parsed.headers.get_first_value("From").unwrap_or_default(),
        date_header: parsed.headers.get_first_value("Date").unwrap_or_default(),
    }
}

/// True when the subject carries our forwarding prefix, meaning the message
/// is this engine's own output that landed back in an accounting mailbox.
pub fn is_forwarded_copy(subject: &str) -> bool {
    subject.starts_with(FORWARD_SUBJECT_PREFIX)
}

/// Per-run Message-ID register, scoped to one account across all of its
/// mailboxes. Messages without a Message-ID are never deduplicated.
#[derive(Debug, Default)]
pub struct SeenMessages {
    ids: HashSet<String>,
}

impl SeenMessages {
    pub fn new() -> Self {
        Self::default()
    }

    /// True the first time an identity shows up, false on repeats. `None`
    /// always counts as a first sighting.
    pub fn first_sighting(&mut self, message_id: Option<&str>) -> bool {
        match message_id {
            Some(id) => self.ids.insert(id.to_string()),
            None => true,
        }
    }
}

/// Parses a complete message and emits one record per non-multipart part
/// whose filename case-insensitively matches a declared PDF name. Repeats
/// (by Message-ID) and our own forwarded copies yield nothing.
pub fn extract_forwardables(
    raw: &[u8],
    declared: &[String],
    received_at: DateTime<FixedOffset>,
    seen: &mut SeenMessages,
) -> Result<Vec<ForwardableAttachment>> {
    let parsed = parse_mail(raw)?;
    let summary = message_summary(&parsed);
    if !seen.first_sighting(summary.message_id.as_deref()) {
        return Ok(Vec::new());
    }
    if is_forwarded_copy(&summary.subject) {
        return Ok(Vec::new());
    }
    let declared_lower: HashSet<String> =
        declared.iter().map(|name| name.to_lowercase()).collect();
    let mut out = Vec::new();
    collect_matching(&parsed, &declared_lower, &summary, received_at, &mut out)?;
    Ok(out)
}

fn collect_matching(
    parsed: &ParsedMail,
    declared_lower: &HashSet<String>,
    summary: &MessageSummary,
    received_at: DateTime<FixedOffset>,
    out: &mut Vec<ForwardableAttachment>,
) -> Result<()> {
    if parsed.subparts.is_empty() {
        let disposition = parsed.get_content_disposition();
        let filename = disposition
            .params
            .get("filename")
            .cloned()
            .or_else(|| parsed.ctype.params.get("name").cloned());
        let Some(filename) = filename else {
            return Ok(());
        };
        if !declared_lower.contains(&filename.to_lowercase()) {
            return Ok(());
        }
        let data = parsed.get_body_raw()?;
        out.push(ForwardableAttachment {
            filename,
            data,
            subject: summary.subject.clone(),
            sender: summary.sender.clone(),
            date_header: summary.date_header.clone(),
            received_at,
        });
        return Ok(());
    }
    for part in &parsed.subparts {
        collect_matching(part, declared_lower, summary, received_at, out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(raw: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(raw).unwrap()
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn pdf_message(subject: &str, message_id: Option<&str>, filenames: &[&str]) -> Vec<u8> {
        let mut msg = String::new();
        msg.push_str("From: Billing <billing@vendor.example>\r\n");
        msg.push_str("To: me@example.com\r\n");
        if let Some(id) = message_id {
            msg.push_str(&format!("Message-ID: <{}>\r\n", id));
        }
        msg.push_str(&format!("Subject: {}\r\n", subject));
        msg.push_str("Date: Mon, 10 Aug 2026 09:15:00 +0200\r\n");
        msg.push_str("MIME-Version: 1.0\r\n");
        msg.push_str("Content-Type: multipart/mixed; boundary=\"xyz\"\r\n\r\n");
        msg.push_str("--xyz\r\n");
        msg.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
        msg.push_str("see attached\r\n");
        for filename in filenames {
            msg.push_str("--xyz\r\n");
            msg.push_str(&format!(
                "Content-Type: application/pdf; name=\"{}\"\r\n",
                filename
            ));
            msg.push_str("Content-Transfer-Encoding: base64\r\n");
            msg.push_str(&format!(
                "Content-Disposition: attachment; filename=\"{}\"\r\n\r\n",
                filename
            ));
            // "%PDF-1.4"
            msg.push_str("JVBERi0xLjQ=\r\n");
        }
        msg.push_str("--xyz--\r\n");
        msg.into_bytes()
    }

    #[test]
    fn extracts_declared_pdf_with_decoded_payload() {
        let raw = pdf_message("Invoice 42", Some("m1@vendor"), &["invoice-42.pdf"]);
        let mut seen = SeenMessages::new();
        let items = extract_forwardables(
            &raw,
            &strings(&["Invoice-42.PDF"]),
            ts("2026-08-10T09:15:07+02:00"),
            &mut seen,
        )
        .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].filename, "invoice-42.pdf");
        assert_eq!(items[0].data, b"%PDF-1.4");
        assert_eq!(items[0].subject, "Invoice 42");
        assert_eq!(items[0].sender, "Billing <billing@vendor.example>");
        assert_eq!(items[0].date_header, "Mon, 10 Aug 2026 09:15:00 +0200");
    }

    #[test]
    fn multiple_declared_parts_share_message_context() {
        let raw = pdf_message("Two invoices", Some("m2@vendor"), &["a.pdf", "b.pdf"]);
        let mut seen = SeenMessages::new();
        let items = extract_forwardables(
            &raw,
            &strings(&["a.pdf", "b.pdf"]),
            ts("2026-08-10T09:15:07+02:00"),
            &mut seen,
        )
        .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].filename, "a.pdf");
        assert_eq!(items[1].filename, "b.pdf");
        assert_eq!(items[0].subject, items[1].subject);
    }

    #[test]
    fn undeclared_parts_are_ignored() {
        let raw = pdf_message("Invoice 42", Some("m3@vendor"), &["invoice-42.pdf"]);
        let mut seen = SeenMessages::new();
        let items = extract_forwardables(
            &raw,
            &strings(&["other.pdf"]),
            ts("2026-08-10T09:15:07+02:00"),
            &mut seen,
        )
        .unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn forwarded_copies_are_never_re_extracted() {
        let raw = pdf_message(
            "Invoice/Receipt: Invoice 42",
            Some("m4@vendor"),
            &["invoice-42.pdf"],
        );
        let mut seen = SeenMessages::new();
        let items = extract_forwardables(
            &raw,
            &strings(&["invoice-42.pdf"]),
            ts("2026-08-10T09:15:07+02:00"),
            &mut seen,
        )
        .unwrap();
        assert!(items.is_empty());
    }

    #[test]
    fn repeated_message_id_yields_one_copy() {
        let raw = pdf_message("Invoice 42", Some("m5@vendor"), &["invoice-42.pdf"]);
        let declared = strings(&["invoice-42.pdf"]);
        let when = ts("2026-08-10T09:15:07+02:00");
        let mut seen = SeenMessages::new();
        let first = extract_forwardables(&raw, &declared, when, &mut seen).unwrap();
        let second = extract_forwardables(&raw, &declared, when, &mut seen).unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn missing_message_id_is_never_deduplicated() {
        let raw = pdf_message("Invoice 42", None, &["invoice-42.pdf"]);
        let declared = strings(&["invoice-42.pdf"]);
        let when = ts("2026-08-10T09:15:07+02:00");
        let mut seen = SeenMessages::new();
        let first = extract_forwardables(&raw, &declared, when, &mut seen).unwrap();
        let second = extract_forwardables(&raw, &declared, when, &mut seen).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn subject_encoded_words_are_decoded() {
        let raw = pdf_message(
            "=?UTF-8?B?UmVjaG51bmcgMTIz?=",
            Some("m6@vendor"),
            &["rechnung.pdf"],
        );
        let parsed = parse_mail(&raw).unwrap();
        let summary = message_summary(&parsed);
        assert_eq!(summary.subject, "Rechnung 123");
    }

    #[test]
    fn summary_tolerates_missing_headers() {
        let parsed = parse_mail(b"X-Nothing: here\r\n\r\nbody\r\n").unwrap();
        let summary = message_summary(&parsed);
        assert!(summary.message_id.is_none());
        assert!(summary.subject.is_empty());
        assert!(summary.sender.is_empty());
        assert!(summary.date_header.is_empty());
    }

    #[test]
    fn seen_register_tracks_ids_only() {
        let mut seen = SeenMessages::new();
        assert!(seen.first_sighting(Some("<a@x>")));
        assert!(!seen.first_sighting(Some("<a@x>")));
        assert!(seen.first_sighting(Some("<b@x>")));
        assert!(seen.first_sighting(None));
        assert!(seen.first_sighting(None));
    }
}
