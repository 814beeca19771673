//! Per-account run: resolve accounting mailboxes, collect new PDF
//! attachments, gate on the operator, transmit, and report how far the
//! cutoff may advance. Every path produces an [`AccountRecord`]; the cutoff
//! moves only past items that were actually sent.

use anyhow::Result;
use chrono::{DateTime, FixedOffset};

use ledgerpost_core::{
    AccountRecord, AttachmentNote, ForwardableAttachment, Outcome, latest_received, log_debug,
};
use ledgerpost_content::{SeenMessages, extract_forwardables};
use ledgerpost_mail::{
    Courier, MailSource, SendFailure, filter_candidates, resolve_accounting_mailboxes,
};

use crate::confirm::ConfirmationGate;

const PROGRESS_EVERY: usize = 25;

pub(crate) fn process_account(
    account: &str,
    cutoff: DateTime<FixedOffset>,
    hints: &[String],
    recipient: &str,
    source: Result<Box<dyn MailSource>>,
    courier: &mut dyn Courier,
    gate: &dyn ConfirmationGate,
) -> AccountRecord {
    let mut record = AccountRecord {
        account: account.to_string(),
        cutoff_used: cutoff.to_rfc3339(),
        new_cutoff: None,
        mailboxes: Vec::new(),
        pdfs_found: 0,
        pdfs_sent: 0,
        status: Outcome::NoMailbox,
        attachments: Vec::new(),
    };

    let mut source = match source {
        Ok(source) => source,
        Err(err) => {
            println!("Mailbox access failed: {err}");
            log_debug(&format!("account={account} connect failed: {err}"));
            return record;
        }
    };

    let available = match source.mailboxes() {
        Ok(names) => names,
        Err(err) => {
            println!("Mailbox listing failed: {err}");
            log_debug(&format!("account={account} list failed: {err}"));
            return record;
        }
    };

    let mailboxes = resolve_accounting_mailboxes(&available, hints);
    if mailboxes.is_empty() {
        println!("No accounting mailbox found.");
        return record;
    }
    println!("Accounting mailboxes: {}", mailboxes.join(", "));
    println!("Cutoff (send after): {}", record.cutoff_used);
    record.mailboxes = mailboxes.clone();

    // One dedup registry across all of this account's mailboxes, so a
    // message labelled into several folders is forwarded once.
    let mut seen = SeenMessages::new();
    let mut attachments: Vec<ForwardableAttachment> = Vec::new();
    let mut message_count = 0usize;
    let mut saw_candidates = false;
    for mailbox in &mailboxes {
        let sketches = match source.scan(mailbox, cutoff) {
            Ok(sketches) => sketches,
            Err(err) => {
                log_debug(&format!("account={account} scan failed mailbox={mailbox}: {err}"));
                continue;
            }
        };
        let candidates = filter_candidates(sketches, cutoff);
        saw_candidates = saw_candidates || !candidates.is_empty();
        for candidate in candidates {
            let raw = match source.fetch_raw(mailbox, candidate.uid) {
                Ok(raw) => raw,
                Err(err) => {
                    log_debug(&format!(
                        "account={account} fetch failed mailbox={mailbox} uid={}: {err}",
                        candidate.uid
                    ));
                    continue;
                }
            };
            match extract_forwardables(&raw, &candidate.pdf_names, candidate.received_at, &mut seen)
            {
                Ok(items) => {
                    if !items.is_empty() {
                        message_count += 1;
                        attachments.extend(items);
                    }
                }
                Err(err) => {
                    log_debug(&format!(
                        "account={account} parse failed mailbox={mailbox} uid={}: {err}",
                        candidate.uid
                    ));
                }
            }
        }
    }

    if attachments.is_empty() {
        if saw_candidates {
            println!("No PDF attachments found in new messages.");
        } else {
            println!("No new messages after cutoff.");
        }
        record.status = Outcome::NoPdfs;
        return record;
    }

    record.pdfs_found = attachments.len();
    record.attachments = attachments.iter().map(AttachmentNote::from).collect();

    println!(
        "Ready to send: {} PDF(s) from {} message(s)",
        attachments.len(),
        message_count
    );
    if !gate.proceed(attachments.len(), message_count, &record.cutoff_used) {
        println!("Skipped sending for this account.");
        record.status = Outcome::SkippedByUser;
        return record;
    }

    let Some(port) = courier.handshake() else {
        println!("SMTP login failed on all configured ports. Skipping send.");
        record.status = Outcome::SmtpFailed;
        return record;
    };
    log_debug(&format!("account={account} submission port={port}"));

    let total = attachments.len();
    let mut sent = 0usize;
    let mut failure: Option<SendFailure> = None;
    for (idx, item) in attachments.iter().enumerate() {
        match courier.send(recipient, item) {
            Ok(()) => {
                sent += 1;
                if (idx + 1) % PROGRESS_EVERY == 0 {
                    println!("  sent {}/{}", idx + 1, total);
                }
            }
            Err(err) => {
                println!("Send failed after {sent} of {total}: {err}");
                log_debug(&format!("account={account} send failed after {sent}: {err}"));
                failure = Some(err);
                break;
            }
        }
    }

    record.pdfs_sent = sent;
    record.status = match failure {
        None => Outcome::Sent,
        Some(SendFailure::Transient(_)) => Outcome::RateLimited,
        Some(SendFailure::Permanent(_)) => Outcome::PartialSend,
    };
    if sent > 0 {
        if let Some(latest) = latest_received(&attachments[..sent]) {
            // The cutoff never retreats.
            record.new_cutoff = Some(latest.max(cutoff).to_rfc3339());
        }
    }
    println!("Sent {sent}/{total}");
    record
}
