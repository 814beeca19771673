use std::io::{self, BufRead, Write};

/// Human checkpoint between discovery and transmission. Implementations must
/// not touch the network; a `false` means "skip this account's batch".
pub(crate) trait ConfirmationGate {
    fn proceed(&self, pdf_count: usize, message_count: usize, cutoff: &str) -> bool;
}

/// Interactive prompt on stdin. Blocks until the operator answers; anything
/// other than an affirmative answer declines.
pub(crate) struct StdinGate;

impl ConfirmationGate for StdinGate {
    fn proceed(&self, _pdf_count: usize, _message_count: usize, _cutoff: &str) -> bool {
        print!("Send now? [y/N]: ");
        let _ = io::stdout().flush();
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        is_affirmative(&answer)
    }
}

/// Fixed answer, used for --yes, --dry-run, and tests.
pub(crate) struct FixedGate(pub(crate) bool);

impl ConfirmationGate for FixedGate {
    fn proceed(&self, _pdf_count: usize, _message_count: usize, _cutoff: &str) -> bool {
        self.0
    }
}

pub(crate) fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}
