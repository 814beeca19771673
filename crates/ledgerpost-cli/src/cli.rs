use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "ledgerpost",
    version,
    about = "Forward invoice/receipt PDF attachments to accounting"
)]
pub(crate) struct Cli {
    /// Config file location (default: $LEDGERPOST_CONFIG, then the XDG config dir).
    #[arg(long, global = true)]
    pub(crate) config: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Scan accounts and forward new PDF attachments (the default when no
    /// subcommand is given).
    Run(RunCmd),
    /// Show configured accounts and their cutoffs without touching the network.
    Status,
    /// Print recent run-log entries.
    Log(LogCmd),
}

#[derive(Args, Debug, Default)]
pub(crate) struct RunCmd {
    /// Restrict the run to one configured account.
    #[arg(long)]
    pub(crate) account: Option<String>,

    /// Answer the confirmation prompt with yes.
    #[arg(long)]
    pub(crate) yes: bool,

    /// Scan and report only; nothing is sent and cutoffs stay unchanged.
    #[arg(long, conflicts_with = "yes")]
    pub(crate) dry_run: bool,
}

#[derive(Args, Debug)]
pub(crate) struct LogCmd {
    /// Number of most recent entries to print.
    #[arg(long, default_value_t = 5)]
    pub(crate) limit: usize,

    /// Print raw JSON entries instead of summary lines.
    #[arg(long)]
    pub(crate) json: bool,
}
