//! ledgerpost: forwards newly arrived invoice/receipt PDF attachments to a
//! fixed accounting recipient, one confirmed batch per account.

use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;
mod confirm;
mod engine;

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    commands::run(args)
}
