use std::path::Path;

use anyhow::{Result, bail};
use chrono::Local;

use ledgerpost_core::{
    AccountRecord, RunLogEntry, SyncConfig, append_run_log, config_path, load_or_init, log_debug,
    parse_cutoff, read_config, read_run_log, run_log_path, save_config, yesterday_midnight_local,
};
use ledgerpost_mail::{ImapSettings, ImapSource, MailSource, SmtpCourier, SmtpSettings};

use crate::cli::{Cli, Command, LogCmd, RunCmd};
use crate::confirm::{ConfirmationGate, FixedGate, StdinGate};
use crate::engine::process_account;

pub(crate) fn run(cli: Cli) -> Result<()> {
    let Cli { config, command } = cli;
    let config_file = config_path(config);
    match command.unwrap_or(Command::Run(RunCmd::default())) {
        Command::Run(cmd) => cmd_run(&config_file, cmd),
        Command::Status => cmd_status(&config_file),
        Command::Log(cmd) => cmd_log(cmd),
    }
}

fn cmd_run(config_file: &Path, cmd: RunCmd) -> Result<()> {
    let mut cfg = load_or_init(config_file)?;
    let mut cfg_changed = false;

    let accounts = select_accounts(&cfg, cmd.account.as_deref())?;
    if accounts.is_empty() {
        println!("No accounts configured. Edit {} first.", config_file.display());
        return Ok(());
    }
    if cmd.dry_run {
        println!("Dry run: nothing is sent and cutoffs stay unchanged.");
    }

    let gate: Box<dyn ConfirmationGate> = if cmd.yes {
        Box::new(FixedGate(true))
    } else if cmd.dry_run {
        Box::new(FixedGate(false))
    } else {
        Box::new(StdinGate)
    };

    let mut records: Vec<AccountRecord> = Vec::new();
    for account in &accounts {
        println!("\n== {account} ==");

        let cutoff = match cfg.cutoff_by_account.get(account).and_then(|raw| parse_cutoff(raw)) {
            Some(cutoff) => cutoff,
            None => {
                // First sighting of this account (or a mangled cutoff):
                // start from yesterday midnight and persist that choice.
                let fallback = yesterday_midnight_local().fixed_offset();
                cfg.cutoff_by_account
                    .insert(account.clone(), fallback.to_rfc3339());
                cfg_changed = true;
                fallback
            }
        };

        let source = ImapSource::connect(&ImapSettings {
            host: cfg.imap.host.clone(),
            port: cfg.imap.port,
            username: account.clone(),
            password: cfg.password.clone(),
            skip_tls_verify: cfg.imap.skip_tls_verify,
        })
        .map(|source| Box::new(source) as Box<dyn MailSource>);

        let mut courier = SmtpCourier::new(SmtpSettings {
            host: cfg.smtp.host.clone(),
            ports: cfg.smtp.ports.clone(),
            username: account.clone(),
            password: cfg.password.clone(),
            skip_tls_verify: cfg.smtp.skip_tls_verify,
        });

        let record = process_account(
            account,
            cutoff,
            &cfg.accounting_mailboxes,
            &cfg.recipient,
            source,
            &mut courier,
            gate.as_ref(),
        );
        if let Some(new_cutoff) = &record.new_cutoff {
            cfg.cutoff_by_account
                .insert(account.clone(), new_cutoff.clone());
            cfg_changed = true;
        }
        records.push(record);
    }

    let entry = RunLogEntry {
        ran_at: Local::now().to_rfc3339(),
        accounts: records,
    };
    let log_file = run_log_path();
    if let Err(err) = append_run_log(&log_file, &entry) {
        log_debug(&format!("run log append failed: {err}"));
        eprintln!("warning: could not append run log at {}: {err}", log_file.display());
    }

    if cfg_changed {
        save_config(config_file, &cfg)?;
        println!("\nUpdated state: {}", config_file.display());
    }
    Ok(())
}

fn select_accounts(cfg: &SyncConfig, only: Option<&str>) -> Result<Vec<String>> {
    match only {
        Some(account) => {
            if !cfg.accounts.iter().any(|a| a == account) {
                bail!("account {account} is not configured");
            }
            Ok(vec![account.to_string()])
        }
        None => Ok(cfg.accounts.clone()),
    }
}

fn cmd_status(config_file: &Path) -> Result<()> {
    if !config_file.exists() {
        println!(
            "No config at {} yet. Run `ledgerpost` once to create the template.",
            config_file.display()
        );
        return Ok(());
    }
    let cfg = read_config(config_file)?;
    println!("Config:         {}", config_file.display());
    println!("IMAP:           {}:{}", cfg.imap.host, cfg.imap.port);
    println!("SMTP:           {} ports {:?}", cfg.smtp.host, cfg.smtp.ports);
    println!("Recipient:      {}", cfg.recipient);
    println!("Mailbox hints:  {}", cfg.accounting_mailboxes.join(", "));
    if cfg.accounts.is_empty() {
        println!("Accounts:       none configured");
        return Ok(());
    }
    println!("Accounts:");
    for account in &cfg.accounts {
        let cutoff = cfg
            .cutoff_by_account
            .get(account)
            .map(String::as_str)
            .unwrap_or("(first run pending)");
        println!("  {account}  cutoff {cutoff}");
    }
    Ok(())
}

fn cmd_log(cmd: LogCmd) -> Result<()> {
    let path = run_log_path();
    let entries = read_run_log(&path, cmd.limit)?;
    if entries.is_empty() {
        println!("No runs recorded at {}.", path.display());
        return Ok(());
    }
    for entry in &entries {
        if cmd.json {
            println!("{}", serde_json::to_string(entry)?);
            continue;
        }
        println!("{}", entry.ran_at);
        for account in &entry.accounts {
            println!(
                "  {}  {}  found {} sent {}  cutoff {} -> {}",
                account.account,
                account.status,
                account.pdfs_found,
                account.pdfs_sent,
                account.cutoff_used,
                account.new_cutoff.as_deref().unwrap_or("unchanged"),
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_accounts(accounts: &[&str]) -> SyncConfig {
        let mut cfg = SyncConfig::template();
        cfg.accounts = accounts.iter().map(|a| a.to_string()).collect();
        cfg
    }

    #[test]
    fn select_accounts_defaults_to_all() {
        let cfg = config_with_accounts(&["a@example.com", "b@example.com"]);
        let picked = select_accounts(&cfg, None).unwrap();
        assert_eq!(picked, vec!["a@example.com", "b@example.com"]);
    }

    #[test]
    fn select_accounts_narrows_to_one() {
        let cfg = config_with_accounts(&["a@example.com", "b@example.com"]);
        let picked = select_accounts(&cfg, Some("b@example.com")).unwrap();
        assert_eq!(picked, vec!["b@example.com"]);
    }

    #[test]
    fn select_accounts_rejects_unknown() {
        let cfg = config_with_accounts(&["a@example.com"]);
        let err = select_accounts(&cfg, Some("nobody@example.com")).unwrap_err();
        assert!(err.to_string().contains("not configured"));
    }
}
