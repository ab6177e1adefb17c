//! mailbroom - an IMAP mail-sorting agent

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use mailbroom::agent::Agent;
use mailbroom::config::Config;

/// Sorts staged IMAP mail into mailboxes based on filter rules
#[derive(Parser)]
#[command(name = "mailbroom", version)]
struct Cli {
    /// File or directory to load configuration from
    #[arg(short, long, default_value = "config/")]
    config: PathBuf,

    /// Dry-run: evaluate filters but only log mailbox changes
    #[arg(short, long)]
    test: bool,

    /// Run a single pass over all accounts and exit
    #[arg(long)]
    once: bool,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            log::error!(
                "Failed to load configuration from {}: {}",
                cli.config.display(),
                err
            );
            return ExitCode::FAILURE;
        }
    };
    if cli.test {
        config.settings.test = true;
    }

    if let Err(errors) = config.validate() {
        for error in &errors {
            log::error!("Invalid configuration: {}", error);
        }
        return ExitCode::FAILURE;
    }

    log::debug!("Starting new mailbroom instance");
    match Agent::new(config).run(cli.once) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("Aborting: {}", err);
            ExitCode::FAILURE
        }
    }
}
