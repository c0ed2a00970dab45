//! Textract quota manager administration CLI.
//!
//! `quotactl` inspects the status ledger and validates configuration.

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use textract_quota::job::JobState;
use textract_quota::ledger::SlateLedger;
use textract_quota::quotactl::{self, GlobalOptions};
use textract_quota::settings::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "quotactl")]
#[command(about = "Administration CLI for the Textract quota manager")]
#[command(version)]
struct Args {
    /// Path to a TOML config file (defaults to the built-in deployment profile)
    #[arg(long, short = 'c', env = "TEXTRACT_QUOTA_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Output in JSON format instead of human-readable tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List documents in a lifecycle state
    List {
        /// pending, submitted, polling, succeeded, failed or abandoned
        #[arg(long, short = 's', default_value = "pending")]
        state: JobState,
    },
    /// Show one document's record
    Get {
        /// Document ID
        id: String,
    },
    /// Move an abandoned document back to pending
    Requeue {
        /// Document ID
        id: String,
    },
    /// Validate the configuration and print derived limits
    Check,
}

async fn run(args: Args) -> anyhow::Result<()> {
    let opts = GlobalOptions { json: args.json };
    let mut stdout = io::stdout();

    if let Command::Check = args.command {
        return quotactl::check_config(&opts, &mut stdout, args.config.as_deref());
    }

    let cfg = AppConfig::load(args.config.as_deref())?;
    textract_quota::trace::init(cfg.logging.format)?;
    let ledger = SlateLedger::open(&cfg.ledger).await?;

    let result = match &args.command {
        Command::List { state } => quotactl::list_jobs(&ledger, &opts, &mut stdout, *state).await,
        Command::Get { id } => quotactl::job_get(&ledger, &opts, &mut stdout, id).await,
        Command::Requeue { id } => quotactl::job_requeue(&ledger, &opts, &mut stdout, id).await,
        Command::Check => Ok(()),
    };
    ledger.close().await?;
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
