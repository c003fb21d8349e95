use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use pbalend_indexer::{StoreChoice, run};
use pbalend_infra::{IndexerConfig, JsonlEventSource, WorkerExit};
use pbalend_observability::{LogFormat, init};

#[derive(Debug, Parser)]
#[command(name = "pbalend-indexer")]
#[command(about = "Projects lending contract events into the market and position ledger")]
struct Cli {
    /// Configuration file (TOML). Environment overrides use `PBALEND__SECTION__KEY`.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON-lines file of decoded contract logs; overrides `chain.events_file`.
    #[arg(short, long)]
    events: Option<PathBuf>,

    /// Keep the ledger in memory even if a database URL is configured.
    #[arg(long)]
    in_memory: bool,

    /// Print the final ledger as JSON on stdout.
    #[arg(long)]
    dump: bool,
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "indexer failed");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = IndexerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    init(&config.log.filter, LogFormat::from_json_flag(config.log.json));

    info!(
        chain_id = config.chain.chain_id,
        contract = %config.chain.contract_address,
        start_block = config.chain.start_block,
        "starting lending ledger indexer"
    );

    let events = cli
        .events
        .or_else(|| config.chain.events_file.clone())
        .context("no events file given (use --events or chain.events_file)")?;
    let source = JsonlEventSource::open(&events).with_context(|| format!("failed to open {}", events.display()))?;

    let store = if cli.in_memory { StoreChoice::InMemory } else { StoreChoice::Configured };
    let summary = run(&config, source, store)?;

    if cli.dump {
        println!("{}", serde_json::to_string_pretty(&summary.ledger)?);
    }

    match summary.exit {
        WorkerExit::Halted { attempts, error } => {
            error!(attempts, error = %error, "projection halted; rerun to resume from the stored cursors");
            Ok(ExitCode::FAILURE)
        }
        WorkerExit::Shutdown | WorkerExit::Disconnected => Ok(ExitCode::SUCCESS),
    }
}
