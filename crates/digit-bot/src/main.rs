//! Digit trading bot - entry point.
//!
//! Exit codes: `0` normal shutdown, `2` configuration error, `3` restart
//! ordered by the health monitor.

use anyhow::Result;
use clap::{Parser, Subcommand};
use digit_bot::{read_signals, AppConfig, AppError, Core, Credentials};
use digit_core::{ContractKind, Signal, TradeIntent};
use rust_decimal::Decimal;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{error, info, warn};

const EXIT_RESTART: u8 = 3;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via DIGIT_CONFIG env var)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the execution fabric until interrupted
    Run {
        /// Read newline-delimited JSON signals from stdin
        #[arg(long)]
        signals_stdin: bool,
    },
    /// Place one trade and wait for its settlement
    Trade {
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        contract_type: String,
        #[arg(long)]
        stake: Decimal,
        #[arg(long)]
        barrier: Option<String>,
        /// Duration in ticks
        #[arg(long)]
        duration: Option<u32>,
        #[arg(long, default_value = "digit-bot")]
        bot_name: String,
        #[arg(long, default_value = "USD")]
        currency: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Must run before any connection is opened.
    digit_ws::init_crypto();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            let code = e.downcast_ref::<AppError>().map_or(1, AppError::exit_code);
            error!(error = %e, code, "Fatal error");
            eprintln!("digit-bot: {e:#}");
            ExitCode::from(code)
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = AppConfig::load(args.config.as_deref())?;
    digit_telemetry::init_logging(&config.telemetry.log_level)?;
    info!("Starting digit-bot v{}", env!("CARGO_PKG_VERSION"));

    let credentials = Credentials::from_env()?;
    info!(broker = %config.broker.url, pool_size = config.pool.size, "Configuration loaded");

    let core = Arc::new(Core::build(config, &credentials)?);
    core.start().await?;

    let code = match args.command {
        Command::Run { signals_stdin } => run_until_stopped(&core, signals_stdin).await,
        Command::Trade {
            symbol,
            contract_type,
            stake,
            barrier,
            duration,
            bot_name,
            currency,
        } => {
            let intent = TradeIntent {
                bot_name,
                contract_type: ContractKind::new(contract_type),
                symbol,
                stake,
                barrier,
                duration,
                duration_unit: None,
                currency,
                growth_rate: None,
                take_profit: None,
            };
            trade_once(&core, intent).await?
        }
    };

    core.shutdown().await;
    Ok(code)
}

async fn run_until_stopped(core: &Arc<Core>, signals_stdin: bool) -> ExitCode {
    if signals_stdin {
        let queue = core.queue().clone();
        let cancel = core.cancel_token();
        tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            read_signals(stdin, &queue, &cancel).await;
        });
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for ctrl-c");
            }
            info!("Shutdown requested");
            ExitCode::SUCCESS
        }
        () = core.restart_requested() => ExitCode::from(EXIT_RESTART),
    }
}

async fn trade_once(core: &Arc<Core>, intent: TradeIntent) -> Result<ExitCode> {
    // Fails fast on bad parameters before anything is queued.
    let payload = serde_json::to_value(&intent)?;
    TradeIntent::from_payload(&payload)?;

    let signal = Signal::high_priority(payload);
    let signal_id = signal.signal_id.clone();
    let outcome = core.submit(signal);
    if !outcome.is_queued() {
        warn!(?outcome, "Trade signal not queued");
        return Ok(ExitCode::FAILURE);
    }

    let retry = &core.config().executor.retry;
    let wait = core.config().executor.settle_timeout()
        + Duration::from_millis(retry.attempt_timeout_ms * 2 * u64::from(retry.max_attempts));

    tokio::select! {
        entry = core.wait_for_outcome(&signal_id, wait) => match entry {
            Some(entry) if entry.success => {
                info!(signal_id = %signal_id, latency_ms = entry.latency_ms, "Trade completed");
                Ok(ExitCode::SUCCESS)
            }
            Some(entry) => {
                warn!(signal_id = %signal_id, error = ?entry.error, "Trade failed");
                Ok(ExitCode::FAILURE)
            }
            None => {
                warn!(signal_id = %signal_id, "Trade outcome not observed in time");
                Ok(ExitCode::FAILURE)
            }
        },
        () = core.restart_requested() => Ok(ExitCode::from(EXIT_RESTART)),
    }
}
