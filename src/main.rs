//! Custody Ledger - Server and Operator Commands
//!
//! Run modes:
//!   custody-ledger api [--port <port>]        - Start the REST API
//!   custody-ledger scan                       - Run one deposit scan and exit
//!   custody-ledger worker [--interval <secs>] - Scan on a fixed interval
//!   custody-ledger reconcile                  - Print the reconciliation verdict
//!   custody-ledger rescan [<chain>]           - Clear scan checkpoints
//!   custody-ledger stock <metal> <grams>      - Record custody stock

use custody_ledger::common::logging::{init_from_config, log_system_event};
use custody_ledger::{AppContext, Chain, LedgerConfig, LedgerError, SqliteCustodySource};
use custody_ledger::storage::Database;
use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    let Some(command) = args.get(1) else {
        print_usage();
        return ExitCode::SUCCESS;
    };
    if matches!(command.as_str(), "help" | "--help" | "-h") {
        print_usage();
        return ExitCode::SUCCESS;
    }

    dotenv::dotenv().ok();
    let config = match LedgerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_from_config(&config) {
        eprintln!("Warning: {}", e);
    }

    let result = match command.as_str() {
        "api" => run_api_server(config, &args[2..]).await,
        "scan" => run_scan(config).await,
        "worker" => run_worker(config, &args[2..]).await,
        "reconcile" => run_reconcile(config).await,
        "rescan" => run_rescan(config, &args[2..]).await,
        "stock" => run_set_stock(config, &args[2..]),
        _ => {
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(code = e.error_code(), error = %e, "Command failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    println!("Custody Ledger - Deposit Crediting and Metal Reconciliation");
    println!();
    println!("Usage:");
    println!("  custody-ledger api [--port <port>]         Start REST API server (default: 3001)");
    println!("  custody-ledger scan                        Run one deposit scan");
    println!("  custody-ledger worker [--interval <secs>]  Scan on a fixed interval");
    println!("  custody-ledger reconcile                   Print the reconciliation verdict");
    println!("  custody-ledger rescan [<chain>]            Clear checkpoints (all chains by default)");
    println!("  custody-ledger stock <metal> <grams>       Record custody stock in grams");
    println!();
    println!("Environment Variables:");
    println!("  CUSTODY_NETWORK        mainnet, testnet or devnet (default: devnet)");
    println!("  CUSTODY_DB_PATH        SQLite database path");
    println!("  CUSTODY_ADMIN_TOKEN    Bearer token of the admin API");
    println!("  CUSTODY_CRON_SECRET    Bearer secret of POST /api/cron/deposit-scan");
    println!("  CUSTODY_WEBHOOK_SECRET Bearer secret of POST /api/webhooks/deposit");
    println!("  CUSTODY_<CHAIN>_RPC / CUSTODY_<CHAIN>_ADDRESSES for ETH, BTC, XRP, SOL");
}

/// Value following `flag`, parsed
fn flag_value<T: std::str::FromStr>(args: &[String], flag: &str) -> Result<Option<T>, LedgerError> {
    let Some(pos) = args.iter().position(|a| a == flag) else {
        return Ok(None);
    };
    let raw = args
        .get(pos + 1)
        .ok_or_else(|| LedgerError::validation(format!("{} needs a value", flag)))?;
    raw.parse()
        .map(Some)
        .map_err(|_| LedgerError::validation(format!("invalid {} value '{}'", flag, raw)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    log_system_event("Shutdown requested", serde_json::json!({}));
}

async fn run_api_server(mut config: LedgerConfig, args: &[String]) -> Result<(), LedgerError> {
    if let Some(port) = flag_value(args, "--port")? {
        config.api_port = port;
    }
    config.print_summary();

    let ctx = Arc::new(AppContext::open(config)?);
    println!();
    println!("Listening on http://0.0.0.0:{}", ctx.config.api_port);
    println!("Press Ctrl+C to stop");

    custody_ledger::api::start_server(ctx, shutdown_signal()).await?;
    Ok(())
}

async fn run_scan(config: LedgerConfig) -> Result<(), LedgerError> {
    let ctx = AppContext::open(config)?;
    let run = ctx.pipeline.run_once().await?;

    let report = serde_json::to_string_pretty(&run).map_err(|e| LedgerError::internal(e.to_string()))?;
    println!("{}", report);
    Ok(())
}

async fn run_worker(config: LedgerConfig, args: &[String]) -> Result<(), LedgerError> {
    let interval = flag_value(args, "--interval")?.unwrap_or(config.scan_interval_secs).max(1);
    config.print_summary();

    let ctx = AppContext::open(config)?;
    println!();
    println!("Scanning every {} seconds", interval);
    println!("Press Ctrl+C to stop");

    ctx.pipeline
        .run_loop(Duration::from_secs(interval), shutdown_signal())
        .await;
    Ok(())
}

async fn run_reconcile(config: LedgerConfig) -> Result<(), LedgerError> {
    let ctx = AppContext::open(config)?;
    let snapshot = ctx.reconciliation.refresh().await;

    let report = serde_json::to_string_pretty(&snapshot).map_err(|e| LedgerError::internal(e.to_string()))?;
    println!("{}", report);
    Ok(())
}

async fn run_rescan(config: LedgerConfig, args: &[String]) -> Result<(), LedgerError> {
    let chain = args
        .first()
        .map(|raw| raw.parse::<Chain>())
        .transpose()
        .map_err(|e| LedgerError::validation(e.to_string()))?;

    let ctx = AppContext::open(config)?;
    let cleared = ctx.pipeline.rescan(chain).await?;
    println!(
        "Cleared {} checkpoint(s) for {}",
        cleared,
        chain.map(|c| c.to_string()).unwrap_or_else(|| "all chains".to_string())
    );
    Ok(())
}

fn run_set_stock(config: LedgerConfig, args: &[String]) -> Result<(), LedgerError> {
    let (Some(metal), Some(raw)) = (args.first(), args.get(1)) else {
        return Err(LedgerError::validation("usage: stock <metal> <grams>"));
    };
    let grams: f64 = raw
        .parse()
        .map_err(|_| LedgerError::validation(format!("invalid grams '{}'", raw)))?;

    let source = SqliteCustodySource::new(Database::open(&config.db_path)?);
    source.set_stock(metal, grams)?;
    println!("{}: {} g", metal.to_uppercase(), grams);
    Ok(())
}
