//! Ledger audit binary
//!
//! Verifies every wallet hash and every wallet history entry in a ledger
//! database. Exits non-zero when anything fails verification.

use custody_ledger::{with_deadline, AuditTrail, Config, PgStore, Result, WalletLedger};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Load configuration
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ledger-audit: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Initialize tracing
    let filter = EnvFilter::try_new(&config.logging.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    if config.logging.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    info!(service = %config.service_name, version = %config.service_version, "Starting ledger audit");

    match run(&config).await {
        Ok(0) => {
            info!("Ledger audit clean");
            ExitCode::SUCCESS
        }
        Ok(failures) => {
            error!(failures, "Ledger audit found tampered records");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!(error = %e, "Ledger audit aborted");
            ExitCode::FAILURE
        }
    }
}

fn load_config() -> Result<Config> {
    match std::env::var("LEDGER_CONFIG") {
        Ok(path) => Config::from_file(path),
        Err(_) => Config::from_env(),
    }
}

async fn run(config: &Config) -> Result<usize> {
    let signer = config.signer()?;
    let store = Arc::new(PgStore::connect(&config.database).await?);

    if std::env::args().any(|arg| arg == "--apply-schema") {
        store.apply_schema().await?;
    }

    let wallets = WalletLedger::new(Arc::clone(&store), signer.clone());
    let trail = AuditTrail::new(Arc::clone(&store), signer);

    let mut failures = 0;
    let ids = store.wallet_ids().await?;
    info!(wallets = ids.len(), "Verifying wallets");

    for id in ids {
        let wallet = with_deadline(config.operation_timeout(), wallets.load(id)).await?;
        if !wallets.verify(&wallet) {
            warn!(wallet_id = %id, "Wallet hash mismatch");
            failures += 1;
        }

        let report = with_deadline(config.operation_timeout(), trail.verify_wallet_trail(id)).await?;
        failures += report.invalid.len();
    }

    Ok(failures)
}
