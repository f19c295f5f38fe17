//! Bank ledger CLI
//!
//! # Usage
//!
//! ```bash
//! bank-ledger apply operations.csv --accounts accounts.csv > balances.csv
//! bank-ledger accrue --accounts accounts.csv --at 2024-03-01T00:00:00Z
//! bank-ledger history --account A --from 2024-01-01T00:00:00Z --to 2024-02-01T00:00:00Z \
//!     --accounts accounts.csv --operations operations.csv
//! bank-ledger --config ledger.yaml serve
//! ```
//!
//! CSV output goes to stdout, logs to stderr.
//!
//! # Exit Codes
//!
//! - 0: Success
//! - 1: Error (bad configuration, unreadable input, unreachable store, etc.)

use bank_ledger_engine::{cli, logging};
use std::process;

#[tokio::main]
async fn main() {
    let args = cli::parse_args();

    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };
    logging::init(&config.logging);

    let mut output = std::io::stdout();
    if let Err(e) = cli::run(args, config, &mut output).await {
        tracing::error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
