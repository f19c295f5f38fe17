use crate::config::{AppConfig, ConfigError, ProcessingConfig};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Transactional ledger for bank back-office operations
#[derive(Parser, Debug)]
#[command(name = "bank-ledger")]
#[command(
    about = "Apply deposits, withdrawals and transfers, accrue interest and query history",
    long_about = None
)]
pub struct CliArgs {
    /// YAML configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Number of operations per batch
    #[arg(
        long = "batch-size",
        global = true,
        value_name = "SIZE",
        help = "Number of operations per batch (default: 1000)"
    )]
    pub batch_size: Option<usize>,

    /// Maximum number of operations in flight at once
    #[arg(
        long = "max-concurrent",
        global = true,
        value_name = "COUNT",
        help = "Maximum number of operations in flight (default: CPU cores)"
    )]
    pub max_concurrent: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Apply an operation CSV and print the resulting balances
    Apply {
        /// CSV with columns type,from,to,amount,key
        #[arg(value_name = "OPERATIONS")]
        operations: PathBuf,

        /// CSV of accounts to provision first
        #[arg(long, value_name = "SEED")]
        accounts: Option<PathBuf>,
    },

    /// Run one accrual tick and print the resulting balances
    Accrue {
        #[arg(long, value_name = "SEED")]
        accounts: Option<PathBuf>,

        /// Instant whose period is accrued (RFC 3339, default: now)
        #[arg(long, value_name = "TIMESTAMP")]
        at: Option<DateTime<Utc>>,
    },

    /// Print an account's history for a time window
    History {
        #[arg(long)]
        account: String,

        /// Window start, inclusive (RFC 3339)
        #[arg(long, value_name = "TIMESTAMP")]
        from: DateTime<Utc>,

        /// Window end, exclusive (RFC 3339)
        #[arg(long, value_name = "TIMESTAMP")]
        to: DateTime<Utc>,

        #[arg(long, value_name = "SEED")]
        accounts: Option<PathBuf>,

        /// Operations to apply before querying
        #[arg(long, value_name = "OPERATIONS")]
        operations: Option<PathBuf>,
    },

    /// Run the accrual scheduler until interrupted
    Serve {
        #[arg(long, value_name = "SEED")]
        accounts: Option<PathBuf>,
    },
}

impl CliArgs {
    /// Load the configuration file (or defaults) and apply CLI overrides
    pub fn load_config(&self) -> Result<AppConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::default(),
        };
        config.processing = self.processing_config(&config.processing);
        Ok(config)
    }

    /// Processing settings with CLI overrides applied
    ///
    /// Zero overrides are ignored in favour of the configured value.
    pub fn processing_config(&self, base: &ProcessingConfig) -> ProcessingConfig {
        ProcessingConfig {
            batch_size: self
                .batch_size
                .filter(|&size| size > 0)
                .unwrap_or(base.batch_size),
            max_concurrent: self
                .max_concurrent
                .filter(|&count| count > 0)
                .unwrap_or(base.max_concurrent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[test]
    fn test_apply_parsing() {
        let parsed =
            CliArgs::try_parse_from(["program", "apply", "ops.csv", "--accounts", "seed.csv"])
                .unwrap();
        assert_eq!(
            parsed.command,
            Command::Apply {
                operations: PathBuf::from("ops.csv"),
                accounts: Some(PathBuf::from("seed.csv")),
            }
        );
    }

    #[test]
    fn test_history_parsing() {
        let parsed = CliArgs::try_parse_from([
            "program",
            "history",
            "--account",
            "A",
            "--from",
            "2024-01-01T00:00:00Z",
            "--to",
            "2024-02-01T00:00:00Z",
        ])
        .unwrap();

        match parsed.command {
            Command::History { account, from, to, .. } => {
                assert_eq!(account, "A");
                assert_eq!(from, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
                assert_eq!(to, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
            }
            other => panic!("Expected history, got {:?}", other),
        }
    }

    #[rstest]
    #[case::batch_size(&["program", "--batch-size", "2000", "serve"], Some(2000), None)]
    #[case::max_concurrent(&["program", "serve", "--max-concurrent", "8"], None, Some(8))]
    #[case::no_options(&["program", "serve"], None, None)]
    #[case::all_options(
        &["program", "--batch-size", "2000", "--max-concurrent", "8", "accrue"],
        Some(2000),
        Some(8)
    )]
    fn test_global_options(
        #[case] args: &[&str],
        #[case] batch_size: Option<usize>,
        #[case] max_concurrent: Option<usize>,
    ) {
        let parsed = CliArgs::try_parse_from(args).unwrap();
        assert_eq!(parsed.batch_size, batch_size);
        assert_eq!(parsed.max_concurrent, max_concurrent);
    }

    #[rstest]
    #[case::all_defaults(&["program", "serve"], 1000, 3)]
    #[case::custom_batch_size(&["program", "--batch-size", "2000", "serve"], 2000, 3)]
    #[case::zero_batch_size_falls_back(&["program", "--batch-size", "0", "serve"], 1000, 3)]
    #[case::zero_max_concurrent_falls_back(&["program", "--max-concurrent", "0", "serve"], 1000, 3)]
    #[case::all_custom(&["program", "--batch-size", "5", "--max-concurrent", "8", "serve"], 5, 8)]
    fn test_processing_overrides(
        #[case] args: &[&str],
        #[case] expected_batch_size: usize,
        #[case] expected_max_concurrent: usize,
    ) {
        let base = ProcessingConfig {
            batch_size: 1000,
            max_concurrent: 3,
        };
        let parsed = CliArgs::try_parse_from(args).unwrap();
        let config = parsed.processing_config(&base);

        assert_eq!(config.batch_size, expected_batch_size);
        assert_eq!(config.max_concurrent, expected_max_concurrent);
    }

    #[rstest]
    #[case::missing_command(&["program"])]
    #[case::missing_operations(&["program", "apply"])]
    #[case::bad_timestamp(&["program", "accrue", "--at", "yesterday"])]
    #[case::history_without_window(&["program", "history", "--account", "A"])]
    #[case::unknown_command(&["program", "dispute"])]
    fn test_parsing_errors(#[case] args: &[&str]) {
        assert!(CliArgs::try_parse_from(args).is_err());
    }
}
