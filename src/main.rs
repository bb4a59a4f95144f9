//! Ledger CLI
//!
//! Posts events, runs backfills and prints statements against a ledger
//! database. Output is JSON on stdout; logs go to stderr.
//!
//! Usage:
//!   ledger post invoice.json
//!   ledger backfill --org org-1 --documents history.json
//!   ledger pnl --org org-1 --from 2024-01-01 --to 2024-03-31
//!   ledger trial-balance --org org-1 --as-of 2024-03-31
//!
//! Configuration comes from `ledger.toml` (or `LEDGER_CONFIG_PATH`) plus
//! `LEDGER_*` overrides; `.env` is loaded first.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ledger_core::{
    AccountRegistry, BackfillCoordinator, DocumentBundle, LedgerConfig, LedgerError, LedgerPoster,
    LedgerResult, LedgerStore, SourceEvent, StatementEngine, StatementScope,
};

#[derive(Parser, Debug)]
#[command(name = "ledger")]
#[command(about = "Double-entry ledger: posting, backfill and financial statements")]
struct Cli {
    /// SQLite database path (overrides config)
    #[arg(long, env = "LEDGER_DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ScopeArgs {
    /// Organization to report on
    #[arg(long)]
    org: String,

    /// Restrict to one branch
    #[arg(long)]
    branch: Option<String>,

    /// Query bound in milliseconds (defaults to config)
    #[arg(long)]
    timeout_ms: Option<u64>,
}

impl ScopeArgs {
    fn scope(&self) -> StatementScope {
        let mut scope = StatementScope::organization(self.org.clone());
        if let Some(branch) = &self.branch {
            scope = scope.with_branch(branch.clone());
        }
        if let Some(ms) = self.timeout_ms {
            scope = scope.with_timeout(Duration::from_millis(ms));
        }
        scope
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Post one event from a JSON file (`{"kind": "invoice", ...}`)
    Post { event: PathBuf },

    /// Post all historical documents of an organization
    Backfill {
        #[arg(long)]
        org: String,

        /// JSON file with `invoices`, `purchases` and `payments` arrays
        #[arg(long)]
        documents: PathBuf,

        /// Print the report as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Profit and loss over a period
    Pnl {
        #[command(flatten)]
        scope: ScopeArgs,

        /// Period start (omit for life-to-date)
        #[arg(long)]
        from: Option<NaiveDate>,

        #[arg(long)]
        to: NaiveDate,
    },

    /// Balance sheet as of a date
    BalanceSheet {
        #[command(flatten)]
        scope: ScopeArgs,

        #[arg(long)]
        as_of: NaiveDate,
    },

    /// Trial balance as of a date
    TrialBalance {
        #[command(flatten)]
        scope: ScopeArgs,

        #[arg(long)]
        as_of: NaiveDate,
    },

    /// Entries of one account with running balance
    AccountLedger {
        #[command(flatten)]
        scope: ScopeArgs,

        #[arg(long)]
        code: String,

        #[arg(long)]
        from: Option<NaiveDate>,

        #[arg(long)]
        to: NaiveDate,
    },

    /// List an organization's accounts
    Accounts {
        #[arg(long)]
        org: String,

        /// Create the standard chart first
        #[arg(long)]
        seed: bool,
    },

    /// Report posting groups whose entries do not balance
    Verify {
        #[arg(long)]
        org: Option<String>,
    },
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    retryable: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();

    let mut config = LedgerConfig::from_env();
    if let Some(db) = cli.db {
        config.storage.db_path = db;
    }

    let store = LedgerStore::open(&config.storage)
        .with_context(|| format!("Failed to open ledger database: {}", config.storage.db_path))?;
    let registry = Arc::new(AccountRegistry::new(store.clone()));
    let poster = Arc::new(LedgerPoster::new(store.clone(), registry.clone()));
    // Statements get their own connection: a timed-out query is interrupted
    // and must not take a posting down with it.
    let engine = StatementEngine::new(
        LedgerStore::open(&config.storage).context("Failed to open statement connection")?,
        config.statements.timeout(),
    );

    match cli.command {
        Commands::Post { event } => {
            let contents = std::fs::read_to_string(&event)
                .with_context(|| format!("Failed to read event: {}", event.display()))?;
            let event: SourceEvent =
                serde_json::from_str(&contents).context("Failed to parse event")?;
            emit(poster.post(&event))?;
        }
        Commands::Backfill {
            org,
            documents,
            json,
        } => {
            let documents = DocumentBundle::load(&documents)?;
            let cancel = Arc::new(AtomicBool::new(false));
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Ctrl-C received, stopping backfill after the current document");
                        cancel.store(true, Ordering::SeqCst);
                    }
                });
            }

            let coordinator = BackfillCoordinator::new(poster, config.backfill.clone());
            let report = tokio::task::spawn_blocking(move || {
                coordinator.run(&org, &documents, &cancel)
            })
            .await
            .context("Backfill task failed")??;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report.format_report());
            }
            if !report.is_complete() {
                anyhow::bail!("Backfill incomplete: {}", report.format_status());
            }
        }
        Commands::Pnl { scope, from, to } => {
            emit(engine.profit_and_loss(&scope.scope(), from, to).await)?;
        }
        Commands::BalanceSheet { scope, as_of } => {
            emit(engine.balance_sheet(&scope.scope(), as_of).await)?;
        }
        Commands::TrialBalance { scope, as_of } => {
            emit(engine.trial_balance(&scope.scope(), as_of).await)?;
        }
        Commands::AccountLedger {
            scope,
            code,
            from,
            to,
        } => {
            emit(engine.account_ledger(&scope.scope(), &code, from, to).await)?;
        }
        Commands::Accounts { org, seed } => {
            if seed {
                let ids = registry.seed_standard_chart(&org)?;
                info!(organization_id = %org, accounts = ids.len(), "Standard chart ready");
            }
            emit(store.list_accounts(&org))?;
        }
        Commands::Verify { org } => {
            let unbalanced = store.unbalanced_groups(org.as_deref())?;
            let clean = unbalanced.is_empty();
            emit(Ok(unbalanced))?;
            if !clean {
                anyhow::bail!("Ledger has unbalanced posting groups");
            }
        }
    }

    Ok(())
}

/// Print a result as JSON. Errors are printed as `{error, message, retryable}`
/// and returned so the process exits non-zero.
fn emit<T: Serialize>(result: LedgerResult<T>) -> Result<()> {
    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) => {
            let body = ErrorBody {
                error: e.kind(),
                message: e.to_string(),
                retryable: e.is_retryable(),
            };
            println!("{}", serde_json::to_string_pretty(&body)?);
            Err(anyhow::Error::new::<LedgerError>(e))
        }
    }
}

fn load_env() {
    // Missing .env is fine; config falls back to ledger.toml and defaults.
    let _ = dotenv::dotenv();
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ledger_core=info,ledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
