//! Ledger configuration
//!
//! Loaded from a TOML file (`LEDGER_CONFIG_PATH`, default `ledger.toml`), with
//! individual environment overrides applied on top.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub statements: StatementConfig,

    #[serde(default)]
    pub backfill: BackfillConfig,
}

/// SQLite storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// How long a writer waits for a competing writer before failing (ms)
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Enable WAL mode so statement reads don't block posting
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_db_path() -> String {
    "ledger.db".to_string()
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}
fn default_true() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            wal_mode: true,
        }
    }
}

impl StorageConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Statement computation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementConfig {
    /// Default bound on a single statement query (ms)
    #[serde(default = "default_statement_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_statement_timeout_ms() -> u64 {
    30_000
}

impl Default for StatementConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_statement_timeout_ms(),
        }
    }
}

impl StatementConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Backfill run settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    /// Abort the run on the first failing document instead of continuing
    #[serde(default)]
    pub stop_on_error: bool,

    /// Log progress every N documents (0 = only at the end)
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,
}

fn default_progress_every() -> usize {
    500
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            stop_on_error: false,
            progress_every: default_progress_every(),
        }
    }
}

impl LedgerConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from the configured file (or defaults), then apply env overrides
    pub fn from_env() -> Self {
        let path =
            std::env::var("LEDGER_CONFIG_PATH").unwrap_or_else(|_| "ledger.toml".to_string());

        let mut config = Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default ledger config ({}): {}", path, e);
            Self::default()
        });

        if let Ok(db_path) = std::env::var("LEDGER_DB_PATH") {
            config.storage.db_path = db_path;
        }
        if let Some(ms) = env_u64("LEDGER_BUSY_TIMEOUT_MS") {
            config.storage.busy_timeout_ms = ms;
        }
        if let Some(ms) = env_u64("LEDGER_STATEMENT_TIMEOUT_MS") {
            config.statements.timeout_ms = ms;
        }

        config
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

fn env_u64(var: &str) -> Option<u64> {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|&v| v > 0)
}
