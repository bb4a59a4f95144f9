//! Multi-tenant double-entry ledger core.
//!
//! Invoices, purchases and payments are posted as balanced, immutable entry
//! groups (exactly once per source document); statements are computed from
//! posted entries on demand.

pub mod backfill;
pub mod chart;
pub mod config;
pub mod error;
pub mod models;
pub mod posting;
pub mod registry;
pub mod sources;
pub mod statements;
pub mod storage;

pub use backfill::{BackfillCoordinator, BackfillReport};
pub use config::LedgerConfig;
pub use error::{LedgerError, LedgerResult};
pub use models::{
    Account, AccountType, InvoiceEvent, LedgerEntry, PaymentEvent, PurchaseEvent, ReferenceType,
    SourceEvent, SourceRef,
};
pub use posting::{LedgerPoster, PostOutcome, SkipReason};
pub use registry::AccountRegistry;
pub use sources::{DocumentBundle, SourceDocuments};
pub use statements::{StatementEngine, StatementScope};
pub use storage::LedgerStore;
