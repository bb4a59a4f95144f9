//! Ledger error taxonomy.
//!
//! Every fallible ledger operation returns [`LedgerError`]. Callers that surface
//! errors to users should report [`LedgerError::kind`] together with the
//! `Display` message.

use std::time::Duration;

use crate::models::SourceRef;

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Errors from posting, account resolution and statement computation.
#[derive(Debug)]
pub enum LedgerError {
    /// Missing or malformed organization context. Caller error, never retried.
    Configuration(String),
    /// Account lookup or creation failed for `code`.
    AccountResolution {
        code: String,
        reason: String,
        retryable: bool,
    },
    /// A posting group (or the ledger as a whole) does not balance.
    InvariantViolation(String),
    /// A posting group already exists for this source document.
    IdempotencyConflict(SourceRef),
    /// A statement computation exceeded the caller's bound.
    QueryTimeout(Duration),
    /// Underlying SQLite failure.
    Storage(rusqlite::Error),
}

impl LedgerError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    /// Stable, machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::AccountResolution { .. } => "account_resolution_error",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::IdempotencyConflict(_) => "idempotency_conflict",
            Self::QueryTimeout(_) => "query_timeout",
            Self::Storage(_) => "storage_error",
        }
    }

    /// Whether re-running the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AccountResolution { retryable, .. } => *retryable,
            Self::QueryTimeout(_) => true,
            Self::Storage(e) => is_transient(e),
            Self::Configuration(_) | Self::InvariantViolation(_) | Self::IdempotencyConflict(_) => {
                false
            }
        }
    }

    /// Wrap a storage failure that happened while resolving `code`.
    pub(crate) fn account_storage(code: &str, e: rusqlite::Error) -> Self {
        Self::AccountResolution {
            code: code.to_string(),
            retryable: is_transient(&e),
            reason: e.to_string(),
        }
    }
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            Self::AccountResolution { code, reason, .. } => {
                write!(f, "Could not resolve account {}: {}", code, reason)
            }
            Self::InvariantViolation(msg) => write!(f, "Invariant violation: {}", msg),
            Self::IdempotencyConflict(source) => {
                write!(f, "Posting group already exists for {}", source)
            }
            Self::QueryTimeout(limit) => {
                write!(f, "Statement query exceeded {} ms", limit.as_millis())
            }
            Self::Storage(e) => write!(f, "SQLite error: {}", e),
        }
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e)
    }
}

/// Busy/locked database errors clear up once the competing writer commits.
pub(crate) fn is_transient(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// Unique/primary-key violations signal a lost insert race, not a failure.
pub(crate) fn is_unique_violation(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(err, _) => {
            err.code == rusqlite::ErrorCode::ConstraintViolation
                && (err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReferenceType;

    #[test]
    fn test_kinds_and_retry_policy() {
        let config = LedgerError::configuration("organization_id is empty");
        assert_eq!(config.kind(), "configuration_error");
        assert!(!config.is_retryable());

        let timeout = LedgerError::QueryTimeout(Duration::from_millis(250));
        assert_eq!(timeout.kind(), "query_timeout");
        assert!(timeout.is_retryable());
        assert_eq!(timeout.to_string(), "Statement query exceeded 250 ms");

        let conflict = LedgerError::IdempotencyConflict(SourceRef::new(ReferenceType::Invoice, "inv-1"));
        assert!(!conflict.is_retryable());
        assert_eq!(
            conflict.to_string(),
            "Posting group already exists for invoice:inv-1"
        );
    }

    #[test]
    fn test_unique_violation_detection() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (k TEXT PRIMARY KEY, u TEXT UNIQUE)")
            .unwrap();
        conn.execute("INSERT INTO t (k, u) VALUES ('a', 'x')", []).unwrap();

        let pk = conn
            .execute("INSERT INTO t (k, u) VALUES ('a', 'y')", [])
            .unwrap_err();
        assert!(is_unique_violation(&pk));

        let unique = conn
            .execute("INSERT INTO t (k, u) VALUES ('b', 'x')", [])
            .unwrap_err();
        assert!(is_unique_violation(&unique));
        assert!(!is_transient(&unique));
    }
}
