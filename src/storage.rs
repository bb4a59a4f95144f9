//! SQLite-backed ledger storage
//!
//! Correctness lives in the schema, not in this process:
//! - `UNIQUE(organization_id, code)` on accounts serializes concurrent creation
//! - `UNIQUE(organization_id, reference_type, reference_id)` on the posting-group
//!   anchor makes a second post of the same document fail, whichever process
//!   attempts it; other organizations may reuse the same document id
//! - CHECK constraints keep every entry single-sided and non-negative
//! - triggers reject UPDATE/DELETE on entries and account type changes
//!
//! Several `LedgerStore` instances may open the same database file; each owns
//! its own connection. Posting groups are written in a single `BEGIN IMMEDIATE`
//! transaction so readers never see a partial group.

use chrono::NaiveDate;
use parking_lot::Mutex;
use rusqlite::{
    params, Connection, InterruptHandle, OpenFlags, OptionalExtension, TransactionBehavior,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::{is_unique_violation, LedgerError, LedgerResult};
use crate::models::{
    from_minor, to_minor, Account, AccountId, AccountType, LedgerEntry, ReferenceType, SourceRef,
};

const DATE_FORMAT: &str = "%Y-%m-%d";

const SCHEMA_SQL: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    organization_id TEXT NOT NULL,
    code TEXT NOT NULL,
    name TEXT NOT NULL,
    account_type TEXT NOT NULL
        CHECK (account_type IN ('asset', 'liability', 'equity', 'income', 'expense')),
    is_group INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    UNIQUE(organization_id, code)
);

-- One anchor row per organization and source document, for the lifetime of the system
CREATE TABLE IF NOT EXISTS posting_groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    reference_type TEXT NOT NULL,
    reference_id TEXT NOT NULL,
    organization_id TEXT NOT NULL,
    total_minor INTEGER NOT NULL,
    posted_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    UNIQUE(organization_id, reference_type, reference_id)
);

CREATE TABLE IF NOT EXISTS ledger_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id INTEGER NOT NULL REFERENCES posting_groups(id),
    organization_id TEXT NOT NULL,
    branch_id TEXT,
    account_id TEXT NOT NULL REFERENCES accounts(id),
    entry_date TEXT NOT NULL,
    debit_minor INTEGER NOT NULL CHECK (debit_minor >= 0),
    credit_minor INTEGER NOT NULL CHECK (credit_minor >= 0),
    reference_type TEXT NOT NULL,
    reference_id TEXT NOT NULL,
    counterparty_id TEXT,
    CHECK ((debit_minor > 0 AND credit_minor = 0) OR (debit_minor = 0 AND credit_minor > 0))
);

-- Statement aggregation
CREATE INDEX IF NOT EXISTS idx_ledger_entries_org_account_date
    ON ledger_entries(organization_id, account_id, entry_date);

CREATE INDEX IF NOT EXISTS idx_ledger_entries_org_date
    ON ledger_entries(organization_id, entry_date);

-- Idempotency checks and audit trace
CREATE INDEX IF NOT EXISTS idx_ledger_entries_reference
    ON ledger_entries(organization_id, reference_type, reference_id);

CREATE TRIGGER IF NOT EXISTS ledger_entries_immutable_update
    BEFORE UPDATE ON ledger_entries
BEGIN
    SELECT RAISE(ABORT, 'ledger entries are immutable');
END;

CREATE TRIGGER IF NOT EXISTS ledger_entries_immutable_delete
    BEFORE DELETE ON ledger_entries
BEGIN
    SELECT RAISE(ABORT, 'ledger entries are immutable');
END;

CREATE TRIGGER IF NOT EXISTS accounts_type_immutable
    BEFORE UPDATE OF account_type ON accounts
    WHEN NEW.account_type <> OLD.account_type
BEGIN
    SELECT RAISE(ABORT, 'account type is immutable');
END;
"#;

/// Debit/credit totals for one account type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeTotals {
    pub account_type: AccountType,
    pub debit: Decimal,
    pub credit: Decimal,
}

/// Debit/credit totals for one account.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountTotals {
    pub account_id: AccountId,
    pub code: String,
    pub name: String,
    pub account_type: AccountType,
    pub debit: Decimal,
    pub credit: Decimal,
}

/// A posting group whose lines do not balance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnbalancedGroup {
    pub organization_id: String,
    pub source: SourceRef,
    pub debit: Decimal,
    pub credit: Decimal,
}

/// Ledger storage handle. Cloning shares the underlying connection.
#[derive(Clone)]
pub struct LedgerStore {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

impl LedgerStore {
    /// Open or create the ledger database described by `config`.
    pub fn open(config: &StorageConfig) -> LedgerResult<Self> {
        let path = Path::new(&config.db_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    LedgerError::configuration(format!(
                        "cannot create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(&config.db_path, flags)?;
        conn.busy_timeout(config.busy_timeout())?;

        if config.wal_mode {
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;

            let journal_mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .unwrap_or_default();
            if journal_mode.to_lowercase() != "wal" {
                warn!("WAL mode not active, journal_mode = {}", journal_mode);
            }
        }

        conn.execute_batch(SCHEMA_SQL)?;

        info!(path = %config.db_path, "Ledger storage opened");

        Ok(Self::from_connection(conn))
    }

    /// Open in-memory storage (for testing).
    pub fn open_memory() -> LedgerResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;

        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
        }
    }

    /// Abort whatever statement this handle's connection is running.
    ///
    /// The interrupted call fails with `SQLITE_INTERRUPT`; a posting group
    /// being written at that moment rolls back whole. No-op when idle.
    pub fn interrupt(&self) {
        self.interrupt.interrupt();
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    /// Look up an account by its per-organization code.
    pub fn find_account(&self, organization_id: &str, code: &str) -> LedgerResult<Option<Account>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, organization_id, code, name, account_type, is_group, is_active
             FROM accounts WHERE organization_id = ?1 AND code = ?2",
        )?;
        let account = stmt
            .query_row(params![organization_id, code], row_to_account)
            .optional()?;
        Ok(account)
    }

    /// Insert `account` unless (organization, code) already exists.
    ///
    /// Returns `true` when this call created the row. Losing a creation race is
    /// not an error: the caller re-reads the winner's row.
    pub fn insert_account_if_absent(&self, account: &Account) -> LedgerResult<bool> {
        let conn = self.conn.lock();
        let changes = conn.execute(
            "INSERT INTO accounts (id, organization_id, code, name, account_type, is_group, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(organization_id, code) DO NOTHING",
            params![
                account.id.to_string(),
                account.organization_id,
                account.code,
                account.name,
                account.account_type.as_str(),
                account.is_group,
                account.is_active,
            ],
        )?;
        Ok(changes > 0)
    }

    /// Mark an account inactive. Returns `false` if no such account exists.
    pub fn deactivate_account(&self, organization_id: &str, code: &str) -> LedgerResult<bool> {
        let conn = self.conn.lock();
        let changes = conn.execute(
            "UPDATE accounts SET is_active = 0 WHERE organization_id = ?1 AND code = ?2",
            params![organization_id, code],
        )?;
        Ok(changes > 0)
    }

    /// All accounts of an organization, ordered by code.
    pub fn list_accounts(&self, organization_id: &str) -> LedgerResult<Vec<Account>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, organization_id, code, name, account_type, is_group, is_active
             FROM accounts WHERE organization_id = ?1 ORDER BY code",
        )?;
        let accounts = stmt
            .query_map([organization_id], row_to_account)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(accounts)
    }

    // =========================================================================
    // Posting groups
    // =========================================================================

    /// Whether `organization_id` already has a posting group for `source`.
    pub fn is_posted(&self, organization_id: &str, source: &SourceRef) -> LedgerResult<bool> {
        let conn = self.conn.lock();
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM posting_groups
                           WHERE organization_id = ?1 AND reference_type = ?2 AND reference_id = ?3)",
            params![organization_id, source.reference_type.as_str(), source.reference_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Persist a whole posting group atomically.
    ///
    /// Fails with `InvariantViolation` (nothing written) if the lines do not
    /// balance, with `IdempotencyConflict` if another writer already anchored
    /// a group for `source` in this organization, and with `AccountResolution`
    /// if an account is missing from the organization, deactivated or a group
    /// account at commit time.
    pub fn insert_posting_group(
        &self,
        source: &SourceRef,
        organization_id: &str,
        entries: &[LedgerEntry],
    ) -> LedgerResult<()> {
        if entries.is_empty() {
            return Err(LedgerError::invariant(format!(
                "posting group {} has no entries",
                source
            )));
        }

        let mut rows = Vec::with_capacity(entries.len());
        let (mut total_debit, mut total_credit) = (0i64, 0i64);
        for entry in entries {
            if entry.source() != *source || entry.organization_id != organization_id {
                return Err(LedgerError::invariant(format!(
                    "entry for {} ({}) does not belong to group {} ({})",
                    entry.source(),
                    entry.organization_id,
                    source,
                    organization_id
                )));
            }
            let debit = to_minor(entry.debit)?;
            let credit = to_minor(entry.credit)?;
            total_debit += debit;
            total_credit += credit;
            rows.push((entry, debit, credit));
        }
        if total_debit != total_credit {
            return Err(LedgerError::invariant(format!(
                "posting group {} is unbalanced: debit {} != credit {}",
                source,
                from_minor(total_debit),
                from_minor(total_credit)
            )));
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let anchored = tx.execute(
            "INSERT INTO posting_groups (reference_type, reference_id, organization_id, total_minor)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                source.reference_type.as_str(),
                source.reference_id,
                organization_id,
                total_debit
            ],
        );
        match anchored {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(LedgerError::IdempotencyConflict(source.clone()));
            }
            Err(e) => return Err(e.into()),
        }
        let group_id = tx.last_insert_rowid();

        // Checked under the write lock: a registry cache may be stale.
        {
            let mut stmt = tx.prepare_cached(
                "SELECT code, is_active, is_group FROM accounts
                 WHERE id = ?1 AND organization_id = ?2",
            )?;
            let mut checked = HashSet::new();
            for entry in entries {
                if !checked.insert(entry.account_id) {
                    continue;
                }
                let account: Option<(String, bool, bool)> = stmt
                    .query_row(params![entry.account_id.to_string(), organization_id], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })
                    .optional()?;
                let reason = match &account {
                    None => Some("account does not exist in this organization"),
                    Some((_, false, _)) => Some("account is deactivated"),
                    Some((_, _, true)) => Some("group accounts cannot be posted to"),
                    Some(_) => None,
                };
                if let Some(reason) = reason {
                    return Err(LedgerError::AccountResolution {
                        code: account
                            .map(|(code, _, _)| code)
                            .unwrap_or_else(|| entry.account_id.to_string()),
                        reason: reason.to_string(),
                        retryable: false,
                    });
                }
            }
        }

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO ledger_entries
                 (group_id, organization_id, branch_id, account_id, entry_date,
                  debit_minor, credit_minor, reference_type, reference_id, counterparty_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for (entry, debit, credit) in &rows {
                stmt.execute(params![
                    group_id,
                    entry.organization_id,
                    entry.branch_id,
                    entry.account_id.to_string(),
                    entry.date.format(DATE_FORMAT).to_string(),
                    debit,
                    credit,
                    entry.reference_type.as_str(),
                    entry.reference_id,
                    entry.counterparty_id,
                ])?;
            }
        }

        tx.commit()?;

        debug!(source = %source, lines = rows.len(), "Posting group committed");
        Ok(())
    }

    /// Entries of `organization_id`'s posting group for `source`, in
    /// insertion order.
    pub fn entries_for(
        &self,
        organization_id: &str,
        source: &SourceRef,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT organization_id, branch_id, account_id, entry_date, debit_minor,
                    credit_minor, reference_type, reference_id, counterparty_id
             FROM ledger_entries
             WHERE organization_id = ?1 AND reference_type = ?2 AND reference_id = ?3
             ORDER BY id",
        )?;
        let entries = stmt
            .query_map(
                params![organization_id, source.reference_type.as_str(), source.reference_id],
                row_to_entry,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Number of entries, optionally restricted to one organization.
    pub fn entry_count(&self, organization_id: Option<&str>) -> LedgerResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM ledger_entries WHERE ?1 IS NULL OR organization_id = ?1",
            params![organization_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Number of posting groups, optionally restricted to one organization.
    pub fn group_count(&self, organization_id: Option<&str>) -> LedgerResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM posting_groups WHERE ?1 IS NULL OR organization_id = ?1",
            params![organization_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // =========================================================================
    // Aggregation
    // =========================================================================

    /// Debit/credit totals per account type over `[start, end]` (start open
    /// when `None`), optionally for one branch.
    pub fn totals_by_type(
        &self,
        organization_id: &str,
        start: Option<NaiveDate>,
        end: NaiveDate,
        branch_id: Option<&str>,
    ) -> LedgerResult<Vec<TypeTotals>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT a.account_type, COALESCE(SUM(e.debit_minor), 0), COALESCE(SUM(e.credit_minor), 0)
             FROM ledger_entries e
             JOIN accounts a ON a.id = e.account_id
             WHERE e.organization_id = ?1
               AND (?2 IS NULL OR e.entry_date >= ?2)
               AND e.entry_date <= ?3
               AND (?4 IS NULL OR e.branch_id = ?4)
             GROUP BY a.account_type",
        )?;
        let totals = stmt
            .query_map(
                params![
                    organization_id,
                    start.map(|d| d.format(DATE_FORMAT).to_string()),
                    end.format(DATE_FORMAT).to_string(),
                    branch_id
                ],
                |row| {
                    Ok(TypeTotals {
                        account_type: parse_column(row, 0, AccountType::from_str)?,
                        debit: from_minor(row.get(1)?),
                        credit: from_minor(row.get(2)?),
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(totals)
    }

    /// Debit/credit totals per account for entries dated on or before `as_of`,
    /// ordered by account code.
    pub fn totals_by_account(
        &self,
        organization_id: &str,
        as_of: NaiveDate,
        branch_id: Option<&str>,
    ) -> LedgerResult<Vec<AccountTotals>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT a.id, a.code, a.name, a.account_type,
                    SUM(e.debit_minor), SUM(e.credit_minor)
             FROM ledger_entries e
             JOIN accounts a ON a.id = e.account_id
             WHERE e.organization_id = ?1
               AND e.entry_date <= ?2
               AND (?3 IS NULL OR e.branch_id = ?3)
             GROUP BY a.id
             ORDER BY a.code ASC",
        )?;
        let totals = stmt
            .query_map(
                params![
                    organization_id,
                    as_of.format(DATE_FORMAT).to_string(),
                    branch_id
                ],
                |row| {
                    Ok(AccountTotals {
                        account_id: parse_column(row, 0, Uuid::parse_str)?,
                        code: row.get(1)?,
                        name: row.get(2)?,
                        account_type: parse_column(row, 3, AccountType::from_str)?,
                        debit: from_minor(row.get(4)?),
                        credit: from_minor(row.get(5)?),
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(totals)
    }

    /// Entries posted to one account within `[start, end]`, oldest first.
    pub fn account_entries(
        &self,
        account_id: AccountId,
        start: Option<NaiveDate>,
        end: NaiveDate,
    ) -> LedgerResult<Vec<LedgerEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT organization_id, branch_id, account_id, entry_date, debit_minor,
                    credit_minor, reference_type, reference_id, counterparty_id
             FROM ledger_entries
             WHERE account_id = ?1
               AND (?2 IS NULL OR entry_date >= ?2)
               AND entry_date <= ?3
             ORDER BY entry_date, id",
        )?;
        let entries = stmt
            .query_map(
                params![
                    account_id.to_string(),
                    start.map(|d| d.format(DATE_FORMAT).to_string()),
                    end.format(DATE_FORMAT).to_string()
                ],
                row_to_entry,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Audit scan: posting groups whose stored lines do not balance.
    ///
    /// Atomic group writes make this unreachable in normal operation; a
    /// non-empty result means the database was modified outside the ledger.
    pub fn unbalanced_groups(&self, organization_id: Option<&str>) -> LedgerResult<Vec<UnbalancedGroup>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT organization_id, reference_type, reference_id,
                    SUM(debit_minor), SUM(credit_minor)
             FROM ledger_entries
             WHERE ?1 IS NULL OR organization_id = ?1
             GROUP BY organization_id, reference_type, reference_id
             HAVING SUM(debit_minor) <> SUM(credit_minor)
             ORDER BY organization_id, reference_type, reference_id",
        )?;
        let groups = stmt
            .query_map(params![organization_id], |row| {
                Ok(UnbalancedGroup {
                    organization_id: row.get(0)?,
                    source: SourceRef::new(
                        parse_column(row, 1, ReferenceType::from_str)?,
                        row.get::<_, String>(2)?,
                    ),
                    debit: from_minor(row.get(3)?),
                    credit: from_minor(row.get(4)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    #[cfg(test)]
    pub(crate) fn lock_for_test(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

fn row_to_account(row: &rusqlite::Row) -> rusqlite::Result<Account> {
    Ok(Account {
        id: parse_column(row, 0, Uuid::parse_str)?,
        organization_id: row.get(1)?,
        code: row.get(2)?,
        name: row.get(3)?,
        account_type: parse_column(row, 4, AccountType::from_str)?,
        is_group: row.get(5)?,
        is_active: row.get(6)?,
    })
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<LedgerEntry> {
    Ok(LedgerEntry {
        organization_id: row.get(0)?,
        branch_id: row.get(1)?,
        account_id: parse_column(row, 2, Uuid::parse_str)?,
        date: parse_column(row, 3, |s| NaiveDate::parse_from_str(s, DATE_FORMAT))?,
        debit: from_minor(row.get(4)?),
        credit: from_minor(row.get(5)?),
        reference_type: parse_column(row, 6, ReferenceType::from_str)?,
        reference_id: row.get(7)?,
        counterparty_id: row.get(8)?,
    })
}

/// Read a TEXT column and parse it into a typed value.
fn parse_column<T, E, F>(row: &rusqlite::Row, idx: usize, parse: F) -> rusqlite::Result<T>
where
    F: FnOnce(&str) -> Result<T, E>,
    E: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    parse(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid value {:?}: {}", raw, e).into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap()
    }

    fn account(org: &str, code: &str, account_type: AccountType) -> Account {
        Account {
            id: Uuid::new_v4(),
            organization_id: org.to_string(),
            code: code.to_string(),
            name: format!("Account {}", code),
            account_type,
            is_group: false,
            is_active: true,
        }
    }

    fn line(source: &SourceRef, account_id: AccountId, debit: &str, credit: &str) -> LedgerEntry {
        LedgerEntry {
            organization_id: "org-1".to_string(),
            branch_id: None,
            account_id,
            date: date("2024-01-15"),
            debit: d(debit),
            credit: d(credit),
            reference_type: source.reference_type,
            reference_id: source.reference_id.clone(),
            counterparty_id: None,
        }
    }

    fn seeded() -> (LedgerStore, Account, Account) {
        let store = LedgerStore::open_memory().unwrap();
        let cash = account("org-1", "1000", AccountType::Asset);
        let sales = account("org-1", "4000", AccountType::Income);
        assert!(store.insert_account_if_absent(&cash).unwrap());
        assert!(store.insert_account_if_absent(&sales).unwrap());
        (store, cash, sales)
    }

    #[test]
    fn test_account_insert_is_idempotent() {
        let store = LedgerStore::open_memory().unwrap();
        let first = account("org-1", "1000", AccountType::Asset);
        let second = account("org-1", "1000", AccountType::Asset);

        assert!(store.insert_account_if_absent(&first).unwrap());
        assert!(!store.insert_account_if_absent(&second).unwrap());

        let found = store.find_account("org-1", "1000").unwrap().unwrap();
        assert_eq!(found.id, first.id);
        assert!(store.find_account("org-2", "1000").unwrap().is_none());
    }

    #[test]
    fn test_account_type_is_immutable() {
        let (store, cash, _) = seeded();
        let conn = store.lock_for_test();
        let err = conn
            .execute(
                "UPDATE accounts SET account_type = 'expense' WHERE id = ?1",
                [cash.id.to_string()],
            )
            .unwrap_err();
        assert!(err.to_string().contains("account type is immutable"));
    }

    #[test]
    fn test_posting_group_round_trip() {
        let (store, cash, sales) = seeded();
        let source = SourceRef::new(ReferenceType::Invoice, "inv-1");
        let entries = vec![
            line(&source, cash.id, "100.00", "0"),
            line(&source, sales.id, "0", "100.00"),
        ];

        store.insert_posting_group(&source, "org-1", &entries).unwrap();

        assert!(store.is_posted("org-1", &source).unwrap());
        assert!(!store.is_posted("org-2", &source).unwrap());
        assert_eq!(store.entries_for("org-1", &source).unwrap(), entries);
        assert_eq!(store.entry_count(Some("org-1")).unwrap(), 2);
        assert_eq!(store.group_count(None).unwrap(), 1);
    }

    #[test]
    fn test_duplicate_group_is_conflict() {
        let (store, cash, sales) = seeded();
        let source = SourceRef::new(ReferenceType::Invoice, "inv-1");
        let entries = vec![
            line(&source, cash.id, "10", "0"),
            line(&source, sales.id, "0", "10"),
        ];
        store.insert_posting_group(&source, "org-1", &entries).unwrap();

        let err = store
            .insert_posting_group(&source, "org-1", &entries)
            .unwrap_err();
        assert!(matches!(err, LedgerError::IdempotencyConflict(_)));
        assert_eq!(store.entry_count(None).unwrap(), 2);
    }

    #[test]
    fn test_unbalanced_group_writes_nothing() {
        let (store, cash, sales) = seeded();
        let source = SourceRef::new(ReferenceType::Invoice, "inv-1");
        let entries = vec![
            line(&source, cash.id, "10", "0"),
            line(&source, sales.id, "0", "9.99"),
        ];

        let err = store
            .insert_posting_group(&source, "org-1", &entries)
            .unwrap_err();
        assert_eq!(err.kind(), "invariant_violation");
        assert!(!store.is_posted("org-1", &source).unwrap());
        assert_eq!(store.entry_count(None).unwrap(), 0);
    }

    #[test]
    fn test_same_reference_in_two_organizations() {
        let (store, cash, sales) = seeded();
        let other_cash = account("org-2", "1000", AccountType::Asset);
        let other_sales = account("org-2", "4000", AccountType::Income);
        store.insert_account_if_absent(&other_cash).unwrap();
        store.insert_account_if_absent(&other_sales).unwrap();

        let source = SourceRef::new(ReferenceType::Invoice, "inv-1");
        store
            .insert_posting_group(
                &source,
                "org-1",
                &[line(&source, cash.id, "10", "0"), line(&source, sales.id, "0", "10")],
            )
            .unwrap();

        let mut entries = vec![
            line(&source, other_cash.id, "7", "0"),
            line(&source, other_sales.id, "0", "7"),
        ];
        for e in &mut entries {
            e.organization_id = "org-2".to_string();
        }
        store.insert_posting_group(&source, "org-2", &entries).unwrap();

        assert_eq!(store.group_count(None).unwrap(), 2);
        assert_eq!(store.entries_for("org-2", &source).unwrap(), entries);
        assert_eq!(store.entries_for("org-1", &source).unwrap().len(), 2);
    }

    #[test]
    fn test_unpostable_account_rejected_at_commit() {
        let (store, cash, sales) = seeded();
        let source = SourceRef::new(ReferenceType::Invoice, "inv-1");
        let entries = vec![
            line(&source, cash.id, "10", "0"),
            line(&source, sales.id, "0", "10"),
        ];
        assert!(store.deactivate_account("org-1", "4000").unwrap());

        let err = store
            .insert_posting_group(&source, "org-1", &entries)
            .unwrap_err();
        match err {
            LedgerError::AccountResolution { code, retryable, .. } => {
                assert_eq!(code, "4000");
                assert!(!retryable);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!store.is_posted("org-1", &source).unwrap());
        assert_eq!(store.entry_count(None).unwrap(), 0);

        // An account of another organization is rejected too.
        let foreign = account("org-2", "4000", AccountType::Income);
        store.insert_account_if_absent(&foreign).unwrap();
        let err = store
            .insert_posting_group(
                &source,
                "org-1",
                &[line(&source, cash.id, "10", "0"), line(&source, foreign.id, "0", "10")],
            )
            .unwrap_err();
        assert_eq!(err.kind(), "account_resolution_error");
        assert_eq!(store.group_count(None).unwrap(), 0);
    }

    #[test]
    fn test_interrupt_aborts_running_query() {
        let file = NamedTempFile::new().unwrap();
        let config = StorageConfig {
            db_path: file.path().to_string_lossy().to_string(),
            ..StorageConfig::default()
        };
        let store = LedgerStore::open(&config).unwrap();

        let result = std::thread::scope(|scope| {
            let slow = scope.spawn(|| {
                let conn = store.lock_for_test();
                conn.query_row(
                    "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 1000000000)
                     SELECT COUNT(*) FROM n",
                    [],
                    |row| row.get::<_, i64>(0),
                )
            });
            while !slow.is_finished() {
                store.interrupt();
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            slow.join().unwrap()
        });

        match result {
            Err(rusqlite::Error::SqliteFailure(e, _)) => {
                assert_eq!(e.code, rusqlite::ErrorCode::OperationInterrupted);
            }
            other => panic!("query was not interrupted: {:?}", other),
        }
        // The connection stays usable afterwards.
        assert_eq!(store.entry_count(None).unwrap(), 0);
    }

    #[test]
    fn test_double_sided_line_rolls_back_group() {
        let (store, cash, sales) = seeded();
        let source = SourceRef::new(ReferenceType::Invoice, "inv-1");
        // Balanced in total, but the first line is two-sided.
        let entries = vec![
            line(&source, cash.id, "10", "5"),
            line(&source, sales.id, "0", "5"),
        ];

        assert!(store.insert_posting_group(&source, "org-1", &entries).is_err());
        assert!(!store.is_posted("org-1", &source).unwrap());
        assert_eq!(store.entry_count(None).unwrap(), 0);
    }

    #[test]
    fn test_entries_are_immutable() {
        let (store, cash, sales) = seeded();
        let source = SourceRef::new(ReferenceType::Invoice, "inv-1");
        store
            .insert_posting_group(
                &source,
                "org-1",
                &[
                    line(&source, cash.id, "10", "0"),
                    line(&source, sales.id, "0", "10"),
                ],
            )
            .unwrap();

        let conn = store.lock_for_test();
        assert!(conn
            .execute("UPDATE ledger_entries SET debit_minor = 1", [])
            .is_err());
        assert!(conn.execute("DELETE FROM ledger_entries", []).is_err());
    }

    #[test]
    fn test_totals_respect_window_and_branch() {
        let (store, cash, sales) = seeded();
        for (id, day, branch) in [
            ("inv-1", "2024-01-10", Some("north")),
            ("inv-2", "2024-02-10", Some("south")),
            ("inv-3", "2024-03-10", Some("north")),
        ] {
            let source = SourceRef::new(ReferenceType::Invoice, id);
            let mut entries = vec![
                line(&source, cash.id, "50", "0"),
                line(&source, sales.id, "0", "50"),
            ];
            for e in &mut entries {
                e.date = date(day);
                e.branch_id = branch.map(str::to_string);
            }
            store.insert_posting_group(&source, "org-1", &entries).unwrap();
        }

        let feb = store
            .totals_by_type("org-1", Some(date("2024-02-01")), date("2024-03-31"), None)
            .unwrap();
        let income = feb
            .iter()
            .find(|t| t.account_type == AccountType::Income)
            .unwrap();
        assert_eq!(income.credit, d("100"));

        let north = store
            .totals_by_account("org-1", date("2024-12-31"), Some("north"))
            .unwrap();
        assert_eq!(north.len(), 2);
        assert_eq!(north[0].code, "1000");
        assert_eq!(north[0].debit, d("100"));
        assert_eq!(north[1].credit, d("100"));

        let cash_lines = store
            .account_entries(cash.id, None, date("2024-02-28"))
            .unwrap();
        assert_eq!(cash_lines.len(), 2);
        assert!(store.unbalanced_groups(None).unwrap().is_empty());
    }

    #[test]
    fn test_separate_connections_share_constraints() {
        let file = NamedTempFile::new().unwrap();
        let config = StorageConfig {
            db_path: file.path().to_string_lossy().to_string(),
            ..StorageConfig::default()
        };
        let a = LedgerStore::open(&config).unwrap();
        let b = LedgerStore::open(&config).unwrap();

        let first = account("org-1", "1100", AccountType::Asset);
        let second = account("org-1", "1100", AccountType::Asset);
        assert!(a.insert_account_if_absent(&first).unwrap());
        assert!(!b.insert_account_if_absent(&second).unwrap());
        assert_eq!(
            b.find_account("org-1", "1100").unwrap().unwrap().id,
            first.id
        );
    }
}
