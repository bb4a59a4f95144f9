//! Financial statements over posted entries.
//!
//! Every statement runs its SQLite aggregation on the blocking pool and is
//! bounded by the scope's timeout. A query that exceeds the bound returns
//! `QueryTimeout` and is interrupted on its connection, so it releases the
//! connection instead of running to completion. Give the engine its own
//! `LedgerStore`: an interrupt aborts whatever that connection is running.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::models::{Account, AccountType, ReferenceType};
use crate::storage::{LedgerStore, TypeTotals};

/// Who a statement is for, and how long it may take.
#[derive(Debug, Clone)]
pub struct StatementScope {
    pub organization_id: String,
    pub branch_id: Option<String>,
    /// Overrides the engine's default bound.
    pub timeout: Option<Duration>,
}

impl StatementScope {
    pub fn organization(organization_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            branch_id: None,
            timeout: None,
        }
    }

    pub fn with_branch(mut self, branch_id: impl Into<String>) -> Self {
        self.branch_id = Some(branch_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn validate(&self) -> LedgerResult<()> {
        if self.organization_id.trim().is_empty() {
            return Err(LedgerError::configuration(
                "statement requested without an organization",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Period {
    /// `None` means life-to-date.
    pub start: Option<NaiveDate>,
    pub end: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfitAndLoss {
    pub period: Period,
    pub income: Decimal,
    pub expenses: Decimal,
    pub net_profit: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceSheet {
    pub as_of: NaiveDate,
    pub assets: Decimal,
    pub liabilities: Decimal,
    /// Includes retained earnings.
    pub equity: Decimal,
    pub retained_earnings: Decimal,
}

impl BalanceSheet {
    /// assets - (liabilities + equity); zero for a sound ledger.
    pub fn imbalance(&self) -> Decimal {
        self.assets - (self.liabilities + self.equity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialBalanceRow {
    pub account_code: String,
    pub account_name: String,
    pub account_type: AccountType,
    pub debit: Decimal,
    pub credit: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialBalanceTotals {
    pub debit: Decimal,
    pub credit: Decimal,
    pub diff: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialBalance {
    pub as_of: NaiveDate,
    pub rows: Vec<TrialBalanceRow>,
    pub totals: TrialBalanceTotals,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountLedgerLine {
    pub date: NaiveDate,
    pub reference_type: ReferenceType,
    pub reference_id: String,
    pub counterparty_id: Option<String>,
    pub debit: Decimal,
    pub credit: Decimal,
    /// Running balance in the account's normal direction.
    pub balance: Decimal,
}

/// Entry listing for one account with running balance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountLedger {
    pub account: Account,
    pub period: Period,
    pub opening_balance: Decimal,
    pub lines: Vec<AccountLedgerLine>,
    pub closing_balance: Decimal,
}

const INTERRUPT_RETRY: Duration = Duration::from_millis(10);

/// Computes statements for any organization in the store.
#[derive(Clone)]
pub struct StatementEngine {
    store: LedgerStore,
    default_timeout: Duration,
}

impl StatementEngine {
    pub fn new(store: LedgerStore, default_timeout: Duration) -> Self {
        Self {
            store,
            default_timeout,
        }
    }

    /// Income and expenses over `[start, end]` (inclusive; no start means
    /// life-to-date).
    pub async fn profit_and_loss(
        &self,
        scope: &StatementScope,
        start: Option<NaiveDate>,
        end: NaiveDate,
    ) -> LedgerResult<ProfitAndLoss> {
        scope.validate()?;
        if let Some(start) = start {
            if start > end {
                return Err(LedgerError::configuration(format!(
                    "period start {} is after end {}",
                    start, end
                )));
            }
        }
        let s = scope.clone();
        self.run("profit_and_loss", scope, move |store| {
            compute_profit_and_loss(store, &s, start, end)
        })
        .await
    }

    /// Cumulative position on `as_of`, with life-to-date profit folded into
    /// equity.
    pub async fn balance_sheet(
        &self,
        scope: &StatementScope,
        as_of: NaiveDate,
    ) -> LedgerResult<BalanceSheet> {
        scope.validate()?;
        let s = scope.clone();
        self.run("balance_sheet", scope, move |store| {
            compute_balance_sheet(store, &s, as_of)
        })
        .await
    }

    /// Per-account debit and credit totals on `as_of`, ordered by code.
    pub async fn trial_balance(
        &self,
        scope: &StatementScope,
        as_of: NaiveDate,
    ) -> LedgerResult<TrialBalance> {
        scope.validate()?;
        let s = scope.clone();
        self.run("trial_balance", scope, move |store| {
            compute_trial_balance(store, &s, as_of)
        })
        .await
    }

    /// Entries of one account within `[start, end]` with running balance.
    pub async fn account_ledger(
        &self,
        scope: &StatementScope,
        code: &str,
        start: Option<NaiveDate>,
        end: NaiveDate,
    ) -> LedgerResult<AccountLedger> {
        scope.validate()?;
        let s = scope.clone();
        let code = code.to_string();
        self.run("account_ledger", scope, move |store| {
            compute_account_ledger(store, &s, &code, start, end)
        })
        .await
    }

    async fn run<T, F>(&self, statement: &'static str, scope: &StatementScope, query: F) -> LedgerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&LedgerStore) -> LedgerResult<T> + Send + 'static,
    {
        let limit = scope.timeout.unwrap_or(self.default_timeout);
        let store = self.store.clone();
        let abandoned = Arc::new(AtomicBool::new(false));
        let mut task = {
            let abandoned = abandoned.clone();
            tokio::task::spawn_blocking(move || {
                if abandoned.load(Ordering::SeqCst) {
                    return Err(LedgerError::QueryTimeout(limit));
                }
                query(&store)
            })
        };

        let outcome = tokio::time::timeout(limit, &mut task).await;
        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                if join_error.is_panic() {
                    std::panic::resume_unwind(join_error.into_panic());
                }
                // Cancelled by runtime shutdown.
                Err(LedgerError::QueryTimeout(limit))
            }
            Err(_) => {
                abandoned.store(true, Ordering::SeqCst);
                self.store.interrupt();
                warn!(
                    statement = statement,
                    organization_id = %scope.organization_id,
                    timeout_ms = limit.as_millis() as u64,
                    "Statement query timed out; interrupting"
                );

                // A query still queued for the connection starts after the
                // first interrupt; keep interrupting until the task is gone.
                let store = self.store.clone();
                tokio::spawn(async move {
                    let mut tick = tokio::time::interval(INTERRUPT_RETRY);
                    tick.tick().await;
                    loop {
                        tick.tick().await;
                        if task.is_finished() {
                            break;
                        }
                        store.interrupt();
                    }
                });
                Err(LedgerError::QueryTimeout(limit))
            }
        }
    }
}

// =============================================================================
// AGGREGATION
// =============================================================================

fn type_total(totals: &[TypeTotals], account_type: AccountType) -> Decimal {
    totals
        .iter()
        .filter(|t| t.account_type == account_type)
        .map(|t| account_type.normal_balance(t.debit, t.credit))
        .sum()
}

fn compute_profit_and_loss(
    store: &LedgerStore,
    scope: &StatementScope,
    start: Option<NaiveDate>,
    end: NaiveDate,
) -> LedgerResult<ProfitAndLoss> {
    let totals = store.totals_by_type(
        &scope.organization_id,
        start,
        end,
        scope.branch_id.as_deref(),
    )?;

    let income = type_total(&totals, AccountType::Income);
    let expenses = type_total(&totals, AccountType::Expense);

    Ok(ProfitAndLoss {
        period: Period { start, end },
        income,
        expenses,
        net_profit: income - expenses,
    })
}

fn compute_balance_sheet(
    store: &LedgerStore,
    scope: &StatementScope,
    as_of: NaiveDate,
) -> LedgerResult<BalanceSheet> {
    // One aggregation: every figure comes from the same snapshot.
    let totals = store.totals_by_type(
        &scope.organization_id,
        None,
        as_of,
        scope.branch_id.as_deref(),
    )?;
    let retained_earnings =
        type_total(&totals, AccountType::Income) - type_total(&totals, AccountType::Expense);

    let sheet = BalanceSheet {
        as_of,
        assets: type_total(&totals, AccountType::Asset),
        liabilities: type_total(&totals, AccountType::Liability),
        equity: type_total(&totals, AccountType::Equity) + retained_earnings,
        retained_earnings,
    };

    if !sheet.imbalance().is_zero() {
        // Only reachable if the trial balance is also off.
        warn!(
            organization_id = %scope.organization_id,
            imbalance = %sheet.imbalance(),
            "Balance sheet does not balance"
        );
    }
    Ok(sheet)
}

fn compute_trial_balance(
    store: &LedgerStore,
    scope: &StatementScope,
    as_of: NaiveDate,
) -> LedgerResult<TrialBalance> {
    let accounts =
        store.totals_by_account(&scope.organization_id, as_of, scope.branch_id.as_deref())?;

    let rows: Vec<TrialBalanceRow> = accounts
        .into_iter()
        .map(|a| TrialBalanceRow {
            account_code: a.code,
            account_name: a.name,
            account_type: a.account_type,
            debit: a.debit,
            credit: a.credit,
        })
        .collect();

    let debit: Decimal = rows.iter().map(|r| r.debit).sum();
    let credit: Decimal = rows.iter().map(|r| r.credit).sum();
    let diff = debit - credit;

    if !diff.is_zero() {
        error!(
            organization_id = %scope.organization_id,
            as_of = %as_of,
            debit = %debit,
            credit = %credit,
            diff = %diff,
            "Trial balance does not balance; posting integrity broken"
        );
        return Err(LedgerError::invariant(format!(
            "trial balance for {} on {} is off by {}",
            scope.organization_id, as_of, diff
        )));
    }

    debug!(organization_id = %scope.organization_id, accounts = rows.len(), "Trial balance computed");

    Ok(TrialBalance {
        as_of,
        rows,
        totals: TrialBalanceTotals {
            debit,
            credit,
            diff,
        },
    })
}

fn compute_account_ledger(
    store: &LedgerStore,
    scope: &StatementScope,
    code: &str,
    start: Option<NaiveDate>,
    end: NaiveDate,
) -> LedgerResult<AccountLedger> {
    let account = store
        .find_account(&scope.organization_id, code)?
        .ok_or_else(|| LedgerError::AccountResolution {
            code: code.to_string(),
            reason: format!("no such account in {}", scope.organization_id),
            retryable: false,
        })?;
    let account_type = account.account_type;

    let mut opening_balance = Decimal::ZERO;
    let mut balance = Decimal::ZERO;
    let mut lines = Vec::new();

    for entry in store.account_entries(account.id, None, end)? {
        if let Some(branch) = scope.branch_id.as_deref() {
            if entry.branch_id.as_deref() != Some(branch) {
                continue;
            }
        }
        balance += account_type.normal_balance(entry.debit, entry.credit);

        if start.map_or(false, |s| entry.date < s) {
            opening_balance = balance;
            continue;
        }
        lines.push(AccountLedgerLine {
            date: entry.date,
            reference_type: entry.reference_type,
            reference_id: entry.reference_id,
            counterparty_id: entry.counterparty_id,
            debit: entry.debit,
            credit: entry.credit,
            balance,
        });
    }

    Ok(AccountLedger {
        account,
        period: Period { start, end },
        opening_balance,
        lines,
        closing_balance: balance,
    })
}
