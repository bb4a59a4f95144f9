//! Ledger posting
//!
//! Turns one upstream event into a balanced posting group and persists it once.
//!
//! # Rules
//!
//! | Event               | Debit                  | Credit                          |
//! |---------------------|------------------------|---------------------------------|
//! | Invoice             | AR (grand total)       | Sales (net), Tax Payable (tax)  |
//! | Purchase            | Inventory (grand total)| AP (grand total, supplier)      |
//! | Payment, inflow     | Cash/Bank              | AR (customer)                   |
//! | Payment, outflow    | AP (supplier)          | Cash/Bank                       |
//!
//! # Invariants
//!
//! 1. **Single-sided lines**: zero lines are dropped, negative lines rejected.
//! 2. **Balance**: a plan whose debits and credits differ is rejected before
//!    any account is resolved or any row is written.
//! 3. **Once per document**: the storage anchor constraint decides; losing a
//!    race is reported as `AlreadyPosted`, never as an error.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chart::StandardAccount;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    require_context, round_amount, InvoiceEvent, LedgerEntry, PaymentDirection, PaymentEvent,
    PurchaseEvent, ReferenceType, SourceEvent, SourceRef,
};
use crate::registry::AccountRegistry;
use crate::storage::LedgerStore;

// =============================================================================
// OUTCOME
// =============================================================================

/// Why a well-formed event produced no posting group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Installment-generated payment; posted by its own subsystem.
    AutomatedPayment,
    /// Every line came out as zero.
    ZeroAmount,
}

/// Result of a posting attempt that did not fail.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PostOutcome {
    Posted {
        source: SourceRef,
        entries: Vec<LedgerEntry>,
    },
    AlreadyPosted {
        source: SourceRef,
    },
    Skipped {
        source: SourceRef,
        reason: SkipReason,
    },
}

impl PostOutcome {
    pub fn source(&self) -> &SourceRef {
        match self {
            PostOutcome::Posted { source, .. }
            | PostOutcome::AlreadyPosted { source }
            | PostOutcome::Skipped { source, .. } => source,
        }
    }

    pub fn is_posted(&self) -> bool {
        matches!(self, PostOutcome::Posted { .. })
    }
}

// =============================================================================
// POSTING PLAN
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Debit,
    Credit,
}

#[derive(Debug, Clone)]
struct PlannedLine {
    account: StandardAccount,
    side: Side,
    amount: Decimal,
    counterparty_id: Option<String>,
}

/// Lines of a posting group expressed against chart accounts, before any
/// account is resolved.
#[derive(Debug, Clone)]
struct PostingPlan {
    source: SourceRef,
    organization_id: String,
    branch_id: Option<String>,
    date: NaiveDate,
    lines: Vec<PlannedLine>,
}

impl PostingPlan {
    fn new(
        source: SourceRef,
        organization_id: &str,
        branch_id: Option<&String>,
        date: NaiveDate,
    ) -> Self {
        Self {
            source,
            organization_id: organization_id.to_string(),
            branch_id: branch_id.cloned(),
            date,
            lines: Vec::new(),
        }
    }

    fn debit(&mut self, account: StandardAccount, amount: Decimal) -> &mut Self {
        self.push(account, Side::Debit, amount, None)
    }

    fn credit(&mut self, account: StandardAccount, amount: Decimal) -> &mut Self {
        self.push(account, Side::Credit, amount, None)
    }

    fn push(
        &mut self,
        account: StandardAccount,
        side: Side,
        amount: Decimal,
        counterparty_id: Option<&String>,
    ) -> &mut Self {
        self.lines.push(PlannedLine {
            account,
            side,
            amount,
            counterparty_id: counterparty_id.cloned(),
        });
        self
    }

    fn total(&self, side: Side) -> Decimal {
        self.lines
            .iter()
            .filter(|l| l.side == side)
            .map(|l| l.amount)
            .sum()
    }

    /// Drop zero lines, then check single-sidedness and balance.
    fn validate(&mut self) -> LedgerResult<()> {
        self.lines.retain(|l| !l.amount.is_zero());

        if let Some(negative) = self.lines.iter().find(|l| l.amount.is_sign_negative()) {
            return Err(LedgerError::invariant(format!(
                "{}: negative {:?} of {} to {}",
                self.source,
                negative.side,
                negative.amount,
                negative.account.code()
            )));
        }

        let (debit, credit) = (self.total(Side::Debit), self.total(Side::Credit));
        if debit != credit {
            return Err(LedgerError::invariant(format!(
                "{}: debits {} != credits {}",
                self.source, debit, credit
            )));
        }
        Ok(())
    }

    fn resolve(&self, registry: &AccountRegistry) -> LedgerResult<Vec<LedgerEntry>> {
        self.lines
            .iter()
            .map(|line| {
                let account_id = registry.resolve_standard(&self.organization_id, line.account)?;
                let (debit, credit) = match line.side {
                    Side::Debit => (line.amount, Decimal::ZERO),
                    Side::Credit => (Decimal::ZERO, line.amount),
                };
                Ok(LedgerEntry {
                    organization_id: self.organization_id.clone(),
                    branch_id: self.branch_id.clone(),
                    account_id,
                    date: self.date,
                    debit,
                    credit,
                    reference_type: self.source.reference_type,
                    reference_id: self.source.reference_id.clone(),
                    counterparty_id: line.counterparty_id.clone(),
                })
            })
            .collect()
    }
}

// =============================================================================
// POSTER
// =============================================================================

/// Posts invoices, purchases and payments to the ledger.
pub struct LedgerPoster {
    store: LedgerStore,
    registry: Arc<AccountRegistry>,
}

impl LedgerPoster {
    pub fn new(store: LedgerStore, registry: Arc<AccountRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Post any event kind.
    pub fn post(&self, event: &SourceEvent) -> LedgerResult<PostOutcome> {
        match event {
            SourceEvent::Invoice(invoice) => self.post_invoice(invoice),
            SourceEvent::Purchase(purchase) => self.post_purchase(purchase),
            SourceEvent::Payment(payment) => self.post_payment(payment),
        }
    }

    /// Dr Accounts Receivable / Cr Sales + Tax Payable.
    pub fn post_invoice(&self, invoice: &InvoiceEvent) -> LedgerResult<PostOutcome> {
        let source = SourceRef::new(ReferenceType::Invoice, invoice.id.clone());
        require_context(&invoice.organization_id, &source)?;
        if self.store.is_posted(&invoice.organization_id, &source)? {
            return Ok(already_posted(source));
        }

        let grand_total = round_amount(invoice.grand_total);
        let total_tax = round_amount(invoice.total_tax);

        let mut plan = PostingPlan::new(
            source,
            &invoice.organization_id,
            invoice.branch_id.as_ref(),
            invoice.date,
        );
        plan.debit(StandardAccount::AccountsReceivable, grand_total)
            .credit(StandardAccount::Sales, grand_total - total_tax);
        if total_tax > Decimal::ZERO {
            plan.credit(StandardAccount::TaxPayable, total_tax);
        }

        self.commit(plan)
    }

    /// Dr Inventory Asset / Cr Accounts Payable (tagged with the supplier).
    pub fn post_purchase(&self, purchase: &PurchaseEvent) -> LedgerResult<PostOutcome> {
        let source = SourceRef::new(ReferenceType::Purchase, purchase.id.clone());
        require_context(&purchase.organization_id, &source)?;
        if self.store.is_posted(&purchase.organization_id, &source)? {
            return Ok(already_posted(source));
        }

        let grand_total = round_amount(purchase.grand_total);
        let supplier = Some(&purchase.supplier_id).filter(|s| !s.trim().is_empty());

        let mut plan = PostingPlan::new(
            source,
            &purchase.organization_id,
            purchase.branch_id.as_ref(),
            purchase.date,
        );
        plan.debit(StandardAccount::InventoryAsset, grand_total).push(
            StandardAccount::AccountsPayable,
            Side::Credit,
            grand_total,
            supplier,
        );

        self.commit(plan)
    }

    /// Inflow: Dr Cash/Bank / Cr AR. Outflow: Dr AP / Cr Cash/Bank.
    ///
    /// Automated (installment) payments are never posted here.
    pub fn post_payment(&self, payment: &PaymentEvent) -> LedgerResult<PostOutcome> {
        let source = SourceRef::new(ReferenceType::Payment, payment.id.clone());
        require_context(&payment.organization_id, &source)?;
        if payment.is_automated {
            debug!(source = %source, "Skipping automated payment");
            return Ok(PostOutcome::Skipped {
                source,
                reason: SkipReason::AutomatedPayment,
            });
        }
        if self.store.is_posted(&payment.organization_id, &source)? {
            return Ok(already_posted(source));
        }

        let amount = round_amount(payment.amount);
        let settlement = StandardAccount::for_payment_method(payment.method);

        let mut plan = PostingPlan::new(
            source,
            &payment.organization_id,
            payment.branch_id.as_ref(),
            payment.date,
        );
        match payment.direction {
            PaymentDirection::Inflow => {
                if payment.customer_id.is_none() {
                    warn!(source = %plan.source, "Inflow payment without customer id");
                }
                plan.debit(settlement, amount).push(
                    StandardAccount::AccountsReceivable,
                    Side::Credit,
                    amount,
                    payment.customer_id.as_ref(),
                );
            }
            PaymentDirection::Outflow => {
                if payment.supplier_id.is_none() {
                    warn!(source = %plan.source, "Outflow payment without supplier id");
                }
                plan.push(
                    StandardAccount::AccountsPayable,
                    Side::Debit,
                    amount,
                    payment.supplier_id.as_ref(),
                )
                .credit(settlement, amount);
            }
        }

        self.commit(plan)
    }

    fn commit(&self, mut plan: PostingPlan) -> LedgerResult<PostOutcome> {
        plan.validate()?;
        if plan.lines.is_empty() {
            debug!(source = %plan.source, "Nothing to post for zero-value document");
            return Ok(PostOutcome::Skipped {
                source: plan.source,
                reason: SkipReason::ZeroAmount,
            });
        }

        let entries = plan.resolve(&self.registry)?;

        match self
            .store
            .insert_posting_group(&plan.source, &plan.organization_id, &entries)
        {
            Ok(()) => {
                info!(
                    source = %plan.source,
                    organization_id = %plan.organization_id,
                    lines = entries.len(),
                    total = %plan.total(Side::Debit),
                    "Posted ledger group"
                );
                Ok(PostOutcome::Posted {
                    source: plan.source,
                    entries,
                })
            }
            Err(LedgerError::IdempotencyConflict(source)) => {
                info!(source = %source, "Concurrent post of same document absorbed");
                Ok(PostOutcome::AlreadyPosted { source })
            }
            Err(e @ LedgerError::AccountResolution { .. }) => {
                let dropped = self.registry.forget(
                    &plan.organization_id,
                    entries.iter().map(|entry| entry.account_id),
                );
                warn!(
                    source = %plan.source,
                    dropped = dropped,
                    error = %e,
                    "Account no longer postable at commit; cached ids dropped"
                );
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

fn already_posted(source: SourceRef) -> PostOutcome {
    debug!(source = %source, "Posting group already exists");
    PostOutcome::AlreadyPosted { source }
}
