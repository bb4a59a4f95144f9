//! Ledger data model: accounts, entries, source references and the three
//! upstream event kinds.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};

// =============================================================================
// AMOUNTS
// =============================================================================

/// Decimal places kept in storage. Amounts are persisted as integer minor units
/// so SQL aggregation stays exact.
pub const MINOR_UNIT_SCALE: u32 = 2;

/// Round an event amount to the storage scale (banker's rounding).
pub fn round_amount(value: Decimal) -> Decimal {
    value.round_dp(MINOR_UNIT_SCALE)
}

/// Convert a decimal amount to integer minor units.
pub fn to_minor(value: Decimal) -> LedgerResult<i64> {
    (round_amount(value) * Decimal::from(10i64.pow(MINOR_UNIT_SCALE)))
        .to_i64()
        .ok_or_else(|| LedgerError::invariant(format!("amount {} out of range", value)))
}

/// Convert integer minor units back to a decimal amount.
pub fn from_minor(minor: i64) -> Decimal {
    Decimal::new(minor, MINOR_UNIT_SCALE)
}

// =============================================================================
// ACCOUNTS
// =============================================================================

pub type AccountId = Uuid;

/// Account classification. Fixed for the lifetime of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Income,
    Expense,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Asset => "asset",
            AccountType::Liability => "liability",
            AccountType::Equity => "equity",
            AccountType::Income => "income",
            AccountType::Expense => "expense",
        }
    }

    /// Assets and expenses grow with debits; everything else with credits.
    pub fn is_debit_normal(&self) -> bool {
        matches!(self, AccountType::Asset | AccountType::Expense)
    }

    /// Signed balance in the account type's natural direction.
    pub fn normal_balance(&self, debit: Decimal, credit: Decimal) -> Decimal {
        if self.is_debit_normal() {
            debit - credit
        } else {
            credit - debit
        }
    }
}

impl FromStr for AccountType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asset" => Ok(AccountType::Asset),
            "liability" => Ok(AccountType::Liability),
            "equity" => Ok(AccountType::Equity),
            "income" => Ok(AccountType::Income),
            "expense" => Ok(AccountType::Expense),
            other => Err(format!("unknown account type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub organization_id: String,
    pub code: String,
    pub name: String,
    pub account_type: AccountType,
    /// Summary accounts only aggregate children and are never posted to.
    pub is_group: bool,
    pub is_active: bool,
}

// =============================================================================
// SOURCE REFERENCES
// =============================================================================

/// Kind of business document a posting group originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    Invoice,
    Purchase,
    Payment,
}

impl ReferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceType::Invoice => "invoice",
            ReferenceType::Purchase => "purchase",
            ReferenceType::Payment => "payment",
        }
    }
}

impl FromStr for ReferenceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invoice" => Ok(ReferenceType::Invoice),
            "purchase" => Ok(ReferenceType::Purchase),
            "payment" => Ok(ReferenceType::Payment),
            other => Err(format!("unknown reference type: {}", other)),
        }
    }
}

/// Identity of a posting group: one per source document, ever.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub reference_type: ReferenceType,
    pub reference_id: String,
}

impl SourceRef {
    pub fn new(reference_type: ReferenceType, reference_id: impl Into<String>) -> Self {
        Self {
            reference_type,
            reference_id: reference_id.into(),
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.reference_type.as_str(), self.reference_id)
    }
}

// =============================================================================
// LEDGER ENTRY
// =============================================================================

/// One single-sided line of a posting group, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub organization_id: String,
    pub branch_id: Option<String>,
    pub account_id: AccountId,
    pub date: NaiveDate,
    pub debit: Decimal,
    pub credit: Decimal,
    pub reference_type: ReferenceType,
    pub reference_id: String,
    /// Customer or supplier the line concerns, when there is one.
    pub counterparty_id: Option<String>,
}

impl LedgerEntry {
    pub fn source(&self) -> SourceRef {
        SourceRef::new(self.reference_type, self.reference_id.clone())
    }

    pub fn is_debit(&self) -> bool {
        self.debit > Decimal::ZERO
    }
}

// =============================================================================
// UPSTREAM EVENTS
// =============================================================================

/// A finalized sales invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceEvent {
    pub id: String,
    pub organization_id: String,
    #[serde(default)]
    pub branch_id: Option<String>,
    pub date: NaiveDate,
    pub grand_total: Decimal,
    #[serde(default)]
    pub total_tax: Decimal,
}

/// A received purchase bill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseEvent {
    pub id: String,
    pub organization_id: String,
    #[serde(default)]
    pub branch_id: Option<String>,
    pub date: NaiveDate,
    pub grand_total: Decimal,
    pub supplier_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentDirection {
    /// Money received from a customer.
    Inflow,
    /// Money paid to a supplier.
    Outflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Bank,
}

/// A recorded payment, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub id: String,
    pub organization_id: String,
    #[serde(default)]
    pub branch_id: Option<String>,
    pub date: NaiveDate,
    pub amount: Decimal,
    pub direction: PaymentDirection,
    pub method: PaymentMethod,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub supplier_id: Option<String>,
    /// Produced by the installment subsystem, which posts on its own path.
    #[serde(default)]
    pub is_automated: bool,
}

/// Any postable event, tagged by kind for transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceEvent {
    Invoice(InvoiceEvent),
    Purchase(PurchaseEvent),
    Payment(PaymentEvent),
}

impl SourceEvent {
    pub fn source(&self) -> SourceRef {
        match self {
            SourceEvent::Invoice(e) => SourceRef::new(ReferenceType::Invoice, e.id.clone()),
            SourceEvent::Purchase(e) => SourceRef::new(ReferenceType::Purchase, e.id.clone()),
            SourceEvent::Payment(e) => SourceRef::new(ReferenceType::Payment, e.id.clone()),
        }
    }
}

/// Reject events that carry no organization or document identity.
pub(crate) fn require_context(organization_id: &str, source: &SourceRef) -> LedgerResult<()> {
    if organization_id.trim().is_empty() {
        return Err(LedgerError::configuration(format!(
            "{} has no organization context",
            source
        )));
    }
    if source.reference_id.trim().is_empty() {
        return Err(LedgerError::configuration(format!(
            "{} event has no document id",
            source.reference_type.as_str()
        )));
    }
    Ok(())
}
