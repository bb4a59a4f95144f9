//! Fixed chart-of-accounts codes the posting rules rely on.

use crate::models::{AccountType, PaymentMethod};

/// An account every organization gets on first use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StandardAccount {
    Cash,
    Bank,
    AccountsReceivable,
    InventoryAsset,
    AccountsPayable,
    TaxPayable,
    Sales,
}

impl StandardAccount {
    pub const ALL: [StandardAccount; 7] = [
        StandardAccount::Cash,
        StandardAccount::Bank,
        StandardAccount::AccountsReceivable,
        StandardAccount::InventoryAsset,
        StandardAccount::AccountsPayable,
        StandardAccount::TaxPayable,
        StandardAccount::Sales,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            StandardAccount::Cash => "1000",
            StandardAccount::Bank => "1010",
            StandardAccount::AccountsReceivable => "1100",
            StandardAccount::InventoryAsset => "1200",
            StandardAccount::AccountsPayable => "2000",
            StandardAccount::TaxPayable => "2100",
            StandardAccount::Sales => "4000",
        }
    }

    /// Name used when the account has to be auto-created.
    pub fn fallback_name(&self) -> &'static str {
        match self {
            StandardAccount::Cash => "Cash",
            StandardAccount::Bank => "Bank",
            StandardAccount::AccountsReceivable => "Accounts Receivable",
            StandardAccount::InventoryAsset => "Inventory Asset",
            StandardAccount::AccountsPayable => "Accounts Payable",
            StandardAccount::TaxPayable => "Tax Payable",
            StandardAccount::Sales => "Sales",
        }
    }

    pub fn account_type(&self) -> AccountType {
        match self {
            StandardAccount::Cash
            | StandardAccount::Bank
            | StandardAccount::AccountsReceivable
            | StandardAccount::InventoryAsset => AccountType::Asset,
            StandardAccount::AccountsPayable | StandardAccount::TaxPayable => {
                AccountType::Liability
            }
            StandardAccount::Sales => AccountType::Income,
        }
    }

    /// Cash-or-bank account a payment settles through.
    pub fn for_payment_method(method: PaymentMethod) -> Self {
        match method {
            PaymentMethod::Cash => StandardAccount::Cash,
            PaymentMethod::Bank => StandardAccount::Bank,
        }
    }
}
