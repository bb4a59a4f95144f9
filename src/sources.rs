//! Historical documents for backfill.
//!
//! The invoicing, purchasing and payment modules own their documents; backfill
//! only needs to list them per organization. [`DocumentBundle`] is the file
//! based implementation used by the CLI and tests.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::models::{InvoiceEvent, PaymentEvent, PurchaseEvent, SourceEvent};

/// Lists an organization's source documents, oldest first.
pub trait SourceDocuments: Send + Sync {
    fn invoices(&self, organization_id: &str) -> Result<Vec<InvoiceEvent>>;
    fn purchases(&self, organization_id: &str) -> Result<Vec<PurchaseEvent>>;
    fn payments(&self, organization_id: &str) -> Result<Vec<PaymentEvent>>;
}

/// In-memory document set, loadable from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentBundle {
    #[serde(default)]
    pub invoices: Vec<InvoiceEvent>,
    #[serde(default)]
    pub purchases: Vec<PurchaseEvent>,
    #[serde(default)]
    pub payments: Vec<PaymentEvent>,
}

impl DocumentBundle {
    /// Load `{ "invoices": [...], "purchases": [...], "payments": [...] }`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading documents from {}", path.display()))?;
        let bundle: Self = serde_json::from_str(&contents)
            .with_context(|| format!("parsing documents in {}", path.display()))?;
        Ok(bundle)
    }

    pub fn from_events(events: impl IntoIterator<Item = SourceEvent>) -> Self {
        let mut bundle = Self::default();
        for event in events {
            bundle.push(event);
        }
        bundle
    }

    pub fn push(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Invoice(e) => self.invoices.push(e),
            SourceEvent::Purchase(e) => self.purchases.push(e),
            SourceEvent::Payment(e) => self.payments.push(e),
        }
    }

    pub fn len(&self) -> usize {
        self.invoices.len() + self.purchases.len() + self.payments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn for_org<T: Clone>(docs: &[T], organization_id: &str, org_of: impl Fn(&T) -> &str) -> Vec<T> {
    docs.iter()
        .filter(|d| org_of(d) == organization_id)
        .cloned()
        .collect()
}

impl SourceDocuments for DocumentBundle {
    fn invoices(&self, organization_id: &str) -> Result<Vec<InvoiceEvent>> {
        let mut docs = for_org(&self.invoices, organization_id, |d| d.organization_id.as_str());
        docs.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(docs)
    }

    fn purchases(&self, organization_id: &str) -> Result<Vec<PurchaseEvent>> {
        let mut docs = for_org(&self.purchases, organization_id, |d| d.organization_id.as_str());
        docs.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(docs)
    }

    fn payments(&self, organization_id: &str) -> Result<Vec<PaymentEvent>> {
        let mut docs = for_org(&self.payments, organization_id, |d| d.organization_id.as_str());
        docs.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(docs)
    }
}
