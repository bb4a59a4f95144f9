//! Ledger backfill for historical documents
//!
//! Posts every invoice, purchase and payment of an organization that predates
//! the ledger, in that order so the chart accounts exist before the payments
//! touch them.
//!
//! - Idempotent: documents that already have a posting group are counted and
//!   skipped; a second run over the same documents writes nothing.
//! - Safe next to live posting: a document posted concurrently by the live
//!   path lands as `already_posted`.
//! - Cancellable between documents. A posting group is never interrupted.
//! - Documents whose `organization_id` differs from the run's organization are
//!   reported as failures and never posted.
//!
//! # Usage
//!
//! ```ignore
//! let coordinator = BackfillCoordinator::new(poster, config.backfill.clone());
//! let report = coordinator.run("org-1", &documents, &cancel)?;
//! println!("{}", report.format_report());
//! ```

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::BackfillConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{ReferenceType, SourceRef};
use crate::posting::{LedgerPoster, PostOutcome};
use crate::sources::SourceDocuments;

// =============================================================================
// BACKFILL REPORT
// =============================================================================

/// Outcome counts for one document kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindCounters {
    pub scanned: u64,
    pub posted: u64,
    pub already_posted: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl KindCounters {
    fn add(&mut self, other: &KindCounters) {
        self.scanned += other.scanned;
        self.posted += other.posted;
        self.already_posted += other.already_posted;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// A document that could not be posted; it stays unposted for the next run.
#[derive(Debug, Clone, Serialize)]
pub struct BackfillFailure {
    pub source: SourceRef,
    pub kind: &'static str,
    pub message: String,
    pub retryable: bool,
}

/// Result of one backfill run.
#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub organization_id: String,
    pub invoices: KindCounters,
    pub purchases: KindCounters,
    pub payments: KindCounters,
    pub failures: Vec<BackfillFailure>,
    /// Stopped by the cancel flag before every document was visited.
    pub cancelled: bool,
    /// Stopped at the first failure (`stop_on_error`).
    pub stopped_on_error: bool,
    pub duration_secs: f64,
}

impl BackfillReport {
    fn new(organization_id: &str) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            invoices: KindCounters::default(),
            purchases: KindCounters::default(),
            payments: KindCounters::default(),
            failures: Vec::new(),
            cancelled: false,
            stopped_on_error: false,
            duration_secs: 0.0,
        }
    }

    fn counters_mut(&mut self, reference_type: ReferenceType) -> &mut KindCounters {
        match reference_type {
            ReferenceType::Invoice => &mut self.invoices,
            ReferenceType::Purchase => &mut self.purchases,
            ReferenceType::Payment => &mut self.payments,
        }
    }

    pub fn totals(&self) -> KindCounters {
        let mut totals = KindCounters::default();
        totals.add(&self.invoices);
        totals.add(&self.purchases);
        totals.add(&self.payments);
        totals
    }

    /// Every document was visited and none failed.
    pub fn is_complete(&self) -> bool {
        !self.cancelled && !self.stopped_on_error && self.failures.is_empty()
    }

    pub fn format_status(&self) -> String {
        let t = self.totals();
        format!(
            "{} scanned, {} posted, {} already posted, {} skipped, {} failed",
            t.scanned, t.posted, t.already_posted, t.skipped, t.failed
        )
    }

    pub fn format_report(&self) -> String {
        let mut out = String::new();

        out.push_str("==================== LEDGER BACKFILL REPORT ====================\n");
        out.push_str(&format!("  Organization:   {}\n", self.organization_id));
        let status = if self.cancelled {
            "CANCELLED"
        } else if self.stopped_on_error {
            "STOPPED ON ERROR"
        } else if self.failures.is_empty() {
            "COMPLETE"
        } else {
            "COMPLETE WITH FAILURES"
        };
        out.push_str(&format!("  Status:         {}\n", status));
        out.push_str(&format!("  Duration:       {:.2} seconds\n", self.duration_secs));
        out.push_str("----------------------------------------------------------------\n");
        out.push_str("  Kind         Scanned   Posted  Already  Skipped   Failed\n");
        for (label, c) in [
            ("invoices", &self.invoices),
            ("purchases", &self.purchases),
            ("payments", &self.payments),
        ] {
            out.push_str(&format!(
                "  {:<10} {:>9} {:>8} {:>8} {:>8} {:>8}\n",
                label, c.scanned, c.posted, c.already_posted, c.skipped, c.failed
            ));
        }

        if !self.failures.is_empty() {
            out.push_str("----------------------------------------------------------------\n");
            out.push_str(&format!("  FAILURES:       {}\n", self.failures.len()));
            for failure in &self.failures {
                out.push_str(&format!(
                    "    {} [{}{}] {}\n",
                    failure.source,
                    failure.kind,
                    if failure.retryable { ", retryable" } else { "" },
                    failure.message
                ));
            }
        }

        out.push_str("================================================================\n");
        out
    }
}

// =============================================================================
// BACKFILL COORDINATOR
// =============================================================================

/// What the run loop should do after a document.
enum Step {
    Continue,
    Stop,
}

/// Walks historical documents of one organization through the poster.
pub struct BackfillCoordinator {
    poster: Arc<LedgerPoster>,
    config: BackfillConfig,
}

impl BackfillCoordinator {
    pub fn new(poster: Arc<LedgerPoster>, config: BackfillConfig) -> Self {
        Self { poster, config }
    }

    /// Post every unposted document of `organization_id`.
    ///
    /// Checks `cancel` before each document. Returns `Err` only when the
    /// documents cannot be listed or the organization is missing; posting
    /// failures are collected in the report.
    pub fn run(
        &self,
        organization_id: &str,
        documents: &dyn SourceDocuments,
        cancel: &AtomicBool,
    ) -> Result<BackfillReport> {
        if organization_id.trim().is_empty() {
            return Err(LedgerError::configuration("backfill requires an organization").into());
        }

        info!(organization_id = %organization_id, "Starting ledger backfill");
        let start_time = Instant::now();
        let mut report = BackfillReport::new(organization_id);

        // Invoices, then purchases, then payments.
        let invoices = documents
            .invoices(organization_id)
            .context("listing invoices")?;
        for invoice in &invoices {
            let source = SourceRef::new(ReferenceType::Invoice, invoice.id.clone());
            if self.cancelled(cancel, &mut report) {
                return Ok(self.finish(report, start_time));
            }
            if let Step::Stop = self.step(&mut report, source, &invoice.organization_id, || {
                self.poster.post_invoice(invoice)
            }) {
                return Ok(self.finish(report, start_time));
            }
        }

        let purchases = documents
            .purchases(organization_id)
            .context("listing purchases")?;
        for purchase in &purchases {
            let source = SourceRef::new(ReferenceType::Purchase, purchase.id.clone());
            if self.cancelled(cancel, &mut report) {
                return Ok(self.finish(report, start_time));
            }
            if let Step::Stop = self.step(&mut report, source, &purchase.organization_id, || {
                self.poster.post_purchase(purchase)
            }) {
                return Ok(self.finish(report, start_time));
            }
        }

        let payments = documents
            .payments(organization_id)
            .context("listing payments")?;
        for payment in &payments {
            let source = SourceRef::new(ReferenceType::Payment, payment.id.clone());
            if self.cancelled(cancel, &mut report) {
                return Ok(self.finish(report, start_time));
            }
            // Automated payments come back as skipped.
            if let Step::Stop = self.step(&mut report, source, &payment.organization_id, || {
                self.poster.post_payment(payment)
            }) {
                return Ok(self.finish(report, start_time));
            }
        }

        Ok(self.finish(report, start_time))
    }

    fn cancelled(&self, cancel: &AtomicBool, report: &mut BackfillReport) -> bool {
        if cancel.load(Ordering::SeqCst) {
            if !report.cancelled {
                warn!(
                    organization_id = %report.organization_id,
                    status = %report.format_status(),
                    "Backfill cancelled"
                );
            }
            report.cancelled = true;
        }
        report.cancelled
    }

    fn step<F>(
        &self,
        report: &mut BackfillReport,
        source: SourceRef,
        document_organization: &str,
        post: F,
    ) -> Step
    where
        F: FnOnce() -> LedgerResult<PostOutcome>,
    {
        report.counters_mut(source.reference_type).scanned += 1;

        let result = if document_organization != report.organization_id {
            Err(LedgerError::configuration(format!(
                "{} belongs to organization {:?}, not {:?}",
                source, document_organization, report.organization_id
            )))
        } else {
            match self.poster.store().is_posted(&report.organization_id, &source) {
                Ok(true) => Ok(PostOutcome::AlreadyPosted {
                    source: source.clone(),
                }),
                Ok(false) => post(),
                Err(e) => Err(e),
            }
        };

        let mut step = Step::Continue;
        match result {
            Ok(PostOutcome::Posted { .. }) => report.counters_mut(source.reference_type).posted += 1,
            Ok(PostOutcome::AlreadyPosted { .. }) => {
                report.counters_mut(source.reference_type).already_posted += 1
            }
            Ok(PostOutcome::Skipped { .. }) => report.counters_mut(source.reference_type).skipped += 1,
            Err(e) => {
                warn!(
                    source = %source,
                    kind = e.kind(),
                    retryable = e.is_retryable(),
                    error = %e,
                    "Backfill could not post document"
                );
                report.counters_mut(source.reference_type).failed += 1;
                report.failures.push(BackfillFailure {
                    source,
                    kind: e.kind(),
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                });
                if self.config.stop_on_error {
                    report.stopped_on_error = true;
                    step = Step::Stop;
                }
            }
        }

        let scanned = report.totals().scanned;
        if self.progress_due(scanned) {
            info!(
                organization_id = %report.organization_id,
                scanned = scanned,
                status = %report.format_status(),
                "Backfill progress"
            );
        }
        step
    }

    fn progress_due(&self, scanned: u64) -> bool {
        self.config.progress_every > 0 && scanned % self.config.progress_every as u64 == 0
    }

    fn finish(&self, mut report: BackfillReport, start_time: Instant) -> BackfillReport {
        report.duration_secs = start_time.elapsed().as_secs_f64();
        info!(
            organization_id = %report.organization_id,
            status = %report.format_status(),
            cancelled = report.cancelled,
            duration_secs = %report.duration_secs,
            "Ledger backfill finished"
        );
        report
    }
}
