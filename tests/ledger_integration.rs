//! End-to-end ledger tests: live posting, backfill and statements against one
//! on-disk database.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use ledger_core::config::StorageConfig;
use ledger_core::models::{PaymentDirection, PaymentMethod};
use ledger_core::{
    AccountRegistry, AccountType, BackfillCoordinator, DocumentBundle, InvoiceEvent, LedgerConfig,
    LedgerPoster, LedgerStore, PaymentEvent, PostOutcome, PurchaseEvent, SourceEvent,
    StatementEngine, StatementScope,
};

fn d(s: &str) -> Decimal {
    s.parse().unwrap()
}

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

struct Ledger {
    _dir: TempDir,
    config: LedgerConfig,
}

impl Ledger {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = LedgerConfig::default();
        config.storage = StorageConfig {
            db_path: dir.path().join("books").join("ledger.db").to_string_lossy().to_string(),
            ..StorageConfig::default()
        };
        Self { _dir: dir, config }
    }

    /// A fresh process-like instance: own connection, own registry cache.
    fn poster(&self) -> Arc<LedgerPoster> {
        let store = LedgerStore::open(&self.config.storage).unwrap();
        let registry = Arc::new(AccountRegistry::new(store.clone()));
        Arc::new(LedgerPoster::new(store, registry))
    }

    fn engine(&self) -> StatementEngine {
        StatementEngine::new(
            LedgerStore::open(&self.config.storage).unwrap(),
            Duration::from_secs(10),
        )
    }

    fn store(&self) -> LedgerStore {
        LedgerStore::open(&self.config.storage).unwrap()
    }
}

fn invoice(id: &str, day: &str, branch: &str, total: &str, tax: &str) -> InvoiceEvent {
    InvoiceEvent {
        id: id.to_string(),
        organization_id: "acme".to_string(),
        branch_id: Some(branch.to_string()),
        date: date(day),
        grand_total: d(total),
        total_tax: d(tax),
    }
}

fn purchase(id: &str, day: &str, branch: &str, total: &str) -> PurchaseEvent {
    PurchaseEvent {
        id: id.to_string(),
        organization_id: "acme".to_string(),
        branch_id: Some(branch.to_string()),
        date: date(day),
        grand_total: d(total),
        supplier_id: "sup-1".to_string(),
    }
}

fn payment(id: &str, day: &str, branch: &str, amount: &str, direction: PaymentDirection, method: PaymentMethod) -> PaymentEvent {
    PaymentEvent {
        id: id.to_string(),
        organization_id: "acme".to_string(),
        branch_id: Some(branch.to_string()),
        date: date(day),
        amount: d(amount),
        direction,
        method,
        customer_id: Some("cust-1".to_string()),
        supplier_id: Some("sup-1".to_string()),
        is_automated: false,
    }
}

fn history() -> DocumentBundle {
    DocumentBundle::from_events(vec![
        SourceEvent::Invoice(invoice("inv-1", "2024-01-05", "north", "1180", "180")),
        SourceEvent::Invoice(invoice("inv-2", "2024-02-10", "south", "2360", "360")),
        SourceEvent::Purchase(purchase("bill-1", "2024-01-08", "north", "5000")),
        SourceEvent::Payment(payment("pay-1", "2024-01-20", "north", "500", PaymentDirection::Inflow, PaymentMethod::Cash)),
        SourceEvent::Payment(payment("pay-2", "2024-02-15", "north", "300", PaymentDirection::Outflow, PaymentMethod::Bank)),
    ])
}

#[tokio::test]
async fn test_backfill_then_statements_hold_identities() {
    let ledger = Ledger::new();
    let coordinator = BackfillCoordinator::new(ledger.poster(), ledger.config.backfill.clone());

    let report = coordinator
        .run("acme", &history(), &AtomicBool::new(false))
        .unwrap();
    assert!(report.is_complete(), "{}", report.format_report());
    assert_eq!(report.totals().posted, 5);

    let engine = ledger.engine();
    let scope = StatementScope::organization("acme");

    let pnl = engine
        .profit_and_loss(&scope, Some(date("2024-01-01")), date("2024-03-31"))
        .await
        .unwrap();
    assert_eq!(pnl.income, d("3000"));
    assert_eq!(pnl.expenses, d("0"));
    assert_eq!(pnl.net_profit, d("3000"));

    for as_of in ["2024-01-31", "2024-02-29", "2024-12-31"] {
        let sheet = engine.balance_sheet(&scope, date(as_of)).await.unwrap();
        assert_eq!(sheet.assets, sheet.liabilities + sheet.equity, "as of {}", as_of);

        let tb = engine.trial_balance(&scope, date(as_of)).await.unwrap();
        assert!(tb.totals.diff.is_zero());
    }

    let sheet = engine.balance_sheet(&scope, date("2024-12-31")).await.unwrap();
    // AR 3540 - 500, inventory 5000, cash 500, bank -300
    assert_eq!(sheet.assets, d("8240"));
    // AP 5000 - 300, tax 540
    assert_eq!(sheet.liabilities, d("5240"));
    assert_eq!(sheet.retained_earnings, d("3000"));

    let north = engine
        .balance_sheet(&scope.clone().with_branch("north"), date("2024-12-31"))
        .await
        .unwrap();
    assert_eq!(north.assets, north.liabilities + north.equity);
    assert_eq!(north.retained_earnings, d("1000"));
}

#[tokio::test]
async fn test_live_posting_and_backfill_overlap() {
    let ledger = Ledger::new();
    let docs = history();

    // Live path posts some documents before the backfill runs.
    let live = ledger.poster();
    assert!(live.post_invoice(&docs.invoices[0]).unwrap().is_posted());
    assert!(live.post_payment(&docs.payments[0]).unwrap().is_posted());

    let coordinator = BackfillCoordinator::new(ledger.poster(), ledger.config.backfill.clone());
    let first = coordinator.run("acme", &docs, &AtomicBool::new(false)).unwrap();
    assert_eq!(first.totals().already_posted, 2);
    assert_eq!(first.totals().posted, 3);

    let entries = ledger.store().entry_count(Some("acme")).unwrap();
    let second = coordinator.run("acme", &docs, &AtomicBool::new(false)).unwrap();
    assert_eq!(second.totals().posted, 0);
    assert_eq!(ledger.store().entry_count(Some("acme")).unwrap(), entries);

    // Re-delivered live event after backfill.
    let again = live.post_invoice(&docs.invoices[0]).unwrap();
    assert!(matches!(again, PostOutcome::AlreadyPosted { .. }));
}

#[tokio::test]
async fn test_concurrent_backfills_post_each_document_once() {
    let ledger = Ledger::new();
    ledger.store();
    let docs = history();

    let reports: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let coordinator =
                    BackfillCoordinator::new(ledger.poster(), ledger.config.backfill.clone());
                let docs = docs.clone();
                scope.spawn(move || {
                    coordinator
                        .run("acme", &docs, &AtomicBool::new(false))
                        .unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let posted: u64 = reports.iter().map(|r| r.totals().posted).sum();
    assert_eq!(posted, 5);
    assert!(reports.iter().all(|r| r.failures.is_empty()));

    let store = ledger.store();
    assert_eq!(store.group_count(Some("acme")).unwrap(), 5);
    assert!(store.unbalanced_groups(None).unwrap().is_empty());

    let accounts = store.list_accounts("acme").unwrap();
    let mut codes: Vec<&str> = accounts.iter().map(|a| a.code.as_str()).collect();
    codes.dedup();
    assert_eq!(codes.len(), accounts.len());
    assert!(accounts
        .iter()
        .any(|a| a.code == "4000" && a.account_type == AccountType::Income));

    let tb = ledger
        .engine()
        .trial_balance(&StatementScope::organization("acme"), date("2024-12-31"))
        .await
        .unwrap();
    assert!(tb.totals.diff.is_zero());
}

#[tokio::test]
async fn test_organizations_do_not_mix() {
    let ledger = Ledger::new();
    let poster = ledger.poster();
    poster
        .post_invoice(&invoice("inv-1", "2024-01-05", "north", "1180", "180"))
        .unwrap();

    let mut other = invoice("inv-other", "2024-01-05", "north", "50", "0");
    other.organization_id = "globex".to_string();
    poster.post_invoice(&other).unwrap();

    let engine = ledger.engine();
    let acme = engine
        .profit_and_loss(&StatementScope::organization("acme"), None, date("2024-12-31"))
        .await
        .unwrap();
    let globex = engine
        .profit_and_loss(&StatementScope::organization("globex"), None, date("2024-12-31"))
        .await
        .unwrap();
    assert_eq!(acme.income, d("1000"));
    assert_eq!(globex.income, d("50"));
}

#[tokio::test]
async fn test_organizations_may_reuse_document_ids() {
    let ledger = Ledger::new();
    let acme_poster = ledger.poster();
    let globex_poster = ledger.poster();

    let acme = invoice("inv-1", "2024-01-05", "north", "1180", "180");
    let mut globex = invoice("inv-1", "2024-01-06", "north", "50", "0");
    globex.organization_id = "globex".to_string();

    assert!(acme_poster.post_invoice(&acme).unwrap().is_posted());
    assert!(globex_poster.post_invoice(&globex).unwrap().is_posted());
    assert!(matches!(
        acme_poster.post_invoice(&globex).unwrap(),
        PostOutcome::AlreadyPosted { .. }
    ));

    // A backfill of globex finds its own document already posted.
    let mut docs = DocumentBundle::default();
    docs.invoices.push(globex.clone());
    let report = BackfillCoordinator::new(ledger.poster(), ledger.config.backfill.clone())
        .run("globex", &docs, &AtomicBool::new(false))
        .unwrap();
    assert_eq!(report.totals().already_posted, 1);

    let engine = ledger.engine();
    let income = engine
        .profit_and_loss(&StatementScope::organization("globex"), None, date("2024-12-31"))
        .await
        .unwrap()
        .income;
    assert_eq!(income, d("50"));
    assert_eq!(ledger.store().group_count(None).unwrap(), 2);
}
