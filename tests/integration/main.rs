//! End-to-end round tests against an in-memory marketplace and database.

mod mock_marketplace;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use demper::engine::{
    CatalogSync, EngineState, Orchestrator, OrchestratorSettings, Repricer, RepricerSettings, StatusBoard,
};
use demper::marketplace::Marketplace;
use demper::session::{CredentialRefresher, SessionStore};
use demper::storage::{Database, NewListing};
use demper::types::{BrowserCookie, ChangeReason, Credentials, DemperError};

use mock_marketplace::{Call, MockMarketplace, LIVE_SID};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Logs in with a live cookie, or fails every login when `rejecting`,
/// and counts how often it ran.
#[derive(Default)]
struct CountingRefresher {
    calls: AtomicUsize,
    rejecting: bool,
}

impl CountingRefresher {
    fn rejecting() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            rejecting: true,
        }
    }
}

#[async_trait]
impl CredentialRefresher for CountingRefresher {
    async fn refresh_session(&self, _store_id: i64, _credentials: &Credentials) -> Result<Vec<BrowserCookie>, DemperError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.rejecting {
            return Err(DemperError::Auth("login form rejected credentials".into()));
        }
        Ok(vec![BrowserCookie::new("mc-sid", LIVE_SID)])
    }
}

struct Harness {
    db: Database,
    market: Arc<MockMarketplace>,
    refresher: Arc<CountingRefresher>,
    status: Arc<StatusBoard>,
    orchestrator: Orchestrator,
}

fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        max_concurrent_tasks: 4,
        round_delay: Duration::from_secs(3600),
        jitter_min: Duration::ZERO,
        jitter_max: Duration::ZERO,
    }
}

async fn harness(db: Database, market: Arc<MockMarketplace>) -> Harness {
    harness_with(db, market, CountingRefresher::default()).await
}

async fn harness_with(db: Database, market: Arc<MockMarketplace>, refresher: CountingRefresher) -> Harness {
    let refresher = Arc::new(refresher);
    let dyn_market: Arc<dyn Marketplace> = market.clone();
    let sessions = Arc::new(SessionStore::new(db.clone(), dyn_market.clone(), refresher.clone()));
    let repricer = Arc::new(Repricer::new(
        db.clone(),
        dyn_market.clone(),
        sessions.clone(),
        RepricerSettings::default(),
    ));
    let catalog = Arc::new(CatalogSync::new(db.clone(), dyn_market, sessions.clone()));
    let status = Arc::new(StatusBoard::new());
    let orchestrator = Orchestrator::new(db.clone(), repricer, catalog, sessions, status.clone(), settings());
    Harness {
        db,
        market,
        refresher,
        status,
        orchestrator,
    }
}

async fn store(db: &Database, merchant: &str, sid: &str, with_credentials: bool) -> i64 {
    let id = db.insert_store(Some("owner"), Some(merchant)).await.unwrap();
    let blob = if with_credentials {
        format!(r#"{{"cookies":[{{"name":"mc-sid","value":"{sid}"}}],"email":"seller@example.kz","password":"hunter2"}}"#)
    } else {
        format!(r#"{{"cookies":[{{"name":"mc-sid","value":"{sid}"}}]}}"#)
    };
    db.save_session(id, &blob, chrono::Utc::now(), None).await.unwrap();
    id
}

async fn listing(db: &Database, store_id: i64, sku: &str, external_id: &str, price: Decimal) -> i64 {
    db.insert_listing(&NewListing {
        store_id,
        sku: sku.into(),
        external_id: external_id.into(),
        price,
        min_profit: dec!(800),
        max_profit: None,
        price_step: dec!(1),
        active: true,
    })
    .await
    .unwrap()
}

// ---------------------------------------------------------------------------
// Rounds
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_round_updates_price_and_writes_ledger() {
    let db = Database::in_memory().await.unwrap();
    let market = Arc::new(MockMarketplace::new());
    let s1 = store(&db, "M1", LIVE_SID, false).await;
    let id = listing(&db, s1, "SKU1", "100", dec!(1000)).await;
    // Own offer must not count as a rival.
    market.set_offers("100", &[("M1", dec!(850)), ("RIVAL", dec!(900))]);
    market.set_catalog_item("M1", "SKU1", "100", dec!(1000));

    let h = harness(db, market).await;
    let report = h.orchestrator.run_round().await.unwrap();

    assert_eq!(report.round, 1);
    assert_eq!((report.listings, report.updated, report.failed), (1, 1, 0));
    assert_eq!(report.stores_synced, 1);

    assert_eq!(h.db.listing(id).await.unwrap().unwrap().price, dec!(899));
    assert_eq!(h.market.remote_price("M1", "SKU1"), Some(dec!(899)));

    let history = h.db.history(id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].price, dec!(1000));
    assert_eq!(history[0].price_decrease, dec!(101));
    assert_eq!(history[0].cumulative_loss, dec!(101));
    assert_eq!(history[0].change_reason, ChangeReason::DempingDecrease);

    let status = h.status.listing(id).await.unwrap();
    assert_eq!(status.status, "updated");
    assert_eq!(status.last_change.unwrap().new_price, dec!(899));
    assert_eq!(h.status.last_round().await.unwrap().round, 1);
}

#[tokio::test]
async fn test_second_round_holds_price_once_competitive() {
    let db = Database::in_memory().await.unwrap();
    let market = Arc::new(MockMarketplace::new());
    let s1 = store(&db, "M1", LIVE_SID, false).await;
    let id = listing(&db, s1, "SKU1", "100", dec!(1000)).await;
    market.set_offers("100", &[("RIVAL", dec!(900))]);
    market.set_catalog_item("M1", "SKU1", "100", dec!(1000));

    let h = harness(db, market).await;
    h.orchestrator.run_round().await.unwrap();
    let second = h.orchestrator.run_round().await.unwrap();

    assert_eq!(second.round, 2);
    assert_eq!(second.updated, 0);
    assert_eq!(second.skipped, 1);
    assert_eq!(h.db.listing(id).await.unwrap().unwrap().price, dec!(899));
    assert_eq!(h.db.history(id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_store_without_credentials_is_skipped() {
    let db = Database::in_memory().await.unwrap();
    let market = Arc::new(MockMarketplace::new());
    let healthy = store(&db, "M1", LIVE_SID, false).await;
    let expired = store(&db, "M2", "stale", false).await;
    let ok_id = listing(&db, healthy, "SKU1", "100", dec!(1000)).await;
    let dead_a = listing(&db, expired, "SKU2", "200", dec!(1000)).await;
    let dead_b = listing(&db, expired, "SKU3", "300", dec!(1000)).await;
    for ext in ["100", "200", "300"] {
        market.set_offers(ext, &[("RIVAL", dec!(900))]);
    }
    market.set_catalog_item("M1", "SKU1", "100", dec!(1000));

    let h = harness(db, market).await;
    let report = h.orchestrator.run_round().await.unwrap();

    assert_eq!(report.updated, 1);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.failed, 0);
    assert_eq!(report.panicked, 0);
    assert_eq!((report.stores_synced, report.stores_failed), (1, 1));

    for id in [dead_a, dead_b] {
        let status = h.status.listing(id).await.unwrap();
        assert_eq!(status.status, "skipped");
        assert_eq!(status.skip_reason, Some(demper::types::SkipReason::StoreUnavailable));
        assert_eq!(h.db.listing(id).await.unwrap().unwrap().price, dec!(1000));
    }
    assert_eq!(h.db.listing(ok_id).await.unwrap().unwrap().price, dec!(899));

    let calls = h.market.calls();
    assert!(!calls.contains(&Call::FetchOffers("SKU2".into())));
    assert!(!calls.contains(&Call::FetchOffers("SKU3".into())));
    assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failed_login_skips_store_once_per_round() {
    let db = Database::in_memory().await.unwrap();
    let market = Arc::new(MockMarketplace::new());
    let s1 = store(&db, "M1", "stale", true).await;
    let mut ids = Vec::new();
    for i in 0..3 {
        let ext = format!("{}", 100 + i);
        let sku = format!("SKU{i}");
        ids.push(listing(&db, s1, &sku, &ext, dec!(1000)).await);
        market.set_offers(&ext, &[("RIVAL", dec!(900))]);
        market.set_catalog_item("M1", &sku, &ext, dec!(1000));
    }

    let h = harness_with(db, market, CountingRefresher::rejecting()).await;

    let first = h.orchestrator.run_round().await.unwrap();
    assert_eq!((first.skipped, first.failed, first.updated), (3, 0, 0));
    assert_eq!((first.stores_synced, first.stores_failed), (0, 1));
    // The catalog resync must not try to log in again.
    assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);

    let second = h.orchestrator.run_round().await.unwrap();
    assert_eq!((second.skipped, second.stores_failed), (3, 1));
    assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 2);

    let calls = h.market.calls();
    assert!(!calls.iter().any(|c| matches!(c, Call::FetchOffers(_) | Call::UpdatePrice(_) | Call::CatalogPage(..))));
    for id in ids {
        assert_eq!(h.db.listing(id).await.unwrap().unwrap().price, dec!(1000));
        assert!(h.db.history(id).await.unwrap().is_empty());
        let status = h.status.listing(id).await.unwrap();
        assert_eq!(status.skip_reason, Some(demper::types::SkipReason::StoreUnavailable));
    }
    assert!(h.db.store(s1).await.unwrap().unwrap().last_sync.is_none());
}

#[tokio::test]
async fn test_expired_session_refreshed_once_for_whole_store() {
    let db = Database::in_memory().await.unwrap();
    let market = Arc::new(MockMarketplace::new());
    let s1 = store(&db, "M1", "stale", true).await;
    let mut ids = Vec::new();
    for i in 0..5 {
        let ext = format!("{}", 100 + i);
        let sku = format!("SKU{i}");
        ids.push(listing(&db, s1, &sku, &ext, dec!(1000)).await);
        market.set_offers(&ext, &[("RIVAL", dec!(950))]);
        market.set_catalog_item("M1", &sku, &ext, dec!(1000));
    }

    let h = harness(db, market).await;
    let report = h.orchestrator.run_round().await.unwrap();

    assert_eq!(report.updated, 5);
    assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
    for id in ids {
        assert_eq!(h.db.listing(id).await.unwrap().unwrap().price, dec!(949));
    }

    let stored = h.db.load_session(s1).await.unwrap().unwrap();
    assert!(stored.blob.unwrap().contains(LIVE_SID));
}

#[tokio::test]
async fn test_one_listing_failure_does_not_affect_others() {
    let db = Database::in_memory().await.unwrap();
    let market = Arc::new(MockMarketplace::new());
    let s1 = store(&db, "M1", LIVE_SID, false).await;
    let flaky = listing(&db, s1, "SKU-A", "100", dec!(1000)).await;
    let _boom = listing(&db, s1, "SKU-B", "200", dec!(1000)).await;
    let fine = listing(&db, s1, "SKU-C", "300", dec!(1000)).await;
    let rejected = listing(&db, s1, "SKU-D", "400", dec!(1000)).await;
    for ext in ["100", "200", "300", "400"] {
        market.set_offers(ext, &[("RIVAL", dec!(900))]);
    }
    market.fail_offers("100");
    market.panic_on_offers("200");
    market.reject_uploads("SKU-D");

    let h = harness(db, market).await;
    let report = h.orchestrator.run_round().await.unwrap();

    assert_eq!(report.listings, 4);
    assert_eq!(report.updated, 1);
    assert_eq!(report.failed, 2);
    assert_eq!(report.panicked, 1);

    assert_eq!(h.db.listing(fine).await.unwrap().unwrap().price, dec!(899));
    assert_eq!(h.db.listing(flaky).await.unwrap().unwrap().price, dec!(1000));
    assert_eq!(h.db.listing(rejected).await.unwrap().unwrap().price, dec!(1000));
    assert!(h.db.history(rejected).await.unwrap().is_empty());

    let status = h.status.listing(flaky).await.unwrap();
    assert_eq!(status.error_kind, Some("transport"));
}

#[tokio::test]
async fn test_store_resync_runs_after_all_listings_in_store_order() {
    let db = Database::in_memory().await.unwrap();
    let market = Arc::new(MockMarketplace::new());
    let s1 = store(&db, "M1", LIVE_SID, false).await;
    let s2 = store(&db, "M2", LIVE_SID, false).await;
    for (store_id, merchant, sku, ext) in [(s1, "M1", "A", "1"), (s2, "M2", "B", "2"), (s1, "M1", "C", "3")] {
        listing(&db, store_id, sku, ext, dec!(1000)).await;
        market.set_offers(ext, &[("RIVAL", dec!(900))]);
        market.set_catalog_item(merchant, sku, ext, dec!(1000));
    }

    let h = harness(db, market).await;
    let report = h.orchestrator.run_round().await.unwrap();
    assert_eq!(report.stores_synced, 2);

    let calls = h.market.calls();
    let last_listing_call = calls
        .iter()
        .rposition(|c| matches!(c, Call::FetchOffers(_) | Call::UpdatePrice(_)))
        .unwrap();
    let first_catalog = calls.iter().position(|c| matches!(c, Call::CatalogPage(..))).unwrap();
    assert!(last_listing_call < first_catalog);

    let catalog_merchants: Vec<&str> = calls
        .iter()
        .filter_map(|c| match c {
            Call::CatalogPage(m, _) => Some(m.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(catalog_merchants, vec!["M1", "M1", "M2", "M2"]);

    assert_eq!(h.db.store(s1).await.unwrap().unwrap().products_count, 2);
    assert_eq!(h.db.store(s2).await.unwrap().unwrap().products_count, 1);
}

// ---------------------------------------------------------------------------
// Loop lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_run_stops_on_shutdown_after_round() {
    let db = Database::in_memory().await.unwrap();
    let market = Arc::new(MockMarketplace::new());
    let s1 = store(&db, "M1", LIVE_SID, false).await;
    listing(&db, s1, "SKU1", "100", dec!(1000)).await;
    market.set_offers("100", &[("RIVAL", dec!(900))]);

    let h = Arc::new(harness(db, market).await);
    let (tx, rx) = watch::channel(false);
    let runner = {
        let h = h.clone();
        tokio::spawn(async move { h.orchestrator.run(rx).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.status.engine().await.state != EngineState::Sleeping {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(h.status.last_round().await.is_some());

    tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), runner).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(h.status.engine().await.state, EngineState::Stopped);
    assert_eq!(h.status.rounds().await.len(), 1);
}

#[tokio::test]
async fn test_shutdown_mid_round_lets_listings_finish() {
    let db = Database::in_memory().await.unwrap();
    let market = Arc::new(MockMarketplace::new());
    let s1 = store(&db, "M1", LIVE_SID, false).await;
    let a = listing(&db, s1, "SKU1", "100", dec!(1000)).await;
    let b = listing(&db, s1, "SKU2", "200", dec!(1000)).await;
    for ext in ["100", "200"] {
        market.set_offers(ext, &[("RIVAL", dec!(900))]);
    }
    market.set_catalog_item("M1", "SKU1", "100", dec!(1000));
    market.set_catalog_item("M1", "SKU2", "200", dec!(1000));
    market.slow_offers(Duration::from_millis(300));

    let h = Arc::new(harness(db, market).await);
    let (tx, rx) = watch::channel(false);
    let runner = {
        let h = h.clone();
        tokio::spawn(async move { h.orchestrator.run(rx).await })
    };

    // Signal while the offer queries are still outstanding.
    tokio::time::timeout(Duration::from_secs(5), async {
        while !h.market.calls().contains(&Call::FetchOffers("SKU2".into())) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(!h.market.calls().iter().any(|c| matches!(c, Call::UpdatePrice(_))));
    tx.send(true).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), runner).await.unwrap().unwrap();
    assert!(result.is_ok());

    for id in [a, b] {
        assert_eq!(h.db.listing(id).await.unwrap().unwrap().price, dec!(899));
        assert_eq!(h.db.history(id).await.unwrap().len(), 1);
    }
    assert_eq!(h.market.remote_price("M1", "SKU1"), Some(dec!(899)));

    let rounds = h.status.rounds().await;
    assert_eq!(rounds.len(), 1);
    assert_eq!((rounds[0].updated, rounds[0].stores_synced), (2, 1));
    assert_eq!(h.status.engine().await.state, EngineState::Stopped);
}

#[tokio::test]
async fn test_listing_load_failure_is_fatal() {
    let db = Database::in_memory().await.unwrap();
    let h = harness(db, Arc::new(MockMarketplace::new())).await;
    h.db.close().await;

    let (_tx, rx) = watch::channel(false);
    let err = h.orchestrator.run(rx).await.unwrap_err();
    assert_eq!(err.kind(), "persistence");
    assert_eq!(h.status.engine().await.state, EngineState::Stopped);
}
