//! Cycle orchestrator.
//!
//! Each round loads every active listing, re-prices them concurrently
//! under a fixed-size semaphore, waits for all of them, then resyncs each
//! touched store's catalog one store at a time. Rounds repeat after a fixed
//! delay until shutdown is requested; a round in flight always drains.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::catalog::CatalogSync;
use super::repricer::Repricer;
use super::status::{EngineState, StatusBoard};
use crate::config::EngineConfig;
use crate::session::SessionStore;
use crate::storage::Database;
use crate::types::{DemperError, ListingOutcome};

// ---------------------------------------------------------------------------
// Settings & report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_concurrent_tasks: usize,
    pub round_delay: Duration,
    pub jitter_min: Duration,
    pub jitter_max: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            max_concurrent_tasks: cfg.max_concurrent_tasks.max(1),
            round_delay: cfg.round_delay(),
            jitter_min: Duration::from_millis(cfg.jitter_min_ms),
            jitter_max: Duration::from_millis(cfg.jitter_max_ms),
        }
    }
}

/// Summary of one completed round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundReport {
    pub round: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub listings: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Listing tasks that panicked; counted apart from `failed`.
    pub panicked: usize,
    pub stores_synced: usize,
    pub stores_failed: usize,
}

impl RoundReport {
    pub fn empty(round: u64) -> Self {
        let now = Utc::now();
        Self {
            round,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            listings: 0,
            updated: 0,
            unchanged: 0,
            skipped: 0,
            failed: 0,
            panicked: 0,
            stores_synced: 0,
            stores_failed: 0,
        }
    }

    fn tally(&mut self, outcome: &ListingOutcome) {
        match outcome {
            ListingOutcome::Updated { .. } => self.updated += 1,
            ListingOutcome::Unchanged { .. } => self.unchanged += 1,
            ListingOutcome::Skipped(_) => self.skipped += 1,
            ListingOutcome::Failed(_) => self.failed += 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    db: Database,
    repricer: Arc<Repricer>,
    catalog: Arc<CatalogSync>,
    sessions: Arc<SessionStore>,
    status: Arc<StatusBoard>,
    settings: OrchestratorSettings,
    round: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        db: Database,
        repricer: Arc<Repricer>,
        catalog: Arc<CatalogSync>,
        sessions: Arc<SessionStore>,
        status: Arc<StatusBoard>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            db,
            repricer,
            catalog,
            sessions,
            status,
            settings,
            round: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> Arc<StatusBoard> {
        self.status.clone()
    }

    /// Run rounds until `shutdown` flips to `true` (or its sender is
    /// dropped). Returns an error only when listings cannot be loaded at
    /// all, which the process treats as fatal.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), DemperError> {
        info!(
            max_concurrent = self.settings.max_concurrent_tasks,
            round_delay_secs = self.settings.round_delay.as_secs(),
            "Orchestrator started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.run_round().await {
                error!(error = %e, "Round aborted, cannot continue");
                self.status.set_state(EngineState::Stopped).await;
                return Err(e);
            }

            self.status.set_state(EngineState::Sleeping).await;
            tokio::select! {
                _ = tokio::time::sleep(self.settings.round_delay) => {}
                // A `true` is picked up at the top of the loop.
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.status.set_state(EngineState::Stopped).await;
        info!("Orchestrator stopped");
        Ok(())
    }

    /// One full round: listing fan-out, barrier, sequential store resync.
    pub async fn run_round(&self) -> Result<RoundReport, DemperError> {
        let round = self.round.fetch_add(1, Ordering::SeqCst) + 1;
        self.run_round_inner(round)
            .instrument(info_span!("round", round))
            .await
    }

    async fn run_round_inner(&self, round: u64) -> Result<RoundReport, DemperError> {
        let clock = Instant::now();
        let mut report = RoundReport::empty(round);

        self.sessions.begin_round();
        self.status.begin_round(round).await;

        let listings = self.db.active_listings().await?;
        report.listings = listings.len();
        let stores: BTreeSet<i64> = listings.iter().map(|l| l.store_id).collect();

        let active: HashSet<i64> = listings.iter().map(|l| l.id).collect();
        self.repricer.rate_limits().retain(&active);
        let pruned = self.status.retain_listings(&active).await;
        if pruned > 0 {
            debug!(pruned, "Dropped status for deactivated listings");
        }
        info!(listings = listings.len(), stores = stores.len(), "Round started");

        // -- fan-out
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_tasks));
        let mut tasks = JoinSet::new();
        for listing in listings {
            let semaphore = semaphore.clone();
            let repricer = self.repricer.clone();
            let (jitter_min, jitter_max) = (self.settings.jitter_min, self.settings.jitter_max);
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    let e = DemperError::Config("concurrency limiter closed".into());
                    return (listing, ListingOutcome::Failed(e));
                };
                let outcome = repricer.process(&listing).await;
                // Pause while still holding the permit to avoid request bursts.
                tokio::time::sleep(jitter(jitter_min, jitter_max)).await;
                (listing, outcome)
            });
        }

        // -- barrier
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((listing, outcome)) => {
                    report.tally(&outcome);
                    self.status.record_listing(&listing, round, &outcome).await;
                }
                Err(e) => {
                    report.panicked += 1;
                    error!(error = %e, "Listing task panicked");
                }
            }
        }

        // -- sequential store resync
        for store_id in stores {
            let catalog = self.catalog.clone();
            match tokio::spawn(async move { catalog.sync_store(store_id).await }).await {
                Ok(Ok(_)) => report.stores_synced += 1,
                Ok(Err(e)) => {
                    report.stores_failed += 1;
                    warn!(store_id, kind = e.kind(), error = %e, "Store sync failed");
                }
                Err(e) => {
                    report.stores_failed += 1;
                    error!(store_id, error = %e, "Store sync task panicked");
                }
            }
        }

        report.finished_at = Utc::now();
        report.duration_ms = clock.elapsed().as_millis() as u64;
        info!(
            listings = report.listings,
            updated = report.updated,
            unchanged = report.unchanged,
            skipped = report.skipped,
            failed = report.failed,
            panicked = report.panicked,
            stores_synced = report.stores_synced,
            stores_failed = report.stores_failed,
            duration_ms = report.duration_ms,
            "Round finished"
        );
        self.status.finish_round(report.clone()).await;
        Ok(report)
    }
}

fn jitter(min: Duration, max: Duration) -> Duration {
    if max > min {
        rand::thread_rng().gen_range(min..=max)
    } else {
        min
    }
}
