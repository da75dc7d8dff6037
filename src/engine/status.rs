//! Observable engine state for an external reporting layer.
//!
//! The orchestrator writes here after every listing and every round; the
//! optional dashboard (or anything else holding the `Arc`) reads it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::RwLock;

use super::orchestrator::RoundReport;
use crate::types::{ChangeReason, Listing, ListingOutcome, SkipReason};

/// Rounds kept in memory.
const ROUND_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Running,
    Sleeping,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub round: u64,
    pub started_at: DateTime<Utc>,
    pub last_round_at: Option<DateTime<Utc>>,
    pub listings_tracked: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceChange {
    pub old_price: Decimal,
    pub new_price: Decimal,
    pub reason: ChangeReason,
    pub cumulative_loss: Decimal,
    pub at: DateTime<Utc>,
}

/// Latest known state of one listing.
#[derive(Debug, Clone, Serialize)]
pub struct ListingStatus {
    pub listing_id: i64,
    pub sku: String,
    pub store_id: i64,
    pub round: u64,
    pub status: &'static str,
    pub price: Decimal,
    pub skip_reason: Option<SkipReason>,
    pub error: Option<String>,
    pub error_kind: Option<&'static str>,
    /// Survives rounds in which the price did not move.
    pub last_change: Option<PriceChange>,
    pub updated_at: DateTime<Utc>,
}

pub struct StatusBoard {
    engine: RwLock<EngineStatus>,
    listings: RwLock<HashMap<i64, ListingStatus>>,
    rounds: RwLock<VecDeque<RoundReport>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            engine: RwLock::new(EngineStatus {
                state: EngineState::Idle,
                round: 0,
                started_at: Utc::now(),
                last_round_at: None,
                listings_tracked: 0,
            }),
            listings: RwLock::new(HashMap::new()),
            rounds: RwLock::new(VecDeque::new()),
        }
    }

    pub async fn set_state(&self, state: EngineState) {
        self.engine.write().await.state = state;
    }

    pub async fn begin_round(&self, round: u64) {
        let mut engine = self.engine.write().await;
        engine.state = EngineState::Running;
        engine.round = round;
    }

    /// Drop status entries for listings no longer in the active set.
    pub async fn retain_listings(&self, active: &HashSet<i64>) -> usize {
        let mut listings = self.listings.write().await;
        let before = listings.len();
        listings.retain(|id, _| active.contains(id));
        before - listings.len()
    }

    pub async fn record_listing(&self, listing: &Listing, round: u64, outcome: &ListingOutcome) {
        let now = Utc::now();
        let mut listings = self.listings.write().await;
        let last_change = listings.get(&listing.id).and_then(|s| s.last_change.clone());

        let mut status = ListingStatus {
            listing_id: listing.id,
            sku: listing.sku.clone(),
            store_id: listing.store_id,
            round,
            status: outcome.label(),
            price: listing.price,
            skip_reason: None,
            error: None,
            error_kind: None,
            last_change,
            updated_at: now,
        };
        match outcome {
            ListingOutcome::Updated {
                old_price,
                new_price,
                reason,
                cumulative_loss,
            } => {
                status.price = *new_price;
                status.last_change = Some(PriceChange {
                    old_price: *old_price,
                    new_price: *new_price,
                    reason: *reason,
                    cumulative_loss: *cumulative_loss,
                    at: now,
                });
            }
            ListingOutcome::Unchanged { price } => status.price = *price,
            ListingOutcome::Skipped(reason) => status.skip_reason = Some(*reason),
            ListingOutcome::Failed(e) => {
                status.error = Some(e.to_string());
                status.error_kind = Some(e.kind());
            }
        }
        listings.insert(listing.id, status);
    }

    pub async fn finish_round(&self, report: RoundReport) {
        {
            let mut engine = self.engine.write().await;
            engine.last_round_at = Some(report.finished_at);
            engine.listings_tracked = self.listings.read().await.len();
        }
        let mut rounds = self.rounds.write().await;
        rounds.push_back(report);
        while rounds.len() > ROUND_HISTORY {
            rounds.pop_front();
        }
    }

    pub async fn engine(&self) -> EngineStatus {
        self.engine.read().await.clone()
    }

    pub async fn listing(&self, id: i64) -> Option<ListingStatus> {
        self.listings.read().await.get(&id).cloned()
    }

    /// All listings, ordered by id.
    pub async fn listings(&self) -> Vec<ListingStatus> {
        let mut all: Vec<ListingStatus> = self.listings.read().await.values().cloned().collect();
        all.sort_by_key(|s| s.listing_id);
        all
    }

    /// Recent rounds, oldest first.
    pub async fn rounds(&self) -> Vec<RoundReport> {
        self.rounds.read().await.iter().cloned().collect()
    }

    pub async fn last_round(&self) -> Option<RoundReport> {
        self.rounds.read().await.back().cloned()
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}
