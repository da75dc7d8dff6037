//! Per-listing pipeline: fetch → decide → update → ledger.
//!
//! Steps run strictly in order for one listing. Every failure is folded
//! into a `ListingOutcome` so the orchestrator never sees an error escape
//! a listing task.

use rand::Rng;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::ledger::Ledger;
use super::pricing::{decide, Decision, MarketSnapshot, PricingInput};
use crate::config::EngineConfig;
use crate::marketplace::{Marketplace, PriceUpdate};
use crate::session::SessionStore;
use crate::storage::Database;
use crate::types::{ChangeReason, DemperError, Listing, ListingOutcome, Session, SkipReason};

// ---------------------------------------------------------------------------
// Rate-limit cool-down
// ---------------------------------------------------------------------------

/// Listings that recently hit HTTP 429, with the instant they may retry.
pub struct RateLimitTracker {
    until: Mutex<HashMap<i64, Instant>>,
    min: Duration,
    max: Duration,
}

impl RateLimitTracker {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            until: Mutex::new(HashMap::new()),
            min,
            max: max.max(min),
        }
    }

    /// Start a randomized cool-down for `listing_id`.
    pub fn back_off(&self, listing_id: i64) -> Duration {
        let delay = if self.max > self.min {
            rand::thread_rng().gen_range(self.min..=self.max)
        } else {
            self.min
        };
        self.lock().insert(listing_id, Instant::now() + delay);
        delay
    }

    pub fn cooling_down(&self, listing_id: i64) -> bool {
        let mut until = self.lock();
        match until.get(&listing_id) {
            Some(deadline) if *deadline > Instant::now() => true,
            Some(_) => {
                until.remove(&listing_id);
                false
            }
            None => false,
        }
    }

    /// Forget cool-downs for listings outside `listing_ids`.
    pub fn retain(&self, listing_ids: &HashSet<i64>) {
        self.lock().retain(|id, _| listing_ids.contains(id));
    }

    pub fn active(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|d| **d > now).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Instant>> {
        self.until.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Repricer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RepricerSettings {
    pub anomaly_threshold_pct: Decimal,
    pub history_window: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl RepricerSettings {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            anomaly_threshold_pct: Decimal::from(cfg.anomaly_threshold_pct),
            history_window: cfg.history_window.max(2),
            backoff_min: Duration::from_secs(cfg.rate_limit_backoff_min_secs),
            backoff_max: Duration::from_secs(cfg.rate_limit_backoff_max_secs),
        }
    }
}

impl Default for RepricerSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

pub struct Repricer {
    db: Database,
    marketplace: Arc<dyn Marketplace>,
    sessions: Arc<SessionStore>,
    ledger: Ledger,
    rate_limits: RateLimitTracker,
    settings: RepricerSettings,
}

impl Repricer {
    pub fn new(
        db: Database,
        marketplace: Arc<dyn Marketplace>,
        sessions: Arc<SessionStore>,
        settings: RepricerSettings,
    ) -> Self {
        Self {
            ledger: Ledger::new(db.clone()),
            rate_limits: RateLimitTracker::new(settings.backoff_min, settings.backoff_max),
            db,
            marketplace,
            sessions,
            settings,
        }
    }

    pub fn rate_limits(&self) -> &RateLimitTracker {
        &self.rate_limits
    }

    /// Run the whole pipeline for one listing.
    pub async fn process(&self, listing: &Listing) -> ListingOutcome {
        match self.run_pipeline(listing).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(listing_id = listing.id, sku = %listing.sku, kind = e.kind(), error = %e, "Listing failed");
                ListingOutcome::Failed(e)
            }
        }
    }

    async fn run_pipeline(&self, listing: &Listing) -> Result<ListingOutcome, DemperError> {
        if self.rate_limits.cooling_down(listing.id) {
            debug!(listing_id = listing.id, "Cooling down after rate limit");
            return Ok(ListingOutcome::Skipped(SkipReason::RateLimitCooldown));
        }

        let session = match self.sessions.session_for(listing.store_id).await {
            Ok(session) => session,
            Err(DemperError::SessionUnavailable { .. }) => {
                debug!(listing_id = listing.id, store_id = listing.store_id, "Store unavailable, skipping");
                return Ok(ListingOutcome::Skipped(SkipReason::StoreUnavailable));
            }
            Err(e) => return Err(e),
        };

        // -- fetch
        let offers = match self.marketplace.fetch_offers(listing).await {
            Ok(offers) => offers,
            Err(e @ DemperError::RateLimited(_)) => {
                let delay = self.rate_limits.back_off(listing.id);
                warn!(listing_id = listing.id, sku = %listing.sku, backoff_secs = delay.as_secs(), "Offer query rate limited");
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let competitor_prices: Vec<Decimal> = offers
            .iter()
            .filter(|o| session.merchant_id.as_deref() != Some(o.merchant_id.as_str()))
            .map(|o| o.price)
            .collect();

        // -- decide
        let history = self
            .db
            .recent_history(listing.id, self.settings.history_window)
            .await?;
        let previous_price = history.get(1).map_or(listing.price, |e| e.price);

        if let Some(snapshot) = MarketSnapshot::from_prices(&competitor_prices) {
            debug!(
                listing = %listing,
                competitors = snapshot.competitors,
                lowest = %snapshot.lowest,
                average = %snapshot.average,
                median = %snapshot.median,
                spread = %snapshot.spread,
                "Market snapshot"
            );
        }

        let input = PricingInput {
            current_price: listing.price,
            min_profit: listing.min_profit,
            max_profit: listing.max_profit,
            price_step: listing.price_step,
            competitor_prices,
            previous_price,
        };
        let decision = match decide(&input, self.settings.anomaly_threshold_pct) {
            Decision::Reprice(d) => d,
            Decision::Skip(reason) => {
                if reason == SkipReason::NoCompetitors {
                    warn!(listing_id = listing.id, sku = %listing.sku, "No competitors");
                } else {
                    debug!(listing_id = listing.id, sku = %listing.sku, %reason, "No price change");
                }
                return Ok(ListingOutcome::Skipped(reason));
            }
        };

        if decision.reason == ChangeReason::NoChange {
            return Ok(ListingOutcome::Unchanged { price: listing.price });
        }
        if decision.anomalous {
            warn!(
                listing_id = listing.id,
                sku = %listing.sku,
                old_price = %listing.price,
                new_price = %decision.new_price,
                change_pct = %decision.change_pct,
                "Anomalous price move"
            );
        }
        if decision.reverts_previous {
            debug!(listing_id = listing.id, price = %decision.new_price, "Price returns to previous level");
        }

        // -- update
        let new_price = decision.new_price;
        match self.push_price(listing, &session, new_price).await {
            Ok(()) => {}
            Err(DemperError::SessionUnavailable { .. }) => {
                return Ok(ListingOutcome::Skipped(SkipReason::StoreUnavailable));
            }
            Err(e) => return Err(e),
        }

        // -- ledger
        let entry = match self.ledger.commit_price_change(listing.id, listing.price, new_price).await {
            Ok(entry) => entry,
            Err(e) => {
                error!(
                    critical = true,
                    listing_id = listing.id,
                    sku = %listing.sku,
                    remote_price = %new_price,
                    local_price = %listing.price,
                    error = %e,
                    "Remote price changed but ledger write failed; local and remote prices diverge"
                );
                return Err(e);
            }
        };

        info!(
            listing_id = listing.id,
            sku = %listing.sku,
            old_price = %listing.price,
            new_price = %new_price,
            reason = %decision.reason,
            branch = decision.branch.as_str(),
            cumulative_loss = %entry.cumulative_loss,
            "Price updated"
        );
        Ok(ListingOutcome::Updated {
            old_price: listing.price,
            new_price,
            reason: decision.reason,
            cumulative_loss: entry.cumulative_loss,
        })
    }

    /// Upload the price; on 401 refresh the store's session once and retry.
    async fn push_price(&self, listing: &Listing, session: &Session, price: Decimal) -> Result<(), DemperError> {
        let merchant_id = session.merchant_id.clone().ok_or_else(|| DemperError::SessionUnavailable {
            store_id: listing.store_id,
            reason: "merchant id unknown".into(),
        })?;
        let mut update = PriceUpdate {
            merchant_id,
            sku: listing.sku.clone(),
            price,
            cookies: session.cookie_map(),
        };

        match self.marketplace.update_price(&update).await {
            Ok(()) => Ok(()),
            Err(DemperError::Auth(_)) => {
                let refreshed = self
                    .sessions
                    .handle_auth_failure(listing.store_id, &update.cookies)
                    .await?;
                update.cookies = refreshed.cookie_map();
                self.marketplace.update_price(&update).await
            }
            Err(e @ DemperError::RateLimited(_)) => {
                self.rate_limits.back_off(listing.id);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
