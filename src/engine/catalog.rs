//! Store catalog resynchronization.
//!
//! Pages through the seller's own catalog and merges every offer into the
//! local product table. Runs once per store after each round's listing
//! fan-out, one store at a time.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::marketplace::Marketplace;
use crate::session::SessionStore;
use crate::storage::{Database, UpsertResult};
use crate::types::{CookieMap, DemperError};

/// Stop paging after this many pages even if the marketplace keeps answering.
const MAX_PAGES: u32 = 1_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub store_id: i64,
    pub pages: u32,
    pub offers: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub products_count: i64,
}

pub struct CatalogSync {
    db: Database,
    marketplace: Arc<dyn Marketplace>,
    sessions: Arc<SessionStore>,
}

impl CatalogSync {
    pub fn new(db: Database, marketplace: Arc<dyn Marketplace>, sessions: Arc<SessionStore>) -> Self {
        Self {
            db,
            marketplace,
            sessions,
        }
    }

    /// Merge the store's remote catalog into the local product table.
    ///
    /// A store already skipped this round is not touched again; its
    /// session gets another chance next round.
    pub async fn sync_store(&self, store_id: i64) -> Result<SyncReport, DemperError> {
        if self.sessions.is_unavailable(store_id) {
            return Err(DemperError::SessionUnavailable {
                store_id,
                reason: "store skipped this round, catalog sync skipped".into(),
            });
        }
        let session = self.sessions.session_for(store_id).await?;

        let merchant_id = match session.merchant_id.clone() {
            Some(m) => m,
            None => self
                .db
                .store(store_id)
                .await?
                .and_then(|s| s.merchant_id)
                .ok_or_else(|| DemperError::SessionUnavailable {
                    store_id,
                    reason: "merchant id unknown".into(),
                })?,
        };
        let mut cookies = session.cookie_map();

        let mut report = SyncReport {
            store_id,
            ..SyncReport::default()
        };
        let mut refreshed = false;
        let mut page = 0;

        while page < MAX_PAGES {
            let offers = match self.marketplace.fetch_catalog_page(&merchant_id, &cookies, page).await {
                Ok(offers) => offers,
                Err(DemperError::Auth(_)) if !refreshed => {
                    refreshed = true;
                    cookies = self.refreshed_cookies(store_id, &cookies).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if offers.is_empty() {
                break;
            }

            report.pages += 1;
            report.offers += offers.len();
            for offer in &offers {
                match self.db.upsert_catalog_offer(store_id, offer).await? {
                    UpsertResult::Inserted => report.inserted += 1,
                    UpsertResult::Updated => report.updated += 1,
                    UpsertResult::Unchanged => report.unchanged += 1,
                }
            }
            debug!(store_id, page, offers = offers.len(), "Catalog page merged");
            page += 1;
        }
        if page == MAX_PAGES {
            warn!(store_id, "Catalog paging stopped at page limit");
        }

        report.products_count = self.db.count_listings(store_id).await?;
        self.db.record_sync(store_id, report.products_count, Utc::now()).await?;

        info!(
            store_id,
            pages = report.pages,
            offers = report.offers,
            inserted = report.inserted,
            updated = report.updated,
            products = report.products_count,
            "Store catalog synced"
        );
        Ok(report)
    }

    async fn refreshed_cookies(&self, store_id: i64, observed: &CookieMap) -> Result<CookieMap, DemperError> {
        let session = self.sessions.handle_auth_failure(store_id, observed).await?;
        Ok(session.cookie_map())
    }
}
