//! Mock marketplace for integration testing.
//!
//! Provides a deterministic `Marketplace` implementation that serves
//! known competitor offers, accepts price uploads, and pages a seller
//! catalog built from whatever prices it has accepted. All in-memory
//! with no external dependencies.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use demper::marketplace::{Marketplace, PriceUpdate, SessionProbe};
use demper::types::{CatalogOffer, CompetitorOffer, CookieMap, DemperError, Listing};

/// Cookie value the mock treats as a live session.
pub const LIVE_SID: &str = "live";

/// Everything the engine asked of the mock, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    FetchOffers(String),
    UpdatePrice(String),
    Probe,
    CatalogPage(String, u32),
}

struct MerchantCatalog {
    /// sku -> (external id, remote price)
    items: BTreeMap<String, (String, Decimal)>,
}

#[derive(Default)]
struct Inner {
    offers: HashMap<String, Vec<CompetitorOffer>>,
    catalogs: HashMap<String, MerchantCatalog>,
    failing: HashSet<String>,
    panicking: HashSet<String>,
    rejected_uploads: HashSet<String>,
    offer_delay: Duration,
    calls: Vec<Call>,
}

/// A mock marketplace for deterministic round testing.
#[derive(Default)]
pub struct MockMarketplace {
    inner: Mutex<Inner>,
}

impl MockMarketplace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the rival offers returned for `external_id`.
    pub fn set_offers(&self, external_id: &str, offers: &[(&str, Decimal)]) {
        let offers = offers
            .iter()
            .map(|(merchant, price)| CompetitorOffer {
                merchant_id: merchant.to_string(),
                price: *price,
            })
            .collect();
        self.lock().offers.insert(external_id.to_string(), offers);
    }

    /// Put an item in a merchant's remote catalog.
    pub fn set_catalog_item(&self, merchant_id: &str, sku: &str, external_id: &str, price: Decimal) {
        self.lock()
            .catalogs
            .entry(merchant_id.to_string())
            .or_insert_with(|| MerchantCatalog { items: BTreeMap::new() })
            .items
            .insert(sku.to_string(), (external_id.to_string(), price));
    }

    /// Offer queries for `external_id` fail with a transport error.
    pub fn fail_offers(&self, external_id: &str) {
        self.lock().failing.insert(external_id.to_string());
    }

    /// Offer queries for `external_id` panic.
    pub fn panic_on_offers(&self, external_id: &str) {
        self.lock().panicking.insert(external_id.to_string());
    }

    /// Price uploads for `sku` are rejected with HTTP 500.
    pub fn reject_uploads(&self, sku: &str) {
        self.lock().rejected_uploads.insert(sku.to_string());
    }

    /// Every offer query takes `delay` to answer.
    pub fn slow_offers(&self, delay: Duration) {
        self.lock().offer_delay = delay;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn remote_price(&self, merchant_id: &str, sku: &str) -> Option<Decimal> {
        self.lock()
            .catalogs
            .get(merchant_id)
            .and_then(|c| c.items.get(sku))
            .map(|(_, price)| *price)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn authorized(cookies: &CookieMap) -> bool {
        cookies.get("mc-sid").map(String::as_str) == Some(LIVE_SID)
    }
}

#[async_trait]
impl Marketplace for MockMarketplace {
    async fn fetch_offers(&self, listing: &Listing) -> Result<Vec<CompetitorOffer>, DemperError> {
        let (panics, fails, offers, delay) = {
            let mut inner = self.lock();
            inner.calls.push(Call::FetchOffers(listing.sku.clone()));
            (
                inner.panicking.contains(&listing.external_id),
                inner.failing.contains(&listing.external_id),
                inner.offers.get(&listing.external_id).cloned().unwrap_or_default(),
                inner.offer_delay,
            )
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if panics {
            panic!("mock marketplace blew up on {}", listing.external_id);
        }
        if fails {
            return Err(DemperError::Transport("connection reset".into()));
        }
        Ok(offers)
    }

    async fn update_price(&self, update: &PriceUpdate) -> Result<(), DemperError> {
        let mut inner = self.lock();
        inner.calls.push(Call::UpdatePrice(update.sku.clone()));
        if !Self::authorized(&update.cookies) {
            return Err(DemperError::Auth("HTTP 401".into()));
        }
        if inner.rejected_uploads.contains(&update.sku) {
            return Err(DemperError::Transport("HTTP 500".into()));
        }
        if let Some(catalog) = inner.catalogs.get_mut(&update.merchant_id) {
            if let Some(item) = catalog.items.get_mut(&update.sku) {
                item.1 = update.price;
            }
        }
        Ok(())
    }

    async fn probe_session(&self, cookies: &CookieMap) -> Result<SessionProbe, DemperError> {
        self.lock().calls.push(Call::Probe);
        if Self::authorized(cookies) {
            Ok(SessionProbe {
                valid: true,
                merchant_ids: Vec::new(),
            })
        } else {
            Ok(SessionProbe::invalid())
        }
    }

    async fn fetch_catalog_page(
        &self,
        merchant_id: &str,
        cookies: &CookieMap,
        page: u32,
    ) -> Result<Vec<CatalogOffer>, DemperError> {
        let mut inner = self.lock();
        inner.calls.push(Call::CatalogPage(merchant_id.to_string(), page));
        if !Self::authorized(cookies) {
            return Err(DemperError::Auth("HTTP 401".into()));
        }
        // Single-page catalogs.
        if page > 0 {
            return Ok(Vec::new());
        }
        Ok(inner
            .catalogs
            .get(merchant_id)
            .map(|c| {
                c.items
                    .iter()
                    .map(|(sku, (external_id, price))| CatalogOffer {
                        offer_id: Some(format!("OFF-{sku}")),
                        sku: sku.clone(),
                        name: Some(format!("Item {sku}")),
                        category: None,
                        price: *price,
                        external_id: Some(external_id.clone()),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}
