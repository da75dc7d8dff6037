//! Marketplace integration.
//!
//! Defines the `Marketplace` trait, the seam between the engine and the
//! remote HTTP surface, and provides the Kaspi implementation:
//! - public offer listing (competitor prices per product)
//! - authenticated price upload
//! - session liveness probe
//! - seller catalog paging

pub mod headers;
pub mod kaspi;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{CatalogOffer, CompetitorOffer, CookieMap, DemperError, Listing};

pub use kaspi::KaspiClient;

/// An approved price change ready to push to the marketplace.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceUpdate {
    pub merchant_id: String,
    pub sku: String,
    pub price: Decimal,
    pub cookies: CookieMap,
}

/// Result of the session liveness probe.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionProbe {
    pub valid: bool,
    /// Merchant uids visible to the session, when valid.
    pub merchant_ids: Vec<String>,
}

impl SessionProbe {
    pub fn invalid() -> Self {
        Self::default()
    }
}

/// Abstraction over the marketplace HTTP surface.
///
/// Implementations map HTTP 401 to `DemperError::Auth`, HTTP 429 to
/// `DemperError::RateLimited` and every other failure to
/// `DemperError::Transport`. No call retries internally.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Marketplace: Send + Sync {
    /// Current rival offers for a listing. May include the seller's own offer.
    async fn fetch_offers(&self, listing: &Listing) -> Result<Vec<CompetitorOffer>, DemperError>;

    /// Push a new price using the seller's session cookies.
    async fn update_price(&self, update: &PriceUpdate) -> Result<(), DemperError>;

    /// Lightweight authenticated request telling whether cookies are live.
    async fn probe_session(&self, cookies: &CookieMap) -> Result<SessionProbe, DemperError>;

    /// One page of the seller's own catalog. An empty page ends paging.
    async fn fetch_catalog_page(
        &self,
        merchant_id: &str,
        cookies: &CookieMap,
        page: u32,
    ) -> Result<Vec<CatalogOffer>, DemperError>;
}
