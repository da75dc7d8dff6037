//! Shared types for the DEMPER engine.
//!
//! These types form the data model used across all modules. Storage,
//! marketplace, session and engine modules depend on them without
//! depending on each other.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// A seller's product offer tracked for automated pricing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: i64,
    /// Marketplace product identifier used by the public offer query.
    pub external_id: String,
    pub sku: String,
    pub price: Decimal,
    /// Lowest price the engine may ever set.
    pub min_profit: Decimal,
    /// Highest price the engine may ever set, if configured.
    pub max_profit: Option<Decimal>,
    /// Minimum price-move granularity.
    pub price_step: Decimal,
    pub store_id: i64,
    pub active: bool,
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} [{}] price={} floor={} ceiling={} step={} store={}",
            self.id,
            self.sku,
            self.price,
            self.min_profit,
            self.max_profit
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.price_step,
            self.store_id,
        )
    }
}

/// A rival seller's price for the same listing. Fetched fresh every round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitorOffer {
    pub merchant_id: String,
    pub price: Decimal,
}

/// One row of the seller's own catalog as reported by the marketplace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogOffer {
    pub offer_id: Option<String>,
    pub sku: String,
    pub name: Option<String>,
    pub category: Option<String>,
    pub price: Decimal,
    pub external_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Price history
// ---------------------------------------------------------------------------

/// Why a listing's price was (or was not) changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeReason {
    DempingDecrease,
    PriceIncrease,
    NoChange,
}

impl ChangeReason {
    /// Classify a move from `before` to `after`.
    pub fn classify(before: Decimal, after: Decimal) -> Self {
        if after < before {
            ChangeReason::DempingDecrease
        } else if after > before {
            ChangeReason::PriceIncrease
        } else {
            ChangeReason::NoChange
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeReason::DempingDecrease => "demping_decrease",
            ChangeReason::PriceIncrease => "price_increase",
            ChangeReason::NoChange => "no_change",
        }
    }
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChangeReason {
    type Err = DemperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "demping_decrease" => Ok(ChangeReason::DempingDecrease),
            "price_increase" => Ok(ChangeReason::PriceIncrease),
            "no_change" => Ok(ChangeReason::NoChange),
            other => Err(DemperError::Persistence(format!(
                "unknown change reason in price history: {other}"
            ))),
        }
    }
}

/// Append-only ledger row.
///
/// `cumulative_loss(n) = cumulative_loss(n-1) + price_decrease(n)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistoryEntry {
    pub listing_id: i64,
    /// Price at the time of write (the price before the change).
    pub price: Decimal,
    pub created_at: DateTime<Utc>,
    pub price_decrease: Decimal,
    pub cumulative_loss: Decimal,
    pub change_reason: ChangeReason,
}

// ---------------------------------------------------------------------------
// Sessions & stores
// ---------------------------------------------------------------------------

/// Name → value cookie map sent with authenticated requests.
pub type CookieMap = BTreeMap<String, String>;

/// Render a cookie map as a `Cookie` header value.
pub fn cookie_header(cookies: &CookieMap) -> String {
    cookies
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A browser cookie as captured by the login flow.
/// Extra browser attributes are ignored on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl BrowserCookie {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            domain: None,
            path: None,
        }
    }
}

/// Seller login used to refresh an expired session.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: SecretString,
}

/// Authenticated material needed to act on a seller's behalf.
#[derive(Debug, Clone)]
pub struct Session {
    pub store_id: i64,
    pub cookies: Vec<BrowserCookie>,
    pub credentials: Option<Credentials>,
    pub last_login: Option<DateTime<Utc>>,
    pub merchant_id: Option<String>,
}

impl Session {
    /// Flatten captured cookies into a request cookie map.
    /// Later duplicates win, as a browser jar would.
    pub fn cookie_map(&self) -> CookieMap {
        self.cookies
            .iter()
            .map(|c| (c.name.clone(), c.value.clone()))
            .collect()
    }
}

/// A seller store as persisted in the `stores` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Store {
    pub id: i64,
    pub user_id: Option<String>,
    pub merchant_id: Option<String>,
    pub products_count: i64,
    pub last_sync: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Per-listing outcome
// ---------------------------------------------------------------------------

/// Why a listing was left alone this round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The offer query returned no rival offers.
    NoCompetitors,
    /// None of the pricing branches applied.
    NoQualifyingBranch,
    /// The listing is still cooling down after a rate-limit response.
    RateLimitCooldown,
    /// The owning store has no usable session this round.
    StoreUnavailable,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoCompetitors => write!(f, "no competitors"),
            SkipReason::NoQualifyingBranch => write!(f, "no qualifying branch"),
            SkipReason::RateLimitCooldown => write!(f, "rate-limit cooldown"),
            SkipReason::StoreUnavailable => write!(f, "store session unavailable"),
        }
    }
}

/// Tagged result of one listing's pipeline, collected by the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum ListingOutcome {
    /// Remote price changed and the ledger row was written.
    Updated {
        old_price: Decimal,
        new_price: Decimal,
        reason: ChangeReason,
        cumulative_loss: Decimal,
    },
    /// The decision landed on the current price; nothing was sent.
    Unchanged { price: Decimal },
    Skipped(SkipReason),
    Failed(DemperError),
}

impl ListingOutcome {
    /// Short status label for the status board.
    pub fn label(&self) -> &'static str {
        match self {
            ListingOutcome::Updated { .. } => "updated",
            ListingOutcome::Unchanged { .. } => "unchanged",
            ListingOutcome::Skipped(_) => "skipped",
            ListingOutcome::Failed(_) => "failed",
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for DEMPER.
///
/// Every variant carries a rendered message so outcomes can be cloned
/// into the status board.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DemperError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited by marketplace: {0}")]
    RateLimited(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("No stored credentials for store {0}")]
    CredentialMissing(i64),

    #[error("Session unavailable for store {store_id}: {reason}")]
    SessionUnavailable { store_id: i64, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DemperError {
    /// Stable taxonomy name for logs and status output.
    pub fn kind(&self) -> &'static str {
        match self {
            DemperError::Transport(_) => "transport",
            DemperError::Auth(_) => "auth",
            DemperError::RateLimited(_) => "rate_limited",
            DemperError::Persistence(_) => "persistence",
            DemperError::CredentialMissing(_) => "credential_missing",
            DemperError::SessionUnavailable { .. } => "session_unavailable",
            DemperError::Config(_) => "config",
        }
    }
}

impl From<sqlx::Error> for DemperError {
    fn from(e: sqlx::Error) -> Self {
        DemperError::Persistence(e.to_string())
    }
}

impl From<reqwest::Error> for DemperError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DemperError::Transport(format!("timed out: {e}"))
        } else {
            DemperError::Transport(e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
