//! Persistence layer.
//!
//! SQLite via a shared `sqlx` pool. Connections are acquired per
//! operation and released immediately. Prices are stored as decimal
//! TEXT so nothing passes through floating point.

pub mod schema;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::types::{CatalogOffer, DemperError, Listing, PriceHistoryEntry, Store};

type Result<T> = std::result::Result<T, DemperError>;

/// Stored session blob plus the columns the session store needs.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub store_id: i64,
    pub blob: Option<String>,
    pub merchant_id: Option<String>,
    pub last_login: Option<DateTime<Utc>>,
}

/// Result of merging one catalog offer into `products`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertResult {
    Inserted,
    Updated,
    Unchanged,
}

/// New listing row (used when seeding stores by hand and in tests).
#[derive(Debug, Clone)]
pub struct NewListing {
    pub store_id: i64,
    pub sku: String,
    pub external_id: String,
    pub price: Decimal,
    pub min_profit: Decimal,
    pub max_profit: Option<Decimal>,
    pub price_step: Decimal,
    pub active: bool,
}

// ---------------------------------------------------------------------------
// Database handle
// ---------------------------------------------------------------------------

/// Lifecycle-managed handle on the durable store.
/// Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `url`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;
        info!(url, max_connections, "Database pool ready");
        Ok(Self { pool })
    }

    /// Private in-memory database. A single connection that is never
    /// recycled, since every in-memory connection is a separate database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    pub async fn init_schema(&self) -> Result<()> {
        for statement in schema::STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Schema ready");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -- Listings ----------------------------------------------------------

    /// All listings flagged for automated pricing.
    pub async fn active_listings(&self) -> Result<Vec<Listing>> {
        let rows = sqlx::query(
            "SELECT id, store_id, sku, external_id, price, min_profit, max_profit, price_step, bot_active
             FROM products
             WHERE bot_active = 1 AND external_id IS NOT NULL
             ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(listing_from_row).collect()
    }

    pub async fn listing(&self, id: i64) -> Result<Option<Listing>> {
        let row = sqlx::query(
            "SELECT id, store_id, sku, external_id, price, min_profit, max_profit, price_step, bot_active
             FROM products WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(listing_from_row).transpose()
    }

    pub async fn insert_listing(&self, listing: &NewListing) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO products (store_id, sku, external_id, price, min_profit, max_profit, price_step, bot_active)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(listing.store_id)
        .bind(&listing.sku)
        .bind(&listing.external_id)
        .bind(listing.price.to_string())
        .bind(listing.min_profit.to_string())
        .bind(listing.max_profit.map(|p| p.to_string()))
        .bind(listing.price_step.to_string())
        .bind(listing.active)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn count_listings(&self, store_id: i64) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM products WHERE store_id = ?")
            .bind(store_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Merge one catalog offer into `products`, keyed by `(store_id, sku)`.
    /// Pricing bounds and the active flag are never touched here.
    pub async fn upsert_catalog_offer(&self, store_id: i64, offer: &CatalogOffer) -> Result<UpsertResult> {
        let existing = sqlx::query(
            "SELECT id, price, name, category, external_id FROM products WHERE store_id = ? AND sku = ?",
        )
        .bind(store_id)
        .bind(&offer.sku)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = existing else {
            sqlx::query(
                "INSERT INTO products (store_id, sku, external_id, offer_id, name, category, price)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(store_id)
            .bind(&offer.sku)
            .bind(&offer.external_id)
            .bind(&offer.offer_id)
            .bind(&offer.name)
            .bind(&offer.category)
            .bind(offer.price.to_string())
            .execute(&self.pool)
            .await?;
            return Ok(UpsertResult::Inserted);
        };

        let id: i64 = row.try_get("id")?;
        let price = decimal_col(&row, "price")?;
        let name: Option<String> = row.try_get("name")?;
        let category: Option<String> = row.try_get("category")?;
        let external_id: Option<String> = row.try_get("external_id")?;

        let merged_external = offer.external_id.clone().or_else(|| external_id.clone());
        if price == offer.price
            && name == offer.name
            && category == offer.category
            && merged_external == external_id
        {
            return Ok(UpsertResult::Unchanged);
        }

        sqlx::query(
            "UPDATE products SET price = ?, name = ?, category = ?, external_id = COALESCE(?, external_id)
             WHERE id = ?",
        )
        .bind(offer.price.to_string())
        .bind(&offer.name)
        .bind(&offer.category)
        .bind(&offer.external_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(UpsertResult::Updated)
    }

    // -- History -----------------------------------------------------------

    /// Most recent history rows for a listing, newest first.
    pub async fn recent_history(&self, listing_id: i64, limit: u32) -> Result<Vec<PriceHistoryEntry>> {
        let rows = sqlx::query(
            "SELECT product_id, price, created_at, price_decrease, cumulative_loss, change_reason
             FROM price_history
             WHERE product_id = ?
             ORDER BY created_at DESC, id DESC
             LIMIT ?",
        )
        .bind(listing_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(history_from_row).collect()
    }

    /// Full history for a listing, oldest first.
    pub async fn history(&self, listing_id: i64) -> Result<Vec<PriceHistoryEntry>> {
        let rows = sqlx::query(
            "SELECT product_id, price, created_at, price_decrease, cumulative_loss, change_reason
             FROM price_history
             WHERE product_id = ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(listing_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(history_from_row).collect()
    }

    // -- Stores & sessions -------------------------------------------------

    pub async fn insert_store(&self, user_id: Option<&str>, merchant_id: Option<&str>) -> Result<i64> {
        let result = sqlx::query("INSERT INTO stores (user_id, merchant_id) VALUES (?, ?)")
            .bind(user_id)
            .bind(merchant_id)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn store(&self, store_id: i64) -> Result<Option<Store>> {
        let row = sqlx::query(
            "SELECT id, user_id, merchant_id, products_count, last_sync FROM stores WHERE id = ?",
        )
        .bind(store_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Store {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            merchant_id: row.try_get("merchant_id")?,
            products_count: row.try_get("products_count")?,
            last_sync: timestamp_col(&row, "last_sync")?,
        }))
    }

    pub async fn load_session(&self, store_id: i64) -> Result<Option<StoredSession>> {
        let row = sqlx::query("SELECT id, guid, merchant_id, last_login FROM stores WHERE id = ?")
            .bind(store_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(StoredSession {
            store_id: row.try_get("id")?,
            blob: row.try_get("guid")?,
            merchant_id: row.try_get("merchant_id")?,
            last_login: timestamp_col(&row, "last_login")?,
        }))
    }

    /// Overwrite the session blob and login timestamp in one statement.
    /// The merchant id is only filled in when previously unknown.
    pub async fn save_session(
        &self,
        store_id: i64,
        blob: &str,
        last_login: DateTime<Utc>,
        merchant_id: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE stores
             SET guid = ?, last_login = ?, merchant_id = COALESCE(merchant_id, ?)
             WHERE id = ?",
        )
        .bind(blob)
        .bind(format_timestamp(last_login))
        .bind(merchant_id)
        .bind(store_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DemperError::Persistence(format!("store {store_id} not found")));
        }
        Ok(())
    }

    pub async fn record_sync(&self, store_id: i64, products_count: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE stores SET products_count = ?, last_sync = ? WHERE id = ?")
            .bind(products_count)
            .bind(format_timestamp(at))
            .bind(store_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

/// Fixed-width UTC timestamps so TEXT ordering matches time ordering.
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DemperError::Persistence(format!("bad timestamp {raw:?}: {e}")))
}

fn timestamp_col(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.as_deref().map(parse_timestamp).transpose()
}

pub(crate) fn decimal_col(row: &SqliteRow, column: &str) -> Result<Decimal> {
    let raw: String = row.try_get(column)?;
    parse_decimal(column, &raw)
}

fn optional_decimal_col(row: &SqliteRow, column: &str) -> Result<Option<Decimal>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.filter(|s| !s.trim().is_empty())
        .map(|s| parse_decimal(column, &s))
        .transpose()
}

fn parse_decimal(column: &str, raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw.trim())
        .map_err(|e| DemperError::Persistence(format!("bad decimal in {column}: {raw:?} ({e})")))
}

fn listing_from_row(row: &SqliteRow) -> Result<Listing> {
    Ok(Listing {
        id: row.try_get("id")?,
        store_id: row.try_get("store_id")?,
        sku: row.try_get("sku")?,
        external_id: row.try_get::<Option<String>, _>("external_id")?.unwrap_or_default(),
        price: decimal_col(row, "price")?,
        min_profit: optional_decimal_col(row, "min_profit")?.unwrap_or(Decimal::ZERO),
        max_profit: optional_decimal_col(row, "max_profit")?,
        price_step: optional_decimal_col(row, "price_step")?.unwrap_or(Decimal::ONE),
        active: row.try_get("bot_active")?,
    })
}

fn history_from_row(row: &SqliteRow) -> Result<PriceHistoryEntry> {
    let reason: String = row.try_get("change_reason")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(PriceHistoryEntry {
        listing_id: row.try_get("product_id")?,
        price: decimal_col(row, "price")?,
        created_at: parse_timestamp(&created_at)?,
        price_decrease: decimal_col(row, "price_decrease")?,
        cumulative_loss: decimal_col(row, "cumulative_loss")?,
        change_reason: reason.parse()?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
