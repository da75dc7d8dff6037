//! Ledger — append-only price history with a running cumulative loss.
//!
//! Every append runs in its own transaction whose first statement is a
//! write, so SQLite takes the write lock before the prior row is read and
//! the running total cannot be computed from a stale snapshot.

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::SqliteConnection;
use tracing::{debug, warn};

use crate::storage::{decimal_col, format_timestamp, Database};
use crate::types::{ChangeReason, DemperError, PriceHistoryEntry};

type Result<T> = std::result::Result<T, DemperError>;

#[derive(Clone)]
pub struct Ledger {
    db: Database,
}

impl Ledger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append one history row. `cumulative_loss` continues from the
    /// listing's most recent row; a negative decrease counts as zero.
    pub async fn record(
        &self,
        listing_id: i64,
        price_before: Decimal,
        price_decrease: Decimal,
        reason: ChangeReason,
    ) -> Result<PriceHistoryEntry> {
        let mut tx = self.db.pool().begin().await?;
        let entry = append(&mut tx, listing_id, price_before, price_decrease, reason).await?;
        tx.commit().await?;
        Ok(entry)
    }

    /// Set the listing's local price and append the matching history row,
    /// atomically. Called only after the marketplace accepted the price.
    pub async fn commit_price_change(
        &self,
        listing_id: i64,
        price_before: Decimal,
        new_price: Decimal,
    ) -> Result<PriceHistoryEntry> {
        let mut tx = self.db.pool().begin().await?;

        let updated = sqlx::query("UPDATE products SET price = ? WHERE id = ?")
            .bind(new_price.to_string())
            .bind(listing_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(DemperError::Persistence(format!("listing {listing_id} not found")));
        }

        let decrease = (price_before - new_price).max(Decimal::ZERO);
        let reason = ChangeReason::classify(price_before, new_price);
        let entry = append(&mut tx, listing_id, price_before, decrease, reason).await?;

        tx.commit().await?;
        Ok(entry)
    }

    /// Lifetime cumulative loss for a listing (zero without history).
    pub async fn cumulative_loss(&self, listing_id: i64) -> Result<Decimal> {
        let history = self.db.recent_history(listing_id, 1).await?;
        Ok(history.first().map_or(Decimal::ZERO, |e| e.cumulative_loss))
    }
}

async fn append(
    conn: &mut SqliteConnection,
    listing_id: i64,
    price_before: Decimal,
    price_decrease: Decimal,
    reason: ChangeReason,
) -> Result<PriceHistoryEntry> {
    let decrease = if price_decrease < Decimal::ZERO {
        warn!(listing_id, %price_decrease, "Negative price decrease recorded as zero");
        Decimal::ZERO
    } else {
        price_decrease
    };
    let created_at = Utc::now();

    let inserted = sqlx::query(
        "INSERT INTO price_history (product_id, price, created_at, price_decrease, cumulative_loss, change_reason)
         VALUES (?, ?, ?, ?, '0', ?)",
    )
    .bind(listing_id)
    .bind(price_before.to_string())
    .bind(format_timestamp(created_at))
    .bind(decrease.to_string())
    .bind(reason.as_str())
    .execute(&mut *conn)
    .await?;
    let row_id = inserted.last_insert_rowid();

    let prior = sqlx::query(
        "SELECT cumulative_loss FROM price_history
         WHERE product_id = ? AND id <> ?
         ORDER BY created_at DESC, id DESC
         LIMIT 1",
    )
    .bind(listing_id)
    .bind(row_id)
    .fetch_optional(&mut *conn)
    .await?;
    let prior_loss = match prior {
        Some(row) => decimal_col(&row, "cumulative_loss")?,
        None => Decimal::ZERO,
    };
    let cumulative_loss = prior_loss + decrease;

    sqlx::query("UPDATE price_history SET cumulative_loss = ? WHERE id = ?")
        .bind(cumulative_loss.to_string())
        .bind(row_id)
        .execute(&mut *conn)
        .await?;

    debug!(listing_id, %decrease, %cumulative_loss, reason = %reason, "Ledger row appended");
    Ok(PriceHistoryEntry {
        listing_id,
        price: price_before,
        created_at,
        price_decrease: decrease,
        cumulative_loss,
        change_reason: reason,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
