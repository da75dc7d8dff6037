//! Table definitions, applied statement by statement at startup.

pub const STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS stores (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id        TEXT,
        merchant_id    TEXT,
        guid           TEXT,
        last_login     TEXT,
        products_count INTEGER NOT NULL DEFAULT 0,
        last_sync      TEXT
    )",
    "CREATE TABLE IF NOT EXISTS products (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        store_id    INTEGER NOT NULL REFERENCES stores(id),
        sku         TEXT NOT NULL,
        external_id TEXT,
        offer_id    TEXT,
        name        TEXT,
        category    TEXT,
        price       TEXT NOT NULL,
        min_profit  TEXT,
        max_profit  TEXT,
        price_step  TEXT,
        bot_active  BOOLEAN NOT NULL DEFAULT 0,
        UNIQUE (store_id, sku)
    )",
    "CREATE TABLE IF NOT EXISTS price_history (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        product_id      INTEGER NOT NULL REFERENCES products(id),
        price           TEXT NOT NULL,
        created_at      TEXT NOT NULL,
        price_decrease  TEXT NOT NULL DEFAULT '0',
        cumulative_loss TEXT NOT NULL DEFAULT '0',
        change_reason   TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_price_history_product
        ON price_history (product_id, created_at)",
];
