use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

mod patch_schema;

/// Opens (creating if missing) the bot database and brings the schema up
/// to date. The base tables are created with IF NOT EXISTS; columns added
/// in later versions are patched in additively so old database files keep
/// working after an upgrade.
pub async fn init_db(database_url: &str) -> Result<SqlitePool> {
    if !database_url.starts_with("sqlite:") {
        return Err(anyhow::anyhow!("DATABASE_URL must start with sqlite:"));
    }

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(std::time::Duration::from_secs(10));

    // In-memory databases exist per-connection, so the pool must not grow
    // past one connection there (used by tests).
    let max_connections = if database_url.contains(":memory:") { 1 } else { 10 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .context("Failed to connect to SQLite")?;

    create_tables(&pool).await?;
    patch_schema::patch_database_schema(&pool).await;

    Ok(pool)
}

async fn create_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bot_users (
            telegram_id INTEGER PRIMARY KEY,
            username TEXT,
            locale TEXT DEFAULT 'ru',
            registered_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            trial_used BOOLEAN DEFAULT 0,
            referrer_id INTEGER,
            remote_user_id TEXT,
            auto_renewal BOOLEAN DEFAULT 0,
            last_renewal_notification_at TIMESTAMP,
            loyalty_points INTEGER DEFAULT 0,
            loyalty_tier TEXT DEFAULT 'bronze',
            total_spent INTEGER DEFAULT 0,
            FOREIGN KEY (referrer_id) REFERENCES bot_users(telegram_id)
        );

        CREATE TABLE IF NOT EXISTS payments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            channel TEXT NOT NULL DEFAULT 'stars',
            amount INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            subscription_days INTEGER NOT NULL DEFAULT 0,
            promo_code TEXT,
            invoice_payload TEXT NOT NULL UNIQUE,
            external_payment_id TEXT,
            external_confirmation_url TEXT,
            remote_user_id TEXT,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            completed_at TIMESTAMP,
            FOREIGN KEY (user_id) REFERENCES bot_users(telegram_id)
        );

        CREATE TABLE IF NOT EXISTS promo_codes (
            code TEXT PRIMARY KEY,
            discount_percent INTEGER,
            bonus_days INTEGER,
            max_uses INTEGER,
            current_uses INTEGER NOT NULL DEFAULT 0,
            expires_at TIMESTAMP,
            is_active BOOLEAN NOT NULL DEFAULT 1,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS promo_code_usage (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL,
            user_id INTEGER NOT NULL,
            used_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY (code) REFERENCES promo_codes(code)
        );

        CREATE TABLE IF NOT EXISTS referrals (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            referrer_id INTEGER NOT NULL,
            referred_id INTEGER NOT NULL,
            bonus_days_granted INTEGER NOT NULL DEFAULT 0,
            registered_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(referrer_id, referred_id),
            FOREIGN KEY (referrer_id) REFERENCES bot_users(telegram_id),
            FOREIGN KEY (referred_id) REFERENCES bot_users(telegram_id)
        );

        CREATE TABLE IF NOT EXISTS gift_codes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL UNIQUE,
            purchaser_id INTEGER NOT NULL,
            recipient_id INTEGER,
            subscription_days INTEGER NOT NULL,
            amount INTEGER NOT NULL DEFAULT 0,
            channel TEXT NOT NULL DEFAULT 'stars',
            status TEXT NOT NULL DEFAULT 'active',
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            activated_at TIMESTAMP,
            FOREIGN KEY (purchaser_id) REFERENCES bot_users(telegram_id),
            FOREIGN KEY (recipient_id) REFERENCES bot_users(telegram_id)
        );

        CREATE INDEX IF NOT EXISTS idx_payments_payload ON payments(invoice_payload);
        CREATE INDEX IF NOT EXISTS idx_payments_external ON payments(external_payment_id);
        CREATE INDEX IF NOT EXISTS idx_gift_codes_code ON gift_codes(code);
        CREATE INDEX IF NOT EXISTS idx_promo_usage_code ON promo_code_usage(code);
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create base tables")?;

    Ok(())
}
