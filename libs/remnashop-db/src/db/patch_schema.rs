use sqlx::{Pool, Sqlite};
use tracing::{info, warn};

/// Brings an existing database file up to the current schema by adding
/// columns that were introduced after the file was created. Every patch is
/// additive (nullable or defaulted), so this is safe to run on every start.
pub async fn patch_database_schema(pool: &Pool<Sqlite>) {
    patch_column(pool, "bot_users", "auto_renewal", "BOOLEAN DEFAULT 0").await;
    patch_column(pool, "bot_users", "last_renewal_notification_at", "TIMESTAMP").await;
    patch_column(pool, "bot_users", "loyalty_points", "INTEGER DEFAULT 0").await;
    patch_column(pool, "bot_users", "loyalty_tier", "TEXT DEFAULT 'bronze'").await;
    patch_column(pool, "bot_users", "total_spent", "INTEGER DEFAULT 0").await;

    patch_column(pool, "payments", "channel", "TEXT DEFAULT 'stars'").await;
    patch_column(pool, "payments", "promo_code", "TEXT").await;
    patch_column(pool, "payments", "external_payment_id", "TEXT").await;
    patch_column(pool, "payments", "external_confirmation_url", "TEXT").await;
    patch_column(pool, "payments", "remote_user_id", "TEXT").await;

    patch_column(pool, "gift_codes", "channel", "TEXT DEFAULT 'stars'").await;
    patch_column(pool, "gift_codes", "amount", "INTEGER DEFAULT 0").await;
}

async fn patch_column(pool: &Pool<Sqlite>, table: &str, column: &str, definition: &str) {
    let exists: bool = sqlx::query_scalar(&format!(
        "SELECT count(*) > 0 FROM pragma_table_info('{}') WHERE name = '{}'",
        table, column
    ))
    .fetch_one(pool)
    .await
    .unwrap_or(false);

    if exists {
        return;
    }

    info!("Schema patch: adding '{}' to '{}'", column, table);
    let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition);
    if let Err(e) = sqlx::query(&sql).execute(pool).await {
        // A concurrent start may have raced us to the same ALTER.
        if !e.to_string().contains("duplicate column") {
            warn!("Failed to add column '{}' to '{}': {}", column, table, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn patch_is_idempotent() {
        let pool = crate::db::init_db("sqlite::memory:").await.unwrap();
        // Second run must be a no-op, not an error.
        patch_database_schema(&pool).await;

        let has_tier: bool = sqlx::query_scalar(
            "SELECT count(*) > 0 FROM pragma_table_info('bot_users') WHERE name = 'loyalty_tier'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(has_tier);
    }
}
