use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::promo::{PromoCode, PromoCodeUsage};

#[derive(Debug, Clone)]
pub struct PromoRepository {
    pool: SqlitePool,
}

impl PromoRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn canonical(code: &str) -> String {
        code.trim().to_uppercase()
    }

    pub async fn get(&self, code: &str) -> Result<Option<PromoCode>> {
        sqlx::query_as::<_, PromoCode>("SELECT * FROM promo_codes WHERE code = ?")
            .bind(Self::canonical(code))
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch promo code")
    }

    pub async fn create(
        &self,
        code: &str,
        discount_percent: Option<i64>,
        bonus_days: Option<i64>,
        max_uses: Option<i64>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if discount_percent.is_none() && bonus_days.is_none() {
            return Err(anyhow::anyhow!(
                "Promo code must carry a discount or bonus days"
            ));
        }
        if let Some(pct) = discount_percent {
            if !(0..=100).contains(&pct) {
                return Err(anyhow::anyhow!("Discount percent out of range: {}", pct));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO promo_codes (code, discount_percent, bonus_days, max_uses, expires_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Self::canonical(code))
        .bind(discount_percent)
        .bind(bonus_days)
        .bind(max_uses)
        .bind(expires_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to create promo code")?;
        Ok(())
    }

    /// Atomically spends one use of the code and appends the audit row.
    /// The usability preconditions are re-checked inside the guarded UPDATE,
    /// so a code exhausted between pricing and consumption simply returns
    /// `false` — `current_uses` can never pass `max_uses`.
    pub async fn consume(&self, code: &str, user_id: i64) -> Result<bool> {
        let code = Self::canonical(code);
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            UPDATE promo_codes
            SET current_uses = current_uses + 1
            WHERE code = ?
              AND is_active = 1
              AND (expires_at IS NULL OR expires_at > ?)
              AND (max_uses IS NULL OR current_uses < max_uses)
            "#,
        )
        .bind(&code)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            return Ok(false);
        }

        sqlx::query("INSERT INTO promo_code_usage (code, user_id, used_at) VALUES (?, ?, ?)")
            .bind(&code)
            .bind(user_id)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn set_active(&self, code: &str, active: bool) -> Result<()> {
        sqlx::query("UPDATE promo_codes SET is_active = ? WHERE code = ?")
            .bind(active)
            .bind(Self::canonical(code))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn usages(&self, code: &str) -> Result<Vec<PromoCodeUsage>> {
        sqlx::query_as::<_, PromoCodeUsage>(
            "SELECT * FROM promo_code_usage WHERE code = ? ORDER BY used_at ASC",
        )
        .bind(Self::canonical(code))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch promo usages")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    async fn repo() -> PromoRepository {
        let pool = init_db("sqlite::memory:").await.unwrap();
        PromoRepository::new(pool)
    }

    #[tokio::test]
    async fn codes_are_canonicalized() {
        let repo = repo().await;
        repo.create("save10", Some(10), Some(2), None, None).await.unwrap();
        let promo = repo.get("  Save10 ").await.unwrap().unwrap();
        assert_eq!(promo.code, "SAVE10");
    }

    #[tokio::test]
    async fn consume_respects_max_uses() {
        let repo = repo().await;
        repo.create("LIMITED", Some(10), None, Some(2), None).await.unwrap();

        assert!(repo.consume("LIMITED", 1).await.unwrap());
        assert!(repo.consume("LIMITED", 2).await.unwrap());
        // Third take fails; the counter never passes the cap.
        assert!(!repo.consume("LIMITED", 3).await.unwrap());

        let promo = repo.get("LIMITED").await.unwrap().unwrap();
        assert_eq!(promo.current_uses, 2);
        assert_eq!(repo.usages("LIMITED").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn consume_rejects_expired_and_inactive() {
        let repo = repo().await;
        let past = Utc::now() - chrono::Duration::hours(1);
        repo.create("OLD", Some(10), None, None, Some(past)).await.unwrap();
        assert!(!repo.consume("OLD", 1).await.unwrap());

        repo.create("OFF", None, Some(3), None, None).await.unwrap();
        repo.set_active("OFF", false).await.unwrap();
        assert!(!repo.consume("OFF", 1).await.unwrap());
    }

    #[tokio::test]
    async fn create_requires_discount_or_bonus() {
        let repo = repo().await;
        assert!(repo.create("EMPTY", None, None, None, None).await.is_err());
        assert!(repo.create("BAD", Some(150), None, None, None).await.is_err());
    }
}
