use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;
use sqlx::SqlitePool;

use crate::models::gift::GiftCode;

/// Charset for gift codes; lookalike characters (0/O/I/L/1) are excluded.
const CODE_CHARS: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone)]
pub struct GiftRepository {
    pool: SqlitePool,
}

impl GiftRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn generate_code() -> String {
        let mut rng = rand::rng();
        let mut part = |n: usize| -> String {
            (0..n)
                .map(|_| CODE_CHARS[rng.random_range(0..CODE_CHARS.len())] as char)
                .collect()
        };
        format!("GIFT-{}-{}", part(4), part(4))
    }

    /// Creates an active gift code after a paid gift purchase. Retries the
    /// random code on the (unlikely) unique-constraint collision.
    pub async fn create(
        &self,
        purchaser_id: i64,
        subscription_days: i64,
        amount: i64,
        channel: &str,
    ) -> Result<GiftCode> {
        for _ in 0..10 {
            let code = Self::generate_code();
            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO gift_codes (code, purchaser_id, subscription_days, amount, channel, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&code)
            .bind(purchaser_id)
            .bind(subscription_days)
            .bind(amount)
            .bind(channel)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?
            .rows_affected();

            if inserted > 0 {
                return self
                    .get_by_code(&code)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("Gift code {} missing after insert", code));
            }
        }
        Err(anyhow::anyhow!("Failed to generate a unique gift code"))
    }

    pub async fn get_by_code(&self, code: &str) -> Result<Option<GiftCode>> {
        sqlx::query_as::<_, GiftCode>("SELECT * FROM gift_codes WHERE code = ?")
            .bind(code.trim().to_uppercase())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch gift code")
    }

    /// active → redeemed, binding the recipient. Guarded on the current
    /// status, so a second redeemer loses the race and gets `false`.
    pub async fn redeem(&self, code: &str, recipient_id: i64) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE gift_codes
            SET status = 'redeemed', recipient_id = ?, activated_at = ?
            WHERE code = ? AND status = 'active'
            "#,
        )
        .bind(recipient_id)
        .bind(Utc::now())
        .bind(code.trim().to_uppercase())
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn gifts_of(&self, purchaser_id: i64) -> Result<Vec<GiftCode>> {
        sqlx::query_as::<_, GiftCode>(
            "SELECT * FROM gift_codes WHERE purchaser_id = ? ORDER BY created_at DESC",
        )
        .bind(purchaser_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch gift codes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::repositories::UserRepository;

    async fn setup() -> GiftRepository {
        let pool = init_db("sqlite::memory:").await.unwrap();
        let users = UserRepository::new(pool.clone());
        users.get_or_create(1, None).await.unwrap();
        users.get_or_create(2, None).await.unwrap();
        GiftRepository::new(pool)
    }

    #[test]
    fn code_format() {
        let code = GiftRepository::generate_code();
        assert_eq!(code.len(), 14);
        assert!(code.starts_with("GIFT-"));
        assert!(!code.contains('0'));
        assert!(!code.contains('O'));
        assert!(!code.contains('I'));
        assert!(!code.contains('L'));
        assert!(!code.contains('1'));
    }

    #[tokio::test]
    async fn redeem_flips_once() {
        let repo = setup().await;
        let gift = repo.create(1, 90, 250, "stars").await.unwrap();
        assert_eq!(gift.status, "active");

        assert!(repo.redeem(&gift.code, 2).await.unwrap());
        assert!(!repo.redeem(&gift.code, 2).await.unwrap());

        let redeemed = repo.get_by_code(&gift.code).await.unwrap().unwrap();
        assert_eq!(redeemed.status, "redeemed");
        assert_eq!(redeemed.recipient_id, Some(2));
        assert!(redeemed.activated_at.is_some());
    }

    #[tokio::test]
    async fn lookup_normalizes_code() {
        let repo = setup().await;
        let gift = repo.create(1, 30, 70, "stars").await.unwrap();
        let lower = gift.code.to_lowercase();
        assert!(repo.get_by_code(&format!(" {} ", lower)).await.unwrap().is_some());
    }
}
