use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::referral::Referral;

#[derive(Debug, Clone)]
pub struct ReferralRepository {
    pool: SqlitePool,
}

impl ReferralRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Records the (referrer, referred) pair. The pair is unique; replays and
    /// self-referrals are ignored. Returns whether a new row was written.
    pub async fn create_pair(&self, referrer_id: i64, referred_id: i64) -> Result<bool> {
        if referrer_id == referred_id {
            return Ok(false);
        }
        let done = sqlx::query(
            r#"
            INSERT OR IGNORE INTO referrals (referrer_id, referred_id, registered_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(referrer_id)
        .bind(referred_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to insert referral pair")?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn get_pair(&self, referrer_id: i64, referred_id: i64) -> Result<Option<Referral>> {
        sqlx::query_as::<_, Referral>(
            "SELECT * FROM referrals WHERE referrer_id = ? AND referred_id = ?",
        )
        .bind(referrer_id)
        .bind(referred_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch referral pair")
    }

    /// Test-and-set on `bonus_days_granted`: flips 0 → `bonus_days` exactly
    /// once per pair. Concurrent callers race on the guarded UPDATE and all
    /// but one get `false`.
    pub async fn try_grant(&self, referrer_id: i64, referred_id: i64, bonus_days: i64) -> Result<bool> {
        if bonus_days <= 0 {
            return Ok(false);
        }
        let done = sqlx::query(
            r#"
            UPDATE referrals
            SET bonus_days_granted = ?
            WHERE referrer_id = ? AND referred_id = ? AND bonus_days_granted = 0
            "#,
        )
        .bind(bonus_days)
        .bind(referrer_id)
        .bind(referred_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn count_for(&self, referrer_id: i64) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM referrals WHERE referrer_id = ?")
            .bind(referrer_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count referrals")
    }

    pub async fn total_bonus_days(&self, referrer_id: i64) -> Result<i64> {
        let total: Option<i64> =
            sqlx::query_scalar("SELECT SUM(bonus_days_granted) FROM referrals WHERE referrer_id = ?")
                .bind(referrer_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(total.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::repositories::UserRepository;

    async fn setup() -> ReferralRepository {
        let pool = init_db("sqlite::memory:").await.unwrap();
        let users = UserRepository::new(pool.clone());
        users.get_or_create(1, None).await.unwrap();
        users.get_or_create(2, None).await.unwrap();
        ReferralRepository::new(pool)
    }

    #[tokio::test]
    async fn pair_is_unique() {
        let repo = setup().await;
        assert!(repo.create_pair(1, 2).await.unwrap());
        assert!(!repo.create_pair(1, 2).await.unwrap());
        assert!(!repo.create_pair(1, 1).await.unwrap());
        assert_eq!(repo.count_for(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn grant_fires_at_most_once() {
        let repo = setup().await;
        repo.create_pair(1, 2).await.unwrap();

        assert!(repo.try_grant(1, 2, 3).await.unwrap());
        // Second payment of the same referred user: nothing to grant.
        assert!(!repo.try_grant(1, 2, 3).await.unwrap());

        let pair = repo.get_pair(1, 2).await.unwrap().unwrap();
        assert_eq!(pair.bonus_days_granted, 3);
        assert_eq!(repo.total_bonus_days(1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn grant_needs_existing_pair() {
        let repo = setup().await;
        assert!(!repo.try_grant(1, 2, 3).await.unwrap());
    }
}
