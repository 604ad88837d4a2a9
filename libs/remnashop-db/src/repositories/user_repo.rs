use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::user::{BotUser, LoyaltyProfile, LoyaltyTier};

#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetches the user, creating the row on first interaction. A known
    /// username refreshes the stored one; a missing username never clears it.
    pub async fn get_or_create(&self, telegram_id: i64, username: Option<&str>) -> Result<BotUser> {
        sqlx::query(
            r#"
            INSERT INTO bot_users (telegram_id, username)
            VALUES (?, ?)
            ON CONFLICT(telegram_id) DO UPDATE SET
                username = COALESCE(excluded.username, bot_users.username)
            "#,
        )
        .bind(telegram_id)
        .bind(username)
        .execute(&self.pool)
        .await
        .context("Failed to upsert bot user")?;

        self.get(telegram_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("User {} not found after upsert", telegram_id))
    }

    pub async fn get(&self, telegram_id: i64) -> Result<Option<BotUser>> {
        sqlx::query_as::<_, BotUser>("SELECT * FROM bot_users WHERE telegram_id = ?")
            .bind(telegram_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch bot user")
    }

    pub async fn set_locale(&self, telegram_id: i64, locale: &str) -> Result<()> {
        sqlx::query("UPDATE bot_users SET locale = ? WHERE telegram_id = ?")
            .bind(locale)
            .bind(telegram_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_referrer(&self, telegram_id: i64, referrer_id: i64) -> Result<()> {
        // A referrer is bound once; later /start ref links never rebind.
        sqlx::query(
            "UPDATE bot_users SET referrer_id = ? WHERE telegram_id = ? AND referrer_id IS NULL",
        )
        .bind(referrer_id)
        .bind(telegram_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Monotonic false → true; there is no way back.
    pub async fn mark_trial_used(&self, telegram_id: i64) -> Result<()> {
        sqlx::query("UPDATE bot_users SET trial_used = 1 WHERE telegram_id = ?")
            .bind(telegram_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Records the control-plane UUID. Set exactly once after the first
    /// provisioning; a populated value is never overwritten.
    pub async fn set_remote_user_id(&self, telegram_id: i64, remote_uuid: &str) -> Result<()> {
        sqlx::query(
            "UPDATE bot_users SET remote_user_id = ? WHERE telegram_id = ? AND remote_user_id IS NULL",
        )
        .bind(remote_uuid)
        .bind(telegram_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_auto_renewal(&self, telegram_id: i64, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE bot_users SET auto_renewal = ? WHERE telegram_id = ?")
            .bind(enabled)
            .bind(telegram_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_renewal_notification(&self, telegram_id: i64) -> Result<()> {
        sqlx::query("UPDATE bot_users SET last_renewal_notification_at = ? WHERE telegram_id = ?")
            .bind(Utc::now())
            .bind(telegram_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Users eligible for the renewal reminder scan.
    pub async fn users_with_auto_renewal(&self) -> Result<Vec<BotUser>> {
        sqlx::query_as::<_, BotUser>(
            "SELECT * FROM bot_users WHERE auto_renewal = 1 AND remote_user_id IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch auto-renewal users")
    }

    /// Credits loyalty points for a successful payment and re-derives the
    /// tier. The tier never goes down, even if thresholds change.
    pub async fn add_loyalty_points(&self, telegram_id: i64, amount: i64) -> Result<LoyaltyProfile> {
        let user = self
            .get(telegram_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Unknown user {}", telegram_id))?;

        let points = user.loyalty_points + amount;
        let total_spent = user.total_spent + amount;
        let tier = LoyaltyTier::from_points(points).max(user.tier());

        sqlx::query(
            "UPDATE bot_users SET loyalty_points = ?, loyalty_tier = ?, total_spent = ? WHERE telegram_id = ?",
        )
        .bind(points)
        .bind(tier.as_str())
        .bind(total_spent)
        .bind(telegram_id)
        .execute(&self.pool)
        .await
        .context("Failed to update loyalty profile")?;

        Ok(LoyaltyProfile { points, tier, total_spent })
    }

    pub async fn loyalty_profile(&self, telegram_id: i64) -> Result<LoyaltyProfile> {
        let user = self.get_or_create(telegram_id, None).await?;
        Ok(LoyaltyProfile {
            points: user.loyalty_points,
            tier: user.tier(),
            total_spent: user.total_spent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    async fn repo() -> UserRepository {
        let pool = init_db("sqlite::memory:").await.unwrap();
        UserRepository::new(pool)
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let repo = repo().await;
        let a = repo.get_or_create(100, Some("alice")).await.unwrap();
        let b = repo.get_or_create(100, None).await.unwrap();
        assert_eq!(a.telegram_id, b.telegram_id);
        assert_eq!(b.username.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn trial_used_is_monotonic() {
        let repo = repo().await;
        repo.get_or_create(100, None).await.unwrap();
        assert!(!repo.get(100).await.unwrap().unwrap().trial_used);

        repo.mark_trial_used(100).await.unwrap();
        assert!(repo.get(100).await.unwrap().unwrap().trial_used);
    }

    #[tokio::test]
    async fn remote_user_id_set_once() {
        let repo = repo().await;
        repo.get_or_create(100, None).await.unwrap();
        repo.set_remote_user_id(100, "uuid-1").await.unwrap();
        repo.set_remote_user_id(100, "uuid-2").await.unwrap();

        let user = repo.get(100).await.unwrap().unwrap();
        assert_eq!(user.remote_user_id.as_deref(), Some("uuid-1"));
    }

    #[tokio::test]
    async fn referrer_binds_once() {
        let repo = repo().await;
        repo.get_or_create(1, None).await.unwrap();
        repo.get_or_create(2, None).await.unwrap();
        repo.get_or_create(3, None).await.unwrap();

        repo.set_referrer(3, 1).await.unwrap();
        repo.set_referrer(3, 2).await.unwrap();
        assert_eq!(repo.get(3).await.unwrap().unwrap().referrer_id, Some(1));
    }

    #[tokio::test]
    async fn loyalty_points_accumulate_and_tier_derives() {
        let repo = repo().await;
        repo.get_or_create(100, None).await.unwrap();

        let p = repo.add_loyalty_points(100, 200).await.unwrap();
        assert_eq!(p.tier, LoyaltyTier::Bronze);

        let p = repo.add_loyalty_points(100, 100).await.unwrap();
        assert_eq!(p.points, 300);
        assert_eq!(p.tier, LoyaltyTier::Silver);
        assert_eq!(p.total_spent, 300);
    }
}
