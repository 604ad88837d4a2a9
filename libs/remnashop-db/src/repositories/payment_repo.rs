use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::payment::{Payment, PaymentChannel};

#[derive(Debug, Clone)]
pub struct PaymentRepository {
    pool: SqlitePool,
}

impl PaymentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates a pending payment keyed by `base_payload`, or returns the
    /// existing pending row for the same payload (idempotent invoice
    /// creation). When a finished attempt already holds the payload, the new
    /// attempt gets a `:r<n>` retry suffix so `invoice_payload` stays unique
    /// while finished rows stay immutable.
    ///
    /// Returns the payment and whether an existing row was reused.
    pub async fn create_or_reuse(
        &self,
        user_id: i64,
        channel: PaymentChannel,
        amount: i64,
        subscription_days: i64,
        promo_code: Option<&str>,
        base_payload: &str,
    ) -> Result<(Payment, bool)> {
        if let Some(pending) = self.find_reusable_pending(base_payload).await? {
            return Ok((pending, true));
        }

        let family = self.payload_family_count(base_payload).await?;
        let payload = if family == 0 {
            base_payload.to_string()
        } else {
            format!("{}:r{}", base_payload, family)
        };

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO payments (user_id, channel, amount, subscription_days, promo_code, invoice_payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(channel.as_str())
        .bind(amount)
        .bind(subscription_days)
        .bind(promo_code)
        .bind(&payload)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("Failed to insert payment")?;

        let payment = self
            .get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Payment {} not found after insert", id))?;
        Ok((payment, false))
    }

    async fn find_reusable_pending(&self, base_payload: &str) -> Result<Option<Payment>> {
        sqlx::query_as::<_, Payment>(
            r#"
            SELECT * FROM payments
            WHERE (invoice_payload = ?1 OR invoice_payload LIKE ?1 || ':r%')
              AND status = 'pending'
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(base_payload)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up pending payment by payload")
    }

    async fn payload_family_count(&self, base_payload: &str) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM payments WHERE invoice_payload = ?1 OR invoice_payload LIKE ?1 || ':r%'",
        )
        .bind(base_payload)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count payload family")
    }

    pub async fn get(&self, id: i64) -> Result<Option<Payment>> {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch payment")
    }

    pub async fn get_by_payload(&self, invoice_payload: &str) -> Result<Option<Payment>> {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE invoice_payload = ?")
            .bind(invoice_payload)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch payment by payload")
    }

    pub async fn get_by_external_id(&self, external_id: &str) -> Result<Option<Payment>> {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE external_payment_id = ?")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch payment by external id")
    }

    /// Stores the PSP-side id and confirmation URL after invoice creation.
    pub async fn set_external(
        &self,
        id: i64,
        external_id: &str,
        confirmation_url: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE payments SET external_payment_id = ?, external_confirmation_url = ? WHERE id = ?",
        )
        .bind(external_id)
        .bind(confirmation_url)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stars invoices only get a deep link at creation time; the charge id
    /// arrives later with the successful-payment event (`set_external_id`).
    pub async fn set_confirmation_url(&self, id: i64, confirmation_url: &str) -> Result<()> {
        sqlx::query("UPDATE payments SET external_confirmation_url = ? WHERE id = ?")
            .bind(confirmation_url)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Records the PSP charge id. For the Stars rail this runs before
    /// provisioning, which is what lets the recovery sweep tell a captured
    /// payment from an unpaid invoice.
    pub async fn set_external_id(&self, id: i64, external_id: &str) -> Result<()> {
        sqlx::query("UPDATE payments SET external_payment_id = ? WHERE id = ?")
            .bind(external_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// pending → completed, recording the provisioned control-plane user and
    /// the completion time. Guarded on the current status: a replay or a
    /// concurrent finalizer loses the race and gets `false` back.
    pub async fn mark_completed(&self, id: i64, remote_user_id: &str) -> Result<bool> {
        let done = sqlx::query(
            r#"
            UPDATE payments
            SET status = 'completed', completed_at = ?, remote_user_id = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(Utc::now())
        .bind(remote_user_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// pending → completed for gift purchases, which produce a gift code
    /// instead of a provisioned remote user.
    pub async fn mark_gift_completed(&self, id: i64) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE payments SET status = 'completed', completed_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// pending → failed. Completed rows are immutable; this never touches them.
    pub async fn mark_failed(&self, id: i64) -> Result<bool> {
        let done = sqlx::query("UPDATE payments SET status = 'failed' WHERE id = ? AND status = 'pending'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn completed_history(&self, user_id: i64, limit: i64) -> Result<Vec<Payment>> {
        sqlx::query_as::<_, Payment>(
            r#"
            SELECT * FROM payments
            WHERE user_id = ? AND status = 'completed'
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch payment history")
    }

    /// Stars payments that were captured (the charge id from the
    /// successful-payment event is recorded before provisioning) but never
    /// reached `completed`. These are the candidates for the background
    /// recovery sweep.
    pub async fn stale_captured_stars(&self, older_than: DateTime<Utc>) -> Result<Vec<Payment>> {
        sqlx::query_as::<_, Payment>(
            r#"
            SELECT * FROM payments
            WHERE status = 'pending'
              AND channel = 'stars'
              AND external_payment_id IS NOT NULL
              AND created_at < ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch stale captured payments")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::repositories::UserRepository;

    async fn setup() -> (PaymentRepository, SqlitePool) {
        let pool = init_db("sqlite::memory:").await.unwrap();
        UserRepository::new(pool.clone())
            .get_or_create(100, Some("alice"))
            .await
            .unwrap();
        (PaymentRepository::new(pool.clone()), pool)
    }

    #[tokio::test]
    async fn pending_payload_is_reused() {
        let (repo, _pool) = setup().await;
        let (first, reused) = repo
            .create_or_reuse(100, PaymentChannel::Stars, 250, 90, None, "100:3:250:")
            .await
            .unwrap();
        assert!(!reused);

        let (second, reused) = repo
            .create_or_reuse(100, PaymentChannel::Stars, 250, 90, None, "100:3:250:")
            .await
            .unwrap();
        assert!(reused);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn completed_payload_gets_fresh_row() {
        let (repo, _pool) = setup().await;
        let (first, _) = repo
            .create_or_reuse(100, PaymentChannel::Stars, 250, 90, None, "100:3:250:")
            .await
            .unwrap();
        assert!(repo.mark_completed(first.id, "uuid-1").await.unwrap());

        let (second, reused) = repo
            .create_or_reuse(100, PaymentChannel::Stars, 250, 90, None, "100:3:250:")
            .await
            .unwrap();
        assert!(!reused);
        assert_ne!(first.id, second.id);
        assert_eq!(second.invoice_payload, "100:3:250::r1");
        assert!(second.is_pending());
    }

    #[tokio::test]
    async fn status_transitions_are_guarded() {
        let (repo, _pool) = setup().await;
        let (payment, _) = repo
            .create_or_reuse(100, PaymentChannel::Card, 50000, 30, None, "yookassa:100:1:card:")
            .await
            .unwrap();

        assert!(repo.mark_completed(payment.id, "uuid-1").await.unwrap());
        // Replay: the row is already completed, nothing moves.
        assert!(!repo.mark_completed(payment.id, "uuid-2").await.unwrap());
        assert!(!repo.mark_failed(payment.id).await.unwrap());

        let row = repo.get(payment.id).await.unwrap().unwrap();
        assert!(row.is_completed());
        assert_eq!(row.remote_user_id.as_deref(), Some("uuid-1"));
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn failed_rows_stay_failed() {
        let (repo, _pool) = setup().await;
        let (payment, _) = repo
            .create_or_reuse(100, PaymentChannel::Sbp, 50000, 30, None, "yookassa:100:1:sbp:")
            .await
            .unwrap();

        assert!(repo.mark_failed(payment.id).await.unwrap());
        assert!(!repo.mark_completed(payment.id, "uuid-1").await.unwrap());
    }

    #[tokio::test]
    async fn stale_sweep_only_sees_captured_stars() {
        let (repo, _pool) = setup().await;
        let (captured, _) = repo
            .create_or_reuse(100, PaymentChannel::Stars, 250, 90, None, "100:3:250:")
            .await
            .unwrap();
        repo.set_external_id(captured.id, "charge-1").await.unwrap();

        // Unpaid invoice: no charge id, must not appear.
        repo.create_or_reuse(100, PaymentChannel::Stars, 70, 30, None, "100:1:70:")
            .await
            .unwrap();

        let stale = repo
            .stale_captured_stars(Utc::now() + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, captured.id);
    }
}
