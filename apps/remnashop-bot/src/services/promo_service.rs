use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use remnashop_db::models::PromoCode;
use remnashop_db::repositories::PromoRepository;

/// Promo validation at pricing time and consumption after a completed
/// purchase. Consumption is best-effort by design: the user already paid
/// the discounted price, so an exhausted code is skipped, never billed.
#[derive(Clone)]
pub struct PromoService {
    promos: PromoRepository,
}

impl PromoService {
    pub fn new(promos: PromoRepository) -> Self {
        Self { promos }
    }

    /// Advisory check used while pricing. Returns the code when it is
    /// currently usable, None when it is unknown, expired, exhausted or
    /// disabled — the caller decides how to surface that.
    pub async fn validate(&self, code: &str) -> Result<Option<PromoCode>> {
        let promo = self.promos.get(code).await?;
        Ok(promo.filter(|p| p.is_usable(Utc::now())))
    }

    pub async fn get(&self, code: &str) -> Result<Option<PromoCode>> {
        self.promos.get(code).await
    }

    /// Post-provision consumption: one atomic use + audit row. Preconditions
    /// are re-checked inside the store; losing the re-check only logs.
    pub async fn consume_after_purchase(&self, code: &str, user_id: i64) {
        match self.promos.consume(code, user_id).await {
            Ok(true) => info!("Promo '{}' consumed by {}", code, user_id),
            Ok(false) => warn!(
                "Promo '{}' exhausted or expired between pricing and completion for {}; usage not recorded",
                code, user_id
            ),
            Err(e) => warn!("Failed to consume promo '{}' for {}: {}", code, user_id, e),
        }
    }
}
