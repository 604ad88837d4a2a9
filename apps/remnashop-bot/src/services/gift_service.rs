use anyhow::{anyhow, Result};
use tracing::info;

use remnashop_db::models::{GiftCode, GiftStatus};
use remnashop_db::repositories::GiftRepository;

use crate::services::provision_service::{Provisioned, ProvisionService};

#[derive(Debug, Clone)]
pub struct Redeemed {
    pub gift: GiftCode,
    pub provisioned: Provisioned,
}

/// Gift codes: created after a paid gift purchase, redeemed later by the
/// recipient, at which point the normal provisioning path runs for them.
#[derive(Clone)]
pub struct GiftService {
    gifts: GiftRepository,
    provision: ProvisionService,
}

impl GiftService {
    pub fn new(gifts: GiftRepository, provision: ProvisionService) -> Self {
        Self { gifts, provision }
    }

    pub async fn create_paid_gift(
        &self,
        purchaser_id: i64,
        subscription_days: i64,
        amount: i64,
        channel: &str,
    ) -> Result<GiftCode> {
        self.gifts
            .create(purchaser_id, subscription_days, amount, channel)
            .await
    }

    /// Redeems an active code: provisions the redeemer for the gifted days,
    /// then flips the code to `redeemed` with the recipient recorded.
    pub async fn redeem(
        &self,
        code: &str,
        recipient_id: i64,
        recipient_username: Option<&str>,
    ) -> Result<Redeemed> {
        let gift = self
            .gifts
            .get_by_code(code)
            .await?
            .ok_or_else(|| anyhow!("Gift code not found"))?;

        if gift.status != GiftStatus::Active.as_str() {
            return Err(anyhow!("Gift code already redeemed or expired"));
        }

        let provisioned = self
            .provision
            .provision(recipient_id, recipient_username, gift.subscription_days)
            .await?;

        if !self.gifts.redeem(&gift.code, recipient_id).await? {
            // A concurrent redeem won between our check and the flip; the
            // provisioning above was an idempotent extend either way.
            return Err(anyhow!("Gift code already redeemed"));
        }

        info!(
            "Gift {} redeemed by {}: +{} days",
            gift.code, recipient_id, gift.subscription_days
        );

        let gift = self
            .gifts
            .get_by_code(&gift.code)
            .await?
            .ok_or_else(|| anyhow!("Gift code vanished after redeem"))?;

        Ok(Redeemed { gift, provisioned })
    }

    pub async fn gifts_of(&self, purchaser_id: i64) -> Result<Vec<GiftCode>> {
        self.gifts.gifts_of(purchaser_id).await
    }
}
