use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

use remnashop_db::repositories::{ReferralRepository, UserRepository};

use crate::api::RemnawaveClient;
use crate::config::Settings;
use crate::services::provision_service::next_expiry;
use crate::utils::to_utc_iso;

#[derive(Debug, Clone)]
pub struct ReferralGrant {
    pub referrer_id: i64,
    pub referrer_username: Option<String>,
    pub bonus_days: i64,
    pub new_expiry: Option<String>,
}

/// Grants the referrer's bonus exactly once per (referrer, referred) pair,
/// across every payment and trial activation of the referred user.
#[derive(Clone)]
pub struct ReferralService {
    users: UserRepository,
    referrals: ReferralRepository,
    api: RemnawaveClient,
    settings: Arc<Settings>,
}

impl ReferralService {
    pub fn new(
        users: UserRepository,
        referrals: ReferralRepository,
        api: RemnawaveClient,
        settings: Arc<Settings>,
    ) -> Self {
        Self { users, referrals, api, settings }
    }

    /// Binds a referrer on first /start with a referral parameter. The pair
    /// row is what a later grant tests-and-sets against.
    pub async fn register(&self, referred_id: i64, referrer_id: i64) -> Result<()> {
        if referrer_id == referred_id {
            return Ok(());
        }
        // The referrer must exist as a bot user for the FK to hold.
        if self.users.get(referrer_id).await?.is_none() {
            warn!("Ignoring referral to unknown referrer {}", referrer_id);
            return Ok(());
        }
        self.users.set_referrer(referred_id, referrer_id).await?;
        if self.referrals.create_pair(referrer_id, referred_id).await? {
            info!("Referral registered: {} -> {}", referrer_id, referred_id);
        }
        Ok(())
    }

    /// Called after the referred user's first activation (payment or trial).
    /// The test-and-set on `bonus_days_granted` claims the grant before any
    /// remote call, so concurrent activations cannot double-grant.
    pub async fn grant_once(&self, referred_id: i64) -> Result<Option<ReferralGrant>> {
        let bonus_days = self.settings.referral_bonus_days;
        if bonus_days <= 0 {
            return Ok(None);
        }

        let referred = match self.users.get(referred_id).await? {
            Some(u) => u,
            None => return Ok(None),
        };
        let referrer_id = match referred.referrer_id {
            Some(id) => id,
            None => return Ok(None),
        };

        let pair = self.referrals.get_pair(referrer_id, referred_id).await?;
        match pair {
            None => {
                warn!(
                    "No referral row for pair {} -> {}; the /start link never registered it",
                    referrer_id, referred_id
                );
                return Ok(None);
            }
            Some(p) if p.bonus_days_granted > 0 => return Ok(None),
            Some(_) => {}
        }

        let referrer = match self.users.get(referrer_id).await? {
            Some(u) => u,
            None => return Ok(None),
        };
        let referrer_uuid = match &referrer.remote_user_id {
            Some(uuid) => uuid.clone(),
            None => {
                warn!("Referrer {} has no control-plane account, bonus skipped", referrer_id);
                return Ok(None);
            }
        };

        if !self.referrals.try_grant(referrer_id, referred_id, bonus_days).await? {
            // A concurrent activation won the claim.
            return Ok(None);
        }

        let new_expiry = match self.extend_referrer(&referrer_uuid, bonus_days).await {
            Ok(expiry) => Some(expiry),
            Err(e) => {
                // The grant is already claimed; this failure needs a human.
                error!(
                    "Referral bonus claimed for {} -> {} but remote extend failed: {}",
                    referrer_id, referred_id, e
                );
                None
            }
        };

        info!(
            "Referral bonus granted: referrer={} referred={} bonus_days={}",
            referrer_id, referred_id, bonus_days
        );

        Ok(Some(ReferralGrant {
            referrer_id,
            referrer_username: referrer.username,
            bonus_days,
            new_expiry,
        }))
    }

    async fn extend_referrer(&self, referrer_uuid: &str, bonus_days: i64) -> Result<String> {
        let remote = self.api.get_user_by_uuid(referrer_uuid).await?;
        let expiry = next_expiry(remote.expire_at, Utc::now(), bonus_days);
        let expire_iso = to_utc_iso(expiry);
        self.api
            .update_user(referrer_uuid, Some(&expire_iso), None, None)
            .await?;
        Ok(expire_iso)
    }

    pub async fn stats(&self, referrer_id: i64) -> Result<(i64, i64)> {
        let count = self.referrals.count_for(referrer_id).await?;
        let days = self.referrals.total_bonus_days(referrer_id).await?;
        Ok((count, days))
    }
}
