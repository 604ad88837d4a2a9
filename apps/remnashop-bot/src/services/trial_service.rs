use anyhow::{anyhow, Result};
use std::sync::Arc;
use tracing::info;

use remnashop_db::repositories::UserRepository;

use crate::config::Settings;
use crate::services::notification_service::NotificationService;
use crate::services::provision_service::{Provisioned, ProvisionService};
use crate::services::referral_service::ReferralService;

/// Trial activation: the purchase path without money. Provisions
/// `trial_days`, flips `trial_used` once, and runs the same post-provision
/// effects as a paid purchase.
#[derive(Clone)]
pub struct TrialService {
    settings: Arc<Settings>,
    users: UserRepository,
    provision: ProvisionService,
    referral: ReferralService,
    notifier: NotificationService,
}

impl TrialService {
    pub fn new(
        settings: Arc<Settings>,
        users: UserRepository,
        provision: ProvisionService,
        referral: ReferralService,
        notifier: NotificationService,
    ) -> Self {
        Self { settings, users, provision, referral, notifier }
    }

    pub async fn activate(&self, telegram_id: i64, username: Option<&str>) -> Result<Provisioned> {
        let user = self.users.get_or_create(telegram_id, username).await?;
        if user.trial_used || user.remote_user_id.is_some() {
            return Err(anyhow!("Trial already used"));
        }

        let trial_days = self.settings.trial_days;
        let provisioned = self.provision.provision(telegram_id, username, trial_days).await?;

        self.users.mark_trial_used(telegram_id).await?;
        info!("Trial activated for {}: {} days", telegram_id, trial_days);

        // Effects are isolated: their failure never rolls back the trial.
        match self.referral.grant_once(telegram_id).await {
            Ok(Some(grant)) => {
                self.notifier
                    .notify_referral_bonus(
                        grant.referrer_id,
                        grant.referrer_username.as_deref(),
                        telegram_id,
                        grant.bonus_days,
                        grant.new_expiry.as_deref(),
                    )
                    .await;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Referral grant on trial failed for {}: {}", telegram_id, e),
        }

        self.notifier
            .notify_trial_activation(telegram_id, username, trial_days, &provisioned.remote_user_id)
            .await;

        Ok(provisioned)
    }
}
