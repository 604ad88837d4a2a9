use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use remnashop_db::repositories::UserRepository;

use crate::api::{ApiError, RemnawaveClient, RemoteUser};
use crate::config::Settings;
use crate::utils::{sanitize_username, to_utc_iso};

/// Suffix retries on a username collision before falling back to adoption
/// by telegram id.
const USERNAME_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct Provisioned {
    pub remote_user_id: String,
    pub subscription_url: Option<String>,
    pub new_expiry: DateTime<Utc>,
}

/// Idempotent create-or-extend of the control-plane user. Every remote call
/// here is retry-safe: create falls back to adopt, update is an absolute
/// set, and the subscription-URL fetch is read-only.
#[derive(Clone)]
pub struct ProvisionService {
    api: RemnawaveClient,
    users: UserRepository,
    settings: Arc<Settings>,
}

impl ProvisionService {
    pub fn new(api: RemnawaveClient, users: UserRepository, settings: Arc<Settings>) -> Self {
        Self { api, users, settings }
    }

    pub async fn provision(
        &self,
        telegram_id: i64,
        username: Option<&str>,
        total_days: i64,
    ) -> Result<Provisioned> {
        let user = self.users.get_or_create(telegram_id, username).await?;
        let now = Utc::now();

        let (remote, new_expiry) = match &user.remote_user_id {
            Some(uuid) => self.extend_existing(uuid, telegram_id, username, total_days, now).await?,
            None => self.create_remote(telegram_id, username, total_days, now).await?,
        };

        // The create endpoint silently drops squads in some panel
        // configurations, so membership is re-asserted with an explicit
        // update after every create/extend.
        self.reassert_squads(&remote.uuid).await;

        self.users.set_remote_user_id(telegram_id, &remote.uuid).await?;

        let subscription_url = self.fetch_subscription_url(&remote).await;

        info!(
            "Provisioned user {}: remote={}, +{}d, expires {}",
            telegram_id,
            remote.uuid,
            total_days,
            to_utc_iso(new_expiry)
        );

        Ok(Provisioned {
            remote_user_id: remote.uuid,
            subscription_url,
            new_expiry,
        })
    }

    async fn extend_existing(
        &self,
        uuid: &str,
        telegram_id: i64,
        username: Option<&str>,
        total_days: i64,
        now: DateTime<Utc>,
    ) -> Result<(RemoteUser, DateTime<Utc>)> {
        match self.api.get_user_by_uuid(uuid).await {
            Ok(remote) => {
                let expiry = next_expiry(remote.expire_at, now, total_days);
                let updated = self
                    .api
                    .update_user(uuid, Some(&to_utc_iso(expiry)), None, None)
                    .await
                    .context("Failed to extend remote user")?;
                Ok((updated, expiry))
            }
            Err(ApiError::NotFound) => {
                // The remote account disappeared (panel reset); recreate it.
                warn!("Remote user {} vanished, recreating for {}", uuid, telegram_id);
                self.create_remote(telegram_id, username, total_days, now).await
            }
            Err(e) => Err(e).context("Failed to load remote user"),
        }
    }

    async fn create_remote(
        &self,
        telegram_id: i64,
        username: Option<&str>,
        total_days: i64,
        now: DateTime<Utc>,
    ) -> Result<(RemoteUser, DateTime<Utc>)> {
        let expiry = now + Duration::days(total_days);
        let expire_iso = to_utc_iso(expiry);
        let base = sanitize_username(username, telegram_id);

        for attempt in 0..=USERNAME_RETRIES {
            let candidate = if attempt == 0 {
                base.clone()
            } else {
                format!("{}{}", base, attempt)
            };

            match self
                .api
                .create_user(
                    &candidate,
                    &expire_iso,
                    telegram_id,
                    self.settings.default_external_squad.as_deref(),
                    &self.settings.default_internal_squads,
                )
                .await
            {
                Ok(remote) => return Ok((remote, expiry)),
                Err(e) if e.is_already_exists() => {
                    warn!(
                        "Username '{}' already exists on the control plane (attempt {})",
                        candidate,
                        attempt + 1
                    );
                    continue;
                }
                Err(e) => return Err(e).context("Failed to create remote user"),
            }
        }

        // All candidates collided: a racing create already registered this
        // telegram id. Adopt the existing account and extend it instead.
        self.adopt_by_telegram_id(telegram_id, total_days, now).await
    }

    async fn adopt_by_telegram_id(
        &self,
        telegram_id: i64,
        total_days: i64,
        now: DateTime<Utc>,
    ) -> Result<(RemoteUser, DateTime<Utc>)> {
        let found = self
            .api
            .get_user_by_telegram_id(telegram_id)
            .await
            .context("Create collided but no remote user found by telegram id")?;

        info!("Adopting existing remote user {} for {}", found.uuid, telegram_id);

        let expiry = next_expiry(found.expire_at, now, total_days);
        let updated = self
            .api
            .update_user(&found.uuid, Some(&to_utc_iso(expiry)), None, None)
            .await
            .context("Failed to extend adopted remote user")?;
        Ok((updated, expiry))
    }

    async fn reassert_squads(&self, uuid: &str) {
        let external = self.settings.default_external_squad.as_deref();
        let internal = &self.settings.default_internal_squads;
        if external.is_none() && internal.is_empty() {
            return;
        }
        if let Err(e) = self
            .api
            .update_user(uuid, None, external, Some(internal.as_slice()))
            .await
        {
            warn!("Failed to apply squads on {}: {}", uuid, e);
        }
    }

    async fn fetch_subscription_url(&self, remote: &RemoteUser) -> Option<String> {
        let short_uuid = match &remote.short_uuid {
            Some(s) => s.clone(),
            // Update responses sometimes omit shortUuid; re-read the user.
            None => match self.api.get_user_by_uuid(&remote.uuid).await {
                Ok(full) => full.short_uuid?,
                Err(e) => {
                    warn!("Failed to re-read remote user {}: {}", remote.uuid, e);
                    return None;
                }
            },
        };

        match self.api.get_subscription_url(&short_uuid).await {
            Ok(url) => url,
            Err(e) => {
                warn!("Failed to fetch subscription url for {}: {}", short_uuid, e);
                None
            }
        }
    }
}

/// Extension base rule: days are added to the current expiry while it is
/// still in the future, and to `now` once it has passed.
pub fn next_expiry(current: Option<DateTime<Utc>>, now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    let base = match current {
        Some(expiry) if expiry > now => expiry,
        _ => now,
    };
    base + Duration::days(days)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn active_subscription_extends_from_expiry() {
        let now = at(2026, 8, 1);
        let expiry = at(2026, 8, 11); // 10 days left
        assert_eq!(next_expiry(Some(expiry), now, 30), at(2026, 9, 10));
    }

    #[test]
    fn expired_subscription_extends_from_now() {
        let now = at(2026, 8, 1);
        let expiry = at(2026, 7, 1);
        assert_eq!(next_expiry(Some(expiry), now, 30), at(2026, 8, 31));
    }

    #[test]
    fn fresh_user_extends_from_now() {
        let now = at(2026, 8, 1);
        assert_eq!(next_expiry(None, now, 90), at(2026, 10, 30));
    }
}
