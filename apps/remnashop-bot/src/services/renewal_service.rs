use chrono::{DateTime, Duration, Utc};
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, ParseMode};
use tracing::{debug, error, info, warn};

use remnashop_db::repositories::UserRepository;

use crate::api::{ApiError, RemnawaveClient};

/// How often the reminder scan runs.
pub const SCAN_INTERVAL_HOURS: u64 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderKind {
    /// First notice, 3–5 days before expiry.
    ExpiringSoon(i64),
    /// Repeat notice on the last day.
    ExpiringTomorrow,
    /// Access already suspended; offer to resume.
    Expired,
}

/// Periodic scan over auto-renewal users: fetch the authoritative expiry
/// from the control plane and remind accordingly. All date math is UTC.
#[derive(Clone)]
pub struct RenewalService {
    bot: Bot,
    users: UserRepository,
    api: RemnawaveClient,
}

impl RenewalService {
    pub fn new(bot: Bot, users: UserRepository, api: RemnawaveClient) -> Self {
        Self { bot, users, api }
    }

    pub async fn run(self) {
        info!("Starting renewal checker (interval: {}h)", SCAN_INTERVAL_HOURS);
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(SCAN_INTERVAL_HOURS * 3600));
        loop {
            interval.tick().await;
            if let Err(e) = self.scan_once().await {
                error!("Renewal scan failed: {}", e);
            }
        }
    }

    pub async fn scan_once(&self) -> anyhow::Result<()> {
        let users = self.users.users_with_auto_renewal().await?;
        if users.is_empty() {
            debug!("No users with auto renewal enabled");
            return Ok(());
        }

        info!("Checking {} auto-renewal users for expiring subscriptions", users.len());
        let now = Utc::now();

        for user in users {
            let uuid = match &user.remote_user_id {
                Some(u) => u,
                None => continue,
            };

            let remote = match self.api.get_user_by_uuid(uuid).await {
                Ok(r) => r,
                Err(ApiError::NotFound) => {
                    debug!("User {} not found on control plane ({})", user.telegram_id, uuid);
                    continue;
                }
                Err(e) => {
                    warn!("Expiry check failed for {}: {}", user.telegram_id, e);
                    continue;
                }
            };

            let expire_at = match remote.expire_at {
                Some(e) => e,
                None => continue,
            };

            let expired = remote.status.as_deref() == Some("EXPIRED") || expire_at < now;
            let days_until = (expire_at - now).num_days();

            if let Some(kind) =
                reminder_due(days_until, expired, user.last_renewal_notification_at, now)
            {
                self.send_reminder(user.telegram_id, kind).await;
                self.users.touch_renewal_notification(user.telegram_id).await?;
            }
        }

        Ok(())
    }

    async fn send_reminder(&self, telegram_id: i64, kind: ReminderKind) {
        let (text, button, callback) = match kind {
            ReminderKind::Expired => (
                "⛔ <b>Access suspended</b>\n\nYour subscription has expired. Renew to get back online.".to_string(),
                "▶️ Resume access",
                "renew",
            ),
            ReminderKind::ExpiringTomorrow => (
                "⏳ <b>Your subscription expires tomorrow.</b>\n\nRenew now to keep your access.".to_string(),
                "🔄 Renew",
                "renew",
            ),
            ReminderKind::ExpiringSoon(days) => (
                format!(
                    "⏳ <b>Your subscription expires in {} days.</b>\n\nRenew in advance to avoid interruption.",
                    days
                ),
                "🔄 Renew",
                "renew",
            ),
        };

        let keyboard = InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
            button, callback,
        )]]);

        match self
            .bot
            .send_message(ChatId(telegram_id), text)
            .parse_mode(ParseMode::Html)
            .reply_markup(keyboard)
            .await
        {
            Ok(_) => info!("Sent renewal reminder to {}: {:?}", telegram_id, kind),
            Err(e) => warn!("Failed to send renewal reminder to {}: {}", telegram_id, e),
        }
    }
}

/// Reminder decision: first notice at 3–5 days out, repeat on the last day,
/// resume prompt once expired — and never more than one notice per day.
pub fn reminder_due(
    days_until: i64,
    expired: bool,
    last_notified: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<ReminderKind> {
    let day_passed = match last_notified {
        Some(last) => now - last >= Duration::days(1),
        None => true,
    };
    if !day_passed {
        return None;
    }

    if expired {
        return Some(ReminderKind::Expired);
    }
    match days_until {
        1 => Some(ReminderKind::ExpiringTomorrow),
        3..=5 => Some(ReminderKind::ExpiringSoon(days_until)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_notice_window() {
        let now = Utc::now();
        assert_eq!(reminder_due(4, false, None, now), Some(ReminderKind::ExpiringSoon(4)));
        assert_eq!(reminder_due(3, false, None, now), Some(ReminderKind::ExpiringSoon(3)));
        assert_eq!(reminder_due(5, false, None, now), Some(ReminderKind::ExpiringSoon(5)));
        assert_eq!(reminder_due(6, false, None, now), None);
        assert_eq!(reminder_due(2, false, None, now), None);
    }

    #[test]
    fn last_day_and_expired() {
        let now = Utc::now();
        assert_eq!(reminder_due(1, false, None, now), Some(ReminderKind::ExpiringTomorrow));
        assert_eq!(reminder_due(-2, true, None, now), Some(ReminderKind::Expired));
    }

    #[test]
    fn at_most_one_notice_per_day() {
        let now = Utc::now();
        let recent = Some(now - Duration::hours(3));
        assert_eq!(reminder_due(4, false, recent, now), None);
        assert_eq!(reminder_due(1, false, recent, now), None);
        assert_eq!(reminder_due(-1, true, recent, now), None);

        let yesterday = Some(now - Duration::days(1) - Duration::minutes(1));
        assert_eq!(reminder_due(1, false, yesterday, now), Some(ReminderKind::ExpiringTomorrow));
        assert_eq!(reminder_due(-1, true, yesterday, now), Some(ReminderKind::Expired));
    }
}
