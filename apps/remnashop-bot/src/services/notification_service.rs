use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, MessageId, ParseMode, ThreadId};
use tracing::{debug, warn};

use crate::config::Settings;

/// Outbound notifications: structured events to the admin chat/topic and
/// success messages to users. Every send is best-effort — a failed
/// notification never fails the flow that triggered it.
#[derive(Clone)]
pub struct NotificationService {
    bot: Bot,
    settings: Arc<Settings>,
}

impl NotificationService {
    pub fn new(bot: Bot, settings: Arc<Settings>) -> Self {
        Self { bot, settings }
    }

    pub async fn send_admin(&self, text: &str) {
        let chat_id = match self.settings.notifications_chat_id {
            Some(id) => id,
            None => {
                debug!("Admin notifications disabled: NOTIFICATIONS_CHAT_ID not set");
                return;
            }
        };

        let mut req = self
            .bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html);
        if let Some(topic_id) = self.settings.notifications_topic_id {
            req = req.message_thread_id(ThreadId(MessageId(topic_id)));
        }

        if let Err(e) = req.await {
            warn!("Failed to send admin notification: {}", e);
        }
    }

    pub async fn notify_payment_success(
        &self,
        user_id: i64,
        username: Option<&str>,
        months: u32,
        amount_label: &str,
        remote_uuid: &str,
        expire_date: &str,
        subscription_url: Option<&str>,
    ) {
        let mention = mention(user_id, username);
        self.send_admin(&format!(
            "💰 <b>New purchase</b>\n\n\
             👤 User: {}\n\
             🆔 Telegram ID: <code>{}</code>\n\
             💳 Amount: <b>{}</b>\n\
             📅 Period: <b>{} mo.</b>\n\
             🔗 UUID: <code>{}</code>\n\
             ⏳ Expires: <code>{}</code>",
            mention, user_id, amount_label, months, remote_uuid, expire_date
        ))
        .await;

        let text = format!(
            "✅ <b>Payment received!</b>\n\n\
             Your subscription is active.\n\n\
             📅 Period: <b>{} mo.</b>\n\
             ⏳ Valid until: <code>{}</code>",
            months, expire_date
        );
        self.send_user(user_id, &text, subscription_url).await;
    }

    pub async fn notify_trial_activation(
        &self,
        user_id: i64,
        username: Option<&str>,
        trial_days: i64,
        remote_uuid: &str,
    ) {
        self.send_admin(&format!(
            "🎁 <b>Trial activated</b>\n\n\
             👤 User: {}\n\
             🆔 Telegram ID: <code>{}</code>\n\
             ⏰ Duration: <b>{} days</b>\n\
             🔗 UUID: <code>{}</code>",
            mention(user_id, username),
            user_id,
            trial_days,
            remote_uuid
        ))
        .await;
    }

    pub async fn notify_referral_bonus(
        &self,
        referrer_id: i64,
        referrer_username: Option<&str>,
        referred_id: i64,
        bonus_days: i64,
        new_expiry: Option<&str>,
    ) {
        self.send_admin(&format!(
            "👥 <b>Referral bonus granted</b>\n\n\
             👤 Referrer: {}\n\
             🆔 ID: <code>{}</code>\n\
             🎁 Bonus: <b>+{} days</b>\n\
             ⏳ New expiry: <code>{}</code>\n\
             👥 Referred: <code>{}</code>",
            mention(referrer_id, referrer_username),
            referrer_id,
            bonus_days,
            new_expiry.unwrap_or("extend failed, check manually"),
            referred_id
        ))
        .await;

        let user_text = format!(
            "🎉 <b>Referral bonus!</b>\n\nYour invited user activated a subscription: <b>+{} days</b> added to yours.",
            bonus_days
        );
        self.send_user(referrer_id, &user_text, None).await;
    }

    pub async fn notify_gift_purchase(
        &self,
        purchaser_id: i64,
        gift_code: &str,
        subscription_days: i64,
        amount_label: &str,
    ) {
        self.send_admin(&format!(
            "🎁 <b>Gift subscription purchased</b>\n\n\
             👤 Purchaser: <code>{}</code>\n\
             🎫 Code: <code>{}</code>\n\
             📅 Duration: {} days\n\
             💳 Amount: {}",
            purchaser_id, gift_code, subscription_days, amount_label
        ))
        .await;
    }

    /// Paid-but-unprovisioned is the one state that needs a human (or the
    /// background retry) — the money is real, the access is not.
    pub async fn notify_provision_failure(
        &self,
        user_id: i64,
        payment_id: i64,
        amount_label: &str,
        error: &str,
    ) {
        self.send_admin(&format!(
            "⚠️ <b>Payment captured but provisioning failed</b>\n\n\
             🆔 Telegram ID: <code>{}</code>\n\
             🧾 Payment: <code>#{}</code>\n\
             💳 Amount: {}\n\
             ❌ Error: <code>{}</code>\n\n\
             The payment stays pending and will be retried.",
            user_id, payment_id, amount_label, error
        ))
        .await;
    }

    pub async fn send_user(&self, user_id: i64, text: &str, url_button: Option<&str>) {
        let mut req = self
            .bot
            .send_message(ChatId(user_id), text)
            .parse_mode(ParseMode::Html);

        if let Some(url) = url_button {
            if let Ok(parsed) = reqwest::Url::parse(url) {
                let keyboard = InlineKeyboardMarkup::new(vec![vec![
                    InlineKeyboardButton::url("📥 Get config", parsed),
                ]]);
                req = req.reply_markup(keyboard);
            }
        }

        if let Err(e) = req.await {
            warn!("Failed to notify user {}: {}", user_id, e);
        }
    }
}

fn mention(user_id: i64, username: Option<&str>) -> String {
    match username {
        Some(name) => format!("@{}", name),
        None => format!("User {}", user_id),
    }
}
