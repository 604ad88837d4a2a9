use teloxide::prelude::*;
use teloxide::types::{Message, ParseMode};
use tracing::{error, info};

use crate::bot::keyboards;
use crate::services::reconcile_service::FinalizeOutcome;
use crate::state::{AppState, PendingInput};

pub async fn message_handler(
    bot: Bot,
    msg: Message,
    state: AppState,
) -> Result<(), teloxide::RequestError> {
    let telegram_id = msg.chat.id.0;
    let username = msg.from.as_ref().and_then(|u| u.username.clone());

    // Stars push confirmation arrives as a service message.
    if let Some(payment) = msg.successful_payment() {
        info!(
            "Successful payment from {}: amount {} (payload '{}')",
            telegram_id, payment.total_amount, payment.invoice_payload
        );

        let outcome = state
            .reconcile
            .handle_stars_payment(
                telegram_id,
                &payment.invoice_payload,
                payment.total_amount as i64,
                &payment.provider_payment_charge_id,
            )
            .await;

        match outcome {
            // The finalizer already messaged the user with the config button.
            Ok(FinalizeOutcome::Completed { .. }) => {}
            Ok(FinalizeOutcome::GiftCreated { code, subscription_days }) => {
                let text = format!(
                    "🎁 <b>Gift code created!</b>\n\n\
                     🎫 Code: <code>{}</code>\n\
                     📅 Duration: {} days\n\n\
                     Share the code — it is redeemed in this bot via «Redeem a code».",
                    code, subscription_days
                );
                bot.send_message(msg.chat.id, text)
                    .parse_mode(ParseMode::Html)
                    .reply_markup(keyboards::back_to_menu())
                    .await?;
            }
            Ok(FinalizeOutcome::AlreadyCompleted) => {
                bot.send_message(msg.chat.id, "This payment has already been processed.")
                    .await?;
            }
            Ok(FinalizeOutcome::ProvisionFailed) => {
                bot.send_message(
                    msg.chat.id,
                    "✅ Payment received. Activation is taking longer than usual — \
                     it will complete automatically, support has been notified.",
                )
                .await?;
            }
            Ok(_) => {
                bot.send_message(
                    msg.chat.id,
                    "⚠️ Payment could not be matched. Please contact support.",
                )
                .await?;
            }
            Err(e) => {
                error!("Failed to process successful payment: {}", e);
                bot.send_message(msg.chat.id, "⚠️ Error processing payment. Please contact support.")
                    .await?;
            }
        }
        return Ok(());
    }

    let text = match msg.text() {
        Some(t) => t.to_string(),
        None => return Ok(()),
    };

    if let Some(rest) = text.strip_prefix("/start") {
        if let Err(e) = register_user(&state, telegram_id, username.as_deref(), rest.trim()).await {
            error!("Failed to register user {}: {}", telegram_id, e);
        }
        send_menu(&bot, &msg, &state).await?;
        return Ok(());
    }

    if text == "/menu" {
        send_menu(&bot, &msg, &state).await?;
        return Ok(());
    }

    if let Some(code) = text.strip_prefix("/redeem") {
        let code = code.trim();
        if code.is_empty() {
            state.set_pending(telegram_id, PendingInput::GiftRedeem);
            bot.send_message(msg.chat.id, "Send the gift code (GIFT-XXXX-XXXX):")
                .await?;
        } else {
            redeem_gift(&bot, &msg, &state, code).await?;
        }
        return Ok(());
    }

    // Multi-step flows the driver is waiting on for this user.
    match state.take_pending(telegram_id) {
        Some(PendingInput::PromoCode { months }) => {
            apply_promo_input(&bot, &msg, &state, months, text.trim()).await?;
        }
        Some(PendingInput::GiftRedeem) => {
            redeem_gift(&bot, &msg, &state, text.trim()).await?;
        }
        None => {
            send_menu(&bot, &msg, &state).await?;
        }
    }

    Ok(())
}

async fn register_user(
    state: &AppState,
    telegram_id: i64,
    username: Option<&str>,
    start_param: &str,
) -> anyhow::Result<()> {
    state.users.get_or_create(telegram_id, username).await?;

    // Referral deep link: /start ref_<telegram_id>.
    let param = start_param.strip_prefix("ref_").unwrap_or(start_param);
    if let Ok(referrer) = param.parse::<i64>() {
        state.referral.register(telegram_id, referrer).await?;
    }
    Ok(())
}

async fn send_menu(bot: &Bot, msg: &Message, state: &AppState) -> Result<(), teloxide::RequestError> {
    let telegram_id = msg.chat.id.0;
    let trial_available = match state.users.get(telegram_id).await {
        Ok(Some(user)) => !user.trial_used && user.remote_user_id.is_none(),
        _ => true,
    };

    bot.send_message(
        msg.chat.id,
        "👋 <b>Welcome!</b>\n\nBuy, extend or gift your VPN access below.",
    )
    .parse_mode(ParseMode::Html)
    .reply_markup(keyboards::main_menu(trial_available))
    .await?;
    Ok(())
}

async fn apply_promo_input(
    bot: &Bot,
    msg: &Message,
    state: &AppState,
    months: u32,
    code: &str,
) -> Result<(), teloxide::RequestError> {
    match state.invoice.promo_for_display(code).await {
        Ok(Some(promo)) => {
            let mut perks = Vec::new();
            if let Some(pct) = promo.discount_percent {
                perks.push(format!("-{}%", pct));
            }
            if let Some(days) = promo.bonus_days {
                perks.push(format!("+{} bonus days", days));
            }
            bot.send_message(
                msg.chat.id,
                format!(
                    "🎟 Promo code <b>{}</b> applied ({}). Choose a payment method:",
                    promo.code,
                    perks.join(", ")
                ),
            )
            .parse_mode(ParseMode::Html)
            .reply_markup(keyboards::channel_keyboard(months, Some(&promo.code)))
            .await?;
        }
        Ok(None) => {
            bot.send_message(
                msg.chat.id,
                "❌ This promo code is not valid. Choose a payment method without it:",
            )
            .reply_markup(keyboards::channel_keyboard(months, None))
            .await?;
        }
        Err(e) => {
            error!("Promo validation failed: {}", e);
            bot.send_message(msg.chat.id, "⚠️ Could not check the promo code, try again later.")
                .await?;
        }
    }
    Ok(())
}

async fn redeem_gift(
    bot: &Bot,
    msg: &Message,
    state: &AppState,
    code: &str,
) -> Result<(), teloxide::RequestError> {
    let telegram_id = msg.chat.id.0;
    let username = msg.from.as_ref().and_then(|u| u.username.clone());

    match state.gifts.redeem(code, telegram_id, username.as_deref()).await {
        Ok(redeemed) => {
            let text = format!(
                "🎉 <b>Gift activated!</b>\n\n📅 Added: <b>{} days</b>",
                redeemed.gift.subscription_days
            );
            state
                .notifier
                .send_user(telegram_id, &text, redeemed.provisioned.subscription_url.as_deref())
                .await;
        }
        Err(e) => {
            bot.send_message(msg.chat.id, format!("❌ {}", e))
                .reply_markup(keyboards::back_to_menu())
                .await?;
        }
    }
    Ok(())
}
