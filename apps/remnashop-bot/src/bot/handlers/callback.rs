use teloxide::prelude::*;
use teloxide::types::{CallbackQuery, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, ParseMode};
use tracing::{error, info};

use remnashop_db::models::PaymentChannel;

use crate::bot::keyboards;
use crate::services::invoice_service::PayableArtifact;
use crate::services::reconcile_service::{amount_label, FinalizeOutcome};
use crate::state::{AppState, PendingInput};

pub async fn callback_handler(
    bot: Bot,
    q: CallbackQuery,
    state: AppState,
) -> Result<(), teloxide::RequestError> {
    let data = match &q.data {
        Some(d) => d.clone(),
        None => return Ok(()),
    };
    let chat_id = match q.message.as_ref().map(|m| m.chat().id) {
        Some(id) => id,
        None => return Ok(()),
    };
    let telegram_id = q.from.id.0 as i64;
    let username = q.from.username.clone();

    bot.answer_callback_query(q.id.clone()).await?;

    let parts: Vec<&str> = data.split(':').collect();
    match parts.as_slice() {
        ["menu"] => {
            let trial_available = match state.users.get(telegram_id).await {
                Ok(Some(user)) => !user.trial_used && user.remote_user_id.is_none(),
                _ => true,
            };
            bot.send_message(chat_id, "Main menu:")
                .reply_markup(keyboards::main_menu(trial_available))
                .await?;
        }

        ["buy"] | ["renew"] => {
            bot.send_message(chat_id, "Choose a subscription period:")
                .reply_markup(keyboards::period_keyboard("buy"))
                .await?;
        }

        ["buy", months] => {
            if let Ok(months) = months.parse::<u32>() {
                bot.send_message(chat_id, "Choose a payment method:")
                    .reply_markup(keyboards::channel_keyboard(months, None))
                    .await?;
            }
        }

        ["promo", months] => {
            if let Ok(months) = months.parse::<u32>() {
                state.set_pending(telegram_id, PendingInput::PromoCode { months });
                bot.send_message(chat_id, "Send your promo code:").await?;
            }
        }

        ["pay", months, channel, promo @ ..] => {
            let months: u32 = match months.parse() {
                Ok(m) => m,
                Err(_) => return Ok(()),
            };
            let channel = match channel.parse::<PaymentChannel>() {
                Ok(c) => c,
                Err(_) => return Ok(()),
            };
            let promo_code = promo.first().filter(|p| !p.is_empty()).map(|p| p.to_string());

            match state
                .invoice
                .create_invoice(telegram_id, months, channel, promo_code.as_deref())
                .await
            {
                Ok(artifact) => send_artifact(&bot, chat_id, &artifact).await?,
                Err(e) => {
                    error!("Invoice creation failed for {}: {}", telegram_id, e);
                    bot.send_message(chat_id, format!("❌ Could not create the invoice: {}", e))
                        .reply_markup(keyboards::back_to_menu())
                        .await?;
                }
            }
        }

        ["check", payment_id] => {
            if let Ok(payment_id) = payment_id.parse::<i64>() {
                check_payment(&bot, chat_id, &state, payment_id).await?;
            }
        }

        ["trial"] => {
            match state.trial.activate(telegram_id, username.as_deref()).await {
                Ok(provisioned) => {
                    let text = format!(
                        "🎉 <b>Trial activated!</b>\n\n📅 {} days of access.",
                        state.settings.trial_days
                    );
                    state
                        .notifier
                        .send_user(telegram_id, &text, provisioned.subscription_url.as_deref())
                        .await;
                }
                Err(e) => {
                    bot.send_message(chat_id, format!("❌ {}", e))
                        .reply_markup(keyboards::back_to_menu())
                        .await?;
                }
            }
        }

        ["gift"] => {
            bot.send_message(chat_id, "Choose a gift period (paid with Stars):")
                .reply_markup(keyboards::period_keyboard("gift"))
                .await?;
        }

        ["gift", months] => {
            if let Ok(months) = months.parse::<u32>() {
                match state.invoice.create_gift_invoice(telegram_id, months).await {
                    Ok(artifact) => send_artifact(&bot, chat_id, &artifact).await?,
                    Err(e) => {
                        error!("Gift invoice failed for {}: {}", telegram_id, e);
                        bot.send_message(chat_id, format!("❌ Could not create the invoice: {}", e))
                            .await?;
                    }
                }
            }
        }

        ["redeem"] => {
            state.set_pending(telegram_id, PendingInput::GiftRedeem);
            bot.send_message(chat_id, "Send the gift code (GIFT-XXXX-XXXX):").await?;
        }

        ["autorenew"] => {
            let user = state.users.get_or_create(telegram_id, username.as_deref()).await;
            match user {
                Ok(user) => {
                    let enabled = !user.auto_renewal;
                    if state.users.set_auto_renewal(telegram_id, enabled).await.is_ok() {
                        let text = if enabled {
                            "🔄 Auto-renewal reminders are <b>on</b>. You will be notified before your subscription expires."
                        } else {
                            "🔕 Auto-renewal reminders are <b>off</b>."
                        };
                        bot.send_message(chat_id, text)
                            .parse_mode(ParseMode::Html)
                            .reply_markup(keyboards::back_to_menu())
                            .await?;
                    }
                }
                Err(e) => error!("Auto-renewal toggle failed for {}: {}", telegram_id, e),
            }
        }

        ["profile"] => {
            send_profile(&bot, chat_id, &state, telegram_id).await?;
        }

        _ => {
            info!("Unhandled callback data: {}", data);
        }
    }

    Ok(())
}

/// Hands the user whatever the invoice produced: a Stars deep link, a
/// checkout URL, or an SBP QR with its fallback link.
async fn send_artifact(
    bot: &Bot,
    chat_id: ChatId,
    artifact: &PayableArtifact,
) -> Result<(), teloxide::RequestError> {
    let pay_button = reqwest::Url::parse(&artifact.url)
        .ok()
        .map(|url| InlineKeyboardButton::url("💳 Pay", url));

    let discount_note = if artifact.quote.discount_amount > 0 {
        format!(" (discount applied: -{})", artifact.quote.discount_amount)
    } else {
        String::new()
    };

    match artifact.channel {
        PaymentChannel::Stars => {
            let mut rows = Vec::new();
            if let Some(btn) = pay_button {
                rows.push(vec![btn]);
            }
            rows.push(vec![InlineKeyboardButton::callback("« Menu", "menu")]);
            bot.send_message(
                chat_id,
                format!(
                    "⭐ Invoice created: <b>{} Stars</b>{}. Pay via the button below.",
                    artifact.amount, discount_note
                ),
            )
            .parse_mode(ParseMode::Html)
            .reply_markup(InlineKeyboardMarkup::new(rows))
            .await?;
        }
        PaymentChannel::Card | PaymentChannel::Sbp => {
            let amount = format!("{}.{:02} ₽", artifact.amount / 100, artifact.amount % 100);
            let text = format!(
                "🧾 Invoice created: <b>{}</b>{}.\n\nPay via the link{} and press the check button afterwards.",
                amount,
                discount_note,
                if artifact.qr_png.is_some() { " or scan the QR code" } else { "" },
            );

            if let Some(png) = &artifact.qr_png {
                bot.send_photo(chat_id, InputFile::memory(png.clone()).file_name("qr.png"))
                    .await?;
            }

            let mut rows = Vec::new();
            if let Some(btn) = pay_button {
                rows.push(vec![btn]);
            }
            rows.push(vec![InlineKeyboardButton::callback(
                "✅ I have paid — check",
                format!("check:{}", artifact.payment_id),
            )]);
            rows.push(vec![InlineKeyboardButton::callback("« Menu", "menu")]);

            bot.send_message(chat_id, text)
                .parse_mode(ParseMode::Html)
                .reply_markup(InlineKeyboardMarkup::new(rows))
                .await?;
        }
    }
    Ok(())
}

async fn check_payment(
    bot: &Bot,
    chat_id: ChatId,
    state: &AppState,
    payment_id: i64,
) -> Result<(), teloxide::RequestError> {
    match state.reconcile.check_status(payment_id).await {
        // The finalizer messaged the user with the config button already.
        Ok(FinalizeOutcome::Completed { .. }) => {}
        Ok(FinalizeOutcome::AlreadyCompleted) => {
            bot.send_message(chat_id, "✅ This payment is already processed — your access is active.")
                .reply_markup(keyboards::back_to_menu())
                .await?;
        }
        Ok(FinalizeOutcome::NotPaidYet { status }) => {
            bot.send_message(
                chat_id,
                format!("⏳ Payment not confirmed yet (status: {}). Try again in a minute.", status),
            )
            .reply_markup(keyboards::check_status_keyboard(payment_id))
            .await?;
        }
        Ok(FinalizeOutcome::ProvisionFailed) => {
            bot.send_message(
                chat_id,
                "✅ Payment received. Activation is taking longer than usual — support has been notified.",
            )
            .await?;
        }
        Ok(_) => {
            bot.send_message(chat_id, "⚠️ Payment could not be matched. Please contact support.")
                .await?;
        }
        Err(e) => {
            error!("check_status failed for payment {}: {}", payment_id, e);
            bot.send_message(chat_id, "⚠️ Could not check the payment status, try again later.")
                .reply_markup(keyboards::check_status_keyboard(payment_id))
                .await?;
        }
    }
    Ok(())
}

async fn send_profile(
    bot: &Bot,
    chat_id: ChatId,
    state: &AppState,
    telegram_id: i64,
) -> Result<(), teloxide::RequestError> {
    let profile = state.loyalty.profile(telegram_id).await;
    let history = state.payments.completed_history(telegram_id, 10).await;
    let referral_stats = state.referral.stats(telegram_id).await;

    let mut text = String::from("👤 <b>Your profile</b>\n\n");

    if let Ok(p) = profile {
        text.push_str(&format!(
            "🏅 Tier: <b>{}</b>\n💠 Points: <b>{}</b>\n💸 Total spent: <b>{} ₽</b>\n",
            p.tier.as_str(),
            p.points,
            p.total_spent
        ));
        if let Some(next) = p.tier.next_threshold() {
            text.push_str(&format!("⬆️ Next tier at <b>{}</b> points\n", next));
        }
    }

    if let Ok((count, days)) = referral_stats {
        text.push_str(&format!(
            "\n👥 Referrals: <b>{}</b> (+{} bonus days earned)\n",
            count, days
        ));
        text.push_str(&format!(
            "🔗 Your link: <code>https://t.me/{}?start=ref_{}</code>\n",
            state.settings.bot_username, telegram_id
        ));
    }

    if let Ok(history) = history {
        if !history.is_empty() {
            text.push_str("\n🧾 <b>Recent payments</b>\n");
            for p in &history {
                text.push_str(&format!(
                    "• {} — {} days ({})\n",
                    amount_label(p),
                    p.subscription_days,
                    p.created_at.format("%Y-%m-%d")
                ));
            }
        }
    }

    bot.send_message(chat_id, text)
        .parse_mode(ParseMode::Html)
        .reply_markup(keyboards::back_to_menu())
        .await?;
    Ok(())
}
