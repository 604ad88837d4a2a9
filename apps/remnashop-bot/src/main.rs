use dotenvy::dotenv;
use std::sync::Arc;
use teloxide::prelude::*;
use tracing::{error, info};

mod api;
mod bot;
mod config;
mod services;
mod state;
mod utils;

use api::RemnawaveClient;
use config::Settings;
use remnashop_db::repositories::{
    GiftRepository, PaymentRepository, PromoRepository, ReferralRepository, UserRepository,
};
use services::gift_service::GiftService;
use services::invoice_service::InvoiceService;
use services::loyalty_service::LoyaltyService;
use services::notification_service::NotificationService;
use services::payment::YookassaClient;
use services::promo_service::PromoService;
use services::provision_service::ProvisionService;
use services::reconcile_service::ReconcileService;
use services::referral_service::ReferralService;
use services::renewal_service::RenewalService;
use services::trial_service::TrialService;
use state::AppState;

/// Sweep cadence for captured-but-unprovisioned Stars payments.
const RECOVERY_SWEEP_SECS: u64 = 600;
const RECOVERY_MIN_AGE_MINUTES: i64 = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Starting remnashop bot...");

    let settings = Arc::new(Settings::load()?);
    let pool = remnashop_db::init_db(&settings.database_url).await?;

    let users = UserRepository::new(pool.clone());
    let payments = PaymentRepository::new(pool.clone());
    let promos = PromoRepository::new(pool.clone());
    let referrals = ReferralRepository::new(pool.clone());
    let gift_codes = GiftRepository::new(pool.clone());

    let api = RemnawaveClient::new(settings.api_base_url.clone(), settings.api_token.clone());
    let bot = Bot::new(settings.bot_token.clone());

    let yookassa = if settings.yookassa_configured() {
        Some(YookassaClient::new(
            settings.yookassa_shop_id.clone().unwrap(),
            settings.yookassa_secret_key.clone().unwrap(),
        ))
    } else {
        info!("YooKassa credentials not configured, ruble rails disabled");
        None
    };

    let notifier = NotificationService::new(bot.clone(), settings.clone());
    let provision = ProvisionService::new(api.clone(), users.clone(), settings.clone());
    let loyalty = LoyaltyService::new(settings.clone(), users.clone());
    let promo = PromoService::new(promos.clone());
    let referral = ReferralService::new(
        users.clone(),
        referrals.clone(),
        api.clone(),
        settings.clone(),
    );
    let gifts = GiftService::new(gift_codes.clone(), provision.clone());
    let invoice = InvoiceService::new(
        settings.clone(),
        payments.clone(),
        loyalty.clone(),
        promo.clone(),
        yookassa.clone(),
    );
    let reconcile = ReconcileService::new(
        users.clone(),
        payments.clone(),
        provision.clone(),
        loyalty.clone(),
        promo.clone(),
        referral.clone(),
        gifts.clone(),
        notifier.clone(),
        yookassa,
    );
    let trial = TrialService::new(
        settings.clone(),
        users.clone(),
        provision.clone(),
        referral.clone(),
        notifier.clone(),
    );

    let state = AppState {
        settings: settings.clone(),
        users: users.clone(),
        payments,
        loyalty,
        invoice,
        reconcile: reconcile.clone(),
        referral,
        trial,
        gifts,
        notifier,
        pending_inputs: Arc::new(std::sync::Mutex::new(std::collections::HashMap::new())),
    };

    // Background: renewal reminders over auto-renewal users.
    let renewal = RenewalService::new(bot.clone(), users, api);
    tokio::spawn(renewal.run());

    // Background: the Stars rail has no pull-status path, so captured
    // payments whose provisioning failed are re-driven here.
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(RECOVERY_SWEEP_SECS));
        loop {
            interval.tick().await;
            match reconcile
                .retry_stale_captured(chrono::Duration::minutes(RECOVERY_MIN_AGE_MINUTES))
                .await
            {
                Ok(0) => {}
                Ok(n) => info!("Recovery sweep completed {} stuck payment(s)", n),
                Err(e) => error!("Recovery sweep failed: {}", e),
            }
        }
    });

    bot::run_bot(bot, state).await;
    Ok(())
}
