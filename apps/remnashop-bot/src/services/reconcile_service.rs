use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::{error, info, warn};

use remnashop_db::models::{Payment, PaymentChannel};
use remnashop_db::repositories::{PaymentRepository, UserRepository};

use crate::services::gift_service::GiftService;
use crate::services::invoice_service::parse_stars_payload;
use crate::services::loyalty_service::LoyaltyService;
use crate::services::notification_service::NotificationService;
use crate::services::payment::YookassaClient;
use crate::services::promo_service::PromoService;
use crate::services::provision_service::ProvisionService;
use crate::services::referral_service::ReferralService;
use crate::utils::to_utc_iso;

/// Answer for a pre-checkout query. The PSP gives only a few seconds to
/// respond, so the verdict is a pure function over the stored payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreCheckoutVerdict {
    Approve,
    UnknownPayment,
    AlreadyProcessed,
    AmountMismatch,
}

#[derive(Debug, Clone)]
pub enum FinalizeOutcome {
    /// Provisioned and recorded; the purchase is done.
    Completed {
        remote_user_id: String,
        subscription_url: Option<String>,
        expire_iso: String,
        months: u32,
    },
    /// Replay of an already-finalized confirmation; previous result stands.
    AlreadyCompleted,
    /// Gift purchase: a gift code was produced instead of provisioning.
    GiftCreated { code: String, subscription_days: i64 },
    /// No payment row matches the confirmation.
    UnknownPayment,
    /// Captured amount differs beyond tolerance.
    AmountMismatch,
    /// Pull path: the PSP has not confirmed the payment yet.
    NotPaidYet { status: String },
    /// Money captured but provisioning failed; the payment stays pending
    /// for retry and admins are alerted.
    ProvisionFailed,
}

/// Consumes PSP confirmations — push for Stars, pull for the ruble rails —
/// and drives the idempotent finalization path: provision first, flip the
/// payment to completed, then run the isolated post-provision effects.
#[derive(Clone)]
pub struct ReconcileService {
    users: UserRepository,
    payments: PaymentRepository,
    provision: ProvisionService,
    loyalty: LoyaltyService,
    promo: PromoService,
    referral: ReferralService,
    gifts: GiftService,
    notifier: NotificationService,
    yookassa: Option<YookassaClient>,
}

impl ReconcileService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        users: UserRepository,
        payments: PaymentRepository,
        provision: ProvisionService,
        loyalty: LoyaltyService,
        promo: PromoService,
        referral: ReferralService,
        gifts: GiftService,
        notifier: NotificationService,
        yookassa: Option<YookassaClient>,
    ) -> Self {
        Self { users, payments, provision, loyalty, promo, referral, gifts, notifier, yookassa }
    }

    /// Pre-commit answer for the Stars rail. Must reject unknown payloads,
    /// replays of completed payments, and amounts off by more than one unit.
    pub async fn pre_checkout(&self, invoice_payload: &str, total_amount: i64) -> PreCheckoutVerdict {
        match self.payments.get_by_payload(invoice_payload).await {
            Ok(payment) => pre_checkout_verdict(payment.as_ref(), total_amount),
            Err(e) => {
                error!("Pre-checkout lookup failed for '{}': {}", invoice_payload, e);
                PreCheckoutVerdict::UnknownPayment
            }
        }
    }

    /// Push confirmation from the Stars rail (the successful-payment event).
    pub async fn handle_stars_payment(
        &self,
        from_user: i64,
        invoice_payload: &str,
        total_amount: i64,
        charge_id: &str,
    ) -> Result<FinalizeOutcome> {
        let payment = match self.payments.get_by_payload(invoice_payload).await? {
            Some(p) => p,
            None => {
                error!("Payment not found for payload '{}'", invoice_payload);
                return Ok(FinalizeOutcome::UnknownPayment);
            }
        };

        if payment.is_completed() {
            warn!("Payment #{} already completed, confirming replay", payment.id);
            return Ok(FinalizeOutcome::AlreadyCompleted);
        }

        if let Some(parsed) = parse_stars_payload(invoice_payload) {
            if parsed.user_id != from_user {
                error!(
                    "User mismatch on payment #{}: payload={}, actual={}",
                    payment.id, parsed.user_id, from_user
                );
                return Ok(FinalizeOutcome::UnknownPayment);
            }
        }

        if (payment.amount - total_amount).abs() > payment.channel_kind().amount_tolerance() {
            error!(
                "Amount mismatch on payment #{}: expected {}, got {}",
                payment.id, payment.amount, total_amount
            );
            self.payments.mark_failed(payment.id).await?;
            return Ok(FinalizeOutcome::AmountMismatch);
        }

        // Record the capture before provisioning: a pending Stars row with a
        // charge id is what the recovery sweep re-drives.
        self.payments.set_external_id(payment.id, charge_id).await?;

        if invoice_payload.starts_with("gift:") {
            return self.finalize_gift(&payment).await;
        }
        self.finalize_provision(&payment).await
    }

    /// Pull confirmation for card/SBP: the user asks, the acquirer answers.
    pub async fn check_status(&self, payment_id: i64) -> Result<FinalizeOutcome> {
        let payment = match self.payments.get(payment_id).await? {
            Some(p) => p,
            None => return Ok(FinalizeOutcome::UnknownPayment),
        };

        if payment.is_completed() {
            return Ok(FinalizeOutcome::AlreadyCompleted);
        }

        let yookassa = match &self.yookassa {
            Some(c) => c,
            None => return Ok(FinalizeOutcome::UnknownPayment),
        };
        let external_id = match &payment.external_payment_id {
            Some(id) => id.clone(),
            None => return Ok(FinalizeOutcome::UnknownPayment),
        };

        let remote = yookassa.find_one(&external_id).await?;
        if !remote.is_final_success() {
            return Ok(FinalizeOutcome::NotPaidYet {
                status: remote.status.as_str().to_string(),
            });
        }

        // Ruble rails are checked exactly against the captured amount.
        if let Some(captured) = remote.amount_minor {
            if captured != payment.amount {
                error!(
                    "Captured amount mismatch on payment #{}: expected {}, got {}",
                    payment.id, payment.amount, captured
                );
                self.notifier
                    .notify_provision_failure(
                        payment.user_id,
                        payment.id,
                        &amount_label(&payment),
                        "captured amount differs from invoice",
                    )
                    .await;
                return Ok(FinalizeOutcome::AmountMismatch);
            }
        }

        self.finalize_provision(&payment).await
    }

    /// Background recovery for the Stars rail, which has no pull-status
    /// path: re-drives finalization for captured-but-unprovisioned payments
    /// older than a few minutes.
    pub async fn retry_stale_captured(&self, min_age: Duration) -> Result<usize> {
        let cutoff = Utc::now() - min_age;
        let stale = self.payments.stale_captured_stars(cutoff).await?;
        let mut recovered = 0;

        for payment in stale {
            info!("Retrying captured payment #{} ({})", payment.id, payment.invoice_payload);
            let outcome = if payment.invoice_payload.starts_with("gift:") {
                self.finalize_gift(&payment).await
            } else {
                self.finalize_provision(&payment).await
            };
            match outcome {
                Ok(FinalizeOutcome::Completed { .. }) | Ok(FinalizeOutcome::GiftCreated { .. }) => {
                    recovered += 1;
                }
                Ok(_) => {}
                Err(e) => warn!("Retry of payment #{} failed: {}", payment.id, e),
            }
        }

        Ok(recovered)
    }

    /// Common finalization: provision strictly before the status flip, flip
    /// strictly before effects. Effects never fail the purchase.
    async fn finalize_provision(&self, payment: &Payment) -> Result<FinalizeOutcome> {
        let user = self.users.get_or_create(payment.user_id, None).await?;

        let promo_bonus_days = match &payment.promo_code {
            Some(code) => self
                .promo
                .get(code)
                .await?
                .and_then(|p| p.bonus_days)
                .unwrap_or(0),
            None => 0,
        };
        let total_days = payment.subscription_days + promo_bonus_days;

        let provisioned = match self
            .provision
            .provision(payment.user_id, user.username.as_deref(), total_days)
            .await
        {
            Ok(p) => p,
            Err(e) => {
                // The money is real: the payment stays pending and a human
                // (or the background retry) picks it up.
                error!("Provisioning failed for payment #{}: {}", payment.id, e);
                self.notifier
                    .notify_provision_failure(
                        payment.user_id,
                        payment.id,
                        &amount_label(payment),
                        &e.to_string(),
                    )
                    .await;
                return Ok(FinalizeOutcome::ProvisionFailed);
            }
        };

        if !self
            .payments
            .mark_completed(payment.id, &provisioned.remote_user_id)
            .await?
        {
            // A concurrent finalizer beat us past provisioning; its result
            // stands and provisioning was idempotent either way.
            return Ok(FinalizeOutcome::AlreadyCompleted);
        }

        info!(
            "Payment #{} completed: user={} remote={}",
            payment.id, payment.user_id, provisioned.remote_user_id
        );

        self.run_effects(payment, &user.username, &provisioned).await;

        Ok(FinalizeOutcome::Completed {
            remote_user_id: provisioned.remote_user_id,
            subscription_url: provisioned.subscription_url,
            expire_iso: to_utc_iso(provisioned.new_expiry),
            months: (payment.subscription_days / 30).max(1) as u32,
        })
    }

    /// Post-provision effects, each isolated: loyalty accrual, promo
    /// consumption, referral grant, user and admin notifications.
    async fn run_effects(
        &self,
        payment: &Payment,
        username: &Option<String>,
        provisioned: &crate::services::provision_service::Provisioned,
    ) {
        let channel = payment.channel_kind();

        if let Err(e) = self
            .loyalty
            .record_payment(payment.user_id, channel, payment.amount)
            .await
        {
            warn!("Loyalty accrual failed for payment #{}: {}", payment.id, e);
        }

        if let Some(code) = &payment.promo_code {
            self.promo.consume_after_purchase(code, payment.user_id).await;
        }

        match self.referral.grant_once(payment.user_id).await {
            Ok(Some(grant)) => {
                self.notifier
                    .notify_referral_bonus(
                        grant.referrer_id,
                        grant.referrer_username.as_deref(),
                        payment.user_id,
                        grant.bonus_days,
                        grant.new_expiry.as_deref(),
                    )
                    .await;
            }
            Ok(None) => {}
            Err(e) => warn!("Referral grant failed for payment #{}: {}", payment.id, e),
        }

        let expire_iso = to_utc_iso(provisioned.new_expiry);
        self.notifier
            .notify_payment_success(
                payment.user_id,
                username.as_deref(),
                (payment.subscription_days / 30).max(1) as u32,
                &amount_label(payment),
                &provisioned.remote_user_id,
                &expire_iso,
                provisioned.subscription_url.as_deref(),
            )
            .await;
    }

    /// Gift purchases skip provisioning: the paid outcome is an active gift
    /// code, redeemed later by someone else.
    async fn finalize_gift(&self, payment: &Payment) -> Result<FinalizeOutcome> {
        let gift = match self
            .gifts
            .create_paid_gift(payment.user_id, payment.subscription_days, payment.amount, &payment.channel)
            .await
        {
            Ok(g) => g,
            Err(e) => {
                error!("Gift creation failed for payment #{}: {}", payment.id, e);
                self.notifier
                    .notify_provision_failure(
                        payment.user_id,
                        payment.id,
                        &amount_label(payment),
                        &e.to_string(),
                    )
                    .await;
                return Ok(FinalizeOutcome::ProvisionFailed);
            }
        };

        if !self.payments.mark_gift_completed(payment.id).await? {
            return Ok(FinalizeOutcome::AlreadyCompleted);
        }

        info!("Gift payment #{} completed: code={}", payment.id, gift.code);

        self.notifier
            .notify_gift_purchase(
                payment.user_id,
                &gift.code,
                gift.subscription_days,
                &amount_label(payment),
            )
            .await;

        Ok(FinalizeOutcome::GiftCreated {
            code: gift.code,
            subscription_days: gift.subscription_days,
        })
    }
}

pub fn pre_checkout_verdict(payment: Option<&Payment>, total_amount: i64) -> PreCheckoutVerdict {
    match payment {
        None => PreCheckoutVerdict::UnknownPayment,
        Some(p) if p.is_completed() => PreCheckoutVerdict::AlreadyProcessed,
        Some(p) if (p.amount - total_amount).abs() > p.channel_kind().amount_tolerance() => {
            PreCheckoutVerdict::AmountMismatch
        }
        Some(_) => PreCheckoutVerdict::Approve,
    }
}

pub fn amount_label(payment: &Payment) -> String {
    match payment.channel_kind() {
        PaymentChannel::Stars => format!("{} ⭐", payment.amount),
        PaymentChannel::Card | PaymentChannel::Sbp => {
            format!("{}.{:02} ₽", payment.amount / 100, payment.amount % 100)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn payment(channel: &str, amount: i64, status: &str) -> Payment {
        Payment {
            id: 1,
            user_id: 100,
            channel: channel.to_string(),
            amount,
            status: status.to_string(),
            subscription_days: 90,
            promo_code: None,
            invoice_payload: "100:3:250:".to_string(),
            external_payment_id: None,
            external_confirmation_url: None,
            remote_user_id: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn unknown_payload_rejected() {
        assert_eq!(pre_checkout_verdict(None, 250), PreCheckoutVerdict::UnknownPayment);
    }

    #[test]
    fn completed_payment_rejected_on_replay() {
        let p = payment("stars", 250, "completed");
        assert_eq!(pre_checkout_verdict(Some(&p), 250), PreCheckoutVerdict::AlreadyProcessed);
    }

    #[test]
    fn stars_tolerates_one_unit_of_rounding() {
        let p = payment("stars", 250, "pending");
        assert_eq!(pre_checkout_verdict(Some(&p), 250), PreCheckoutVerdict::Approve);
        assert_eq!(pre_checkout_verdict(Some(&p), 249), PreCheckoutVerdict::Approve);
        assert_eq!(pre_checkout_verdict(Some(&p), 251), PreCheckoutVerdict::Approve);
        assert_eq!(pre_checkout_verdict(Some(&p), 252), PreCheckoutVerdict::AmountMismatch);
        assert_eq!(pre_checkout_verdict(Some(&p), 248), PreCheckoutVerdict::AmountMismatch);
    }

    #[test]
    fn ruble_rails_are_exact() {
        let p = payment("card", 50_000, "pending");
        assert_eq!(pre_checkout_verdict(Some(&p), 50_000), PreCheckoutVerdict::Approve);
        assert_eq!(pre_checkout_verdict(Some(&p), 49_999), PreCheckoutVerdict::AmountMismatch);
    }

    #[test]
    fn amount_labels() {
        assert_eq!(amount_label(&payment("stars", 250, "pending")), "250 ⭐");
        assert_eq!(amount_label(&payment("sbp", 198_000, "pending")), "1980.00 ₽");
    }
}
