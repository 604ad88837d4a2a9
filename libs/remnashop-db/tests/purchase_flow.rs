//! Store-level walkthrough of the purchase lifecycle: invoice row →
//! capture → completion → post-provision bookkeeping, plus the replay and
//! once-only guarantees the reconciler leans on.

use remnashop_db::db::init_db;
use remnashop_db::models::{LoyaltyTier, PaymentChannel};
use remnashop_db::repositories::{
    GiftRepository, PaymentRepository, PromoRepository, ReferralRepository, UserRepository,
};

struct Store {
    users: UserRepository,
    payments: PaymentRepository,
    promos: PromoRepository,
    referrals: ReferralRepository,
    gifts: GiftRepository,
}

async fn store() -> Store {
    let pool = init_db("sqlite::memory:").await.unwrap();
    Store {
        users: UserRepository::new(pool.clone()),
        payments: PaymentRepository::new(pool.clone()),
        promos: PromoRepository::new(pool.clone()),
        referrals: ReferralRepository::new(pool.clone()),
        gifts: GiftRepository::new(pool.clone()),
    }
}

#[tokio::test]
async fn stars_purchase_for_new_user() {
    let s = store().await;
    s.users.get_or_create(100, Some("alice")).await.unwrap();

    // C2: pending row keyed by the invoice payload.
    let (payment, reused) = s
        .payments
        .create_or_reuse(100, PaymentChannel::Stars, 250, 90, None, "100:3:250:")
        .await
        .unwrap();
    assert!(!reused);
    assert!(payment.is_pending());

    // C3: capture recorded, then provisioning succeeds and the row flips.
    s.payments.set_external_id(payment.id, "charge-1").await.unwrap();
    assert!(s.payments.mark_completed(payment.id, "remote-uuid-1").await.unwrap());
    s.users.set_remote_user_id(100, "remote-uuid-1").await.unwrap();

    let row = s.payments.get(payment.id).await.unwrap().unwrap();
    assert!(row.is_completed());
    assert_eq!(row.remote_user_id.as_deref(), Some("remote-uuid-1"));
    assert!(row.completed_at.is_some());

    let user = s.users.get(100).await.unwrap().unwrap();
    assert_eq!(user.remote_user_id.as_deref(), Some("remote-uuid-1"));

    // Replay of the same confirmation mutates nothing.
    assert!(!s.payments.mark_completed(payment.id, "remote-uuid-2").await.unwrap());
}

#[tokio::test]
async fn promo_and_referral_effects_after_completion() {
    let s = store().await;
    s.users.get_or_create(100, Some("referrer")).await.unwrap();
    s.users.get_or_create(200, Some("buyer")).await.unwrap();
    s.users.set_referrer(200, 100).await.unwrap();
    s.users.set_remote_user_id(100, "remote-referrer").await.unwrap();
    s.referrals.create_pair(100, 200).await.unwrap();
    s.promos.create("SAVE10", Some(10), Some(2), Some(100), None).await.unwrap();

    let (payment, _) = s
        .payments
        .create_or_reuse(200, PaymentChannel::Sbp, 198_000, 180, Some("SAVE10"), "yookassa:200:6:sbp:SAVE10")
        .await
        .unwrap();
    assert!(s.payments.mark_completed(payment.id, "remote-buyer").await.unwrap());

    // Promo usage recorded once.
    assert!(s.promos.consume("SAVE10", 200).await.unwrap());
    let promo = s.promos.get("SAVE10").await.unwrap().unwrap();
    assert_eq!(promo.current_uses, 1);

    // Referral grant fires exactly once across any number of payments.
    assert!(s.referrals.try_grant(100, 200, 3).await.unwrap());
    assert!(!s.referrals.try_grant(100, 200, 3).await.unwrap());
    assert_eq!(
        s.referrals.get_pair(100, 200).await.unwrap().unwrap().bonus_days_granted,
        3
    );

    // Loyalty accrual: 1980 ₽ of points, tier re-derived.
    let profile = s.users.add_loyalty_points(200, 1980).await.unwrap();
    assert_eq!(profile.points, 1980);
    assert_eq!(profile.tier, LoyaltyTier::Gold);
}

#[tokio::test]
async fn trial_is_single_use_and_grants_referral_once() {
    let s = store().await;
    s.users.get_or_create(100, Some("referrer")).await.unwrap();
    s.users.get_or_create(200, Some("fresh")).await.unwrap();
    s.users.set_referrer(200, 100).await.unwrap();
    s.referrals.create_pair(100, 200).await.unwrap();

    let user = s.users.get(200).await.unwrap().unwrap();
    assert!(!user.trial_used);

    s.users.mark_trial_used(200).await.unwrap();
    s.users.set_remote_user_id(200, "remote-trial").await.unwrap();
    assert!(s.referrals.try_grant(100, 200, 3).await.unwrap());

    // Re-entry: flag already set, grant already spent.
    let user = s.users.get(200).await.unwrap().unwrap();
    assert!(user.trial_used);
    assert!(!s.referrals.try_grant(100, 200, 3).await.unwrap());

    // A later paid purchase of the same referred user cannot re-grant.
    let (payment, _) = s
        .payments
        .create_or_reuse(200, PaymentChannel::Stars, 250, 90, None, "200:3:250:")
        .await
        .unwrap();
    s.payments.mark_completed(payment.id, "remote-trial").await.unwrap();
    assert!(!s.referrals.try_grant(100, 200, 3).await.unwrap());
}

#[tokio::test]
async fn gift_purchase_and_redemption() {
    let s = store().await;
    s.users.get_or_create(100, Some("buyer")).await.unwrap();
    s.users.get_or_create(300, Some("friend")).await.unwrap();

    let (payment, _) = s
        .payments
        .create_or_reuse(100, PaymentChannel::Stars, 450, 180, None, "gift:100:6:450")
        .await
        .unwrap();

    // Gift finalization: code instead of provisioning.
    let gift = s.gifts.create(100, 180, 450, "stars").await.unwrap();
    assert!(s.payments.mark_gift_completed(payment.id).await.unwrap());
    assert_eq!(gift.status, "active");
    assert!(gift.recipient_id.is_none());

    // Redemption flips the code exactly once.
    assert!(s.gifts.redeem(&gift.code, 300).await.unwrap());
    assert!(!s.gifts.redeem(&gift.code, 300).await.unwrap());
    let redeemed = s.gifts.get_by_code(&gift.code).await.unwrap().unwrap();
    assert_eq!(redeemed.status, "redeemed");
    assert_eq!(redeemed.recipient_id, Some(300));
}

#[tokio::test]
async fn provision_failure_leaves_payment_pending() {
    let s = store().await;
    s.users.get_or_create(100, None).await.unwrap();

    let (payment, _) = s
        .payments
        .create_or_reuse(100, PaymentChannel::Stars, 250, 90, None, "100:3:250:")
        .await
        .unwrap();
    s.payments.set_external_id(payment.id, "charge-9").await.unwrap();

    // Provisioning failed: no status transition happens. The sweep finds it.
    let stale = s
        .payments
        .stale_captured_stars(chrono::Utc::now() + chrono::Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(stale.len(), 1);
    assert!(stale[0].is_pending());

    // A later retry completes it.
    assert!(s.payments.mark_completed(payment.id, "remote-late").await.unwrap());
    let stale = s
        .payments
        .stale_captured_stars(chrono::Utc::now() + chrono::Duration::minutes(1))
        .await
        .unwrap();
    assert!(stale.is_empty());
}
