use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use remnashop_db::models::{LoyaltyProfile, PaymentChannel, PromoCode};
use remnashop_db::repositories::UserRepository;

use crate::config::Settings;

/// Rough Stars-to-ruble rate used only for loyalty point accrual, so Stars
/// purchases earn points comparable to the ruble rails.
const STARS_TO_RUB: f64 = 1.85;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Currency {
    Stars,
    RubMinor,
}

#[derive(Debug, Clone)]
pub struct PriceQuote {
    pub months: u32,
    pub subscription_days: i64,
    pub currency: Currency,
    pub base_amount: i64,
    pub final_amount: i64,
    pub discount_amount: i64,
    pub promo_bonus_days: i64,
}

#[derive(Clone)]
pub struct LoyaltyService {
    settings: Arc<Settings>,
    users: UserRepository,
}

impl LoyaltyService {
    pub fn new(settings: Arc<Settings>, users: UserRepository) -> Self {
        Self { settings, users }
    }

    /// Resolves the final price for (user, period, channel, promo). The tier
    /// discount applies first, a valid promo discount multiplies on top, and
    /// the result never drops below one unit. The Stars amount is scaled by
    /// the ruble discount ratio so both channels stay proportional.
    pub async fn quote(
        &self,
        telegram_id: i64,
        months: u32,
        channel: PaymentChannel,
        promo: Option<&PromoCode>,
    ) -> Result<PriceQuote> {
        let rub_base = self
            .settings
            .rub_prices
            .for_months(months)
            .ok_or_else(|| anyhow::anyhow!("Invalid subscription period: {} months", months))?;
        let stars_base = self
            .settings
            .stars_prices
            .for_months(months)
            .ok_or_else(|| anyhow::anyhow!("Invalid subscription period: {} months", months))?;

        let tier = self.users.loyalty_profile(telegram_id).await?.tier;
        let promo_pct = promo
            .and_then(|p| p.discount_percent)
            .unwrap_or(0)
            .clamp(0, 100) as u32;
        let promo_bonus_days = promo.and_then(|p| p.bonus_days).unwrap_or(0);

        let (rub_final, stars_final) =
            discounted_amounts(rub_base, stars_base, tier.discount_percent(), promo_pct);

        let (currency, base_amount, final_amount) = match channel {
            PaymentChannel::Stars => (Currency::Stars, stars_base, stars_final),
            PaymentChannel::Card | PaymentChannel::Sbp => (Currency::RubMinor, rub_base, rub_final),
        };

        Ok(PriceQuote {
            months,
            subscription_days: months as i64 * 30,
            currency,
            base_amount,
            final_amount,
            discount_amount: base_amount - final_amount,
            promo_bonus_days,
        })
    }

    /// Credits points for a completed payment (1 point per ruble-equivalent)
    /// and re-derives the tier. Returns the new profile and whether the tier
    /// went up.
    pub async fn record_payment(
        &self,
        telegram_id: i64,
        channel: PaymentChannel,
        amount: i64,
    ) -> Result<(LoyaltyProfile, bool)> {
        let points = rub_equivalent(channel, amount);
        let before = self.users.loyalty_profile(telegram_id).await?.tier;
        let profile = self.users.add_loyalty_points(telegram_id, points).await?;
        let upgraded = profile.tier > before;
        if upgraded {
            info!(
                "Loyalty tier upgrade for {}: {} -> {}",
                telegram_id,
                before.as_str(),
                profile.tier.as_str()
            );
        }
        Ok((profile, upgraded))
    }

    pub async fn profile(&self, telegram_id: i64) -> Result<LoyaltyProfile> {
        self.users.loyalty_profile(telegram_id).await
    }
}

/// Applies tier and promo discounts to the ruble base, then scales the Stars
/// base by the same ratio. Both results are clamped to at least one unit.
pub fn discounted_amounts(rub_base: i64, stars_base: i64, tier_pct: u32, promo_pct: u32) -> (i64, i64) {
    let multiplier = (1.0 - tier_pct as f64 / 100.0) * (1.0 - promo_pct as f64 / 100.0);
    let rub_final = ((rub_base as f64 * multiplier).round() as i64).max(1);
    let ratio = rub_final as f64 / rub_base as f64;
    let stars_final = ((stars_base as f64 * ratio).round() as i64).max(1);
    (rub_final, stars_final)
}

/// Loyalty points for a payment: minor rubles convert to whole rubles,
/// Stars convert at the fixed rate.
pub fn rub_equivalent(channel: PaymentChannel, amount: i64) -> i64 {
    match channel {
        PaymentChannel::Stars => (amount as f64 * STARS_TO_RUB).round() as i64,
        PaymentChannel::Card | PaymentChannel::Sbp => amount / 100,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_discount_passes_through() {
        let (rub, stars) = discounted_amounts(220_000, 297, 0, 0);
        assert_eq!(rub, 220_000);
        assert_eq!(stars, 297);
    }

    #[test]
    fn promo_discount_applies_to_both_channels() {
        // 2200 RUB with 10% promo -> 1980 RUB, Stars scaled by the same ratio.
        let (rub, stars) = discounted_amounts(220_000, 297, 0, 10);
        assert_eq!(rub, 198_000);
        assert_eq!(stars, 267);
    }

    #[test]
    fn tier_and_promo_stack_multiplicatively() {
        // 15% tier then 10% promo: 1000 * 0.85 * 0.9 = 765.
        let (rub, _) = discounted_amounts(1000, 100, 15, 10);
        assert_eq!(rub, 765);
    }

    #[test]
    fn amounts_clamp_to_one_unit() {
        let (rub, stars) = discounted_amounts(1, 1, 15, 100);
        assert_eq!(rub, 1);
        assert_eq!(stars, 1);
    }

    #[test]
    fn point_accrual_is_rub_equivalent() {
        assert_eq!(rub_equivalent(PaymentChannel::Card, 50_000), 500);
        assert_eq!(rub_equivalent(PaymentChannel::Sbp, 198_000), 1980);
        assert_eq!(rub_equivalent(PaymentChannel::Stars, 100), 185);
    }
}
