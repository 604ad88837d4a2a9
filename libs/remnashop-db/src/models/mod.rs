pub mod gift;
pub mod payment;
pub mod promo;
pub mod referral;
pub mod user;

pub use gift::{GiftCode, GiftStatus};
pub use payment::{Payment, PaymentChannel, PaymentStatus};
pub use promo::{PromoCode, PromoCodeUsage};
pub use referral::Referral;
pub use user::{BotUser, LoyaltyProfile, LoyaltyTier};
