use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BotUser {
    pub telegram_id: i64,
    pub username: Option<String>,
    pub locale: String,
    pub registered_at: DateTime<Utc>,
    pub trial_used: bool,
    pub referrer_id: Option<i64>,
    pub remote_user_id: Option<String>,
    pub auto_renewal: bool,
    pub last_renewal_notification_at: Option<DateTime<Utc>>,
    pub loyalty_points: i64,
    pub loyalty_tier: String,
    pub total_spent: i64,
}

impl BotUser {
    pub fn tier(&self) -> LoyaltyTier {
        self.loyalty_tier.parse().unwrap_or(LoyaltyTier::Bronze)
    }
}

/// Discount band derived from cumulative spend points. Thresholds are
/// cumulative points, 1 point per ruble-equivalent unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LoyaltyTier {
    Bronze,
    Silver,
    Gold,
    Platinum,
}

impl LoyaltyTier {
    pub fn from_points(points: i64) -> Self {
        if points >= 2500 {
            LoyaltyTier::Platinum
        } else if points >= 1000 {
            LoyaltyTier::Gold
        } else if points >= 250 {
            LoyaltyTier::Silver
        } else {
            LoyaltyTier::Bronze
        }
    }

    pub fn discount_percent(&self) -> u32 {
        match self {
            LoyaltyTier::Bronze => 0,
            LoyaltyTier::Silver => 5,
            LoyaltyTier::Gold => 10,
            LoyaltyTier::Platinum => 15,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoyaltyTier::Bronze => "bronze",
            LoyaltyTier::Silver => "silver",
            LoyaltyTier::Gold => "gold",
            LoyaltyTier::Platinum => "platinum",
        }
    }

    /// Points still needed for the next tier, None at the top.
    pub fn next_threshold(&self) -> Option<i64> {
        match self {
            LoyaltyTier::Bronze => Some(250),
            LoyaltyTier::Silver => Some(1000),
            LoyaltyTier::Gold => Some(2500),
            LoyaltyTier::Platinum => None,
        }
    }
}

impl std::str::FromStr for LoyaltyTier {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bronze" => Ok(LoyaltyTier::Bronze),
            "silver" => Ok(LoyaltyTier::Silver),
            "gold" => Ok(LoyaltyTier::Gold),
            "platinum" => Ok(LoyaltyTier::Platinum),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoyaltyProfile {
    pub points: i64,
    pub tier: LoyaltyTier,
    pub total_spent: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_thresholds() {
        assert_eq!(LoyaltyTier::from_points(0), LoyaltyTier::Bronze);
        assert_eq!(LoyaltyTier::from_points(249), LoyaltyTier::Bronze);
        assert_eq!(LoyaltyTier::from_points(250), LoyaltyTier::Silver);
        assert_eq!(LoyaltyTier::from_points(999), LoyaltyTier::Silver);
        assert_eq!(LoyaltyTier::from_points(1000), LoyaltyTier::Gold);
        assert_eq!(LoyaltyTier::from_points(2500), LoyaltyTier::Platinum);
    }

    #[test]
    fn tier_ordering_matches_thresholds() {
        assert!(LoyaltyTier::Platinum > LoyaltyTier::Gold);
        assert!(LoyaltyTier::Gold > LoyaltyTier::Silver);
        assert!(LoyaltyTier::Silver > LoyaltyTier::Bronze);
    }
}
