use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Admin-issued code granting a percent discount, bonus days, or both.
/// Codes are stored canonically uppercase.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PromoCode {
    pub code: String,
    pub discount_percent: Option<i64>,
    pub bonus_days: Option<i64>,
    pub max_uses: Option<i64>,
    pub current_uses: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl PromoCode {
    /// Advisory validity check used at pricing time. The authoritative
    /// re-check happens inside the atomic consume.
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        if let Some(expiry) = self.expires_at {
            if expiry <= now {
                return false;
            }
        }
        if let Some(max) = self.max_uses {
            if self.current_uses >= max {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PromoCodeUsage {
    pub id: i64,
    pub code: String,
    pub user_id: i64,
    pub used_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn promo() -> PromoCode {
        PromoCode {
            code: "SAVE10".into(),
            discount_percent: Some(10),
            bonus_days: Some(2),
            max_uses: Some(5),
            current_uses: 0,
            expires_at: None,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn usable_when_active_and_under_cap() {
        assert!(promo().is_usable(Utc::now()));
    }

    #[test]
    fn not_usable_when_exhausted() {
        let mut p = promo();
        p.current_uses = 5;
        assert!(!p.is_usable(Utc::now()));
    }

    #[test]
    fn not_usable_when_expired_or_inactive() {
        let now = Utc::now();
        let mut p = promo();
        p.expires_at = Some(now - Duration::hours(1));
        assert!(!p.is_usable(now));

        let mut p = promo();
        p.is_active = false;
        assert!(!p.is_usable(now));
    }
}
