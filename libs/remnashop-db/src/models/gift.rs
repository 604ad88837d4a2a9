use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GiftCode {
    pub id: i64,
    pub code: String,
    pub purchaser_id: i64,
    pub recipient_id: Option<i64>,
    pub subscription_days: i64,
    pub amount: i64,
    pub channel: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GiftStatus {
    Active,
    Redeemed,
    Expired,
}

impl GiftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GiftStatus::Active => "active",
            GiftStatus::Redeemed => "redeemed",
            GiftStatus::Expired => "expired",
        }
    }
}
