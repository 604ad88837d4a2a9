use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One (referrer, referred) pair. `bonus_days_granted` doubles as the
/// granted-once sentinel: it flips from zero to the configured bonus
/// exactly once across the lifetime of the pair.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Referral {
    pub id: i64,
    pub referrer_id: i64,
    pub referred_id: i64,
    pub bonus_days_granted: i64,
    pub registered_at: DateTime<Utc>,
}
