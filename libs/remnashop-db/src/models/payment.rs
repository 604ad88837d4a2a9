use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One purchase attempt. The row is the single source of truth for the
/// purchase state: `completed` rows always carry `remote_user_id` and
/// `completed_at`, and never change again.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: i64,
    pub user_id: i64,
    pub channel: String,
    /// Stars for the stars channel, minor rubles otherwise.
    pub amount: i64,
    pub status: String,
    pub subscription_days: i64,
    pub promo_code: Option<String>,
    pub invoice_payload: String,
    pub external_payment_id: Option<String>,
    pub external_confirmation_url: Option<String>,
    pub remote_user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn channel_kind(&self) -> PaymentChannel {
        self.channel.parse().unwrap_or(PaymentChannel::Stars)
    }

    pub fn is_completed(&self) -> bool {
        self.status == PaymentStatus::Completed.as_str()
    }

    pub fn is_pending(&self) -> bool {
        self.status == PaymentStatus::Pending.as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentChannel {
    Stars,
    Card,
    Sbp,
}

impl PaymentChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentChannel::Stars => "stars",
            PaymentChannel::Card => "card",
            PaymentChannel::Sbp => "sbp",
        }
    }

    /// Stars amounts tolerate ±1 unit of rounding drift; ruble rails are
    /// checked exactly.
    pub fn amount_tolerance(&self) -> i64 {
        match self {
            PaymentChannel::Stars => 1,
            PaymentChannel::Card | PaymentChannel::Sbp => 0,
        }
    }
}

impl std::str::FromStr for PaymentChannel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stars" => Ok(PaymentChannel::Stars),
            "card" => Ok(PaymentChannel::Card),
            "sbp" => Ok(PaymentChannel::Sbp),
            _ => Err(()),
        }
    }
}
