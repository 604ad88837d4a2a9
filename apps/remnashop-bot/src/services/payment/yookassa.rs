use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

const API_URL: &str = "https://api.yookassa.ru/v3/payments";

/// Payment lifecycle on the acquirer side. `Succeeded` together with
/// `paid = true` is the only state that finalizes a purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YookassaStatus {
    Pending,
    WaitingForCapture,
    Succeeded,
    Canceled,
    Unknown,
}

impl YookassaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            YookassaStatus::Pending => "pending",
            YookassaStatus::WaitingForCapture => "waiting_for_capture",
            YookassaStatus::Succeeded => "succeeded",
            YookassaStatus::Canceled => "canceled",
            YookassaStatus::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "pending" => YookassaStatus::Pending,
            "waiting_for_capture" => YookassaStatus::WaitingForCapture,
            "succeeded" => YookassaStatus::Succeeded,
            "canceled" => YookassaStatus::Canceled,
            _ => YookassaStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct YookassaPayment {
    pub id: String,
    pub status: YookassaStatus,
    pub paid: bool,
    /// Captured amount in minor rubles, when the response carries one.
    pub amount_minor: Option<i64>,
    pub confirmation_url: Option<String>,
    /// Raw QR payload for the SBP rail, when the acquirer returns one.
    pub qr_data: Option<String>,
}

impl YookassaPayment {
    fn from_value(body: &Value) -> Result<Self> {
        let id = body
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("YooKassa response without id: {}", body))?
            .to_string();
        let status = YookassaStatus::parse(body.get("status").and_then(|v| v.as_str()).unwrap_or(""));
        let paid = body.get("paid").and_then(|v| v.as_bool()).unwrap_or(false);
        let amount_minor = body
            .pointer("/amount/value")
            .and_then(|v| v.as_str())
            .and_then(parse_amount_minor);
        let confirmation = body.get("confirmation");
        let confirmation_url = confirmation
            .and_then(|c| c.get("confirmation_url"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let qr_data = confirmation
            .and_then(|c| {
                c.get("confirmation_data")
                    .or_else(|| c.get("qr_data"))
            })
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        Ok(Self { id, status, paid, amount_minor, confirmation_url, qr_data })
    }

    pub fn is_final_success(&self) -> bool {
        self.status == YookassaStatus::Succeeded && self.paid
    }
}

/// Minimal YooKassa REST client: create a capture-on-payment invoice and
/// fetch its authoritative status by id.
#[derive(Clone)]
pub struct YookassaClient {
    client: Client,
    shop_id: String,
    secret_key: String,
}

impl YookassaClient {
    pub fn new(shop_id: String, secret_key: String) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self { client, shop_id, secret_key }
    }

    pub async fn create_payment(
        &self,
        amount_minor: i64,
        description: &str,
        confirmation_type: &str,
        return_url: &str,
        metadata: Value,
    ) -> Result<YookassaPayment> {
        if amount_minor < 100 {
            return Err(anyhow!("Amount too small: {} kopecks, minimum is 1 RUB", amount_minor));
        }

        let body = json!({
            "amount": { "value": format_amount(amount_minor), "currency": "RUB" },
            "confirmation": { "type": confirmation_type, "return_url": return_url },
            "capture": true,
            "description": description,
            "metadata": metadata,
        });

        info!(
            "Creating YooKassa payment: {} RUB, confirmation={}",
            format_amount(amount_minor),
            confirmation_type
        );

        let resp = self
            .client
            .post(API_URL)
            .basic_auth(&self.shop_id, Some(&self.secret_key))
            .header("Idempotence-Key", uuid::Uuid::new_v4().to_string())
            .json(&body)
            .send()
            .await
            .context("YooKassa create request failed")?;

        let status = resp.status();
        let body: Value = resp.json().await.context("YooKassa returned non-JSON")?;
        if !status.is_success() {
            warn!("YooKassa create error {}: {}", status, body);
            return Err(anyhow!("YooKassa error {}: {}", status, body));
        }

        YookassaPayment::from_value(&body)
    }

    /// Authoritative status lookup by the acquirer-side payment id.
    pub async fn find_one(&self, payment_id: &str) -> Result<YookassaPayment> {
        let resp = self
            .client
            .get(format!("{}/{}", API_URL, payment_id))
            .basic_auth(&self.shop_id, Some(&self.secret_key))
            .send()
            .await
            .context("YooKassa status request failed")?;

        let status = resp.status();
        let body: Value = resp.json().await.context("YooKassa returned non-JSON")?;
        if !status.is_success() {
            return Err(anyhow!("YooKassa status error {}: {}", status, body));
        }

        YookassaPayment::from_value(&body)
    }
}

/// "1980.00" -> 198000. The acquirer always formats two decimals.
pub fn parse_amount_minor(value: &str) -> Option<i64> {
    let (rubles, kopecks) = match value.split_once('.') {
        Some((r, k)) => (r, k),
        None => (value, "0"),
    };
    let rubles: i64 = rubles.parse().ok()?;
    let kopecks: i64 = format!("{:0<2}", kopecks).get(..2)?.parse().ok()?;
    Some(rubles * 100 + kopecks)
}

fn format_amount(amount_minor: i64) -> String {
    format!("{}.{:02}", amount_minor / 100, amount_minor % 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_round_trips() {
        assert_eq!(format_amount(198_000), "1980.00");
        assert_eq!(format_amount(50), "0.50");
        assert_eq!(parse_amount_minor("1980.00"), Some(198_000));
        assert_eq!(parse_amount_minor("0.5"), Some(50));
        assert_eq!(parse_amount_minor("500"), Some(50_000));
        assert_eq!(parse_amount_minor("abc"), None);
    }

    #[test]
    fn status_lifecycle_parses() {
        assert_eq!(YookassaStatus::parse("pending"), YookassaStatus::Pending);
        assert_eq!(YookassaStatus::parse("waiting_for_capture"), YookassaStatus::WaitingForCapture);
        assert_eq!(YookassaStatus::parse("succeeded"), YookassaStatus::Succeeded);
        assert_eq!(YookassaStatus::parse("canceled"), YookassaStatus::Canceled);
        assert_eq!(YookassaStatus::parse("???"), YookassaStatus::Unknown);
    }

    #[test]
    fn payment_parses_redirect_confirmation() {
        let body = serde_json::json!({
            "id": "2d1f...",
            "status": "pending",
            "paid": false,
            "amount": { "value": "500.00", "currency": "RUB" },
            "confirmation": { "type": "redirect", "confirmation_url": "https://yookassa.ru/checkout/x" }
        });
        let p = YookassaPayment::from_value(&body).unwrap();
        assert_eq!(p.status, YookassaStatus::Pending);
        assert_eq!(p.amount_minor, Some(50_000));
        assert_eq!(p.confirmation_url.as_deref(), Some("https://yookassa.ru/checkout/x"));
        assert!(p.qr_data.is_none());
        assert!(!p.is_final_success());
    }

    #[test]
    fn payment_parses_qr_confirmation() {
        let body = serde_json::json!({
            "id": "2d1f...",
            "status": "succeeded",
            "paid": true,
            "confirmation": { "type": "qr", "confirmation_data": "https://qr.nspk.ru/AS10..." }
        });
        let p = YookassaPayment::from_value(&body).unwrap();
        assert_eq!(p.qr_data.as_deref(), Some("https://qr.nspk.ru/AS10..."));
        assert!(p.is_final_success());
    }
}
