use anyhow::{anyhow, Context, Result};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

use remnashop_db::models::{PaymentChannel, PromoCode};
use remnashop_db::repositories::PaymentRepository;

use crate::config::Settings;
use crate::services::loyalty_service::{Currency, LoyaltyService, PriceQuote};
use crate::services::payment::YookassaClient;
use crate::services::promo_service::PromoService;

/// What the driver hands the user to pay with: a deep link for Stars, a
/// hosted checkout URL for cards, a URL plus QR image for SBP.
#[derive(Debug, Clone)]
pub struct PayableArtifact {
    pub payment_id: i64,
    pub channel: PaymentChannel,
    pub amount: i64,
    pub url: String,
    pub qr_png: Option<Vec<u8>>,
    pub quote: PriceQuote,
}

/// Creates the pending payment row and the external invoice on the chosen
/// PSP. Repeated calls with identical inputs inside the pending window
/// return the same external invoice — the payload is the idempotency key.
#[derive(Clone)]
pub struct InvoiceService {
    settings: Arc<Settings>,
    payments: PaymentRepository,
    loyalty: LoyaltyService,
    promo: PromoService,
    yookassa: Option<YookassaClient>,
    http: reqwest::Client,
}

impl InvoiceService {
    pub fn new(
        settings: Arc<Settings>,
        payments: PaymentRepository,
        loyalty: LoyaltyService,
        promo: PromoService,
        yookassa: Option<YookassaClient>,
    ) -> Self {
        Self {
            settings,
            payments,
            loyalty,
            promo,
            yookassa,
            http: reqwest::Client::new(),
        }
    }

    pub async fn create_invoice(
        &self,
        user_id: i64,
        months: u32,
        channel: PaymentChannel,
        promo_code: Option<&str>,
    ) -> Result<PayableArtifact> {
        let promo = self.resolve_promo(promo_code).await?;
        let quote = self.loyalty.quote(user_id, months, channel, promo.as_ref()).await?;

        let promo_canonical = promo.as_ref().map(|p| p.code.clone());
        let payload = build_payload(channel, user_id, months, quote.final_amount, promo_canonical.as_deref());

        self.create_from_quote(user_id, channel, &quote, promo_canonical.as_deref(), &payload, false)
            .await
    }

    /// Gift purchase: same invoice flow, gift-tagged payload. Only the Stars
    /// rail sells gifts (matching the reconciler's gift finalization path).
    pub async fn create_gift_invoice(&self, user_id: i64, months: u32) -> Result<PayableArtifact> {
        let quote = self
            .loyalty
            .quote(user_id, months, PaymentChannel::Stars, None)
            .await?;
        let payload = format!("gift:{}:{}:{}", user_id, months, quote.final_amount);
        self.create_from_quote(user_id, PaymentChannel::Stars, &quote, None, &payload, true)
            .await
    }

    /// Advisory promo check for the driver: Some when currently usable.
    pub async fn promo_for_display(&self, code: &str) -> Result<Option<PromoCode>> {
        self.promo.validate(code).await
    }

    async fn resolve_promo(&self, code: Option<&str>) -> Result<Option<PromoCode>> {
        match code {
            None => Ok(None),
            Some(raw) => match self.promo.validate(raw).await? {
                Some(promo) => Ok(Some(promo)),
                None => Err(anyhow!("Promo code '{}' is not valid", raw.trim().to_uppercase())),
            },
        }
    }

    async fn create_from_quote(
        &self,
        user_id: i64,
        channel: PaymentChannel,
        quote: &PriceQuote,
        promo_code: Option<&str>,
        base_payload: &str,
        gift: bool,
    ) -> Result<PayableArtifact> {
        let (payment, reused) = self
            .payments
            .create_or_reuse(
                user_id,
                channel,
                quote.final_amount,
                quote.subscription_days,
                promo_code,
                base_payload,
            )
            .await?;

        // Same inputs inside the pending window: hand back the invoice that
        // is already out there.
        if reused {
            if let Some(url) = payment.external_confirmation_url.clone() {
                info!("Reusing pending invoice #{} for {}", payment.id, user_id);
                return Ok(PayableArtifact {
                    payment_id: payment.id,
                    channel,
                    amount: payment.amount,
                    url,
                    qr_png: None,
                    quote: quote.clone(),
                });
            }
        }

        let result = match channel {
            PaymentChannel::Stars => {
                self.create_stars_invoice(&payment.invoice_payload, quote, gift).await
            }
            PaymentChannel::Card | PaymentChannel::Sbp => {
                self.create_yookassa_invoice(&payment, channel, quote).await
            }
        };

        match result {
            Ok((external_id, url, qr_png)) => {
                match external_id {
                    // YooKassa assigns its payment id at creation.
                    Some(id) => self.payments.set_external(payment.id, &id, Some(&url)).await?,
                    // Stars only has the deep link until the charge event.
                    None => self.payments.set_confirmation_url(payment.id, &url).await?,
                }
                Ok(PayableArtifact {
                    payment_id: payment.id,
                    channel,
                    amount: quote.final_amount,
                    url,
                    qr_png,
                    quote: quote.clone(),
                })
            }
            Err(e) => {
                error!("Invoice creation failed for payment #{}: {}", payment.id, e);
                let _ = self.payments.mark_failed(payment.id).await;
                Err(e)
            }
        }
    }

    /// Stars invoices go through createInvoiceLink directly; the returned
    /// deep link is both the artifact and the stored confirmation URL. The
    /// link itself is the external reference until the charge id arrives
    /// with the successful-payment event.
    async fn create_stars_invoice(
        &self,
        payload: &str,
        quote: &PriceQuote,
        gift: bool,
    ) -> Result<(Option<String>, String, Option<Vec<u8>>)> {
        let title = if gift {
            format!("🎁 Gift subscription, {} mo.", quote.months)
        } else {
            format!("Subscription, {} mo.", quote.months)
        };
        let label = if gift {
            format!("Gift {}m", quote.months)
        } else {
            format!("Subscription {}m", quote.months)
        };

        let url = format!(
            "https://api.telegram.org/bot{}/createInvoiceLink",
            self.settings.bot_token
        );
        let params = json!({
            "title": title,
            "description": title,
            "payload": payload,
            "provider_token": "",
            "currency": "XTR",
            "prices": [{ "label": label, "amount": quote.final_amount }],
        });

        let resp: serde_json::Value = self
            .http
            .post(&url)
            .json(&params)
            .send()
            .await
            .context("createInvoiceLink request failed")?
            .json()
            .await
            .context("createInvoiceLink returned non-JSON")?;

        if resp["ok"].as_bool().unwrap_or(false) {
            let link = resp["result"]
                .as_str()
                .ok_or_else(|| anyhow!("createInvoiceLink without result"))?
                .to_string();
            Ok((None, link, None))
        } else {
            Err(anyhow!(
                "createInvoiceLink error: {}",
                resp["description"].as_str().unwrap_or("unknown")
            ))
        }
    }

    async fn create_yookassa_invoice(
        &self,
        payment: &remnashop_db::models::Payment,
        channel: PaymentChannel,
        quote: &PriceQuote,
    ) -> Result<(Option<String>, String, Option<Vec<u8>>)> {
        let yookassa = self
            .yookassa
            .as_ref()
            .ok_or_else(|| anyhow!("YooKassa is not configured"))?;
        debug_assert_eq!(quote.currency, Currency::RubMinor);

        let description = format!("Subscription, {} mo.", quote.months);
        let metadata = json!({
            "user_id": payment.user_id.to_string(),
            "subscription_months": quote.months.to_string(),
            "payment_db_id": payment.id.to_string(),
            "promo_code": payment.promo_code.clone().unwrap_or_default(),
        });

        let created = yookassa
            .create_payment(
                quote.final_amount,
                &description,
                "redirect",
                &self.settings.yookassa_return_url,
                metadata,
            )
            .await?;

        let url = created
            .confirmation_url
            .clone()
            .ok_or_else(|| anyhow!("YooKassa payment without confirmation URL"))?;

        // SBP users pay by scanning: when the rail returns raw QR payload it
        // is used verbatim, otherwise the confirmation URL is rasterized.
        let qr_png = if channel == PaymentChannel::Sbp {
            let data = created.qr_data.as_deref().unwrap_or(&url);
            match render_qr_png(data) {
                Ok(png) => Some(png),
                Err(e) => {
                    error!("QR rendering failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok((Some(created.id), url, qr_png))
    }
}

/// Idempotency key embedded in the external invoice. The amount component
/// keeps the key unique across price-table changes mid-flight.
pub fn build_payload(
    channel: PaymentChannel,
    user_id: i64,
    months: u32,
    amount: i64,
    promo_code: Option<&str>,
) -> String {
    let promo = promo_code.unwrap_or("");
    match channel {
        PaymentChannel::Stars => format!("{}:{}:{}:{}", user_id, months, amount, promo),
        PaymentChannel::Card => format!("yookassa:{}:{}:card:{}", user_id, months, promo),
        PaymentChannel::Sbp => format!("yookassa:{}:{}:sbp:{}", user_id, months, promo),
    }
}

/// Parsed view of a Stars payload; gift payloads are tagged with a leading
/// `gift:` segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPayload {
    pub gift: bool,
    pub user_id: i64,
    pub months: u32,
    pub amount: i64,
}

pub fn parse_stars_payload(payload: &str) -> Option<ParsedPayload> {
    let (gift, rest) = match payload.strip_prefix("gift:") {
        Some(rest) => (true, rest),
        None => (false, payload),
    };
    let mut parts = rest.split(':');
    let user_id = parts.next()?.parse().ok()?;
    let months = parts.next()?.parse().ok()?;
    let amount = parts.next()?.parse().ok()?;
    Some(ParsedPayload { gift, user_id, months, amount })
}

fn render_qr_png(data: &str) -> Result<Vec<u8>> {
    use qrcode::{EcLevel, QrCode};

    let code = QrCode::with_error_correction_level(data.as_bytes(), EcLevel::M)
        .context("QR encoding failed")?;
    let image = code.render::<image::Luma<u8>>().min_dimensions(320, 320).build();

    let mut png = Vec::new();
    image::DynamicImage::ImageLuma8(image)
        .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .context("PNG encoding failed")?;
    Ok(png)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_formats_match_rails() {
        assert_eq!(
            build_payload(PaymentChannel::Stars, 100, 3, 250, None),
            "100:3:250:"
        );
        assert_eq!(
            build_payload(PaymentChannel::Stars, 100, 3, 250, Some("SAVE10")),
            "100:3:250:SAVE10"
        );
        assert_eq!(
            build_payload(PaymentChannel::Card, 100, 1, 50_000, None),
            "yookassa:100:1:card:"
        );
        assert_eq!(
            build_payload(PaymentChannel::Sbp, 7, 6, 198_000, Some("SAVE10")),
            "yookassa:7:6:sbp:SAVE10"
        );
    }

    #[test]
    fn stars_payload_parses_back() {
        let parsed = parse_stars_payload("100:3:250:SAVE10").unwrap();
        assert_eq!(parsed, ParsedPayload { gift: false, user_id: 100, months: 3, amount: 250 });

        let parsed = parse_stars_payload("gift:100:6:450").unwrap();
        assert!(parsed.gift);
        assert_eq!(parsed.months, 6);

        assert!(parse_stars_payload("garbage").is_none());
    }

    #[test]
    fn retry_suffix_still_parses() {
        // Payloads deduplicated with the :r<n> suffix keep their fields.
        let parsed = parse_stars_payload("100:3:250::r1").unwrap();
        assert_eq!(parsed.user_id, 100);
        assert_eq!(parsed.amount, 250);
    }

    #[test]
    fn qr_renders_nonempty_png() {
        let png = render_qr_png("https://qr.nspk.ru/AS1000").unwrap();
        // PNG magic header.
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }
}
