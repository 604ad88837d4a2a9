use anyhow::{Context, Result};
use std::env;

/// Per-period price table, one entry per purchasable period.
#[derive(Debug, Clone, Copy)]
pub struct PriceTable {
    pub one_month: i64,
    pub three_months: i64,
    pub six_months: i64,
    pub twelve_months: i64,
}

impl PriceTable {
    pub fn for_months(&self, months: u32) -> Option<i64> {
        match months {
            1 => Some(self.one_month),
            3 => Some(self.three_months),
            6 => Some(self.six_months),
            12 => Some(self.twelve_months),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub bot_token: String,
    pub bot_username: String,
    pub database_url: String,

    pub api_base_url: String,
    pub api_token: Option<String>,

    /// Stars per period (currency XTR).
    pub stars_prices: PriceTable,
    /// Minor rubles (kopecks) per period for the card/SBP rails.
    pub rub_prices: PriceTable,

    pub trial_days: i64,
    pub referral_bonus_days: i64,

    pub default_external_squad: Option<String>,
    pub default_internal_squads: Vec<String>,

    pub admins: Vec<i64>,
    pub notifications_chat_id: Option<i64>,
    pub notifications_topic_id: Option<i32>,

    pub yookassa_shop_id: Option<String>,
    pub yookassa_secret_key: Option<String>,
    pub yookassa_return_url: String,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let bot_token = env::var("BOT_TOKEN").context("BOT_TOKEN is not set")?;
        let api_base_url = env::var("API_BASE_URL")
            .context("API_BASE_URL is not set")?
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            bot_token,
            bot_username: env::var("BOT_USERNAME").unwrap_or_else(|_| "remnashopbot".to_string()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/bot_data.db".to_string()),
            api_base_url,
            api_token: env::var("API_TOKEN").ok().filter(|t| !t.trim().is_empty()),
            stars_prices: PriceTable {
                one_month: env_i64("SUBSCRIPTION_STARS_1MONTH", 100),
                three_months: env_i64("SUBSCRIPTION_STARS_3MONTHS", 250),
                six_months: env_i64("SUBSCRIPTION_STARS_6MONTHS", 450),
                twelve_months: env_i64("SUBSCRIPTION_STARS_12MONTHS", 800),
            },
            rub_prices: PriceTable {
                one_month: env_i64("SUBSCRIPTION_RUB_1MONTH", 500) * 100,
                three_months: env_i64("SUBSCRIPTION_RUB_3MONTHS", 1200) * 100,
                six_months: env_i64("SUBSCRIPTION_RUB_6MONTHS", 2200) * 100,
                twelve_months: env_i64("SUBSCRIPTION_RUB_12MONTHS", 4000) * 100,
            },
            trial_days: env_i64("TRIAL_DAYS", 3).max(1),
            referral_bonus_days: env_i64("REFERRAL_BONUS_DAYS", 3),
            default_external_squad: env::var("DEFAULT_EXTERNAL_SQUAD_UUID")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            default_internal_squads: parse_list(
                env::var("DEFAULT_INTERNAL_SQUADS").ok().as_deref(),
            ),
            admins: parse_id_list(env::var("ADMINS").ok().as_deref()),
            notifications_chat_id: env::var("NOTIFICATIONS_CHAT_ID")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            notifications_topic_id: env::var("NOTIFICATIONS_TOPIC_ID")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            yookassa_shop_id: env::var("YOOKASSA_SHOP_ID").ok().filter(|s| !s.is_empty()),
            yookassa_secret_key: env::var("YOOKASSA_SECRET_KEY").ok().filter(|s| !s.is_empty()),
            yookassa_return_url: env::var("YOOKASSA_RETURN_URL")
                .unwrap_or_else(|_| "https://t.me/remnashopbot".to_string()),
        })
    }

    pub fn is_admin(&self, telegram_id: i64) -> bool {
        self.admins.contains(&telegram_id)
    }

    pub fn yookassa_configured(&self) -> bool {
        self.yookassa_shop_id.is_some() && self.yookassa_secret_key.is_some()
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

/// Accepts both `"a,b,c"` and a JSON array `["a","b"]` — deployments have
/// used both formats for the squad list.
fn parse_list(raw: Option<&str>) -> Vec<String> {
    let raw = match raw {
        Some(r) if !r.trim().is_empty() => r.trim(),
        _ => return Vec::new(),
    };
    if raw.starts_with('[') {
        if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(raw) {
            return items
                .into_iter()
                .filter_map(|v| v.as_str().map(|s| s.trim().to_string()))
                .filter(|s| !s.is_empty())
                .collect();
        }
    }
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_id_list(raw: Option<&str>) -> Vec<i64> {
    raw.unwrap_or_default()
        .split(',')
        .filter_map(|part| part.trim().parse::<i64>().ok())
        .filter(|id| *id > 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_parsing_accepts_both_formats() {
        assert_eq!(parse_list(Some("a, b ,c")), vec!["a", "b", "c"]);
        assert_eq!(parse_list(Some(r#"["x","y"]"#)), vec!["x", "y"]);
        assert!(parse_list(Some("")).is_empty());
        assert!(parse_list(None).is_empty());
    }

    #[test]
    fn admin_list_skips_garbage() {
        assert_eq!(parse_id_list(Some("1, nope, 2,, -3")), vec![1, 2]);
    }

    #[test]
    fn price_table_rejects_unknown_period() {
        let table = PriceTable { one_month: 100, three_months: 250, six_months: 450, twelve_months: 800 };
        assert_eq!(table.for_months(3), Some(250));
        assert_eq!(table.for_months(2), None);
    }
}
