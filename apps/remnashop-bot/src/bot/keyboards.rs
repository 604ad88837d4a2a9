use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

pub fn main_menu(trial_available: bool) -> InlineKeyboardMarkup {
    let mut rows = vec![vec![InlineKeyboardButton::callback("🛒 Buy subscription", "buy")]];
    if trial_available {
        rows.push(vec![InlineKeyboardButton::callback("🎁 Free trial", "trial")]);
    }
    rows.push(vec![
        InlineKeyboardButton::callback("🎁 Gift a subscription", "gift"),
        InlineKeyboardButton::callback("🎫 Redeem a code", "redeem"),
    ]);
    rows.push(vec![
        InlineKeyboardButton::callback("👤 Profile", "profile"),
        InlineKeyboardButton::callback("🔄 Auto-renewal", "autorenew"),
    ]);
    InlineKeyboardMarkup::new(rows)
}

pub fn period_keyboard(prefix: &str) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            InlineKeyboardButton::callback("1 month", format!("{}:1", prefix)),
            InlineKeyboardButton::callback("3 months", format!("{}:3", prefix)),
        ],
        vec![
            InlineKeyboardButton::callback("6 months", format!("{}:6", prefix)),
            InlineKeyboardButton::callback("12 months", format!("{}:12", prefix)),
        ],
        vec![InlineKeyboardButton::callback("« Back", "menu")],
    ])
}

/// Channel choice for a period; the optional promo code rides along in the
/// callback data so the whole selection survives a restart.
pub fn channel_keyboard(months: u32, promo: Option<&str>) -> InlineKeyboardMarkup {
    let promo_suffix = promo.unwrap_or("");
    let mut rows = vec![
        vec![InlineKeyboardButton::callback(
            "⭐ Telegram Stars",
            format!("pay:{}:stars:{}", months, promo_suffix),
        )],
        vec![
            InlineKeyboardButton::callback("💳 Card", format!("pay:{}:card:{}", months, promo_suffix)),
            InlineKeyboardButton::callback("🏦 SBP", format!("pay:{}:sbp:{}", months, promo_suffix)),
        ],
    ];
    if promo.is_none() {
        rows.push(vec![InlineKeyboardButton::callback(
            "🎟 I have a promo code",
            format!("promo:{}", months),
        )]);
    }
    rows.push(vec![InlineKeyboardButton::callback("« Back", "buy")]);
    InlineKeyboardMarkup::new(rows)
}

pub fn check_status_keyboard(payment_id: i64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![InlineKeyboardButton::callback(
            "✅ I have paid — check",
            format!("check:{}", payment_id),
        )],
        vec![InlineKeyboardButton::callback("« Menu", "menu")],
    ])
}

pub fn back_to_menu() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback("« Menu", "menu")]])
}
