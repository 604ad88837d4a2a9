use chrono::{DateTime, SecondsFormat, Utc};

/// Formats a timestamp the way the control plane expects its dates:
/// ISO-8601 UTC, seconds precision, trailing `Z`.
pub fn to_utc_iso(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Derives a control-plane username from a Telegram handle. Falls back to
/// `tg<id>` when no handle is usable; collision retries append a suffix at
/// the call site.
pub fn sanitize_username(handle: Option<&str>, telegram_id: i64) -> String {
    let cleaned: String = handle
        .unwrap_or_default()
        .trim_start_matches('@')
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();

    if cleaned.len() >= 3 {
        cleaned.to_lowercase()
    } else {
        format!("tg{}", telegram_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn iso_format_has_trailing_z_and_no_fraction() {
        let dt = Utc.with_ymd_and_hms(2026, 3, 25, 8, 21, 28).unwrap();
        assert_eq!(to_utc_iso(dt), "2026-03-25T08:21:28Z");
    }

    #[test]
    fn username_sanitation() {
        assert_eq!(sanitize_username(Some("@Alice_99"), 7), "alice_99");
        assert_eq!(sanitize_username(Some("тест"), 7), "tg7");
        assert_eq!(sanitize_username(Some("ab"), 7), "tg7");
        assert_eq!(sanitize_username(None, 42), "tg42");
    }
}
