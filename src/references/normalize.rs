//! Timestamp conversions between the chat platform's two representations:
//! the decimal `seconds.microseconds` form used as [`crate::platform::Message::ts`]
//! and the 16-digit form embedded in message permalinks (`p<16 digits>`,
//! split `10.6`).

/// `"1700000000.000100"` → `"1700000000000100"`. Pads/truncates the
/// fractional part to exactly 6 digits so the result is always 16 digits.
pub fn split_ts_to_url_form(ts: &str) -> String {
    let (whole, frac) = ts.split_once('.').unwrap_or((ts, ""));
    let mut frac = frac.to_string();
    frac.truncate(6);
    while frac.len() < 6 {
        frac.push('0');
    }
    format!("{whole}{frac}")
}

/// Inverse of [`split_ts_to_url_form`]: a 16-digit url-form timestamp back
/// to `10.6` decimal form. Returns `None` if `digits` isn't exactly 16
/// ASCII digits.
pub fn url_form_to_ts(digits: &str) -> Option<String> {
    if digits.len() != 16 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (whole, frac) = digits.split_at(10);
    Some(format!("{whole}.{frac}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_url_form() {
        let ts = "1700000000.000100";
        let url_form = split_ts_to_url_form(ts);
        assert_eq!(url_form.len(), 16);
        assert_eq!(url_form_to_ts(&url_form).unwrap(), ts);
    }

    #[test]
    fn pads_short_fractional_part() {
        assert_eq!(split_ts_to_url_form("1700000000.1"), "1700000000100000");
    }

    #[test]
    fn rejects_malformed_digits() {
        assert_eq!(url_form_to_ts("not-digits"), None);
        assert_eq!(url_form_to_ts("123"), None);
    }
}
