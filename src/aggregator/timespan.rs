//! §6 CLI surface / §4.J step 1 — parse the `summarize <timespan>` argument
//! into a concrete [`TimeRange`] in the configured IANA timezone. Accepts
//! the relative tokens `today`, `yesterday`, `last-week`, a single date
//! (`YYYY-MM-DD`), or a date range (`YYYY-MM-DD..YYYY-MM-DD`).

use chrono::{NaiveDate, TimeZone};
use chrono_tz::Tz;

use crate::error::{DigestError, Result};
use crate::platform::TimeRange;

/// `[start, end)` epoch-second bounds of the local calendar day containing
/// `reference_ts` (used for the relative tokens, anchored on "now").
fn local_day_bounds_of(reference_ts: f64, timezone: Tz) -> (f64, f64) {
    let utc = chrono::DateTime::from_timestamp(reference_ts as i64, 0).unwrap_or_default();
    let local_date = timezone.from_utc_datetime(&utc.naive_utc()).date_naive();
    date_bounds(local_date, timezone)
}

/// `[start, end)` epoch-second bounds of local midnight-to-midnight for an
/// explicit calendar date.
fn date_bounds(date: NaiveDate, timezone: Tz) -> (f64, f64) {
    let start_naive = date.and_hms_opt(0, 0, 0).unwrap();
    let start = timezone
        .from_local_datetime(&start_naive)
        .single()
        .map(|dt| dt.timestamp() as f64)
        .unwrap_or_else(|| date.and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp() as f64);
    (start, start + 86400.0)
}

/// Parse `input` as of `now` (epoch seconds), in `timezone`.
///
/// `last-week` is taken as the rolling 7-day window ending at `now` (not a
/// calendar Mon-Sun week), the simplest reading consistent with "a bounded
/// historical range" (§1); recorded as an open-question decision in
/// DESIGN.md.
pub fn parse_timespan(input: &str, timezone: Tz, now: f64) -> Result<TimeRange> {
    let trimmed = input.trim();
    match trimmed {
        "today" => {
            let (start, _) = local_day_bounds_of(now, timezone);
            Ok(TimeRange { start, end: now })
        }
        "yesterday" => {
            let (start, end) = local_day_bounds_of(now - 86400.0, timezone);
            Ok(TimeRange { start, end })
        }
        "last-week" => Ok(TimeRange { start: now - 7.0 * 86400.0, end: now }),
        _ => {
            if let Some((from, to)) = trimmed.split_once("..") {
                let from_date = parse_date(from)?;
                let to_date = parse_date(to)?;
                let (start, _) = date_bounds(from_date, timezone);
                let (_, end) = date_bounds(to_date, timezone);
                if start > end {
                    return Err(DigestError::Timespan(trimmed.to_string()));
                }
                Ok(TimeRange { start, end })
            } else {
                let date = parse_date(trimmed)?;
                let (start, end) = date_bounds(date, timezone);
                Ok(TimeRange { start, end })
            }
        }
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| DigestError::Timespan(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_garbage_token() {
        assert!(parse_timespan("whenever", chrono_tz::UTC, 1_700_000_000.0).is_err());
    }

    #[test]
    fn single_date_spans_exactly_one_local_day() {
        let range = parse_timespan("2024-01-15", chrono_tz::UTC, 1_700_000_000.0).unwrap();
        assert_eq!(range.end - range.start, 86400.0);
    }

    #[test]
    fn date_range_spans_from_first_midnight_to_last_midnight_end() {
        let range = parse_timespan("2024-01-15..2024-01-17", chrono_tz::UTC, 1_700_000_000.0).unwrap();
        assert_eq!(range.end - range.start, 3.0 * 86400.0);
    }

    #[test]
    fn reversed_date_range_is_rejected() {
        assert!(parse_timespan("2024-01-17..2024-01-15", chrono_tz::UTC, 1_700_000_000.0).is_err());
    }

    #[test]
    fn today_ends_at_now_not_midnight() {
        let now = 1_700_000_000.0;
        let range = parse_timespan("today", chrono_tz::UTC, now).unwrap();
        assert_eq!(range.end, now);
        assert!(range.start <= now);
    }

    #[test]
    fn last_week_is_seven_rolling_days() {
        let now = 1_700_000_000.0;
        let range = parse_timespan("last-week", chrono_tz::UTC, now).unwrap();
        assert_eq!(range.end - range.start, 7.0 * 86400.0);
    }
}
