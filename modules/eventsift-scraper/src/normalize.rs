//! Date/time coercion for scraped text.
//!
//! Scraped pages hand back anything from ISO timestamps to "March 5, 2024
//! 7:00 PM". Parsing walks an ordered format list and silently falls back to
//! the caller's `now` — a bad date never fails an extraction.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

/// Ordered format attempts, most specific first. The bool marks formats that
/// carry a time of day; date-only formats fill in midnight.
const FORMATS: &[(&str, bool)] = &[
    ("%Y-%m-%d %H:%M:%S", true),
    ("%Y-%m-%d %H:%M", true),
    ("%Y-%m-%d", false),
    ("%m/%d/%Y %H:%M:%S", true),
    ("%m/%d/%Y %H:%M", true),
    ("%m/%d/%Y", false),
    ("%d/%m/%Y %H:%M:%S", true),
    ("%d/%m/%Y %H:%M", true),
    ("%d/%m/%Y", false),
    ("%B %d, %Y %I:%M %p", true),
    ("%B %d, %Y", false),
    ("%b %d, %Y %I:%M %p", true),
    ("%b %d, %Y", false),
];

/// Formats tried for a "date time" pair joined with a space.
const COMBINED_FORMATS: &[&str] = &[
    "%B %d, %Y %I:%M %p",
    "%b %d, %Y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%m/%d/%Y %I:%M %p",
];

/// Coerce a free-text date string to a UTC timestamp, defaulting to `now`.
pub fn normalize_datetime(raw: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    try_parse_datetime(raw).unwrap_or(now)
}

/// Coerce a date plus optional separate time, defaulting to `now`.
pub fn normalize_event_datetime(
    date: &str,
    time: Option<&str>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let date = date.trim();
    if date.is_empty() {
        return now;
    }

    let combined = match time.map(str::trim) {
        Some(t) if !t.is_empty() => format!("{date} {t}"),
        _ => date.to_string(),
    };

    for pattern in COMBINED_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&combined, pattern) {
            return Utc.from_utc_datetime(&naive);
        }
    }

    try_parse_datetime(&combined)
        .or_else(|| try_parse_datetime(date))
        .unwrap_or(now)
}

/// The parse attempt behind the normalizers: ISO/email timestamps first,
/// then the explicit format list.
pub(crate) fn try_parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    for (pattern, has_time) in FORMATS {
        if *has_time {
            if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, pattern) {
                return Some(Utc.from_utc_datetime(&naive));
            }
        } else if let Ok(date) = NaiveDate::parse_from_str(trimmed, pattern) {
            return Some(Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.from_utc_datetime(
            &NaiveDate::from_ymd_opt(y, m, d)
                .unwrap()
                .and_hms_opt(h, min, s)
                .unwrap(),
        )
    }

    fn fixed_now() -> DateTime<Utc> {
        at(2024, 6, 1, 12, 0, 0)
    }

    #[test]
    fn long_month_with_meridiem() {
        assert_eq!(
            normalize_datetime("March 5, 2024 7:00 PM", fixed_now()),
            at(2024, 3, 5, 19, 0, 0)
        );
    }

    #[test]
    fn iso_datetime_and_date() {
        assert_eq!(
            normalize_datetime("2024-03-05 19:00:00", fixed_now()),
            at(2024, 3, 5, 19, 0, 0)
        );
        assert_eq!(
            normalize_datetime("2024-03-05", fixed_now()),
            at(2024, 3, 5, 0, 0, 0)
        );
    }

    #[test]
    fn rfc3339_passes_through_in_utc() {
        assert_eq!(
            normalize_datetime("2024-03-05T19:00:00-07:00", fixed_now()),
            at(2024, 3, 6, 2, 0, 0)
        );
    }

    #[test]
    fn us_slash_date_with_time() {
        assert_eq!(
            normalize_datetime("03/05/2024 19:00", fixed_now()),
            at(2024, 3, 5, 19, 0, 0)
        );
    }

    #[test]
    fn abbreviated_month() {
        assert_eq!(
            normalize_datetime("Mar 5, 2024 7:00 PM", fixed_now()),
            at(2024, 3, 5, 19, 0, 0)
        );
        assert_eq!(
            normalize_datetime("Mar 5, 2024", fixed_now()),
            at(2024, 3, 5, 0, 0, 0)
        );
    }

    #[test]
    fn unparseable_falls_back_to_now() {
        let now = fixed_now();
        assert_eq!(normalize_datetime("next Tuesday-ish", now), now);
        assert_eq!(normalize_datetime("", now), now);
        assert_eq!(normalize_datetime("   ", now), now);
    }

    #[test]
    fn surrounding_whitespace_tolerated() {
        assert_eq!(
            normalize_datetime("  March 5, 2024 7:00 PM  ", fixed_now()),
            at(2024, 3, 5, 19, 0, 0)
        );
    }

    #[test]
    fn separate_time_joins_with_date() {
        assert_eq!(
            normalize_event_datetime("March 5, 2024", Some("7:00 PM"), fixed_now()),
            at(2024, 3, 5, 19, 0, 0)
        );
    }

    #[test]
    fn event_date_without_time_is_midnight() {
        assert_eq!(
            normalize_event_datetime("2024-03-05", None, fixed_now()),
            at(2024, 3, 5, 0, 0, 0)
        );
    }

    #[test]
    fn unusable_time_still_parses_the_date() {
        assert_eq!(
            normalize_event_datetime("March 5, 2024", Some("doors at dusk"), fixed_now()),
            at(2024, 3, 5, 0, 0, 0)
        );
    }

    #[test]
    fn empty_event_date_falls_back_to_now() {
        let now = fixed_now();
        assert_eq!(normalize_event_datetime("", Some("7:00 PM"), now), now);
        assert_eq!(normalize_event_datetime("gibberish", None, now), now);
    }

    #[test]
    fn round_trips_each_supported_format() {
        let cases = [
            ("2024-03-05 19:00:00", at(2024, 3, 5, 19, 0, 0)),
            ("2024-03-05 19:00", at(2024, 3, 5, 19, 0, 0)),
            ("2024-03-05", at(2024, 3, 5, 0, 0, 0)),
            ("03/05/2024 19:00:00", at(2024, 3, 5, 19, 0, 0)),
            ("03/05/2024", at(2024, 3, 5, 0, 0, 0)),
            ("March 5, 2024 7:00 PM", at(2024, 3, 5, 19, 0, 0)),
            ("March 5, 2024", at(2024, 3, 5, 0, 0, 0)),
            ("Mar 5, 2024 7:00 PM", at(2024, 3, 5, 19, 0, 0)),
            ("Mar 5, 2024", at(2024, 3, 5, 0, 0, 0)),
        ];
        for (input, expected) in cases {
            assert_eq!(
                normalize_datetime(input, fixed_now()),
                expected,
                "input: {input}"
            );
        }
    }
}
