//! ISO-8601 timestamp parsing for event envelopes.

use chrono::{NaiveDate, NaiveTime};

/// Parses an ISO-8601 timestamp to UTC milliseconds since the epoch.
///
/// Accepted: `YYYY-MM-DDTHH:MM:SS`, optionally with a fraction of up to
/// three digits, followed by `Z` or a `±HH:MM` offset. `-00:00` is plain
/// UTC. Anything else is rejected with a reason.
pub fn parse_iso8601_ms(raw: &str) -> Result<i64, String> {
    let (date_part, rest) = raw
        .split_once(['T', ' '])
        .ok_or_else(|| "missing time separator".to_string())?;

    let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .map_err(|_| format!("bad date '{date_part}'"))?;

    if rest.len() < 8 || !rest.is_char_boundary(8) {
        return Err("time is shorter than HH:MM:SS".to_string());
    }
    let (time_part, mut tail) = rest.split_at(8);
    let time = NaiveTime::parse_from_str(time_part, "%H:%M:%S")
        .map_err(|_| format!("bad time '{time_part}'"))?;

    let mut fraction_ms: i64 = 0;
    if let Some(after_dot) = tail.strip_prefix('.') {
        let digits: String = after_dot.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return Err("empty fraction".to_string());
        }
        if digits.len() > 3 {
            return Err("fraction exceeds millisecond precision".to_string());
        }
        // ".5" is 500 ms, ".12" is 120 ms.
        let scale = 10i64.pow(3 - digits.len() as u32);
        fraction_ms = digits.parse::<i64>().map_err(|_| "bad fraction")? * scale;
        tail = &after_dot[digits.len()..];
    }

    let offset_minutes: i64 = match tail {
        "Z" => 0,
        "" => return Err("missing timezone".to_string()),
        _ => {
            let sign = match tail.chars().next() {
                Some('+') => 1,
                Some('-') => -1,
                _ => return Err(format!("bad timezone '{tail}'")),
            };
            let body = &tail[1..];
            let (hours, minutes) = body
                .split_once(':')
                .ok_or_else(|| format!("bad timezone '{tail}'"))?;
            if hours.len() != 2 || minutes.len() != 2 {
                return Err(format!("bad timezone '{tail}'"));
            }
            let h: i64 = hours.parse().map_err(|_| format!("bad timezone '{tail}'"))?;
            let m: i64 = minutes
                .parse()
                .map_err(|_| format!("bad timezone '{tail}'"))?;
            if h > 23 || m > 59 {
                return Err(format!("timezone offset '{tail}' out of range"));
            }
            sign * (h * 60 + m)
        }
    };

    let base_ms = date.and_time(time).and_utc().timestamp_millis();
    Ok(base_ms + fraction_ms - offset_minutes * 60_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_utc() {
        assert_eq!(
            parse_iso8601_ms("2024-12-14T10:30:00Z").unwrap(),
            1_734_172_200_000
        );
    }

    #[test]
    fn fractional_seconds() {
        assert_eq!(
            parse_iso8601_ms("2024-12-14T10:30:00.123Z").unwrap(),
            1_734_172_200_123
        );
        assert_eq!(
            parse_iso8601_ms("2024-12-14T10:30:00.5Z").unwrap(),
            1_734_172_200_500
        );
    }

    #[test]
    fn positive_offset_converts_to_utc() {
        assert_eq!(
            parse_iso8601_ms("2024-12-14T11:30:00+01:00").unwrap(),
            parse_iso8601_ms("2024-12-14T10:30:00Z").unwrap()
        );
    }

    #[test]
    fn negative_offset_converts_to_utc() {
        assert_eq!(
            parse_iso8601_ms("2024-12-14T05:30:00-05:00").unwrap(),
            parse_iso8601_ms("2024-12-14T10:30:00Z").unwrap()
        );
    }

    #[test]
    fn negative_zero_offset_is_utc() {
        assert_eq!(
            parse_iso8601_ms("2024-12-14T10:30:00-00:00").unwrap(),
            parse_iso8601_ms("2024-12-14T10:30:00Z").unwrap()
        );
    }

    #[test]
    fn space_separator_is_accepted() {
        assert_eq!(
            parse_iso8601_ms("2024-12-14 10:30:00Z").unwrap(),
            parse_iso8601_ms("2024-12-14T10:30:00Z").unwrap()
        );
    }

    #[test]
    fn rejects_malformed_inputs() {
        assert!(parse_iso8601_ms("2024-12-14").is_err());
        assert!(parse_iso8601_ms("2024-12-14T10:30").is_err());
        assert!(parse_iso8601_ms("2024-12-14T10:30:00").is_err()); // no timezone
        assert!(parse_iso8601_ms("2024-12-14T10:30:00.1234Z").is_err()); // 4 digits
        assert!(parse_iso8601_ms("2024-12-14T10:30:00.Z").is_err());
        assert!(parse_iso8601_ms("2024-12-14T10:30:00+0100").is_err()); // no colon
        assert!(parse_iso8601_ms("2024-12-14T10:30:00+25:00").is_err());
        assert!(parse_iso8601_ms("not a timestamp").is_err());
    }
}
