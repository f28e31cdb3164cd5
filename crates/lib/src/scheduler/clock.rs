//! Wall-clock parsing and day-rollover for `HH:MM` schedule times.

use chrono::{DateTime, NaiveTime, TimeZone};

use super::SchedulerError;

/// Parse a strict two-digit `HH:MM` time of day (`09:00`, not `9:00` or `9am`).
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime, SchedulerError> {
    let invalid = || SchedulerError::InvalidTimeFormat(s.to_string());
    let b = s.as_bytes();
    if b.len() != 5 || b[2] != b':' {
        return Err(invalid());
    }
    let digits = [b[0], b[1], b[3], b[4]];
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(invalid());
    }
    let [h1, h2, m1, m2] = digits.map(|d| u32::from(d - b'0'));
    NaiveTime::from_hms_opt(h1 * 10 + h2, m1 * 10 + m2, 0).ok_or_else(invalid)
}

/// Next occurrence of `time` strictly after `now`: today if still ahead, else tomorrow.
///
/// A local time that does not exist on a given day (DST gap) moves on to the next day.
pub fn resolve_fire_time<Tz: TimeZone>(time: NaiveTime, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    let tz = now.timezone();
    let mut date = now.date_naive();
    for _ in 0..3 {
        if let Some(at) = tz.from_local_datetime(&date.and_time(time)).earliest() {
            if at > *now {
                return Some(at);
            }
        }
        date = date.succ_opt()?;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Timelike};

    fn jst(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(9 * 3600)
            .unwrap()
            .with_ymd_and_hms(y, mo, d, h, mi, s)
            .unwrap()
    }

    #[test]
    fn parses_valid_times() {
        assert_eq!(parse_time_of_day("09:00").unwrap(), NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(parse_time_of_day("23:59").unwrap(), NaiveTime::from_hms_opt(23, 59, 0).unwrap());
        assert_eq!(parse_time_of_day("00:00").unwrap(), NaiveTime::from_hms_opt(0, 0, 0).unwrap());
    }

    #[test]
    fn rejects_malformed_times() {
        for bad in ["9am", "9:00", "24:00", "12:60", "12-30", "", "12:3a", "１２:００", "12:000"] {
            assert!(
                matches!(parse_time_of_day(bad), Err(SchedulerError::InvalidTimeFormat(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn later_today_fires_today() {
        let now = jst(2026, 10, 16, 23, 58, 0);
        let at = resolve_fire_time(parse_time_of_day("23:59").unwrap(), &now).unwrap();
        assert_eq!(at, jst(2026, 10, 16, 23, 59, 0));
    }

    #[test]
    fn passed_time_rolls_to_tomorrow() {
        let now = jst(2026, 10, 16, 12, 0, 0);
        let at = resolve_fire_time(parse_time_of_day("00:01").unwrap(), &now).unwrap();
        assert_eq!(at, jst(2026, 10, 17, 0, 1, 0));
    }

    #[test]
    fn same_minute_already_started_rolls_over() {
        let now = jst(2026, 10, 16, 9, 0, 30);
        let at = resolve_fire_time(parse_time_of_day("09:00").unwrap(), &now).unwrap();
        assert_eq!(at, jst(2026, 10, 17, 9, 0, 0));
    }

    #[test]
    fn rollover_crosses_month_end() {
        let now = jst(2026, 12, 31, 22, 0, 0);
        let at = resolve_fire_time(parse_time_of_day("08:15").unwrap(), &now).unwrap();
        assert_eq!(at, jst(2027, 1, 1, 8, 15, 0));
    }

    #[test]
    fn every_minute_resolves_strictly_ahead_within_a_day() {
        let now = jst(2026, 10, 16, 13, 37, 12);
        for h in 0..24 {
            for m in 0..60 {
                let t = NaiveTime::from_hms_opt(h, m, 0).unwrap();
                let at = resolve_fire_time(t, &now).unwrap();
                assert!(at > now);
                assert!(at - now <= chrono::Duration::days(1));
                assert_eq!((at.hour(), at.minute()), (h, m));
                let expect_day = if (h, m) > (13, 37) { 16 } else { 17 };
                assert_eq!(at.date_naive(), jst(2026, 10, expect_day, 0, 0, 0).date_naive());
            }
        }
    }
}
