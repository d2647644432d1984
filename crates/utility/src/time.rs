use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Seconds after midnight encoded by an `HH:MM:SS` string. Hours may exceed
/// 24 to address times past midnight within the same operating day, so this
/// cannot go through `NaiveTime`.
pub fn parse_day_seconds(value: &str) -> Option<i64> {
    let mut parts = value.split(':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds: i64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !(0..60).contains(&minutes) || !(0..60).contains(&seconds) {
        return None;
    }
    Some(hours * 3600 + minutes * 60 + seconds)
}

/// Inverse of `parse_day_seconds`.
pub fn format_day_seconds(seconds_after_midnight: i64) -> String {
    let hours = seconds_after_midnight / 3600;
    let minutes = (seconds_after_midnight % 3600) / 60;
    let seconds = seconds_after_midnight % 60;
    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

/// Operating day a local timestamp belongs to. An operating day runs from
/// `day_end − 24h` to `day_end` local time, so with the default end of
/// 27:00:00 a departure at 01:30 still counts to the previous calendar day.
pub fn operating_day(timestamp: DateTime<Tz>, day_end_seconds: i64) -> NaiveDate {
    let spillover = day_end_seconds - 86_400;
    let local_seconds = i64::from(timestamp.time().num_seconds_from_midnight());
    if local_seconds < spillover {
        timestamp.date_naive() - Duration::days(1)
    } else {
        timestamp.date_naive()
    }
}

/// Midnight of the operating day as an instant, anchored in the given
/// timezone. DST gaps resolve to the earliest valid local time.
pub fn operating_day_midnight(day: NaiveDate, timezone: Tz) -> DateTime<Utc> {
    timezone
        .from_local_datetime(&day.and_time(NaiveTime::MIN))
        .earliest()
        .unwrap_or_else(|| timezone.from_utc_datetime(&day.and_time(NaiveTime::MIN)))
        .with_timezone(&Utc)
}

/// `YYYYMMDD` rendering of an operating day for trip descriptors.
pub fn format_operating_day(day: NaiveDate) -> String {
    day.format("%Y%m%d").to_string()
}

/// Start time of a trip relative to the midnight of its operating day,
/// rendered `HH:MM:SS` and allowed to exceed 24:00:00.
pub fn operating_day_time(
    start: DateTime<Utc>,
    day: NaiveDate,
    timezone: Tz,
) -> String {
    let midnight = operating_day_midnight(day, timezone);
    format_day_seconds((start - midnight).num_seconds())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use chrono_tz::Europe::Berlin;

    fn berlin(datetime: &str) -> DateTime<Tz> {
        let naive = NaiveDateTime::parse_from_str(datetime, "%Y-%m-%d %H:%M:%S").unwrap();
        Berlin.from_local_datetime(&naive).unwrap()
    }

    #[test]
    fn day_seconds_round_trip_past_midnight() {
        assert_eq!(parse_day_seconds("27:00:00"), Some(97_200));
        assert_eq!(parse_day_seconds("05:07:09"), Some(18_429));
        assert_eq!(format_day_seconds(97_200), "27:00:00");
        assert_eq!(format_day_seconds(91_500), "25:25:00");
        assert!(parse_day_seconds("5:61:00").is_none());
        assert!(parse_day_seconds("nonsense").is_none());
    }

    #[test]
    fn early_morning_belongs_to_previous_operating_day() {
        let day_end = parse_day_seconds("27:00:00").unwrap();
        let late_evening = berlin("2024-07-05 23:40:00");
        let after_midnight = berlin("2024-07-06 01:30:00");
        let morning = berlin("2024-07-06 04:10:00");

        let day = NaiveDate::from_ymd_opt(2024, 7, 5).unwrap();
        assert_eq!(operating_day(late_evening, day_end), day);
        assert_eq!(operating_day(after_midnight, day_end), day);
        assert_eq!(
            operating_day(morning, day_end),
            NaiveDate::from_ymd_opt(2024, 7, 6).unwrap()
        );
    }

    #[test]
    fn trip_start_after_midnight_exceeds_24_hours() {
        let day = NaiveDate::from_ymd_opt(2024, 7, 5).unwrap();
        let start = berlin("2024-07-06 01:15:00").with_timezone(&Utc);
        assert_eq!(operating_day_time(start, day, Berlin), "25:15:00");
        assert_eq!(format_operating_day(day), "20240705");
    }
}
