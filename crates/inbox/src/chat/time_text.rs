use chrono::{DateTime, TimeZone, Timelike};

const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;
const WEEK_MS: u64 = 7 * DAY_MS;

/// "5 minutes ago" style label for a conversation row. Future timestamps count as zero.
pub fn relative_time_label(now_unix_ms: u64, then_unix_ms: u64) -> String {
    let diff = now_unix_ms.saturating_sub(then_unix_ms);

    let (amount, unit) = if diff < HOUR_MS {
        (diff / MINUTE_MS, "minute")
    } else if diff < DAY_MS {
        (diff / HOUR_MS, "hour")
    } else if diff < WEEK_MS {
        (diff / DAY_MS, "day")
    } else {
        (diff / WEEK_MS, "week")
    };

    let plural = if amount > 1 { "s" } else { "" };
    format!("{amount} {unit}{plural} ago")
}

/// `H:MM` clock label for a message bubble, in the given zone.
pub fn clock_label<Tz: TimeZone>(sent_unix_ms: u64, zone: &Tz) -> String {
    let Some(utc) = i64::try_from(sent_unix_ms)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
    else {
        return String::new();
    };
    let local = utc.with_timezone(zone);
    format!("{}:{:02}", local.hour(), local.minute())
}

pub fn now_unix_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, Utc};

    use super::*;

    #[test]
    fn labels_pick_the_largest_whole_unit() {
        let now = 100 * WEEK_MS;
        assert_eq!(relative_time_label(now, now), "0 minute ago");
        assert_eq!(relative_time_label(now, now - MINUTE_MS), "1 minute ago");
        assert_eq!(relative_time_label(now, now - 59 * MINUTE_MS), "59 minutes ago");
        assert_eq!(relative_time_label(now, now - 2 * HOUR_MS), "2 hours ago");
        assert_eq!(relative_time_label(now, now - DAY_MS), "1 day ago");
        assert_eq!(relative_time_label(now, now - 3 * WEEK_MS), "3 weeks ago");
    }

    #[test]
    fn future_timestamps_do_not_underflow() {
        assert_eq!(relative_time_label(1_000, 5_000), "0 minute ago");
    }

    #[test]
    fn clock_label_pads_minutes_but_not_hours() {
        // 1970-01-01T09:05:00Z
        let sent = 9 * HOUR_MS + 5 * MINUTE_MS;
        assert_eq!(clock_label(sent, &Utc), "9:05");

        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        assert_eq!(clock_label(sent, &plus_two), "11:05");
    }
}
