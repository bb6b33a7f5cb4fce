use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

const SECONDS_PER_DAY: f64 = 86_400.0;

static DURATION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s*(s|sec|secs|m|min|mins|h|hr|hrs|d|day|days|w|wk|wks|week|weeks)\s*$")
        .expect("duration pattern compiles")
});

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fractional days elapsed from `since` to `now`, negative if `since` is in the future.
pub fn days_since(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - since).num_milliseconds() as f64 / 1000.0 / SECONDS_PER_DAY
}

/// Parses short human durations such as `30m`, `1h`, `2d` or `1w`.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let lowered = input.to_ascii_lowercase();
    let captures = DURATION_PATTERN.captures(&lowered)?;
    let amount: i64 = captures.get(1)?.as_str().parse().ok()?;
    let unit = captures.get(2)?.as_str();

    let seconds_per_unit = match unit.chars().next()? {
        's' => 1,
        'm' => 60,
        'h' => 3_600,
        'd' => 86_400,
        'w' => 604_800,
        _ => return None,
    };

    amount
        .checked_mul(seconds_per_unit)
        .and_then(Duration::try_seconds)
        .filter(|duration| *duration > Duration::zero())
}

#[cfg(test)]
pub use self::testing::ManualClock;


#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use test_case::test_case;

    use super::{days_since, parse_duration};

    #[test_case("30m", Some(1_800) ; "minutes")]
    #[test_case("1h", Some(3_600) ; "hours")]
    #[test_case("1d", Some(86_400) ; "days")]
    #[test_case("2 weeks", Some(1_209_600) ; "spelled weeks")]
    #[test_case("45s", Some(45) ; "seconds")]
    #[test_case("2H", Some(7_200) ; "upper case unit")]
    #[test_case("0h", None ; "zero rejected")]
    #[test_case("soon", None ; "garbage rejected")]
    #[test_case("1y", None ; "unknown unit rejected")]
    fn parses_human_durations(input: &str, expected_seconds: Option<i64>) {
        assert_eq!(
            parse_duration(input).map(|d| d.num_seconds()),
            expected_seconds
        );
    }

    #[test]
    fn days_since_is_fractional() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let since = now - Duration::hours(36);

        assert!((days_since(since, now) - 1.5).abs() < f64::EPSILON);
    }
}
