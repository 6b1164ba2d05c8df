//! Human readable intervals such as `10 seconds` or `1h30m`.

use serde::de::{self, Deserializer, Visitor};
use serde::Serializer;
use std::fmt;
use std::time::Duration;

use crate::error::{Result, WardenError};

const SECOND: u64 = 1_000;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const WEEK: u64 = 7 * DAY;

/// Unit table in milliseconds, largest first for formatting.
const UNITS: &[(u64, &str)] = &[
    (WEEK, "week"),
    (DAY, "day"),
    (HOUR, "hour"),
    (MINUTE, "minute"),
    (SECOND, "second"),
    (1, "millisecond"),
];

fn unit_millis(unit: &str) -> Option<u64> {
    let millis = match unit.to_ascii_lowercase().as_str() {
        "ms" | "msec" | "msecs" | "millisecond" | "milliseconds" => 1,
        "s" | "sec" | "secs" | "second" | "seconds" => SECOND,
        "m" | "min" | "mins" | "minute" | "minutes" => MINUTE,
        "h" | "hr" | "hrs" | "hour" | "hours" => HOUR,
        "d" | "day" | "days" => DAY,
        "w" | "week" | "weeks" => WEEK,
        _ => return None,
    };
    Some(millis)
}

/// Parse an interval string.
///
/// Accepts `"<n> <unit>"`, compact `"<n><unit>"`, several parts that are
/// summed (`"1 hour 30 minutes"`), and bare integers meaning seconds.
pub fn parse_interval(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(WardenError::Config("empty interval".to_string()));
    }

    if let Ok(secs) = trimmed.parse::<u64>() {
        return non_zero(Duration::from_secs(secs), input);
    }

    let mut total: u64 = 0;
    let mut chars = trimmed.chars().peekable();

    while chars.peek().is_some() {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut number = String::new();
        while let Some(c) = chars.next_if(|c| c.is_ascii_digit()) {
            number.push(c);
        }
        if number.is_empty() {
            return Err(WardenError::Config(format!(
                "invalid interval '{}': expected a number",
                input
            )));
        }

        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut unit = String::new();
        while let Some(c) = chars.next_if(|c| c.is_ascii_alphabetic()) {
            unit.push(c);
        }
        while chars.next_if(|c| c.is_whitespace() || *c == ',').is_some() {}

        let amount: u64 = number.parse().map_err(|_| {
            WardenError::Config(format!("invalid interval '{}': number too large", input))
        })?;
        let millis = unit_millis(&unit).ok_or_else(|| {
            WardenError::Config(format!("invalid interval '{}': unknown unit '{}'", input, unit))
        })?;

        total = amount
            .checked_mul(millis)
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| WardenError::Config(format!("interval '{}' overflows", input)))?;
    }

    non_zero(Duration::from_millis(total), input)
}

fn non_zero(duration: Duration, input: &str) -> Result<Duration> {
    if duration.is_zero() {
        return Err(WardenError::Config(format!("interval '{}' must not be zero", input)));
    }
    Ok(duration)
}

/// Render a duration with the largest unit that divides it exactly.
pub fn format_interval(duration: Duration) -> String {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    if millis == 0 {
        return "0 seconds".to_string();
    }

    for (size, name) in UNITS {
        if millis % size == 0 {
            let amount = millis / size;
            let plural = if amount == 1 { "" } else { "s" };
            return format!("{} {}{}", amount, name, plural);
        }
    }

    unreachable!("millisecond unit divides every duration")
}

/// Serde adapter for `Duration` fields written as interval strings.
pub mod serde_interval {
    use super::*;

    pub fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_interval(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Duration, D::Error> {
        deserializer.deserialize_any(IntervalVisitor)
    }
}

/// Serde adapter for optional interval fields.
pub mod serde_interval_opt {
    use super::*;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match duration {
            Some(d) => serializer.serialize_some(&format_interval(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Duration>, D::Error> {
        deserializer.deserialize_option(OptionalIntervalVisitor)
    }

    struct OptionalIntervalVisitor;

    impl<'de> Visitor<'de> for OptionalIntervalVisitor {
        type Value = Option<Duration>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an optional interval")
        }

        fn visit_none<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D: Deserializer<'de>>(
            self,
            deserializer: D,
        ) -> std::result::Result<Self::Value, D::Error> {
            deserializer.deserialize_any(IntervalVisitor).map(Some)
        }
    }
}

struct IntervalVisitor;

impl<'de> Visitor<'de> for IntervalVisitor {
    type Value = Duration;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an interval such as \"10 seconds\" or a number of seconds")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<Duration, E> {
        parse_interval(value).map_err(E::custom)
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> std::result::Result<Duration, E> {
        if value == 0 {
            return Err(E::custom("interval must not be zero"));
        }
        Ok(Duration::from_secs(value))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> std::result::Result<Duration, E> {
        let secs = u64::try_from(value).map_err(|_| E::custom("interval must not be negative"))?;
        self.visit_u64(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spelled_units() {
        assert_eq!(parse_interval("10 seconds").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_interval("1 minute").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_interval("24 hours").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_interval("2 weeks").unwrap(), Duration::from_secs(14 * 86_400));
        assert_eq!(parse_interval("250 milliseconds").unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn test_parse_compact_and_combined() {
        assert_eq!(parse_interval("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_interval("1h30m").unwrap(), Duration::from_secs(5_400));
        assert_eq!(parse_interval("1 hour 30 minutes").unwrap(), Duration::from_secs(5_400));
        assert_eq!(parse_interval("1 day, 2 hours").unwrap(), Duration::from_secs(93_600));
    }

    #[test]
    fn test_parse_bare_seconds() {
        assert_eq!(parse_interval("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(parse_interval("").is_err());
        assert!(parse_interval("0 seconds").is_err());
        assert!(parse_interval("10 fortnights").is_err());
        assert!(parse_interval("seconds").is_err());
        assert!(parse_interval("10").is_ok());
    }

    #[test]
    fn test_format_interval() {
        assert_eq!(format_interval(Duration::from_secs(10)), "10 seconds");
        assert_eq!(format_interval(Duration::from_secs(60)), "1 minute");
        assert_eq!(format_interval(Duration::from_secs(86_400)), "1 day");
        assert_eq!(format_interval(Duration::from_secs(90)), "90 seconds");
        assert_eq!(format_interval(Duration::from_millis(1_500)), "1500 milliseconds");
    }

    #[test]
    fn test_deserialize_from_yaml() {
        #[derive(serde::Deserialize)]
        struct Holder {
            #[serde(with = "serde_interval")]
            every: Duration,
            #[serde(default, with = "serde_interval_opt")]
            reset: Option<Duration>,
        }

        let holder: Holder = serde_yaml::from_str("every: 5 minutes\nreset: 3600\n").unwrap();
        assert_eq!(holder.every, Duration::from_secs(300));
        assert_eq!(holder.reset, Some(Duration::from_secs(3_600)));

        let holder: Holder = serde_yaml::from_str("every: 5\n").unwrap();
        assert_eq!(holder.every, Duration::from_secs(5));
        assert_eq!(holder.reset, None);
    }
}
