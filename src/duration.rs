//! ISO-8601 duration parsing (`PT5M`, `P1DT12H`, `PT0.5S`).
//!
//! Years and months are calendar-free here: a year is 365 days and a month is
//! 30 days, which matches how dispatch schedules have always been
//! interpreted. Negative durations are rejected.

use chrono::Duration;
use pom::utf8::{end, one_of, sym, Parser};

use crate::error::Error;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Components {
    years: Option<u64>,
    months: Option<u64>,
    weeks: Option<u64>,
    days: Option<u64>,
    hours: Option<u64>,
    minutes: Option<u64>,
    seconds: Option<(u64, u32)>,
}

impl Components {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn number<'a>() -> Parser<'a, u64> {
    one_of("0123456789")
        .repeat(1..)
        .collect()
        .convert(|digits: &str| digits.parse::<u64>())
        .name("number")
}

/// Fractional part as nanoseconds. Digits past nanosecond precision are dropped.
fn fraction<'a>() -> Parser<'a, u32> {
    (one_of(".,") * one_of("0123456789").repeat(1..).collect())
        .map(|digits: &str| {
            let mut nanos = String::with_capacity(9);
            nanos.extend(digits.chars().take(9));
            while nanos.len() < 9 {
                nanos.push('0');
            }
            nanos.parse::<u32>().unwrap_or(0)
        })
        .name("fraction")
}

fn component<'a>(designator: char) -> Parser<'a, u64> {
    number() - sym(designator)
}

fn seconds<'a>() -> Parser<'a, (u64, u32)> {
    (number() + fraction().opt() - sym('S')).map(|(whole, nanos)| (whole, nanos.unwrap_or(0)))
}

fn date_part<'a>() -> Parser<'a, (Option<u64>, Option<u64>, Option<u64>, Option<u64>)> {
    (component('Y').opt() + component('M').opt() + component('W').opt() + component('D').opt())
        .map(|(((years, months), weeks), days)| (years, months, weeks, days))
        .name("date part")
}

fn time_part<'a>() -> Parser<'a, (Option<u64>, Option<u64>, Option<(u64, u32)>)> {
    (sym('T') * (component('H').opt() + component('M').opt() + seconds().opt()))
        .convert(|((hours, minutes), seconds)| match (hours, minutes, seconds) {
            (None, None, None) => Err("time designator without components"),
            parts => Ok(parts),
        })
        .name("time part")
}

fn duration<'a>() -> Parser<'a, Components> {
    (sym('P') * date_part() + time_part().opt() - end())
        .map(|((years, months, weeks, days), time)| {
            let (hours, minutes, seconds) = time.unwrap_or((None, None, None));
            Components {
                years,
                months,
                weeks,
                days,
                hours,
                minutes,
                seconds,
            }
        })
        .name("duration")
}

/// Parses an ISO-8601 duration such as `PT5M`.
pub fn parse_duration(input: &str) -> Result<Duration, Error> {
    let invalid = |message: String| Error::InvalidDuration {
        input: input.to_owned(),
        message,
    };

    let trimmed = input.trim();
    if trimmed.starts_with('-') {
        return Err(invalid("negative durations are not supported".to_owned()));
    }

    let components = duration()
        .parse(trimmed.as_bytes())
        .map_err(|e| invalid(format!("{e}")))?;

    if components.is_empty() {
        return Err(invalid("no duration components".to_owned()));
    }

    to_duration(components).ok_or_else(|| invalid("duration out of range".to_owned()))
}

fn to_duration(c: Components) -> Option<Duration> {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;

    let parts = [
        (c.years, 365 * DAY),
        (c.months, 30 * DAY),
        (c.weeks, 7 * DAY),
        (c.days, DAY),
        (c.hours, HOUR),
        (c.minutes, MINUTE),
        (c.seconds.map(|(whole, _)| whole), 1),
    ];

    let mut total: u64 = 0;
    for (value, unit) in parts {
        if let Some(value) = value {
            total = total.checked_add(value.checked_mul(unit)?)?;
        }
    }

    let nanos = c.seconds.map(|(_, nanos)| nanos).unwrap_or(0);

    Duration::try_seconds(i64::try_from(total).ok()?)?
        .checked_add(&Duration::nanoseconds(nanos as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minutes() {
        assert_eq!(parse_duration("PT5M").unwrap(), Duration::minutes(5));
    }

    #[test]
    fn test_mixed_components() {
        assert_eq!(
            parse_duration("P1DT2H30M15S").unwrap(),
            Duration::days(1) + Duration::hours(2) + Duration::minutes(30) + Duration::seconds(15)
        );
        assert_eq!(parse_duration("P2W").unwrap(), Duration::days(14));
        assert_eq!(parse_duration("P1Y").unwrap(), Duration::days(365));
        assert_eq!(parse_duration("P1M").unwrap(), Duration::days(30));
        assert_eq!(parse_duration(" PT1H ").unwrap(), Duration::hours(1));
    }

    #[test]
    fn test_month_and_minute_are_positional() {
        assert_eq!(
            parse_duration("P1MT1M").unwrap(),
            Duration::days(30) + Duration::minutes(1)
        );
    }

    #[test]
    fn test_fractional_seconds() {
        assert_eq!(parse_duration("PT0.5S").unwrap(), Duration::milliseconds(500));
        assert_eq!(parse_duration("PT1,25S").unwrap(), Duration::milliseconds(1250));
    }

    #[test]
    fn test_invalid() {
        for input in [
            "", "P", "PT", "5M", "PT5", "PT5X", "P1H", "-PT5M", "PT5M extra", "P1DT", "P1YT",
        ] {
            assert!(
                matches!(parse_duration(input), Err(Error::InvalidDuration { .. })),
                "{input:?} should not parse"
            );
        }
    }
}
