use nom::{
    character::complete::{char, digit1},
    combinator::{all_consuming, opt, rest},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest delay a timer may declare: one hundred years.
pub const MAX_TIMER_MILLIS: i64 = 100 * 365 * DAY_MILLIS;

const SECOND_MILLIS: i64 = 1_000;
const MINUTE_MILLIS: i64 = 60 * SECOND_MILLIS;
const HOUR_MILLIS: i64 = 60 * MINUTE_MILLIS;
const DAY_MILLIS: i64 = 24 * HOUR_MILLIS;
const WEEK_MILLIS: i64 = 7 * DAY_MILLIS;

/// Timer of a catch event or boundary event.
///
/// Serialized as an ISO-8601 string: `PT30S` for a duration, `R3/PT10S` for a cycle
/// and `R/PT1M` for an unbounded cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TimerDefinition {
    Duration { millis: i64 },
    Cycle { repetitions: Option<u32>, interval_millis: i64 },
}

impl TimerDefinition {
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        let timer = if input.starts_with('R') {
            let (_, (count, interval)) = cycle(input)
                .map_err(|_| format!("cycle '{input}' must look like R<n>/<duration>"))?;
            let repetitions = count
                .map(|n| {
                    n.parse::<u32>()
                        .map_err(|_| format!("invalid repetition count in '{input}'"))
                })
                .transpose()?;
            TimerDefinition::Cycle {
                repetitions,
                interval_millis: parse_duration(interval)?,
            }
        } else {
            TimerDefinition::Duration {
                millis: parse_duration(input)?,
            }
        };
        timer.check().map_err(|reason| format!("timer '{input}' {reason}"))?;
        Ok(timer)
    }

    /// Range checks that hold for every deployable timer.
    pub fn check(&self) -> Result<(), String> {
        let delay = self.first_delay();
        if !(0..=MAX_TIMER_MILLIS).contains(&delay) {
            return Err(format!(
                "must delay between 0 and {MAX_TIMER_MILLIS} ms, but delays {delay} ms"
            ));
        }
        match self {
            TimerDefinition::Cycle {
                repetitions: Some(0),
                ..
            } => Err("must repeat at least once".to_string()),
            TimerDefinition::Cycle {
                interval_millis: 0, ..
            } => Err("has a zero interval".to_string()),
            _ => Ok(()),
        }
    }

    /// Delay until the first fire.
    pub fn first_delay(&self) -> i64 {
        match self {
            TimerDefinition::Duration { millis } => *millis,
            TimerDefinition::Cycle {
                interval_millis, ..
            } => *interval_millis,
        }
    }

    /// Repetition count in the timer record encoding: `-1` repeats forever.
    pub fn repetitions(&self) -> i32 {
        match self {
            TimerDefinition::Duration { .. } => 1,
            TimerDefinition::Cycle {
                repetitions: Some(n),
                ..
            } => i32::try_from(*n).unwrap_or(i32::MAX),
            TimerDefinition::Cycle {
                repetitions: None, ..
            } => -1,
        }
    }
}

impl TryFrom<String> for TimerDefinition {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TimerDefinition::parse(&value)
    }
}

impl From<TimerDefinition> for String {
    fn from(value: TimerDefinition) -> Self {
        value.to_string()
    }
}

impl fmt::Display for TimerDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerDefinition::Duration { millis } => f.write_str(&format_duration(*millis)),
            TimerDefinition::Cycle {
                repetitions,
                interval_millis,
            } => {
                let count = repetitions.map(|n| n.to_string()).unwrap_or_default();
                write!(f, "R{}/{}", count, format_duration(*interval_millis))
            }
        }
    }
}

/// Seconds with an optional fraction, as digit strings.
type Seconds<'a> = (&'a str, Option<&'a str>);

/// `[nW][nD]` and the optional `T[nH][nM][n[.f]S]` part.
type DurationParts<'a> = (
    Option<&'a str>,
    Option<&'a str>,
    Option<(Option<&'a str>, Option<&'a str>, Option<Seconds<'a>>)>,
);

fn cycle(input: &str) -> IResult<&str, (Option<&str>, &str)> {
    all_consuming(pair(delimited(char('R'), opt(digit1), char('/')), rest))(input)
}

fn component<'a>(unit: char) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(digit1, char(unit))
}

fn seconds(input: &str) -> IResult<&str, Seconds<'_>> {
    terminated(pair(digit1, opt(preceded(char('.'), digit1))), char('S'))(input)
}

fn duration(input: &str) -> IResult<&str, DurationParts<'_>> {
    all_consuming(preceded(
        char('P'),
        tuple((
            opt(component('W')),
            opt(component('D')),
            opt(preceded(
                char('T'),
                tuple((opt(component('H')), opt(component('M')), opt(seconds))),
            )),
        )),
    ))(input)
}

fn scaled(digits: &str, factor: i64) -> Option<i64> {
    digits.parse::<i64>().ok()?.checked_mul(factor)
}

/// Milliseconds of a fraction of a second; digits past the third are dropped.
fn fraction_millis(digits: &str) -> i64 {
    digits
        .bytes()
        .chain(std::iter::repeat(b'0'))
        .take(3)
        .fold(0, |acc, d| acc * 10 + i64::from(d - b'0'))
}

/// Parses an ISO-8601 duration (`P[nW][nD][T[nH][nM][n[.f]S]]`) into milliseconds.
pub fn parse_duration(input: &str) -> Result<i64, String> {
    let (_, (weeks, days, time)) = duration(input)
        .map_err(|_| format!("duration '{input}' is not an ISO-8601 duration like PT30S"))?;
    let (hours, minutes, secs) = match time {
        Some((None, None, None)) => {
            return Err(format!("duration '{input}' has no time components after 'T'"))
        }
        Some(parts) => parts,
        None => (None, None, None),
    };
    if weeks.is_none() && days.is_none() && time.is_none() {
        return Err(format!("duration '{input}' is empty"));
    }

    let out_of_range = || format!("duration '{input}' exceeds {MAX_TIMER_MILLIS} ms");
    let parts = [
        weeks.map(|n| scaled(n, WEEK_MILLIS)),
        days.map(|n| scaled(n, DAY_MILLIS)),
        hours.map(|n| scaled(n, HOUR_MILLIS)),
        minutes.map(|n| scaled(n, MINUTE_MILLIS)),
        secs.map(|(whole, fraction)| {
            scaled(whole, SECOND_MILLIS)?.checked_add(fraction.map_or(0, fraction_millis))
        }),
    ];
    let millis = parts
        .into_iter()
        .flatten()
        .try_fold(0i64, |total, part| total.checked_add(part?))
        .ok_or_else(out_of_range)?;
    if millis > MAX_TIMER_MILLIS {
        return Err(out_of_range());
    }
    Ok(millis)
}

fn format_duration(millis: i64) -> String {
    if millis % 1_000 == 0 {
        format!("PT{}S", millis / 1_000)
    } else {
        format!("PT{}.{:03}S", millis / 1_000, millis % 1_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_durations() {
        assert_eq!(parse_duration("PT30S").unwrap(), 30_000);
        assert_eq!(parse_duration("PT1M30S").unwrap(), 90_000);
        assert_eq!(parse_duration("P1DT2H").unwrap(), 93_600_000);
        assert_eq!(parse_duration("PT0.5S").unwrap(), 500);
        assert_eq!(parse_duration("P1W").unwrap(), 604_800_000);
        assert!(parse_duration("30S").is_err());
        assert!(parse_duration("PT").is_err());
        assert!(parse_duration("P1H").is_err());
        assert!(parse_duration("PT5").is_err());
        assert!(parse_duration("P").is_err());
        assert!(parse_duration("PT1S1M").is_err());
    }

    #[test]
    fn test_fractions_keep_milliseconds() {
        assert_eq!(parse_duration("PT1.25S").unwrap(), 1_250);
        assert_eq!(parse_duration("PT0.0019S").unwrap(), 1);
        assert_eq!(parse_duration("PT2M0.5S").unwrap(), 120_500);
    }

    #[test]
    fn test_huge_durations_are_rejected() {
        for text in [
            "P99999999999999D",
            "PT9223372036854775807S",
            "PT99999999999999999999S",
            "P5300W",
        ] {
            let err = parse_duration(text).unwrap_err();
            assert!(err.contains("exceeds"), "{text}: {err}");
        }
        assert!(TimerDefinition::parse("R2/P99999999999999D").is_err());
        assert_eq!(parse_duration("P5200W").unwrap(), 5_200 * WEEK_MILLIS);
        assert!(TimerDefinition::Duration { millis: i64::MAX }.check().is_err());
        assert!(TimerDefinition::Duration { millis: -1 }.check().is_err());
    }

    #[test]
    fn test_parse_cycles() {
        assert_eq!(
            TimerDefinition::parse("R3/PT10S").unwrap(),
            TimerDefinition::Cycle {
                repetitions: Some(3),
                interval_millis: 10_000
            }
        );
        let unbounded = TimerDefinition::parse("R/PT1M").unwrap();
        assert_eq!(unbounded.repetitions(), -1);
        assert_eq!(unbounded.first_delay(), 60_000);
        assert!(TimerDefinition::parse("R0/PT1S").is_err());
        assert!(TimerDefinition::parse("R2/PT0S").is_err());
        assert!(TimerDefinition::parse("R2PT1S").is_err());
    }

    #[test]
    fn test_display_parses_back() {
        for text in ["PT45S", "R2/PT1.250S", "R/PT60S"] {
            let timer = TimerDefinition::parse(text).unwrap();
            assert_eq!(TimerDefinition::parse(&timer.to_string()).unwrap(), timer);
        }
    }
}
