//! `-t` / `-T` time arguments.
//!
//! Absolute forms are `hhmm`, `DDhhmm`, `MMDDhhmm` and `MMDDhhmmss`, taken
//! in local time; fields left out come from the current date. Relative
//! forms start with `-` and count back from now: `-mm`, `-hhmm`, `-DDhhmm`.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, TimeZone};

fn two(digits: &str, at: usize) -> Result<u32> {
    digits[at..at + 2]
        .parse()
        .with_context(|| format!("'{}' is not a time", digits))
}

pub fn parse(spec: &str, now: DateTime<Local>) -> Result<i64> {
    let (relative, digits) = match spec.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, spec),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        bail!("'{}' is not a time (expected digits)", spec);
    }
    if relative {
        relative_time(digits, now).with_context(|| format!("Bad relative time '{}'", spec))
    } else {
        absolute_time(digits, now).with_context(|| format!("Bad absolute time '{}'", spec))
    }
}

fn relative_time(digits: &str, now: DateTime<Local>) -> Result<i64> {
    // Left-pad to DDhhmm so every length reads the same way.
    let padded = format!("{:0>6}", digits);
    if digits.len() > 6 {
        bail!("at most DDhhmm");
    }
    let (days, hours, minutes) = (two(&padded, 0)?, two(&padded, 2)?, two(&padded, 4)?);
    if digits.len() > 2 && minutes > 59 {
        bail!("minutes out of range");
    }
    if digits.len() > 4 && hours > 23 {
        bail!("hours out of range");
    }
    let back = Duration::days(days.into()) + Duration::hours(hours.into()) + Duration::minutes(minutes.into());
    Ok((now - back).timestamp())
}

fn absolute_time(digits: &str, now: DateTime<Local>) -> Result<i64> {
    let (month, day, rest) = match digits.len() {
        4 => (now.month(), now.day(), digits),
        6 => (now.month(), two(digits, 0)?, &digits[2..]),
        8 | 10 => (two(digits, 0)?, two(digits, 2)?, &digits[4..]),
        _ => bail!("expected hhmm, DDhhmm, MMDDhhmm or MMDDhhmmss"),
    };
    let hour = two(rest, 0)?;
    let minute = two(rest, 2)?;
    let second = if rest.len() == 6 { two(rest, 4)? } else { 0 };

    let naive = NaiveDate::from_ymd_opt(now.year(), month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .context("no such date")?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.timestamp())
        .context("time does not exist in the local zone")
}
