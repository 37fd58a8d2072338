//! Schedule expressions and next-firing computation.
//!
//! Accepted forms (all interpreted in UTC):
//!
//! - `@every <duration>`, e.g. `@every 90s`, `@every 1h30m`, `@every 250ms`.
//! - Descriptors: `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`,
//!   `@midnight`, `@hourly`.
//! - Classic 5-field cron, `min hour day-of-month month day-of-week`, where
//!   numeric weekdays run `0-7` with both `0` and `7` meaning Sunday.
//! - 6 or 7 field cron with a leading seconds field (and optional trailing
//!   year), passed to the `cron` crate unchanged.

use std::fmt;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule as CronSchedule;
use tracing::warn;

use crate::error::ScheduleError;

#[derive(Debug, Clone)]
enum ScheduleKind {
  Cron(Box<CronSchedule>),
  Every(StdDuration),
}

/// A parsed schedule expression.
#[derive(Debug, Clone)]
pub struct Schedule {
  source: String,
  kind: ScheduleKind,
}

impl Schedule {
  /// Parses a schedule expression. See the module docs for accepted forms.
  pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
      return Err(ScheduleError::Empty);
    }

    let kind = if let Some(rest) = trimmed.strip_prefix("@every") {
      ScheduleKind::Every(parse_every(rest.trim())?)
    } else if trimmed.starts_with('@') {
      ScheduleKind::Cron(Box::new(parse_cron(descriptor_to_cron(trimmed)?)?))
    } else {
      let fields: Vec<&str> = trimmed.split_whitespace().collect();
      match fields.len() {
        5 => {
          let dow = translate_weekday_field(fields[4]);
          let expr = format!(
            "0 {} {} {} {} {}",
            fields[0], fields[1], fields[2], fields[3], dow
          );
          ScheduleKind::Cron(Box::new(parse_cron(&expr)?))
        }
        6 | 7 => ScheduleKind::Cron(Box::new(parse_cron(trimmed)?)),
        n => return Err(ScheduleError::FieldCount(n)),
      }
    };

    Ok(Self {
      source: trimmed.to_string(),
      kind,
    })
  }

  /// Calculates the first firing strictly after `reference_time`.
  /// Returns `None` if the schedule has no future firings.
  pub fn next_after(&self, reference_time: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match &self.kind {
      ScheduleKind::Cron(schedule) => schedule.after(&reference_time).next(),
      ScheduleKind::Every(interval) => match ChronoDuration::from_std(*interval) {
        Ok(chrono_interval) => reference_time.checked_add_signed(chrono_interval),
        Err(e) => {
          warn!("Failed to convert interval duration {:?}: {}", interval, e);
          None
        }
      },
    }
  }

  /// Next firing after the current time.
  pub fn next_from_now(&self) -> Option<DateTime<Utc>> {
    self.next_after(Utc::now())
  }

  /// The fixed interval of an `@every` schedule.
  pub fn interval(&self) -> Option<StdDuration> {
    match self.kind {
      ScheduleKind::Every(d) => Some(d),
      ScheduleKind::Cron(_) => None,
    }
  }

  /// The expression this schedule was parsed from.
  pub fn as_str(&self) -> &str {
    &self.source
  }
}

impl FromStr for Schedule {
  type Err = ScheduleError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Schedule::parse(s)
  }
}

impl fmt::Display for Schedule {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.source)
  }
}

fn parse_cron(expression: &str) -> Result<CronSchedule, ScheduleError> {
  CronSchedule::from_str(expression).map_err(|e| ScheduleError::InvalidCron {
    expression: expression.to_string(),
    reason: e.to_string(),
  })
}

// The cron crate numbers weekdays 1-7 starting on Sunday.
fn descriptor_to_cron(descriptor: &str) -> Result<&'static str, ScheduleError> {
  match descriptor.to_ascii_lowercase().as_str() {
    "@yearly" | "@annually" => Ok("0 0 0 1 1 *"),
    "@monthly" => Ok("0 0 0 1 * *"),
    "@weekly" => Ok("0 0 0 * * 1"),
    "@daily" | "@midnight" => Ok("0 0 0 * * *"),
    "@hourly" => Ok("0 0 * * * *"),
    _ => Err(ScheduleError::UnknownDescriptor(descriptor.to_string())),
  }
}

/// Parses durations such as `90s`, `1h30m`, `250ms`.
fn parse_every(input: &str) -> Result<StdDuration, ScheduleError> {
  let invalid = || ScheduleError::InvalidEvery(input.to_string());
  if input.is_empty() {
    return Err(invalid());
  }

  let mut total = StdDuration::ZERO;
  let mut rest = input;
  while !rest.is_empty() {
    let digits_end = rest
      .find(|c: char| !c.is_ascii_digit())
      .ok_or_else(invalid)?;
    if digits_end == 0 {
      return Err(invalid());
    }
    let value: u64 = rest[..digits_end].parse().map_err(|_| invalid())?;
    rest = &rest[digits_end..];

    let unit_end = rest
      .find(|c: char| c.is_ascii_digit())
      .unwrap_or(rest.len());
    let part = match &rest[..unit_end] {
      "ms" => StdDuration::from_millis(value),
      "s" => StdDuration::from_secs(value),
      "m" => StdDuration::from_secs(value.checked_mul(60).ok_or_else(invalid)?),
      "h" => StdDuration::from_secs(value.checked_mul(3600).ok_or_else(invalid)?),
      _ => return Err(invalid()),
    };
    total = total.checked_add(part).ok_or_else(invalid)?;
    rest = &rest[unit_end..];
  }

  if total.is_zero() {
    return Err(invalid());
  }
  Ok(total)
}

/// Rewrites a classic day-of-week field (`0-7`, Sunday = 0 or 7) into the
/// cron crate's numbering (`1-7`, Sunday = 1). Named days and `*` parts are
/// left untouched; numeric ranges and steps are expanded into explicit lists.
fn translate_weekday_field(field: &str) -> String {
  field
    .split(',')
    .map(translate_weekday_part)
    .collect::<Vec<_>>()
    .join(",")
}

fn translate_weekday_part(part: &str) -> String {
  let (base, step) = match part.split_once('/') {
    Some((base, step)) => (base, Some(step)),
    None => (part, None),
  };
  if base == "*" || base == "?" {
    // `*/n` selects the same days under both numberings.
    return part.to_string();
  }

  let bounds = match base.split_once('-') {
    Some((lo, hi)) => lo.parse::<u32>().ok().zip(hi.parse::<u32>().ok()),
    None => base.parse::<u32>().ok().map(|v| {
      let hi = if step.is_some() { 6 } else { v };
      (v, hi)
    }),
  };
  let step = match step.map(str::parse::<u32>) {
    None => Some(1),
    Some(Ok(s)) if s > 0 => Some(s),
    Some(_) => None,
  };

  match (bounds, step) {
    (Some((lo, hi)), Some(step)) if lo <= hi && hi <= 7 => {
      let mut days: Vec<u32> = (lo..=hi).step_by(step as usize).map(|d| d % 7 + 1).collect();
      days.sort_unstable();
      days.dedup();
      days
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(",")
    }
    // Names or malformed input: let the cron parser report it.
    _ => part.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{Datelike, TimeZone, Timelike, Weekday};

  fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
  }

  #[test]
  fn five_field_every_five_minutes() {
    let schedule = Schedule::parse("*/5 * * * *").unwrap();
    let next = schedule.next_after(at(2024, 3, 1, 10, 2, 30)).unwrap();
    assert_eq!(next, at(2024, 3, 1, 10, 5, 0));
    let after = schedule.next_after(next).unwrap();
    assert_eq!(after, at(2024, 3, 1, 10, 10, 0));
  }

  #[test]
  fn every_shorthand() {
    let schedule = Schedule::parse("@every 1h30m").unwrap();
    assert_eq!(schedule.interval(), Some(StdDuration::from_secs(5400)));
    let base = at(2024, 3, 1, 0, 0, 0);
    assert_eq!(schedule.next_after(base).unwrap(), at(2024, 3, 1, 1, 30, 0));
    assert_eq!(
      Schedule::parse("@every 250ms").unwrap().interval(),
      Some(StdDuration::from_millis(250))
    );
  }

  #[test]
  fn rejects_bad_expressions() {
    assert_eq!(Schedule::parse("").unwrap_err(), ScheduleError::Empty);
    assert!(matches!(
      Schedule::parse("@every"),
      Err(ScheduleError::InvalidEvery(_))
    ));
    assert!(matches!(
      Schedule::parse("@every 5x"),
      Err(ScheduleError::InvalidEvery(_))
    ));
    assert!(matches!(
      Schedule::parse("@every 0s"),
      Err(ScheduleError::InvalidEvery(_))
    ));
    assert!(matches!(
      Schedule::parse("@fortnightly"),
      Err(ScheduleError::UnknownDescriptor(_))
    ));
    assert_eq!(
      Schedule::parse("* * *").unwrap_err(),
      ScheduleError::FieldCount(3)
    );
    assert!(matches!(
      Schedule::parse("61 * * * *"),
      Err(ScheduleError::InvalidCron { .. })
    ));
  }

  #[test]
  fn classic_weekday_numbering() {
    // Monday through Friday at 09:00.
    let schedule = Schedule::parse("0 9 * * 1-5").unwrap();
    // 2024-03-02 is a Saturday.
    let next = schedule.next_after(at(2024, 3, 2, 12, 0, 0)).unwrap();
    assert_eq!(next.weekday(), Weekday::Mon);
    assert_eq!(next.hour(), 9);

    // Both 0 and 7 are Sunday.
    for expr in ["0 0 * * 0", "0 0 * * 7"] {
      let next = Schedule::parse(expr)
        .unwrap()
        .next_after(at(2024, 3, 4, 0, 0, 0))
        .unwrap();
      assert_eq!(next.weekday(), Weekday::Sun, "{}", expr);
    }
  }

  #[test]
  fn weekday_field_translation() {
    assert_eq!(translate_weekday_field("1-5"), "2,3,4,5,6");
    assert_eq!(translate_weekday_field("5-7"), "1,6,7");
    assert_eq!(translate_weekday_field("0,3"), "1,4");
    assert_eq!(translate_weekday_field("*/2"), "*/2");
    assert_eq!(translate_weekday_field("1/2"), "2,4,6");
    assert_eq!(translate_weekday_field("MON-FRI"), "MON-FRI");
  }

  #[test]
  fn descriptors_and_seconds_fields() {
    let hourly = Schedule::parse("@hourly").unwrap();
    assert_eq!(
      hourly.next_after(at(2024, 3, 1, 10, 15, 0)).unwrap(),
      at(2024, 3, 1, 11, 0, 0)
    );
    let weekly = Schedule::parse("@weekly").unwrap();
    assert_eq!(
      weekly.next_after(at(2024, 3, 1, 10, 15, 0)).unwrap().weekday(),
      Weekday::Sun
    );
    let with_seconds = Schedule::parse("30 * * * * *").unwrap();
    assert_eq!(
      with_seconds.next_after(at(2024, 3, 1, 10, 15, 0)).unwrap(),
      at(2024, 3, 1, 10, 15, 30)
    );
    assert_eq!(with_seconds.to_string(), "30 * * * * *");
  }
}
