//! Business-local calendar ↔ UTC conversion.
//!
//! A business-local day generally straddles two UTC dates, so day queries are
//! always expressed as a UTC `Span` compared by inequality, never by matching
//! date strings.

use chrono::{
    DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeDelta, TimeZone,
    Timelike, Utc, Weekday,
};
use chrono_tz::Tz;

use crate::model::{Ms, Span};

use super::EngineError;

const MINUTES_PER_DAY: u16 = 24 * 60;

/// Strict `YYYY-MM-DD`.
pub fn parse_calendar_date(s: &str) -> Result<NaiveDate, EngineError> {
    let b = s.as_bytes();
    let shaped = b.len() == 10
        && b[4] == b'-'
        && b[7] == b'-'
        && b.iter()
            .enumerate()
            .all(|(i, c)| i == 4 || i == 7 || c.is_ascii_digit());
    if !shaped {
        return Err(EngineError::InvalidDateFormat(s.to_string()));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| EngineError::InvalidDateFormat(s.to_string()))
}

/// `HH:MM` or `HH:MM:SS` → minute of day. `24:00` only when `allow_end_of_day`.
pub fn parse_time_of_day(s: &str, allow_end_of_day: bool) -> Result<u16, EngineError> {
    let bad = || EngineError::InvalidTime(s.to_string());
    let mut parts = s.trim().split(':');
    let hour: u16 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
    let minute: u16 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(bad)?;
    if let Some(sec) = parts.next()
        && sec.parse::<u16>().ok() != Some(0)
    {
        return Err(bad());
    }
    if parts.next().is_some() || minute >= 60 {
        return Err(bad());
    }
    match hour {
        0..=23 => Ok(hour * 60 + minute),
        24 if minute == 0 && allow_end_of_day => Ok(MINUTES_PER_DAY),
        _ => Err(bad()),
    }
}

pub fn parse_tz(name: &str) -> Option<Tz> {
    name.trim().parse::<Tz>().ok()
}

fn utc_datetime(ms: Ms) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

pub fn to_local(ms: Ms, tz: Tz) -> Option<DateTime<Tz>> {
    utc_datetime(ms).map(|dt| dt.with_timezone(&tz))
}

/// RFC3339 form for display and error messages.
pub fn format_utc(ms: Ms) -> String {
    match utc_datetime(ms) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Secs, true),
        None => ms.to_string(),
    }
}

/// RFC3339 (any offset) or integer milliseconds.
pub fn parse_instant(s: &str) -> Result<Ms, EngineError> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<Ms>() {
        return Ok(ms);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| EngineError::InvalidTime(s.to_string()))
}

/// The first existing local instant at or after `naive`. Only differs from
/// `naive` inside a DST gap.
fn first_instant_at_or_after(naive: NaiveDateTime, tz: Tz) -> Option<DateTime<Tz>> {
    let mut candidate = naive;
    // Real-world gaps are at most a few hours.
    for _ in 0..=16 {
        if let Some(dt) = tz.from_local_datetime(&candidate).earliest() {
            return Some(dt);
        }
        candidate += TimeDelta::minutes(15);
    }
    None
}

fn local_midnight_utc(date: NaiveDate, tz: Tz) -> Result<Ms, EngineError> {
    let naive = date.and_time(NaiveTime::MIN);
    first_instant_at_or_after(naive, tz)
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| EngineError::InvalidTime(format!("no local midnight for {date} in {tz}")))
}

/// `[local 00:00 on date, local 00:00 on date + 1)` as a UTC span. The end is
/// exclusive, so 23h and 25h DST days come out exactly.
pub fn business_day_range_utc(date: NaiveDate, tz: Tz) -> Result<Span, EngineError> {
    let next = date
        .succ_opt()
        .ok_or_else(|| EngineError::InvalidDateFormat(date.to_string()))?;
    let start = local_midnight_utc(date, tz)?;
    let end = local_midnight_utc(next, tz)?;
    Ok(Span::new(start, end))
}

/// Business-local date + minute of day → UTC. Ambiguous (fall back) resolves
/// to the earlier instant; a time inside a spring-forward gap is rejected.
/// Minute 1440 means local midnight of the next day.
pub fn local_to_utc(date: NaiveDate, minute_of_day: u16, tz: Tz) -> Result<Ms, EngineError> {
    if minute_of_day == MINUTES_PER_DAY {
        let next = date
            .succ_opt()
            .ok_or_else(|| EngineError::InvalidDateFormat(date.to_string()))?;
        return local_midnight_utc(next, tz);
    }
    let time = NaiveTime::from_hms_opt((minute_of_day / 60) as u32, (minute_of_day % 60) as u32, 0)
        .ok_or_else(|| EngineError::InvalidTime(format!("minute {minute_of_day}")))?;
    let naive = date.and_time(time);
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| EngineError::InvalidTime(format!("{naive} does not exist in {tz}")))
}

pub fn local_date(ms: Ms, tz: Tz) -> Option<NaiveDate> {
    to_local(ms, tz).map(|dt| dt.date_naive())
}

/// Local weekday and minute of day, as used by rate tier bands.
pub fn local_weekday_and_minute(ms: Ms, tz: Tz) -> Option<(Weekday, u16)> {
    to_local(ms, tz).map(|dt| (dt.weekday(), (dt.hour() * 60 + dt.minute()) as u16))
}

pub fn local_year(ms: Ms, tz: Tz) -> Option<i32> {
    to_local(ms, tz).map(|dt| dt.year())
}
