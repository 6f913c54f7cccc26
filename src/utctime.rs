//! UTC time helpers on top of [`hifitime::Epoch`].
//!
//! All catalog times are UTC with microsecond resolution. The helpers here
//! cover the two textual formats the crate exchanges with the outside world:
//! ISO-8601 with fractional seconds (catalog CSV files, waveform
//! fingerprints) and the split Gregorian fields used by the `hypoDD` input
//! and output files.

use hifitime::{Duration, Epoch};

use crate::rtdd_errors::RtddError;

/// Gregorian UTC decomposition of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTimeParts {
    pub year: i32,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub microsecond: u32,
}

/// Build an epoch from split Gregorian UTC fields.
pub fn from_parts(parts: &DateTimeParts) -> Epoch {
    Epoch::from_gregorian_utc(
        parts.year,
        parts.month,
        parts.day,
        parts.hour,
        parts.minute,
        parts.second,
        parts.microsecond * 1_000,
    )
}

/// Decompose an epoch into Gregorian UTC fields (microsecond resolution,
/// nanoseconds truncated).
pub fn to_parts(time: Epoch) -> DateTimeParts {
    let (year, month, day, hour, minute, second, nanos) = time.to_gregorian_utc();
    DateTimeParts {
        year,
        month,
        day,
        hour,
        minute,
        second,
        microsecond: nanos / 1_000,
    }
}

/// Format an epoch as `YYYY-MM-DDThh:mm:ss.ffffffZ`.
pub fn to_iso(time: Epoch) -> String {
    let p = to_parts(time);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}Z",
        p.year, p.month, p.day, p.hour, p.minute, p.second, p.microsecond
    )
}

/// Parse `YYYY-MM-DDThh:mm:ss[.ffffff][Z]` into an epoch.
///
/// The fractional part may carry one to nine digits; a trailing `Z` is
/// optional. Anything else is a parse error.
pub fn from_iso(text: &str) -> Result<Epoch, RtddError> {
    let bad = || RtddError::Parse(format!("invalid ISO-8601 UTC time '{text}'"));

    let s = text.trim().trim_end_matches('Z');
    let (date, time) = s.split_once('T').ok_or_else(bad)?;

    let mut date_it = date.split('-');
    let year: i32 = date_it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let month: u8 = date_it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let day: u8 = date_it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    if date_it.next().is_some() {
        return Err(bad());
    }

    let (hms, frac) = match time.split_once('.') {
        Some((hms, frac)) => (hms, Some(frac)),
        None => (time, None),
    };
    let mut time_it = hms.split(':');
    let hour: u8 = time_it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let minute: u8 = time_it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    let second: u8 = time_it.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
    if time_it.next().is_some() {
        return Err(bad());
    }

    let nanos = match frac {
        None => 0,
        Some(frac) => {
            if frac.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                return Err(bad());
            }
            let digits: u32 = frac.parse().map_err(|_| bad())?;
            digits * 10u32.pow(9 - frac.len() as u32)
        }
    };

    Ok(Epoch::from_gregorian_utc(
        year, month, day, hour, minute, second, nanos,
    ))
}

/// Day of the year (1-366) of an epoch.
pub fn day_of_year(time: Epoch) -> u16 {
    const CUM_DAYS: [u16; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];
    let p = to_parts(time);
    let leap = (p.year % 4 == 0 && p.year % 100 != 0) || p.year % 400 == 0;
    let mut doy = CUM_DAYS[(p.month - 1) as usize] + p.day as u16;
    if leap && p.month > 2 {
        doy += 1;
    }
    doy
}

/// Current wall-clock time. Falls back to the Unix epoch on platforms
/// without a usable system clock.
pub fn now() -> Epoch {
    Epoch::now().unwrap_or_else(|_| Epoch::from_gregorian_utc(1970, 1, 1, 0, 0, 0, 0))
}

/// Span between two epochs in seconds (positive when `a` is later).
#[inline]
pub fn seconds_between(a: Epoch, b: Epoch) -> f64 {
    (a - b).to_seconds()
}

/// Shift an epoch by a signed amount of seconds.
#[inline]
pub fn add_seconds(time: Epoch, seconds: f64) -> Epoch {
    time + Duration::from_seconds(seconds)
}
