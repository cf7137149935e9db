//! CyclePoint & Interval: totally-ordered time-like values and their
//! arithmetic, across an integer calendar and three fixed-length calendars
//! plus real ISO-8601 Gregorian.
//!
//! Grounded in `knhk-workflow-engine/src/case.rs`'s value-type idiom
//! (newtype wrapper, `Display`, `parse_str` returning `SchedulerResult`).

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{SchedulerError, SchedulerResult};

/// The calendar system a CyclePoint is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Calendar {
    /// Plain integers (no real-world time semantics)
    Integer,
    /// Proleptic Gregorian calendar
    Gregorian,
    /// Fixed 360-day calendar: 12 months of 30 days
    Day360,
    /// Fixed 365-day calendar: no leap years, ever
    Day365,
    /// Fixed 366-day calendar: every year has 366 days
    Day366,
}

impl fmt::Display for Calendar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Calendar::Integer => "integer",
            Calendar::Gregorian => "gregorian",
            Calendar::Day360 => "360day",
            Calendar::Day365 => "365day",
            Calendar::Day366 => "366day",
        };
        write!(f, "{s}")
    }
}

/// A broken-down calendar instant: year/month/day/hour/minute/second.
/// Valid ranges depend on `calendar` (e.g. Day360 months always have 30 days).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarInstant {
    pub calendar: Calendar,
    pub year: i64,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl CalendarInstant {
    fn month_len(calendar: Calendar, year: i64, month: u8) -> u8 {
        match calendar {
            Calendar::Day360 => 30,
            Calendar::Day365 => gregorian_month_len(year, month, false),
            Calendar::Day366 => gregorian_month_len(year, month, true),
            Calendar::Gregorian => {
                gregorian_month_len(year, month, is_gregorian_leap(year))
            }
            Calendar::Integer => unreachable!("integer calendar has no months"),
        }
    }

    /// Linear ordinal index of this instant's day within its calendar,
    /// counted from a fixed epoch (year 0, Jan 1 = day 0). Only valid for
    /// comparing/arithmetic within the *same* calendar.
    fn day_ordinal(&self) -> i64 {
        match self.calendar {
            Calendar::Day360 => {
                self.year * 360 + (self.month as i64 - 1) * 30 + (self.day as i64 - 1)
            }
            Calendar::Day365 => days_since_epoch_fixed(self.year, self.month, self.day, 365),
            Calendar::Day366 => days_since_epoch_fixed(self.year, self.month, self.day, 366),
            Calendar::Gregorian => {
                // chrono handles real (non-fixed) Gregorian leap years correctly.
                let date = chrono::NaiveDate::from_ymd_opt(
                    self.year as i32,
                    self.month as u32,
                    self.day as u32,
                )
                .expect("CalendarInstant invariant: valid Gregorian date");
                date.num_days_from_ce() as i64
            }
            Calendar::Integer => unreachable!(),
        }
    }

    fn seconds_of_day(&self) -> i64 {
        self.hour as i64 * 3600 + self.minute as i64 * 60 + self.second as i64
    }

    fn from_ordinal_and_seconds(calendar: Calendar, mut day_ord: i64, mut sod: i64) -> Self {
        if sod < 0 {
            let borrow = (-sod + 86_399) / 86_400;
            sod += borrow * 86_400;
            day_ord -= borrow;
        }
        let extra_days = sod / 86_400;
        day_ord += extra_days;
        sod %= 86_400;

        let (year, month, day) = match calendar {
            Calendar::Day360 => {
                let year = day_ord.div_euclid(360);
                let rem = day_ord.rem_euclid(360);
                let month = rem / 30 + 1;
                let day = rem % 30 + 1;
                (year, month as u8, day as u8)
            }
            Calendar::Day365 => ymd_from_days_fixed(day_ord, 365),
            Calendar::Day366 => ymd_from_days_fixed(day_ord, 366),
            Calendar::Gregorian => {
                let date = chrono::NaiveDate::from_num_days_from_ce_opt(day_ord as i32)
                    .expect("day ordinal in range");
                (date.year() as i64, date.month() as u8, date.day() as u8)
            }
            Calendar::Integer => unreachable!(),
        };

        CalendarInstant {
            calendar,
            year,
            month,
            day,
            hour: (sod / 3600) as u8,
            minute: ((sod % 3600) / 60) as u8,
            second: (sod % 60) as u8,
        }
    }
}

use chrono::Datelike;

fn is_gregorian_leap(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn gregorian_month_len(_year: i64, month: u8, leap: bool) -> u8 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if leap {
                29
            } else {
                28
            }
        }
        _ => unreachable!("month out of range"),
    }
}

fn days_since_epoch_fixed(year: i64, month: u8, day: u8, year_len: i64) -> i64 {
    year * year_len + fixed_cal_day_of_year(year, month, day, year_len == 366)
}

fn fixed_cal_day_of_year(_year: i64, month: u8, day: u8, leap: bool) -> i64 {
    let mut total = 0i64;
    for m in 1..month {
        total += gregorian_month_len(0, m, leap) as i64;
    }
    total + (day as i64 - 1)
}

fn ymd_from_days_fixed(day_ord: i64, year_len: i64) -> (i64, u8, u8) {
    let year = day_ord.div_euclid(year_len);
    let mut rem = day_ord.rem_euclid(year_len);
    let leap = year_len == 366;
    let mut month = 1u8;
    loop {
        let len = gregorian_month_len(0, month, leap) as i64;
        if rem < len {
            break;
        }
        rem -= len;
        month += 1;
    }
    (year, month, (rem + 1) as u8)
}

/// An abstract totally-ordered cycle point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CyclePoint {
    Integer(i64),
    Calendar(CalendarInstant),
}

impl CyclePoint {
    pub fn integer(n: i64) -> Self {
        CyclePoint::Integer(n)
    }

    pub fn gregorian(year: i64, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> Self {
        CyclePoint::Calendar(CalendarInstant {
            calendar: Calendar::Gregorian,
            year,
            month,
            day,
            hour,
            minute,
            second,
        })
    }

    pub fn calendar(&self) -> Calendar {
        match self {
            CyclePoint::Integer(_) => Calendar::Integer,
            CyclePoint::Calendar(c) => c.calendar,
        }
    }

    /// Total order within the same calendar; an error if the two points were
    /// drawn from different calendars (never compared implicitly).
    pub fn compare(&self, other: &Self) -> SchedulerResult<Ordering> {
        match (self, other) {
            (CyclePoint::Integer(a), CyclePoint::Integer(b)) => Ok(a.cmp(b)),
            (CyclePoint::Calendar(a), CyclePoint::Calendar(b)) if a.calendar == b.calendar => {
                Ok((a.day_ordinal(), a.seconds_of_day()).cmp(&(b.day_ordinal(), b.seconds_of_day())))
            }
            _ => Err(SchedulerError::CalendarMismatch(
                self.calendar().to_string(),
                other.calendar().to_string(),
            )),
        }
    }

    pub fn add(&self, interval: &Interval) -> SchedulerResult<Self> {
        match (self, interval) {
            (CyclePoint::Integer(p), Interval::Integer(n)) => Ok(CyclePoint::Integer(p + n)),
            (CyclePoint::Calendar(c), Interval::Calendar(iv)) => {
                let mut year = c.year;
                let mut month = c.month as i64 - 1 + iv.months + iv.years * 12;
                year += month.div_euclid(12);
                month = month.rem_euclid(12);
                let month = (month + 1) as u8;
                let max_day = CalendarInstant::month_len(c.calendar, year, month);
                let day = c.day.min(max_day);
                let clamped = CalendarInstant {
                    calendar: c.calendar,
                    year,
                    month,
                    day,
                    hour: c.hour,
                    minute: c.minute,
                    second: c.second,
                };
                let day_ord = clamped.day_ordinal() + iv.days;
                let sod = clamped.seconds_of_day() + iv.hours * 3600 + iv.minutes * 60 + iv.seconds;
                Ok(CyclePoint::Calendar(CalendarInstant::from_ordinal_and_seconds(
                    c.calendar, day_ord, sod,
                )))
            }
            _ => Err(SchedulerError::CalendarMismatch(
                self.calendar().to_string(),
                "interval".to_string(),
            )),
        }
    }

    pub fn sub_interval(&self, interval: &Interval) -> SchedulerResult<Self> {
        self.add(&interval.negate())
    }

    /// Real wall-clock instant this point denotes, for xtrigger evaluation
    /// (spec.md §4.5 `wall_clock(offset)`). Fixed-length calendars (360/365/
    /// 366-day) have no real-world meaning, so their y-m-d-h-m-s components
    /// are read literally as UTC; an integer point has none at all.
    pub fn as_utc(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        match self {
            CyclePoint::Integer(_) => None,
            CyclePoint::Calendar(c) => {
                let date = chrono::NaiveDate::from_ymd_opt(c.year as i32, c.month as u32, c.day as u32)?;
                let time = chrono::NaiveTime::from_hms_opt(c.hour as u32, c.minute as u32, c.second as u32)?;
                Some(chrono::DateTime::from_naive_utc_and_offset(date.and_time(time), chrono::Utc))
            }
        }
    }

    /// Difference between two points of the same calendar, as an Interval.
    pub fn diff(&self, other: &Self) -> SchedulerResult<Interval> {
        match (self, other) {
            (CyclePoint::Integer(a), CyclePoint::Integer(b)) => Ok(Interval::Integer(a - b)),
            (CyclePoint::Calendar(a), CyclePoint::Calendar(b)) if a.calendar == b.calendar => {
                let days = a.day_ordinal() - b.day_ordinal();
                let secs = a.seconds_of_day() - b.seconds_of_day();
                Ok(Interval::Calendar(CalendarDuration {
                    years: 0,
                    months: 0,
                    days,
                    hours: 0,
                    minutes: 0,
                    seconds: secs,
                }))
            }
            _ => Err(SchedulerError::CalendarMismatch(
                self.calendar().to_string(),
                other.calendar().to_string(),
            )),
        }
    }
}

impl fmt::Display for CyclePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CyclePoint::Integer(n) => write!(f, "{n}"),
            CyclePoint::Calendar(c) => write!(
                f,
                "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
                c.year, c.month, c.day, c.hour, c.minute, c.second
            ),
        }
    }
}

/// An arbitrary-precision, signed calendar duration: `PnYnMnDTnHnMnS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CalendarDuration {
    pub years: i64,
    pub months: i64,
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
    pub seconds: i64,
}

/// Signed duration in the same calendar system as the point it is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interval {
    Integer(i64),
    Calendar(CalendarDuration),
}

impl Interval {
    pub fn zero_integer() -> Self {
        Interval::Integer(0)
    }

    pub fn zero_calendar() -> Self {
        Interval::Calendar(CalendarDuration::default())
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Interval::Integer(n) => *n == 0,
            Interval::Calendar(d) => {
                d.years == 0 && d.months == 0 && d.days == 0 && d.hours == 0 && d.minutes == 0 && d.seconds == 0
            }
        }
    }

    pub fn negate(&self) -> Self {
        match self {
            Interval::Integer(n) => Interval::Integer(-n),
            Interval::Calendar(d) => Interval::Calendar(CalendarDuration {
                years: -d.years,
                months: -d.months,
                days: -d.days,
                hours: -d.hours,
                minutes: -d.minutes,
                seconds: -d.seconds,
            }),
        }
    }

    pub fn add(&self, other: &Self) -> SchedulerResult<Self> {
        match (self, other) {
            (Interval::Integer(a), Interval::Integer(b)) => Ok(Interval::Integer(a + b)),
            (Interval::Calendar(a), Interval::Calendar(b)) => Ok(Interval::Calendar(CalendarDuration {
                years: a.years + b.years,
                months: a.months + b.months,
                days: a.days + b.days,
                hours: a.hours + b.hours,
                minutes: a.minutes + b.minutes,
                seconds: a.seconds + b.seconds,
            })),
            _ => Err(SchedulerError::Input(
                "cannot add an integer interval to a calendar interval".to_string(),
            )),
        }
    }

    pub fn mul(&self, n: i64) -> Self {
        match self {
            Interval::Integer(a) => Interval::Integer(a * n),
            Interval::Calendar(d) => Interval::Calendar(CalendarDuration {
                years: d.years * n,
                months: d.months * n,
                days: d.days * n,
                hours: d.hours * n,
                minutes: d.minutes * n,
                seconds: d.seconds * n,
            }),
        }
    }

    /// Wall-clock duration a retry/poll timer should actually wait,
    /// treating integer-cycling intervals as bare seconds and clamping
    /// negative durations to zero.
    pub fn as_duration(&self) -> std::time::Duration {
        let secs = match self {
            Interval::Integer(n) => *n,
            Interval::Calendar(c) => c.days * 86_400 + c.hours * 3600 + c.minutes * 60 + c.seconds,
        };
        std::time::Duration::from_secs(secs.max(0) as u64)
    }

    /// Parse an ISO-8601 duration such as `P1Y2M3DT4H5M6S`, a bare integer,
    /// or a bare `P<n>` (the integer-cycling convention this crate's own
    /// recurrence strings use, e.g. `R/P1` — `P` with no unit letter is not
    /// valid ISO-8601, so it cannot collide with a real calendar duration).
    pub fn parse(s: &str) -> SchedulerResult<Self> {
        if let Ok(n) = s.parse::<i64>() {
            return Ok(Interval::Integer(n));
        }
        if let Some(digits) = s.strip_prefix('P') {
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                let n: i64 = digits
                    .parse()
                    .map_err(|_| SchedulerError::Input(format!("invalid integer interval: {s}")))?;
                return Ok(Interval::Integer(n));
            }
        }
        parse_iso8601_duration(s).map(Interval::Calendar)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interval::Integer(n) => write!(f, "{n}"),
            Interval::Calendar(d) => {
                write!(f, "P")?;
                if d.years != 0 {
                    write!(f, "{}Y", d.years)?;
                }
                if d.months != 0 {
                    write!(f, "{}M", d.months)?;
                }
                if d.days != 0 {
                    write!(f, "{}D", d.days)?;
                }
                if d.hours != 0 || d.minutes != 0 || d.seconds != 0 {
                    write!(f, "T")?;
                    if d.hours != 0 {
                        write!(f, "{}H", d.hours)?;
                    }
                    if d.minutes != 0 {
                        write!(f, "{}M", d.minutes)?;
                    }
                    if d.seconds != 0 {
                        write!(f, "{}S", d.seconds)?;
                    }
                }
                Ok(())
            }
        }
    }
}

fn parse_iso8601_duration(s: &str) -> SchedulerResult<CalendarDuration> {
    let bytes = s.as_bytes();
    if bytes.is_empty() || bytes[0] != b'P' {
        return Err(SchedulerError::Input(format!("invalid ISO-8601 duration: {s}")));
    }
    let mut out = CalendarDuration::default();
    let mut in_time = false;
    let mut num = String::new();
    for &b in &bytes[1..] {
        match b {
            b'0'..=b'9' => num.push(b as char),
            b'T' => in_time = true,
            b'Y' | b'M' | b'D' | b'H' | b'S' => {
                let n: i64 = num
                    .parse()
                    .map_err(|_| SchedulerError::Input(format!("invalid ISO-8601 duration: {s}")))?;
                num.clear();
                match (b, in_time) {
                    (b'Y', _) => out.years = n,
                    (b'M', false) => out.months = n,
                    (b'D', _) => out.days = n,
                    (b'H', _) => out.hours = n,
                    (b'M', true) => out.minutes = n,
                    (b'S', _) => out.seconds = n,
                    _ => unreachable!(),
                }
            }
            _ => return Err(SchedulerError::Input(format!("invalid ISO-8601 duration: {s}"))),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_arithmetic() {
        let p = CyclePoint::integer(5);
        let iv = Interval::Integer(3);
        assert_eq!(p.add(&iv).unwrap(), CyclePoint::integer(8));
    }

    #[test]
    fn gregorian_month_wrap() {
        let p = CyclePoint::gregorian(2020, 1, 31, 0, 0, 0);
        let iv = Interval::parse("P1M").unwrap();
        let next = p.add(&iv).unwrap();
        // Jan 31 + 1 month clamps to the last valid day of February (leap year).
        assert_eq!(next, CyclePoint::gregorian(2020, 2, 29, 0, 0, 0));
    }

    #[test]
    fn gregorian_year_wrap() {
        let p = CyclePoint::gregorian(2020, 12, 15, 0, 0, 0);
        let iv = Interval::parse("P1M").unwrap();
        assert_eq!(p.add(&iv).unwrap(), CyclePoint::gregorian(2021, 1, 15, 0, 0, 0));
    }

    #[test]
    fn day360_month_is_always_30() {
        let p = CyclePoint::Calendar(CalendarInstant {
            calendar: Calendar::Day360,
            year: 2020,
            month: 1,
            day: 30,
            hour: 0,
            minute: 0,
            second: 0,
        });
        let iv = Interval::parse("P1D").unwrap();
        let next = p.add(&iv).unwrap();
        match next {
            CyclePoint::Calendar(c) => {
                assert_eq!((c.year, c.month, c.day), (2020, 2, 1));
            }
            _ => panic!("expected calendar point"),
        }
    }

    #[test]
    fn cross_calendar_comparison_is_an_error() {
        let a = CyclePoint::integer(1);
        let b = CyclePoint::gregorian(2020, 1, 1, 0, 0, 0);
        assert!(a.compare(&b).is_err());
    }

    #[test]
    fn duration_parse_and_display_roundtrip() {
        let iv = Interval::parse("P1Y2M3DT4H5M6S").unwrap();
        assert_eq!(iv.to_string(), "P1Y2M3DT4H5M6S");
    }

    #[test]
    fn bare_p_prefixed_integer_is_an_integer_interval() {
        assert_eq!(Interval::parse("P1").unwrap(), Interval::Integer(1));
        assert_eq!(Interval::parse("P12").unwrap(), Interval::Integer(12));
    }
}
