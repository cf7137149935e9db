//! Sequence: a lazily-evaluated, totally-ordered stream of CyclePoints
//! satisfying a recurrence, with optional exclusions.
//!
//! Grounded in `original_source/lib/cylc/cycling/loader.py` and
//! `original_source/lib/cylc/cycling/base.py` (recurrence objects expose
//! `get_first_point`/`get_next_point`/membership test — renamed here to
//! `first_on_or_after`/`next_after`/`contains` per spec.md §4.1).

use serde::{Deserialize, Serialize};

use crate::cycle::{Calendar, CalendarInstant, CyclePoint, Interval};
use crate::error::{SchedulerError, SchedulerResult};

/// A recurrence: `Rn/start/period`, `Rn/start/end`, `R/start/period`, or
/// `R/period` (anchored at the initial cycle point).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub calendar: Calendar,
    pub start: CyclePoint,
    pub period: Interval,
    /// Inclusive repeat count bound (`Rn/...`), if any.
    pub count: Option<u64>,
    /// Inclusive upper bound on cycle point, if any.
    pub end: Option<CyclePoint>,
    /// Absolute points excluded from membership.
    pub exclusions: Vec<CyclePoint>,
    spec_text: String,
}

impl Sequence {
    /// Parse cylc recurrence syntax. `icp` anchors truncated/period-only
    /// forms (`R/period`, truncated times like `T00`).
    pub fn parse(spec: &str, icp: &CyclePoint) -> SchedulerResult<Self> {
        let calendar = icp.calendar();
        let original = spec.to_string();

        let (body, exclusion_text) = split_exclusion(spec);
        let exclusions = parse_exclusions(exclusion_text, icp, calendar)?;

        let parts: Vec<&str> = body.split('/').collect();
        if parts.is_empty() || !parts[0].starts_with('R') {
            return Err(SchedulerError::Input(format!(
                "recurrence must start with R or Rn: {spec}"
            )));
        }
        let count = parse_repeat_count(parts[0])?;

        let seq = match parts.len() {
            // R/period — anchored at ICP
            2 => {
                let period = Interval::parse(parts[1])?;
                Sequence {
                    calendar,
                    start: icp.clone(),
                    period,
                    count,
                    end: None,
                    exclusions,
                    spec_text: original,
                }
            }
            // Rn/start/period  or  Rn/start/end
            3 => {
                let start = parse_point(parts[1], icp, calendar)?;
                if let Ok(period) = Interval::parse(parts[2]) {
                    Sequence {
                        calendar,
                        start,
                        period,
                        count,
                        end: None,
                        exclusions,
                        spec_text: original,
                    }
                } else {
                    let end = parse_point(parts[2], icp, calendar)?;
                    let n = count.ok_or_else(|| {
                        SchedulerError::Input(format!(
                            "Rn/start/end form requires an explicit repeat count: {spec}"
                        ))
                    })?;
                    let period = if n <= 1 {
                        Interval::zero_integer()
                    } else {
                        let span = end.diff(&start)?;
                        divide_interval(&span, n - 1)?
                    };
                    Sequence {
                        calendar,
                        start,
                        period,
                        count: Some(n),
                        end: Some(end),
                        exclusions,
                        spec_text: original,
                    }
                }
            }
            _ => {
                return Err(SchedulerError::Input(format!(
                    "unrecognised recurrence syntax: {spec}"
                )))
            }
        };

        if seq.is_structurally_empty() {
            return Err(SchedulerError::EmptySequence(seq.spec_text.clone()));
        }
        Ok(seq)
    }

    fn is_structurally_empty(&self) -> bool {
        if let Some(0) = self.count {
            return true;
        }
        // every member excluded and the set is finite and enumerable
        if let (Some(n), true) = (self.count, !self.exclusions.is_empty()) {
            if (self.exclusions.len() as u64) >= n {
                return self.nth(0).map(|p| self.is_excluded(&p)).unwrap_or(false)
                    && (0..n).all(|i| {
                        self.nth(i)
                            .map(|p| self.is_excluded(&p))
                            .unwrap_or(true)
                    });
            }
        }
        false
    }

    fn is_excluded(&self, p: &CyclePoint) -> bool {
        self.exclusions
            .iter()
            .any(|e| p.compare(e).map(|o| o == std::cmp::Ordering::Equal).unwrap_or(false))
    }

    fn nth(&self, i: u64) -> Option<CyclePoint> {
        if let Some(n) = self.count {
            if i >= n {
                return None;
            }
        }
        let p = self.start.add(&self.period.mul(i as i64)).ok()?;
        if let Some(end) = &self.end {
            if p.compare(end).ok()? == std::cmp::Ordering::Greater {
                return None;
            }
        }
        Some(p)
    }

    /// The first sequence member at or after `p`, skipping exclusions.
    pub fn first_on_or_after(&self, p: &CyclePoint) -> SchedulerResult<Option<CyclePoint>> {
        if self.period.is_zero() {
            // single-shot sequence
            if self.start.compare(p)? != std::cmp::Ordering::Less && !self.is_excluded(&self.start) {
                return Ok(Some(self.start));
            }
            return Ok(None);
        }
        let mut i = self.index_on_or_after(p)?;
        loop {
            match self.nth(i) {
                None => return Ok(None),
                Some(candidate) => {
                    if !self.is_excluded(&candidate) {
                        return Ok(Some(candidate));
                    }
                    i += 1;
                }
            }
        }
    }

    /// The first sequence member strictly after `p`.
    pub fn next_after(&self, p: &CyclePoint) -> SchedulerResult<Option<CyclePoint>> {
        let candidate = self.first_on_or_after(p)?;
        match candidate {
            Some(c) if c.compare(p)? == std::cmp::Ordering::Equal => {
                let mut i = self.index_on_or_after(p)? + 1;
                loop {
                    match self.nth(i) {
                        None => return Ok(None),
                        Some(next) => {
                            if !self.is_excluded(&next) {
                                return Ok(Some(next));
                            }
                            i += 1;
                        }
                    }
                }
            }
            other => Ok(other),
        }
    }

    pub fn contains(&self, p: &CyclePoint) -> SchedulerResult<bool> {
        if self.is_excluded(p) {
            return Ok(false);
        }
        if let Some(end) = &self.end {
            if p.compare(end)? == std::cmp::Ordering::Greater {
                return Ok(false);
            }
        }
        if self.period.is_zero() {
            return Ok(self.start.compare(p)? == std::cmp::Ordering::Equal);
        }
        let span = p.diff(&self.start)?;
        let idx = match exact_multiple(&span, &self.period) {
            Some(i) if i >= 0 => i as u64,
            _ => return Ok(false),
        };
        if let Some(n) = self.count {
            if idx >= n {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn index_on_or_after(&self, p: &CyclePoint) -> SchedulerResult<u64> {
        if self.start.compare(p)? != std::cmp::Ordering::Less {
            return Ok(0);
        }
        let span = p.diff(&self.start)?;
        Ok(ceil_div_interval(&span, &self.period)?.max(0) as u64)
    }
}

fn split_exclusion(spec: &str) -> (&str, Option<&str>) {
    match spec.find('!') {
        Some(idx) => (&spec[..idx], Some(&spec[idx + 1..])),
        None => (spec, None),
    }
}

fn parse_exclusions(
    text: Option<&str>,
    icp: &CyclePoint,
    calendar: Calendar,
) -> SchedulerResult<Vec<CyclePoint>> {
    let Some(text) = text else {
        return Ok(Vec::new());
    };
    let inner = text.trim_start_matches('(').trim_end_matches(')');
    inner
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| parse_point(s.trim(), icp, calendar))
        .collect()
}

fn parse_repeat_count(token: &str) -> SchedulerResult<Option<u64>> {
    let rest = token.trim_start_matches('R');
    if rest.is_empty() {
        Ok(None)
    } else {
        rest.parse::<u64>()
            .map(Some)
            .map_err(|_| SchedulerError::Input(format!("invalid repeat count: {token}")))
    }
}

/// Parse an absolute point, a truncated time-of-day (`T00`, `T0600`), or
/// fall back to the ICP's calendar for bare calendar literals.
fn parse_point(token: &str, icp: &CyclePoint, calendar: Calendar) -> SchedulerResult<CyclePoint> {
    if calendar == Calendar::Integer {
        return token
            .parse::<i64>()
            .map(CyclePoint::Integer)
            .map_err(|_| SchedulerError::Input(format!("invalid integer cycle point: {token}")));
    }
    if let Some(rest) = token.strip_prefix('T') {
        return resolve_truncated_time(icp, rest, calendar);
    }
    parse_calendar_literal(token, calendar)
}

fn resolve_truncated_time(icp: &CyclePoint, hhmmss: &str, calendar: Calendar) -> SchedulerResult<CyclePoint> {
    let CyclePoint::Calendar(anchor) = icp else {
        return Err(SchedulerError::Input("truncated time needs a calendar ICP".into()));
    };
    let digits: String = hhmmss.chars().filter(|c| c.is_ascii_digit()).collect();
    let mut it = digits.as_bytes().chunks(2);
    let hour: u8 = it.next().map(|c| std::str::from_utf8(c).unwrap().parse().unwrap_or(0)).unwrap_or(0);
    let minute: u8 = it.next().map(|c| std::str::from_utf8(c).unwrap().parse().unwrap_or(0)).unwrap_or(0);
    let second: u8 = it.next().map(|c| std::str::from_utf8(c).unwrap().parse().unwrap_or(0)).unwrap_or(0);

    let same_day = CalendarInstant {
        calendar,
        year: anchor.year,
        month: anchor.month,
        day: anchor.day,
        hour,
        minute,
        second,
    };
    let candidate = CyclePoint::Calendar(same_day);
    if candidate.compare(icp)? != std::cmp::Ordering::Less {
        Ok(candidate)
    } else {
        candidate.add(&Interval::parse("P1D")?)
    }
}

fn parse_calendar_literal(token: &str, calendar: Calendar) -> SchedulerResult<CyclePoint> {
    // Split on 'T' first so a dashed date (`2020-01-01`) and a colon'd time
    // (`12:30:00`) each get their digits extracted separately; a bare digit
    // run (`20200101T0000`) still works the same way with an empty dash/colon
    // set to strip.
    let (date_part, time_part) = match token.split_once('T') {
        Some((d, t)) => (d, t),
        None => (token, ""),
    };
    let date_digits: String = date_part.chars().filter(|c| c.is_ascii_digit()).collect();
    if date_digits.len() < 4 {
        return Err(SchedulerError::Input(format!("invalid cycle point literal: {token}")));
    }
    let year: i64 = date_digits[0..4].parse().unwrap();
    let month: u8 = date_digits.get(4..6).and_then(|s| s.parse().ok()).unwrap_or(1);
    let day: u8 = date_digits.get(6..8).and_then(|s| s.parse().ok()).unwrap_or(1);
    let time_digits: String = time_part.chars().filter(|c| c.is_ascii_digit()).collect();
    let hour: u8 = time_digits.get(0..2).and_then(|s| s.parse().ok()).unwrap_or(0);
    let minute: u8 = time_digits.get(2..4).and_then(|s| s.parse().ok()).unwrap_or(0);
    let second: u8 = time_digits.get(4..6).and_then(|s| s.parse().ok()).unwrap_or(0);
    Ok(CyclePoint::Calendar(CalendarInstant {
        calendar,
        year,
        month,
        day,
        hour,
        minute,
        second,
    }))
}

fn divide_interval(span: &Interval, n: u64) -> SchedulerResult<Interval> {
    match span {
        Interval::Integer(v) => Ok(Interval::Integer(v / n as i64)),
        Interval::Calendar(d) => {
            // Reduce everything to seconds + whole days for an even split;
            // year/month components of a span from `diff` are always zero.
            Ok(Interval::Calendar(crate::cycle::CalendarDuration {
                years: 0,
                months: 0,
                days: d.days / n as i64,
                hours: 0,
                minutes: 0,
                seconds: d.seconds / n as i64,
            }))
        }
    }
}

fn ceil_div_interval(span: &Interval, period: &Interval) -> SchedulerResult<i64> {
    match (span, period) {
        (Interval::Integer(s), Interval::Integer(p)) if *p != 0 => {
            Ok((*s + p - 1).div_euclid(*p))
        }
        (Interval::Calendar(s), Interval::Calendar(p)) => {
            let s_secs = s.days * 86_400 + s.seconds;
            let p_secs = p.days * 86_400 + p.seconds;
            if p_secs == 0 {
                return Err(SchedulerError::Input("zero-length period".into()));
            }
            Ok((s_secs + p_secs - 1).div_euclid(p_secs))
        }
        _ => Err(SchedulerError::Input("incompatible span/period kinds".into())),
    }
}

fn exact_multiple(span: &Interval, period: &Interval) -> Option<i64> {
    match (span, period) {
        (Interval::Integer(s), Interval::Integer(p)) if *p != 0 && s % p == 0 => Some(s / p),
        (Interval::Calendar(s), Interval::Calendar(p)) => {
            let s_secs = s.days * 86_400 + s.seconds;
            let p_secs = p.days * 86_400 + p.seconds;
            if p_secs != 0 && s_secs % p_secs == 0 {
                Some(s_secs / p_secs)
            } else {
                None
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn icp() -> CyclePoint {
        CyclePoint::gregorian(2020, 1, 1, 0, 0, 0)
    }

    #[test]
    fn anchored_recurrence() {
        let seq = Sequence::parse("R/P1D", &icp()).unwrap();
        let first = seq.first_on_or_after(&icp()).unwrap().unwrap();
        assert_eq!(first, icp());
        let second = seq.next_after(&first).unwrap().unwrap();
        assert_eq!(second, CyclePoint::gregorian(2020, 1, 2, 0, 0, 0));
    }

    #[test]
    fn truncated_time_after_icp() {
        // ICP is 2010-01-01T06, "T00" should first match 2010-01-02T00.
        let icp = CyclePoint::gregorian(2010, 1, 1, 6, 0, 0);
        let seq = Sequence::parse("R/T00/P1D", &icp).unwrap();
        assert_eq!(seq.start, CyclePoint::gregorian(2010, 1, 2, 0, 0, 0));
    }

    #[test]
    fn exclusion_point() {
        let seq = Sequence::parse("R3/2020-01-01/P1D!20200102", &icp()).unwrap();
        assert!(!seq.contains(&CyclePoint::gregorian(2020, 1, 2, 0, 0, 0)).unwrap());
        assert!(seq.contains(&CyclePoint::gregorian(2020, 1, 1, 0, 0, 0)).unwrap());
    }

    #[test]
    fn dashed_calendar_literal_parses_month_and_day() {
        let seq = Sequence::parse("R1/2020-03-17/P1D", &icp()).unwrap();
        assert_eq!(seq.start, CyclePoint::gregorian(2020, 3, 17, 0, 0, 0));
    }

    #[test]
    fn fully_excluded_sequence_is_reported_empty() {
        let err = Sequence::parse("R1/20200101!20200101", &icp());
        assert!(err.is_err());
    }

    #[test]
    fn integer_cycling() {
        let icp = CyclePoint::integer(1);
        let seq = Sequence::parse("R/P1", &icp).unwrap();
        assert!(seq.contains(&CyclePoint::integer(3)).unwrap());
        assert!(!seq.contains(&CyclePoint::integer(-1)).unwrap());
    }
}
