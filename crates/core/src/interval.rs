//! Validity intervals.
//!
//! An [`Interval`] is a closed range of calendar days. Year and month
//! granularity are expressed as the day range they cover, so `2017` is
//! `[2017-01-01, 2017-12-31]`. Unbounded sides are stored as
//! [`NaiveDate::MIN`] / [`NaiveDate::MAX`], which keeps overlap and
//! subtraction arithmetic free of special cases; they serialize as `null`.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Raised when an interval would start after it ends.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed interval: start {start} is after end {end}")]
pub struct MalformedInterval {
    pub start: String,
    pub end: String,
}

/// A closed, possibly open-ended range of days over which a fact holds.
///
/// Ordering is chronological by start, then by end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "IntervalRepr", into = "IntervalRepr")]
pub struct Interval {
    start: NaiveDate,
    end: NaiveDate,
}

impl Interval {
    /// Build `[start, end]`, rejecting `start > end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, MalformedInterval> {
        if start > end {
            return Err(MalformedInterval {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        Ok(Self { start, end })
    }

    /// Build from optional bounds; `None` means unbounded on that side.
    pub fn from_bounds(
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Self, MalformedInterval> {
        Self::new(
            start.unwrap_or(NaiveDate::MIN),
            end.unwrap_or(NaiveDate::MAX),
        )
    }

    /// A single day.
    pub fn point(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    /// `[year-01-01, year-12-31]`, or `None` if the year is out of range.
    pub fn year(year: i32) -> Option<Self> {
        let start = NaiveDate::from_ymd_opt(year, 1, 1)?;
        let end = NaiveDate::from_ymd_opt(year, 12, 31)?;
        Some(Self { start, end })
    }

    /// `[year-month-01, last day of month]`.
    pub fn month(year: i32, month: u32) -> Option<Self> {
        let start = NaiveDate::from_ymd_opt(year, month, 1)?;
        let next = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)?
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)?
        };
        Some(Self {
            start,
            end: next.pred_opt()?,
        })
    }

    /// `[day, +inf)`.
    pub fn since(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: NaiveDate::MAX,
        }
    }

    /// `(-inf, day]`.
    pub fn until(day: NaiveDate) -> Self {
        Self {
            start: NaiveDate::MIN,
            end: day,
        }
    }

    /// `(-inf, +inf)`.
    pub fn all() -> Self {
        Self {
            start: NaiveDate::MIN,
            end: NaiveDate::MAX,
        }
    }

    /// Lower bound, `None` when unbounded.
    pub fn start(&self) -> Option<NaiveDate> {
        (self.start != NaiveDate::MIN).then_some(self.start)
    }

    /// Upper bound, `None` when unbounded.
    pub fn end(&self) -> Option<NaiveDate> {
        (self.end != NaiveDate::MAX).then_some(self.end)
    }

    /// Lower bound with `-inf` mapped to [`NaiveDate::MIN`].
    pub fn start_day(&self) -> NaiveDate {
        self.start
    }

    /// Upper bound with `+inf` mapped to [`NaiveDate::MAX`].
    pub fn end_day(&self) -> NaiveDate {
        self.end
    }

    pub fn is_point(&self) -> bool {
        self.start == self.end
    }

    pub fn is_bounded(&self) -> bool {
        self.start().is_some() && self.end().is_some()
    }

    /// `start1 <= end2 && start2 <= end1`.
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }

    pub fn intersection(&self, other: &Interval) -> Option<Interval> {
        if !self.overlaps(other) {
            return None;
        }
        Some(Interval {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        })
    }

    /// The parts of `self` not covered by `other`: zero, one or two pieces.
    pub fn subtract(&self, other: &Interval) -> Vec<Interval> {
        let Some(cut) = self.intersection(other) else {
            return vec![*self];
        };
        let mut pieces = Vec::with_capacity(2);
        if cut.start > self.start {
            if let Some(before_end) = cut.start.pred_opt() {
                pieces.push(Interval {
                    start: self.start,
                    end: before_end,
                });
            }
        }
        if cut.end < self.end {
            if let Some(after_start) = cut.end.succ_opt() {
                pieces.push(Interval {
                    start: after_start,
                    end: self.end,
                });
            }
        }
        pieces
    }

    /// Inclusive length in days. Unbounded sides count up to the calendar
    /// limits, so the result is always finite.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Coalesce overlapping or adjacent intervals into sorted disjoint runs.
    pub fn merge(mut intervals: Vec<Interval>) -> Vec<Interval> {
        intervals.sort();
        let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
        for next in intervals {
            match merged.last_mut() {
                Some(current) => {
                    let touches = match current.end.succ_opt() {
                        Some(after) => next.start <= after,
                        None => true,
                    };
                    if touches {
                        current.end = current.end.max(next.end);
                    } else {
                        merged.push(next);
                    }
                }
                None => merged.push(next),
            }
        }
        merged
    }

    /// `items - cuts`, applied piecewise.
    pub fn subtract_all(items: &[Interval], cuts: &[Interval]) -> Vec<Interval> {
        let mut remaining = items.to_vec();
        for cut in cuts {
            remaining = remaining
                .iter()
                .flat_map(|piece| piece.subtract(cut))
                .collect();
        }
        remaining
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.start() {
            Some(d) => write!(f, "[{d}, ")?,
            None => write!(f, "(-inf, ")?,
        }
        match self.end() {
            Some(d) => write!(f, "{d}]"),
            None => write!(f, "+inf)"),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct IntervalRepr {
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

impl TryFrom<IntervalRepr> for Interval {
    type Error = MalformedInterval;

    fn try_from(repr: IntervalRepr) -> Result<Self, Self::Error> {
        Interval::from_bounds(repr.start, repr.end)
    }
}

impl From<Interval> for IntervalRepr {
    fn from(interval: Interval) -> Self {
        IntervalRepr {
            start: interval.start(),
            end: interval.end(),
        }
    }
}
