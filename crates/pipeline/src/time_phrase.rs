//! Free-text time expressions: `"2017"`, `"March 2017"`, `"2015–2018"`,
//! `"the 2019 season"`, `"since 2020"`, `"before 2014"`, `"currently"`.
//!
//! Phrases are tried from most to least specific: current-time words,
//! relative prefixes, ranges, then single atoms (day, month, season, year).

use crate::calendar::SeasonCalendar;
use chrono::NaiveDate;
use pitwall::{Interval, MalformedInterval};
use regex::{Captures, Regex};
use std::sync::LazyLock;

/// A parsed time phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeExpr {
    Span(Interval),
    /// Strictly before this day.
    Before(NaiveDate),
    /// Strictly after this day.
    After(NaiveDate),
    /// "now", "currently", ...
    Current,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimePhraseError {
    #[error("empty time phrase")]
    Empty,
    #[error("unparseable time phrase: {0:?}")]
    Unparseable(String),
    #[error("no calendar entry for the {0} season")]
    UnknownSeason(i32),
    #[error(transparent)]
    Malformed(#[from] MalformedInterval),
}

macro_rules! time_pattern {
    ($name:ident, $regex_str:expr) => {
        static $name: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new($regex_str).ok());
    };
}

time_pattern!(RE_ISO_DAY, r"^(\d{4})-(\d{1,2})-(\d{1,2})$");
time_pattern!(RE_ISO_MONTH, r"^(\d{4})-(\d{1,2})$");
time_pattern!(RE_MONTH_YEAR, r"^([a-z]+)\.?,?\s+(\d{4})$");
time_pattern!(
    RE_DAY_MONTH_YEAR,
    r"^(\d{1,2})(?:st|nd|rd|th)?\s+([a-z]+)\.?,?\s+(\d{4})$"
);
time_pattern!(
    RE_MONTH_DAY_YEAR,
    r"^([a-z]+)\.?\s+(\d{1,2})(?:st|nd|rd|th)?,?\s+(\d{4})$"
);
time_pattern!(
    RE_SEASON,
    r"^(?:the\s+)?(?:(\d{4})\s+(?:f1\s+|formula\s+(?:one|1)\s+)?season|season\s+(\d{4}))$"
);
time_pattern!(RE_YEAR, r"^(\d{4})$");
time_pattern!(RE_YEAR_RANGE, r"^(\d{4})\s*[-/–—]\s*(\d{4})$");

fn captures<'t>(re: &LazyLock<Option<Regex>>, text: &'t str) -> Option<Captures<'t>> {
    re.as_ref().and_then(|re| re.captures(text))
}

const CURRENT_WORDS: &[&str] = &[
    "now",
    "currently",
    "current",
    "today",
    "present",
    "right now",
    "at the moment",
    "at present",
    "these days",
    "nowadays",
];

const MONTHS: &[(&str, u32)] = &[
    ("january", 1),
    ("february", 2),
    ("march", 3),
    ("april", 4),
    ("may", 5),
    ("june", 6),
    ("july", 7),
    ("august", 8),
    ("september", 9),
    ("october", 10),
    ("november", 11),
    ("december", 12),
];

fn month_number(word: &str) -> Option<u32> {
    if word.len() < 3 {
        return None;
    }
    MONTHS
        .iter()
        .find(|(name, _)| name.starts_with(word) || (word == "sept" && *name == "september"))
        .map(|(_, n)| *n)
}

fn clean(text: &str) -> String {
    text.trim()
        .trim_end_matches(['.', ',', '?', '!', ';'])
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a time phrase against `calendar`.
pub fn parse(text: &str, calendar: &dyn SeasonCalendar) -> Result<TimeExpr, TimePhraseError> {
    let t = clean(text);
    if t.is_empty() {
        return Err(TimePhraseError::Empty);
    }
    if CURRENT_WORDS.contains(&t.as_str()) {
        return Ok(TimeExpr::Current);
    }

    let mut t = t.as_str();
    for prefix in ["in ", "during ", "on ", "at ", "for "] {
        if let Some(rest) = t.strip_prefix(prefix) {
            t = rest;
            break;
        }
    }
    if CURRENT_WORDS.contains(&t) {
        return Ok(TimeExpr::Current);
    }

    if let Some(rest) = t.strip_prefix("before ") {
        return Ok(TimeExpr::Before(bounded(atom(rest, calendar)?, rest)?.start_day()));
    }
    if let Some(rest) = t.strip_prefix("after ") {
        return Ok(TimeExpr::After(bounded(atom(rest, calendar)?, rest)?.end_day()));
    }
    for prefix in ["since ", "starting ", "starting in ", "beginning "] {
        if let Some(rest) = t.strip_prefix(prefix) {
            return Ok(TimeExpr::Span(Interval::since(atom(rest, calendar)?.start_day())));
        }
    }
    for prefix in ["until ", "till ", "up to ", "up until ", "through ", "by "] {
        if let Some(rest) = t.strip_prefix(prefix) {
            return Ok(TimeExpr::Span(Interval::until(atom(rest, calendar)?.end_day())));
        }
    }
    for suffix in [" onwards", " onward", " and beyond", " on"] {
        if let Some(rest) = t.strip_suffix(suffix) {
            let rest = rest.strip_prefix("from ").unwrap_or(rest);
            return Ok(TimeExpr::Span(Interval::since(atom(rest, calendar)?.start_day())));
        }
    }
    if let Some(rest) = t.strip_prefix("between ") {
        if let Some((a, b)) = rest.split_once(" and ") {
            return range(a, b, calendar);
        }
        return Err(TimePhraseError::Unparseable(text.to_string()));
    }
    if let Some(rest) = t.strip_prefix("from ") {
        return match split_range(rest) {
            Some((a, b)) => range(a, b, calendar),
            None => Ok(TimeExpr::Span(Interval::since(atom(rest, calendar)?.start_day()))),
        };
    }
    if let Some(caps) = captures(&RE_YEAR_RANGE, t) {
        return range(&caps[1], &caps[2], calendar);
    }
    if let Some((a, b)) = split_range(t) {
        return range(a, b, calendar);
    }

    Ok(TimeExpr::Span(atom(t, calendar)?))
}

fn split_range(t: &str) -> Option<(&str, &str)> {
    for sep in [" to ", " until ", " till ", " through ", " - ", "–", "—"] {
        if let Some((a, b)) = t.split_once(sep) {
            let (a, b) = (a.trim(), b.trim());
            if !a.is_empty() && !b.is_empty() {
                return Some((a, b));
            }
        }
    }
    None
}

fn range(a: &str, b: &str, calendar: &dyn SeasonCalendar) -> Result<TimeExpr, TimePhraseError> {
    let start = atom(a, calendar)?;
    let b = b.trim();
    if CURRENT_WORDS.contains(&b) || b == "date" {
        return Ok(TimeExpr::Span(Interval::since(start.start_day())));
    }
    let end = atom(b, calendar)?;
    Ok(TimeExpr::Span(Interval::new(start.start_day(), end.end_day())?))
}

fn bounded(interval: Interval, text: &str) -> Result<Interval, TimePhraseError> {
    if interval.is_bounded() {
        Ok(interval)
    } else {
        Err(TimePhraseError::Unparseable(text.to_string()))
    }
}

/// A single calendar unit: day, month, season or year.
fn atom(text: &str, calendar: &dyn SeasonCalendar) -> Result<Interval, TimePhraseError> {
    let t = text.trim();
    let t = t.strip_prefix("the ").unwrap_or(t);
    let unparseable = || TimePhraseError::Unparseable(text.to_string());

    if let Some(caps) = captures(&RE_ISO_DAY, t) {
        return ymd(&caps[1], &caps[2], &caps[3]).ok_or_else(unparseable);
    }
    if let Some(caps) = captures(&RE_ISO_MONTH, t) {
        let year = caps[1].parse().map_err(|_| unparseable())?;
        let month = caps[2].parse().map_err(|_| unparseable())?;
        return Interval::month(year, month).ok_or_else(unparseable);
    }
    if let Some(caps) = captures(&RE_DAY_MONTH_YEAR, t) {
        let month = month_number(&caps[2]).ok_or_else(unparseable)?;
        return ymd(&caps[3], &month.to_string(), &caps[1]).ok_or_else(unparseable);
    }
    if let Some(caps) = captures(&RE_MONTH_DAY_YEAR, t) {
        if let Some(month) = month_number(&caps[1]) {
            return ymd(&caps[3], &month.to_string(), &caps[2]).ok_or_else(unparseable);
        }
    }
    if let Some(caps) = captures(&RE_MONTH_YEAR, t) {
        if let Some(month) = month_number(&caps[1]) {
            let year = caps[2].parse().map_err(|_| unparseable())?;
            return Interval::month(year, month).ok_or_else(unparseable);
        }
    }
    if let Some(caps) = captures(&RE_SEASON, t) {
        let digits = caps.get(1).or_else(|| caps.get(2)).ok_or_else(unparseable)?;
        let year: i32 = digits.as_str().parse().map_err(|_| unparseable())?;
        return calendar
            .season(year)
            .ok_or(TimePhraseError::UnknownSeason(year));
    }
    if let Some(caps) = captures(&RE_YEAR, t) {
        let year = caps[1].parse().map_err(|_| unparseable())?;
        return Interval::year(year).ok_or_else(unparseable);
    }
    Err(unparseable())
}

fn ymd(year: &str, month: &str, day: &str) -> Option<Interval> {
    let date = NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)?;
    Some(Interval::point(date))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::StaticCalendar;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn span(text: &str) -> Interval {
        match parse(text, &StaticCalendar::formula_one()).unwrap() {
            TimeExpr::Span(iv) => iv,
            other => panic!("{text:?} parsed as {other:?}"),
        }
    }

    fn iv(a: &str, b: &str) -> Interval {
        Interval::new(d(a), d(b)).unwrap()
    }

    #[test]
    fn single_units() {
        assert_eq!(span("2017"), Interval::year(2017).unwrap());
        assert_eq!(span("in 2017"), Interval::year(2017).unwrap());
        assert_eq!(span("2017-06-01"), Interval::point(d("2017-06-01")));
        assert_eq!(span("2017-03"), Interval::month(2017, 3).unwrap());
        assert_eq!(span("March 2017"), Interval::month(2017, 3).unwrap());
        assert_eq!(span("Sept. 2019"), Interval::month(2019, 9).unwrap());
        assert_eq!(span("26 March 2017"), Interval::point(d("2017-03-26")));
        assert_eq!(span("March 26th, 2017"), Interval::point(d("2017-03-26")));
    }

    #[test]
    fn seasons_come_from_the_calendar() {
        assert_eq!(span("the 2019 season"), iv("2019-03-17", "2019-12-01"));
        assert_eq!(span("during the 2020 F1 season"), iv("2020-07-05", "2020-12-13"));
        assert_eq!(span("season 2017"), iv("2017-03-26", "2017-11-26"));
        assert_eq!(
            parse("the 1990 season", &StaticCalendar::formula_one()),
            Err(TimePhraseError::UnknownSeason(1990))
        );
    }

    #[test]
    fn ranges() {
        assert_eq!(span("2015–2018"), iv("2015-01-01", "2018-12-31"));
        assert_eq!(span("2015-2018"), iv("2015-01-01", "2018-12-31"));
        assert_eq!(span("from 2015 to 2018"), iv("2015-01-01", "2018-12-31"));
        assert_eq!(span("between 2015 and 2018"), iv("2015-01-01", "2018-12-31"));
        assert_eq!(span("March 2017 to June 2018"), iv("2017-03-01", "2018-06-30"));
        assert_eq!(span("2019 - present"), Interval::since(d("2019-01-01")));
    }

    #[test]
    fn open_ended_phrases() {
        assert_eq!(span("since 2019"), Interval::since(d("2019-01-01")));
        assert_eq!(span("2019 onwards"), Interval::since(d("2019-01-01")));
        assert_eq!(span("from 2019"), Interval::since(d("2019-01-01")));
        assert_eq!(span("until 2016"), Interval::until(d("2016-12-31")));
        assert_eq!(span("up to March 2016"), Interval::until(d("2016-03-31")));
    }

    #[test]
    fn relative_and_current() {
        let calendar = StaticCalendar::formula_one();
        assert_eq!(
            parse("before 2019", &calendar).unwrap(),
            TimeExpr::Before(d("2019-01-01"))
        );
        assert_eq!(
            parse("after 2016", &calendar).unwrap(),
            TimeExpr::After(d("2016-12-31"))
        );
        assert_eq!(parse("currently", &calendar).unwrap(), TimeExpr::Current);
        assert_eq!(parse("right now", &calendar).unwrap(), TimeExpr::Current);
    }

    #[test]
    fn bad_phrases_are_rejected() {
        let calendar = StaticCalendar::formula_one();
        assert_eq!(parse("  ", &calendar), Err(TimePhraseError::Empty));
        assert!(matches!(
            parse("a long time ago", &calendar),
            Err(TimePhraseError::Unparseable(_))
        ));
        assert!(matches!(
            parse("2020-2015", &calendar),
            Err(TimePhraseError::Malformed(_))
        ));
        assert!(matches!(
            parse("2017-02-30", &calendar),
            Err(TimePhraseError::Unparseable(_))
        ));
    }
}
