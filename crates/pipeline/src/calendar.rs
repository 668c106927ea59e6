//! Season calendars: which days "the 2017 season" covers.

use chrono::NaiveDate;
use pitwall::{Interval, MalformedInterval};
use std::collections::BTreeMap;

/// Maps a season year to the day range from its first to its last race.
pub trait SeasonCalendar: Send + Sync {
    fn season(&self, year: i32) -> Option<Interval>;
}

/// A fixed table of seasons.
#[derive(Debug, Clone, Default)]
pub struct StaticCalendar {
    seasons: BTreeMap<i32, Interval>,
}

/// (year, first race (month, day), last race (month, day))
const FORMULA_ONE_SEASONS: &[(i32, (u32, u32), (u32, u32))] = &[
    (2014, (3, 16), (11, 23)),
    (2015, (3, 15), (11, 29)),
    (2016, (3, 20), (11, 27)),
    (2017, (3, 26), (11, 26)),
    (2018, (3, 25), (11, 25)),
    (2019, (3, 17), (12, 1)),
    (2020, (7, 5), (12, 13)),
    (2021, (3, 28), (12, 12)),
    (2022, (3, 20), (11, 20)),
    (2023, (3, 5), (11, 26)),
    (2024, (3, 2), (12, 8)),
];

impl StaticCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Formula One world championship seasons, opening race to finale.
    pub fn formula_one() -> Self {
        let seasons = FORMULA_ONE_SEASONS
            .iter()
            .filter_map(|&(year, (m1, d1), (m2, d2))| {
                let first = NaiveDate::from_ymd_opt(year, m1, d1)?;
                let last = NaiveDate::from_ymd_opt(year, m2, d2)?;
                Some((year, Interval::new(first, last).ok()?))
            })
            .collect();
        Self { seasons }
    }

    pub fn with_season(
        mut self,
        year: i32,
        first_race: NaiveDate,
        last_race: NaiveDate,
    ) -> Result<Self, MalformedInterval> {
        self.seasons
            .insert(year, Interval::new(first_race, last_race)?);
        Ok(self)
    }

    pub fn years(&self) -> impl Iterator<Item = i32> + '_ {
        self.seasons.keys().copied()
    }
}

impl SeasonCalendar for StaticCalendar {
    fn season(&self, year: i32) -> Option<Interval> {
        self.seasons.get(&year).copied()
    }
}
