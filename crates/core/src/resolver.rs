//! Temporal query resolution.
//!
//! A [`TemporalQuery`] names a relation, one or both of its ends, a time
//! specification, and which end is being asked for. [`QueryResolver`] turns
//! the time specification into a concrete window, pulls the active facts
//! that overlap it, and ranks candidate answers by how much of the window
//! they cover.

use crate::{EntityId, FactFilter, FactId, FactMatch, FactStore, Interval, RelationType, Result};
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;

/// When the question is asking about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum TimeSpec {
    At(NaiveDate),
    During(Interval),
    /// The most recent state the store knows of.
    Latest,
    /// Strictly before the given day; the closest preceding answer wins.
    Before(NaiveDate),
    /// Strictly after the given day; the closest following answer wins.
    After(NaiveDate),
}

/// Which end of the relation is the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Subject,
    Object,
}

impl Target {
    fn flipped(self) -> Self {
        match self {
            Target::Subject => Target::Object,
            Target::Object => Target::Subject,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemporalQuery {
    pub subject: Option<EntityId>,
    pub predicate: RelationType,
    pub object: Option<EntityId>,
    pub time: TimeSpec,
    pub target: Target,
}

impl TemporalQuery {
    /// "What is `subject`'s `predicate` at `time`?"
    pub fn object_of(subject: EntityId, predicate: RelationType, time: TimeSpec) -> Self {
        Self {
            subject: Some(subject),
            predicate,
            object: None,
            time,
            target: Target::Object,
        }
    }

    /// "Who had `predicate` `object` at `time`?"
    pub fn subject_of(predicate: RelationType, object: EntityId, time: TimeSpec) -> Self {
        Self {
            subject: None,
            predicate,
            object: Some(object),
            time,
            target: Target::Subject,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    /// Winning entities; more than one only when `ambiguous`.
    pub answer_entities: Vec<EntityId>,
    /// Union of the winners' active segments, clipped to `window`. For
    /// [`TimeSpec::Latest`] the segments are reported whole.
    pub covered_intervals: Vec<Interval>,
    /// Per-entity breakdown of `covered_intervals`.
    pub coverage: BTreeMap<EntityId, Vec<Interval>>,
    /// Overlap-weighted mean confidence of the supporting facts.
    pub confidence: f32,
    pub ambiguous: bool,
    pub supporting_facts: Vec<FactId>,
    pub window: Interval,
}

impl Answer {
    /// One-line rendering: `"Peter Bonnington (2013-2024)"`, several
    /// entities joined by `"; "`.
    pub fn summary(&self, name_of: impl Fn(&EntityId) -> String) -> String {
        self.answer_entities
            .iter()
            .map(|entity| {
                let spans: Vec<String> = self
                    .coverage
                    .get(entity)
                    .map(|ivs| ivs.iter().map(year_span).collect())
                    .unwrap_or_default();
                if spans.is_empty() {
                    name_of(entity)
                } else {
                    format!("{} ({})", name_of(entity), spans.join(", "))
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

fn year_span(interval: &Interval) -> String {
    match (interval.start(), interval.end()) {
        (Some(s), Some(e)) if s.year() == e.year() => s.year().to_string(),
        (Some(s), Some(e)) => format!("{}-{}", s.year(), e.year()),
        (Some(s), None) => format!("{}-present", s.year()),
        (None, Some(e)) => format!("until {}", e.year()),
        (None, None) => "all time".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum Resolution {
    /// Nothing was active in the window. A valid negative answer.
    NoFactFound { window: Interval },
    Answered(Answer),
}

/// A match oriented so that `answer` is the end the question asks for.
struct Candidate {
    answer: EntityId,
    fact: FactMatch,
}

#[derive(Default)]
struct Group {
    clipped: Vec<Interval>,
    covered: Vec<Interval>,
    weighted_confidence: f64,
    weight: f64,
    facts: Vec<FactId>,
}

/// Resolves [`TemporalQuery`]s against a [`FactStore`].
pub struct QueryResolver<'a> {
    store: &'a FactStore,
}

impl<'a> QueryResolver<'a> {
    pub fn new(store: &'a FactStore) -> Self {
        Self { store }
    }

    pub fn resolve(&self, query: &TemporalQuery) -> Result<Resolution> {
        let window = match query.time {
            TimeSpec::At(day) => Interval::point(day),
            TimeSpec::During(interval) => interval,
            TimeSpec::Before(day) => match day.pred_opt() {
                Some(prev) => Interval::until(prev),
                None => return Ok(Resolution::NoFactFound { window: Interval::point(day) }),
            },
            TimeSpec::After(day) => match day.succ_opt() {
                Some(next) => Interval::since(next),
                None => return Ok(Resolution::NoFactFound { window: Interval::point(day) }),
            },
            TimeSpec::Latest => Interval::all(),
        };

        let mut candidates = self.candidates(query, window)?;

        let window = if query.time == TimeSpec::Latest {
            let latest = candidates
                .iter()
                .flat_map(|c| c.fact.active.iter().map(Interval::end_day))
                .max();
            match latest {
                Some(day) => {
                    let point = Interval::point(day);
                    candidates
                        .retain(|c| c.fact.active.iter().any(|segment| segment.overlaps(&point)));
                    point
                }
                None => window,
            }
        } else {
            window
        };

        if candidates.is_empty() {
            return Ok(Resolution::NoFactFound { window });
        }

        let mut groups: BTreeMap<EntityId, Group> = BTreeMap::new();
        for candidate in candidates {
            let clipped: Vec<Interval> = candidate
                .fact
                .active
                .iter()
                .filter_map(|segment| segment.intersection(&window))
                .collect();
            let days: i64 = clipped.iter().map(Interval::days).sum();
            let covered: Vec<Interval> = if query.time == TimeSpec::Latest {
                candidate
                    .fact
                    .active
                    .iter()
                    .filter(|segment| segment.overlaps(&window))
                    .copied()
                    .collect()
            } else {
                clipped.clone()
            };
            let group = groups.entry(candidate.answer).or_default();
            group.weighted_confidence += f64::from(candidate.fact.fact.confidence) * days as f64;
            group.weight += days as f64;
            group.clipped.extend(clipped);
            group.covered.extend(covered);
            group.facts.push(candidate.fact.fact.id);
        }

        let scored: Vec<(EntityId, i64, Group)> = groups
            .into_iter()
            .map(|(entity, mut group)| {
                group.clipped = Interval::merge(std::mem::take(&mut group.clipped));
                group.covered = Interval::merge(std::mem::take(&mut group.covered));
                let score = score(query.time, &group.clipped);
                (entity, score, group)
            })
            .collect();

        let best = scored.iter().map(|(_, s, _)| *s).max().unwrap_or(i64::MIN);
        let winners: Vec<(EntityId, Group)> = scored
            .into_iter()
            .filter(|(_, s, _)| *s == best)
            .map(|(entity, _, group)| (entity, group))
            .collect();

        let ambiguous = winners.len() > 1;
        let mut coverage = BTreeMap::new();
        let mut covered = Vec::new();
        let mut supporting_facts = Vec::new();
        let (mut weighted, mut weight) = (0.0_f64, 0.0_f64);
        for (entity, group) in &winners {
            covered.extend(group.covered.iter().copied());
            coverage.insert(entity.clone(), group.covered.clone());
            supporting_facts.extend(group.facts.iter().cloned());
            weighted += group.weighted_confidence;
            weight += group.weight;
        }
        let confidence = if weight > 0.0 {
            (weighted / weight) as f32
        } else {
            0.0
        };

        Ok(Resolution::Answered(Answer {
            answer_entities: winners.into_iter().map(|(entity, _)| entity).collect(),
            covered_intervals: Interval::merge(covered),
            coverage,
            confidence,
            ambiguous,
            supporting_facts,
            window,
        }))
    }

    /// Matches for the query's direction, plus the inverse relation read
    /// the other way round when one exists.
    fn candidates(&self, query: &TemporalQuery, window: Interval) -> Result<Vec<Candidate>> {
        let mut directions = vec![(
            query.subject.clone(),
            query.predicate,
            query.object.clone(),
            query.target,
        )];
        let symmetric_mirror = |inverse: RelationType| {
            inverse == query.predicate && query.subject == query.object
        };
        if let Some(inverse) = query.predicate.inverse().filter(|&i| !symmetric_mirror(i)) {
            directions.push((
                query.object.clone(),
                inverse,
                query.subject.clone(),
                query.target.flipped(),
            ));
        }

        let mut out = Vec::new();
        for (subject, predicate, object, target) in directions {
            let filter = FactFilter {
                subject,
                predicate: Some(predicate),
                object,
            };
            for m in self.store.query(&filter, window)? {
                let answer = match target {
                    Target::Subject => m.fact.subject.clone(),
                    Target::Object => m.fact.object.clone(),
                };
                out.push(Candidate { answer, fact: m });
            }
        }
        Ok(out)
    }
}

/// Higher is better.
fn score(time: TimeSpec, clipped: &[Interval]) -> i64 {
    match time {
        TimeSpec::Before(_) => clipped
            .iter()
            .map(|iv| i64::from(iv.end_day().num_days_from_ce()))
            .max()
            .unwrap_or(i64::MIN),
        TimeSpec::After(_) => clipped
            .iter()
            .map(|iv| -i64::from(iv.start_day().num_days_from_ce()))
            .max()
            .unwrap_or(i64::MIN),
        _ => clipped.iter().map(Interval::days).sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Fact, SourceRef};

    fn day(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn span(a: &str, b: &str) -> Interval {
        Interval::new(day(a), day(b)).unwrap()
    }

    fn put(store: &FactStore, s: &str, p: RelationType, o: &str, iv: Interval, conf: f32) {
        store
            .insert(
                Fact::new(
                    EntityId::from_name(s),
                    p,
                    EntityId::from_name(o),
                    iv,
                    SourceRef::document(format!("{s}-{o}")),
                )
                .with_confidence(conf),
            )
            .unwrap();
    }

    fn answered(resolution: Resolution) -> Answer {
        match resolution {
            Resolution::Answered(answer) => answer,
            other => panic!("expected an answer, got {other:?}"),
        }
    }

    #[test]
    fn point_query_returns_the_active_object() {
        let store = FactStore::open_in_memory().unwrap();
        put(
            &store,
            "Lewis Hamilton",
            RelationType::HadRaceEngineer,
            "Peter Bonnington",
            span("2013-01-01", "2024-12-31"),
            0.9,
        );

        let query = TemporalQuery::object_of(
            EntityId::from_name("Lewis Hamilton"),
            RelationType::HadRaceEngineer,
            TimeSpec::At(day("2017-06-01")),
        );
        let answer = answered(QueryResolver::new(&store).resolve(&query).unwrap());
        assert_eq!(answer.answer_entities, vec![EntityId::from_name("Peter Bonnington")]);
        assert!(!answer.ambiguous);
        assert_eq!(answer.covered_intervals, vec![Interval::point(day("2017-06-01"))]);
        assert!((answer.confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn nothing_active_is_a_negative_answer() {
        let store = FactStore::open_in_memory().unwrap();
        put(&store, "X", RelationType::Employs, "Bob", span("2015-01-01", "2018-12-31"), 0.9);

        let query = TemporalQuery::object_of(
            EntityId::from_name("X"),
            RelationType::Employs,
            TimeSpec::During(Interval::year(2010).unwrap()),
        );
        let resolution = QueryResolver::new(&store).resolve(&query).unwrap();
        assert_eq!(
            resolution,
            Resolution::NoFactFound { window: Interval::year(2010).unwrap() }
        );
    }

    #[test]
    fn range_query_prefers_largest_overlap() {
        let store = FactStore::open_in_memory().unwrap();
        put(&store, "X", RelationType::Employs, "Bob", span("2020-01-01", "2020-03-31"), 0.9);
        put(&store, "X", RelationType::Employs, "Alice", span("2020-04-01", "2020-12-31"), 0.7);

        let query = TemporalQuery::object_of(
            EntityId::from_name("X"),
            RelationType::Employs,
            TimeSpec::During(Interval::year(2020).unwrap()),
        );
        let answer = answered(QueryResolver::new(&store).resolve(&query).unwrap());
        assert_eq!(answer.answer_entities, vec![EntityId::from_name("Alice")]);
        assert!(!answer.ambiguous);
        assert_eq!(answer.covered_intervals, vec![span("2020-04-01", "2020-12-31")]);
    }

    #[test]
    fn equal_overlap_is_flagged_ambiguous() {
        let store = FactStore::open_in_memory().unwrap();
        // 2020 is a leap year: 183 days each side.
        put(&store, "X", RelationType::Employs, "Bob", span("2020-01-01", "2020-07-01"), 0.9);
        put(&store, "X", RelationType::Employs, "Alice", span("2020-07-02", "2020-12-31"), 0.7);

        let query = TemporalQuery::object_of(
            EntityId::from_name("X"),
            RelationType::Employs,
            TimeSpec::During(Interval::year(2020).unwrap()),
        );
        let answer = answered(QueryResolver::new(&store).resolve(&query).unwrap());
        assert!(answer.ambiguous);
        assert_eq!(
            answer.answer_entities,
            vec![EntityId::from_name("Alice"), EntityId::from_name("Bob")]
        );
        assert_eq!(answer.covered_intervals, vec![Interval::year(2020).unwrap()]);
        assert!((answer.confidence - 0.8).abs() < 1e-3);
    }

    #[test]
    fn latest_picks_the_most_recent_holder() {
        let store = FactStore::open_in_memory().unwrap();
        put(
            &store,
            "Max Verstappen",
            RelationType::DroveFor,
            "Toro Rosso",
            span("2015-01-01", "2016-05-10"),
            1.0,
        );
        put(
            &store,
            "Max Verstappen",
            RelationType::DroveFor,
            "Red Bull Racing",
            Interval::since(day("2016-05-11")),
            1.0,
        );

        let query = TemporalQuery::object_of(
            EntityId::from_name("Max Verstappen"),
            RelationType::DroveFor,
            TimeSpec::Latest,
        );
        let answer = answered(QueryResolver::new(&store).resolve(&query).unwrap());
        assert_eq!(answer.answer_entities, vec![EntityId::from_name("Red Bull Racing")]);
        assert_eq!(answer.covered_intervals, vec![Interval::since(day("2016-05-11"))]);
        assert_eq!(answer.summary(|id| id.to_string()), "red-bull-racing (2016-present)");
    }

    #[test]
    fn before_and_after_pick_the_closest_neighbour() {
        let store = FactStore::open_in_memory().unwrap();
        let kimi = "Kimi Raikkonen";
        put(
            &store,
            kimi,
            RelationType::HadRaceEngineer,
            "Andrea Stella",
            span("2007-01-01", "2009-12-31"),
            1.0,
        );
        put(
            &store,
            kimi,
            RelationType::HadRaceEngineer,
            "Dave Greenwood",
            span("2014-01-01", "2018-12-31"),
            1.0,
        );
        put(
            &store,
            kimi,
            RelationType::HadRaceEngineer,
            "Julien Simon-Chautemps",
            span("2019-01-01", "2021-12-31"),
            1.0,
        );
        let resolver = QueryResolver::new(&store);

        let before = TemporalQuery::object_of(
            EntityId::from_name(kimi),
            RelationType::HadRaceEngineer,
            TimeSpec::Before(day("2014-01-01")),
        );
        let answer = answered(resolver.resolve(&before).unwrap());
        assert_eq!(answer.answer_entities, vec![EntityId::from_name("Andrea Stella")]);

        let after = TemporalQuery::object_of(
            EntityId::from_name(kimi),
            RelationType::HadRaceEngineer,
            TimeSpec::After(day("2016-06-30")),
        );
        let answer = answered(resolver.resolve(&after).unwrap());
        assert_eq!(answer.answer_entities, vec![EntityId::from_name("Dave Greenwood")]);
    }

    #[test]
    fn inverse_relation_answers_the_same_question() {
        let store = FactStore::open_in_memory().unwrap();
        put(
            &store,
            "Peter Bonnington",
            RelationType::RaceEngineerFor,
            "Lewis Hamilton",
            span("2013-01-01", "2024-12-31"),
            1.0,
        );

        let query = TemporalQuery::object_of(
            EntityId::from_name("Lewis Hamilton"),
            RelationType::HadRaceEngineer,
            TimeSpec::At(day("2019-05-01")),
        );
        let answer = answered(QueryResolver::new(&store).resolve(&query).unwrap());
        assert_eq!(answer.answer_entities, vec![EntityId::from_name("Peter Bonnington")]);
    }

    #[test]
    fn engineer_side_facts_resolve_conflicts_with_driver_side_facts() {
        let store = FactStore::open_in_memory().unwrap();
        put(
            &store,
            "Lewis Hamilton",
            RelationType::HadRaceEngineer,
            "Peter Bonnington",
            span("2013-01-01", "2024-12-31"),
            0.9,
        );
        put(
            &store,
            "Xavi Marcos",
            RelationType::RaceEngineerFor,
            "Lewis Hamilton",
            Interval::year(2017).unwrap(),
            0.5,
        );
        assert_eq!(store.conflict_log(10).unwrap().len(), 1);

        let by_driver = TemporalQuery::object_of(
            EntityId::from_name("Lewis Hamilton"),
            RelationType::HadRaceEngineer,
            TimeSpec::During(Interval::year(2017).unwrap()),
        );
        let answer = answered(QueryResolver::new(&store).resolve(&by_driver).unwrap());
        assert!(!answer.ambiguous);
        assert_eq!(answer.answer_entities, vec![EntityId::from_name("Peter Bonnington")]);

        let by_engineer = TemporalQuery::subject_of(
            RelationType::RaceEngineerFor,
            EntityId::from_name("Lewis Hamilton"),
            TimeSpec::During(Interval::year(2017).unwrap()),
        );
        let answer = answered(QueryResolver::new(&store).resolve(&by_engineer).unwrap());
        assert_eq!(answer.answer_entities, vec![EntityId::from_name("Peter Bonnington")]);
    }

    #[test]
    fn subject_side_questions_read_the_subject() {
        let store = FactStore::open_in_memory().unwrap();
        put(
            &store,
            "Toto Wolff",
            RelationType::TeamPrincipalOf,
            "Mercedes",
            Interval::since(day("2013-01-21")),
            1.0,
        );

        let query = TemporalQuery::subject_of(
            RelationType::TeamPrincipalOf,
            EntityId::from_name("Mercedes"),
            TimeSpec::At(day("2020-01-01")),
        );
        let answer = answered(QueryResolver::new(&store).resolve(&query).unwrap());
        assert_eq!(answer.answer_entities, vec![EntityId::from_name("Toto Wolff")]);
    }

    #[test]
    fn summary_lists_entities_with_their_years() {
        let store = FactStore::open_in_memory().unwrap();
        put(&store, "X", RelationType::Employs, "Bob", span("2020-01-01", "2020-07-01"), 0.9);
        put(&store, "X", RelationType::Employs, "Alice", span("2020-07-02", "2020-12-31"), 0.7);
        let query = TemporalQuery::object_of(
            EntityId::from_name("X"),
            RelationType::Employs,
            TimeSpec::During(Interval::year(2020).unwrap()),
        );
        let answer = answered(QueryResolver::new(&store).resolve(&query).unwrap());
        let text = answer.summary(|id| id.to_string());
        assert_eq!(text, "alice (2020); bob (2020)");
    }
}
