//! Natural-language question -> [`TemporalQuery`].
//!
//! Mapping is table driven and never guesses: a relation phrase that is not
//! in the table, a time phrase that does not parse, or a name that matches
//! no known entity all fail with [`TranslationFailed`].

use crate::calendar::SeasonCalendar;
use crate::extraction::{PatternAnalyzer, QuestionAnalyzer, QuestionSpans};
use crate::registry::EntityRegistry;
use crate::time_phrase::{self, TimeExpr};
use pitwall::{EntityId, FactStore, PitwallError, RelationType, Target, TemporalQuery, TimeSpec};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Resolves a name mention to a known entity.
pub trait EntityLookup {
    fn lookup_entity(&self, mention: &str) -> pitwall::Result<Option<EntityId>>;
}

impl EntityLookup for EntityRegistry {
    fn lookup_entity(&self, mention: &str) -> pitwall::Result<Option<EntityId>> {
        Ok(self.lookup(mention).map(|e| e.id.clone()))
    }
}

impl EntityLookup for FactStore {
    /// Exact alias first, then a unique strict token-suffix match on the
    /// store's suffix index.
    fn lookup_entity(&self, mention: &str) -> pitwall::Result<Option<EntityId>> {
        match self.entity_by_name(mention)? {
            Some(entity) => Ok(Some(entity.id)),
            None => Ok(self.entity_by_suffix(mention)?.map(|entity| entity.id)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnrecognizedRelation,
    UnparseableTime,
    UnknownEntity,
    Extraction,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::UnrecognizedRelation => "unrecognized relation",
            FailureKind::UnparseableTime => "unparseable time",
            FailureKind::UnknownEntity => "unknown entity",
            FailureKind::Extraction => "extraction failed",
        })
    }
}

/// The question could not be mapped; the user should rephrase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error(
    "cannot answer, please rephrase ({kind}{})",
    .span.as_ref().map(|s| format!(": {s:?}")).unwrap_or_default()
)]
pub struct TranslationFailed {
    pub kind: FailureKind,
    /// The offending part of the question, when there is one.
    pub span: Option<String>,
    pub question: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error(transparent)]
    Failed(#[from] TranslationFailed),
    #[error(transparent)]
    Store(#[from] PitwallError),
}

/// Which end of the relation a possessive entity occupies:
/// `"Hamilton's race engineer"` puts Hamilton in the subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Subject,
    Object,
}

struct Phrase {
    text: &'static str,
    relation: RelationType,
    possessive: Option<Role>,
    /// Answerable without a named entity ("who won the championship").
    open: bool,
}

const fn phrase(text: &'static str, relation: RelationType) -> Phrase {
    Phrase {
        text,
        relation,
        possessive: None,
        open: false,
    }
}

const fn possessive(text: &'static str, relation: RelationType, role: Role) -> Phrase {
    Phrase {
        text,
        relation,
        possessive: Some(role),
        open: false,
    }
}

const fn open(text: &'static str, relation: RelationType) -> Phrase {
    Phrase {
        text,
        relation,
        possessive: None,
        open: true,
    }
}

const PHRASES: &[Phrase] = &[
    possessive("race engineer", RelationType::HadRaceEngineer, Role::Subject),
    possessive("engineer", RelationType::HadRaceEngineer, Role::Subject),
    phrase("race engineer for", RelationType::RaceEngineerFor),
    phrase("race engineer of", RelationType::RaceEngineerFor),
    phrase("engineer for", RelationType::RaceEngineerFor),
    phrase("engineered", RelationType::RaceEngineerFor),
    phrase("engineered for", RelationType::RaceEngineerFor),
    phrase("drive for", RelationType::DroveFor),
    phrase("drove for", RelationType::DroveFor),
    phrase("drives for", RelationType::DroveFor),
    phrase("driving for", RelationType::DroveFor),
    phrase("race for", RelationType::DroveFor),
    phrase("raced for", RelationType::DroveFor),
    phrase("races for", RelationType::DroveFor),
    phrase("racing for", RelationType::DroveFor),
    possessive("team principal", RelationType::TeamPrincipalOf, Role::Object),
    possessive("principal", RelationType::TeamPrincipalOf, Role::Object),
    possessive("boss", RelationType::TeamPrincipalOf, Role::Object),
    phrase("team principal of", RelationType::TeamPrincipalOf),
    phrase("principal of", RelationType::TeamPrincipalOf),
    phrase("boss of", RelationType::TeamPrincipalOf),
    phrase("lead", RelationType::TeamPrincipalOf),
    phrase("led", RelationType::TeamPrincipalOf),
    possessive("teammate", RelationType::TeammateOf, Role::Subject),
    possessive("team mate", RelationType::TeammateOf, Role::Subject),
    phrase("teammate of", RelationType::TeammateOf),
    phrase("partner", RelationType::TeammateOf),
    phrase("partnered", RelationType::TeammateOf),
    phrase("employ", RelationType::Employs),
    phrase("employs", RelationType::Employs),
    phrase("employed", RelationType::Employs),
    phrase("hire", RelationType::Employs),
    phrase("hired", RelationType::Employs),
    phrase("sign", RelationType::Employs),
    phrase("signed", RelationType::Employs),
    open("won championship", RelationType::WonChampionship),
    open("win championship", RelationType::WonChampionship),
    open("won title", RelationType::WonChampionship),
    open("won world championship", RelationType::WonChampionship),
    open("won drivers championship", RelationType::WonChampionship),
    open("won", RelationType::WonChampionship),
    open("win", RelationType::WonChampionship),
    open("dominated", RelationType::LedChampionship),
    open("dominate", RelationType::LedChampionship),
    open("led championship", RelationType::LedChampionship),
    open("lead championship", RelationType::LedChampionship),
];

const FILLER: &[&str] = &["the", "a", "an", "f1", "formula", "one", "world"];

/// Lowercase, drop articles and filler, collapse whitespace.
fn phrase_key(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty() && !FILLER.contains(&w.as_str()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn lookup_phrase(text: &str) -> Option<&'static Phrase> {
    let key = phrase_key(text);
    PHRASES.iter().find(|p| phrase_key(p.text) == key)
}

/// Translates questions using a [`QuestionAnalyzer`] and a season calendar.
pub struct QueryTranslator<A = PatternAnalyzer> {
    analyzer: A,
    calendar: Arc<dyn SeasonCalendar>,
}

impl QueryTranslator<PatternAnalyzer> {
    pub fn new(calendar: Arc<dyn SeasonCalendar>) -> Self {
        Self::with_analyzer(PatternAnalyzer, calendar)
    }
}

impl<A: QuestionAnalyzer> QueryTranslator<A> {
    pub fn with_analyzer(analyzer: A, calendar: Arc<dyn SeasonCalendar>) -> Self {
        Self { analyzer, calendar }
    }

    pub fn translate(
        &self,
        question: &str,
        entities: &dyn EntityLookup,
    ) -> Result<TemporalQuery, TranslateError> {
        let fail = |kind: FailureKind, span: Option<&str>| TranslationFailed {
            kind,
            span: span.map(str::to_string),
            question: question.to_string(),
        };

        let spans = self
            .analyzer
            .analyze(question)
            .map_err(|e| fail(FailureKind::Extraction, Some(&e.to_string())))?;

        let relation_text = spans
            .relation
            .as_deref()
            .ok_or_else(|| fail(FailureKind::UnrecognizedRelation, None))?;
        let phrase = match lookup_phrase(relation_text) {
            Some(p) => p,
            None => {
                let relation = RelationType::from_synonym(relation_text)
                    .ok_or_else(|| fail(FailureKind::UnrecognizedRelation, Some(relation_text)))?;
                // Canonical names fall back to positional roles.
                return self.build(
                    &Phrase {
                        text: "",
                        relation,
                        possessive: None,
                        open: false,
                    },
                    &spans,
                    entities,
                    &fail,
                );
            }
        };
        self.build(phrase, &spans, entities, &fail)
    }

    fn build(
        &self,
        phrase: &Phrase,
        spans: &QuestionSpans,
        entities: &dyn EntityLookup,
        fail: &dyn Fn(FailureKind, Option<&str>) -> TranslationFailed,
    ) -> Result<TemporalQuery, TranslateError> {
        let time = match spans.time.as_deref() {
            None => TimeSpec::Latest,
            Some(text) => match time_phrase::parse(text, self.calendar.as_ref()) {
                Ok(TimeExpr::Current) => TimeSpec::Latest,
                Ok(TimeExpr::Span(interval)) if interval.is_point() => {
                    TimeSpec::At(interval.start_day())
                }
                Ok(TimeExpr::Span(interval)) => TimeSpec::During(interval),
                Ok(TimeExpr::Before(day)) => TimeSpec::Before(day),
                Ok(TimeExpr::After(day)) => TimeSpec::After(day),
                Err(_) => return Err(fail(FailureKind::UnparseableTime, Some(text)).into()),
            },
        };

        let Some(mention) = spans.entity.as_deref() else {
            if phrase.open {
                return Ok(TemporalQuery {
                    subject: None,
                    predicate: phrase.relation,
                    object: None,
                    time,
                    target: Target::Subject,
                });
            }
            return Err(fail(FailureKind::UnknownEntity, None).into());
        };

        let entity = entities
            .lookup_entity(mention)?
            .ok_or_else(|| fail(FailureKind::UnknownEntity, Some(mention)))?;

        let role = match (spans.possessive, phrase.possessive) {
            (true, Some(role)) => role,
            _ if spans.entity_first => Role::Subject,
            _ => Role::Object,
        };

        Ok(match role {
            Role::Subject => TemporalQuery::object_of(entity, phrase.relation, time),
            Role::Object => TemporalQuery::subject_of(phrase.relation, entity, time),
        })
    }
}
