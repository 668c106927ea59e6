//! Raw extraction output -> validated [`Fact`].

use crate::calendar::{SeasonCalendar, StaticCalendar};
use crate::registry::EntityRegistry;
use crate::time_phrase::{self, TimeExpr, TimePhraseError};
use chrono::Datelike;
use pitwall::{normalize_name, Fact, Interval, RelationType, SourceRef};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::sync::Arc;

/// One candidate relationship as produced by an extractor.
///
/// Field aliases accept the `triples.jsonl` layout (`subject`, `predicate`,
/// `object`, `year`, `source_page`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTuple {
    #[serde(alias = "subject")]
    pub subject_text: String,
    #[serde(alias = "predicate")]
    pub predicate_text: String,
    #[serde(alias = "object")]
    pub object_text: String,
    #[serde(
        default,
        alias = "year",
        alias = "time",
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub time_text: Option<String>,
    #[serde(default, alias = "sentence", skip_serializing_if = "Option::is_none")]
    pub source_sentence: Option<String>,
    #[serde(default, alias = "source_page", alias = "document")]
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

impl RawTuple {
    pub fn new(subject: &str, predicate: &str, object: &str, document_id: &str) -> Self {
        Self {
            subject_text: subject.to_string(),
            predicate_text: predicate.to_string(),
            object_text: object.to_string(),
            time_text: None,
            source_sentence: None,
            document_id: document_id.to_string(),
            confidence: None,
        }
    }

    pub fn with_time(mut self, time: &str) -> Self {
        self.time_text = Some(time.to_string());
        self
    }

    pub fn with_sentence(mut self, sentence: &str) -> Self {
        self.source_sentence = Some(sentence.to_string());
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a time phrase or year, got {other}"
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    UnmappedPredicate,
    MissingTime,
    UnparseableTime,
    UnknownSeason,
    MalformedInterval,
    InvalidConfidence,
    SelfRelation,
    EmptyEntity,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::UnmappedPredicate => "unmapped_predicate",
            RejectionReason::MissingTime => "missing_time",
            RejectionReason::UnparseableTime => "unparseable_time",
            RejectionReason::UnknownSeason => "unknown_season",
            RejectionReason::MalformedInterval => "malformed_interval",
            RejectionReason::InvalidConfidence => "invalid_confidence",
            RejectionReason::SelfRelation => "self_relation",
            RejectionReason::EmptyEntity => "empty_entity",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw tuple that could not become a fact. Recoverable: the tuple is
/// skipped and counted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("normalization rejected ({reason}): {detail}")]
pub struct NormalizationRejected {
    pub reason: RejectionReason,
    pub detail: String,
}

impl NormalizationRejected {
    fn new(reason: RejectionReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizerConfig {
    /// Bounded interval sides must fall inside `[min_year, max_year]`.
    pub min_year: i32,
    pub max_year: i32,
    /// Used when the extractor gives no confidence.
    pub default_confidence: f32,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            min_year: 1950,
            max_year: 2100,
            default_confidence: 1.0,
        }
    }
}

/// Maps predicates onto [`RelationType`], parses time phrases into
/// intervals, and resolves both ends through an [`EntityRegistry`].
pub struct FactNormalizer {
    config: NormalizerConfig,
    calendar: Arc<dyn SeasonCalendar>,
}

impl Default for FactNormalizer {
    fn default() -> Self {
        Self::new(NormalizerConfig::default(), Arc::new(StaticCalendar::formula_one()))
    }
}

impl FactNormalizer {
    pub fn new(config: NormalizerConfig, calendar: Arc<dyn SeasonCalendar>) -> Self {
        Self { config, calendar }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    pub fn calendar(&self) -> Arc<dyn SeasonCalendar> {
        Arc::clone(&self.calendar)
    }

    /// Normalize one tuple.
    ///
    /// Entities are resolved last, so a rejected tuple never adds entities
    /// or aliases to `registry`.
    pub fn normalize(
        &self,
        raw: &RawTuple,
        registry: &mut EntityRegistry,
    ) -> Result<Fact, NormalizationRejected> {
        let predicate = RelationType::from_synonym(&raw.predicate_text).ok_or_else(|| {
            NormalizationRejected::new(
                RejectionReason::UnmappedPredicate,
                format!("{:?}", raw.predicate_text),
            )
        })?;

        let interval = self.interval(raw.time_text.as_deref())?;

        let confidence = raw.confidence.unwrap_or(self.config.default_confidence);
        if !(0.0..=1.0).contains(&confidence) {
            return Err(NormalizationRejected::new(
                RejectionReason::InvalidConfidence,
                confidence.to_string(),
            ));
        }

        let (subject_key, object_key) = (
            normalize_name(&raw.subject_text),
            normalize_name(&raw.object_text),
        );
        if subject_key.is_empty() || object_key.is_empty() {
            return Err(NormalizationRejected::new(
                RejectionReason::EmptyEntity,
                format!("{:?} / {:?}", raw.subject_text, raw.object_text),
            ));
        }
        let known_same = match (
            registry.lookup_exact(&raw.subject_text),
            registry.lookup_exact(&raw.object_text),
        ) {
            (Some(s), Some(o)) => s.id == o.id,
            _ => false,
        };
        if known_same || subject_key == object_key {
            return Err(NormalizationRejected::new(
                RejectionReason::SelfRelation,
                raw.subject_text.clone(),
            ));
        }
        let (subject, object) = registry
            .resolve_pair(&raw.subject_text, &raw.object_text)
            .ok_or_else(|| NormalizationRejected::new(RejectionReason::EmptyEntity, "subject"))?;
        if subject == object {
            return Err(NormalizationRejected::new(
                RejectionReason::SelfRelation,
                raw.subject_text.clone(),
            ));
        }

        let mut provenance = SourceRef::document(raw.document_id.clone());
        if let Some(sentence) = &raw.source_sentence {
            provenance = provenance.with_sentence(sentence.clone());
        }

        Ok(Fact::new(subject, predicate, object, interval, provenance).with_confidence(confidence))
    }

    fn interval(&self, time_text: Option<&str>) -> Result<Interval, NormalizationRejected> {
        let text = time_text
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                NormalizationRejected::new(RejectionReason::MissingTime, "no time phrase")
            })?;

        let interval = match time_phrase::parse(text, self.calendar.as_ref()) {
            Ok(TimeExpr::Span(interval)) => interval,
            Ok(TimeExpr::Before(day)) => day
                .pred_opt()
                .map(Interval::until)
                .ok_or_else(|| self.unparseable(text))?,
            Ok(TimeExpr::After(day)) => day
                .succ_opt()
                .map(Interval::since)
                .ok_or_else(|| self.unparseable(text))?,
            // "present" alone says nothing about when the relation began.
            Ok(TimeExpr::Current) => return Err(self.unparseable(text)),
            Err(TimePhraseError::UnknownSeason(year)) => {
                return Err(NormalizationRejected::new(
                    RejectionReason::UnknownSeason,
                    year.to_string(),
                ))
            }
            Err(TimePhraseError::Malformed(e)) => {
                return Err(NormalizationRejected::new(
                    RejectionReason::MalformedInterval,
                    e.to_string(),
                ))
            }
            Err(_) => return Err(self.unparseable(text)),
        };

        let in_range = |year: i32| (self.config.min_year..=self.config.max_year).contains(&year);
        let sides = [interval.start(), interval.end()];
        if sides.iter().flatten().any(|day| !in_range(day.year())) {
            return Err(NormalizationRejected::new(
                RejectionReason::UnparseableTime,
                format!("{text:?} is outside {}..={}", self.config.min_year, self.config.max_year),
            ));
        }
        Ok(interval)
    }

    fn unparseable(&self, text: &str) -> NormalizationRejected {
        NormalizationRejected::new(RejectionReason::UnparseableTime, format!("{text:?}"))
    }
}
