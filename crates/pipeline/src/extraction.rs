//! Extraction capability: documents -> raw tuples, questions -> spans.
//!
//! Real deployments put a language model behind [`Extractor`] and
//! [`QuestionAnalyzer`]. The implementations here are deterministic:
//! [`StaticExtractor`] replays canned tuples, [`read_tuples_jsonl`] loads a
//! previous extraction run, and [`PatternAnalyzer`] splits questions with
//! regular expressions.

use crate::normalizer::RawTuple;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::BufRead;
use std::path::Path;
use std::sync::LazyLock;
use tracing::warn;

/// A unit of source text, e.g. one wiki page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("extraction service failed: {0}")]
    Service(String),
}

pub trait Extractor {
    /// Candidate tuples found in `document`; possibly none.
    fn extract(&self, document: &Document) -> Result<Vec<RawTuple>, ExtractionError>;
}

/// Replays tuples registered per document id.
#[derive(Debug, Clone, Default)]
pub struct StaticExtractor {
    by_document: HashMap<String, Vec<RawTuple>>,
    failing: HashSet<String>,
}

impl StaticExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, document_id: &str, tuples: Vec<RawTuple>) -> Self {
        self.by_document
            .entry(document_id.to_string())
            .or_default()
            .extend(tuples);
        self
    }

    /// Make extraction of `document_id` fail, as a timed-out service would.
    pub fn failing_on(mut self, document_id: &str) -> Self {
        self.failing.insert(document_id.to_string());
        self
    }

    /// Group tuples by their `document_id`.
    pub fn from_tuples(tuples: impl IntoIterator<Item = RawTuple>) -> Self {
        let mut extractor = Self::new();
        for tuple in tuples {
            extractor
                .by_document
                .entry(tuple.document_id.clone())
                .or_default()
                .push(tuple);
        }
        extractor
    }

    pub fn document_ids(&self) -> impl Iterator<Item = &str> {
        self.by_document.keys().map(String::as_str)
    }
}

impl Extractor for StaticExtractor {
    fn extract(&self, document: &Document) -> Result<Vec<RawTuple>, ExtractionError> {
        if self.failing.contains(&document.id) {
            return Err(ExtractionError::Service(format!(
                "no response for document {}",
                document.id
            )));
        }
        Ok(self
            .by_document
            .get(&document.id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Tuples read from a JSON Lines file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TupleBatch {
    pub tuples: Vec<RawTuple>,
    /// Lines that were not valid tuples; skipped.
    pub malformed: usize,
}

/// Read one [`RawTuple`] per line. Blank lines are ignored, malformed lines
/// are logged and counted.
pub fn read_tuples_jsonl(reader: impl BufRead) -> Result<TupleBatch, ExtractionError> {
    let mut batch = TupleBatch::default();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RawTuple>(line) {
            Ok(tuple) => batch.tuples.push(tuple),
            Err(e) => {
                warn!(line = index + 1, error = %e, "skipping malformed tuple");
                batch.malformed += 1;
            }
        }
    }
    Ok(batch)
}

pub fn read_tuples_jsonl_file(path: impl AsRef<Path>) -> Result<TupleBatch, ExtractionError> {
    let file = std::fs::File::open(path)?;
    read_tuples_jsonl(std::io::BufReader::new(file))
}

// ---------------------------------------------------------------------------
// Question analysis
// ---------------------------------------------------------------------------

/// The parts of a question, as text spans.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QuestionSpans {
    pub entity: Option<String>,
    /// The entity was written in possessive form (`"Hamilton's"`).
    pub possessive: bool,
    /// The entity came before the relation phrase.
    pub entity_first: bool,
    pub relation: Option<String>,
    pub time: Option<String>,
}

pub trait QuestionAnalyzer {
    fn analyze(&self, question: &str) -> Result<QuestionSpans, ExtractionError>;
}

macro_rules! question_pattern {
    ($name:ident, $regex_str:expr) => {
        static $name: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new($regex_str).ok());
    };
}

question_pattern!(
    RE_TIME,
    r"(?ix)
    \b(?:
        currently | right\s+now | now | today | nowadays | at\s+the\s+moment | at\s+present | these\s+days
      | (?:(?:in|during|on|before|after|since|until|till|from|between|through|by)\s+)?(?:the\s+)?
        (?:
            \d{4}-\d{2}-\d{2}
          | (?:\d{1,2}\s+)?(?:jan|feb|mar|apr|may|jun|jul|aug|sep|sept|oct|nov|dec)[a-z]*\.?\s+(?:\d{1,2}(?:st|nd|rd|th)?,?\s+)?\d{4}
          | season\s+\d{4}
          | \d{4}
            (?:\s*(?:-|–|—|to|until|and)\s*(?:\d{4}|present|now))?
            (?:\s+(?:f1\s+|formula\s+(?:one|1)\s+)?season)?
            (?:\s+(?:onwards?|and\s+beyond))?
        )
    )\b"
);
question_pattern!(
    RE_WH_PREFIX,
    r"(?i)^\s*(?:who|whom|whose|what|which)\b(?:\s+(?:team|teams|driver|drivers|engineer|person|constructor)\b)?(?:\s+(?:is|was|were|are|did|does|do|has|had|have)\b)?\s*"
);
question_pattern!(
    RE_ENTITY,
    r"\p{Lu}[\p{L}\p{N}'’.\-]*(?:\s+(?:(?:de|da|di|del|van|von|der|la|le)\s+)*\p{Lu}[\p{L}\p{N}'’.\-]*)*"
);

/// Regex-based analyzer for short factual questions.
///
/// The time phrase is cut out first, then the leading wh-word and auxiliary,
/// then the first capitalized name. What remains is the relation phrase.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternAnalyzer;

impl QuestionAnalyzer for PatternAnalyzer {
    fn analyze(&self, question: &str) -> Result<QuestionSpans, ExtractionError> {
        let (Some(re_time), Some(re_wh), Some(re_entity)) =
            (RE_TIME.as_ref(), RE_WH_PREFIX.as_ref(), RE_ENTITY.as_ref())
        else {
            return Err(ExtractionError::Service(
                "question patterns failed to compile".to_string(),
            ));
        };

        let q = question.trim().trim_end_matches(['?', '.', '!']);
        let mut spans = QuestionSpans::default();

        let rest = match re_time.find(q) {
            Some(m) => {
                spans.time = Some(m.as_str().trim().to_string());
                format!("{} {}", &q[..m.start()], &q[m.end()..])
            }
            None => q.to_string(),
        };
        let rest = match re_wh.find(&rest) {
            Some(m) => rest[m.end()..].to_string(),
            None => rest,
        };

        let (before, after) = match re_entity.find(&rest) {
            Some(m) => {
                let mut name = m.as_str().trim_end_matches(['.', '-']);
                for suffix in ["'s", "’s", "'", "’"] {
                    if let Some(stripped) = name.strip_suffix(suffix) {
                        name = stripped;
                        spans.possessive = true;
                        break;
                    }
                }
                spans.entity = Some(name.to_string());
                (&rest[..m.start()], &rest[m.end()..])
            }
            None => (rest.as_str(), ""),
        };

        let before = relation_words(before);
        let after = relation_words(after);
        spans.entity_first = spans.entity.is_some() && before.is_empty();
        spans.relation = match (before.is_empty(), after.is_empty()) {
            (true, true) => None,
            (false, true) => Some(before),
            (true, false) => Some(after),
            (false, false) => Some(format!("{before} {after}")),
        };
        Ok(spans)
    }
}

fn relation_words(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}
