//! Ingestion and question answering on top of the Pitwall fact store.
//!
//! Documents go through an [`Extractor`], the resulting [`RawTuple`]s are
//! normalized into facts and inserted; questions go through a
//! [`QueryTranslator`] and are answered by a [`QueryResolver`].
//!
//! # Usage
//!
//! ```rust,no_run
//! use pitwall_pipeline::{AskOutcome, Pitwall, RawTuple};
//!
//! let pitwall = Pitwall::open("./f1.pitwall").unwrap();
//! pitwall
//!     .ingest_tuples(&[RawTuple::new(
//!         "Lewis Hamilton",
//!         "had_race_engineer",
//!         "Peter Bonnington",
//!         "Lewis Hamilton",
//!     )
//!     .with_time("2013-2024")])
//!     .unwrap();
//!
//! if let AskOutcome::Answered { summary, .. } =
//!     pitwall.ask("Who was Lewis Hamilton's race engineer in 2017?").unwrap()
//! {
//!     println!("{summary}");
//! }
//! ```

pub mod calendar;
pub mod extraction;
pub mod normalizer;
pub mod registry;
pub mod time_phrase;
pub mod translator;

pub use calendar::{SeasonCalendar, StaticCalendar};
pub use extraction::{
    read_tuples_jsonl, read_tuples_jsonl_file, Document, ExtractionError, Extractor,
    PatternAnalyzer, QuestionAnalyzer, QuestionSpans, StaticExtractor, TupleBatch,
};
pub use normalizer::{
    FactNormalizer, NormalizationRejected, NormalizerConfig, RawTuple, RejectionReason,
};
pub use registry::EntityRegistry;
pub use translator::{
    EntityLookup, FailureKind, QueryTranslator, TranslateError, TranslationFailed,
};

use pitwall::{
    Answer, EntityId, FactStore, InsertOutcome, Interval, QueryResolver, Resolution, TemporalQuery,
};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub use pitwall::PitwallError as Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Counters for one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestStats {
    pub documents: usize,
    pub extraction_failures: usize,
    pub candidates: usize,
    pub inserted: usize,
    pub duplicates: usize,
    /// Inserted, but lost every day to a stronger fact.
    pub fully_superseded: usize,
    /// Conflict-resolution decisions made while inserting.
    pub conflicts: usize,
    pub rejected: BTreeMap<RejectionReason, usize>,
}

impl IngestStats {
    pub fn rejected_total(&self) -> usize {
        self.rejected.values().sum()
    }
}

/// One sequential ingestion pass.
///
/// Owns the run's [`EntityRegistry`], seeded from the store so names seen
/// in earlier runs resolve to the same entities.
pub struct IngestRun<'a> {
    store: &'a FactStore,
    normalizer: &'a FactNormalizer,
    registry: EntityRegistry,
    stats: IngestStats,
}

impl<'a> IngestRun<'a> {
    pub fn new(store: &'a FactStore, normalizer: &'a FactNormalizer) -> Result<Self> {
        Ok(Self {
            store,
            normalizer,
            registry: EntityRegistry::from_entities(store.entities()?),
            stats: IngestStats::default(),
        })
    }

    /// Extract and ingest one document. An extraction failure counts as
    /// zero candidates and is not an error.
    pub fn document(&mut self, extractor: &dyn Extractor, document: &Document) -> Result<()> {
        self.stats.documents += 1;
        let tuples = match extractor.extract(document) {
            Ok(tuples) => tuples,
            Err(e) => {
                warn!(document = %document.id, error = %e, "extraction failed");
                self.stats.extraction_failures += 1;
                return Ok(());
            }
        };
        debug!(document = %document.id, candidates = tuples.len(), "extracted");
        for tuple in &tuples {
            self.tuple(tuple)?;
        }
        Ok(())
    }

    /// Normalize and insert one raw tuple. Rejections are counted, not
    /// returned; only store failures are errors.
    ///
    /// Entities the tuple created or extended are written in the fact's own
    /// transaction.
    pub fn tuple(&mut self, raw: &RawTuple) -> Result<()> {
        self.stats.candidates += 1;
        let fact = match self.normalizer.normalize(raw, &mut self.registry) {
            Ok(fact) => fact,
            Err(rejection) => {
                warn!(
                    reason = %rejection.reason,
                    detail = %rejection.detail,
                    document = %raw.document_id,
                    "tuple rejected"
                );
                *self.stats.rejected.entry(rejection.reason).or_default() += 1;
                return Ok(());
            }
        };

        let entities = self.registry.take_changed();
        let report = self.store.insert_with_entities(fact, &entities)?;
        match report.outcome {
            InsertOutcome::Inserted => {
                self.stats.inserted += 1;
                self.stats.conflicts += report.conflicts.len();
                if report.fully_superseded() {
                    self.stats.fully_superseded += 1;
                }
            }
            InsertOutcome::Duplicate => self.stats.duplicates += 1,
        }
        Ok(())
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn finish(self) -> IngestStats {
        let stats = self.stats;
        info!(
            documents = stats.documents,
            candidates = stats.candidates,
            inserted = stats.inserted,
            duplicates = stats.duplicates,
            rejected = stats.rejected_total(),
            conflicts = stats.conflicts,
            extraction_failures = stats.extraction_failures,
            "ingestion finished"
        );
        stats
    }
}

/// Result of [`Pitwall::ask`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AskOutcome {
    Answered {
        query: TemporalQuery,
        answer: Answer,
        summary: String,
    },
    /// The question was understood; nothing held at that time.
    NoFactFound {
        query: TemporalQuery,
        window: Interval,
    },
    /// The question could not be mapped; rephrase it.
    CannotAnswer { reason: TranslationFailed },
}

/// Fact store plus the ingestion and question-answering pipeline.
pub struct Pitwall {
    store: FactStore,
    normalizer: FactNormalizer,
    translator: QueryTranslator,
}

impl Pitwall {
    /// Open or create a store at the given path, with the Formula One
    /// season calendar.
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::with_store(FactStore::open(path)?, FactNormalizer::default()))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::with_store(
            FactStore::open_in_memory()?,
            FactNormalizer::default(),
        ))
    }

    pub fn with_store(store: FactStore, normalizer: FactNormalizer) -> Self {
        let translator = QueryTranslator::new(normalizer.calendar());
        Self {
            store,
            normalizer,
            translator,
        }
    }

    pub fn store(&self) -> &FactStore {
        &self.store
    }

    pub fn ingest_documents(
        &self,
        extractor: &dyn Extractor,
        documents: &[Document],
    ) -> Result<IngestStats> {
        let mut run = IngestRun::new(&self.store, &self.normalizer)?;
        for document in documents {
            run.document(extractor, document)?;
        }
        Ok(run.finish())
    }

    pub fn ingest_tuples(&self, tuples: &[RawTuple]) -> Result<IngestStats> {
        let mut run = IngestRun::new(&self.store, &self.normalizer)?;
        for tuple in tuples {
            run.tuple(tuple)?;
        }
        Ok(run.finish())
    }

    pub fn resolve(&self, query: &TemporalQuery) -> Result<Resolution> {
        QueryResolver::new(&self.store).resolve(query)
    }

    /// Answer a natural-language question.
    ///
    /// Questions that cannot be mapped come back as
    /// [`AskOutcome::CannotAnswer`]; only store failures are errors.
    pub fn ask(&self, question: &str) -> Result<AskOutcome> {
        let query = match self.translator.translate(question, &self.store) {
            Ok(query) => query,
            Err(TranslateError::Failed(reason)) => {
                debug!(question, kind = %reason.kind, "cannot answer");
                return Ok(AskOutcome::CannotAnswer { reason });
            }
            Err(TranslateError::Store(e)) => return Err(e),
        };
        debug!(question, query = ?query, "translated");

        Ok(match self.resolve(&query)? {
            Resolution::NoFactFound { window } => AskOutcome::NoFactFound { query, window },
            Resolution::Answered(answer) => {
                let summary = answer.summary(|id| self.display_name(id));
                AskOutcome::Answered {
                    query,
                    answer,
                    summary,
                }
            }
        })
    }

    /// Display name of an entity, falling back to its id.
    pub fn display_name(&self, id: &EntityId) -> String {
        match self.store.entity(id) {
            Ok(Some(entity)) => entity.name,
            _ => id.to_string(),
        }
    }
}
