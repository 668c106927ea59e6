//! Pitwall: embedded temporal fact store.
//!
//! The core primitive is a [`Fact`]: a subject-predicate-object triple that
//! holds over a validity [`Interval`]. Facts sharing a subject and predicate
//! form a *conflict group*; the store guarantees that within a group no two
//! facts with different objects are active over the same day. Conflicts are
//! settled on insert by confidence, then by ingestion recency, and the loser
//! is marked superseded over the overlapping range only. Nothing is deleted:
//! every fact keeps its provenance and its supersession history.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use pitwall::{EntityId, Fact, FactFilter, FactStore, Interval, RelationType, SourceRef};
//!
//! let store = FactStore::open("f1.pitwall").unwrap();
//!
//! let fact = Fact::new(
//!     EntityId::from_name("Lewis Hamilton"),
//!     RelationType::HadRaceEngineer,
//!     EntityId::from_name("Peter Bonnington"),
//!     Interval::year(2017).unwrap(),
//!     SourceRef::document("Lewis Hamilton"),
//! );
//! store.insert(fact).unwrap();
//!
//! let at = Interval::point("2017-06-01".parse().unwrap());
//! let filter = FactFilter::new()
//!     .subject(EntityId::from_name("Lewis Hamilton"))
//!     .predicate(RelationType::HadRaceEngineer);
//! let matches = store.query(&filter, at).unwrap();
//! ```

pub mod interval;
pub mod relation;
pub mod resolver;

pub use interval::{Interval, MalformedInterval};
pub use relation::RelationType;
pub use resolver::{Answer, QueryResolver, Resolution, Target, TemporalQuery, TimeSpec};

use chrono::{DateTime, Datelike, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};
use ulid::Ulid;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PitwallError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    MalformedInterval(#[from] MalformedInterval),
    #[error("invalid fact: {0}")]
    InvalidFact(String),
    /// Two active facts with different objects overlap inside one conflict
    /// group. Raised only if conflict resolution itself is broken.
    #[error("internal consistency violated: {0}")]
    Invariant(String),
}

impl From<redb::DatabaseError> for PitwallError {
    fn from(e: redb::DatabaseError) -> Self {
        PitwallError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for PitwallError {
    fn from(e: redb::TransactionError) -> Self {
        PitwallError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for PitwallError {
    fn from(e: redb::TableError) -> Self {
        PitwallError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for PitwallError {
    fn from(e: redb::StorageError) -> Self {
        PitwallError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for PitwallError {
    fn from(e: redb::CommitError) -> Self {
        PitwallError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PitwallError>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// A stable, time-sortable identifier for a [`Fact`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactId(pub String);

impl FactId {
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }
}

impl Default for FactId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical identifier of an entity: the slug of its normalized name.
///
/// `"Lewis Hamilton"`, `"lewis hamilton."` and `"Lewis Hamilton's"` all
/// become `lewis-hamilton`. Slugs never contain `:`, which keeps them safe
/// inside composite storage keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn from_name(name: &str) -> Self {
        Self(normalize_name(name).replace(' ', "-"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Case- and punctuation-insensitive form of a name, used as alias key.
///
/// Possessive suffixes are dropped, every non-alphanumeric character becomes
/// a separator, and whitespace is collapsed.
pub fn normalize_name(text: &str) -> String {
    let lowered = text.trim().to_lowercase().replace('\u{2019}', "'");
    lowered
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|word| {
            let word = word.strip_suffix("'s").unwrap_or(word);
            word.replace('\'', "")
        })
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Tokens of a normalized name in reverse order: `"lewis hamilton"` becomes
/// `"hamilton lewis"`.
///
/// Every name ending with the tokens of `key` sorts directly after
/// `suffix_key(key) + " "`, so suffix lookup is a prefix range scan.
pub fn suffix_key(key: &str) -> String {
    key.split(' ').rev().collect::<Vec<_>>().join(" ")
}

/// A named entity: canonical id, display name, and every surface form seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: EntityId,
    /// First surface form observed.
    pub name: String,
    pub aliases: BTreeSet<String>,
}

impl EntityRef {
    pub fn new(name: &str) -> Self {
        let name = name.trim().to_string();
        let mut aliases = BTreeSet::new();
        aliases.insert(name.clone());
        Self {
            id: EntityId::from_name(&name),
            name,
            aliases,
        }
    }

    /// Record another surface form. Returns `true` if it was new.
    pub fn add_alias(&mut self, alias: &str) -> bool {
        let alias = alias.trim();
        if alias.is_empty() {
            return false;
        }
        self.aliases.insert(alias.to_string())
    }
}

/// Where a fact was read: originating document and sentence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub document: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentence: Option<String>,
}

impl SourceRef {
    pub fn document(document: impl Into<String>) -> Self {
        Self {
            document: document.into(),
            sentence: None,
        }
    }

    pub fn with_sentence(mut self, sentence: impl Into<String>) -> Self {
        self.sentence = Some(sentence.into());
        self
    }
}

/// The core primitive: a subject-predicate-object triple valid over an
/// [`Interval`].
///
/// Facts are immutable once stored. Whether a fact is still in force over a
/// given day is tracked separately, as a list of [`Supersession`]s kept by
/// the [`FactStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// Stable time-sortable ID.
    pub id: FactId,
    pub subject: EntityId,
    pub predicate: RelationType,
    pub object: EntityId,
    /// When the relationship held in the world, as asserted by the source.
    pub interval: Interval,
    /// Confidence from the extraction step \[0.0, 1.0\].
    pub confidence: f32,
    pub provenance: SourceRef,
    /// When this fact was built.
    pub recorded_at: DateTime<Utc>,
    /// Ingestion order, assigned by the store on insert. Higher is more recent.
    #[serde(default)]
    pub seq: u64,
}

impl Fact {
    /// Create a fact with full confidence.
    ///
    /// A relation stored in the opposite direction is flipped here:
    /// `(engineer, is_race_engineer_for, driver)` becomes
    /// `(driver, had_race_engineer, engineer)`, so both readings land in one
    /// conflict group.
    pub fn new(
        subject: EntityId,
        predicate: RelationType,
        object: EntityId,
        interval: Interval,
        provenance: SourceRef,
    ) -> Self {
        Self {
            id: FactId::new(),
            subject,
            predicate,
            object,
            interval,
            confidence: 1.0,
            provenance,
            recorded_at: Utc::now(),
            seq: 0,
        }
        .into_canonical()
    }

    /// The same fact in its stored direction.
    pub fn into_canonical(mut self) -> Self {
        if let Some(stored) = self.predicate.stored_reversed_as() {
            std::mem::swap(&mut self.subject, &mut self.object);
            self.predicate = stored;
        }
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    /// Identity used for idempotent inserts: same triple, same interval,
    /// same source.
    fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.subject,
            self.predicate,
            self.object,
            self.interval,
            self.provenance.document,
            self.provenance.sentence.as_deref().unwrap_or("")
        )
    }

    fn validate(&self) -> Result<()> {
        if self.subject.0.is_empty() || self.object.0.is_empty() {
            return Err(PitwallError::InvalidFact(format!(
                "fact {} has an empty subject or object",
                self.id
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(PitwallError::InvalidFact(format!(
                "fact {} has confidence {} outside [0, 1]",
                self.id, self.confidence
            )));
        }
        // A deserialized interval is validated on the way in; this covers
        // facts built field by field.
        Interval::new(self.interval.start_day(), self.interval.end_day())?;
        Ok(())
    }
}

/// Why a fact lost a range to a sibling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupersessionReason {
    /// The winner carried strictly higher confidence.
    HigherConfidence,
    /// Equal confidence; the more recently ingested fact wins.
    LaterIngestTie,
}

/// Part of a fact's interval over which another fact is in force.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Supersession {
    pub by: FactId,
    pub range: Interval,
    pub reason: SupersessionReason,
}

/// Audit record of one conflict-resolution decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictEvent {
    pub winner: FactId,
    pub loser: FactId,
    pub subject: EntityId,
    pub predicate: RelationType,
    pub range: Interval,
    pub reason: SupersessionReason,
    pub at: DateTime<Utc>,
}

/// Partial key for [`FactStore::query`]; unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactFilter {
    pub subject: Option<EntityId>,
    pub predicate: Option<RelationType>,
    pub object: Option<EntityId>,
}

impl FactFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subject(mut self, subject: EntityId) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn predicate(mut self, predicate: RelationType) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn object(mut self, object: EntityId) -> Self {
        self.object = Some(object);
        self
    }

    fn matches(&self, fact: &Fact) -> bool {
        self.subject.as_ref().is_none_or(|s| *s == fact.subject)
            && self.predicate.is_none_or(|p| p == fact.predicate)
            && self.object.as_ref().is_none_or(|o| *o == fact.object)
    }
}

/// A stored fact together with the segments of its interval still in force.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactMatch {
    pub fact: Fact,
    /// Sorted, disjoint. Empty when the fact is fully superseded.
    pub active: Vec<Interval>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted,
    /// The same fact was already stored under this id; nothing changed.
    Duplicate,
}

/// What [`FactStore::insert`] did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsertReport {
    pub fact_id: FactId,
    pub outcome: InsertOutcome,
    /// Segments of the inserted fact left in force after resolution.
    pub active: Vec<Interval>,
    pub conflicts: Vec<ConflictEvent>,
}

impl InsertReport {
    /// The incoming fact lost every day of its interval.
    pub fn fully_superseded(&self) -> bool {
        self.outcome == InsertOutcome::Inserted && self.active.is_empty()
    }
}

/// Counts reported by [`FactStore::stats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub entities: usize,
    pub facts: usize,
    pub partially_superseded: usize,
    pub fully_superseded: usize,
    pub conflict_events: usize,
    /// Earliest and latest bounded year mentioned by any fact.
    pub year_range: Option<(i32, i32)>,
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Composite key `"{subject}:{predicate}:{fact_id}"` -> fact JSON.
///
/// A conflict group is one contiguous key range, so sibling lookup on insert
/// is a single range scan.
const FACTS: TableDefinition<&str, &str> = TableDefinition::new("facts");
/// `fact_id` -> primary key in `FACTS`.
const FACT_KEYS: TableDefinition<&str, &str> = TableDefinition::new("fact_keys");
/// `"{object}:{predicate}:{fact_id}"` -> primary key in `FACTS`.
const BY_OBJECT: TableDefinition<&str, &str> = TableDefinition::new("by_object");
/// `fact_id` -> JSON list of [`Supersession`]s held against that fact.
const SUPERSESSIONS: TableDefinition<&str, &str> = TableDefinition::new("supersessions");
/// Idempotency: dedup key -> fact_id.
const DEDUP: TableDefinition<&str, &str> = TableDefinition::new("dedup");
/// `entity_id` -> [`EntityRef`] JSON.
const ENTITIES: TableDefinition<&str, &str> = TableDefinition::new("entities");
/// Normalized alias -> `entity_id`.
const ALIASES: TableDefinition<&str, &str> = TableDefinition::new("aliases");
/// [`suffix_key`] of every alias -> `entity_id`.
const ALIAS_SUFFIXES: TableDefinition<&str, &str> = TableDefinition::new("alias_suffixes");
/// Append-only [`ConflictEvent`] log keyed by sequence number.
const AUDIT: TableDefinition<u64, &str> = TableDefinition::new("audit");
/// Named counters.
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const SEQ_COUNTER: &str = "fact_seq";
const AUDIT_COUNTER: &str = "audit_seq";

fn fact_key(fact: &Fact) -> String {
    format!("{}:{}:{}", fact.subject, fact.predicate, fact.id)
}

fn object_key(fact: &Fact) -> String {
    format!("{}:{}:{}", fact.object, fact.predicate, fact.id)
}

fn key_prefix(entity: &EntityId, predicate: Option<RelationType>) -> String {
    match predicate {
        Some(p) => format!("{entity}:{p}:"),
        None => format!("{entity}:"),
    }
}

fn load_supersessions(
    table: &impl ReadableTable<&'static str, &'static str>,
    fact_id: &FactId,
) -> Result<Vec<Supersession>> {
    let raw: Option<String> = table
        .get(fact_id.0.as_str())?
        .map(|guard| guard.value().to_string());
    match raw {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(Vec::new()),
    }
}

fn active_segments(fact: &Fact, supersessions: &[Supersession]) -> Vec<Interval> {
    let cuts: Vec<Interval> = supersessions.iter().map(|s| s.range).collect();
    Interval::merge(Interval::subtract_all(&[fact.interval], &cuts))
}

/// A conflict-group member loaded into memory during an insert.
struct GroupMember {
    fact: Fact,
    supersessions: Vec<Supersession>,
    active: Vec<Interval>,
    dirty: bool,
}

impl GroupMember {
    fn new(fact: Fact, supersessions: Vec<Supersession>) -> Self {
        let active = active_segments(&fact, &supersessions);
        Self {
            fact,
            supersessions,
            active,
            dirty: false,
        }
    }

    fn supersede(&mut self, range: Interval, by: &FactId, reason: SupersessionReason) {
        self.supersessions.push(Supersession {
            by: by.clone(),
            range,
            reason,
        });
        self.active = Interval::subtract_all(&self.active, &[range]);
        self.dirty = true;
    }

    fn overlaps_with(&self, other: &GroupMember) -> Vec<Interval> {
        self.active
            .iter()
            .flat_map(|a| other.active.iter().filter_map(move |b| a.intersection(b)))
            .collect()
    }
}

fn check_group_invariant(members: &[&GroupMember]) -> Result<()> {
    for (i, a) in members.iter().enumerate() {
        for b in &members[i + 1..] {
            if a.fact.object == b.fact.object {
                continue;
            }
            if let Some(range) = a.overlaps_with(b).first() {
                return Err(PitwallError::Invariant(format!(
                    "facts {} and {} are both active over {range} for ({}, {})",
                    a.fact.id, b.fact.id, a.fact.subject, a.fact.predicate
                )));
            }
        }
    }
    Ok(())
}

/// Pitwall temporal fact store.
///
/// An embedded store backed by `redb`. Every insert runs in one write
/// transaction, which redb serializes, so conflict resolution never races
/// with another insert. Queries run on read snapshots and may proceed
/// concurrently with each other and with a writer.
///
/// # Example
///
/// ```rust,no_run
/// use pitwall::FactStore;
///
/// let store = FactStore::open("f1.pitwall").unwrap();
/// let hamilton = store.entity_by_name("lewis hamilton").unwrap();
/// ```
pub struct FactStore {
    db: Database,
}

impl FactStore {
    /// Open or create a store at the given path.
    pub fn open(path: &str) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Create an in-memory store (no file I/O). Data is lost on drop.
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(FACTS)?;
        write_txn.open_table(FACT_KEYS)?;
        write_txn.open_table(BY_OBJECT)?;
        write_txn.open_table(SUPERSESSIONS)?;
        write_txn.open_table(DEDUP)?;
        write_txn.open_table(ENTITIES)?;
        write_txn.open_table(ALIASES)?;
        write_txn.open_table(ALIAS_SUFFIXES)?;
        write_txn.open_table(AUDIT)?;
        write_txn.open_table(META)?;
        write_txn.commit()?;
        Ok(Self { db })
    }

    fn next_counter(write_txn: &redb::WriteTransaction, name: &str) -> Result<u64> {
        let mut meta = write_txn.open_table(META)?;
        let current: u64 = meta.get(name)?.map(|g| g.value()).unwrap_or(0);
        let next = current + 1;
        meta.insert(name, next)?;
        Ok(next)
    }

    /// Store a fact and resolve conflicts within its `(subject, predicate)`
    /// group.
    ///
    /// Siblings with a different object are visited strongest first
    /// (confidence, then recency). On every overlap the higher-confidence
    /// fact keeps the range; on equal confidence the incoming fact, being
    /// the later ingested, keeps it. The loser is superseded over exactly
    /// the overlap. An incoming fact that loses every day is still stored,
    /// fully superseded.
    ///
    /// Inserting a fact identical to a stored one (same triple, interval and
    /// provenance) returns [`InsertOutcome::Duplicate`] and changes nothing.
    ///
    /// # Errors
    ///
    /// [`PitwallError::InvalidFact`] / [`PitwallError::MalformedInterval`]
    /// before anything is written; [`PitwallError::Invariant`] if the group
    /// would end up with overlapping active facts, in which case the
    /// transaction is rolled back.
    pub fn insert(&self, fact: Fact) -> Result<InsertReport> {
        self.insert_with_entities(fact, &[])
    }

    /// [`insert`](Self::insert), upserting `entities` in the same write
    /// transaction so a stored fact never refers to an unstored entity.
    ///
    /// Entities are still upserted when the fact is a duplicate; an error
    /// rolls back both.
    pub fn insert_with_entities(
        &self,
        fact: Fact,
        entities: &[EntityRef],
    ) -> Result<InsertReport> {
        let fact = fact.into_canonical();
        fact.validate()?;
        let dedup_key = fact.dedup_key();

        let write_txn = self.db.begin_write()?;

        {
            let dedup = write_txn.open_table(DEDUP)?;
            let existing: Option<String> = dedup
                .get(dedup_key.as_str())?
                .map(|guard| guard.value().to_string());
            if let Some(existing_id) = existing {
                drop(dedup);
                if entities.is_empty() {
                    write_txn.abort()?;
                } else {
                    for entity in entities {
                        Self::upsert_entity_in(&write_txn, entity)?;
                    }
                    write_txn.commit()?;
                }
                debug!(fact_id = %existing_id, "duplicate fact ignored");
                return self.duplicate_report(FactId(existing_id));
            }
        }

        let mut fact = fact;
        fact.seq = Self::next_counter(&write_txn, SEQ_COUNTER)?;

        let prefix = key_prefix(&fact.subject, Some(fact.predicate));
        let mut siblings: Vec<GroupMember> = Vec::new();
        {
            let facts = write_txn.open_table(FACTS)?;
            let supersessions = write_txn.open_table(SUPERSESSIONS)?;
            for entry in facts.range(prefix.as_str()..)? {
                let (k, v) = entry?;
                if !k.value().starts_with(prefix.as_str()) {
                    break;
                }
                let sibling: Fact = serde_json::from_str(v.value())?;
                let held = load_supersessions(&supersessions, &sibling.id)?;
                siblings.push(GroupMember::new(sibling, held));
            }
        }

        let mut incoming = GroupMember::new(fact, Vec::new());
        let mut events: Vec<ConflictEvent> = Vec::new();

        let mut rivals: Vec<usize> = (0..siblings.len())
            .filter(|&i| siblings[i].fact.object != incoming.fact.object)
            .collect();
        rivals.sort_by(|&a, &b| {
            let (fa, fb) = (&siblings[a].fact, &siblings[b].fact);
            fb.confidence
                .total_cmp(&fa.confidence)
                .then(fb.seq.cmp(&fa.seq))
        });

        for i in rivals {
            let sibling = &mut siblings[i];
            for range in incoming.overlaps_with(sibling) {
                let (winner, loser, reason) =
                    if sibling.fact.confidence > incoming.fact.confidence {
                        let reason = SupersessionReason::HigherConfidence;
                        incoming.supersede(range, &sibling.fact.id, reason);
                        (&sibling.fact, &incoming.fact, reason)
                    } else {
                        let reason = if sibling.fact.confidence == incoming.fact.confidence {
                            SupersessionReason::LaterIngestTie
                        } else {
                            SupersessionReason::HigherConfidence
                        };
                        sibling.supersede(range, &incoming.fact.id, reason);
                        (&incoming.fact, &sibling.fact, reason)
                    };
                events.push(ConflictEvent {
                    winner: winner.id.clone(),
                    loser: loser.id.clone(),
                    subject: incoming.fact.subject.clone(),
                    predicate: incoming.fact.predicate,
                    range,
                    reason,
                    at: Utc::now(),
                });
            }
        }

        {
            let mut members: Vec<&GroupMember> = siblings.iter().collect();
            members.push(&incoming);
            check_group_invariant(&members)?;
        }

        let fact = &incoming.fact;
        let primary_key = fact_key(fact);
        {
            let mut facts = write_txn.open_table(FACTS)?;
            facts.insert(primary_key.as_str(), serde_json::to_string(fact)?.as_str())?;
        }
        {
            let mut ids = write_txn.open_table(FACT_KEYS)?;
            ids.insert(fact.id.0.as_str(), primary_key.as_str())?;
        }
        {
            let mut by_object = write_txn.open_table(BY_OBJECT)?;
            by_object.insert(object_key(fact).as_str(), primary_key.as_str())?;
        }
        {
            let mut dedup = write_txn.open_table(DEDUP)?;
            dedup.insert(dedup_key.as_str(), fact.id.0.as_str())?;
        }
        {
            let mut supersessions = write_txn.open_table(SUPERSESSIONS)?;
            for member in siblings.iter().chain(std::iter::once(&incoming)) {
                if member.dirty {
                    let json = serde_json::to_string(&member.supersessions)?;
                    supersessions.insert(member.fact.id.0.as_str(), json.as_str())?;
                }
            }
        }
        for event in &events {
            let seq = Self::next_counter(&write_txn, AUDIT_COUNTER)?;
            let mut audit = write_txn.open_table(AUDIT)?;
            audit.insert(seq, serde_json::to_string(event)?.as_str())?;
        }
        for entity in entities {
            Self::upsert_entity_in(&write_txn, entity)?;
        }

        write_txn.commit()?;

        for event in &events {
            info!(
                winner = %event.winner,
                loser = %event.loser,
                subject = %event.subject,
                predicate = %event.predicate,
                range = %event.range,
                reason = ?event.reason,
                "conflict resolution applied"
            );
        }
        debug!(fact_id = %incoming.fact.id, seq = incoming.fact.seq, "fact stored");

        Ok(InsertReport {
            fact_id: incoming.fact.id.clone(),
            outcome: InsertOutcome::Inserted,
            active: Interval::merge(incoming.active),
            conflicts: events,
        })
    }

    fn duplicate_report(&self, fact_id: FactId) -> Result<InsertReport> {
        let read_txn = self.db.begin_read()?;
        let supersessions = read_txn.open_table(SUPERSESSIONS)?;
        let fact = Self::fact_in(&read_txn, &fact_id)?;
        let held = load_supersessions(&supersessions, &fact_id)?;
        Ok(InsertReport {
            fact_id,
            outcome: InsertOutcome::Duplicate,
            active: active_segments(&fact, &held),
            conflicts: Vec::new(),
        })
    }

    /// Active facts matching `filter` whose active segments overlap `at`.
    ///
    /// Partial keys are fine: a subject uses the primary key range, an
    /// object uses the object index, anything else scans. An empty result is
    /// a legitimate answer, not an error. Results come back in ingestion
    /// order.
    pub fn query(&self, filter: &FactFilter, at: Interval) -> Result<Vec<FactMatch>> {
        let mut matches = self.history(filter)?;
        matches.retain(|m| m.active.iter().any(|segment| segment.overlaps(&at)));
        Ok(matches)
    }

    /// Every stored fact matching `filter`, superseded ones included, with
    /// its active segments.
    pub fn history(&self, filter: &FactFilter) -> Result<Vec<FactMatch>> {
        let read_txn = self.db.begin_read()?;
        let facts = Self::scan(&read_txn, filter)?;
        let supersessions = read_txn.open_table(SUPERSESSIONS)?;
        let mut matches = Vec::with_capacity(facts.len());
        for fact in facts {
            let held = load_supersessions(&supersessions, &fact.id)?;
            let active = active_segments(&fact, &held);
            matches.push(FactMatch { fact, active });
        }
        matches.sort_by_key(|m| m.fact.seq);
        Ok(matches)
    }

    fn scan(read_txn: &redb::ReadTransaction, filter: &FactFilter) -> Result<Vec<Fact>> {
        let facts = read_txn.open_table(FACTS)?;
        let mut results = Vec::new();

        if let Some(subject) = &filter.subject {
            let prefix = key_prefix(subject, filter.predicate);
            for entry in facts.range(prefix.as_str()..)? {
                let (k, v) = entry?;
                if !k.value().starts_with(prefix.as_str()) {
                    break;
                }
                let fact: Fact = serde_json::from_str(v.value())?;
                if filter.matches(&fact) {
                    results.push(fact);
                }
            }
        } else if let Some(object) = &filter.object {
            let by_object = read_txn.open_table(BY_OBJECT)?;
            let prefix = key_prefix(object, filter.predicate);
            for entry in by_object.range(prefix.as_str()..)? {
                let (k, primary) = entry?;
                if !k.value().starts_with(prefix.as_str()) {
                    break;
                }
                let raw: Option<String> = facts
                    .get(primary.value())?
                    .map(|guard| guard.value().to_string());
                let raw = raw.ok_or_else(|| {
                    PitwallError::Storage(format!("dangling object index entry {}", k.value()))
                })?;
                let fact: Fact = serde_json::from_str(&raw)?;
                if filter.matches(&fact) {
                    results.push(fact);
                }
            }
        } else {
            for entry in facts.iter()? {
                let (_k, v) = entry?;
                let fact: Fact = serde_json::from_str(v.value())?;
                if filter.matches(&fact) {
                    results.push(fact);
                }
            }
        }

        Ok(results)
    }

    fn fact_in(read_txn: &redb::ReadTransaction, fact_id: &FactId) -> Result<Fact> {
        let ids = read_txn.open_table(FACT_KEYS)?;
        let facts = read_txn.open_table(FACTS)?;
        let key: Option<String> = ids
            .get(fact_id.0.as_str())?
            .map(|guard| guard.value().to_string());
        let key = key.ok_or_else(|| PitwallError::NotFound(format!("fact id {fact_id}")))?;
        let raw: Option<String> = facts
            .get(key.as_str())?
            .map(|guard| guard.value().to_string());
        let raw = raw.ok_or_else(|| PitwallError::NotFound(format!("fact id {fact_id}")))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Retrieve a fact by its id.
    pub fn fact_by_id(&self, fact_id: &FactId) -> Result<Fact> {
        let read_txn = self.db.begin_read()?;
        Self::fact_in(&read_txn, fact_id)
    }

    /// Ranges of `fact_id`'s interval taken over by other facts.
    pub fn supersessions(&self, fact_id: &FactId) -> Result<Vec<Supersession>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SUPERSESSIONS)?;
        load_supersessions(&table, fact_id)
    }

    /// The most recent `limit` conflict events, oldest first.
    pub fn conflict_log(&self, limit: usize) -> Result<Vec<ConflictEvent>> {
        let read_txn = self.db.begin_read()?;
        let audit = read_txn.open_table(AUDIT)?;
        let mut events = Vec::new();
        for entry in audit.iter()?.rev().take(limit) {
            let (_seq, v) = entry?;
            events.push(serde_json::from_str::<ConflictEvent>(v.value())?);
        }
        events.reverse();
        Ok(events)
    }

    /// Insert or merge an entity and index every alias.
    ///
    /// An existing entity keeps its display name and gains any new aliases.
    /// An alias already bound to another entity stays bound to it.
    pub fn upsert_entity(&self, entity: &EntityRef) -> Result<EntityRef> {
        let write_txn = self.db.begin_write()?;
        let merged = Self::upsert_entity_in(&write_txn, entity)?;
        write_txn.commit()?;
        Ok(merged)
    }

    fn upsert_entity_in(
        write_txn: &redb::WriteTransaction,
        entity: &EntityRef,
    ) -> Result<EntityRef> {
        let merged = {
            let mut entities = write_txn.open_table(ENTITIES)?;
            let existing: Option<String> = entities
                .get(entity.id.0.as_str())?
                .map(|guard| guard.value().to_string());
            let merged = match existing {
                Some(json) => {
                    let mut stored: EntityRef = serde_json::from_str(&json)?;
                    stored.aliases.extend(entity.aliases.iter().cloned());
                    stored
                }
                None => entity.clone(),
            };
            entities.insert(merged.id.0.as_str(), serde_json::to_string(&merged)?.as_str())?;
            merged
        };
        let mut aliases = write_txn.open_table(ALIASES)?;
        let mut suffixes = write_txn.open_table(ALIAS_SUFFIXES)?;
        let keys = std::iter::once(merged.name.as_str())
            .chain(merged.aliases.iter().map(String::as_str))
            .map(normalize_name)
            .filter(|key| !key.is_empty());
        for key in keys {
            let bound = aliases.get(key.as_str())?.is_some();
            if !bound {
                aliases.insert(key.as_str(), merged.id.0.as_str())?;
                suffixes.insert(suffix_key(&key).as_str(), merged.id.0.as_str())?;
            }
        }
        Ok(merged)
    }

    /// Alias lookup: the entity a surface form refers to, if known.
    pub fn entity_by_name(&self, text: &str) -> Result<Option<EntityRef>> {
        let key = normalize_name(text);
        if key.is_empty() {
            return Ok(None);
        }
        let read_txn = self.db.begin_read()?;
        let aliases = read_txn.open_table(ALIASES)?;
        let id: Option<String> = aliases
            .get(key.as_str())?
            .map(|guard| guard.value().to_string());
        match id {
            Some(id) => self.entity(&EntityId(id)),
            None => Ok(None),
        }
    }

    /// The one entity with a known name that `text` is a strict token
    /// suffix of: `"Hamilton"` finds `"Lewis Hamilton"`. `None` when no name
    /// or more than one entity matches.
    ///
    /// Never matches a shorter name, so `"Frank Williams"` does not find
    /// `"Williams"`.
    pub fn entity_by_suffix(&self, text: &str) -> Result<Option<EntityRef>> {
        let key = normalize_name(text);
        if key.is_empty() {
            return Ok(None);
        }
        let prefix = format!("{} ", suffix_key(&key));
        let read_txn = self.db.begin_read()?;
        let suffixes = read_txn.open_table(ALIAS_SUFFIXES)?;
        let mut found: Option<String> = None;
        for entry in suffixes.range(prefix.as_str()..)? {
            let (k, v) = entry?;
            if !k.value().starts_with(prefix.as_str()) {
                break;
            }
            match &found {
                Some(existing) if existing != v.value() => return Ok(None),
                Some(_) => {}
                None => found = Some(v.value().to_string()),
            }
        }
        match found {
            Some(id) => self.entity(&EntityId(id)),
            None => Ok(None),
        }
    }

    pub fn entity(&self, id: &EntityId) -> Result<Option<EntityRef>> {
        let read_txn = self.db.begin_read()?;
        let entities = read_txn.open_table(ENTITIES)?;
        let raw: Option<String> = entities
            .get(id.0.as_str())?
            .map(|guard| guard.value().to_string());
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Every known entity, ordered by id.
    pub fn entities(&self) -> Result<Vec<EntityRef>> {
        let read_txn = self.db.begin_read()?;
        let entities = read_txn.open_table(ENTITIES)?;
        let mut out = Vec::new();
        for entry in entities.iter()? {
            let (_k, v) = entry?;
            out.push(serde_json::from_str(v.value())?);
        }
        Ok(out)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let all = self.history(&FactFilter::new())?;
        let mut stats = StoreStats {
            entities: self.entities()?.len(),
            facts: all.len(),
            conflict_events: {
                let read_txn = self.db.begin_read()?;
                let meta = read_txn.open_table(META)?;
                let count = meta.get(AUDIT_COUNTER)?.map(|g| g.value()).unwrap_or(0);
                count as usize
            },
            ..StoreStats::default()
        };
        let mut years: Option<(i32, i32)> = None;
        for m in &all {
            if m.active.is_empty() {
                stats.fully_superseded += 1;
            } else if m.active != vec![m.fact.interval] {
                stats.partially_superseded += 1;
            }
            let bounds = [m.fact.interval.start(), m.fact.interval.end()];
            for year in bounds.into_iter().flatten().map(|d| d.year()) {
                years = Some(match years {
                    Some((lo, hi)) => (lo.min(year), hi.max(year)),
                    None => (year, year),
                });
            }
        }
        stats.year_range = years;
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
