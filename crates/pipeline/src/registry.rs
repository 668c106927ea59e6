//! Entity resolution for one ingestion run.
//!
//! Mentions are matched on their normalized form first. Failing that, a
//! mention that is a strict whole-token suffix of exactly one known name
//! resolves to it: `"Hamilton"` finds `"Lewis Hamilton"`. A longer mention
//! never resolves to a shorter name, so `"Frank Williams"` is not the team
//! `"Williams"`. Anything else becomes a new entity.

use pitwall::{normalize_name, suffix_key, EntityId, EntityRef};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: BTreeMap<EntityId, EntityRef>,
    /// normalized alias -> entity
    aliases: HashMap<String, EntityId>,
    /// `suffix_key` of every alias -> entity
    suffixes: BTreeMap<String, EntityId>,
    changed: BTreeSet<EntityId>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from already-known entities, e.g. the store's entity table.
    pub fn from_entities(entities: impl IntoIterator<Item = EntityRef>) -> Self {
        let mut registry = Self::new();
        for entity in entities {
            registry.index(&entity);
            registry.entities.insert(entity.id.clone(), entity);
        }
        registry
    }

    fn index(&mut self, entity: &EntityRef) {
        let names = std::iter::once(&entity.name).chain(entity.aliases.iter());
        for name in names {
            let key = normalize_name(name);
            if !key.is_empty() {
                self.bind(key, &entity.id);
            }
        }
    }

    fn bind(&mut self, key: String, id: &EntityId) {
        if !self.aliases.contains_key(&key) {
            self.suffixes.insert(suffix_key(&key), id.clone());
            self.aliases.insert(key, id.clone());
        }
    }

    /// Read-only lookup: exact normalized alias, then a unique strict
    /// token-suffix match.
    pub fn lookup(&self, mention: &str) -> Option<&EntityRef> {
        let key = normalize_name(mention);
        if key.is_empty() {
            return None;
        }
        let id = self
            .aliases
            .get(&key)
            .cloned()
            .or_else(|| self.suffix_match(&key))?;
        self.entities.get(&id)
    }

    /// Exact normalized alias only.
    pub fn lookup_exact(&self, mention: &str) -> Option<&EntityRef> {
        let id = self.aliases.get(&normalize_name(mention))?;
        self.entities.get(id)
    }

    fn suffix_match(&self, key: &str) -> Option<EntityId> {
        let prefix = format!("{} ", suffix_key(key));
        let mut found: Option<&EntityId> = None;
        for (known, id) in self.suffixes.range(prefix.clone()..) {
            if !known.starts_with(&prefix) {
                break;
            }
            match found {
                Some(existing) if existing != id => return None,
                _ => found = Some(id),
            }
        }
        found.cloned()
    }

    /// Resolve a mention to an entity, creating one if nothing matches.
    /// A new surface form of a known entity is kept as an alias.
    ///
    /// Returns `None` only for mentions with no name characters at all.
    pub fn resolve(&mut self, mention: &str) -> Option<EntityId> {
        self.resolve_avoiding(mention, None)
    }

    /// Resolve both ends of a relation.
    ///
    /// The end with an exact match is resolved first; the other end may not
    /// reach the same entity through a suffix match and becomes a new entity
    /// instead. Both ends resolve to one entity only when both match it
    /// exactly.
    pub fn resolve_pair(
        &mut self,
        subject: &str,
        object: &str,
    ) -> Option<(EntityId, EntityId)> {
        let object_first =
            self.lookup_exact(object).is_some() && self.lookup_exact(subject).is_none();
        if object_first {
            let object = self.resolve_avoiding(object, None)?;
            let subject = self.resolve_avoiding(subject, Some(&object))?;
            Some((subject, object))
        } else {
            let subject = self.resolve_avoiding(subject, None)?;
            let object = self.resolve_avoiding(object, Some(&subject))?;
            Some((subject, object))
        }
    }

    fn resolve_avoiding(&mut self, mention: &str, avoid: Option<&EntityId>) -> Option<EntityId> {
        let key = normalize_name(mention);
        if key.is_empty() {
            return None;
        }
        let existing = self
            .aliases
            .get(&key)
            .cloned()
            .or_else(|| self.suffix_match(&key).filter(|id| Some(id) != avoid));

        match existing {
            Some(id) => {
                if let Some(entity) = self.entities.get_mut(&id) {
                    if entity.add_alias(mention) {
                        debug!(entity = %id, alias = mention.trim(), "alias added");
                        self.changed.insert(id.clone());
                    }
                }
                self.bind(key, &id);
                Some(id)
            }
            None => {
                let entity = EntityRef::new(mention);
                let id = entity.id.clone();
                self.index(&entity);
                self.entities.entry(id.clone()).or_insert(entity);
                self.changed.insert(id.clone());
                debug!(entity = %id, "new entity");
                Some(id)
            }
        }
    }

    pub fn get(&self, id: &EntityId) -> Option<&EntityRef> {
        self.entities.get(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRef> {
        self.entities.values()
    }

    /// Entities created or given new aliases since the last call.
    pub fn take_changed(&mut self) -> Vec<EntityRef> {
        std::mem::take(&mut self.changed)
            .into_iter()
            .filter_map(|id| self.entities.get(&id).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_name_in_other_case_is_one_entity() {
        let mut registry = EntityRegistry::new();
        let a = registry.resolve("Lewis Hamilton").unwrap();
        let b = registry.resolve("lewis hamilton").unwrap();
        let c = registry.resolve("Lewis Hamilton's").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn surname_resolves_to_the_unique_full_name_and_becomes_an_alias() {
        let mut registry = EntityRegistry::new();
        let full = registry.resolve("Lewis Hamilton").unwrap();
        registry.resolve("Max Verstappen").unwrap();

        let short = registry.resolve("Hamilton").unwrap();
        assert_eq!(short, full);
        assert!(registry.get(&full).unwrap().aliases.contains("Hamilton"));
        assert_eq!(registry.lookup("HAMILTON").unwrap().id, full);
    }

    #[test]
    fn longer_mention_is_not_the_shorter_known_name() {
        let mut registry = EntityRegistry::new();
        let team = registry.resolve("Williams").unwrap();
        let person = registry.resolve("Frank Williams").unwrap();
        assert_ne!(person, team);
        assert_eq!(person, EntityId::from_name("Frank Williams"));
        assert!(registry.lookup("Gene Haas").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn pair_ends_never_merge_through_a_suffix() {
        let mut registry = EntityRegistry::new();
        let (person, team) = registry
            .resolve_pair("Frank Williams", "Williams")
            .unwrap();
        assert_ne!(person, team);
        assert_eq!(team, EntityId::from_name("Williams"));

        // "Williams" would otherwise suffix-match "Frank Williams".
        let mut registry = EntityRegistry::new();
        registry.resolve("Frank Williams").unwrap();
        let (principal, team) = registry
            .resolve_pair("Frank Williams", "Williams")
            .unwrap();
        assert_eq!(principal, EntityId::from_name("Frank Williams"));
        assert_eq!(team, EntityId::from_name("Williams"));

        let (team, principal) = registry
            .resolve_pair("Williams", "Frank Williams")
            .unwrap();
        assert_eq!(team, EntityId::from_name("Williams"));
        assert_eq!(principal, EntityId::from_name("Frank Williams"));
    }

    #[test]
    fn pair_still_resolves_surnames() {
        let mut registry = EntityRegistry::new();
        let full = registry.resolve("Lewis Hamilton").unwrap();
        let (driver, team) = registry.resolve_pair("Hamilton", "Mercedes").unwrap();
        assert_eq!(driver, full);
        assert_eq!(team, EntityId::from_name("Mercedes"));
        assert!(registry.get(&full).unwrap().aliases.contains("Hamilton"));
    }

    #[test]
    fn ambiguous_surname_creates_its_own_entity() {
        let mut registry = EntityRegistry::new();
        registry.resolve("Michael Schumacher").unwrap();
        registry.resolve("Ralf Schumacher").unwrap();
        assert!(registry.lookup("Schumacher").is_none());
        let id = registry.resolve("Schumacher").unwrap();
        assert_eq!(id, EntityId::from_name("Schumacher"));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn punctuation_only_mentions_do_not_resolve() {
        let mut registry = EntityRegistry::new();
        assert!(registry.resolve(" -- ").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn changed_entities_are_drained_once() {
        let mut registry = EntityRegistry::from_entities([EntityRef::new("Mercedes")]);
        assert!(registry.take_changed().is_empty());
        registry.resolve("Ferrari").unwrap();
        registry.resolve("Mercedes").unwrap();
        let changed = registry.take_changed();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].name, "Ferrari");
        assert!(registry.take_changed().is_empty());
    }
}
