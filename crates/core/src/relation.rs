//! The closed vocabulary of relationships a fact can assert.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical relation between two entities.
///
/// Extracted predicates are free text (`"raced for"`, `"had_race_engineer"`,
/// ...); [`RelationType::from_synonym`] maps them onto this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    /// driver -> team
    DroveFor,
    /// driver -> race engineer
    HadRaceEngineer,
    /// race engineer -> driver
    #[serde(rename = "is_race_engineer_for")]
    RaceEngineerFor,
    /// team -> person
    Employs,
    /// person -> team
    TeamPrincipalOf,
    /// driver -> driver
    TeammateOf,
    /// driver or team -> championship
    WonChampionship,
    /// driver or team -> championship, for the stretch they led it
    LedChampionship,
}

const SYNONYMS: &[(&str, RelationType)] = &[
    ("drove_for", RelationType::DroveFor),
    ("drives_for", RelationType::DroveFor),
    ("drive_for", RelationType::DroveFor),
    ("raced_for", RelationType::DroveFor),
    ("races_for", RelationType::DroveFor),
    ("race_for", RelationType::DroveFor),
    ("race_for_team", RelationType::DroveFor),
    ("driver_for", RelationType::DroveFor),
    ("was_driver_for", RelationType::DroveFor),
    ("competed_for", RelationType::DroveFor),
    ("had_race_engineer", RelationType::HadRaceEngineer),
    ("has_race_engineer", RelationType::HadRaceEngineer),
    ("race_engineer", RelationType::HadRaceEngineer),
    ("engineered_by", RelationType::HadRaceEngineer),
    ("worked_with_race_engineer", RelationType::HadRaceEngineer),
    ("is_race_engineer_for", RelationType::RaceEngineerFor),
    ("was_race_engineer_for", RelationType::RaceEngineerFor),
    ("race_engineer_for", RelationType::RaceEngineerFor),
    ("race_engineer_of", RelationType::RaceEngineerFor),
    ("engineer_for", RelationType::RaceEngineerFor),
    ("engineered", RelationType::RaceEngineerFor),
    ("employs", RelationType::Employs),
    ("employed", RelationType::Employs),
    ("hired", RelationType::Employs),
    ("signed", RelationType::Employs),
    ("team_principal_of", RelationType::TeamPrincipalOf),
    ("was_team_principal_of", RelationType::TeamPrincipalOf),
    ("team_principal", RelationType::TeamPrincipalOf),
    ("led_team", RelationType::TeamPrincipalOf),
    ("teammate_of", RelationType::TeammateOf),
    ("was_teammate_of", RelationType::TeammateOf),
    ("teammate", RelationType::TeammateOf),
    ("partnered", RelationType::TeammateOf),
    ("partnered_with", RelationType::TeammateOf),
    ("won_championship", RelationType::WonChampionship),
    ("won_championship_in", RelationType::WonChampionship),
    ("won_the_championship", RelationType::WonChampionship),
    ("won_title", RelationType::WonChampionship),
    ("won_world_championship", RelationType::WonChampionship),
    ("champion_of", RelationType::WonChampionship),
    ("led_championship", RelationType::LedChampionship),
    ("led_the_championship", RelationType::LedChampionship),
    ("led_standings", RelationType::LedChampionship),
    ("dominated", RelationType::LedChampionship),
];

impl RelationType {
    pub const ALL: [RelationType; 8] = [
        RelationType::DroveFor,
        RelationType::HadRaceEngineer,
        RelationType::RaceEngineerFor,
        RelationType::Employs,
        RelationType::TeamPrincipalOf,
        RelationType::TeammateOf,
        RelationType::WonChampionship,
        RelationType::LedChampionship,
    ];

    /// Stable snake_case name, also used in storage keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::DroveFor => "drove_for",
            RelationType::HadRaceEngineer => "had_race_engineer",
            RelationType::RaceEngineerFor => "is_race_engineer_for",
            RelationType::Employs => "employs",
            RelationType::TeamPrincipalOf => "team_principal_of",
            RelationType::TeammateOf => "teammate_of",
            RelationType::WonChampionship => "won_championship",
            RelationType::LedChampionship => "led_championship",
        }
    }

    /// Map free-text predicate onto the closed set.
    ///
    /// Matching ignores case and treats spaces and hyphens as underscores, so
    /// `"Race Engineer for"` and `"race-engineer-for"` both resolve.
    pub fn from_synonym(text: &str) -> Option<RelationType> {
        let key = synonym_key(text);
        if key.is_empty() {
            return None;
        }
        SYNONYMS
            .iter()
            .find(|(synonym, _)| *synonym == key)
            .map(|(_, relation)| *relation)
    }

    /// Relations never stored as asserted: a fact `(a, self, b)` is kept as
    /// `(b, returned, a)`.
    pub fn stored_reversed_as(&self) -> Option<RelationType> {
        match self {
            RelationType::RaceEngineerFor => Some(RelationType::HadRaceEngineer),
            _ => None,
        }
    }

    /// The same relationship read from the other end, if one is modeled.
    /// Used when answering, so a question phrased either way finds the
    /// stored direction.
    pub fn inverse(&self) -> Option<RelationType> {
        match self {
            RelationType::HadRaceEngineer => Some(RelationType::RaceEngineerFor),
            RelationType::RaceEngineerFor => Some(RelationType::HadRaceEngineer),
            RelationType::TeammateOf => Some(RelationType::TeammateOf),
            _ => None,
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RelationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RelationType::from_synonym(s).ok_or_else(|| format!("unknown relation: {s}"))
    }
}

fn synonym_key(text: &str) -> String {
    text.trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_names_round_trip() {
        for relation in RelationType::ALL {
            assert_eq!(RelationType::from_synonym(relation.as_str()), Some(relation));
        }
    }

    #[test]
    fn synonyms_ignore_case_and_separators() {
        assert_eq!(
            RelationType::from_synonym("Race Engineer for"),
            Some(RelationType::RaceEngineerFor)
        );
        assert_eq!(
            RelationType::from_synonym(" raced-for "),
            Some(RelationType::DroveFor)
        );
        assert_eq!(
            RelationType::from_synonym("WON_CHAMPIONSHIP_IN"),
            Some(RelationType::WonChampionship)
        );
    }

    #[test]
    fn unknown_predicates_do_not_map() {
        assert_eq!(RelationType::from_synonym("likes"), None);
        assert_eq!(RelationType::from_synonym("   "), None);
    }

    #[test]
    fn only_race_engineer_for_is_stored_reversed() {
        assert_eq!(
            RelationType::RaceEngineerFor.stored_reversed_as(),
            Some(RelationType::HadRaceEngineer)
        );
        for relation in RelationType::ALL {
            if relation != RelationType::RaceEngineerFor {
                assert_eq!(relation.stored_reversed_as(), None);
            }
        }
    }

    #[test]
    fn race_engineer_relations_are_inverses() {
        assert_eq!(
            RelationType::HadRaceEngineer.inverse(),
            Some(RelationType::RaceEngineerFor)
        );
        assert_eq!(
            RelationType::TeammateOf.inverse(),
            Some(RelationType::TeammateOf)
        );
        assert_eq!(RelationType::DroveFor.inverse(), None);
    }

    #[test]
    fn serde_uses_snake_case_variant_names() {
        let json = serde_json::to_string(&RelationType::HadRaceEngineer).unwrap();
        assert_eq!(json, "\"had_race_engineer\"");
    }
}
