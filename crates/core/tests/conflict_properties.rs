//! Property tests: conflict groups never end up with overlapping active
//! facts, and re-inserting a fact never changes the active set.

use chrono::NaiveDate;
use proptest::prelude::*;

use pitwall::{EntityId, Fact, FactFilter, FactStore, Interval, RelationType, SourceRef};

const OBJECTS: [&str; 4] = ["Bob", "Alice", "Carol", "Dave"];

fn make_fact(object: usize, start: u32, len: u32, confidence_tenths: u8, doc: usize) -> Fact {
    let base = NaiveDate::from_ymd_opt(2010, 1, 1).unwrap();
    let start = base + chrono::Days::new(u64::from(start));
    let end = start + chrono::Days::new(u64::from(len));
    Fact::new(
        EntityId::from_name("X"),
        RelationType::Employs,
        EntityId::from_name(OBJECTS[object]),
        Interval::new(start, end).unwrap(),
        SourceRef::document(format!("doc-{doc}")),
    )
    .with_confidence(f32::from(confidence_tenths) / 10.0)
}

fn fact_strategy() -> impl Strategy<Value = (usize, u32, u32, u8)> {
    (0..OBJECTS.len(), 0u32..3000, 0u32..1500, 0u8..=10)
}

fn active_set(store: &FactStore) -> Vec<(String, Vec<Interval>)> {
    store
        .history(&FactFilter::new())
        .unwrap()
        .into_iter()
        .map(|m| (m.fact.id.0, m.active))
        .collect()
}

proptest! {
    #[test]
    fn prop_active_facts_with_different_objects_never_overlap(
        facts in prop::collection::vec(fact_strategy(), 1..12)
    ) {
        let store = FactStore::open_in_memory().unwrap();
        for (i, (object, start, len, conf)) in facts.into_iter().enumerate() {
            store.insert(make_fact(object, start, len, conf, i)).unwrap();
        }

        let all = store.history(&FactFilter::new()).unwrap();
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                if a.fact.object == b.fact.object {
                    continue;
                }
                for sa in &a.active {
                    for sb in &b.active {
                        prop_assert!(
                            !sa.overlaps(sb),
                            "{} and {} both active over {} / {}",
                            a.fact.object, b.fact.object, sa, sb
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn prop_reinserting_a_fact_leaves_active_set_unchanged(
        facts in prop::collection::vec(fact_strategy(), 1..8),
        pick in any::<prop::sample::Index>()
    ) {
        let store = FactStore::open_in_memory().unwrap();
        let mut stored = Vec::new();
        for (i, (object, start, len, conf)) in facts.into_iter().enumerate() {
            let fact = make_fact(object, start, len, conf, i);
            store.insert(fact.clone()).unwrap();
            stored.push(fact);
        }
        let before = active_set(&store);

        let again = stored[pick.index(stored.len())].clone();
        store.insert(again).unwrap();

        prop_assert_eq!(active_set(&store), before);
    }

    #[test]
    fn prop_active_segments_stay_inside_the_fact_interval(
        facts in prop::collection::vec(fact_strategy(), 1..10)
    ) {
        let store = FactStore::open_in_memory().unwrap();
        for (i, (object, start, len, conf)) in facts.into_iter().enumerate() {
            store.insert(make_fact(object, start, len, conf, i)).unwrap();
        }
        for m in store.history(&FactFilter::new()).unwrap() {
            for segment in &m.active {
                prop_assert!(m.fact.interval.start_day() <= segment.start_day());
                prop_assert!(segment.end_day() <= m.fact.interval.end_day());
            }
        }
    }
}
