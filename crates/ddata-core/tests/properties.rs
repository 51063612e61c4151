//! Property-based tests that MUST pass for all replicated data types
//!
//! These tests verify the lattice laws that guarantee convergence:
//!  - Commutativity: a ⊔ b = b ⊔ a
//!  - Associativity: (a ⊔ b) ⊔ c = a ⊔ (b ⊔ c)
//!  - Idempotence:  a ⊔ a = a
//!  - Bottom is identity: a ⊔ ⊥ = a
//!
//! Observed-remove types are generated from valid histories: every replica
//! mutates under its own node id, optionally on top of a shared base.

use ddata_core::data::ReplicatedData;
use ddata_core::flag::Flag;
use ddata_core::gcounter::GCounter;
use ddata_core::gset::GSet;
use ddata_core::lattice::{DeltaCrdt, DeltaOp, Lattice};
use ddata_core::lwwmap::LWWMap;
use ddata_core::lwwreg::LWWRegister;
use ddata_core::node::NodeId;
use ddata_core::ormap::ORMap;
use ddata_core::ormultimap::ORMultiMap;
use ddata_core::orset::ORSet;
use ddata_core::pncounter::PNCounter;
use ddata_core::pncountermap::PNCounterMap;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use ddata_core::version_vector::{VersionOrdering, VersionVector};
use proptest::prelude::*;

fn node(id: &str) -> NodeId {
    NodeId::new(id)
}

/// Generate strategies for prop-testing

fn gset_i32_strategy() -> impl Strategy<Value = GSet<i32>> {
    prop::collection::btree_set(0i32..100, 0..20).prop_map(|elements| elements.into_iter().collect::<GSet<i32>>())
}

fn gcounter_strategy() -> impl Strategy<Value = GCounter> {
    prop::collection::vec((0usize..4, 0i64..100), 0..10).prop_map(|incs| {
        let mut counter = GCounter::new();
        for (n, amount) in incs {
            counter.increment(&node(&format!("replica{}", n)), amount).unwrap();
        }
        counter.reset_delta();
        counter
    })
}

fn pncounter_strategy() -> impl Strategy<Value = PNCounter> {
    prop::collection::vec((0usize..4, -50i64..100), 0..10).prop_map(|ops| {
        let mut counter = PNCounter::new();
        for (n, amount) in ops {
            counter.increment(&node(&format!("replica{}", n)), amount).unwrap();
        }
        counter.reset_delta();
        counter
    })
}

fn lwwreg_strategy() -> impl Strategy<Value = LWWRegister<String>> {
    (0usize..3, 0i64..1000).prop_map(|(n, ts)| {
        let writer = format!("replica{}", n);
        // value is a function of (timestamp, writer) so ties are consistent
        LWWRegister::with_timestamp(&node(&writer), format!("{}@{}", writer, ts), ts)
    })
}

fn set_ops() -> impl Strategy<Value = Vec<(bool, String)>> {
    prop::collection::vec((any::<bool>(), "[a-e]"), 0..12)
}

fn apply_set_ops(set: &mut ORSet<String>, writer: &NodeId, ops: &[(bool, String)]) {
    for (add, element) in ops {
        if *add {
            set.add(writer, element.clone());
        } else {
            set.remove(writer, element);
        }
    }
    set.reset_delta();
}

fn orset_replicas() -> impl Strategy<Value = (ORSet<String>, ORSet<String>, ORSet<String>)> {
    (set_ops(), set_ops(), set_ops(), set_ops()).prop_map(|(base_ops, a, b, c)| {
        let mut base = ORSet::new();
        apply_set_ops(&mut base, &node("base"), &base_ops);
        let replica = |writer: &str, ops: &[(bool, String)]| {
            let mut set = base.clone();
            apply_set_ops(&mut set, &node(writer), ops);
            set
        };
        (replica("a", &a), replica("b", &b), replica("c", &c))
    })
}

fn map_ops() -> impl Strategy<Value = Vec<(bool, String, i64)>> {
    prop::collection::vec((any::<bool>(), "[a-c]", 1i64..10), 0..10)
}

fn ormap_replica(writer: &str, ops: &[(bool, String, i64)]) -> ORMap<String, GCounter> {
    let writer = node(writer);
    let mut map = ORMap::new();
    for (update, key, amount) in ops {
        if *update {
            map.update(&writer, key.clone(), GCounter::new(), |c| c.increment(&writer, *amount))
                .unwrap();
        } else {
            map.remove(&writer, key);
        }
    }
    map.reset_delta();
    map
}

fn flag_strategy() -> impl Strategy<Value = Flag> {
    any::<bool>().prop_map(|on| if on { Flag::enabled() } else { Flag::new() })
}

fn lwwmap_replica(writer: &str, ops: &[(bool, String, i64)]) -> LWWMap<String, i64> {
    let writer = node(writer);
    let mut map = LWWMap::new();
    for (put, key, value) in ops {
        if *put {
            map.put(&writer, key.clone(), *value);
        } else {
            map.remove(&writer, key);
        }
    }
    map.reset_delta();
    map
}

fn pncountermap_replica(writer: &str, ops: &[(bool, String, i64)]) -> PNCounterMap<String> {
    let writer = node(writer);
    let mut map = PNCounterMap::new();
    for (update, key, amount) in ops {
        if *update {
            map.increment(&writer, key.clone(), *amount - 5).unwrap();
        } else {
            map.remove(&writer, key);
        }
    }
    map.reset_delta();
    map
}

/// (kind, key, value): 0 adds a binding, 1 removes it, 2 removes the key
fn multimap_ops() -> impl Strategy<Value = Vec<(u8, String, String)>> {
    prop::collection::vec((0u8..3, "[a-c]", "[x-z]"), 0..12)
}

fn apply_multimap_ops(map: &mut ORMultiMap<String, String>, writer: &NodeId, ops: &[(u8, String, String)]) {
    for (kind, key, value) in ops {
        match kind {
            0 => map.add_binding(writer, key.clone(), value.clone()).unwrap(),
            1 => map.remove_binding(writer, key.clone(), value).unwrap(),
            _ => map.remove(writer, key).unwrap(),
        }
    }
    map.reset_delta();
}

fn ormultimap_replica(
    writer: &str,
    ops: &[(u8, String, String)],
    value_deltas: bool,
) -> ORMultiMap<String, String> {
    let mut map = if value_deltas {
        ORMultiMap::with_value_deltas()
    } else {
        ORMultiMap::new()
    };
    apply_multimap_ops(&mut map, &node(writer), ops);
    map
}

fn multimap_entries(map: &ORMultiMap<String, String>) -> Vec<(String, BTreeSet<String>)> {
    map.entries().map(|(k, v)| (k.clone(), v)).collect()
}

fn version_vector_strategy() -> impl Strategy<Value = VersionVector> {
    prop::collection::btree_map(0usize..4, 1u64..6, 0..4).prop_map(|entries| {
        VersionVector::from_entries(
            entries
                .into_iter()
                .map(|(n, v)| (node(&format!("replica{}", n)), v)),
        )
    })
}

// ============================================================================
// GSet Property Tests
// ============================================================================

proptest! {
    #[test]
    fn gset_join_is_associative(
        a in gset_i32_strategy(),
        b in gset_i32_strategy(),
        c in gset_i32_strategy()
    ) {
        prop_assert_eq!(a.join(&b).join(&c), a.join(&b.join(&c)));
    }

    #[test]
    fn gset_bottom_is_identity(a in gset_i32_strategy()) {
        let bottom = GSet::bottom();
        prop_assert_eq!(a.join(&bottom), a.clone());
        prop_assert_eq!(bottom.join(&a), a);
    }
}

// ============================================================================
// Counter Property Tests
// ============================================================================

proptest! {
    #[test]
    fn gcounter_lattice_laws(
        a in gcounter_strategy(),
        b in gcounter_strategy(),
        c in gcounter_strategy()
    ) {
        prop_assert_eq!(a.join(&b), b.join(&a));
        prop_assert_eq!(a.join(&b).join(&c), a.join(&b.join(&c)));
        prop_assert_eq!(a.join(&a), a.clone());
        prop_assert_eq!(a.join(&GCounter::bottom()), a.clone());
        prop_assert!(a.leq(&a.join(&b)));
        prop_assert!(GCounter::bottom().leq(&a));
    }

    #[test]
    fn gcounter_increment_adds_exactly(a in gcounter_strategy(), d in 0i64..1000) {
        let mut next = a.clone();
        next.increment(&node("replica0"), d).unwrap();
        prop_assert_eq!(next.value(), a.value() + d as u64);
    }

    #[test]
    fn pncounter_lattice_laws(
        a in pncounter_strategy(),
        b in pncounter_strategy(),
        c in pncounter_strategy()
    ) {
        prop_assert_eq!(a.join(&b), b.join(&a));
        prop_assert_eq!(a.join(&b).join(&c), a.join(&b.join(&c)));
        prop_assert_eq!(a.join(&a), a);
    }

    #[test]
    fn counter_delta_round_trip(
        before in pncounter_strategy(),
        ops in prop::collection::vec((0usize..4, -20i64..20), 1..8)
    ) {
        let mut after = before.clone();
        for (n, amount) in ops {
            after.increment(&node(&format!("replica{}", n)), amount).unwrap();
        }
        match after.split_delta() {
            Some(delta) => prop_assert_eq!(before.merge_delta(&delta), after),
            None => prop_assert_eq!(before, after),
        }
    }
}

// ============================================================================
// LWWRegister Property Tests
// ============================================================================

proptest! {
    #[test]
    fn lwwreg_merge_laws(
        a in lwwreg_strategy(),
        b in lwwreg_strategy(),
        c in lwwreg_strategy()
    ) {
        prop_assert_eq!(a.merge(&b), b.merge(&a));
        prop_assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
        prop_assert_eq!(a.merge(&a), a);
    }
}

// ============================================================================
// ORSet Property Tests
// ============================================================================

proptest! {
    #[test]
    fn orset_lattice_laws((a, b, c) in orset_replicas()) {
        prop_assert_eq!(a.join(&b), b.join(&a));
        prop_assert_eq!(a.join(&b).join(&c), a.join(&b.join(&c)));
        prop_assert_eq!(a.join(&a), a.clone());
        prop_assert_eq!(a.join(&ORSet::bottom()), a);
    }

    #[test]
    fn orset_delta_round_trip(
        base_ops in set_ops(),
        ops in set_ops()
    ) {
        let mut before = ORSet::new();
        apply_set_ops(&mut before, &node("a"), &base_ops);

        let mut after = before.clone();
        for (add, element) in &ops {
            if *add {
                after.add(&node("b"), element.clone());
            } else {
                after.remove(&node("b"), element);
            }
        }
        let replayed = match after.split_delta() {
            Some(delta) => before.merge_delta(&delta),
            None => before.clone(),
        };
        prop_assert_eq!(replayed.elements(), after.elements());
    }
}

#[test]
fn orset_concurrent_add_wins_over_remove() {
    let mut base = ORSet::new();
    base.add(&node("a"), "x".to_string());
    base.reset_delta();

    let mut remover = base.clone();
    remover.remove(&node("a"), &"x".to_string());
    let mut adder = base.clone();
    adder.add(&node("b"), "x".to_string());

    assert!(remover.join(&adder).contains(&"x".to_string()));
    assert!(adder.join(&remover).contains(&"x".to_string()));
}

// ============================================================================
// ORMap Property Tests
// ============================================================================

proptest! {
    #[test]
    fn ormap_lattice_laws(a in map_ops(), b in map_ops(), c in map_ops()) {
        let a = ormap_replica("a", &a);
        let b = ormap_replica("b", &b);
        let c = ormap_replica("c", &c);
        prop_assert_eq!(a.join(&b), b.join(&a));
        prop_assert_eq!(a.join(&b).join(&c), a.join(&b.join(&c)));
        prop_assert_eq!(a.join(&a), a);
    }
}

// ============================================================================
// Flag Property Tests
// ============================================================================

proptest! {
    #[test]
    fn flag_lattice_laws(a in flag_strategy(), b in flag_strategy(), c in flag_strategy()) {
        prop_assert_eq!(a.join(&b), b.join(&a));
        prop_assert_eq!(a.join(&b).join(&c), a.join(&b.join(&c)));
        prop_assert_eq!(a.join(&a), a);
        prop_assert!(a.leq(&a.join(&b)));
    }

    #[test]
    fn flag_delta_is_its_own_state(a in flag_strategy(), b in flag_strategy()) {
        prop_assert_eq!(a.merge_op(&b), a.join(&b));
    }
}

#[test]
fn flag_only_moves_up() {
    assert_eq!(Flag::new().partial_cmp_lattice(&Flag::enabled()), Some(Ordering::Less));
    assert_eq!(Flag::enabled().partial_cmp_lattice(&Flag::new()), Some(Ordering::Greater));
    assert_eq!(Flag::enabled().partial_cmp_lattice(&Flag::enabled()), Some(Ordering::Equal));
}

// ============================================================================
// LWWMap Property Tests
// ============================================================================

proptest! {
    #[test]
    fn lwwmap_lattice_laws(a in map_ops(), b in map_ops(), c in map_ops()) {
        let a = lwwmap_replica("a", &a);
        let b = lwwmap_replica("b", &b);
        let c = lwwmap_replica("c", &c);
        prop_assert_eq!(a.join(&b), b.join(&a));
        prop_assert_eq!(a.join(&b).join(&c), a.join(&b.join(&c)));
        prop_assert_eq!(a.join(&a), a);
    }

    #[test]
    fn lwwmap_delta_round_trip(
        base in map_ops(),
        puts in prop::collection::vec(("[a-c]", 1i64..10), 1..6)
    ) {
        let before = lwwmap_replica("a", &base);
        let mut after = before.clone();
        for (key, value) in &puts {
            after.put(&node("b"), key.clone(), *value);
        }
        let delta = after.split_delta();
        prop_assert!(delta.is_some());
        let via_delta = before.merge_delta(&delta.unwrap());
        let via_state = before.join(&after);
        prop_assert_eq!(
            via_delta.entries().collect::<Vec<_>>(),
            via_state.entries().collect::<Vec<_>>()
        );
        prop_assert_eq!(
            via_state.entries().collect::<Vec<_>>(),
            after.entries().collect::<Vec<_>>()
        );
    }
}

// ============================================================================
// PNCounterMap Property Tests
// ============================================================================

proptest! {
    #[test]
    fn pncountermap_lattice_laws(a in map_ops(), b in map_ops(), c in map_ops()) {
        let a = pncountermap_replica("a", &a);
        let b = pncountermap_replica("b", &b);
        let c = pncountermap_replica("c", &c);
        prop_assert_eq!(a.join(&b), b.join(&a));
        prop_assert_eq!(a.join(&b).join(&c), a.join(&b.join(&c)));
        prop_assert_eq!(a.join(&a), a);
    }

    #[test]
    fn pncountermap_delta_round_trip(
        base in map_ops(),
        increments in prop::collection::vec(("[a-c]", -10i64..10), 1..6)
    ) {
        let before = pncountermap_replica("a", &base);
        let mut after = before.clone();
        for (key, amount) in &increments {
            after.increment(&node("b"), key.clone(), *amount).unwrap();
        }
        let delta = after.split_delta();
        prop_assert!(delta.is_some());
        let via_delta = before.merge_delta(&delta.unwrap());
        let via_state = before.join(&after);
        prop_assert_eq!(
            via_delta.entries().collect::<Vec<_>>(),
            via_state.entries().collect::<Vec<_>>()
        );
        prop_assert_eq!(
            via_state.entries().collect::<Vec<_>>(),
            after.entries().collect::<Vec<_>>()
        );
    }
}

// ============================================================================
// ORMultiMap Property Tests
// ============================================================================

proptest! {
    #[test]
    fn ormultimap_lattice_laws(a in multimap_ops(), b in multimap_ops(), c in multimap_ops()) {
        let a = ormultimap_replica("a", &a, false);
        let b = ormultimap_replica("b", &b, false);
        let c = ormultimap_replica("c", &c, false);
        prop_assert_eq!(a.join(&b), b.join(&a));
        prop_assert_eq!(a.join(&b).join(&c), a.join(&b.join(&c)));
        prop_assert_eq!(a.join(&a), a);
    }

    #[test]
    fn ormultimap_value_deltas_lattice_laws(
        a in multimap_ops(),
        b in multimap_ops(),
        c in multimap_ops()
    ) {
        let a = ormultimap_replica("a", &a, true);
        let b = ormultimap_replica("b", &b, true);
        let c = ormultimap_replica("c", &c, true);
        prop_assert_eq!(a.join(&b), b.join(&a));
        prop_assert_eq!(a.join(&a), a.clone());
        // retained values of removed keys may differ, live bindings may not
        prop_assert_eq!(
            multimap_entries(&a.join(&b).join(&c)),
            multimap_entries(&a.join(&b.join(&c)))
        );
    }

    #[test]
    fn ormultimap_delta_round_trip(
        base in multimap_ops(),
        adds in prop::collection::vec(("[a-c]", "[x-z]"), 1..6),
        value_deltas in any::<bool>()
    ) {
        let before = ormultimap_replica("a", &base, value_deltas);
        let mut after = before.clone();
        for (key, value) in &adds {
            after.add_binding(&node("b"), key.clone(), value.clone()).unwrap();
        }
        let delta = after.split_delta();
        prop_assert!(delta.is_some());
        let via_delta = before.merge_delta(&delta.unwrap());
        let via_state = before.join(&after);
        prop_assert_eq!(multimap_entries(&via_delta), multimap_entries(&via_state));
        prop_assert_eq!(multimap_entries(&via_state), multimap_entries(&after));
    }
}

proptest! {
    #[test]
    fn replicated_data_merge_matches_inner_join((a, b, _) in orset_replicas()) {
        let wrapped_a = ReplicatedData::ORSet(a.clone());
        let wrapped_b = ReplicatedData::ORSet(b.clone());
        let merged = wrapped_a.merge(&wrapped_b).unwrap();
        prop_assert_eq!(merged, ReplicatedData::ORSet(a.join(&b)));
    }
}

// ============================================================================
// VersionVector Property Tests
// ============================================================================

fn pointwise(a: &VersionVector, b: &VersionVector) -> VersionOrdering {
    let nodes: Vec<NodeId> = a.nodes().chain(b.nodes()).cloned().collect();
    let less = nodes.iter().any(|n| a.version_at(n) < b.version_at(n));
    let greater = nodes.iter().any(|n| a.version_at(n) > b.version_at(n));
    match (less, greater) {
        (false, false) => VersionOrdering::Same,
        (true, false) => VersionOrdering::Before,
        (false, true) => VersionOrdering::After,
        (true, true) => VersionOrdering::Concurrent,
    }
}

proptest! {
    #[test]
    fn version_vector_compare_is_pointwise(
        a in version_vector_strategy(),
        b in version_vector_strategy()
    ) {
        prop_assert_eq!(a.compare(&b), pointwise(&a, &b));
    }

    #[test]
    fn version_vector_merge_dominates_inputs(
        a in version_vector_strategy(),
        b in version_vector_strategy()
    ) {
        let merged = a.merge(&b);
        prop_assert!(matches!(merged.compare(&a), VersionOrdering::Same | VersionOrdering::After));
        prop_assert!(matches!(merged.compare(&b), VersionOrdering::Same | VersionOrdering::After));
        prop_assert_eq!(a.join(&b), b.join(&a));
    }
}
