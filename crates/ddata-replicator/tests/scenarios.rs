//! End-to-end replication scenarios on a simulated cluster
//!
//! Every test drives real replicators through `SimulatedCluster`: messages
//! are delivered explicitly, time only moves when advanced, and partitions
//! drop traffic at delivery.

use ddata_core::data::{Key, ReplicatedData};
use ddata_core::gcounter::GCounter;
use ddata_core::lattice::DeltaCrdt;
use ddata_core::node::NodeId;
use ddata_core::orset::ORSet;
use ddata_replicator::{
    Change, Command, DataEnvelope, DeleteResponse, GetResponse, NetworkConfig, PeerMessage,
    PruningState, ReadConsistency, ReplicatorConfig, RequestId, Response, SimulatedCluster, Tick,
    UpdateResponse, WriteConsistency,
};
use std::collections::BTreeMap;

const TIMEOUT: u64 = 3000;

fn counter_key() -> Key<GCounter> {
    Key::new("counter")
}

fn set_key() -> Key<ORSet<String>> {
    Key::new("set")
}

fn increment(
    cluster: &mut SimulatedCluster,
    node: &NodeId,
    amount: i64,
    consistency: WriteConsistency,
) -> RequestId {
    cluster.update(node, &counter_key(), GCounter::new(), consistency, move |c, n| {
        c.increment(n, amount)
    })
}

fn add_element(
    cluster: &mut SimulatedCluster,
    node: &NodeId,
    element: &str,
    consistency: WriteConsistency,
) -> RequestId {
    let element = element.to_string();
    cluster.update(node, &set_key(), ORSet::new(), consistency, move |s, n| {
        s.add(n, element);
        Ok(())
    })
}

fn counter_value(cluster: &SimulatedCluster, node: &NodeId) -> Option<u64> {
    cluster.local_typed(node, &counter_key()).map(|c| c.value())
}

fn update_response(cluster: &SimulatedCluster, request: &RequestId) -> UpdateResponse {
    match cluster.response(request) {
        Some(Response::Update(response)) => response.clone(),
        other => panic!("expected an update response, got {:?}", other),
    }
}

fn get_response(cluster: &SimulatedCluster, request: &RequestId) -> GetResponse {
    match cluster.response(request) {
        Some(Response::Get(response)) => response.clone(),
        other => panic!("expected a get response, got {:?}", other),
    }
}

fn delete_response(cluster: &SimulatedCluster, request: &RequestId) -> DeleteResponse {
    match cluster.response(request) {
        Some(Response::Delete(response)) => response.clone(),
        other => panic!("expected a delete response, got {:?}", other),
    }
}

fn stale_counter(node: &NodeId, amount: i64) -> DataEnvelope {
    let mut counter = GCounter::new();
    counter.increment(node, amount).unwrap();
    counter.reset_delta();
    DataEnvelope::new(ReplicatedData::GCounter(counter))
}

// ============================================================================
// Basic scenarios
// ============================================================================

#[test]
fn test_single_node_local_counter() {
    let mut cluster = SimulatedCluster::new(1);
    let a = cluster.node(0);
    for _ in 0..3 {
        let request = increment(&mut cluster, &a, 3, WriteConsistency::Local);
        assert!(matches!(
            update_response(&cluster, &request),
            UpdateResponse::Success { .. }
        ));
    }

    let request = cluster.get(&a, &counter_key(), ReadConsistency::Local);
    let response = get_response(&cluster, &request);
    assert_eq!(response.get(&counter_key()).map(|c| c.value()), Some(9));
}

#[test]
fn test_two_nodes_write_to_read_from() {
    let mut cluster = SimulatedCluster::new(2);
    let (a, b) = (cluster.node(0), cluster.node(1));

    let first = increment(&mut cluster, &a, 1, WriteConsistency::to(2, TIMEOUT));
    cluster.deliver_all();
    let second = increment(&mut cluster, &b, 1, WriteConsistency::to(2, TIMEOUT));
    cluster.deliver_all();
    assert!(matches!(update_response(&cluster, &first), UpdateResponse::Success { .. }));
    assert!(matches!(update_response(&cluster, &second), UpdateResponse::Success { .. }));

    for node in [&a, &b] {
        let request = cluster.get(node, &counter_key(), ReadConsistency::from(2, TIMEOUT));
        cluster.deliver_all();
        let response = get_response(&cluster, &request);
        assert_eq!(response.get(&counter_key()).map(|c| c.value()), Some(2));
    }
}

#[test]
fn test_delete_is_permanent() {
    let mut cluster = SimulatedCluster::new(2);
    let (a, b) = (cluster.node(0), cluster.node(1));
    increment(&mut cluster, &a, 5, WriteConsistency::all(TIMEOUT));
    cluster.deliver_all();

    let request = cluster.delete(&a, &counter_key(), WriteConsistency::all(TIMEOUT));
    cluster.deliver_all();
    assert!(matches!(delete_response(&cluster, &request), DeleteResponse::Success { .. }));

    let request = cluster.get(&b, &counter_key(), ReadConsistency::Local);
    assert!(matches!(get_response(&cluster, &request), GetResponse::DataDeleted { .. }));

    let request = increment(&mut cluster, &b, 1, WriteConsistency::Local);
    assert!(matches!(update_response(&cluster, &request), UpdateResponse::DataDeleted { .. }));

    // recreating under the same id is refused
    let request = increment(&mut cluster, &a, 1, WriteConsistency::all(TIMEOUT));
    cluster.deliver_all();
    assert!(matches!(update_response(&cluster, &request), UpdateResponse::DataDeleted { .. }));

    let request = cluster.delete(&b, &counter_key(), WriteConsistency::Local);
    assert!(matches!(delete_response(&cluster, &request), DeleteResponse::DataDeleted { .. }));

    // stale data does not resurrect the key
    let gossip = PeerMessage::Gossip {
        updated: [("counter".to_string(), stale_counter(&b, 9))].into_iter().collect(),
        send_back: false,
    };
    cluster.inject(&b, &a, gossip);
    cluster.deliver_all();
    assert!(cluster.local_envelope(&a, "counter").unwrap().is_deleted());
    assert!(cluster.replicator(&a).unwrap().key_ids().is_empty());
}

#[test]
fn test_replica_count_tracks_membership() {
    let mut cluster = SimulatedCluster::new(3);
    let a = cluster.node(0);
    let request = RequestId::new();
    cluster.submit(&a, Command::GetReplicaCount { request });
    assert_eq!(cluster.response(&request), Some(&Response::ReplicaCount(3)));

    cluster.remove_node(&cluster.node(2));
    let request = RequestId::new();
    cluster.submit(&a, Command::GetReplicaCount { request });
    assert_eq!(cluster.response(&request), Some(&Response::ReplicaCount(2)));
    assert_eq!(cluster.live_nodes().len(), 2);
}

#[test]
fn test_panicking_update_is_a_modify_failure() {
    let mut cluster = SimulatedCluster::new(2);
    let a = cluster.node(0);
    let request = cluster.update(&a, &counter_key(), GCounter::new(), WriteConsistency::all(TIMEOUT), |_, _| {
        panic!("bad update")
    });
    cluster.deliver_all();
    match update_response(&cluster, &request) {
        UpdateResponse::ModifyFailure { error, .. } => assert!(error.contains("bad update")),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(cluster.in_flight_count(), 0);
    assert!(cluster.local_envelope(&a, "counter").is_none());
}

// ============================================================================
// Quorums
// ============================================================================

#[test]
fn test_write_majority_survives_partitioned_minority() {
    let mut cluster = SimulatedCluster::new(5);
    let a = cluster.node(0);
    cluster.partition(&a, &cluster.node(3));
    cluster.partition(&a, &cluster.node(4));

    let request = increment(&mut cluster, &a, 1, WriteConsistency::majority(TIMEOUT));
    cluster.deliver_all();
    // primaries may have been the unreachable pair; secondaries follow
    cluster.advance(TIMEOUT / 5);
    cluster.deliver_all();

    assert!(matches!(update_response(&cluster, &request), UpdateResponse::Success { .. }));
    assert_eq!(counter_value(&cluster, &cluster.node(3)), None);
    assert_eq!(counter_value(&cluster, &cluster.node(4)), None);
}

#[test]
fn test_write_all_times_out_on_partition() {
    let mut cluster = SimulatedCluster::new(3);
    let (a, b, c) = (cluster.node(0), cluster.node(1), cluster.node(2));
    cluster.partition(&a, &c);

    let request = increment(&mut cluster, &a, 1, WriteConsistency::all(TIMEOUT));
    cluster.deliver_all();
    assert!(cluster.response(&request).is_none());
    let pending = |cluster: &SimulatedCluster| cluster.replicator(&a).map(|r| r.pending_aggregators());
    assert_eq!(pending(&cluster), Some(1));

    cluster.advance(TIMEOUT);
    cluster.deliver_all();
    assert!(matches!(update_response(&cluster, &request), UpdateResponse::Timeout { .. }));
    assert_eq!(pending(&cluster), Some(0));

    // the write still happened where it could
    assert_eq!(counter_value(&cluster, &a), Some(1));
    assert_eq!(counter_value(&cluster, &b), Some(1));
    assert_eq!(counter_value(&cluster, &c), None);
}

#[test]
fn test_read_majority_consults_peer() {
    let mut cluster = SimulatedCluster::new(2);
    let (a, b) = (cluster.node(0), cluster.node(1));
    increment(&mut cluster, &b, 4, WriteConsistency::Local);

    let request = cluster.get(&a, &counter_key(), ReadConsistency::Local);
    assert!(matches!(get_response(&cluster, &request), GetResponse::NotFound { .. }));

    let request = cluster.get(&a, &counter_key(), ReadConsistency::majority(TIMEOUT));
    cluster.deliver_all();
    let response = get_response(&cluster, &request);
    assert_eq!(response.get(&counter_key()).map(|c| c.value()), Some(4));
    assert_eq!(counter_value(&cluster, &a), Some(4));
}

#[test]
fn test_read_all_merges_and_repairs() {
    let mut cluster = SimulatedCluster::new(3);
    let (a, b, c) = (cluster.node(0), cluster.node(1), cluster.node(2));
    increment(&mut cluster, &a, 2, WriteConsistency::Local);
    increment(&mut cluster, &b, 3, WriteConsistency::Local);

    let request = cluster.get(&b, &counter_key(), ReadConsistency::all(TIMEOUT));
    cluster.deliver_all();
    let response = get_response(&cluster, &request);
    assert_eq!(response.get(&counter_key()).map(|c| c.value()), Some(5));

    // every replica that answered with older data was repaired
    assert_eq!(counter_value(&cluster, &b), Some(5));
    assert_eq!(counter_value(&cluster, &a), Some(5));
    assert_eq!(counter_value(&cluster, &c), Some(5));
}

#[test]
fn test_read_times_out_without_replies() {
    let mut cluster = SimulatedCluster::new(3);
    let a = cluster.node(0);
    cluster.isolate(&a);
    let request = cluster.get(&a, &counter_key(), ReadConsistency::all(TIMEOUT));
    cluster.deliver_all();
    cluster.advance(TIMEOUT);
    assert!(matches!(get_response(&cluster, &request), GetResponse::Failure { .. }));
}

// ============================================================================
// Gossip and deltas
// ============================================================================

#[test]
fn test_gossip_converges_local_writes() {
    let mut cluster = SimulatedCluster::new(4);
    for i in 0..4 {
        let node = cluster.node(i);
        increment(&mut cluster, &node, i as i64 + 1, WriteConsistency::Local);
    }
    assert!(cluster.gossip_until_converged("counter", 30));
    for node in cluster.node_ids() {
        assert_eq!(counter_value(&cluster, &node), Some(10));
    }
}

#[test]
fn test_gossip_converges_over_lossy_network() {
    let mut cluster = SimulatedCluster::new(3);
    cluster.set_network(NetworkConfig::lossy(0.3));
    for i in 0..3 {
        let node = cluster.node(i);
        increment(&mut cluster, &node, 1, WriteConsistency::Local);
    }
    assert!(cluster.gossip_until_converged("counter", 100));
    assert_eq!(counter_value(&cluster, &cluster.node(0)), Some(3));
}

#[test]
fn test_causal_deltas_propagate() {
    let mut cluster = SimulatedCluster::new(3);
    let (a, b, c) = (cluster.node(0), cluster.node(1), cluster.node(2));
    for element in ["x", "y", "z"] {
        add_element(&mut cluster, &a, element, WriteConsistency::Local);
    }
    cluster.propagate_deltas();

    for node in [&b, &c] {
        let set = cluster.local_typed(node, &set_key()).unwrap();
        assert_eq!(set.len(), 3);
        let versions = &cluster.local_envelope(node, "set").unwrap().delta_versions;
        assert_eq!(versions.version_at(&a), 3);
    }

    add_element(&mut cluster, &b, "w", WriteConsistency::Local);
    cluster.propagate_deltas();
    for node in [&a, &c] {
        assert!(cluster.local_typed(node, &set_key()).unwrap().contains(&"w".to_string()));
    }
    assert!(cluster.converged("set"));
}

#[test]
fn test_missed_delta_falls_back_to_full_state() {
    let mut cluster = SimulatedCluster::new(3);
    let (a, b) = (cluster.node(0), cluster.node(1));
    // never propagated: every peer misses delta 1
    add_element(&mut cluster, &a, "x", WriteConsistency::Local);

    let request = add_element(&mut cluster, &a, "y", WriteConsistency::all(TIMEOUT));
    cluster.deliver_all();
    assert!(matches!(update_response(&cluster, &request), UpdateResponse::Success { .. }));

    let set = cluster.local_typed(&b, &set_key()).unwrap();
    assert!(set.contains(&"x".to_string()));
    assert!(set.contains(&"y".to_string()));

    // the buffered deltas are now redundant and skipped
    cluster.propagate_deltas();
    assert_eq!(cluster.local_typed(&b, &set_key()).unwrap().len(), 2);
}

#[test]
fn test_partitioned_delta_recovered_by_gossip() {
    let mut cluster = SimulatedCluster::new(2);
    let (a, b) = (cluster.node(0), cluster.node(1));
    cluster.partition(&a, &b);
    add_element(&mut cluster, &a, "x", WriteConsistency::Local);
    cluster.propagate_deltas();
    assert!(cluster.local_envelope(&b, "set").is_none());

    cluster.heal(&a, &b);
    add_element(&mut cluster, &a, "y", WriteConsistency::Local);
    cluster.propagate_deltas();
    // delta 2 arrives without delta 1 and is rejected
    assert!(cluster.local_envelope(&b, "set").is_none());

    assert!(cluster.gossip_until_converged("set", 5));
    assert_eq!(cluster.local_typed(&b, &set_key()).unwrap().len(), 2);
}

// ============================================================================
// Subscriptions
// ============================================================================

#[test]
fn test_subscriber_sees_remote_changes() {
    let mut cluster = SimulatedCluster::new(2);
    let (a, b) = (cluster.node(0), cluster.node(1));
    let subscriber = cluster.subscribe(&b, &counter_key());
    cluster.flush_changes();
    assert!(cluster.take_notifications(&b).is_empty());

    increment(&mut cluster, &a, 2, WriteConsistency::all(TIMEOUT));
    cluster.deliver_all();
    cluster.flush_changes();
    let notifications = cluster.take_notifications(&b);
    assert_eq!(notifications.len(), 1);
    match &notifications[0] {
        (id, Change::Changed { data: ReplicatedData::GCounter(counter), .. }) => {
            assert_eq!(*id, subscriber);
            assert_eq!(counter.value(), 2);
        }
        other => panic!("unexpected {:?}", other),
    }

    cluster.delete(&a, &counter_key(), WriteConsistency::all(TIMEOUT));
    cluster.deliver_all();
    cluster.flush_changes();
    let notifications = cluster.take_notifications(&b);
    assert!(matches!(notifications[..], [(_, Change::Deleted { .. })]));
}

// ============================================================================
// Durable keys
// ============================================================================

fn durable_config() -> ReplicatorConfig {
    ReplicatorConfig::builder().durable_key("durable-*").build()
}

#[test]
fn test_durable_keys_survive_restart() {
    let mut cluster = SimulatedCluster::with_config(1, durable_config());
    let a = cluster.node(0);
    let durable = Key::<GCounter>::new("durable-counter");

    let request = cluster.update(&a, &durable, GCounter::new(), WriteConsistency::Local, |c, n| {
        c.increment(n, 3)
    });
    assert!(matches!(update_response(&cluster, &request), UpdateResponse::Success { .. }));
    increment(&mut cluster, &a, 1, WriteConsistency::Local);

    let stored = cluster.durable_entry(&a, "durable-counter").unwrap();
    assert!(stored.delta_versions.is_empty());
    assert!(cluster.durable_entry(&a, "counter").is_none());

    cluster.restart(&a);
    assert_eq!(cluster.local_typed(&a, &durable).map(|c| c.value()), Some(3));
    assert_eq!(counter_value(&cluster, &a), None);
}

#[test]
fn test_restart_loads_more_keys_than_one_batch() {
    let mut cluster = SimulatedCluster::with_config(1, durable_config());
    let a = cluster.node(0);
    for i in 0..250 {
        let key = Key::<GCounter>::new(format!("durable-{:03}", i));
        cluster.update(&a, &key, GCounter::new(), WriteConsistency::Local, |c, n| c.increment(n, 1));
    }

    cluster.restart(&a);
    let loaded = cluster.replicator(&a).map(|r| r.key_ids().len());
    assert_eq!(loaded, Some(250));
    let last = Key::<GCounter>::new("durable-249");
    assert_eq!(cluster.local_typed(&a, &last).map(|c| c.value()), Some(1));
}

#[test]
fn test_durable_store_failure_is_reported() {
    let mut cluster = SimulatedCluster::with_config(1, durable_config());
    let a = cluster.node(0);
    cluster.set_store_failure(&a, true);
    let durable = Key::<GCounter>::new("durable-counter");

    let request = cluster.update(&a, &durable, GCounter::new(), WriteConsistency::Local, |c, n| {
        c.increment(n, 1)
    });
    assert!(matches!(update_response(&cluster, &request), UpdateResponse::StoreFailure { .. }));

    let request = cluster.delete(&a, &durable, WriteConsistency::Local);
    assert!(matches!(delete_response(&cluster, &request), DeleteResponse::StoreFailure { .. }));
}

#[test]
fn test_replicated_writes_to_durable_keys_are_stored() {
    let mut cluster = SimulatedCluster::with_config(2, durable_config());
    let (a, b) = (cluster.node(0), cluster.node(1));
    let durable = Key::<GCounter>::new("durable-counter");

    let request = cluster.update(&a, &durable, GCounter::new(), WriteConsistency::all(TIMEOUT), |c, n| {
        c.increment(n, 2)
    });
    cluster.deliver_all();
    assert!(matches!(update_response(&cluster, &request), UpdateResponse::Success { .. }));
    assert!(cluster.durable_entry(&a, "durable-counter").is_some());
    assert!(cluster.durable_entry(&b, "durable-counter").is_some());
}

// ============================================================================
// Removed nodes and pruning
// ============================================================================

fn pruning_cluster() -> SimulatedCluster {
    let config = ReplicatorConfig::builder()
        .max_pruning_dissemination(1000)
        .build();
    SimulatedCluster::with_config(3, config)
}

fn gossip_rounds(cluster: &mut SimulatedCluster, rounds: usize) {
    for _ in 0..rounds {
        cluster.gossip_round();
    }
}

#[test]
fn test_pruning_removed_node() {
    let mut cluster = pruning_cluster();
    let (a, b, c) = (cluster.node(0), cluster.node(1), cluster.node(2));
    let request = increment(&mut cluster, &c, 5, WriteConsistency::all(TIMEOUT));
    cluster.deliver_all();
    assert!(matches!(update_response(&cluster, &request), UpdateResponse::Success { .. }));

    cluster.remove_node(&c);
    cluster.advance(2000);

    // the lowest node initializes pruning
    cluster.tick_all(Tick::RemovedNodePruning);
    let envelope = cluster.local_envelope(&a, "counter").unwrap();
    assert!(matches!(
        envelope.pruning.get(&c),
        Some(PruningState::Initialized { owner, .. }) if *owner == a
    ));

    // once every member has seen the marker, the owner prunes
    gossip_rounds(&mut cluster, 3);
    cluster.tick_all(Tick::RemovedNodePruning);
    let envelope = cluster.local_envelope(&a, "counter").unwrap();
    assert!(matches!(envelope.pruning.get(&c), Some(PruningState::Performed { .. })));
    assert!(!envelope.need_pruning_from(&c));
    assert_eq!(counter_value(&cluster, &a), Some(5));

    gossip_rounds(&mut cluster, 3);
    let envelope = cluster.local_envelope(&b, "counter").unwrap();
    assert!(!envelope.need_pruning_from(&c));
    assert_eq!(counter_value(&cluster, &b), Some(5));

    // stale data from the removed node is cleaned on merge
    let stale = PeerMessage::Write {
        key: "counter".to_string(),
        envelope: stale_counter(&c, 7),
        request: None,
    };
    cluster.inject(&b, &a, stale);
    cluster.deliver_all();
    assert_eq!(counter_value(&cluster, &a), Some(5));
    assert!(!cluster.local_envelope(&a, "counter").unwrap().need_pruning_from(&c));
}

#[test]
fn test_pruning_waits_while_a_member_is_unreachable() {
    let mut cluster = pruning_cluster();
    let (a, b, c) = (cluster.node(0), cluster.node(1), cluster.node(2));
    increment(&mut cluster, &c, 5, WriteConsistency::all(TIMEOUT));
    cluster.deliver_all();
    cluster.remove_node(&c);

    cluster.mark_unreachable(&b);
    cluster.advance(2000);
    cluster.tick_all(Tick::RemovedNodePruning);
    assert!(cluster.local_envelope(&a, "counter").unwrap().pruning.is_empty());

    // time spent with an unreachable member does not count
    cluster.mark_reachable(&b);
    cluster.tick_all(Tick::RemovedNodePruning);
    assert!(cluster.local_envelope(&a, "counter").unwrap().pruning.is_empty());

    cluster.advance(2000);
    cluster.tick_all(Tick::RemovedNodePruning);
    assert!(cluster.local_envelope(&a, "counter").unwrap().pruning.contains_key(&c));
}

#[test]
fn test_obsolete_pruning_marker_is_removed() {
    let config = ReplicatorConfig::builder()
        .max_pruning_dissemination(1000)
        .pruning_marker_time_to_live(5000)
        .build();
    let mut cluster = SimulatedCluster::with_config(2, config);
    let (a, b) = (cluster.node(0), cluster.node(1));
    increment(&mut cluster, &b, 1, WriteConsistency::all(TIMEOUT));
    cluster.deliver_all();
    cluster.remove_node(&b);

    cluster.advance(2000);
    // no other members: the marker is seen by everyone at once
    cluster.tick_all(Tick::RemovedNodePruning);
    let envelope = cluster.local_envelope(&a, "counter").unwrap();
    assert!(matches!(envelope.pruning.get(&b), Some(PruningState::Performed { .. })));
    assert_eq!(counter_value(&cluster, &a), Some(1));

    cluster.advance(6000);
    cluster.tick_all(Tick::RemovedNodePruning);
    assert!(cluster.local_envelope(&a, "counter").unwrap().pruning.is_empty());
    assert_eq!(cluster.replicator(&a).unwrap().removed_nodes().count(), 0);
    assert_eq!(counter_value(&cluster, &a), Some(1));
}

#[test]
fn test_messages_from_removed_node_are_ignored() {
    let mut cluster = SimulatedCluster::new(3);
    let (a, c) = (cluster.node(0), cluster.node(2));
    cluster.remove_node(&c);

    let updated: BTreeMap<String, DataEnvelope> =
        [("ghost".to_string(), stale_counter(&c, 1))].into_iter().collect();
    cluster.inject(&c, &a, PeerMessage::Gossip { updated, send_back: true });
    cluster.deliver_all();
    assert!(cluster.local_envelope(&a, "ghost").is_none());
    assert_eq!(cluster.in_flight_count(), 0);
}
