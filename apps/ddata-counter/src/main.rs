//! # ddata-counter
//!
//! A CLI walkthrough of replicated counters. Each subcommand builds a small
//! cluster of replicators, performs updates with different consistency
//! levels and shows how every node converges.
//!
//! ```text
//! key "page_views"  →  PNCounter  (one increment/decrement slot per node)
//! total = Σ(inc across all nodes) − Σ(dec across all nodes)
//! ```
//!
//! All subcommands except `live` run on a deterministic simulated cluster,
//! so message delivery and time are explicit steps.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::*;
use ddata_core::{Key, NodeId, PNCounter};
use ddata_replicator::{
    spawn_replicator, GetResponse, MemberEvent, MemoryDurableStore, MemoryNetwork, ReadConsistency,
    Replicator, ReplicatorConfig, Response, SimulatedCluster, SystemClock, Tick, Transport,
    UpdateResponse, WriteConsistency,
};

// ─── CLI ───────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "ddata-counter")]
#[command(about = "Replicated CRDT counters on a simulated cluster")]
#[command(version)]
struct Cli {
    /// Number of nodes in the cluster
    #[arg(short, long, default_value_t = 3)]
    nodes: usize,

    /// Print the final envelope of every node as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Local increments on every node, spread by gossip
    Demo,
    /// Writes and reads at every consistency level
    Quorum,
    /// Partition a node, write around it, heal and converge
    Partition,
    /// Remove a node and prune its contribution from the counter
    Pruning,
    /// Real replicators on tokio talking over an in-memory network
    Live,
}

const KEY: &str = "page_views";
const TIMEOUT_MS: u64 = 3000;

fn key() -> Key<PNCounter> {
    Key::new(KEY)
}

// ─── Pretty printing ──────────────────────────────────────────────────────

fn header(text: &str) {
    let bar = "═".repeat(60);
    println!("\n{}", bar.bright_cyan());
    println!("  {}", text.bold().bright_white());
    println!("{}", bar.bright_cyan());
}

fn section(text: &str) {
    println!("\n{} {}", "▸".bright_yellow(), text.bold());
}

fn step(text: &str) {
    println!("  {} {}", "•".bright_green(), text);
}

fn show_node(cluster: &SimulatedCluster, node: &NodeId) {
    let border = "─".repeat(44);
    println!("  ┌{}┐", border);
    println!(
        "  │ {:^42} │",
        format!("Node: {}", node).bright_yellow().to_string()
    );
    println!("  ├{}┤", border);
    match cluster.local_typed(node, &key()) {
        Some(counter) => {
            let parts: Vec<String> = counter
                .increments()
                .state()
                .iter()
                .map(|(id, inc)| {
                    let dec = counter.decrements().value_at(id);
                    if dec > 0 {
                        format!("{}:+{}-{}", id, inc, dec)
                    } else {
                        format!("{}:+{}", id, inc)
                    }
                })
                .collect();
            let line = format!("{:<12} = {:>5}  ({})", KEY, counter.value(), parts.join(", "));
            println!("  │ {:<42} │", line);
        }
        None if cluster.local_envelope(node, KEY).is_some_and(|e| e.is_deleted()) => {
            println!("  │ {:^42} │", "(deleted)".dimmed().to_string());
        }
        None => println!("  │ {:^42} │", "(no value)".dimmed().to_string()),
    }
    println!("  └{}┘", border);
}

fn show_cluster(cluster: &SimulatedCluster) {
    for node in cluster.live_nodes() {
        show_node(cluster, &node);
    }
}

fn convergence_result(converged: bool) {
    if converged {
        println!(
            "\n  {} {}",
            "✓".bright_green().bold(),
            "ALL NODES CONVERGED".bright_green().bold()
        );
    } else {
        println!(
            "\n  {} {}",
            "✗".bright_red().bold(),
            "DIVERGENCE DETECTED".bright_red().bold()
        );
    }
}

fn describe(response: Option<&Response>) -> ColoredString {
    match response {
        Some(Response::Update(UpdateResponse::Success { .. })) => "Success".bright_green(),
        Some(Response::Update(UpdateResponse::Timeout { .. })) => "Timeout".bright_red(),
        Some(Response::Update(other)) => format!("{:?}", other).bright_red(),
        Some(Response::Get(GetResponse::Success { data, .. })) => match key().get(data) {
            Ok(counter) => format!("Success ({})", counter.value()).bright_green(),
            Err(err) => err.to_string().bright_red(),
        },
        Some(Response::Get(other)) => format!("{:?}", other).bright_red(),
        Some(other) => format!("{:?}", other).normal(),
        None => "pending".yellow(),
    }
}

fn print_json(cluster: &SimulatedCluster) {
    section("Envelopes (JSON)");
    for node in cluster.live_nodes() {
        let json = match cluster.local_envelope(&node, KEY) {
            Some(envelope) => serde_json::to_string_pretty(envelope)
                .unwrap_or_else(|err| format!("\"serialization failed: {}\"", err)),
            None => "null".to_string(),
        };
        println!("{} {}", format!("{}:", node).bright_magenta(), json);
    }
}

fn increment(
    cluster: &mut SimulatedCluster,
    node: &NodeId,
    amount: i64,
    consistency: WriteConsistency,
) -> ddata_replicator::RequestId {
    cluster.update(node, &key(), PNCounter::new(), consistency, move |c, n| {
        c.increment(n, amount)
    })
}

// ─── Demo ──────────────────────────────────────────────────────────────────

fn run_demo(cluster: &mut SimulatedCluster) {
    header("DEMO — Local Updates & Gossip");

    section("Phase 1: Every node increments locally");
    for (i, node) in cluster.node_ids().into_iter().enumerate() {
        let amount = (i as i64 + 1) * 5;
        increment(cluster, &node, amount, WriteConsistency::Local);
        step(&format!("{}: {} += {}", node, KEY, amount));
    }
    let first = cluster.node(0);
    cluster.update(&first, &key(), PNCounter::new(), WriteConsistency::Local, |c, n| {
        c.decrement(n, 2)
    });
    step(&format!("{}: {} -= 2", first, KEY));
    show_cluster(cluster);

    section("Phase 2: Gossip rounds");
    let mut rounds = 0;
    while !cluster.converged(KEY) && rounds < 50 {
        cluster.gossip_round();
        rounds += 1;
    }
    step(&format!(
        "{} rounds, {} messages delivered",
        rounds,
        cluster.delivered_count()
    ));
    show_cluster(cluster);
    convergence_result(cluster.converged(KEY));
}

// ─── Quorum ────────────────────────────────────────────────────────────────

fn run_quorum(cluster: &mut SimulatedCluster) {
    header("QUORUM — Consistency Levels");
    let nodes = cluster.node_ids();
    let first = cluster.node(0);

    let levels = [
        ("Local", WriteConsistency::Local),
        ("To(2)", WriteConsistency::to(2, TIMEOUT_MS)),
        ("Majority", WriteConsistency::majority(TIMEOUT_MS)),
        ("All", WriteConsistency::all(TIMEOUT_MS)),
    ];
    section("Writes from the first node");
    for (name, level) in levels {
        let request = increment(cluster, &first, 1, level);
        let in_flight = cluster.in_flight_count();
        cluster.deliver_all();
        // secondaries are contacted at timeout / 5
        if cluster.response(&request).is_none() {
            cluster.advance(TIMEOUT_MS / 5);
            cluster.deliver_all();
        }
        step(&format!(
            "{:<9} → {} ({} messages sent)",
            name,
            describe(cluster.response(&request)),
            in_flight
        ));
    }
    show_cluster(cluster);

    section("Reads from the last node");
    let last = nodes.last().cloned().unwrap_or_else(|| first.clone());
    let reads = [
        ("Local", ReadConsistency::Local),
        ("From(2)", ReadConsistency::from(2, TIMEOUT_MS)),
        ("Majority", ReadConsistency::majority(TIMEOUT_MS)),
        ("All", ReadConsistency::all(TIMEOUT_MS)),
    ];
    for (name, level) in reads {
        let request = cluster.get(&last, &key(), level);
        cluster.deliver_all();
        if cluster.response(&request).is_none() {
            cluster.advance(TIMEOUT_MS / 5);
            cluster.deliver_all();
        }
        step(&format!("{:<9} → {}", name, describe(cluster.response(&request))));
    }
    show_cluster(cluster);
}

// ─── Partition ─────────────────────────────────────────────────────────────

fn run_partition(cluster: &mut SimulatedCluster) {
    header("PARTITION — Split, Write, Heal");
    let first = cluster.node(0);
    let Some(cut) = cluster.node_ids().last().cloned() else {
        return;
    };

    section(&format!("Phase 1: {} is isolated", cut));
    cluster.isolate(&cut);

    let request = increment(cluster, &first, 10, WriteConsistency::majority(TIMEOUT_MS));
    cluster.deliver_all();
    cluster.advance(TIMEOUT_MS / 5);
    cluster.deliver_all();
    step(&format!("{}: majority write → {}", first, describe(cluster.response(&request))));

    let request = increment(cluster, &first, 1, WriteConsistency::all(TIMEOUT_MS));
    cluster.deliver_all();
    cluster.advance(TIMEOUT_MS);
    step(&format!("{}: write to all → {}", first, describe(cluster.response(&request))));

    increment(cluster, &cut, 7, WriteConsistency::Local);
    step(&format!("{}: local write += 7", cut));
    show_cluster(cluster);

    section("Phase 2: Heal and gossip");
    cluster.heal_all();
    let converged = cluster.gossip_until_converged(KEY, 50);
    step(&format!("dropped while partitioned: {}", cluster.dropped_count()));
    show_cluster(cluster);
    convergence_result(converged);
}

// ─── Pruning ───────────────────────────────────────────────────────────────

fn run_pruning(cluster: &mut SimulatedCluster) {
    header("PRUNING — Collapsing a Removed Node");
    let Some(leaving) = cluster.node_ids().last().cloned() else {
        return;
    };

    section("Phase 1: Every node writes to all");
    for node in cluster.node_ids() {
        increment(cluster, &node, 3, WriteConsistency::all(TIMEOUT_MS));
        cluster.deliver_all();
    }
    show_cluster(cluster);

    section(&format!("Phase 2: {} leaves the cluster", leaving));
    cluster.remove_node(&leaving);
    let dissemination = cluster
        .replicator(&cluster.node(0))
        .map_or(0, |r| r.config().max_pruning_dissemination_ms);
    cluster.advance(dissemination + 1);

    let mut ticks = 0;
    while ticks < 20 {
        cluster.tick_all(Tick::RemovedNodePruning);
        cluster.gossip_round();
        ticks += 1;
        let pruned = cluster
            .live_nodes()
            .iter()
            .all(|n| cluster.local_envelope(n, KEY).is_some_and(|e| !e.need_pruning_from(&leaving)));
        if pruned && cluster.converged(KEY) {
            break;
        }
    }
    step(&format!("{} pruning/gossip rounds", ticks));
    show_cluster(cluster);
    convergence_result(cluster.converged(KEY));
}

// ─── Live ──────────────────────────────────────────────────────────────────

async fn run_live(n: usize) {
    header("LIVE — Replicators on tokio");
    let network = MemoryNetwork::new();
    let config = ReplicatorConfig::builder()
        .gossip_interval(100)
        .delta_propagation_interval(50)
        .build();

    let mut handles = Vec::new();
    let mut tasks = Vec::new();
    for i in 0..n.max(1) {
        let node = NodeId::new(format!("node-{}", i));
        let transport: Arc<dyn Transport> = Arc::new(network.join(node.clone()));
        let replicator = Replicator::new(node, config.clone(), Arc::new(SystemClock));
        let (handle, task) =
            spawn_replicator(replicator, transport, Arc::new(MemoryDurableStore::new()));
        handles.push(handle);
        tasks.push(task);
    }
    for handle in &handles {
        for other in &handles {
            if handle.self_node() != other.self_node() {
                let _ = handle.member_event(MemberEvent::Up(other.self_node().clone()));
            }
        }
    }

    section("Local increments on every node");
    for (i, handle) in handles.iter().enumerate() {
        let amount = i as i64 + 1;
        match handle
            .update(&key(), PNCounter::new(), WriteConsistency::Local, move |c, n| {
                c.increment(n, amount)
            })
            .await
        {
            Ok(response) => step(&format!("{}: += {} → {:?}", handle.self_node(), amount, response)),
            Err(err) => step(&format!("{}: {}", handle.self_node(), err.to_string().bright_red())),
        }
    }

    section("Waiting for deltas and gossip");
    tokio::time::sleep(Duration::from_millis(500)).await;
    for handle in &handles {
        let value = match handle.get(&key(), ReadConsistency::Local).await {
            Ok(response) => response
                .get(&key())
                .map(|c| c.value().to_string())
                .unwrap_or_else(|| "(none)".to_string()),
            Err(err) => err.to_string(),
        };
        step(&format!("{}: {} = {}", handle.self_node(), KEY, value));
    }

    for handle in &handles {
        handle.shutdown();
    }
    for task in tasks {
        let _ = task.await;
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    if let Commands::Live = cli.command {
        run_live(cli.nodes).await;
        return;
    }

    let mut cluster = SimulatedCluster::new(cli.nodes.max(1));
    match cli.command {
        Commands::Demo => run_demo(&mut cluster),
        Commands::Quorum => run_quorum(&mut cluster),
        Commands::Partition => run_partition(&mut cluster),
        Commands::Pruning => run_pruning(&mut cluster),
        Commands::Live => {}
    }
    if cli.json {
        print_json(&cluster);
    }
}
