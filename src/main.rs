//! WolfHA - Domain Leader Election and Push Replication
//!
//! Command line tool for checking node configuration and running an
//! in-process domain simulation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfha::config::{LoggingConfig, WolfHaConfig};
use wolfha::ha::HaSync;
use wolfha::network::{LocalLinkFactory, LocalNetwork};
use wolfha::replication::{MemorySink, ReplicationCoordinator, SnapshotContent, SyncReceiver};
use wolfha::state::{DomainElection, DomainMembership, DomainNode, ElectionConfig, NodeId};

/// WolfHA - Domain Leader Election and Push Replication
#[derive(Parser)]
#[command(name = "wolfha")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfha.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [logging] level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log format (pretty, json); overrides [logging] format
    #[arg(long)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfha.toml")]
        output: PathBuf,

        /// Node ID (1-65535)
        #[arg(long, default_value_t = 1)]
        node_id: NodeId,

        /// Domain ID
        #[arg(long, default_value_t = 1)]
        domain_id: u16,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,

    /// Run an in-process domain and replicate a snapshot from its leader
    Simulate {
        /// Number of nodes in the domain
        #[arg(short, long, default_value_t = 3)]
        nodes: u16,

        /// Node that may never become leader (repeatable)
        #[arg(long)]
        ineligible: Vec<NodeId>,

        /// After the first election, force a rigged election on this node
        #[arg(long)]
        rig: Option<NodeId>,

        /// Election phase timeout in milliseconds
        #[arg(long, default_value_t = 200)]
        phase_timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that read the config file log the way it asks, unless overridden
    let logging = match cli.command {
        Commands::Validate | Commands::Info => WolfHaConfig::from_file(&cli.config)
            .map(|config| config.logging)
            .unwrap_or_default(),
        _ => LoggingConfig::default(),
    }
    .with_overrides(cli.log_level.clone(), cli.log_format.clone());
    init_logging(&logging);

    match cli.command {
        Commands::Init {
            output,
            node_id,
            domain_id,
        } => run_init(output, node_id, domain_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Simulate {
            nodes,
            ineligible,
            rig,
            phase_timeout_ms,
        } => run_simulate(nodes, ineligible, rig, phase_timeout_ms).await,
    }
}

/// Initialize logging
fn init_logging(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.as_str().into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: NodeId, domain_id: u16) -> anyhow::Result<()> {
    let config_content = format!(
        r#"# WolfHA Configuration
# Generated configuration file

[node]
id = {node_id}
domain_id = {domain_id}
host = "127.0.0.1"
port = 6642
leader_eligible = true

# Every member of the domain, including this node
[[cluster.nodes]]
id = {node_id}
domain_id = {domain_id}
host = "127.0.0.1"
port = 6642

# [[cluster.nodes]]
# id = 2
# domain_id = {domain_id}
# host = "10.0.0.2"
# port = 6642

[election]
phase_timeout_ms = 1000

[replication]
quiescence_ms = 250
update_timeout_ms = 2000
max_backoff_ms = 10000
max_poll_interval_ms = 2000
initial_backoff_min_ms = 100
initial_backoff_max_ms = 300

[logging]
level = "info"
format = "pretty"
"#
    );

    // Never write a file we would not accept
    WolfHaConfig::from_str(&config_content)?;

    std::fs::write(&output, config_content)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("\nAdd the other domain members under [[cluster.nodes]].");
    println!("Then check it with: wolfha --config {} validate", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match WolfHaConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node:           {}", config.node);
            println!("  Leader Eligible: {}", config.node.leader_eligible);
            println!("  Domain Peers:   {}", config.peers().count());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> anyhow::Result<()> {
    let config = WolfHaConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let membership = config.membership()?;

    println!("WolfHA Node Information");
    println!("=======================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!("Domain ID:        {}", config.node.domain_id);
    println!("Address:          {}", config.node.address());
    println!("Leader Eligible:  {}", config.node.leader_eligible);
    println!();
    println!("Domain Peers:");
    for id in membership.peer_ids() {
        if let Some(peer) = membership.peer(id) {
            let eligible = if peer.leader_eligible { "" } else { " (ineligible)" };
            println!("  {:>5}  {}{}", peer.id, peer.address(), eligible);
        }
    }
    println!();
    println!("Election:");
    println!("  Phase Timeout:  {} ms", config.election.phase_timeout_ms);
    println!();
    println!("Replication:");
    println!("  Quiescence:     {} ms", config.replication.quiescence_ms);
    println!("  Update Timeout: {} ms", config.replication.update_timeout_ms);
    println!(
        "  Backoff:        {}-{} ms initial, {} ms max",
        config.replication.initial_backoff_min_ms,
        config.replication.initial_backoff_max_ms,
        config.replication.max_backoff_ms
    );
    println!("  Poll Interval:  {} ms", config.replication.max_poll_interval_ms);

    Ok(())
}

struct SimNode {
    id: NodeId,
    election: Arc<DomainElection>,
    sync: Arc<HaSync<SnapshotContent>>,
    sink: Arc<MemorySink>,
}

/// Run an in-process domain
async fn run_simulate(
    nodes: u16,
    ineligible: Vec<NodeId>,
    rig: Option<NodeId>,
    phase_timeout_ms: u64,
) -> anyhow::Result<()> {
    anyhow::ensure!(nodes > 0, "--nodes must be at least 1");
    if let Some(rig) = rig {
        anyhow::ensure!((1..=nodes).contains(&rig), "--rig {} is not a node", rig);
    }

    let members: Vec<DomainNode> = (1..=nodes)
        .map(|id| {
            let node = DomainNode::new(id, 1, format!("10.0.{}.{}", id / 256, id % 256), 6642);
            if ineligible.contains(&id) {
                node.ineligible()
            } else {
                node
            }
        })
        .collect();

    // Receivers first so every node's links can reach every other node
    let receivers: Vec<(Arc<SyncReceiver>, Arc<MemorySink>)> = members
        .iter()
        .map(|_| {
            let sink = MemorySink::new();
            (Arc::new(SyncReceiver::new(sink.clone())), sink)
        })
        .collect();

    let network = LocalNetwork::new();
    let config = ElectionConfig { phase_timeout_ms };
    let mut sims = Vec::new();
    for (node, (receiver, sink)) in members.iter().zip(receivers.iter()) {
        let links = LocalLinkFactory::new(Duration::from_millis(20));
        for (peer, (peer_receiver, _)) in members.iter().zip(receivers.iter()) {
            links.register(&peer.address(), Arc::clone(peer_receiver));
        }

        let coordinator =
            ReplicationCoordinator::<SnapshotContent>::new(Default::default(), Arc::new(links));
        for peer in members.iter().filter(|p| p.id != node.id) {
            coordinator
                .add_follower(format!("node-{}", peer.id), &peer.address())
                .await?;
        }
        let sync = HaSync::new(coordinator, Arc::clone(receiver), None);
        sync.start().await?;

        let membership = DomainMembership::with_nodes(node.clone(), members.clone())?;
        let election = DomainElection::new(membership, config.clone(), network.transport(node.id));
        network.register(node.id, &election);
        election.register_listener(sync.clone()).await;

        sims.push(SimNode {
            id: node.id,
            election,
            sync,
            sink: Arc::clone(sink),
        });
    }

    println!("Simulating domain 1 with {} node(s)", nodes);
    for sim in &sims {
        sim.election.start().await?;
    }

    let deadline = Duration::from_millis(phase_timeout_ms * 20) + Duration::from_secs(2);
    let result = match wait_for_leader(&sims, None, deadline).await {
        Some(leader) => {
            print_domain(&sims).await;
            replicate(&sims, leader, 1, deadline).await?;

            if let Some(rig) = rig {
                println!();
                println!("Forcing rigged election on node {}", rig);
                if let Some(sim) = sims.iter().find(|s| s.id == rig) {
                    sim.election.force_election(true).await;
                }
                match wait_for_leader(&sims, Some(rig), deadline).await {
                    Some(leader) => {
                        print_domain(&sims).await;
                        replicate(&sims, leader, 2, deadline).await
                    }
                    None => {
                        print_domain(&sims).await;
                        Err(anyhow::anyhow!("node {} did not take office", rig))
                    }
                }
            } else {
                Ok(())
            }
        }
        None => {
            print_domain(&sims).await;
            println!("No leader elected");
            Ok(())
        }
    };

    for sim in &sims {
        sim.sync.shutdown().await;
        sim.election.shutdown().await;
    }
    result
}

/// Wait until one node leads and every other node follows it
async fn wait_for_leader(
    sims: &[SimNode],
    expected: Option<NodeId>,
    deadline: Duration,
) -> Option<NodeId> {
    let started = Instant::now();
    while started.elapsed() < deadline {
        let mut leaders = Vec::new();
        for sim in sims {
            leaders.push(sim.election.current_leader().await);
        }
        if let Some(Some(leader)) = leaders.first().copied() {
            let agreed = leaders.iter().all(|l| *l == Some(leader));
            let expected_ok = expected.map_or(true, |e| e == leader);
            if agreed && expected_ok {
                let sim = sims.iter().find(|s| s.id == leader)?;
                if sim.election.is_leader().await {
                    return Some(leader);
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}

/// Publish a snapshot on the leader and wait for every follower to hold it
async fn replicate(
    sims: &[SimNode],
    leader: NodeId,
    generation: u64,
    deadline: Duration,
) -> anyhow::Result<()> {
    let snapshot = SnapshotContent::json(&serde_json::json!({
        "domain": 1,
        "leader": leader,
        "generation": generation,
    }))?;
    let leader_sim = sims
        .iter()
        .find(|s| s.id == leader)
        .context("leader not in domain")?;
    leader_sim.sync.publish(snapshot.clone()).await;

    let started = Instant::now();
    loop {
        let pending: Vec<NodeId> = sims
            .iter()
            .filter(|s| s.id != leader)
            .filter(|s| s.sink.last().map_or(true, |(_, body)| body != *snapshot.body()))
            .map(|s| s.id)
            .collect();
        if pending.is_empty() {
            break;
        }
        if started.elapsed() >= deadline {
            anyhow::bail!("followers {:?} did not receive the snapshot", pending);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let stats = leader_sim.sync.coordinator().stats();
    println!(
        "Replicated generation {} from node {} to {} follower(s) in {:?} ({} pushes, {} rejected, {} failed)",
        generation,
        leader,
        sims.len() - 1,
        started.elapsed(),
        stats.requests,
        stats.rejections,
        stats.failures
    );
    Ok(())
}

async fn print_domain(sims: &[SimNode]) {
    println!();
    println!("  {:>5}  {:<12}  {:>8}  {:>7}", "NODE", "PHASE", "LEADER", "WEIGHT");
    for sim in sims {
        let status = sim.election.status().await;
        let leader = status
            .leader_id
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        println!(
            "  {:>5}  {:<12}  {:>8}  {:>7}",
            status.node_id,
            status.phase.to_string(),
            leader,
            sim.election.local_weight().await
        );
    }
}
