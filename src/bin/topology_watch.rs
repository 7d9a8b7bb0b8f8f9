//! Live cluster topology viewer
//!
//! Connects to a cluster, prints the discovered partitions and slot
//! coverage, then follows topology changes until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use valkey_cluster_client::config::AuthConfig;
use valkey_cluster_client::{
    ClusterConfig, ClusterManager, ConnectionManager, NodeAddress, ReadMode,
};

/// Watch a cluster's topology as seen by the client
#[derive(Parser, Debug)]
#[command(name = "topology-watch")]
#[command(version, about)]
#[command(disable_help_flag = true)]
struct Args {
    /// Print help information
    #[arg(long = "help", action = clap::ArgAction::Help)]
    help: (),

    /// Cluster seed address (host:port), repeatable
    #[arg(short = 'h', long = "host", default_value = "127.0.0.1:6379", action = clap::ArgAction::Append)]
    hosts: Vec<String>,

    /// Password for AUTH
    #[arg(short = 'a', long = "auth")]
    password: Option<String>,

    /// Username for ACL AUTH (requires --auth)
    #[arg(long = "user")]
    username: Option<String>,

    /// Topology scan interval in milliseconds
    #[arg(long = "scan-interval", default_value_t = 2000)]
    scan_interval_ms: u64,

    /// Tolerate partial slot coverage at startup
    #[arg(long = "lax-coverage")]
    lax_coverage: bool,

    /// Skip slave discovery entirely
    #[arg(long = "skip-slaves")]
    skip_slaves: bool,

    /// How long to watch before exiting, in seconds (0 = forever)
    #[arg(long = "duration", default_value_t = 0)]
    duration_secs: u64,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");
}

fn print_topology(manager: &Arc<ClusterManager>) {
    println!("====================================");
    println!("covered slots: {}/16384", manager.covered_slots());
    for partition in manager.current_partitions() {
        let master = partition
            .master_address()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "?".to_string());
        let slaves: Vec<String> = partition
            .slave_addresses()
            .iter()
            .map(|a| a.to_string())
            .collect();
        println!(
            "  {} {} slots={} slaves=[{}]{}",
            partition.node_id(),
            master,
            partition.ranges_display(),
            slaves.join(", "),
            if partition.is_master_fail() { " FAIL" } else { "" },
        );
    }
    println!("====================================");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);

    let mut seeds = Vec::with_capacity(args.hosts.len());
    for host in &args.hosts {
        seeds.push(NodeAddress::parse(host).map_err(|e| anyhow::anyhow!("{e}"))?);
    }

    let mut config = ClusterConfig::new(seeds)
        .scan_interval(Duration::from_millis(args.scan_interval_ms))
        .check_slots_coverage(!args.lax_coverage)
        .check_skip_slaves_init(args.skip_slaves)
        .read_mode(ReadMode::MasterSlave);
    if let Some(password) = args.password.clone() {
        config = config.auth(AuthConfig {
            password,
            username: args.username.clone(),
        });
    }

    let manager = ClusterManager::connect(config).await?;
    print_topology(&manager);

    let watch = async {
        let mut last_node = manager.last_cluster_node();
        loop {
            tokio::time::sleep(Duration::from_millis(args.scan_interval_ms)).await;
            let node = manager.last_cluster_node();
            if node != last_node {
                println!(
                    "state now refreshed from {}",
                    node.as_ref().map(|n| n.to_string()).unwrap_or_default()
                );
                last_node = node;
            }
            print_topology(&manager);
        }
    };

    if args.duration_secs > 0 {
        let _ = tokio::time::timeout(Duration::from_secs(args.duration_secs), watch).await;
    } else {
        tokio::select! {
            _ = watch => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }

    manager.shutdown().await;
    Ok(())
}
