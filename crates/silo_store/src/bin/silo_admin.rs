//! In-process scenario driver for the assignment core.
//!
//! Boots a single-process cluster (in-memory coord-store, temp-dir catalog
//! and region data), runs a scripted scenario, and prints the resulting
//! placement. Useful for eyeballing assignment behavior without a test
//! harness.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use silo_coord::MemoryCoordStore;
use silo_store::region_states::TransitionTimeouts;
use silo_store::{
    AssignmentConfig, Catalog, Master, MasterConfig, NoopLogRecovery, RegionServer, RpcRegistry,
    ServerName,
};

#[derive(Parser)]
#[command(name = "silo-admin")]
#[command(about = "Scenario driver for the silo assignment core", long_about = None)]
struct Args {
    /// Number of region servers to start.
    #[arg(long, default_value_t = 3)]
    servers: usize,
    /// Number of regions to pre-split the demo table into.
    #[arg(long, default_value_t = 9)]
    regions: usize,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bootstrap a cluster, create a table, print the placement.
    Assign,
    /// Same, then kill one server and print the healed placement.
    Failover,
    /// Same, then split the first region and print the daughters.
    Split,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let dir = tempfile::tempdir()?;
    let store = MemoryCoordStore::new();
    let catalog = Arc::new(Catalog::open(dir.path().join("catalog"))?);
    let registry = RpcRegistry::new();

    // One shared data root stands in for the shared filesystem.
    let data_dir = dir.path().join("data");
    let mut servers = Vec::new();
    for i in 0..args.servers.max(1) {
        let name = ServerName::new(format!("rs{i}"), 8120, 1);
        servers.push(RegionServer::start(
            &store,
            name,
            catalog.clone(),
            registry.clone(),
            data_dir.clone(),
        )?);
    }

    let cfg = MasterConfig {
        assignment: AssignmentConfig {
            timeouts: TransitionTimeouts {
                offline: Duration::from_millis(500),
                ..TransitionTimeouts::default()
            },
            min_servers_to_start: args.servers.max(1),
            ..AssignmentConfig::default()
        },
        ..MasterConfig::default()
    };
    let master = Master::start(
        &store,
        catalog.clone(),
        registry.clone(),
        Arc::new(NoopLogRecovery),
        ServerName::new("master", 8100, 1),
        cfg,
    )
    .await?;

    let split_keys: Vec<Vec<u8>> = (1..args.regions.max(1))
        .map(|i| format!("k{i:04}").into_bytes())
        .collect();
    let regions = master.create_table("demo", &split_keys).await?;
    print_placement(&master, "after bulk assign");

    match args.command {
        Command::Assign => {}
        Command::Failover => {
            let victim = servers.remove(0);
            println!("\nkilling {} …", victim.name());
            victim.crash();
            master
                .wait_until(
                    "regions reassigned",
                    || {
                        regions
                            .iter()
                            .all(|r| master.states().online_owner(r.encoded_name()).is_some())
                    },
                    Duration::from_secs(60),
                )
                .await?;
            print_placement(&master, "after failover");
        }
        Command::Split => {
            let target = &regions[0];
            let rows: Vec<(Vec<u8>, Vec<u8>)> = (0..100)
                .map(|i| {
                    (
                        format!("k0000-{i:04}").into_bytes(),
                        format!("v{i}").into_bytes(),
                    )
                })
                .collect();
            let owner = master
                .states()
                .online_owner(target.encoded_name())
                .expect("region open");
            let host = servers
                .iter()
                .find(|s| s.name() == &owner)
                .expect("owner running");
            host.hosted(target.encoded_name())
                .expect("hosted")
                .put_batch(&rows)
                .await?;
            master.split_region(target, None).await?;
            print_placement(&master, "after split");
        }
    }

    master.stop();
    Ok(())
}

fn print_placement(master: &Master, heading: &str) {
    println!("\nplacement {heading}:");
    let states = master.states();
    for server in master.live_servers() {
        let regions = states.regions_on(&server);
        println!("  {server}: {} regions", regions.len());
        for encoded in regions {
            println!("    {encoded}");
        }
    }
    for (encoded, transition) in states.transitions_snapshot() {
        println!("  in transition: {encoded} ({})", transition.state);
    }
}
