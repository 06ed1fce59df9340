//! kadmesh-node: runs a churning in-process overlay.
//!
//! Every node keeps its own routing table, replicates the items it is
//! responsible for and predicts its replication factor from the departures
//! it observes. The run prints a JSON summary of each tick on completion.

use kadmesh_node::config::NodeConfig;
use kadmesh_node::sim::{Simulation, TickReport};
use kadmesh_node::telemetry;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Serialize)]
struct Summary<'a> {
    n_root: bool,
    auto_factor: bool,
    transfers: usize,
    failed_transfers: usize,
    ticks: &'a [TickReport],
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load config
    let config = NodeConfig::load()?;

    // 2. Initialize tracing
    telemetry::init_tracing(&config.logging.level)?;
    info!(
        peers = config.simulation.peers,
        keys = config.simulation.keys,
        ticks = config.simulation.ticks,
        churn_per_tick = config.simulation.churn_per_tick,
        "kadmesh simulation starting"
    );

    // 3. Build the overlay and store the initial items
    let mut simulation = Simulation::with_services(config.clone())?;
    simulation.populate(config.simulation.peers)?;
    simulation.settle().await;
    let stored = simulation.store_random(config.simulation.keys);
    simulation.settle().await;
    info!(stored, "initial items stored");

    // 4. Churn until done or interrupted
    let mut reports = Vec::with_capacity(config.simulation.ticks);
    let run = async {
        for tick in 0..config.simulation.ticks {
            let departed = simulation.churn(config.simulation.churn_per_tick)?;
            tokio::time::sleep(simulation.tick_interval()).await;
            simulation.settle().await;

            let report = simulation.report(tick);
            info!(
                tick,
                departed = departed.len(),
                peers = report.peers,
                surviving = report.surviving,
                stored = report.stored,
                mean_factor = report.mean_factor,
                "tick complete"
            );
            if report.surviving < report.stored {
                warn!(lost = report.stored - report.surviving, tick, "items lost");
            }
            reports.push(report);
        }
        anyhow::Ok(())
    };
    tokio::select! {
        result = run => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
        }
    }

    // 5. Report
    let summary = Summary {
        n_root: config.replication.n_root,
        auto_factor: config.replication.auto_factor,
        transfers: simulation.network().transfers(),
        failed_transfers: simulation.network().failed_transfers(),
        ticks: &reports,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    simulation.shutdown().await;
    info!("kadmesh simulation stopped");
    Ok(())
}
