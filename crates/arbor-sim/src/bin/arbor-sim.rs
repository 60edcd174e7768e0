//! Arbor Simulator
//!
//! Build a tree by sequential joins, then search every position from the root.
//!
//! Usage: `arbor-sim [nodes] [fanout] [--json]`

use std::env;

use arbor_sim::{Simulation, SimulationConfig};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().skip(1).collect();
    let json = args.iter().any(|a| a == "--json");
    let mut numbers = args.iter().filter(|a| !a.starts_with("--"));

    let node_count: usize = numbers.next().and_then(|s| s.parse().ok()).unwrap_or(50);
    let fanout: u32 = numbers.next().and_then(|s| s.parse().ok()).unwrap_or(2);

    // Keep stdout clean for the JSON timeline
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("arbor=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut sim = Simulation::new(SimulationConfig::default().with_fanout(fanout));
    let root = sim.add_root()?;
    for i in 1..node_count {
        sim.join_via(root)?;
        if !json && (i + 1) % 100 == 0 {
            println!("  Joined {} peers...", i + 1);
        }
    }

    let positions: Vec<_> = sim.positions().into_iter().map(|(_, p)| p).collect();
    for position in &positions {
        sim.search_exact(root, *position, position.to_string().into_bytes())?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&sim.events)?);
        return Ok(());
    }

    let tree = sim.check_complete_tree();
    let adjacency = sim.check_adjacency();
    let summary = sim.summary();

    println!("Arbor Simulator");
    println!("===============");
    println!();
    println!("  Peers:        {}", sim.running_count());
    println!("  Fanout:       {}", fanout);
    println!(
        "  Depth:        {}",
        positions.iter().map(|p| p.level()).max().unwrap_or(0)
    );
    println!("  Messages:     {}", summary.messages);
    println!("  Rejected:     {}", summary.rejected);
    println!(
        "  Searches:     {} delivered, {} failed",
        sim.delivered.len(),
        sim.failures.len()
    );
    println!(
        "  Tree:         {}",
        if tree.is_empty() { "complete" } else { "INCOMPLETE" }
    );
    println!(
        "  Adjacency:    {}",
        if adjacency.is_empty() { "consistent" } else { "BROKEN" }
    );
    for violation in tree.iter().chain(adjacency.iter()) {
        println!("    - {}", violation);
    }

    Ok(())
}
