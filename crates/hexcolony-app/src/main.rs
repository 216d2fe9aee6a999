//! Headless shell around the HexColony core: builds a world from fractal
//! noise terrain, provisions nests, food, and agents, then runs the
//! simulation and logs periodic summaries.

use anyhow::{Context, Result};
use hexcolony_core::{Colony, ColonyConfig, Hex, NestId};
use noise::{Fbm, MultiFractal, NoiseFn, Perlin};
use tracing::{info, warn};

const DEFAULT_SEED: u64 = 0xFACA_DEAF_0123_4567;
const RUN_TICKS: u64 = 2_000;
const LOG_INTERVAL: u64 = 100;

fn main() -> Result<()> {
    init_tracing();
    let mut colony = bootstrap_colony()?;
    info!(
        width = colony.config().width,
        height = colony.config().height,
        agents = colony.agents().len(),
        "starting foraging run"
    );
    run(&mut colony);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn bootstrap_colony() -> Result<Colony> {
    let seed = std::env::var("HC_SEED")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(DEFAULT_SEED);
    let config = ColonyConfig {
        width: 120,
        height: 120,
        wall_threshold: 0.35,
        rng_seed: Some(seed),
        history_capacity: 600,
        ..ColonyConfig::default()
    };
    let mut colony = Colony::new(config)?;

    let fbm = Fbm::<Perlin>::new(seed as u32).set_octaves(4);
    let terrain = move |u: f64, v: f64| -> f64 { fbm.get([u * 4.0, v * 4.0]) };
    colony.generate_terrain(&terrain);

    let nest_id = place_home_nest(&mut colony)?;
    let nest_center = colony
        .nest(nest_id)
        .context("freshly placed nest missing")?
        .center();

    scatter_food(&mut colony, nest_center);

    let report = colony.spawn_agents_around(60, nest_center, None, 0.5, false);
    if report.spawned < report.requested {
        warn!(
            requested = report.requested,
            spawned = report.spawned,
            "terrain too crowded for the full colony"
        );
    }
    Ok(colony)
}

/// Find an open region for the nest, relaxing the clearance radius when the
/// terrain is too craggy for a roomy one.
fn place_home_nest(colony: &mut Colony) -> Result<NestId> {
    for radius in (1..=3).rev() {
        if let Some(center) = colony.random_clear_ring(radius, 1024) {
            let id = colony.place_nest(center, radius)?;
            info!(center = %center, radius, "placed home nest");
            return Ok(id);
        }
    }
    anyhow::bail!("no open region for a nest; try another seed")
}

fn scatter_food(colony: &mut Colony, nest_center: Hex) {
    let mut clusters = 0;
    for _ in 0..6 {
        if let Some(center) = colony.random_free_cell(1024) {
            if center == nest_center {
                continue;
            }
            colony.add_food_cluster(center, 4, 0.7);
            clusters += 1;
        }
    }
    if clusters == 0 {
        warn!("no food clusters placed; agents will wander hungry");
    }
    info!(clusters, total_food = colony.grid().total_food(), "scattered food");
}

fn run(colony: &mut Colony) {
    for _ in 0..RUN_TICKS {
        let summary = colony.step();
        if summary.tick.0 % LOG_INTERVAL == 0 {
            info!(
                tick = summary.tick.0,
                agents = summary.agent_count,
                carried = summary.carried_total,
                nest_food = summary.nest_food_total,
                cell_food = summary.cell_food_total,
                "tick summary"
            );
        }
    }
    let delivered: f32 = colony.nest_snapshots().iter().map(|nest| nest.food).sum();
    info!(ticks = RUN_TICKS, delivered, "run complete");
}
