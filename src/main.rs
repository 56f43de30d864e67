use anyhow::Context;
use clap::Parser;
use env_logger::Builder;
use log::{LevelFilter, error, info};
use std::path::PathBuf;
use std::process::ExitCode;

use cellular_mobility_simulator::common::config::SimulatorConfig;
use cellular_mobility_simulator::common::scene::load_scene;
use cellular_mobility_simulator::simulation::{Network, Report};

/// Logical-time simulation of terminal handovers between base stations.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Scene file (JSON)
    #[arg(short, long)]
    scene: String,

    /// Config file (TOML), defaults to config.toml next to the scene
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Simulated duration, overrides the config
    #[arg(long)]
    duration_ms: Option<u64>,

    /// RNG seed for beacon shadowing, overrides the config
    #[arg(long)]
    seed: Option<u64>,

    /// Log level for this crate (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(args: &Args) -> anyhow::Result<SimulatorConfig> {
    let mut config = match &args.config {
        Some(path) => SimulatorConfig::load(path)?,
        None => {
            let path = SimulatorConfig::config_path_from_scene(&args.scene);
            if path.exists() { SimulatorConfig::load(&path)? } else { SimulatorConfig::default() }
        }
    };
    if let Some(duration_ms) = args.duration_ms {
        config.simulation.duration_ms = duration_ms;
    }
    if let Some(seed) = args.seed {
        config.simulation.seed = seed;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    Ok(config)
}

fn run(args: &Args, config: SimulatorConfig) -> anyhow::Result<Report> {
    let scene = load_scene(&args.scene).with_context(|| format!("Failed to load scene {}", args.scene))?;
    info!(
        "Loaded scene with {} base stations and {} terminals",
        scene.base_stations.len(),
        scene.terminals.len()
    );

    let mut network = Network::from_scene(&scene, config).context("Failed to build the network")?;
    let report = network.run().context("Simulation aborted")?;
    network.shutdown();
    Ok(report)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{:#}", err);
            return ExitCode::FAILURE;
        }
    };

    // Logging setup
    let level = config.log_level();
    Builder::new()
        .filter_level(LevelFilter::Warn)
        .filter(Some("cellular_mobility_simulator"), level)
        .parse_default_env()
        .init();

    info!("Starting up");

    match run(&args, config) {
        Ok(report) => {
            info!("Simulation finished\n{}", report);
            ExitCode::SUCCESS
        }
        Err(err) => {
            let class = err.downcast_ref::<cellular_mobility_simulator::Error>().map(|e| e.class());
            error!("{:#} ({:?})", err, class);
            ExitCode::FAILURE
        }
    }
}
