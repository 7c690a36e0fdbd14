//! CLI argument parsing and command dispatch

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bench_mechanic_core::simulated::SimulatedProvider;
use bench_mechanic_core::{
    AcquisitionMode, Config, CoordinatorBuilder, EngineHandle, MetricsContext, StartEngine,
    SystemResolver, Topology,
};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "bench-mechanic")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Drive a full lifecycle against in-memory collaborators
    Simulate {
        /// Path to the run configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Path to the host-local configuration (JSON)
        #[arg(short, long)]
        local_config: Option<PathBuf>,

        /// How the candidate's binaries are acquired
        #[arg(short, long, value_enum, default_value_t = Mode::Distribution)]
        mode: Mode,

        /// Number of measurement laps
        #[arg(long, default_value = "1")]
        laps: u32,
    },
    /// Print the per-host worker layout of a run configuration
    Topology {
        /// Path to the run configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// Acquisition mode as given on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Check out sources without building
    Sources,
    /// Check out and build sources
    SourceBuild,
    /// Download a packaged distribution
    Distribution,
    /// Attach to an externally managed cluster
    External,
    /// Run nodes as containers
    Docker,
}

impl From<Mode> for AcquisitionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Sources => AcquisitionMode::Sources { build: false },
            Mode::SourceBuild => AcquisitionMode::Sources { build: true },
            Mode::Distribution => AcquisitionMode::Distribution,
            Mode::External => AcquisitionMode::External,
            Mode::Docker => AcquisitionMode::Docker,
        }
    }
}

impl Cli {
    /// Run the selected command
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Simulate {
                config,
                local_config,
                mode,
                laps,
            } => simulate(config, local_config.as_deref(), (*mode).into(), *laps).await,
            Commands::Topology { config } => topology(config),
        }
    }
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path)
        .with_context(|| format!("Failed to load configuration: {}", path.display()))
}

async fn simulate(
    config: &Path,
    local_config: Option<&Path>,
    mode: AcquisitionMode,
    laps: u32,
) -> Result<()> {
    let cfg = load_config(config)?;
    let local = match local_config {
        Some(path) => load_config(path)?,
        None => Config::new("local"),
    };

    let provider = SimulatedProvider::new();
    let mut engine = CoordinatorBuilder::new()
        .provider(Arc::new(provider.clone()))
        .local_config(local)
        .spawn()?;

    let mut context = MetricsContext::new(chrono::Utc::now());
    if let Some(track) = cfg.get_opt::<String>("track", "track.name")? {
        context = context.with_track(track);
    }
    if let Some(challenge) = cfg.get_opt::<String>("track", "challenge.name")? {
        context = context.with_challenge(challenge);
    }
    if let Ok(car) = cfg.car_name() {
        context = context.with_car(car);
    }

    println!("\n{}", "=".repeat(70));
    println!("   bench-mechanic - simulated run ({mode})");
    println!("{}", "=".repeat(70));

    let result = drive(&mut engine, StartEngine::new(cfg, context, mode), laps).await;
    if result.is_err() {
        tracing::warn!("Run failed, tearing down");
        if let Err(failure) = engine.stop_engine().await {
            tracing::warn!(message = %failure.message, "Teardown failed");
        }
    }
    engine.join().await;

    println!("{}", "=".repeat(70));
    println!("Collaborator calls: {}", provider.log().calls().len());
    result
}

async fn drive(engine: &mut EngineHandle, start: StartEngine, laps: u32) -> Result<()> {
    let started = engine.start_engine(start).await?;
    println!("Cluster started with {} node(s):", started.cluster.node_count());
    println!("{}", serde_json::to_string_pretty(&started.cluster)?);

    for lap in 1..=laps {
        engine.on_benchmark_start(lap).await?;
        let metrics = engine.on_benchmark_stop().await?;
        println!("Lap {lap}: {} system metric(s)", metrics.len());
    }

    let totals = engine.stop_engine().await?;
    println!("Cluster stopped, {} final system metric(s)", totals.len());
    Ok(())
}

fn topology(config: &Path) -> Result<()> {
    let cfg = load_config(config)?;
    let hosts = cfg.hosts()?;
    let topology = Topology::resolve(&hosts, &SystemResolver)?;

    println!("{} node(s) on {} host(s)", topology.node_count(), topology.groups.len());
    for group in &topology.groups {
        let placement = if group.is_local() { "local" } else { "remote" };
        println!(
            "  mechanic/worker/{}:{}  [{placement}]  node ids: {:?}",
            group.ip, group.port, group.node_ids
        );
    }
    Ok(())
}
