//! GrooveNet Command-Line Interface
//!
//! This CLI provides tools for:
//! - Running vehicular network scenarios from JSON descriptions
//! - Generating random scenarios
//!
//! Scenarios run fully in-process by default; configure a transport in
//! the scenario file to link several simulator processes together.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use groovenet_core::config::ModelParams;
use groovenet_core::map::GridMap;
use groovenet_core::net::hybrid::HybridTransport;
use groovenet_core::net::packet::Position;
use groovenet_core::net::tcp::TcpTransport;
use groovenet_core::net::transport::Transport;
use groovenet_core::net::udp::UdpTransport;
use groovenet_core::sim::{ClockMode, SimContext, Simulator, SimulatorConfig};
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "groovenet")]
#[command(author, version, about = "Vehicular ad-hoc network simulator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario file
    Run {
        /// Scenario description (JSON)
        scenario: PathBuf,

        /// Override the scenario's trial count
        #[arg(long)]
        trials: Option<u32>,

        /// Override the scenario's duration in seconds
        #[arg(long)]
        duration: Option<f64>,

        /// Track the host clock instead of the synthetic step
        #[arg(long)]
        wall: bool,
    },

    /// Generate a random scenario file
    Generate {
        /// Output path for the scenario (JSON)
        #[arg(short, long, default_value = "scenario.json")]
        output: PathBuf,

        /// Number of vehicles
        #[arg(short, long, default_value = "10")]
        nodes: u32,

        /// Center latitude, degrees
        #[arg(long, default_value = "40.4430")]
        lat: f64,

        /// Center longitude, degrees
        #[arg(long, default_value = "-79.9430")]
        lon: f64,

        /// Placement radius in meters
        #[arg(long, default_value = "1000.0")]
        radius: f64,

        /// Radio range threshold in meters
        #[arg(long, default_value = "200.0")]
        range: f64,

        /// RNG seed
        #[arg(long, default_value = "1")]
        seed: u64,
    },
}

/// On-disk scenario description.
#[derive(Debug, Serialize, Deserialize)]
struct Scenario {
    #[serde(default)]
    name: String,
    #[serde(default = "default_duration")]
    duration_secs: f64,
    #[serde(default = "default_trials")]
    trials: u32,
    /// Synthetic clock step in milliseconds
    #[serde(default = "default_step")]
    step_ms: u64,
    #[serde(default)]
    transport: Option<TransportSpec>,
    vehicles: Vec<NodeSpec>,
    #[serde(default)]
    roadside: Vec<NodeSpec>,
}

fn default_duration() -> f64 {
    60.0
}

fn default_trials() -> u32 {
    1
}

fn default_step() -> u64 {
    100
}

#[derive(Debug, Serialize, Deserialize)]
struct TransportSpec {
    /// One of `udp`, `tcp`, `hybrid`
    kind: String,
    #[serde(default)]
    params: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeSpec {
    name: String,
    /// Dotted-quad entity address
    addr: String,
    lat: f64,
    lon: f64,
    #[serde(default)]
    depends_on: Vec<String>,
    /// Extra model parameters, passed through verbatim
    #[serde(default)]
    params: BTreeMap<String, String>,
}

impl NodeSpec {
    fn to_params(&self) -> ModelParams {
        let mut params = ModelParams::new(&self.name)
            .with("node.addr", self.addr.clone())
            .with("node.lat", self.lat.to_string())
            .with("node.lon", self.lon.to_string());
        for (key, value) in &self.params {
            params.set(key, value.clone());
        }
        params
    }
}

fn build_transport(spec: &TransportSpec) -> Result<Arc<dyn Transport>> {
    let mut params = ModelParams::new("transport");
    for (key, value) in &spec.params {
        params.set(key, value.clone());
    }
    let transport: Arc<dyn Transport> = match spec.kind.as_str() {
        "udp" => Arc::new(UdpTransport::from_params(&params)?),
        "tcp" => Arc::new(TcpTransport::from_params(&params)?),
        "hybrid" => Arc::new(HybridTransport::from_params(&params)?),
        other => bail!("unknown transport kind `{}`", other),
    };
    Ok(transport)
}

fn cmd_run(
    path: PathBuf,
    trials: Option<u32>,
    duration: Option<f64>,
    wall: bool,
) -> Result<()> {
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading scenario {}", path.display()))?;
    let scenario: Scenario =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    let transport = scenario
        .transport
        .as_ref()
        .map(build_transport)
        .transpose()?;
    if let Some(t) = &transport {
        t.start().context("starting transport")?;
    }

    let clock = if wall {
        ClockMode::Wall
    } else {
        ClockMode::Synthetic(Duration::from_millis(scenario.step_ms.max(1)))
    };
    let config = SimulatorConfig::default()
        .with_clock(clock)
        .with_duration(Duration::from_secs_f64(
            duration.unwrap_or(scenario.duration_secs),
        ))
        .with_trials(trials.unwrap_or(scenario.trials));

    let ctx = Arc::new(SimContext::new(
        Arc::new(GridMap::default()),
        transport.clone(),
    ));
    let mut sim = Simulator::new(config, ctx);

    for spec in &scenario.vehicles {
        let deps: Vec<&str> = spec.depends_on.iter().map(String::as_str).collect();
        sim.add_vehicle(&spec.name, &spec.to_params(), &deps)
            .with_context(|| format!("adding vehicle `{}`", spec.name))?;
    }
    for spec in &scenario.roadside {
        let deps: Vec<&str> = spec.depends_on.iter().map(String::as_str).collect();
        sim.add_roadside(&spec.name, &spec.to_params(), &deps)
            .with_context(|| format!("adding roadside unit `{}`", spec.name))?;
    }

    let stop = sim.stop_flag();
    ctrlc::set_handler(move || {
        info!("stop requested");
        stop.store(true, Ordering::SeqCst);
    })
    .context("installing signal handler")?;

    info!(
        scenario = %scenario.name,
        vehicles = scenario.vehicles.len(),
        roadside = scenario.roadside.len(),
        "running"
    );
    let stats = sim.run()?;

    if let Some(t) = &transport {
        t.stop();
    }
    stats.print_summary();
    Ok(())
}

fn cmd_generate(
    output: PathBuf,
    nodes: u32,
    lat: f64,
    lon: f64,
    radius: f64,
    range: f64,
    seed: u64,
) -> Result<()> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let center = Position::from_degrees(lat, lon);

    let vehicles = (0..nodes)
        .map(|i| {
            let bearing = rng.gen_range(0.0..360.0);
            let distance = rng.gen_range(0.0..radius);
            let pos = center.offset(bearing, distance);
            let mut params = BTreeMap::new();
            params.insert("phys.range_m".to_string(), range.to_string());
            params.insert("node.beacon_interval_ms".to_string(), "1000".to_string());
            params.insert(
                "node.speed_mps".to_string(),
                format!("{:.1}", rng.gen_range(0.0..20.0)),
            );
            params.insert(
                "node.heading_deg".to_string(),
                format!("{:.0}", rng.gen_range(0.0..360.0)),
            );
            params.insert("comm.seed".to_string(), (seed + i as u64).to_string());
            NodeSpec {
                name: format!("car{}", i),
                addr: format!("10.0.{}.{}", i / 250, (i % 250) + 1),
                lat: pos.lat_deg(),
                lon: pos.lon_deg(),
                depends_on: Vec::new(),
                params,
            }
        })
        .collect();

    let scenario = Scenario {
        name: format!("generated-{}-nodes", nodes),
        duration_secs: 60.0,
        trials: 1,
        step_ms: 100,
        transport: None,
        vehicles,
        roadside: Vec::new(),
    };
    let json = serde_json::to_string_pretty(&scenario)?;
    std::fs::write(&output, json)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("wrote {} ({} vehicles)", output.display(), nodes);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            scenario,
            trials,
            duration,
            wall,
        } => cmd_run(scenario, trials, duration, wall),

        Commands::Generate {
            output,
            nodes,
            lat,
            lon,
            radius,
            range,
            seed,
        } => cmd_generate(output, nodes, lat, lon, radius, range, seed),
    }
}
