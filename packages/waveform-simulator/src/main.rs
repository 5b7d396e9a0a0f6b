//! main.rs — waveform simulator entry point
//!
//! Streams synthetic three-component seismograms for every channel of an
//! inventory to the engine's UDP acquisition socket, paced in real time (or
//! accelerated with --rate). A scenario file injects an earthquake: P/S wave
//! trains, optional forced saturation, optional P pick packets at the
//! modeled arrival times.

mod scenarios;
mod station_sim;
mod udp_tx;

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DurationRound, Utc};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::interval;
use tracing::info;

use scenarios::ScenarioConfig;
use station_sim::NetworkSim;
use udp_tx::UdpTransmitter;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "wave-sim", about = "Synthetic seismic waveform source")]
struct Args {
    /// Station inventory (JSON), same document the engine loads
    #[arg(long)]
    inventory: PathBuf,

    /// Scenario file (TOML); omit for noise only
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// Pre-load the mainshock scenario
    #[arg(long)]
    mainshock: bool,

    /// Engine acquisition address
    #[arg(long, default_value = "127.0.0.1:18100")]
    engine_addr: String,

    /// Pacing multiplier (1.0 = real-time)
    #[arg(long, default_value = "1.0")]
    rate: f64,

    /// Record length in seconds
    #[arg(long, default_value = "1.0")]
    record_length: f64,

    /// Noise floor standard deviation in counts
    #[arg(long, default_value = "200.0")]
    noise: f64,

    /// RNG seed for reproducible playbacks
    #[arg(long, default_value = "1")]
    seed: u64,
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wave_sim=info,waveform_simulator=info".into()),
        )
        .init();

    let args = Args::parse();

    let scenario = if let Some(path) = &args.scenario {
        let text = std::fs::read_to_string(path).expect("cannot read scenario file");
        toml::from_str(&text).expect("invalid scenario file")
    } else if args.mainshock {
        scenarios::preset_mainshock()
    } else {
        ScenarioConfig::default()
    };

    let inventory_json =
        std::fs::read_to_string(&args.inventory).expect("cannot read inventory file");
    let start_time = Utc::now()
        .duration_trunc(chrono::Duration::seconds(1))
        .expect("time truncation");

    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut sim = NetworkSim::from_inventory_json(
        &inventory_json,
        scenario,
        start_time,
        args.noise,
        &mut rng,
    )
    .expect("invalid inventory document");

    info!(
        "waveform simulator starting — {} stations, event: {}",
        sim.stations.len(),
        args.mainshock || args.scenario.is_some()
    );

    let transmitter = UdpTransmitter::new(&args.engine_addr).expect("failed to bind UDP socket");

    let epoch_ms = (args.record_length * 1000.0 / args.rate) as u64;
    let mut ticker = interval(Duration::from_millis(epoch_ms.max(1)));
    let mut window = 0u64;

    loop {
        ticker.tick().await;

        let t0 = start_time + seismic_types::secs(window as f64 * args.record_length);
        let (records, picks) = sim.generate(t0, args.record_length, &mut rng);

        transmitter.send_records(&records);
        for pick in &picks {
            info!("pick {} at {} ({})", pick.public_id, pick.time, pick.stream);
        }
        transmitter.send_picks(&picks);

        window += 1;
        if window % 30 == 0 {
            info!(
                "t+{}s | {} records/window",
                window as f64 * args.record_length,
                records.len()
            );
        }
    }
}
