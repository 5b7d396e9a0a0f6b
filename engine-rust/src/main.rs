mod bus;
mod components;
mod config;
mod dispatch;
mod filters;
mod finder;
mod firewall;
mod gain;
mod inventory;
mod mseed;
mod preprocessor;
mod processors;
mod ring;
mod router;
mod vs;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::Parser;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::EngineConfig;
use crate::dispatch::Engine;
use crate::firewall::StreamFirewall;
use crate::inventory::Inventory;

/// Real-time EEW amplitude engine: gain/baseline conditioning, three
/// component routing, envelope / filter-bank / onsite-magnitude processing
/// and the FinDer driver loop.
#[derive(Debug, Parser)]
#[command(name = "eew-engine", version)]
struct Cli {
    /// Engine configuration file (TOML). All keys are optional.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Station inventory (JSON). Mandatory.
    #[arg(long)]
    inventory: PathBuf,

    /// Start of the acquisition time window ("%Y-%m-%d %H:%M:%S" UTC),
    /// requires also --te
    #[arg(long)]
    ts: Option<String>,

    /// End of the acquisition time window, requires also --ts
    #[arg(long)]
    te: Option<String>,

    /// Test mode, no messages are sent
    #[arg(long)]
    test: bool,

    /// Do not host messaging, implies --test
    #[arg(long)]
    offline: bool,

    /// Show the effective configuration and exit
    #[arg(long)]
    dump_config: bool,

    /// Dump all processed streams as MiniSEED to stdout
    #[arg(long)]
    dump: bool,

    /// Use the latest record timestamp as reference time instead of the
    /// wall clock
    #[arg(long)]
    playback: bool,

    /// UDP address the waveform acquisition listens on
    #[arg(long, default_value = "0.0.0.0:18100")]
    listen: String,

    /// TCP address of the bus surface (/health + Socket.IO)
    #[arg(long, default_value = "0.0.0.0:18101")]
    bus: String,
}

fn parse_window(
    ts: &Option<String>,
    te: &Option<String>,
) -> anyhow::Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
    if ts.is_none() && te.is_none() {
        return Ok((None, None));
    }
    let Some(ts) = ts else {
        bail!("--te requires also --ts");
    };
    let Some(te) = te else {
        bail!("--ts requires also --te");
    };

    let parse = |s: &str| -> anyhow::Result<DateTime<Utc>> {
        let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").with_context(|| {
            format!("wrong time format '{s}': expected e.g. \"2010-01-01 12:00:00\"")
        })?;
        Ok(naive.and_utc())
    };

    let start = parse(ts)?;
    let end = parse(te)?;
    if start >= end {
        bail!("acquisition time window is empty or of negative length");
    }
    Ok((Some(start), Some(end)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                if cli.dump_config {
                    "eew_engine=debug".into()
                } else {
                    "eew_engine=info,socketioxide=warn".into()
                }
            }),
        )
        .init();

    info!(
        "EEW amplitude engine v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    let window = parse_window(&cli.ts, &cli.te)?;
    let test_mode = cli.test || cli.offline;

    // The external FinDer configuration is mandatory when the driver is on
    if config.finder.enable {
        let Some(path) = &config.finder.config else {
            bail!("finder.config is mandatory");
        };
        std::fs::metadata(path)
            .with_context(|| format!("cannot read FinDer config {}", path.display()))?;
    }

    config.dump(cli.dump);

    if cli.dump_config {
        return Ok(());
    }

    let inventory = Arc::new(
        Inventory::load(&cli.inventory)
            .with_context(|| format!("cannot load inventory {}", cli.inventory.display()))?,
    );

    // Log the subscription set the firewall leaves over
    let firewall = StreamFirewall::new(&config.streams.whitelist, &config.streams.blacklist);
    let (allow_rules, deny_rules) = firewall.rule_counts();
    info!("applying {allow_rules} allow and {deny_rules} deny rules");
    let subscribed = inventory
        .stream_ids(Utc::now())
        .into_iter()
        .filter(|id| firewall.is_allowed(&id.to_string()))
        .count();
    info!("{subscribed} streams subscribed");

    // The offline sender is kept alive for the lifetime of the dispatcher so
    // the pick channel never reports end-of-stream.
    let (bus_handle, pick_rx, _offline_pick_tx) = if cli.offline {
        let (pick_tx, pick_rx) = mpsc::channel(1);
        (bus::BusHandle::disabled(), pick_rx, Some(pick_tx))
    } else {
        let (handle, pick_rx) = bus::start(&cli.bus, config.bus.sync_every, test_mode).await?;
        (handle, pick_rx, None)
    };

    let socket = UdpSocket::bind(&cli.listen)
        .await
        .with_context(|| format!("cannot bind acquisition socket {}", cli.listen))?;
    info!("acquisition listening on {}", cli.listen);

    let engine = Engine::new(
        Arc::new(config),
        inventory,
        // The FinDer library binding is attached here when built in; without
        // it the driver logs PGA lists only.
        None,
        cli.dump,
        cli.playback,
        window,
    )?;

    dispatch::run(engine, bus_handle, pick_rx, socket).await
}

// ── Tests ────────────────────────────────────────────────────────────────────
