//! The cooperative dispatcher.
//!
//! One task owns every piece of mutable pipeline state — demultiplexer,
//! router, algorithm processors, FinDer driver, VS timeline — and multiplexes
//! packet acquisition, the pick channel and a 1 Hz maintenance tick. Nothing
//! in the pipeline locks; suspension only happens at acquisition, at the
//! timer and at bus sends.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use seismic_types::{
    decode_packet, EnvelopeChannel, EnvelopeMessage, EnvelopeValue, Pick, RawRecord, ValueQuality,
    WirePacket,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::BusHandle;
use crate::config::EngineConfig;
use crate::finder::{FinderAlgorithm, FinderDriver, OriginBundle};
use crate::firewall::StreamFirewall;
use crate::gain::{Demux, GainBaselineCorrector, GainSettings};
use crate::inventory::Inventory;
use crate::mseed;
use crate::processors::{
    ComponentKind, EnvelopeResult, FilterBankResult, Output, SignalUnit, TauCPdResult, TauPResult,
};
use crate::router::Router;
use crate::vs::Timeline;

/// Everything one dispatcher pass can hand to the bus.
#[derive(Debug)]
pub enum Emission {
    Envelope(EnvelopeMessage),
    Origin(OriginBundle),
    FilterBank(FilterBankResult),
    TauP(TauPResult),
    TauCPd(TauCPdResult),
}

pub struct Engine {
    config: Arc<EngineConfig>,
    firewall: StreamFirewall,
    demux: Demux,
    router: Router,
    finder: Option<FinderDriver>,
    timeline: Option<Timeline>,
    playback: bool,
    dump: bool,
    /// Acquisition window; records outside are dropped.
    window: (Option<DateTime<Utc>>, Option<DateTime<Utc>>),
    latest_data_time: Option<DateTime<Utc>>,
    pub records_total: u64,
    pub records_dropped: u64,
}

impl Engine {
    /// Fails when the FinDer algorithm rejects its initialization; per the
    /// error policy that aborts startup.
    pub fn new(
        config: Arc<EngineConfig>,
        inventory: Arc<Inventory>,
        finder_algorithm: Option<Box<dyn FinderAlgorithm>>,
        dump: bool,
        playback: bool,
        window: (Option<DateTime<Utc>>, Option<DateTime<Utc>>),
    ) -> anyhow::Result<Self> {
        let firewall =
            StreamFirewall::new(&config.streams.whitelist, &config.streams.blacklist);

        let template = GainBaselineCorrector::new(
            inventory.clone(),
            GainSettings {
                saturation_threshold: config.saturation_counts(),
                baseline_length: config.baseline_correction_buffer,
                taper_length: config.taper_length,
            },
        );

        let finder = if config.finder.enable {
            Some(FinderDriver::new(
                config.finder.clone(),
                inventory.clone(),
                finder_algorithm,
            )?)
        } else {
            None
        };
        let timeline = config
            .vs
            .enable
            .then(|| Timeline::new(config.vs.past, config.vs.future, config.vs.clip_timeout));

        Ok(Self {
            router: Router::new(config.clone(), inventory, dump),
            demux: Demux::new(template),
            firewall,
            finder,
            timeline,
            playback,
            dump,
            window,
            latest_data_time: None,
            records_total: 0,
            records_dropped: 0,
            config,
        })
    }

    /// The engine's notion of "now": the latest record end in playback mode,
    /// the wall clock otherwise.
    pub fn reference_time(&self) -> DateTime<Utc> {
        if self.playback {
            self.latest_data_time.unwrap_or_else(Utc::now)
        } else {
            Utc::now()
        }
    }

    /// Decode and process one datagram from the acquisition socket.
    pub fn feed_packet(&mut self, data: &[u8]) -> Vec<Emission> {
        match decode_packet(data) {
            Ok(WirePacket::Waveform(raw)) => self.feed_record(&raw),
            Ok(WirePacket::Pick(pick)) => self.feed_pick(&pick),
            Err(e) => {
                debug!("malformed packet: {e}");
                Vec::new()
            }
        }
    }

    pub fn feed_record(&mut self, raw: &RawRecord) -> Vec<Emission> {
        self.records_total += 1;

        let sid = raw.id.to_string();
        if !self.firewall.is_allowed(&sid) {
            self.records_dropped += 1;
            return Vec::new();
        }

        if let (Some(ts), _) = self.window {
            if raw.end_time() <= ts {
                self.records_dropped += 1;
                return Vec::new();
            }
        }
        if let (_, Some(te)) = self.window {
            if raw.start >= te {
                self.records_dropped += 1;
                return Vec::new();
            }
        }

        let delay = Utc::now() - raw.end_time();
        if delay > seismic_types::secs(self.config.debug.max_delay) {
            warn!(
                "{sid}: max delay exceeded: {:.1}s",
                delay.num_milliseconds() as f64 / 1e3
            );
        }

        let Some(rec) = self.demux.feed(raw) else {
            self.records_dropped += 1;
            return Vec::new();
        };

        self.latest_data_time = Some(match self.latest_data_time {
            Some(latest) => latest.max(rec.end_time()),
            None => rec.end_time(),
        });

        let now = self.reference_time();
        let mut outputs = Vec::new();
        self.router.route_record(&rec, now, &mut outputs);
        self.handle_outputs(outputs, now)
    }

    pub fn feed_pick(&mut self, pick: &Pick) -> Vec<Emission> {
        let now = self.reference_time();
        let mut outputs = Vec::new();
        if !self.router.route_pick(pick, now, &mut outputs) {
            debug!("pick '{}' not routed", pick.public_id);
        }
        self.handle_outputs(outputs, now)
    }

    /// Periodic maintenance: drive the FinDer loop and step the timeline.
    pub fn tick(&mut self) -> Vec<Emission> {
        let reference = self.reference_time();
        let mut emissions = Vec::new();

        if let Some(finder) = &mut self.finder {
            let mut bundles = Vec::new();
            finder.tick(reference, &mut bundles);
            emissions.extend(bundles.into_iter().map(Emission::Origin));
        }

        if let Some(timeline) = &mut self.timeline {
            timeline.set_reference_time(reference);
        }

        emissions
    }

    /// Turn one pass worth of processor outputs into bus emissions:
    /// multiplex envelope values per (stream, interval end), feed the FinDer
    /// driver and the VS timeline, write dump records.
    fn handle_outputs(&mut self, outputs: Vec<Output>, now: DateTime<Utc>) -> Vec<Emission> {
        let mut emissions = Vec::new();
        let mut envelopes: HashMap<(String, DateTime<Utc>), EnvelopeMessage> = HashMap::new();
        let mut order: Vec<(String, DateTime<Utc>)> = Vec::new();

        for output in outputs {
            match output {
                Output::Envelope(env) => {
                    self.dump_envelope(&env);

                    if let Some(finder) = &mut self.finder {
                        if env.unit == SignalUnit::MeterPerSecondSquared {
                            let tick = if self.playback { env.timestamp } else { now };
                            finder.feed(&env, tick);
                        }
                    }

                    let key = (env.waveform_id.to_string(), env.timestamp);
                    let message = envelopes.entry(key.clone()).or_insert_with(|| {
                        order.push(key);
                        EnvelopeMessage {
                            timestamp: env.timestamp,
                            network: env.waveform_id.net.clone(),
                            station: env.waveform_id.sta.clone(),
                            channels: vec![EnvelopeChannel {
                                name: match env.component {
                                    ComponentKind::Vertical => "V".to_string(),
                                    ComponentKind::Horizontal => "H".to_string(),
                                },
                                waveform_id: env.waveform_id.clone(),
                                values: Vec::new(),
                            }],
                        }
                    });
                    message.channels[0].values.push(EnvelopeValue {
                        value: env.value,
                        kind: env.unit.value_kind(),
                        quality: env.clipped.then_some(ValueQuality::Clipped),
                    });
                }
                Output::FilterBank(r) => emissions.push(Emission::FilterBank(r)),
                Output::TauP(r) => emissions.push(Emission::TauP(r)),
                Output::TauCPd(r) => emissions.push(Emission::TauCPd(r)),
                Output::Dump(rec) => {
                    let mut stdout = std::io::stdout().lock();
                    if let Err(e) = mseed::write_record(&rec, &mut stdout) {
                        debug!("record dump failed: {e}");
                    }
                }
            }
        }

        // Emission order per station follows interval end time
        for key in order {
            let message = envelopes.remove(&key).expect("collected above");
            if let Some(timeline) = &mut self.timeline {
                timeline.feed(&message);
            }
            emissions.push(Emission::Envelope(message));
        }

        // The FinDer loop may fire immediately after new amplitudes
        if self.finder.is_some() {
            let reference_time = self.reference_time();
            let finder = self.finder.as_mut().expect("checked above");
            let mut bundles = Vec::new();
            finder.tick(reference_time, &mut bundles);
            emissions.extend(bundles.into_iter().map(Emission::Origin));
        }

        emissions
    }

    /// Envelope values as one-sample records with the synthetic location
    /// codes EA/EV/ED when dumping is enabled.
    fn dump_envelope(&self, env: &EnvelopeResult) {
        if !self.dump {
            return;
        }
        let interval = self.config.vsfndr.envelope_interval;
        let cha = match env.component {
            ComponentKind::Vertical => env.waveform_id.cha.clone(),
            ComponentKind::Horizontal => format!("{}X", env.waveform_id.cha),
        };
        let rec = seismic_types::Record {
            id: seismic_types::StreamId::new(
                &env.waveform_id.net,
                &env.waveform_id.sta,
                env.unit.envelope_location_code(),
                &cha,
            ),
            start: env.timestamp,
            fsamp: 1.0 / interval,
            samples: vec![env.value],
            clip_mask: None,
        };
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = mseed::write_record(&rec, &mut stdout) {
            debug!("envelope dump failed: {e}");
        }
    }

    pub fn stream_count(&self) -> usize {
        self.demux.stream_count()
    }
}

// ─── Dispatcher loop ─────────────────────────────────────────────────────────

async fn publish(bus: &mut BusHandle, emissions: Vec<Emission>) {
    for emission in emissions {
        match emission {
            Emission::Envelope(msg) => bus.emit("envelope", &msg).await,
            Emission::Origin(bundle) => bus.emit("origin", &bundle).await,
            Emission::FilterBank(r) => {
                bus.emit(
                    "filterbank",
                    &serde_json::json!({
                        "pickId": r.pick_id,
                        "waveformId": r.waveform_id.to_string(),
                        "amplitudes": r.amplitudes,
                        "peakTime": r.peak_time,
                        "windowStart": r.window_start,
                        "windowEnd": r.window_end,
                        "clipped": r.clipped,
                    }),
                )
                .await
            }
            Emission::TauP(r) => {
                bus.emit(
                    "taup",
                    &serde_json::json!({
                        "pickId": r.pick_id,
                        "waveformId": r.waveform_id.to_string(),
                        "tauP": r.tau_p,
                        "peakTime": r.peak_time,
                        "clipped": r.clipped,
                    }),
                )
                .await
            }
            Emission::TauCPd(r) => {
                bus.emit(
                    "tauc",
                    &serde_json::json!({
                        "pickId": r.pick_id,
                        "waveformId": r.waveform_id.to_string(),
                        "tauC": r.tau_c,
                        "pd": r.pd,
                        "clipped": r.clipped,
                    }),
                )
                .await
            }
        }
    }
}

/// Run the dispatcher until the acquisition window closes or the process is
/// interrupted.
pub async fn run(
    mut engine: Engine,
    mut bus: BusHandle,
    mut picks: mpsc::Receiver<Pick>,
    socket: UdpSocket,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 65_536];
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
    let started = Utc::now();

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, _src)) => {
                        let emissions = engine.feed_packet(&buf[..len]);
                        publish(&mut bus, emissions).await;
                    }
                    Err(e) => {
                        // Never crash on transport errors
                        warn!("acquisition recv error: {e}");
                    }
                }
            }
            pick = picks.recv() => {
                match pick {
                    Some(pick) => {
                        info!("pick '{}' on {}", pick.public_id, pick.stream);
                        let emissions = engine.feed_pick(&pick);
                        publish(&mut bus, emissions).await;
                    }
                    None => {
                        info!("pick channel closed; shutting down");
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                let emissions = engine.tick();
                publish(&mut bus, emissions).await;

                if let (_, Some(te)) = engine.window {
                    // The window is exhausted once data (or the wall clock)
                    // passed its end
                    let reference = engine.reference_time();
                    if reference >= te {
                        info!("acquisition window exhausted");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; shutting down");
                break;
            }
        }
    }

    // Drain one final maintenance pass before teardown
    let emissions = engine.tick();
    publish(&mut bus, emissions).await;
    bus.sync().await;

    let secs = (Utc::now() - started).num_seconds().max(1);
    info!(
        "processed {} records ({} dropped) on {} streams; sent {} messages ({}/s, {} failed)",
        engine.records_total,
        engine.records_dropped,
        engine.stream_count(),
        bus.sent_total,
        bus.sent_total / secs as u64,
        bus.failed_total
    );

    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────────────
