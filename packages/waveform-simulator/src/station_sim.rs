//! Synthetic station network and waveform synthesis.
//!
//! The simulator reads the same inventory document the engine loads and
//! builds one signal source per channel: a Gaussian microseism noise floor in
//! raw counts plus, when a scenario event is active, P and S wave trains with
//! travel times from the hypocentral distance, exponentially decaying
//! oscillations scaled by magnitude and distance, vertical-dominant P and
//! horizontal-dominant S. Forced clip stretches rail the counts at the
//! datalogger full scale.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;
use seismic_types::{Pick, RawRecord, StreamId};

use crate::scenarios::ScenarioConfig;

const VP_KM_S: f64 = 6.2;
const VS_KM_S: f64 = 3.55;
/// 24-bit datalogger full scale.
const FULL_SCALE: i32 = 1 << 23;

// ── Inventory subset ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EpochDoc {
    #[serde(default)]
    gain: Option<f64>,
    gain_unit: String,
    #[serde(default)]
    sample_rate: Option<f64>,
    #[serde(default)]
    end: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelDoc {
    code: String,
    dip: f64,
    epochs: Vec<EpochDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationDoc {
    code: String,
    latitude: f64,
    longitude: f64,
    channels: Vec<ChannelDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StationDoc {
    code: String,
    locations: Vec<LocationDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkDoc {
    code: String,
    stations: Vec<StationDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InventoryDoc {
    networks: Vec<NetworkDoc>,
}

// ── Simulation model ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SimChannel {
    pub id: StreamId,
    pub fsamp: f64,
    pub vertical: bool,
    pub accelerometric: bool,
    /// Random wavelet phase so channels do not correlate perfectly.
    phase: f64,
    seq: u32,
}

#[derive(Debug, Clone)]
pub struct SimStation {
    pub network: String,
    pub station: String,
    pub location: String,
    pub latitude: f64,
    pub longitude: f64,
    pub channels: Vec<SimChannel>,
    pick_sent: bool,
}

pub struct NetworkSim {
    pub stations: Vec<SimStation>,
    scenario: ScenarioConfig,
    start_time: DateTime<Utc>,
    noise_sigma_counts: f64,
    pick_counter: u32,
}

/// Great-circle distance in km (spherical approximation is plenty for travel
/// time synthesis).
fn distance_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (la1, lo1, la2, lo2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let dlat = la2 - la1;
    let dlon = lo2 - lo1;
    let a = (dlat / 2.0).sin().powi(2) + la1.cos() * la2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * 6371.0 * a.sqrt().asin()
}

impl NetworkSim {
    pub fn from_inventory_json(
        json: &str,
        scenario: ScenarioConfig,
        start_time: DateTime<Utc>,
        noise_sigma_counts: f64,
        rng: &mut StdRng,
    ) -> Result<Self, serde_json::Error> {
        let doc: InventoryDoc = serde_json::from_str(json)?;

        let mut stations = Vec::new();
        for net in &doc.networks {
            for sta in &net.stations {
                for loc in &sta.locations {
                    let mut channels = Vec::new();
                    for cha in &loc.channels {
                        let Some(epoch) = cha.epochs.iter().find(|e| e.end.is_none()) else {
                            continue;
                        };
                        if epoch.gain.is_none() {
                            continue;
                        }
                        channels.push(SimChannel {
                            id: StreamId::new(&net.code, &sta.code, &loc.code, &cha.code),
                            fsamp: epoch.sample_rate.unwrap_or(100.0),
                            vertical: cha.dip.abs() >= 45.0,
                            accelerometric: epoch.gain_unit.to_ascii_uppercase().contains("2")
                                || epoch.gain_unit.to_ascii_uppercase().contains("/S/S"),
                            phase: rng.gen_range(0.0..std::f64::consts::TAU),
                            seq: 0,
                        });
                    }
                    if !channels.is_empty() {
                        stations.push(SimStation {
                            network: net.code.clone(),
                            station: sta.code.clone(),
                            location: loc.code.clone(),
                            latitude: loc.latitude,
                            longitude: loc.longitude,
                            channels,
                            pick_sent: false,
                        });
                    }
                }
            }
        }

        Ok(Self {
            stations,
            scenario,
            start_time,
            noise_sigma_counts,
            pick_counter: 0,
        })
    }

    fn origin_time(&self) -> Option<DateTime<Utc>> {
        self.scenario
            .event
            .then(|| self.start_time + seismic_types::secs(self.scenario.origin_offset_s))
    }

    fn hypocentral_km(&self, station: &SimStation) -> f64 {
        let epi = distance_km(
            station.latitude,
            station.longitude,
            self.scenario.latitude,
            self.scenario.longitude,
        );
        (epi * epi + self.scenario.depth_km * self.scenario.depth_km).sqrt()
    }

    /// Modeled P arrival at a station, None without an event.
    pub fn p_arrival(&self, station: &SimStation) -> Option<DateTime<Utc>> {
        let origin = self.origin_time()?;
        Some(origin + seismic_types::secs(self.hypocentral_km(station) / VP_KM_S))
    }

    /// Peak signal amplitude in counts for one channel at one distance.
    /// Crude attenuation: one magnitude unit is a factor ten, geometric
    /// spreading goes with 1/r.
    fn peak_counts(&self, dist_km: f64) -> f64 {
        let m = self.scenario.magnitude;
        let base = 10f64.powf(m - 3.0) / dist_km.max(5.0);
        // Scaled so an M5 at 20 km peaks around a third of full scale
        base * 2.0e6
    }

    /// Synthesize one record of `duration_s` for every channel, starting at
    /// `t0`. Returns the records plus any picks whose modeled P arrival
    /// falls inside this window.
    pub fn generate(
        &mut self,
        t0: DateTime<Utc>,
        duration_s: f64,
        rng: &mut StdRng,
    ) -> (Vec<RawRecord>, Vec<Pick>) {
        let origin = self.origin_time();
        let mut records = Vec::new();
        let mut picks = Vec::new();
        let noise = Normal::new(0.0, self.noise_sigma_counts).expect("sigma >= 0");

        let scenario = self.scenario.clone();
        let window_end = t0 + seismic_types::secs(duration_s);

        for station_index in 0..self.stations.len() {
            let (p_arrival, s_arrival, peak, clip_window) = {
                let station = &self.stations[station_index];
                match origin {
                    Some(origin) => {
                        let dist = self.hypocentral_km(station);
                        let p = origin + seismic_types::secs(dist / VP_KM_S);
                        let s = origin + seismic_types::secs(dist / VS_KM_S);
                        let clip = scenario
                            .clip
                            .iter()
                            .find(|c| c.station == station.station)
                            .map(|c| {
                                let start = origin + seismic_types::secs(c.start_offset_s);
                                (start, start + seismic_types::secs(c.duration_s))
                            });
                        (Some(p), Some(s), self.peak_counts(dist), clip)
                    }
                    None => (None, None, 0.0, None),
                }
            };

            let station = &mut self.stations[station_index];

            // Pick once, at the vertical channel, when P enters the window
            if scenario.emit_picks && !station.pick_sent {
                if let Some(p) = p_arrival {
                    if p >= t0 && p < window_end {
                        if let Some(vertical) = station.channels.iter().find(|c| c.vertical) {
                            self.pick_counter += 1;
                            picks.push(Pick {
                                public_id: format!("SIM-{}", self.pick_counter),
                                stream: vertical.id.clone(),
                                time: p,
                                phase_hint: Some("P".into()),
                            });
                            station.pick_sent = true;
                        }
                    }
                }
            }

            for cha in station.channels.iter_mut() {
                let n = (duration_s * cha.fsamp).round() as usize;
                let dt = 1.0 / cha.fsamp;
                let mut counts = Vec::with_capacity(n);

                for i in 0..n {
                    let t = t0 + seismic_types::secs(i as f64 * dt);
                    let mut v = noise.sample(rng);

                    if let (Some(p), Some(s)) = (p_arrival, s_arrival) {
                        // P wave train: vertical dominant
                        let tp = (t - p).num_microseconds().unwrap_or(0) as f64 / 1e6;
                        if tp > 0.0 {
                            let scale = if cha.vertical { 1.0 } else { 0.4 };
                            let envelope = (1.0 - (-tp * 4.0).exp()) * (-tp / 8.0).exp();
                            v += peak
                                * scale
                                * envelope
                                * (std::f64::consts::TAU * 4.0 * tp + cha.phase).sin();
                        }
                        // S wave train: horizontal dominant, stronger, slower
                        let ts = (t - s).num_microseconds().unwrap_or(0) as f64 / 1e6;
                        if ts > 0.0 {
                            let scale = if cha.vertical { 0.5 } else { 1.6 };
                            let envelope = (1.0 - (-ts * 3.0).exp()) * (-ts / 12.0).exp();
                            v += peak
                                * scale
                                * envelope
                                * (std::f64::consts::TAU * 1.5 * ts + cha.phase).sin();
                        }
                    }

                    // Forced saturation: rail at full scale
                    if let Some((clip_start, clip_end)) = clip_window {
                        if t >= clip_start && t < clip_end {
                            v = if i % 2 == 0 {
                                FULL_SCALE as f64
                            } else {
                                -(FULL_SCALE as f64)
                            };
                        }
                    }

                    counts.push(v.clamp(-(FULL_SCALE as f64), FULL_SCALE as f64) as i32);
                }

                cha.seq = cha.seq.wrapping_add(1);
                records.push(RawRecord {
                    id: cha.id.clone(),
                    start: t0,
                    fsamp: cha.fsamp,
                    counts,
                    seq: cha.seq,
                });
            }
        }

        (records, picks)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
