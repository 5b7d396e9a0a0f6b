//! Station PGA bookkeeping and the FinDer driver loop.
//!
//! Acceleration envelope values are buffered per station in a time-capacity
//! ring together with a running maximum over an adaptive window. A throttled
//! scan pass assembles the filtered PGA list and asks the FinDer algorithm
//! for new event candidates; a throttled process pass updates every active
//! event, emits the origin/magnitude bundle when the algorithm raises its
//! message flag and drops events it no longer wants held.
//!
//! The inversion itself is external. When no algorithm implementation is
//! attached the driver logs the PGA list instead of scanning, which is the
//! library-less operation mode used for amplitude debugging.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use seismic_types::PgaData;
use tracing::{debug, error, warn};

use crate::config::FinderConfig;
use crate::inventory::{Inventory, StationCoordinate};
use crate::processors::{EnvelopeResult, SignalUnit};
use crate::ring::{Ring, Timestamped};

// ── Algorithm contract ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PdfPoint {
    pub value: f64,
    pub probability: f64,
}

/// Opaque per-event state owned by the driver and updated by the algorithm.
#[derive(Debug, Clone)]
pub struct FinderEvent {
    pub event_id: i64,
    pub epicenter: Coordinate,
    pub epicenter_uncertainty: Coordinate,
    pub depth: f64,
    pub origin_time: DateTime<Utc>,
    pub magnitude: f64,
    pub magnitude_uncertainty: f64,
    pub magnitude_regression: f64,
    pub magnitude_rupture_length: f64,
    /// Rupture length in the algorithm's configured units.
    pub rupture_length: f64,
    pub rupture_width: f64,
    pub rupture_strike: f64,
    pub likelihood: f64,
    pub stations_used: usize,
    pub length_pdf: Vec<PdfPoint>,
    pub strike_pdf: Vec<PdfPoint>,
    pub latitude_pdf: Vec<PdfPoint>,
    pub longitude_pdf: Vec<PdfPoint>,
    /// Rupture outline as (lat, lon, depth) vertices.
    pub rupture_polygon: Vec<(f64, f64, f64)>,
    pub pga_above_threshold: Vec<PgaData>,
    /// The algorithm wants the current solution published.
    pub message: bool,
    /// The algorithm still wants this event kept alive.
    pub hold_object: bool,
}

impl FinderEvent {
    fn new(event_id: i64, epicenter: Coordinate, origin_time: DateTime<Utc>) -> Self {
        Self {
            event_id,
            epicenter,
            epicenter_uncertainty: Coordinate {
                latitude: 0.0,
                longitude: 0.0,
            },
            depth: 0.0,
            origin_time,
            magnitude: 0.0,
            magnitude_uncertainty: 0.0,
            magnitude_regression: 0.0,
            magnitude_rupture_length: 0.0,
            rupture_length: 0.0,
            rupture_width: 0.0,
            rupture_strike: 0.0,
            likelihood: 0.0,
            stations_used: 0,
            length_pdf: Vec::new(),
            strike_pdf: Vec::new(),
            latitude_pdf: Vec::new(),
            longitude_pdf: Vec::new(),
            rupture_polygon: Vec::new(),
            pga_above_threshold: Vec::new(),
            message: false,
            hold_object: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("finder: {0}")]
pub struct FinderError(pub String);

/// Seam to the external line-source estimation library.
pub trait FinderAlgorithm: Send {
    /// One-time initialization with the network's station coordinates,
    /// before any scan call.
    fn init(&mut self, stations: &[StationCoordinate]) -> Result<(), FinderError>;

    /// Scan the current PGA list for new event candidates.
    fn scan(
        &mut self,
        pga: &[PgaData],
        active: &[FinderEvent],
    ) -> Result<Vec<Coordinate>, FinderError>;

    /// Update one active event from the current PGA list.
    fn process(
        &mut self,
        event: &mut FinderEvent,
        tick: DateTime<Utc>,
        pga: &[PgaData],
    ) -> Result<(), FinderError>;
}

// ── Station bookkeeping ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct Amplitude {
    value: f64,
    timestamp: DateTime<Utc>,
    channel: String,
    clipped: bool,
}

impl Timestamped for Amplitude {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

#[derive(Debug, Clone)]
struct StationMeta {
    network: String,
    station: String,
    location: String,
    latitude: f64,
    longitude: f64,
    gain_unit: String,
}

struct StationBuddy {
    meta: StationMeta,
    pgas: Ring<Amplitude>,
    max_pga: Option<Amplitude>,
    last_clipped: Option<DateTime<Utc>>,
    /// Creation order, used to break instrument conflicts during dedup.
    inserted: u64,
}

impl StationBuddy {
    /// Recompute the maximum over samples at or after `min_time`.
    /// Returns true when the maximum changed.
    fn update_maximum(&mut self, min_time: DateTime<Utc>) -> bool {
        let last = self.max_pga.take();

        if self
            .pgas
            .back()
            .map(|b| b.timestamp >= min_time)
            .unwrap_or(false)
        {
            for amp in self.pgas.iter() {
                if amp.timestamp < min_time {
                    continue;
                }
                let better = self
                    .max_pga
                    .as_ref()
                    .map(|m| amp.value >= m.value)
                    .unwrap_or(true);
                if better {
                    self.max_pga = Some(amp.clone());
                }
            }
        }

        self.max_pga != last
    }
}

// ── Origin bundle ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginQuality {
    pub used_station_count: usize,
    /// Count of stations whose PGA exceeded the algorithm threshold.
    pub used_phase_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleOrigin {
    pub method: String,
    pub latitude: f64,
    pub latitude_uncertainty_km: f64,
    pub longitude: f64,
    pub longitude_uncertainty_km: f64,
    pub depth: f64,
    pub time: DateTime<Utc>,
    pub evaluation_mode: String,
    pub quality: OriginQuality,
    pub likelihood: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMagnitude {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uncertainty: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleRupture {
    pub length_pdf: Vec<PdfPoint>,
    pub width: f64,
    /// Rupture outline as WKT `POLYGON Z`.
    pub geometry_wkt: String,
    pub strike_pdf: Vec<PdfPoint>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleCentroid {
    pub latitude_pdf: Vec<PdfPoint>,
    pub longitude_pdf: Vec<PdfPoint>,
}

/// The full message bundle emitted when FinDer raises its message flag.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginBundle {
    pub event_id: i64,
    pub origin: BundleOrigin,
    pub magnitudes: Vec<BundleMagnitude>,
    pub rupture: BundleRupture,
    pub centroid: BundleCentroid,
    pub station_pga: Vec<PgaData>,
}

/// Meridian and parallel arc lengths in km per degree on the WGS-84
/// ellipsoid, at the given latitude.
fn wgs84_km_per_degree(latitude_deg: f64) -> (f64, f64) {
    const A: f64 = 6378.137;
    const E2: f64 = 0.006_694_379_990_14;
    let lat = latitude_deg.to_radians();
    let s2 = lat.sin() * lat.sin();
    let meridian = A * (1.0 - E2) / (1.0 - E2 * s2).powf(1.5);
    let parallel = A * lat.cos() / (1.0 - E2 * s2).sqrt();
    let deg = std::f64::consts::PI / 180.0;
    (meridian * deg, parallel * deg)
}

fn polygon_wkt(vertices: &[(f64, f64, f64)]) -> String {
    if vertices.is_empty() {
        return "POLYGON Z EMPTY".to_string();
    }
    let mut points: Vec<String> = vertices
        .iter()
        .map(|(lat, lon, depth)| format!("{lon} {lat} {depth}"))
        .collect();
    // WKT rings are closed
    if vertices.first() != vertices.last() {
        points.push(points[0].clone());
    }
    format!("POLYGON Z (({}))", points.join(", "))
}

// ── Driver ───────────────────────────────────────────────────────────────────

pub struct FinderDriver {
    cfg: FinderConfig,
    inventory: Arc<Inventory>,
    stations: HashMap<String, StationBuddy>,
    reference_time: Option<DateTime<Utc>>,
    /// Adaptive maximum window, seconds.
    var_window: f64,
    algorithm: Option<Box<dyn FinderAlgorithm>>,
    finder_list: Vec<FinderEvent>,
    last_event_id: i64,
    last_scan: Option<DateTime<Utc>>,
    last_process: Option<DateTime<Utc>>,
    insert_counter: u64,
    dirty: bool,
}

impl FinderDriver {
    /// Build the driver and hand the algorithm the station coordinate list.
    /// An initialization failure is fatal for the caller.
    pub fn new(
        cfg: FinderConfig,
        inventory: Arc<Inventory>,
        mut algorithm: Option<Box<dyn FinderAlgorithm>>,
    ) -> Result<Self, FinderError> {
        if let Some(algorithm) = algorithm.as_mut() {
            algorithm.init(&inventory.station_coordinates())?;
        }

        let var_window = cfg.default_envelope_length;
        Ok(Self {
            cfg,
            inventory,
            stations: HashMap::new(),
            reference_time: None,
            var_window,
            algorithm,
            finder_list: Vec::new(),
            last_event_id: 0,
            last_scan: None,
            last_process: None,
            insert_counter: 0,
            dirty: false,
        })
    }

    pub fn reference_time(&self) -> Option<DateTime<Utc>> {
        self.reference_time
    }

    pub fn var_window_secs(&self) -> f64 {
        self.var_window
    }

    pub fn active_events(&self) -> &[FinderEvent] {
        &self.finder_list
    }

    fn min_valid_time(&self) -> Option<DateTime<Utc>> {
        self.reference_time
            .map(|t| t - seismic_types::secs(self.var_window))
    }

    /// Buffer one acceleration envelope value. `tick` is the envelope
    /// timestamp in playback mode or the wall clock otherwise.
    pub fn feed(&mut self, env: &EnvelopeResult, tick: DateTime<Utc>) {
        if env.unit != SignalUnit::MeterPerSecondSquared {
            warn!("unexpected envelope unit: {}", env.unit);
            return;
        }

        let wid = &env.waveform_id;
        let instrument = wid.instrument().to_string();
        let key = format!("{}.{}", wid.location_id(), instrument);

        if !self.stations.contains_key(&key) {
            let Some(loc) = self.inventory.sensor_location(&wid.net, &wid.sta, &wid.loc) else {
                warn!(
                    "{}.{}: no sensor location found for '{}': ignore envelope value",
                    wid.net, wid.sta, wid.loc
                );
                return;
            };
            let gain_unit = self
                .inventory
                .gain_unit_for_instrument(&wid.net, &wid.sta, &wid.loc, &instrument, env.timestamp)
                .unwrap_or_default()
                .to_string();

            self.insert_counter += 1;
            self.stations.insert(
                key.clone(),
                StationBuddy {
                    meta: StationMeta {
                        network: wid.net.clone(),
                        station: wid.sta.clone(),
                        location: wid.loc.clone(),
                        latitude: loc.latitude,
                        longitude: loc.longitude,
                        gain_unit,
                    },
                    pgas: Ring::new(seismic_types::secs(self.cfg.envelope_buffer_size)),
                    max_pga: None,
                    last_clipped: None,
                    inserted: self.insert_counter,
                },
            );
        }

        // The reference time is the global ticker; it never runs backwards.
        let reference_updated = match self.reference_time {
            Some(current) if tick <= current => false,
            _ => {
                self.reference_time = Some(tick);
                true
            }
        };
        let min_valid = self.min_valid_time().expect("reference time is set");

        let buddy = self.stations.get_mut(&key).expect("inserted above");
        if env.clipped {
            buddy.last_clipped = Some(match buddy.last_clipped {
                Some(prev) => prev.max(env.timestamp),
                None => env.timestamp,
            });
        }

        let amplitude = Amplitude {
            value: env.value,
            timestamp: env.timestamp,
            channel: wid.cha.clone(),
            clipped: env.clipped,
        };

        if buddy.pgas.feed(amplitude.clone()) {
            let stale_max = buddy
                .max_pga
                .as_ref()
                .map(|m| m.timestamp < min_valid)
                .unwrap_or(true);
            let new_max = buddy
                .max_pga
                .as_ref()
                .map(|m| amplitude.value >= m.value)
                .unwrap_or(true);
            if stale_max || amplitude.timestamp < min_valid || new_max {
                if buddy.update_maximum(min_valid) {
                    self.dirty = true;
                }
            }
        }

        // A new reference time can invalidate any station's maximum
        if reference_updated {
            for buddy in self.stations.values_mut() {
                if buddy
                    .max_pga
                    .as_ref()
                    .map(|m| m.timestamp >= min_valid)
                    .unwrap_or(false)
                {
                    continue;
                }
                if buddy.update_maximum(min_valid) {
                    self.dirty = true;
                }
            }
        }
    }

    /// Current station PGA list with all scan filters applied, values in
    /// cm/s².
    pub(crate) fn build_pga_list(&self) -> Vec<PgaData> {
        let Some(reference) = self.reference_time else {
            return Vec::new();
        };
        let stale_limit = reference - seismic_types::secs(self.cfg.max_envelope_buffer_delay);
        let clip_limit = reference - seismic_types::secs(self.cfg.clip_timeout);

        // One entry per sensor location; instrument conflicts resolved by
        // insertion recency.
        let mut chosen: HashMap<String, &StationBuddy> = HashMap::new();
        for buddy in self.stations.values() {
            let Some(back) = buddy.pgas.back() else {
                continue;
            };
            if back.timestamp < stale_limit {
                continue;
            }
            if back.clipped {
                continue;
            }
            if let Some(last_clipped) = buddy.last_clipped {
                if last_clipped > clip_limit {
                    continue;
                }
            }
            if !SignalUnit::is_acceleration(&buddy.meta.gain_unit) {
                continue;
            }
            if buddy.max_pga.is_none() {
                continue;
            }

            let loc_key = format!(
                "{}.{}.{}",
                buddy.meta.network, buddy.meta.station, buddy.meta.location
            );
            match chosen.get(&loc_key) {
                Some(existing) if existing.inserted >= buddy.inserted => {}
                _ => {
                    chosen.insert(loc_key, buddy);
                }
            }
        }

        let mut list: Vec<PgaData> = chosen
            .into_values()
            .map(|buddy| {
                let max = buddy.max_pga.as_ref().expect("filtered above");
                PgaData {
                    station: buddy.meta.station.clone(),
                    network: buddy.meta.network.clone(),
                    channel: max.channel.clone(),
                    location: PgaData::location_or_dashes(&buddy.meta.location),
                    latitude: buddy.meta.latitude,
                    longitude: buddy.meta.longitude,
                    value: max.value * 100.0,
                    timestamp: max.timestamp,
                }
            })
            .collect();
        list.sort_by(|a, b| (&a.network, &a.station).cmp(&(&b.network, &b.station)));
        list
    }

    /// Throttled scan/process pass, driven from the dispatcher's tick and
    /// after envelope feeds.
    pub fn tick(&mut self, now: DateTime<Utc>, out: &mut Vec<OriginBundle>) {
        let scan_due = self.dirty
            && self
                .last_scan
                .map(|t| now - t >= seismic_types::secs(self.cfg.scan_interval))
                .unwrap_or(true);
        let process_due = !self.finder_list.is_empty()
            && self
                .last_process
                .map(|t| now - t >= seismic_types::secs(self.cfg.process_interval))
                .unwrap_or(true);

        if !scan_due && !process_due {
            return;
        }

        let pga_list = self.build_pga_list();

        let events_before = self.finder_list.len();
        if scan_due {
            self.last_scan = Some(now);
            self.dirty = false;
            self.scan(now, &pga_list);
        }
        let created = self.finder_list.len() > events_before;

        if process_due || created {
            self.last_process = Some(now);
            self.process(&pga_list, out);
        }
    }

    fn scan(&mut self, now: DateTime<Utc>, pga_list: &[PgaData]) {
        let Some(algorithm) = self.algorithm.as_mut() else {
            for pga in pga_list {
                debug!(
                    "+ {}.{}.{}.{}   {}   {:.4}",
                    pga.network, pga.station, pga.location, pga.channel, pga.timestamp, pga.value
                );
            }
            return;
        };

        let coordinates = match algorithm.scan(pga_list, &self.finder_list) {
            Ok(c) => c,
            Err(e) => {
                error!("exception from FinDer: {e}");
                return;
            }
        };

        for epicenter in coordinates {
            // Event ids are seeded from Unix time but strictly monotonic
            let mut event_id = now.timestamp();
            if event_id <= self.last_event_id {
                event_id = self.last_event_id + 1;
            }
            self.last_event_id = event_id;

            self.finder_list
                .push(FinderEvent::new(event_id, epicenter, now));
        }
    }

    fn process(&mut self, pga_list: &[PgaData], out: &mut Vec<OriginBundle>) {
        let Some(algorithm) = self.algorithm.as_mut() else {
            return;
        };
        let tick = self.reference_time.unwrap_or_default();

        let mut kept = Vec::with_capacity(self.finder_list.len());
        for mut event in self.finder_list.drain(..) {
            if let Err(e) = algorithm.process(&mut event, tick, pga_list) {
                error!("exception from FinDer::process: {e}");
            }

            if event.message && !event.length_pdf.is_empty() {
                out.push(build_bundle(&event));
            }

            if event.hold_object {
                kept.push(event);
            }
        }
        self.finder_list = kept;

        // Adaptive window: widen with the longest active rupture, fall back
        // to the default once no event remains.
        if self.finder_list.is_empty() {
            self.var_window = self.cfg.default_envelope_length;
        } else {
            let longest = self
                .finder_list
                .iter()
                .map(|e| e.rupture_length)
                .fold(0.0, f64::max);
            self.var_window = self
                .var_window
                .max(self.cfg.rupture_window_scale * longest)
                .min(self.cfg.envelope_buffer_size);
        }
    }
}

fn build_bundle(event: &FinderEvent) -> OriginBundle {
    let (km_per_deg_lat, km_per_deg_lon) = wgs84_km_per_degree(event.epicenter.latitude);

    OriginBundle {
        event_id: event.event_id,
        origin: BundleOrigin {
            method: "FinDer".to_string(),
            latitude: event.epicenter.latitude,
            latitude_uncertainty_km: event.epicenter_uncertainty.latitude * km_per_deg_lat,
            longitude: event.epicenter.longitude,
            longitude_uncertainty_km: event.epicenter_uncertainty.longitude * km_per_deg_lon,
            depth: event.depth,
            time: event.origin_time,
            evaluation_mode: "automatic".to_string(),
            quality: OriginQuality {
                used_station_count: event.stations_used,
                used_phase_count: event.pga_above_threshold.len(),
            },
            likelihood: event.likelihood,
        },
        magnitudes: vec![
            BundleMagnitude {
                kind: "Mfd".to_string(),
                value: event.magnitude,
                uncertainty: Some(event.magnitude_uncertainty),
            },
            BundleMagnitude {
                kind: "Mfdr".to_string(),
                value: event.magnitude_regression,
                uncertainty: None,
            },
            BundleMagnitude {
                kind: "Mfdl".to_string(),
                value: event.magnitude_rupture_length,
                uncertainty: None,
            },
        ],
        rupture: BundleRupture {
            length_pdf: event.length_pdf.clone(),
            width: event.rupture_width,
            geometry_wkt: polygon_wkt(&event.rupture_polygon),
            strike_pdf: event.strike_pdf.clone(),
        },
        centroid: BundleCentroid {
            latitude_pdf: event.latitude_pdf.clone(),
            longitude_pdf: event.longitude_pdf.clone(),
        },
        station_pga: event.pga_above_threshold.clone(),
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FinderConfig;
    use crate::inventory::tests::sample_inventory;
    use crate::processors::{ComponentKind, EnvelopeResult};
    use seismic_types::StreamId;
    use std::sync::Mutex;

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn env(cha: &str, time: &str, value: f64, clipped: bool) -> EnvelopeResult {
        EnvelopeResult {
            waveform_id: StreamId::new("CH", "HASLI", "", cha),
            component: ComponentKind::Vertical,
            unit: SignalUnit::MeterPerSecondSquared,
            value,
            timestamp: t(time),
            clipped,
        }
    }

    fn driver(algo: Option<Box<dyn FinderAlgorithm>>) -> FinderDriver {
        FinderDriver::new(FinderConfig::default(), Arc::new(sample_inventory()), algo).unwrap()
    }

    /// Scripted behavior of the mock algorithm, shared with the test body so
    /// it can be changed between ticks.
    struct MockScript {
        /// Coordinates to return on the next scan call.
        pending: Vec<Coordinate>,
        /// Rupture length installed into processed events.
        rupture_length: f64,
        message: bool,
        hold: bool,
        seen_pga: Vec<Vec<PgaData>>,
        init_stations: Vec<StationCoordinate>,
    }

    /// Scripted stand-in for the external library.
    struct MockFinder {
        script: Arc<Mutex<MockScript>>,
    }

    fn mock(pending: Vec<Coordinate>, rupture_length: f64, message: bool, hold: bool)
        -> (Arc<Mutex<MockScript>>, Box<dyn FinderAlgorithm>) {
        let script = Arc::new(Mutex::new(MockScript {
            pending,
            rupture_length,
            message,
            hold,
            seen_pga: Vec::new(),
            init_stations: Vec::new(),
        }));
        (
            script.clone(),
            Box::new(MockFinder { script }) as Box<dyn FinderAlgorithm>,
        )
    }

    impl FinderAlgorithm for MockFinder {
        fn init(&mut self, stations: &[StationCoordinate]) -> Result<(), FinderError> {
            self.script.lock().unwrap().init_stations = stations.to_vec();
            Ok(())
        }

        fn scan(
            &mut self,
            pga: &[PgaData],
            _active: &[FinderEvent],
        ) -> Result<Vec<Coordinate>, FinderError> {
            let mut script = self.script.lock().unwrap();
            script.seen_pga.push(pga.to_vec());
            let pending = std::mem::take(&mut script.pending);
            Ok(pending)
        }

        fn process(
            &mut self,
            event: &mut FinderEvent,
            _tick: DateTime<Utc>,
            pga: &[PgaData],
        ) -> Result<(), FinderError> {
            let script = self.script.lock().unwrap();
            event.rupture_length = script.rupture_length;
            event.magnitude = 6.1;
            event.magnitude_uncertainty = 0.3;
            event.stations_used = pga.len();
            event.likelihood = 0.8;
            event.length_pdf = vec![PdfPoint {
                value: script.rupture_length,
                probability: 1.0,
            }];
            event.rupture_polygon = vec![
                (46.0, 8.0, 0.0),
                (46.1, 8.0, 0.0),
                (46.1, 8.2, 10.0),
            ];
            event.message = script.message;
            event.hold_object = script.hold;
            Ok(())
        }
    }

    #[test]
    fn velocimetric_stations_are_gated_out() {
        // HH* carries gain unit M/S, HG* carries m/s**2: only the
        // accelerometer may appear in the scan list, converted to cm/s².
        let mut d = driver(None);
        d.feed(&env("HHZ", "2020-01-01T00:00:01Z", 0.02, false), t("2020-01-01T00:00:01Z"));
        d.feed(&env("HGZ", "2020-01-01T00:00:01Z", 0.03, false), t("2020-01-01T00:00:01Z"));

        let list = d.build_pga_list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].channel, "HGZ");
        assert!((list[0].value - 3.0).abs() < 1e-12);
        assert_eq!(list[0].location, "--");
    }

    #[test]
    fn clipped_stations_are_held_back() {
        let mut d = driver(None);
        d.feed(&env("HGZ", "2020-01-01T00:00:01Z", 0.03, true), t("2020-01-01T00:00:01Z"));
        assert!(d.build_pga_list().is_empty());

        // A clean value arrives, but the clip timeout still vetoes the station
        d.feed(&env("HGZ", "2020-01-01T00:00:05Z", 0.02, false), t("2020-01-01T00:00:05Z"));
        assert!(d.build_pga_list().is_empty());

        // After the clip timeout the station comes back
        d.feed(&env("HGZ", "2020-01-01T00:00:40Z", 0.02, false), t("2020-01-01T00:00:40Z"));
        assert_eq!(d.build_pga_list().len(), 1);
    }

    #[test]
    fn stale_stations_drop_out_of_the_list() {
        let mut d = driver(None);
        d.feed(&env("HGZ", "2020-01-01T00:00:01Z", 0.03, false), t("2020-01-01T00:00:01Z"));
        assert_eq!(d.build_pga_list().len(), 1);

        // Playback tick far ahead of the latest sample: the station's newest
        // envelope is older than the buffer-delay limit and drops out.
        d.feed(&env("HGZ", "2020-01-01T00:00:02Z", 0.01, false), t("2020-01-01T00:00:30Z"));
        assert!(d.build_pga_list().is_empty());
    }

    #[test]
    fn maximum_tracks_the_adaptive_window() {
        let mut d = driver(None);
        d.feed(&env("HGZ", "2020-01-01T00:00:00Z", 0.5, false), t("2020-01-01T00:00:00Z"));
        d.feed(&env("HGZ", "2020-01-01T00:00:01Z", 0.1, false), t("2020-01-01T00:00:01Z"));
        let list = d.build_pga_list();
        assert!((list[0].value - 50.0).abs() < 1e-9);

        // Reference time advances beyond the old peak's window: the maximum
        // falls back to the newer, smaller value.
        d.feed(
            &env("HGZ", "2020-01-01T00:01:30Z", 0.2, false),
            t("2020-01-01T00:01:30Z"),
        );
        let list = d.build_pga_list();
        assert!((list[0].value - 20.0).abs() < 1e-9);
    }

    #[test]
    fn event_ids_are_strictly_monotonic() {
        let (script, algo) = mock(
            vec![
                Coordinate {
                    latitude: 46.0,
                    longitude: 8.0,
                },
                Coordinate {
                    latitude: 46.5,
                    longitude: 8.5,
                },
            ],
            10.0,
            false,
            true,
        );
        let mut d = driver(Some(algo));

        // The driver initialized the algorithm with the inventory coordinates
        assert_eq!(script.lock().unwrap().init_stations.len(), 1);
        assert_eq!(script.lock().unwrap().init_stations[0].station, "HASLI");

        d.feed(&env("HGZ", "2020-01-01T00:00:01Z", 0.03, false), t("2020-01-01T00:00:01Z"));
        let mut out = Vec::new();
        d.tick(t("2020-01-01T00:00:01Z"), &mut out);

        let events = d.active_events();
        assert_eq!(events.len(), 2);
        assert!(events[1].event_id > events[0].event_id);
        // Seeded from Unix time of the tick
        assert_eq!(events[0].event_id, t("2020-01-01T00:00:01Z").timestamp());
        // The scan saw the assembled PGA list
        assert_eq!(script.lock().unwrap().seen_pga.len(), 1);
        assert_eq!(script.lock().unwrap().seen_pga[0].len(), 1);
    }

    #[test]
    fn adaptive_window_widens_and_recovers() {
        let (script, algo) = mock(
            vec![Coordinate {
                latitude: 46.0,
                longitude: 8.0,
            }],
            150.0,
            false,
            true,
        );
        let mut d = driver(Some(algo));
        assert_eq!(d.var_window_secs(), 60.0);

        d.feed(&env("HGZ", "2020-01-01T00:00:01Z", 0.03, false), t("2020-01-01T00:00:01Z"));
        let mut out = Vec::new();
        d.tick(t("2020-01-01T00:00:01Z"), &mut out);

        // 1.5 × 150 = 225, capped at the 120 s buffer length
        assert_eq!(d.var_window_secs(), 120.0);

        // The algorithm releases the event: the window falls back
        script.lock().unwrap().hold = false;
        d.feed(&env("HGZ", "2020-01-01T00:00:03Z", 0.05, false), t("2020-01-01T00:00:03Z"));
        d.tick(t("2020-01-01T00:00:03Z"), &mut out);
        assert!(d.active_events().is_empty());
        assert_eq!(d.var_window_secs(), 60.0);
    }

    #[test]
    fn message_flag_emits_an_origin_bundle() {
        let (_script, algo) = mock(
            vec![Coordinate {
                latitude: 46.0,
                longitude: 8.0,
            }],
            30.0,
            true,
            true,
        );
        let mut d = driver(Some(algo));

        d.feed(&env("HGZ", "2020-01-01T00:00:01Z", 0.03, false), t("2020-01-01T00:00:01Z"));
        let mut out = Vec::new();
        d.tick(t("2020-01-01T00:00:01Z"), &mut out);

        assert_eq!(out.len(), 1);
        let bundle = &out[0];
        assert_eq!(bundle.origin.method, "FinDer");
        assert_eq!(bundle.origin.evaluation_mode, "automatic");
        assert_eq!(bundle.magnitudes.len(), 3);
        assert_eq!(bundle.magnitudes[0].kind, "Mfd");
        assert_eq!(bundle.magnitudes[0].value, 6.1);
        assert!(bundle.rupture.geometry_wkt.starts_with("POLYGON Z (("));
        // The WKT ring is closed
        assert!(bundle.rupture.geometry_wkt.ends_with("8 46 0))"));
    }

    #[test]
    fn wgs84_arc_lengths_are_sane() {
        let (lat_km, lon_km) = wgs84_km_per_degree(0.0);
        assert!((lat_km - 110.574).abs() < 0.01);
        assert!((lon_km - 111.320).abs() < 0.01);

        let (lat_km, lon_km) = wgs84_km_per_degree(60.0);
        assert!((lat_km - 111.412).abs() < 0.1);
        assert!((lon_km - 55.8).abs() < 0.1);
    }
}
