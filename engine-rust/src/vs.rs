//! Envelope timeline for the VS magnitude path.
//!
//! Envelope messages are binned into a per-station grid of one-second cells
//! around a moving reference time (`past` slots behind, `future` slots
//! ahead). Each sensor of a station keeps its own row; every cell stores the
//! vertical and combined-horizontal amplitudes per signal kind plus a clipped
//! flag. The windowed-maximum query behind the station magnitude lives here;
//! the magnitude formula itself is external and only its likelihood-weighted
//! aggregation seam is kept.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use seismic_types::{EnvelopeMessage, ValueKind, ValueQuality};
use tracing::debug;

// ── Cells ────────────────────────────────────────────────────────────────────

/// Amplitudes of one component within one one-second slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct CellComponent {
    pub acc: Option<f64>,
    pub vel: Option<f64>,
    pub disp: Option<f64>,
    pub clipped: bool,
}

impl CellComponent {
    fn store(&mut self, kind: ValueKind, value: f64, clipped: bool) {
        let slot = match kind {
            ValueKind::Acc => &mut self.acc,
            ValueKind::Vel => &mut self.vel,
            ValueKind::Disp => &mut self.disp,
        };
        *slot = Some(slot.map_or(value, |v| v.max(value)));
        self.clipped |= clipped;
    }

    fn has_data(&self) -> bool {
        self.acc.is_some() || self.vel.is_some() || self.disp.is_some()
    }

    /// Primary amplitude used for ranking: acceleration when present,
    /// velocity otherwise, displacement as a last resort.
    fn ranking_value(&self) -> Option<f64> {
        self.acc.or(self.vel).or(self.disp)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Cell {
    vertical: CellComponent,
    horizontal: CellComponent,
}

/// One row of slots for one sensor (location + instrument) of a station.
struct SensorRow {
    location_code: String,
    /// Channel code without the component letter, e.g. "HH".
    stream_code: String,
    cells: Vec<Cell>,
}

// ── Status codes ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineStatus {
    Ok,
    ClippedData,
    NotEnoughData,
    NoData,
    IndexError,
}

/// Result of a windowed-maximum query.
#[derive(Debug, Clone)]
pub struct StationMaxima {
    pub vertical: CellComponent,
    pub vertical_time: DateTime<Utc>,
    pub horizontal: CellComponent,
    pub horizontal_time: DateTime<Utc>,
    pub location_code: String,
    pub stream_code: String,
}

// ── Timeline ─────────────────────────────────────────────────────────────────

pub struct Timeline {
    /// (network, station) → sensor rows.
    stations: HashMap<(String, String), Vec<SensorRow>>,
    reference_time: Option<DateTime<Utc>>,
    past: i64,
    future: i64,
    clip_timeout: Duration,
}

impl Timeline {
    pub fn new(past: i64, future: i64, clip_timeout_secs: f64) -> Self {
        Self {
            stations: HashMap::new(),
            reference_time: None,
            past,
            future,
            clip_timeout: seismic_types::secs(clip_timeout_secs),
        }
    }

    fn slots(&self) -> usize {
        (self.past + self.future) as usize
    }

    pub fn reference_time(&self) -> Option<DateTime<Utc>> {
        self.reference_time
    }

    /// Slot index of `time` relative to the current window, or None when the
    /// reference time is unset.
    fn slot_index(&self, time: DateTime<Utc>) -> Option<i64> {
        let reference = self.reference_time?;
        let window_start = reference - Duration::seconds(self.past);
        Some((time - window_start).num_seconds())
    }

    /// Move the reference time forward, shifting every row. Moving backwards
    /// is refused.
    pub fn set_reference_time(&mut self, reference: DateTime<Utc>) -> bool {
        // Slot-align to whole seconds
        let reference = seismic_types::time_from_micros(
            reference.timestamp_micros() / 1_000_000 * 1_000_000,
        );

        let Some(current) = self.reference_time else {
            self.reference_time = Some(reference);
            return true;
        };
        if reference < current {
            return false;
        }
        let shift = (reference - current).num_seconds() as usize;
        if shift == 0 {
            return true;
        }

        let slots = self.slots();
        for rows in self.stations.values_mut() {
            for row in rows.iter_mut() {
                if shift >= slots {
                    row.cells.iter_mut().for_each(|c| *c = Cell::default());
                } else {
                    row.cells.rotate_left(shift);
                    let keep = slots - shift;
                    for cell in row.cells[keep..].iter_mut() {
                        *cell = Cell::default();
                    }
                }
            }
        }

        self.reference_time = Some(reference);
        true
    }

    /// Same as `set_reference_time(reference_time() + secs)`.
    pub fn step(&mut self, secs: i64) -> bool {
        match self.reference_time {
            Some(t) => self.set_reference_time(t + Duration::seconds(secs)),
            None => false,
        }
    }

    /// Bin one envelope message into the grid. Returns false when the
    /// timestamp falls outside the buffer window.
    pub fn feed(&mut self, msg: &EnvelopeMessage) -> bool {
        if self.reference_time.is_none() {
            self.set_reference_time(msg.timestamp);
        }

        let Some(index) = self.slot_index(msg.timestamp) else {
            return false;
        };
        if index < 0 || index >= self.slots() as i64 {
            debug!(
                "{}.{}: envelope at {} outside timeline window",
                msg.network, msg.station, msg.timestamp
            );
            return false;
        }
        let index = index as usize;
        let slots = self.slots();

        let key = (msg.network.clone(), msg.station.clone());
        let rows = self.stations.entry(key).or_default();

        for channel in &msg.channels {
            let location_code = channel.waveform_id.loc.clone();
            let stream_code = channel.waveform_id.instrument().to_string();

            let row = match rows
                .iter_mut()
                .position(|r| r.location_code == location_code && r.stream_code == stream_code)
            {
                Some(i) => &mut rows[i],
                None => {
                    rows.push(SensorRow {
                        location_code,
                        stream_code,
                        cells: vec![Cell::default(); slots],
                    });
                    rows.last_mut().expect("just pushed")
                }
            };

            let cell = &mut row.cells[index];
            let component = match channel.name.as_str() {
                "V" => &mut cell.vertical,
                _ => &mut cell.horizontal,
            };
            for value in &channel.values {
                component.store(
                    value.kind,
                    value.value,
                    value.quality == Some(ValueQuality::Clipped),
                );
            }
        }

        true
    }

    /// Maximum vertical and horizontal envelopes of a station within
    /// `[start, end]`.
    pub fn maximum(
        &self,
        network: &str,
        station: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        pick_time: DateTime<Utc>,
    ) -> Result<StationMaxima, TimelineStatus> {
        let Some(rows) = self
            .stations
            .get(&(network.to_string(), station.to_string()))
        else {
            return Err(TimelineStatus::NoData);
        };

        let (Some(first), Some(last)) = (self.slot_index(start), self.slot_index(end)) else {
            return Err(TimelineStatus::NoData);
        };
        if first < 0 || last >= self.slots() as i64 || first > last {
            return Err(TimelineStatus::IndexError);
        }
        let window_start = self.reference_time.expect("slot index exists")
            - Duration::seconds(self.past);

        let mut best: Option<StationMaxima> = None;
        let mut clipped = false;
        let mut any_cells = false;

        for row in rows {
            let mut vertical: Option<(CellComponent, DateTime<Utc>)> = None;
            let mut horizontal: Option<(CellComponent, DateTime<Utc>)> = None;
            let mut filled = 0usize;

            for index in first..=last {
                let cell = &row.cells[index as usize];
                let slot_time = window_start + Duration::seconds(index);

                for (component, slot) in [
                    (&cell.vertical, &mut vertical),
                    (&cell.horizontal, &mut horizontal),
                ] {
                    if !component.has_data() {
                        continue;
                    }
                    any_cells = true;

                    // A clip inside the timeout before the pick gates the
                    // whole station
                    if component.clipped && pick_time - slot_time <= self.clip_timeout {
                        clipped = true;
                    }

                    let better = match &slot {
                        Some((current, _)) => {
                            component.ranking_value() > current.ranking_value()
                        }
                        None => true,
                    };
                    if better {
                        *slot = Some((*component, slot_time));
                    }
                }
                if cell.vertical.has_data() || cell.horizontal.has_data() {
                    filled += 1;
                }
            }

            if let (Some((v, vt)), Some((h, ht))) = (vertical, horizontal) {
                // Require the window to be essentially covered
                if filled * 2 < (last - first + 1) as usize {
                    continue;
                }
                let candidate = StationMaxima {
                    vertical: v,
                    vertical_time: vt,
                    horizontal: h,
                    horizontal_time: ht,
                    location_code: row.location_code.clone(),
                    stream_code: row.stream_code.clone(),
                };
                let better = match &best {
                    Some(b) => {
                        candidate.vertical.ranking_value() > b.vertical.ranking_value()
                    }
                    None => true,
                };
                if better {
                    best = Some(candidate);
                }
            }
        }

        match best {
            Some(_) if clipped => Err(TimelineStatus::ClippedData),
            Some(maxima) => Ok(maxima),
            None if any_cells => Err(TimelineStatus::NotEnoughData),
            None => Err(TimelineStatus::NoData),
        }
    }

    pub fn stream_count(&self) -> usize {
        self.stations.values().map(|rows| rows.len()).sum()
    }
}

// ── Magnitude aggregation ────────────────────────────────────────────────────

/// One station's contribution to an event magnitude.
#[derive(Debug, Clone)]
pub struct StationContribution {
    pub network: String,
    pub station: String,
    pub magnitude: f64,
    pub likelihood: f64,
}

/// Likelihood-weighted aggregation of station magnitudes. The single-station
/// magnitude and likelihood come from the external VS computation.
#[derive(Debug, Default)]
pub struct EventMagnitude {
    contributions: Vec<StationContribution>,
}

impl EventMagnitude {
    /// Insert or replace one station's contribution.
    pub fn update(&mut self, contribution: StationContribution) {
        match self.contributions.iter_mut().find(|c| {
            c.network == contribution.network && c.station == contribution.station
        }) {
            Some(existing) => *existing = contribution,
            None => self.contributions.push(contribution),
        }
    }

    pub fn station_count(&self) -> usize {
        self.contributions.len()
    }

    /// Likelihood-weighted mean magnitude, None without contributions.
    pub fn magnitude(&self) -> Option<f64> {
        let weight: f64 = self.contributions.iter().map(|c| c.likelihood).sum();
        if weight <= 0.0 {
            return None;
        }
        Some(
            self.contributions
                .iter()
                .map(|c| c.magnitude * c.likelihood)
                .sum::<f64>()
                / weight,
        )
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
