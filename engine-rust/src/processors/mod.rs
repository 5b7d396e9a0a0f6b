//! Algorithm processors fed by the routing layer.
//!
//! Every processor owns a small `StreamState` (sampling frequency, gap
//! tolerance, optional leading filter) instead of inheriting it; the routing
//! processor dispatches over the `AlgoProcessor` variants.

pub mod envelope;
pub mod filterbank;
pub mod onsite;

use chrono::{DateTime, Utc};
use seismic_types::{Pick, Record, StreamId, ValueKind};
use tracing::{info, warn};

use crate::filters::StreamFilter;

pub use envelope::EnvelopeProcessor;
pub use filterbank::FilterBankProcessor;
pub use onsite::OnsiteProcessor;

// ── Signal units ─────────────────────────────────────────────────────────────

/// Physical unit of a conditioned signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalUnit {
    Meter,
    MeterPerSecond,
    MeterPerSecondSquared,
}

impl SignalUnit {
    /// Parse an inventory gain unit string. Accepts the spellings seen in
    /// real metadata: `M/S`, `m/s`, `M/S**2`, `m/s**2`, `M/S/S`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "M" => Some(Self::Meter),
            "M/S" => Some(Self::MeterPerSecond),
            "M/S**2" | "M/S/S" | "M/S2" => Some(Self::MeterPerSecondSquared),
            _ => None,
        }
    }

    /// True for accelerometric units (the FinDer station gate).
    pub fn is_acceleration(s: &str) -> bool {
        matches!(Self::parse(s), Some(Self::MeterPerSecondSquared))
    }

    pub fn value_kind(&self) -> ValueKind {
        match self {
            Self::Meter => ValueKind::Disp,
            Self::MeterPerSecond => ValueKind::Vel,
            Self::MeterPerSecondSquared => ValueKind::Acc,
        }
    }

    /// Synthetic location code used when dumping envelope values.
    pub fn envelope_location_code(&self) -> &'static str {
        match self {
            Self::Meter => "ED",
            Self::MeterPerSecond => "EV",
            Self::MeterPerSecondSquared => "EA",
        }
    }
}

impl std::fmt::Display for SignalUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Meter => "M",
            Self::MeterPerSecond => "M/S",
            Self::MeterPerSecondSquared => "M/S**2",
        };
        f.write_str(s)
    }
}

/// Which component a processor consumes: the vertical channel or the combined
/// horizontal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Vertical,
    Horizontal,
}

// ── Published outputs ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EnvelopeResult {
    pub waveform_id: StreamId,
    pub component: ComponentKind,
    pub unit: SignalUnit,
    pub value: f64,
    /// End of the aggregation interval.
    pub timestamp: DateTime<Utc>,
    pub clipped: bool,
}

#[derive(Debug, Clone)]
pub struct FilterBankResult {
    pub waveform_id: StreamId,
    pub pick_id: String,
    /// Running peak per passband, in passband order.
    pub amplitudes: Vec<f64>,
    pub peak_time: Option<DateTime<Utc>>,
    pub window_start: DateTime<Utc>,
    pub window_end: Option<DateTime<Utc>>,
    pub clipped: bool,
}

#[derive(Debug, Clone)]
pub struct TauPResult {
    pub waveform_id: StreamId,
    pub pick_id: String,
    pub peak_time: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: Option<DateTime<Utc>>,
    pub tau_p: f64,
    pub clipped: bool,
}

#[derive(Debug, Clone)]
pub struct TauCPdResult {
    pub waveform_id: StreamId,
    pub pick_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub tau_c: f64,
    pub pd: f64,
    pub clipped: bool,
}

/// Everything the pipeline publishes during one feed pass. The dispatcher
/// drains this after every packet.
#[derive(Debug, Clone)]
pub enum Output {
    Envelope(EnvelopeResult),
    FilterBank(FilterBankResult),
    TauP(TauPResult),
    TauCPd(TauCPdResult),
    /// Intermediate record for the `--dump` debug surface.
    Dump(Record),
}

// ── Stream state ─────────────────────────────────────────────────────────────

/// Continuity classification of an incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    /// Very first record; stream parameters were bound.
    First,
    /// Re-initialized after a gap or sampling-rate change; buffered state is
    /// stale.
    Reset,
    Continuous,
}

impl Continuity {
    /// True when stream parameters were (re)bound this call.
    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::First | Self::Reset)
    }
}

/// Composed per-stream state: sampling frequency, gap tolerance of half a
/// sample period, last end time and an optional leading filter.
pub struct StreamState {
    label: &'static str,
    pub fsamp: f64,
    pub initialized: bool,
    was_reset: bool,
    last_end: Option<DateTime<Utc>>,
    filter: Option<Box<dyn StreamFilter>>,
}

impl StreamState {
    pub fn new(label: &'static str, filter: Option<Box<dyn StreamFilter>>) -> Self {
        Self {
            label,
            fsamp: 0.0,
            initialized: false,
            was_reset: false,
            last_end: None,
            filter,
        }
    }

    pub fn gap_tolerance(&self) -> f64 {
        0.5 / self.fsamp
    }

    /// Classify `rec` against the stream state, resetting on sampling-rate
    /// changes and gaps beyond half a sample period.
    pub fn check(&mut self, rec: &Record) -> Continuity {
        if self.initialized {
            if rec.fsamp != self.fsamp {
                info!(
                    "{}: mismatching sampling frequency ({} != {}): reset",
                    rec.id, self.fsamp, rec.fsamp
                );
                self.reset();
            } else if let Some(last_end) = self.last_end {
                let diff = (rec.start - last_end).num_microseconds().unwrap_or(i64::MAX) as f64
                    / 1e6;
                if diff.abs() > self.gap_tolerance() {
                    warn!(
                        "{}: detected gap of {:.6}s: reset processing",
                        rec.id, diff
                    );
                    self.reset();
                }
            }
        }

        let continuity = if self.initialized {
            Continuity::Continuous
        } else {
            info!("{}: initializing {} processor", rec.id, self.label);
            self.fsamp = rec.fsamp;
            if let Some(f) = &mut self.filter {
                f.init(rec.fsamp);
            }
            self.initialized = true;
            if self.was_reset {
                Continuity::Reset
            } else {
                Continuity::First
            }
        };

        self.last_end = Some(rec.end_time());
        continuity
    }

    /// Run the leading filter (when configured) over a sample buffer.
    pub fn apply_filter(&mut self, data: &mut [f64]) {
        if let Some(f) = &mut self.filter {
            f.apply(data);
        }
    }

    pub fn reset(&mut self) {
        self.initialized = false;
        self.was_reset = true;
        self.fsamp = 0.0;
        self.last_end = None;
        if let Some(f) = &mut self.filter {
            f.reset();
        }
    }
}

// ── Processor dispatch ───────────────────────────────────────────────────────

/// Tagged variant held by the routing processor; replaces the polymorphic
/// processor hierarchy of a shared-base design.
pub enum AlgoProcessor {
    Envelope(EnvelopeProcessor),
    FilterBank(FilterBankProcessor),
    Onsite(OnsiteProcessor),
}

impl AlgoProcessor {
    pub fn feed_record(&mut self, rec: &Record, now: DateTime<Utc>, out: &mut Vec<Output>) {
        match self {
            Self::Envelope(p) => p.feed_record(rec, out),
            Self::FilterBank(p) => p.feed_record(rec, now, out),
            Self::Onsite(p) => p.feed_record(rec, now, out),
        }
    }

    pub fn feed_pick(&mut self, pick: &Pick, now: DateTime<Utc>, out: &mut Vec<Output>) -> bool {
        match self {
            Self::Envelope(_) => false,
            Self::FilterBank(p) => p.feed_pick(pick, now, out),
            Self::Onsite(p) => p.feed_pick(pick, now, out),
        }
    }

    pub fn reset(&mut self) {
        match self {
            Self::Envelope(p) => p.reset(),
            Self::FilterBank(p) => p.reset(),
            Self::Onsite(p) => p.reset(),
        }
    }
}
