//! Gain removal, saturation detection and baseline correction.
//!
//! `GainBaselineCorrector` conditions the raw count stream of a single
//! channel: it resolves the response epoch from the inventory, flags samples
//! above the saturation threshold, divides by the gain, subtracts a running
//! mean baseline and optionally applies the initial taper. Streams without
//! usable metadata are dropped silently (with a warning) — record-level
//! failures never escape the pipeline.
//!
//! `Demux` gives every stream id its own corrector instance, cloned lazily
//! from the configured template so each stream keeps independent filter state
//! and its own epoch cache.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use seismic_types::{ClipMask, RawRecord, Record, StreamId};
use tracing::{debug, warn};

use crate::filters::{CosineTaper, RunningMean, StreamFilter};
use crate::inventory::Inventory;

#[derive(Debug, Clone, Copy)]
pub struct GainSettings {
    /// Absolute threshold in raw counts; zero or negative disables the check.
    pub saturation_threshold: f64,
    /// Running-mean baseline window, seconds.
    pub baseline_length: f64,
    /// Initial taper ramp, seconds. Zero disables the taper.
    pub taper_length: f64,
}

pub struct GainBaselineCorrector {
    inventory: Arc<Inventory>,
    settings: GainSettings,
    baseline: RunningMean,
    taper: CosineTaper,
    /// 1/gain of the cached epoch; 0.0 caches an epoch without a usable gain.
    gain_factor: f64,
    epoch_start: Option<DateTime<Utc>>,
    epoch_end: Option<DateTime<Utc>>,
    fsamp: f64,
    last_end: Option<DateTime<Utc>>,
}

impl GainBaselineCorrector {
    pub fn new(inventory: Arc<Inventory>, settings: GainSettings) -> Self {
        Self {
            inventory,
            settings,
            baseline: RunningMean::new(settings.baseline_length),
            taper: CosineTaper::new(settings.taper_length),
            gain_factor: 0.0,
            epoch_start: None,
            epoch_end: None,
            fsamp: -1.0,
            last_end: None,
        }
    }

    /// Fresh corrector with the same settings and no accumulated state.
    pub fn fork(&self) -> Self {
        Self::new(self.inventory.clone(), self.settings)
    }

    pub fn reset(&mut self) {
        self.gain_factor = 0.0;
        self.epoch_start = None;
        self.epoch_end = None;
        self.last_end = None;
        self.baseline.reset();
        self.taper.reset();
    }

    fn epoch_covers(&self, rec: &RawRecord) -> bool {
        let Some(start) = self.epoch_start else {
            return false;
        };
        if rec.end_time() <= start {
            return false;
        }
        if let Some(end) = self.epoch_end {
            if rec.start >= end {
                return false;
            }
        }
        true
    }

    fn query_epoch(&mut self, rec: &RawRecord) -> bool {
        debug!("[{}] query inventory", rec.id);

        let Some(epoch) = self.inventory.epoch(&rec.id, rec.start) else {
            warn!(
                "[{}] no metadata found for data starting at {}: discarded",
                rec.id, rec.start
            );
            return false;
        };

        self.epoch_start = Some(epoch.start);
        self.epoch_end = epoch.end;

        match epoch.gain {
            Some(gain) if gain != 0.0 => {
                self.gain_factor = 1.0 / gain;
                true
            }
            _ => {
                warn!(
                    "[{}] no gain set for epoch starting at {}",
                    rec.id, epoch.start
                );
                self.gain_factor = 0.0;
                false
            }
        }
    }

    /// Condition one raw record. Returns None when the record has to be
    /// dropped (no metadata, no gain, empty payload).
    pub fn feed(&mut self, rec: &RawRecord) -> Option<Record> {
        if !self.epoch_covers(rec) && !self.query_epoch(rec) {
            return None;
        }

        // Cached epoch without a gain
        if self.gain_factor == 0.0 {
            return None;
        }

        if rec.counts.is_empty() {
            return None;
        }

        let mut data: Vec<f64> = rec.counts.iter().map(|c| *c as f64).collect();

        // Saturation check against the raw counts
        let mut clip_mask: Option<ClipMask> = None;
        if self.settings.saturation_threshold > 0.0 {
            for (i, v) in data.iter().enumerate() {
                if v.abs() > self.settings.saturation_threshold {
                    clip_mask
                        .get_or_insert_with(|| ClipMask::new(data.len()))
                        .set(i, true);
                }
            }
        }
        if let Some(mask) = &clip_mask {
            debug!("[{}] set clip mask: clipped = {}", rec.id, mask.count_ones());
        }

        for v in data.iter_mut() {
            *v *= self.gain_factor;
        }

        // Continuity: a sampling rate change or a gap/overlap beyond half a
        // sample period invalidates the filter state.
        if self.last_end.is_some() {
            if self.fsamp != rec.fsamp {
                warn!(
                    "[{}] sps change ({} != {}): reset filter",
                    rec.id, self.fsamp, rec.fsamp
                );
                self.baseline.reset();
                self.taper.reset();
                self.last_end = None;
            } else {
                let diff = (rec.start - self.last_end.unwrap())
                    .num_microseconds()
                    .unwrap_or(i64::MAX) as f64
                    / 1e6;
                if diff.abs() > 0.5 / self.fsamp {
                    debug!("[{}] discontinuity of {diff}s: reset filter", rec.id);
                    self.baseline.reset();
                    self.taper.reset();
                    self.last_end = None;
                }
            }
        }

        if self.last_end.is_none() {
            self.fsamp = rec.fsamp;
            self.baseline.init(self.fsamp);
            self.taper.init(self.fsamp);
        }

        // Remove the running average, sample by sample
        for v in data.iter_mut() {
            let mut mean = [*v];
            self.baseline.apply(&mut mean);
            *v -= mean[0];
        }

        if self.settings.taper_length > 0.0 {
            self.taper.apply(&mut data);
        }

        self.last_end = Some(rec.end_time());

        Some(Record {
            id: rec.id.clone(),
            start: rec.start,
            fsamp: rec.fsamp,
            samples: data,
            clip_mask,
        })
    }
}

// ── Demultiplexer ────────────────────────────────────────────────────────────

/// Splits the multiplexed record flow by stream id, giving every stream its
/// own corrector state and epoch cache.
pub struct Demux {
    template: GainBaselineCorrector,
    chains: HashMap<StreamId, GainBaselineCorrector>,
}

impl Demux {
    pub fn new(template: GainBaselineCorrector) -> Self {
        Self {
            template,
            chains: HashMap::new(),
        }
    }

    pub fn feed(&mut self, rec: &RawRecord) -> Option<Record> {
        let chain = self
            .chains
            .entry(rec.id.clone())
            .or_insert_with(|| self.template.fork());
        chain.feed(rec)
    }

    pub fn reset(&mut self) {
        self.chains.clear();
    }

    pub fn stream_count(&self) -> usize {
        self.chains.len()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::tests::sample_inventory;
    use seismic_types::secs;

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn settings() -> GainSettings {
        GainSettings {
            saturation_threshold: (1u32 << 23) as f64 * 0.8,
            baseline_length: 60.0,
            taper_length: 0.0,
        }
    }

    fn raw(id: StreamId, start: &str, counts: Vec<i32>) -> RawRecord {
        RawRecord {
            id,
            start: t(start),
            fsamp: 100.0,
            counts,
            seq: 0,
        }
    }

    #[test]
    fn unknown_stream_is_dropped() {
        let inv = Arc::new(sample_inventory());
        let mut c = GainBaselineCorrector::new(inv, settings());
        let rec = raw(
            StreamId::new("XX", "NOPE", "", "HHZ"),
            "2020-01-01T00:00:00Z",
            vec![1, 2, 3],
        );
        assert!(c.feed(&rec).is_none());
    }

    #[test]
    fn gain_is_removed() {
        let inv = Arc::new(sample_inventory());
        let mut c = GainBaselineCorrector::new(inv, settings());
        // HHZ epoch after 2015 has gain 6e8 counts/(m/s). An impulse of 6e8
        // counts must come out near 1 m/s (minus the small running-mean share).
        let mut counts = vec![0i32; 100];
        counts[50] = 600_000_000;
        let rec = raw(
            StreamId::new("CH", "HASLI", "", "HHZ"),
            "2020-01-01T00:00:00Z",
            counts,
        );
        let out = c.feed(&rec).unwrap();
        assert!((out.samples[50] - 1.0).abs() < 0.05, "got {}", out.samples[50]);
        assert!(out.clip_mask.is_none());
    }

    #[test]
    fn saturated_samples_get_clip_bits() {
        let inv = Arc::new(sample_inventory());
        let mut c = GainBaselineCorrector::new(inv, settings());
        let thresh = ((1u32 << 23) as f64 * 0.8) as i32;
        let rec = raw(
            StreamId::new("CH", "HASLI", "", "HHZ"),
            "2020-01-01T00:00:00Z",
            vec![0, thresh + 1, -(thresh + 1), thresh - 1],
        );
        let out = c.feed(&rec).unwrap();
        let mask = out.clip_mask.unwrap();
        assert!(!mask.test(0));
        assert!(mask.test(1));
        assert!(mask.test(2));
        assert!(!mask.test(3));
    }

    #[test]
    fn constant_signal_is_baseline_corrected_to_zero() {
        let inv = Arc::new(sample_inventory());
        let mut c = GainBaselineCorrector::new(inv, settings());
        let rec = raw(
            StreamId::new("CH", "HASLI", "", "HHZ"),
            "2020-01-01T00:00:00Z",
            vec![1000; 50],
        );
        let out = c.feed(&rec).unwrap();
        // Running mean of a constant equals the constant
        assert!(out.samples.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn gap_resets_taper_state() {
        let inv = Arc::new(sample_inventory());
        let mut s = settings();
        s.taper_length = 0.5;
        let mut c = GainBaselineCorrector::new(inv, s);
        let id = StreamId::new("CH", "HASLI", "", "HHZ");

        let mut counts = vec![0i32; 100];
        counts[80] = 600_000_000;
        let first = raw(id.clone(), "2020-01-01T00:00:00Z", counts.clone());
        let out1 = c.feed(&first).unwrap();
        // Past the taper ramp the impulse passes nearly unscaled
        assert!(out1.samples[80].abs() > 0.5);

        // Two-second gap: taper must ramp from zero again. An impulse early
        // in the new ramp comes out strongly attenuated.
        let mut second = raw(id, "2020-01-01T00:00:03Z", vec![0i32; 100]);
        second.counts[10] = 600_000_000;
        let out2 = c.feed(&second).unwrap();
        assert_eq!(out2.samples[0], 0.0);
        assert!(out2.samples[10].abs() < 0.3, "got {}", out2.samples[10]);
    }

    #[test]
    fn demux_keeps_per_stream_state() {
        let inv = Arc::new(sample_inventory());
        let mut demux = Demux::new(GainBaselineCorrector::new(inv, settings()));

        let a = raw(
            StreamId::new("CH", "HASLI", "", "HHZ"),
            "2020-01-01T00:00:00Z",
            vec![100; 10],
        );
        let b = RawRecord {
            fsamp: 100.0,
            ..raw(
                StreamId::new("CH", "HASLI", "", "HHN"),
                "2020-01-01T00:00:00Z",
                vec![100; 10],
            )
        };
        assert!(demux.feed(&a).is_some());
        assert!(demux.feed(&b).is_some());
        assert_eq!(demux.stream_count(), 2);

        // Continuation record on stream a stays continuous
        let a2 = RawRecord {
            start: a.start + secs(0.1),
            ..a.clone()
        };
        assert!(demux.feed(&a2).is_some());
        assert_eq!(demux.stream_count(), 2);
    }
}
