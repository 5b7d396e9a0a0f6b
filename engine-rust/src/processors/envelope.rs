//! Envelope aggregation: per-interval peak of the absolute signal.
//!
//! Intervals are aligned to multiples of the configured interval from epoch
//! zero; the emitted timestamp is the interval *end*. The clipped flag is
//! sticky within an interval. An optional leading high-pass (4th-order
//! Butterworth, default corner 1/3 Hz) conditions the signal per unit before
//! aggregation.

use chrono::{DateTime, Duration, Utc};
use seismic_types::Record;
use seismic_types::StreamId;

use crate::filters::Butterworth;
use crate::ring::SamplePool;

use super::{ComponentKind, EnvelopeResult, Output, SignalUnit, StreamState};

pub struct EnvelopeProcessor {
    waveform_id: StreamId,
    component: ComponentKind,
    unit: SignalUnit,
    interval_us: i64,
    state: StreamState,
    pool: SamplePool,
    dt: Duration,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
}

impl EnvelopeProcessor {
    /// `filter_corner_hz` enables the leading high-pass when `Some`.
    pub fn new(
        waveform_id: StreamId,
        component: ComponentKind,
        unit: SignalUnit,
        interval_secs: f64,
        filter_corner_hz: Option<f64>,
    ) -> Self {
        let filter = filter_corner_hz
            .map(|c| Box::new(Butterworth::highpass(4, c)) as Box<dyn crate::filters::StreamFilter>);
        Self {
            waveform_id,
            component,
            unit,
            interval_us: (interval_secs * 1e6).round() as i64,
            state: StreamState::new("envelope", filter),
            pool: SamplePool::default(),
            dt: Duration::zero(),
            window_start: DateTime::<Utc>::MIN_UTC,
            window_end: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn unit(&self) -> SignalUnit {
        self.unit
    }

    pub fn reset(&mut self) {
        self.state.reset();
        self.pool.clear();
    }

    /// Interval-aligned window containing `reference`.
    fn setup_time_window(&mut self, reference: DateTime<Utc>) {
        let ref_us = reference.timestamp_micros();
        let start_us = ref_us.div_euclid(self.interval_us) * self.interval_us;
        self.window_start = seismic_types::time_from_micros(start_us);
        self.window_end = self.window_start + Duration::microseconds(self.interval_us);
    }

    fn advance_window(&mut self) {
        self.window_start = self.window_end;
        self.window_end = self.window_start + Duration::microseconds(self.interval_us);
    }

    fn flush(&mut self, out: &mut Vec<Output>) {
        if self.pool.is_empty() {
            return;
        }

        out.push(Output::Envelope(EnvelopeResult {
            waveform_id: self.waveform_id.clone(),
            component: self.component,
            unit: self.unit,
            value: self.pool.peak_abs(),
            timestamp: self.window_end,
            clipped: self.pool.clipped,
        }));

        self.pool.clear();
    }

    pub fn feed_record(&mut self, rec: &Record, out: &mut Vec<Output>) {
        if self.state.check(rec).is_fresh() {
            self.pool
                .reset((self.state.fsamp * self.interval_us as f64 / 1e6) as usize + 1);
            self.dt = seismic_types::secs(1.0 / self.state.fsamp);
            self.setup_time_window(rec.start);
        }

        let mut data = rec.samples.clone();
        self.state.apply_filter(&mut data);

        // Record window entirely after the current interval: flush what is
        // pooled and restart the interval grid at the record start.
        if rec.start >= self.window_end {
            self.flush(out);
            self.setup_time_window(rec.start);
        }

        let mut ts = rec.start;
        for (i, v) in data.iter().enumerate() {
            while ts >= self.window_end {
                self.flush(out);
                self.advance_window();
            }

            self.pool.push(*v);
            if rec.clip_mask.as_ref().map(|m| m.test(i)).unwrap_or(false) {
                self.pool.clipped = true;
            }

            ts += self.dt;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use seismic_types::ClipMask;

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn proc() -> EnvelopeProcessor {
        EnvelopeProcessor::new(
            StreamId::new("CH", "HASLI", "", "HHZ"),
            ComponentKind::Vertical,
            SignalUnit::MeterPerSecond,
            1.0,
            None,
        )
    }

    fn rec(start: &str, n: usize, value: f64) -> Record {
        Record {
            id: StreamId::new("CH", "HASLI", "", "HHZ"),
            start: t(start),
            fsamp: 100.0,
            samples: vec![value; n],
            clip_mask: None,
        }
    }

    fn envelopes(out: &[Output]) -> Vec<&EnvelopeResult> {
        out.iter()
            .filter_map(|o| match o {
                Output::Envelope(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn emissions_are_interval_aligned_with_end_timestamps() {
        // 200 samples at 100 sps starting at 00:00:00.500 → two emissions
        // with end times :01 and :02, none at :00.5.
        let mut p = proc();
        let mut out = Vec::new();
        p.feed_record(&rec("2020-01-01T00:00:00.500Z", 200, 1.0), &mut out);
        // The final half-filled interval only flushes on the next record
        p.feed_record(&rec("2020-01-01T00:00:02.500Z", 1, 1.0), &mut out);

        let envs = envelopes(&out);
        assert_eq!(envs.len(), 2);
        assert_eq!(envs[0].timestamp, t("2020-01-01T00:00:01Z"));
        assert_eq!(envs[1].timestamp, t("2020-01-01T00:00:02Z"));
        assert!(envs.iter().all(|e| e.value == 1.0 && !e.clipped));
    }

    #[test]
    fn peak_is_max_absolute_value() {
        let mut p = proc();
        let mut out = Vec::new();
        let mut r = rec("2020-01-01T00:00:00Z", 100, 0.5);
        r.samples[10] = -2.5;
        p.feed_record(&r, &mut out);
        p.feed_record(&rec("2020-01-01T00:00:01Z", 1, 0.0), &mut out);

        let envs = envelopes(&out);
        assert_eq!(envs[0].value, 2.5);
    }

    #[test]
    fn clip_flag_is_sticky_per_interval() {
        let mut p = proc();
        let mut out = Vec::new();

        let mut r = rec("2020-01-01T00:00:00Z", 200, 1.0);
        let mut mask = ClipMask::new(200);
        mask.set(5, true); // clipped sample in the first interval only
        r.clip_mask = Some(mask);
        p.feed_record(&r, &mut out);
        p.feed_record(&rec("2020-01-01T00:00:02Z", 1, 0.0), &mut out);

        let envs = envelopes(&out);
        assert_eq!(envs.len(), 2);
        assert!(envs[0].clipped);
        assert!(!envs[1].clipped);
    }

    #[test]
    fn gap_restarts_the_interval_grid() {
        let mut p = proc();
        let mut out = Vec::new();
        // 50 samples, interval not yet complete
        p.feed_record(&rec("2020-01-01T00:00:00Z", 50, 9.0), &mut out);
        assert!(envelopes(&out).is_empty());

        // Gap of several samples: pooled pre-gap samples are discarded, the
        // next emission only covers post-gap data.
        p.feed_record(&rec("2020-01-01T00:00:00.900Z", 110, 1.0), &mut out);
        let envs = envelopes(&out);
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].timestamp, t("2020-01-01T00:00:01Z"));
        assert_eq!(envs[0].value, 1.0);
    }

    #[test]
    fn deterministic_after_reset() {
        let run = || {
            let mut p = proc();
            let mut out = Vec::new();
            p.feed_record(&rec("2020-01-01T00:00:00.500Z", 200, 1.5), &mut out);
            p.feed_record(&rec("2020-01-01T00:00:02.500Z", 10, 0.5), &mut out);
            envelopes(&out)
                .iter()
                .map(|e| (e.timestamp, e.value, e.clipped))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn subsecond_intervals_align_too() {
        let mut p = EnvelopeProcessor::new(
            StreamId::new("CH", "HASLI", "", "HHZ"),
            ComponentKind::Vertical,
            SignalUnit::MeterPerSecond,
            0.5,
            None,
        );
        let mut out = Vec::new();
        p.feed_record(&rec("2020-01-01T00:00:00.250Z", 100, 1.0), &mut out);
        let envs = envelopes(&out);
        assert_eq!(envs[0].timestamp, t("2020-01-01T00:00:00.500Z"));
        assert_eq!(envs[1].timestamp, t("2020-01-01T00:00:01Z"));
    }
}
