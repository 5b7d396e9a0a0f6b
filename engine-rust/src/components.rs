//! Horizontal component synchronization and L2 combination.
//!
//! Both horizontal streams of a sensor are buffered in time-capacity rings;
//! whenever new data arrives the combiner emits the maximal frame covered by
//! both components, combined pointwise as √(a² + b²). The synthetic channel
//! code is the common two-character instrument code plus 'X'.

use chrono::{DateTime, Duration, Utc};
use seismic_types::{ClipMask, Record, StreamId};
use tracing::warn;

use crate::ring::{Ring, Timestamped};

impl Timestamped for Record {
    fn timestamp(&self) -> DateTime<Utc> {
        self.start
    }
}

struct ComponentState {
    code: String,
    ring: Ring<Record>,
    /// End of the data already combined and emitted.
    committed: Option<DateTime<Utc>>,
}

impl ComponentState {
    fn new(code: String, capacity: Duration) -> Self {
        Self {
            code,
            ring: Ring::new(capacity),
            committed: None,
        }
    }

    /// Copy up to `n` samples starting at `start` out of the buffered
    /// records. Stops early at a gap.
    fn collect(&self, start: DateTime<Utc>, n: usize, fsamp: f64) -> (Vec<f64>, Vec<bool>) {
        let mut vals = Vec::with_capacity(n);
        let mut clip = Vec::with_capacity(n);
        let half_sample = seismic_types::secs(0.5 / fsamp);
        let mut expected = start;

        for rec in self.ring.iter() {
            if vals.len() == n {
                break;
            }
            if rec.end_time() <= expected {
                continue;
            }
            if rec.start > expected + half_sample {
                // Gap inside the window
                break;
            }

            let offset_secs = (expected - rec.start).num_microseconds().unwrap_or(0) as f64 / 1e6;
            let offset = (offset_secs * fsamp).round() as usize;
            for i in offset..rec.samples.len() {
                if vals.len() == n {
                    break;
                }
                vals.push(rec.samples[i]);
                clip.push(rec.clip_mask.as_ref().map(|m| m.test(i)).unwrap_or(false));
            }
            expected = start + seismic_types::secs(vals.len() as f64 / fsamp);
        }

        (vals, clip)
    }

    /// Earliest buffered sample time at or after `t`, skipping over gaps.
    fn next_available(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        for rec in self.ring.iter() {
            if rec.end_time() <= t {
                continue;
            }
            return Some(if rec.start > t { rec.start } else { t });
        }
        None
    }
}

pub struct HorizontalCombiner {
    states: [ComponentState; 2],
    out_channel: String,
    fsamp: f64,
}

impl HorizontalCombiner {
    /// `first`/`second` are the two horizontal channel codes; the synthetic
    /// output channel is `<instrument>X`.
    pub fn new(first: &str, second: &str, buffer: Duration) -> Self {
        let instrument = &first[..first.len().min(2)];
        Self {
            states: [
                ComponentState::new(first.to_string(), buffer),
                ComponentState::new(second.to_string(), buffer),
            ],
            out_channel: format!("{instrument}X"),
            fsamp: 0.0,
        }
    }

    pub fn out_channel(&self) -> &str {
        &self.out_channel
    }

    fn comp_index(&self, code: &str) -> Option<usize> {
        self.states.iter().position(|s| s.code == code)
    }

    /// Largest delay of one component with respect to the others.
    pub fn current_delay(&self) -> Duration {
        let all_committed = self.states.iter().all(|s| s.committed.is_some());
        let mut delay = Duration::zero();
        for s in &self.states {
            let Some(back) = s.ring.back() else { continue };
            let d = if all_committed {
                back.end_time() - s.committed.expect("committed")
            } else {
                match s.ring.front() {
                    Some(front) => back.end_time() - front.start,
                    None => continue,
                }
            };
            if d > delay {
                delay = d;
            }
        }
        delay
    }

    pub fn reset(&mut self) {
        for s in &mut self.states {
            s.ring.clear();
            s.committed = None;
        }
        self.fsamp = 0.0;
    }

    /// Buffer one horizontal record and emit the maximal combined frame, if
    /// any. Records on unknown channel codes are ignored.
    pub fn feed(&mut self, rec: &Record) -> Option<Record> {
        let idx = self.comp_index(&rec.id.cha)?;

        // Components with different sampling rates cannot be combined; keep
        // the newer data.
        if self.fsamp != 0.0 && rec.fsamp != self.fsamp {
            warn!(
                "{}: sampling frequency changed across components ({} != {}): dropping older data",
                rec.id, self.fsamp, rec.fsamp
            );
            let other = 1 - idx;
            self.states[other].ring.clear();
            self.states[other].committed = None;
            self.states[idx].ring.clear();
            self.states[idx].committed = None;
        }
        self.fsamp = rec.fsamp;

        self.states[idx].ring.feed(rec.clone());
        self.try_emit(&rec.id)
    }

    fn try_emit(&mut self, template: &StreamId) -> Option<Record> {
        // Frame start: the latest of (committed end | buffered start)
        let mut start: Option<DateTime<Utc>> = None;
        let mut end: Option<DateTime<Utc>> = None;
        for s in &self.states {
            let front = s.ring.front()?;
            let s_start = s.committed.unwrap_or(front.start);
            let s_end = s.ring.back()?.end_time();
            start = Some(start.map_or(s_start, |v: DateTime<Utc>| v.max(s_start)));
            end = Some(end.map_or(s_end, |v: DateTime<Utc>| v.min(s_end)));
        }
        let (mut start, end) = (start?, end?);

        // If the frame start falls into a gap of one component, jump forward
        // to data both components actually have.
        loop {
            let mut changed = false;
            for s in &self.states {
                let available = s.next_available(start)?;
                if available > start {
                    start = available;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        if end <= start {
            return None;
        }

        let n = (((end - start).num_microseconds().unwrap_or(0) as f64 / 1e6) * self.fsamp)
            .floor() as usize;
        if n == 0 {
            return None;
        }

        let (a, clip_a) = self.states[0].collect(start, n, self.fsamp);
        let (b, clip_b) = self.states[1].collect(start, n, self.fsamp);
        let n = a.len().min(b.len());
        if n == 0 {
            return None;
        }

        let mut samples = Vec::with_capacity(n);
        let mut clip_mask: Option<ClipMask> = None;
        for i in 0..n {
            samples.push((a[i] * a[i] + b[i] * b[i]).sqrt());
            if clip_a[i] || clip_b[i] {
                clip_mask
                    .get_or_insert_with(|| ClipMask::new(n))
                    .set(i, true);
            }
        }

        let emitted_end = start + seismic_types::secs(n as f64 / self.fsamp);
        for s in &mut self.states {
            s.committed = Some(emitted_end);
        }

        Some(Record {
            id: StreamId::new(&template.net, &template.sta, &template.loc, &self.out_channel),
            start,
            fsamp: self.fsamp,
            samples,
            clip_mask,
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn rec(cha: &str, start: &str, n: usize, value: f64) -> Record {
        Record {
            id: StreamId::new("CH", "HASLI", "", cha),
            start: t(start),
            fsamp: 100.0,
            samples: vec![value; n],
            clip_mask: None,
        }
    }

    #[test]
    fn l2_combination_of_3_and_4_is_5() {
        let mut c = HorizontalCombiner::new("HHN", "HHE", Duration::seconds(60));
        assert!(c
            .feed(&rec("HHN", "2020-01-01T00:00:00Z", 100, 3.0))
            .is_none());
        let combined = c
            .feed(&rec("HHE", "2020-01-01T00:00:00Z", 100, 4.0))
            .unwrap();

        assert_eq!(combined.id.cha, "HHX");
        assert_eq!(combined.samples.len(), 100);
        assert_eq!(combined.start, t("2020-01-01T00:00:00Z"));
        for v in &combined.samples {
            assert!((v - 5.0).abs() < 1e-12);
        }
    }

    #[test]
    fn incremental_frames_do_not_overlap() {
        let mut c = HorizontalCombiner::new("HHN", "HHE", Duration::seconds(60));
        c.feed(&rec("HHN", "2020-01-01T00:00:00Z", 100, 1.0));
        let first = c
            .feed(&rec("HHE", "2020-01-01T00:00:00Z", 100, 1.0))
            .unwrap();
        assert_eq!(first.samples.len(), 100);

        // Next second on both components: exactly one more second emitted
        c.feed(&rec("HHN", "2020-01-01T00:00:01Z", 100, 2.0));
        let second = c
            .feed(&rec("HHE", "2020-01-01T00:00:01Z", 100, 2.0))
            .unwrap();
        assert_eq!(second.start, t("2020-01-01T00:00:01Z"));
        assert_eq!(second.samples.len(), 100);
        for v in &second.samples {
            assert!((v - 2.0 * std::f64::consts::SQRT_2).abs() < 1e-12);
        }
    }

    #[test]
    fn lagging_component_grows_delay() {
        let mut c = HorizontalCombiner::new("HHN", "HHE", Duration::seconds(60));
        c.feed(&rec("HHN", "2020-01-01T00:00:00Z", 100, 1.0));
        c.feed(&rec("HHE", "2020-01-01T00:00:00Z", 100, 1.0));
        // Only HHN advances for three seconds
        for i in 1..4 {
            c.feed(&rec("HHN", &format!("2020-01-01T00:00:0{i}Z"), 100, 1.0));
        }
        assert_eq!(c.current_delay(), Duration::seconds(3));
    }

    #[test]
    fn clip_bits_are_merged() {
        let mut c = HorizontalCombiner::new("HHN", "HHE", Duration::seconds(60));
        let mut n = rec("HHN", "2020-01-01T00:00:00Z", 10, 1.0);
        let mut mask = ClipMask::new(10);
        mask.set(3, true);
        n.clip_mask = Some(mask);
        c.feed(&n);
        let combined = c.feed(&rec("HHE", "2020-01-01T00:00:00Z", 10, 1.0)).unwrap();
        let mask = combined.clip_mask.unwrap();
        assert!(mask.test(3));
        assert!(!mask.test(2));
    }

    #[test]
    fn sampling_rate_mismatch_drops_older_data() {
        let mut c = HorizontalCombiner::new("HHN", "HHE", Duration::seconds(60));
        c.feed(&rec("HHN", "2020-01-01T00:00:00Z", 100, 1.0));
        let mut other = rec("HHE", "2020-01-01T00:00:00Z", 50, 1.0);
        other.fsamp = 50.0;
        // Mismatch: buffers are dropped, nothing combined
        assert!(c.feed(&other).is_none());
        // Both components at the new rate combine again
        let mut n2 = rec("HHN", "2020-01-01T00:00:01Z", 50, 3.0);
        n2.fsamp = 50.0;
        let mut e2 = rec("HHE", "2020-01-01T00:00:01Z", 50, 4.0);
        e2.fsamp = 50.0;
        c.feed(&n2);
        let combined = c.feed(&e2).unwrap();
        assert_eq!(combined.samples.len(), 50);
        assert!((combined.samples[0] - 5.0).abs() < 1e-12);
    }

    #[test]
    fn gap_in_one_component_skips_to_common_data() {
        let mut c = HorizontalCombiner::new("HHN", "HHE", Duration::seconds(60));
        c.feed(&rec("HHN", "2020-01-01T00:00:00Z", 100, 3.0));
        // The first half second combines immediately
        let first = c
            .feed(&rec("HHE", "2020-01-01T00:00:00Z", 50, 4.0))
            .unwrap();
        assert_eq!(first.samples.len(), 50);

        // HHE has a half-second hole, then continues at :01
        c.feed(&rec("HHN", "2020-01-01T00:00:01Z", 100, 3.0));
        let after_gap = c
            .feed(&rec("HHE", "2020-01-01T00:00:01Z", 100, 4.0))
            .unwrap();
        // The frame resumes where both components have data again; the
        // unmatched HHN samples inside the hole are never combined.
        assert_eq!(after_gap.start, t("2020-01-01T00:00:01Z"));
        assert_eq!(after_gap.samples.len(), 100);
        assert!((after_gap.samples[0] - 5.0).abs() < 1e-12);
    }
}
