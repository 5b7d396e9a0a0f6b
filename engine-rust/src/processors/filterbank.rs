//! Gutenberg filter-bank processor.
//!
//! Velocity records are pushed through a bank of 4th-order Butterworth
//! band-pass branches (default: nine octaves below 48 Hz). The per-band
//! snapshots live in a time-capacity ring; accepted P picks open triggers
//! whose per-band peak amplitudes are tracked over the cutoff window — both
//! retroactively against the buffer and on every new record — and published
//! after every update.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use seismic_types::{Pick, Record, StreamId};
use tracing::warn;

use crate::filters::{BandPass, Butterworth, StreamFilter};
use crate::ring::{Ring, Timestamped};

use super::{Continuity, FilterBankResult, Output, StreamState};

/// One record with its per-band filtered snapshots.
struct FilterBankRecord {
    rec: Record,
    filtered: Vec<Vec<f64>>,
}

impl Timestamped for FilterBankRecord {
    fn timestamp(&self) -> DateTime<Utc> {
        self.rec.start
    }
}

struct Trigger {
    pick_id: String,
    time: DateTime<Utc>,
    /// Running peak per band.
    amplitudes: Vec<f64>,
    peak_time: Option<DateTime<Utc>>,
    clipped: bool,
}

pub struct FilterBankProcessor {
    waveform_id: StreamId,
    passbands: Vec<(f64, f64)>,
    cutoff: Duration,
    state: StreamState,
    bank: Vec<BandPass>,
    buffer: Ring<FilterBankRecord>,
    triggers: VecDeque<Trigger>,
}

impl FilterBankProcessor {
    pub fn new(
        waveform_id: StreamId,
        passbands: Vec<(f64, f64)>,
        buffer_secs: f64,
        cutoff_secs: f64,
    ) -> Self {
        Self {
            waveform_id,
            passbands,
            cutoff: seismic_types::secs(cutoff_secs),
            state: StreamState::new(
                "filter bank",
                Some(Box::new(Butterworth::highpass(4, 0.075))),
            ),
            bank: Vec::new(),
            buffer: Ring::new(seismic_types::secs(buffer_secs)),
            triggers: VecDeque::new(),
        }
    }

    pub fn reset(&mut self) {
        self.state.reset();
        self.bank.clear();
        self.buffer.clear();
        self.triggers.clear();
    }

    pub fn feed_pick(&mut self, pick: &Pick, now: DateTime<Utc>, out: &mut Vec<Output>) -> bool {
        if let Some(hint) = &pick.phase_hint {
            if hint != "P" {
                return false;
            }
        }

        let age = now - pick.time;
        if age >= self.cutoff {
            warn!(
                "{}: pick '{}' arrived too late: {:.1}s",
                self.waveform_id,
                pick.public_id,
                age.num_milliseconds() as f64 / 1e3
            );
            return false;
        }

        let mut trigger = Trigger {
            pick_id: pick.public_id.clone(),
            time: pick.time,
            amplitudes: vec![0.0; self.passbands.len()],
            peak_time: None,
            clipped: false,
        };
        // Evaluate retroactively against the buffered records
        self.update_trigger(&mut trigger, out);

        let pos = self
            .triggers
            .iter()
            .position(|t| t.time > trigger.time)
            .unwrap_or(self.triggers.len());
        self.triggers.insert(pos, trigger);

        self.trim_triggers(now);
        true
    }

    pub fn feed_record(&mut self, rec: &Record, now: DateTime<Utc>, out: &mut Vec<Output>) {
        let continuity = self.state.check(rec);
        if continuity.is_fresh() {
            self.bank = self
                .passbands
                .iter()
                .map(|(lo, hi)| {
                    let mut f = BandPass::new(4, *lo, *hi);
                    f.init(self.state.fsamp);
                    f
                })
                .collect();
        }
        if continuity == Continuity::Reset {
            // Stale snapshots and open triggers do not survive a gap
            self.buffer.clear();
            self.triggers.clear();
        }

        let mut base = rec.samples.clone();
        self.state.apply_filter(&mut base);

        let filtered: Vec<Vec<f64>> = self
            .bank
            .iter_mut()
            .map(|f| {
                let mut data = base.clone();
                f.apply(&mut data);
                data
            })
            .collect();

        self.buffer.feed(FilterBankRecord {
            rec: Record {
                samples: base,
                ..rec.clone()
            },
            filtered,
        });

        // Update every open trigger with the new data
        let mut triggers = std::mem::take(&mut self.triggers);
        for trigger in triggers.iter_mut() {
            self.update_trigger(trigger, out);
        }
        self.triggers = triggers;

        self.trim_triggers(now);
    }

    /// Re-scan the buffer for one trigger's window and publish the state.
    fn update_trigger(&self, trigger: &mut Trigger, out: &mut Vec<Output>) {
        trigger.clipped = false;
        let window_end = trigger.time + self.cutoff;
        let mut max_evaluation_time: Option<DateTime<Utc>> = None;

        for entry in self.buffer.iter() {
            let rec = &entry.rec;
            if rec.end_time() <= trigger.time {
                continue;
            }
            let fsamp = rec.fsamp;
            let count = rec.samples.len() as i64;

            let rel_start =
                (trigger.time - rec.start).num_microseconds().unwrap_or(0) as f64 / 1e6;
            let start_sample = ((rel_start * fsamp) as i64).max(0);
            if start_sample >= count {
                continue;
            }

            let rel_end = (window_end - rec.start).num_microseconds().unwrap_or(0) as f64 / 1e6;
            let end_sample = ((rel_end * fsamp) as i64 + 1).min(count);
            if end_sample <= start_sample {
                continue;
            }

            max_evaluation_time =
                Some(rec.start + seismic_types::secs(end_sample as f64 / fsamp));

            let (s, e) = (start_sample as usize, end_sample as usize);
            if rec.clipped_in(s, e) {
                trigger.clipped = true;
            }

            for (band, filtered) in entry.filtered.iter().enumerate() {
                for (i, v) in filtered[s..e].iter().enumerate() {
                    let peak = v.abs();
                    if peak > trigger.amplitudes[band] {
                        trigger.amplitudes[band] = peak;
                        trigger.peak_time =
                            Some(rec.start + seismic_types::secs((s + i) as f64 / fsamp));
                    }
                }
            }
        }

        out.push(Output::FilterBank(FilterBankResult {
            waveform_id: self.waveform_id.clone(),
            pick_id: trigger.pick_id.clone(),
            amplitudes: trigger.amplitudes.clone(),
            peak_time: trigger.peak_time,
            window_start: trigger.time,
            window_end: max_evaluation_time,
            clipped: trigger.clipped,
        }));
    }

    /// Drop triggers that fell out of the cutoff window.
    fn trim_triggers(&mut self, now: DateTime<Utc>) {
        while let Some(front) = self.triggers.front() {
            if now - front.time > self.cutoff {
                self.triggers.pop_front();
            } else {
                return;
            }
        }
    }

    #[cfg(test)]
    fn trigger_count(&self) -> usize {
        self.triggers.len()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
