//! Onsite magnitude processing: τP, τC and Pd after a P pick.
//!
//! Velocity input only. Two cutoff-capacity rings are maintained: the τP ring
//! (3 Hz low-passed velocity pushed through the recursive Allen–Kanamori
//! transform) and the τC ring (velocity plus once-integrated displacement).
//! τP is a running maximum over `[pick + dead_time, pick + cutoff]` published
//! on every update; τC and Pd are computed exactly once per trigger when the
//! ring covers the full window without a gap.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use seismic_types::{Pick, Record, StreamId};
use tracing::{error, warn};

use crate::filters::{Butterworth, IirIntegrate, StreamFilter, TauP};
use crate::ring::{Ring, Timestamped};

use super::{Continuity, Output, StreamState, TauCPdResult, TauPResult};

struct TauCRecord {
    /// High-passed velocity.
    rec: Record,
    /// Velocity integrated once to displacement.
    disp: Vec<f64>,
}

impl Timestamped for TauCRecord {
    fn timestamp(&self) -> DateTime<Utc> {
        self.rec.start
    }
}

struct OmpTrigger {
    pick_id: String,
    time: DateTime<Utc>,
    taup_max: f64,
    taup_time: Option<DateTime<Utc>>,
    got_tau_c: bool,
}

pub struct OnsiteProcessor {
    waveform_id: StreamId,
    dead_time: Duration,
    cutoff: Duration,
    state: StreamState,
    lowpass: Butterworth,
    taup_transform: TauP,
    disp_integrator: IirIntegrate,
    taup_buffer: Ring<Record>,
    tauc_buffer: Ring<TauCRecord>,
    triggers: VecDeque<OmpTrigger>,
    dump: bool,
}

impl OnsiteProcessor {
    pub fn new(
        waveform_id: StreamId,
        dead_time_secs: f64,
        cutoff_secs: f64,
        dump: bool,
    ) -> Self {
        Self {
            waveform_id,
            dead_time: seismic_types::secs(dead_time_secs),
            cutoff: seismic_types::secs(cutoff_secs),
            state: StreamState::new(
                "onsite magnitude",
                Some(Box::new(Butterworth::highpass(4, 0.075))),
            ),
            lowpass: Butterworth::lowpass(4, 3.0),
            taup_transform: TauP::default(),
            disp_integrator: IirIntegrate::default(),
            taup_buffer: Ring::new(seismic_types::secs(cutoff_secs)),
            tauc_buffer: Ring::new(seismic_types::secs(cutoff_secs)),
            triggers: VecDeque::new(),
            dump,
        }
    }

    pub fn reset(&mut self) {
        self.state.reset();
        self.lowpass.reset();
        self.taup_transform.reset();
        self.disp_integrator.reset();
        self.taup_buffer.clear();
        self.tauc_buffer.clear();
    }

    fn gap_tolerance_secs(&self) -> f64 {
        0.5 / self.state.fsamp
    }

    pub fn feed_pick(&mut self, pick: &Pick, now: DateTime<Utc>, out: &mut Vec<Output>) -> bool {
        if let Some(hint) = &pick.phase_hint {
            if hint != "P" {
                return false;
            }
        }

        if now - pick.time >= self.cutoff {
            warn!(
                "{}: pick '{}' arrived outside the onsite cutoff",
                self.waveform_id, pick.public_id
            );
            return false;
        }

        let mut trigger = OmpTrigger {
            pick_id: pick.public_id.clone(),
            time: pick.time,
            taup_max: f64::NEG_INFINITY,
            taup_time: None,
            got_tau_c: false,
        };
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
            self.lowpass.init(self.state.fsamp);
            self.taup_transform.init(self.state.fsamp);
            self.disp_integrator.init(self.state.fsamp);
        }
        if continuity == Continuity::Reset {
            self.taup_buffer.clear();
            self.tauc_buffer.clear();
            // The gap broke every open window; τC must not be computed from
            // post-gap data alone.
            for trigger in &mut self.triggers {
                trigger.got_tau_c = true;
            }
        }

        let mut base = rec.samples.clone();
        self.state.apply_filter(&mut base);

        // τP branch: low-pass, then the recursive transform
        let mut tp = base.clone();
        self.lowpass.apply(&mut tp);
        self.taup_transform.apply(&mut tp);
        let taup_rec = Record {
            id: StreamId::new(&rec.id.net, &rec.id.sta, "TP", &rec.id.cha),
            start: rec.start,
            fsamp: rec.fsamp,
            samples: tp,
            clip_mask: rec.clip_mask.clone(),
        };
        if self.dump {
            out.push(Output::Dump(taup_rec.clone()));
        }
        self.taup_buffer.feed(taup_rec);

        // τC branch: velocity plus integrated displacement
        let mut disp = base.clone();
        self.disp_integrator.apply(&mut disp);
        let tauc_rec = TauCRecord {
            rec: Record {
                id: StreamId::new(&rec.id.net, &rec.id.sta, "TC", &rec.id.cha),
                start: rec.start,
                fsamp: rec.fsamp,
                samples: base,
                clip_mask: rec.clip_mask.clone(),
            },
            disp,
        };
        if self.dump {
            out.push(Output::Dump(tauc_rec.rec.clone()));
        }
        self.tauc_buffer.feed(tauc_rec);

        let mut triggers = std::mem::take(&mut self.triggers);
        for trigger in triggers.iter_mut() {
            self.update_trigger(trigger, out);
        }
        self.triggers = triggers;

        self.trim_triggers(now);
    }

    fn update_trigger(&self, trigger: &mut OmpTrigger, out: &mut Vec<Output>) {
        self.update_tau_p(trigger, out);
        self.update_tau_c(trigger, out);
    }

    /// Running τP maximum over `[time + dead_time, time + cutoff]`.
    fn update_tau_p(&self, trigger: &mut OmpTrigger, out: &mut Vec<Output>) {
        let window_start = trigger.time + self.dead_time;
        let window_end = trigger.time + self.cutoff;

        let mut updated = false;
        let mut clipped = false;
        let mut max_evaluation_time: Option<DateTime<Utc>> = None;

        for rec in self.taup_buffer.iter() {
            if rec.end_time() <= window_start {
                continue;
            }
            let count = rec.samples.len() as i64;
            let fsamp = rec.fsamp;

            let rel = (window_start - rec.start).num_microseconds().unwrap_or(0) as f64 / 1e6;
            let start_sample = ((rel * fsamp) as i64).max(0);
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
                clipped = true;
            }

            for (i, v) in rec.samples[s..e].iter().enumerate() {
                if *v > trigger.taup_max {
                    updated = true;
                    trigger.taup_max = *v;
                    trigger.taup_time =
                        Some(rec.start + seismic_types::secs((s + i) as f64 / fsamp));
                }
            }
        }

        if updated {
            out.push(Output::TauP(TauPResult {
                waveform_id: self.waveform_id.clone(),
                pick_id: trigger.pick_id.clone(),
                peak_time: trigger.taup_time.expect("set together with the peak"),
                window_start,
                window_end: max_evaluation_time,
                tau_p: trigger.taup_max,
                clipped,
            }));
        }
    }

    /// One-shot τC / Pd over `[time, time + cutoff]` once the ring covers the
    /// full window continuously. A gap invalidates the computation for good.
    fn update_tau_c(&self, trigger: &mut OmpTrigger, out: &mut Vec<Output>) {
        if trigger.got_tau_c || self.tauc_buffer.is_empty() {
            return;
        }

        let window_end = trigger.time + self.cutoff;
        if self
            .tauc_buffer
            .back()
            .map(|r| r.rec.end_time() < window_end)
            .unwrap_or(true)
        {
            // Window not yet complete
            return;
        }

        let fac = 0.5 / self.state.fsamp;
        let mut integral_velocity = 0.0;
        let mut integral_displacement = 0.0;
        let mut last_v2: Option<(f64, f64)> = None;
        let mut pd: f64 = 0.0;
        let mut clipped = false;
        let mut last_end: Option<DateTime<Utc>> = None;
        let mut covered_end = false;

        for entry in self.tauc_buffer.iter() {
            let rec = &entry.rec;
            if rec.end_time() <= trigger.time {
                continue;
            }
            let count = rec.samples.len() as i64;
            let fsamp = rec.fsamp;

            let start_sample = match last_end {
                Some(last_end) => {
                    let diff =
                        (rec.start - last_end).num_microseconds().unwrap_or(i64::MAX) as f64 / 1e6;
                    if diff.abs() >= self.gap_tolerance_secs() {
                        error!(
                            "{}: gap detected, abort tauC computation",
                            self.waveform_id
                        );
                        trigger.got_tau_c = true;
                        return;
                    }
                    0
                }
                None => {
                    let rel =
                        (trigger.time - rec.start).num_microseconds().unwrap_or(0) as f64 / 1e6;
                    ((rel * fsamp) as i64).max(0)
                }
            };
            if start_sample >= count {
                continue;
            }

            let rel_end = (window_end - rec.start).num_microseconds().unwrap_or(0) as f64 / 1e6;
            let mut end_sample = (rel_end * fsamp) as i64 + 1;
            if end_sample >= count {
                end_sample = count;
            } else {
                covered_end = true;
            }

            let (s, e) = (start_sample as usize, end_sample as usize);
            if rec.clipped_in(s, e) {
                clipped = true;
            }

            for i in s..e {
                let v2 = rec.samples[i] * rec.samples[i];
                let d2 = entry.disp[i] * entry.disp[i];
                match last_v2 {
                    Some((lv2, ld2)) => {
                        integral_velocity += (v2 + lv2) * fac;
                        integral_displacement += (d2 + ld2) * fac;
                    }
                    None => {}
                }
                last_v2 = Some((v2, d2));
                pd = pd.max(entry.disp[i].abs());
            }

            last_end = Some(rec.end_time());
            if covered_end {
                break;
            }
        }

        if !covered_end {
            return;
        }

        trigger.got_tau_c = true;
        if integral_displacement <= 0.0 {
            return;
        }

        let ratio = integral_velocity / integral_displacement;
        let tau_c = 2.0 * std::f64::consts::PI / ratio.sqrt();

        out.push(Output::TauCPd(TauCPdResult {
            waveform_id: self.waveform_id.clone(),
            pick_id: trigger.pick_id.clone(),
            window_start: trigger.time,
            window_end,
            tau_c,
            pd,
            clipped,
        }));
    }

    fn trim_triggers(&mut self, now: DateTime<Utc>) {
        while let Some(front) = self.triggers.front() {
            if now - front.time > self.cutoff {
                self.triggers.pop_front();
            } else {
                return;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn proc() -> OnsiteProcessor {
        OnsiteProcessor::new(StreamId::new("CH", "HASLI", "", "HHZ"), 0.0, 3.0, false)
    }

    fn sine_rec(start: &str, n: usize, freq: f64) -> Record {
        let fsamp = 100.0;
        Record {
            id: StreamId::new("CH", "HASLI", "", "HHZ"),
            start: t(start),
            fsamp,
            samples: (0..n)
                .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / fsamp).sin())
                .collect(),
            clip_mask: None,
        }
    }

    fn pick(id: &str, time: &str) -> Pick {
        Pick {
            public_id: id.into(),
            stream: StreamId::new("CH", "HASLI", "", "HHZ"),
            time: t(time),
            phase_hint: Some("P".into()),
        }
    }

    fn tau_c_results(out: &[Output]) -> Vec<&TauCPdResult> {
        out.iter()
            .filter_map(|o| match o {
                Output::TauCPd(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    fn tau_p_results(out: &[Output]) -> Vec<&TauPResult> {
        out.iter()
            .filter_map(|o| match o {
                Output::TauP(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn tau_p_peak_is_published_on_update() {
        let mut p = proc();
        let mut out = Vec::new();
        let now = t("2020-01-01T00:00:10.500Z");

        assert!(p.feed_pick(&pick("pk1", "2020-01-01T00:00:10Z"), now, &mut out));
        assert!(tau_p_results(&out).is_empty());

        p.feed_record(&sine_rec("2020-01-01T00:00:10Z", 200, 2.0), now, &mut out);
        let results = tau_p_results(&out);
        assert!(!results.is_empty());
        let last = results.last().unwrap();
        assert!(last.tau_p > 0.0);
        assert_eq!(last.pick_id, "pk1");
        assert_eq!(last.window_start, t("2020-01-01T00:00:10Z"));
    }

    #[test]
    fn tau_c_computed_once_when_window_complete() {
        let mut p = proc();
        let mut out = Vec::new();
        let now = t("2020-01-01T00:00:10.500Z");

        assert!(p.feed_pick(&pick("pk1", "2020-01-01T00:00:10Z"), now, &mut out));

        // Two seconds of data: window (3s) not yet complete
        p.feed_record(&sine_rec("2020-01-01T00:00:10Z", 200, 2.0), now, &mut out);
        assert!(tau_c_results(&out).is_empty());

        // Covering the full window triggers exactly one τC/Pd result
        p.feed_record(&sine_rec("2020-01-01T00:00:12Z", 150, 2.0), now, &mut out);
        let results = tau_c_results(&out);
        assert_eq!(results.len(), 1);
        let r = results[0];
        assert_eq!(r.window_start, t("2020-01-01T00:00:10Z"));
        assert_eq!(r.window_end, t("2020-01-01T00:00:13Z"));
        // For a periodic signal τC lands near the signal period scale
        assert!(r.tau_c > 0.05 && r.tau_c < 2.0, "tau_c = {}", r.tau_c);
        assert!(r.pd > 0.0);

        // Further data must not recompute
        out.clear();
        p.feed_record(&sine_rec("2020-01-01T00:00:13.500Z", 100, 2.0), now, &mut out);
        assert!(tau_c_results(&out).is_empty());
    }

    #[test]
    fn gap_inside_window_invalidates_tau_c() {
        let mut p = proc();
        let mut out = Vec::new();
        let now = t("2020-01-01T00:00:10.500Z");

        assert!(p.feed_pick(&pick("pk1", "2020-01-01T00:00:10Z"), now, &mut out));
        p.feed_record(&sine_rec("2020-01-01T00:00:10Z", 100, 2.0), now, &mut out);

        // Half a second missing inside the window. The processor resets on
        // the gap, so the buffered coverage can never complete and no τC is
        // ever published for this trigger.
        p.feed_record(&sine_rec("2020-01-01T00:00:11.500Z", 200, 2.0), now, &mut out);
        assert!(tau_c_results(&out).is_empty());

        p.feed_record(&sine_rec("2020-01-01T00:00:13.500Z", 100, 2.0), now, &mut out);
        assert!(tau_c_results(&out).is_empty());
    }

    #[test]
    fn dead_time_shifts_the_tau_p_window() {
        let mut p = OnsiteProcessor::new(StreamId::new("CH", "HASLI", "", "HHZ"), 1.0, 3.0, false);
        let mut out = Vec::new();
        let now = t("2020-01-01T00:00:10.500Z");

        assert!(p.feed_pick(&pick("pk1", "2020-01-01T00:00:10Z"), now, &mut out));
        p.feed_record(&sine_rec("2020-01-01T00:00:10Z", 400, 2.0), now, &mut out);

        for r in tau_p_results(&out) {
            assert_eq!(r.window_start, t("2020-01-01T00:00:11Z"));
            if let Some(peak) = Some(r.peak_time) {
                assert!(peak >= t("2020-01-01T00:00:11Z"));
            }
        }
    }

    #[test]
    fn stale_pick_is_rejected() {
        let mut p = proc();
        let mut out = Vec::new();
        let now = t("2020-01-01T00:00:14Z");
        assert!(!p.feed_pick(&pick("pk1", "2020-01-01T00:00:10Z"), now, &mut out));
    }
}
