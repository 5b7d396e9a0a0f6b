//! Per-unit preprocessing and record routing into the algorithm processors.
//!
//! A `Preprocessor` owns the unit-conversion chains of one component of a
//! three-component group: the native signal is forwarded as-is, a co-located
//! converted stream (acceleration from velocity via central difference, or
//! velocity from acceleration via high-pass + integration) and a displacement
//! stream are derived when the configuration asks for those units. Derived
//! records carry the synthetic location codes PA/PV/PD.
//!
//! The horizontal preprocessor converts each of its two input streams
//! individually (per-stream filter state) and combines the converted pair
//! into the L2 channel before the algorithm processors see it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use seismic_types::{Pick, Record, StreamId};
use tracing::warn;

use crate::components::HorizontalCombiner;
use crate::config::EngineConfig;
use crate::filters::{Butterworth, ChainFilter, DiffCentral, IirIntegrate, StreamFilter};
use crate::processors::{
    AlgoProcessor, ComponentKind, EnvelopeProcessor, FilterBankProcessor, OnsiteProcessor,
    Output, SignalUnit,
};

// ── Routing processor ────────────────────────────────────────────────────────

/// Fans conditioned records of one (component, unit) pair into the enabled
/// algorithm processors.
pub struct RoutingProcessor {
    dump: bool,
    impls: Vec<AlgoProcessor>,
}

impl RoutingProcessor {
    pub fn new(
        cfg: &EngineConfig,
        wid: &StreamId,
        component: ComponentKind,
        unit: SignalUnit,
        dump: bool,
    ) -> Self {
        let mut impls = Vec::new();

        if cfg.vsfndr.enable {
            let filtered = match unit {
                SignalUnit::Meter => cfg.vsfndr.filter_disp,
                SignalUnit::MeterPerSecond => cfg.vsfndr.filter_vel,
                SignalUnit::MeterPerSecondSquared => cfg.vsfndr.filter_acc,
            };
            impls.push(AlgoProcessor::Envelope(EnvelopeProcessor::new(
                wid.clone(),
                component,
                unit,
                cfg.vsfndr.envelope_interval,
                filtered.then_some(cfg.vsfndr.filter_corner_freq),
            )));
        }

        // The triggered processors accept velocity only
        if unit == SignalUnit::MeterPerSecond {
            if cfg.filterbank.enable {
                impls.push(AlgoProcessor::FilterBank(FilterBankProcessor::new(
                    wid.clone(),
                    cfg.filterbank.passbands.clone(),
                    cfg.filterbank.buffer_length,
                    cfg.filterbank.cutoff_time,
                )));
            }
            if cfg.taup.enable {
                impls.push(AlgoProcessor::Onsite(OnsiteProcessor::new(
                    wid.clone(),
                    cfg.taup.dead_time,
                    cfg.taup.cut_off_time,
                    dump,
                )));
            }
        }

        Self { dump, impls }
    }

    pub fn feed(&mut self, rec: &Record, now: DateTime<Utc>, out: &mut Vec<Output>) {
        if self.dump {
            out.push(Output::Dump(rec.clone()));
        }
        for p in &mut self.impls {
            p.feed_record(rec, now, out);
        }
    }

    pub fn feed_pick(&mut self, pick: &Pick, now: DateTime<Utc>, out: &mut Vec<Output>) -> bool {
        let mut handled = false;
        for p in &mut self.impls {
            if p.feed_pick(pick, now, out) {
                handled = true;
            }
        }
        handled
    }

    pub fn reset(&mut self) {
        for p in &mut self.impls {
            p.reset();
        }
    }
}

// ── Conversion stages ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum ConversionKind {
    /// Velocity → acceleration (central difference).
    Differentiate,
    /// One integration step behind a 0.075 Hz high-pass; turns acceleration
    /// into velocity or velocity into displacement.
    HighpassIntegrate,
}

impl ConversionKind {
    fn build(&self) -> Box<dyn StreamFilter> {
        match self {
            Self::Differentiate => Box::new(DiffCentral::default()),
            Self::HighpassIntegrate => Box::new(ChainFilter::new(vec![
                Box::new(Butterworth::highpass(4, 0.075)),
                Box::new(IirIntegrate::default()),
            ])),
        }
    }
}

/// One derived-unit chain: per-input-stream filters, an optional L2 combiner
/// (horizontal only) and an optional routing processor (absent when the
/// stage only exists as input for a later stage).
struct Stage {
    location_code: &'static str,
    kind: ConversionKind,
    filters: HashMap<String, Box<dyn StreamFilter>>,
    combiner: Option<HorizontalCombiner>,
    proc: Option<RoutingProcessor>,
}

impl Stage {
    fn convert(&mut self, rec: &Record) -> Record {
        let filter = self
            .filters
            .entry(rec.id.cha.clone())
            .or_insert_with(|| {
                let mut f = self.kind.build();
                f.init(rec.fsamp);
                f
            });

        let mut samples = rec.samples.clone();
        filter.apply(&mut samples);

        Record {
            id: StreamId::new(&rec.id.net, &rec.id.sta, self.location_code, &rec.id.cha),
            start: rec.start,
            fsamp: rec.fsamp,
            samples,
            clip_mask: rec.clip_mask.clone(),
        }
    }

    /// Feed a converted record through the combiner (when present) into the
    /// stage's routing processor. Returns the converted record so later
    /// stages can chain on it.
    fn feed(&mut self, rec: &Record, now: DateTime<Utc>, out: &mut Vec<Output>) -> Record {
        let converted = self.convert(rec);

        match (&mut self.combiner, &mut self.proc) {
            (Some(combiner), proc) => {
                if let Some(combined) = combiner.feed(&converted) {
                    if let Some(proc) = proc {
                        proc.feed(&combined, now, out);
                    }
                }
            }
            (None, Some(proc)) => proc.feed(&converted, now, out),
            (None, None) => {}
        }

        converted
    }

    fn reset(&mut self) {
        self.filters.clear();
        if let Some(c) = &mut self.combiner {
            c.reset();
        }
        if let Some(p) = &mut self.proc {
            p.reset();
        }
    }

    fn current_delay(&self) -> chrono::Duration {
        self.combiner
            .as_ref()
            .map(|c| c.current_delay())
            .unwrap_or_else(chrono::Duration::zero)
    }
}

// ── Preprocessor ─────────────────────────────────────────────────────────────

pub struct Preprocessor {
    kind: ComponentKind,
    unit: SignalUnit,
    native: Option<RoutingProcessor>,
    native_combiner: Option<HorizontalCombiner>,
    co_located: Option<Stage>,
    displacement: Option<Stage>,
    /// Per-input-stream continuity state (sampling rate, last end time).
    continuity: HashMap<String, (f64, DateTime<Utc>)>,
    horizontal_max_delay: chrono::Duration,
    delay_warned: bool,
}

impl Preprocessor {
    /// Build the vertical preprocessor of a three-component group.
    /// Returns None when the gain unit cannot be interpreted.
    pub fn vertical(
        cfg: &EngineConfig,
        wid: StreamId,
        gain_unit: &str,
        dump: bool,
    ) -> Option<Self> {
        Self::build(cfg, ComponentKind::Vertical, wid, gain_unit, None, dump)
    }

    /// Build the shared horizontal preprocessor. `codes` are the two
    /// horizontal channel codes; the gain unit is taken from the first.
    pub fn horizontal(
        cfg: &EngineConfig,
        wid: StreamId,
        gain_unit: &str,
        codes: (String, String),
        dump: bool,
    ) -> Option<Self> {
        Self::build(
            cfg,
            ComponentKind::Horizontal,
            wid,
            gain_unit,
            Some(codes),
            dump,
        )
    }

    fn build(
        cfg: &EngineConfig,
        kind: ComponentKind,
        wid: StreamId,
        gain_unit: &str,
        codes: Option<(String, String)>,
        dump: bool,
    ) -> Option<Self> {
        let Some(unit) = SignalUnit::parse(gain_unit) else {
            warn!("{wid}: invalid gain unit '{gain_unit}'");
            return None;
        };

        let want = &cfg.signal;
        let (want_native, co_target, co_kind, co_loc) = match unit {
            SignalUnit::MeterPerSecond => (
                want.vel,
                want.acc.then_some(SignalUnit::MeterPerSecondSquared),
                ConversionKind::Differentiate,
                "PA",
            ),
            SignalUnit::MeterPerSecondSquared => (
                want.acc,
                (want.vel || want.disp).then_some(SignalUnit::MeterPerSecond),
                ConversionKind::HighpassIntegrate,
                "PV",
            ),
            SignalUnit::Meter => {
                warn!("{wid}: unsupported native unit '{gain_unit}'");
                return None;
            }
        };

        let buffer = seismic_types::secs(cfg.horizontal_buffer);
        let make_combiner = || {
            codes
                .as_ref()
                .map(|(a, b)| HorizontalCombiner::new(a, b, buffer))
        };

        let native = want_native.then(|| RoutingProcessor::new(cfg, &wid, kind, unit, dump));
        let native_combiner = if want_native { make_combiner() } else { None };

        let co_located = co_target.map(|target| Stage {
            location_code: co_loc,
            kind: co_kind,
            filters: HashMap::new(),
            combiner: make_combiner(),
            proc: match target {
                SignalUnit::MeterPerSecondSquared if want.acc => {
                    Some(RoutingProcessor::new(cfg, &wid, kind, target, dump))
                }
                SignalUnit::MeterPerSecond if want.vel => {
                    Some(RoutingProcessor::new(cfg, &wid, kind, target, dump))
                }
                _ => None,
            },
        });

        let displacement = want.disp.then(|| Stage {
            location_code: "PD",
            kind: ConversionKind::HighpassIntegrate,
            filters: HashMap::new(),
            combiner: make_combiner(),
            proc: Some(RoutingProcessor::new(
                cfg,
                &wid,
                kind,
                SignalUnit::Meter,
                dump,
            )),
        });

        Some(Self {
            kind,
            unit,
            native,
            native_combiner,
            co_located,
            displacement,
            continuity: HashMap::new(),
            horizontal_max_delay: seismic_types::secs(cfg.debug.max_horizontal_gap),
            delay_warned: false,
        })
    }

    pub fn component(&self) -> ComponentKind {
        self.kind
    }

    pub fn unit(&self) -> SignalUnit {
        self.unit
    }

    /// Reset all owned filter state, combiners and processors.
    pub fn reset(&mut self) {
        self.continuity.clear();
        if let Some(p) = &mut self.native {
            p.reset();
        }
        if let Some(c) = &mut self.native_combiner {
            c.reset();
        }
        if let Some(s) = &mut self.co_located {
            s.reset();
        }
        if let Some(s) = &mut self.displacement {
            s.reset();
        }
    }

    /// Check one input stream's continuity; a sampling-rate change or a gap
    /// beyond half a sample period resets the whole ownership chain.
    fn check_continuity(&mut self, rec: &Record) {
        if let Some((fsamp, last_end)) = self.continuity.get(&rec.id.cha) {
            let gap = (rec.start - *last_end).num_microseconds().unwrap_or(i64::MAX) as f64 / 1e6;
            if *fsamp != rec.fsamp || gap.abs() > 0.5 / rec.fsamp {
                warn!(
                    "{}: discontinuity of {:.6}s or rate change: reset preprocessing",
                    rec.id, gap
                );
                self.reset();
            }
        }
        self.continuity
            .insert(rec.id.cha.clone(), (rec.fsamp, rec.end_time()));
    }

    pub fn feed(&mut self, rec: &Record, now: DateTime<Utc>, out: &mut Vec<Output>) {
        self.check_continuity(rec);

        // Native unit
        if let Some(native) = &mut self.native {
            match &mut self.native_combiner {
                Some(combiner) => {
                    if let Some(combined) = combiner.feed(rec) {
                        native.feed(&combined, now, out);
                    }
                }
                None => native.feed(rec, now, out),
            }
        }

        // Co-located converted unit
        let co_rec = self
            .co_located
            .as_mut()
            .map(|stage| stage.feed(rec, now, out));

        // Displacement: derived from the native velocity, or from the
        // co-located velocity when the sensor is accelerometric
        if let Some(stage) = &mut self.displacement {
            let input = match self.unit {
                SignalUnit::MeterPerSecond => Some(rec),
                SignalUnit::MeterPerSecondSquared => co_rec.as_ref(),
                SignalUnit::Meter => None,
            };
            if let Some(input) = input {
                stage.feed(input, now, out);
            }
        }

        if self.kind == ComponentKind::Horizontal {
            let delay = self.current_delay();
            if delay > self.horizontal_max_delay {
                if !self.delay_warned {
                    warn!(
                        "{}: horizontal gap too high: {:.1}s",
                        rec.id,
                        delay.num_milliseconds() as f64 / 1e3
                    );
                }
                self.delay_warned = true;
            } else {
                self.delay_warned = false;
            }
        }
    }

    /// Largest inter-component delay over all combiners.
    pub fn current_delay(&self) -> chrono::Duration {
        let mut delay = self
            .native_combiner
            .as_ref()
            .map(|c| c.current_delay())
            .unwrap_or_else(chrono::Duration::zero);
        for stage in [&self.co_located, &self.displacement].into_iter().flatten() {
            let d = stage.current_delay();
            if d > delay {
                delay = d;
            }
        }
        delay
    }

    pub fn feed_pick(&mut self, pick: &Pick, now: DateTime<Utc>, out: &mut Vec<Output>) -> bool {
        let mut handled = false;
        if let Some(p) = &mut self.native {
            handled |= p.feed_pick(pick, now, out);
        }
        for stage in [&mut self.co_located, &mut self.displacement]
            .into_iter()
            .flatten()
        {
            if let Some(p) = &mut stage.proc {
                handled |= p.feed_pick(pick, now, out);
            }
        }
        handled
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::{EnvelopeResult, Output};

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn cfg() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.vsfndr.enable = true;
        cfg.vsfndr.filter_acc = false;
        cfg.vsfndr.filter_vel = false;
        cfg.vsfndr.filter_disp = false;
        cfg
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

    fn envelopes(out: &[Output]) -> Vec<&EnvelopeResult> {
        out.iter()
            .filter_map(|o| match o {
                Output::Envelope(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn velocity_sensor_produces_all_three_units() {
        let mut p = Preprocessor::vertical(
            &cfg(),
            StreamId::new("CH", "HASLI", "", "HHZ"),
            "M/S",
            false,
        )
        .unwrap();
        assert_eq!(p.unit(), SignalUnit::MeterPerSecond);

        let mut out = Vec::new();
        let now = t("2020-01-01T00:00:03Z");
        // Linear ramp: derivative is constant, integral quadratic
        let mut r = rec("HHZ", "2020-01-01T00:00:00Z", 300, 0.0);
        for (i, v) in r.samples.iter_mut().enumerate() {
            *v = i as f64 * 1e-4;
        }
        p.feed(&r, now, &mut out);
        p.feed(&rec("HHZ", "2020-01-01T00:00:03Z", 1, 0.0), now, &mut out);

        let envs = envelopes(&out);
        let units: std::collections::HashSet<_> = envs.iter().map(|e| e.unit).collect();
        assert!(units.contains(&SignalUnit::MeterPerSecond));
        assert!(units.contains(&SignalUnit::MeterPerSecondSquared));
        assert!(units.contains(&SignalUnit::Meter));
    }

    #[test]
    fn acceleration_sensor_derives_velocity_then_displacement() {
        let mut p = Preprocessor::vertical(
            &cfg(),
            StreamId::new("CH", "HASLI", "", "HGZ"),
            "M/S**2",
            false,
        )
        .unwrap();
        assert_eq!(p.unit(), SignalUnit::MeterPerSecondSquared);

        let mut out = Vec::new();
        let now = t("2020-01-01T00:00:03Z");
        p.feed(&rec("HGZ", "2020-01-01T00:00:00Z", 200, 0.01), now, &mut out);
        p.feed(&rec("HGZ", "2020-01-01T00:00:02Z", 1, 0.0), now, &mut out);

        let envs = envelopes(&out);
        let units: std::collections::HashSet<_> = envs.iter().map(|e| e.unit).collect();
        assert!(units.contains(&SignalUnit::MeterPerSecondSquared));
        assert!(units.contains(&SignalUnit::MeterPerSecond));
        assert!(units.contains(&SignalUnit::Meter));
    }

    #[test]
    fn unknown_gain_unit_is_rejected() {
        assert!(Preprocessor::vertical(
            &cfg(),
            StreamId::new("CH", "HASLI", "", "HHZ"),
            "COUNTS",
            false,
        )
        .is_none());
    }

    #[test]
    fn horizontal_preprocessor_combines_before_processing() {
        let mut c = cfg();
        c.signal.acc = false;
        c.signal.disp = false;
        let mut p = Preprocessor::horizontal(
            &c,
            StreamId::new("CH", "HASLI", "", "HH"),
            "M/S",
            ("HHN".into(), "HHE".into()),
            false,
        )
        .unwrap();

        let mut out = Vec::new();
        let now = t("2020-01-01T00:00:02Z");
        p.feed(&rec("HHN", "2020-01-01T00:00:00Z", 100, 3.0), now, &mut out);
        p.feed(&rec("HHE", "2020-01-01T00:00:00Z", 100, 4.0), now, &mut out);
        p.feed(&rec("HHN", "2020-01-01T00:00:01Z", 100, 3.0), now, &mut out);
        p.feed(&rec("HHE", "2020-01-01T00:00:01Z", 100, 4.0), now, &mut out);

        let envs = envelopes(&out);
        assert!(!envs.is_empty());
        // The envelope of the combined channel sees √(3²+4²)
        assert!((envs[0].value - 5.0).abs() < 1e-9);
        assert_eq!(envs[0].component, ComponentKind::Horizontal);
    }

    #[test]
    fn gap_resets_the_whole_chain() {
        let mut c = cfg();
        c.signal.acc = false;
        c.signal.disp = false;
        let mut p = Preprocessor::vertical(
            &c,
            StreamId::new("CH", "HASLI", "", "HHZ"),
            "M/S",
            false,
        )
        .unwrap();

        let mut out = Vec::new();
        let now = t("2020-01-01T00:00:10Z");
        p.feed(&rec("HHZ", "2020-01-01T00:00:00Z", 150, 1.0), now, &mut out);
        out.clear();

        // Gap: the emitted envelope after the gap covers only post-gap data
        p.feed(&rec("HHZ", "2020-01-01T00:00:02.500Z", 100, 2.0), now, &mut out);
        p.feed(&rec("HHZ", "2020-01-01T00:00:03.500Z", 100, 2.0), now, &mut out);
        let envs = envelopes(&out);
        assert!(!envs.is_empty());
        assert_eq!(envs[0].timestamp, t("2020-01-01T00:00:03Z"));
        assert!((envs[0].value - 2.0).abs() < 1e-9);
    }
}
