//! Record and pick routing.
//!
//! The first record of an unseen stream triggers an inventory lookup of the
//! three-component group behind it; one vertical preprocessor and one shared
//! horizontal preprocessor are built and registered under the three stream
//! ids (both horizontal ids map to the same preprocessor). A station index
//! (`NET.STA` → preprocessors) dispatches picks.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use seismic_types::{Pick, Record, StreamId};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::inventory::Inventory;
use crate::preprocessor::Preprocessor;
use crate::processors::Output;

pub struct Router {
    config: Arc<EngineConfig>,
    inventory: Arc<Inventory>,
    dump: bool,
    procs: Vec<Preprocessor>,
    table: HashMap<StreamId, usize>,
    station_index: HashMap<String, Vec<usize>>,
}

impl Router {
    pub fn new(config: Arc<EngineConfig>, inventory: Arc<Inventory>, dump: bool) -> Self {
        Self {
            config,
            inventory,
            dump,
            procs: Vec::new(),
            table: HashMap::new(),
            station_index: HashMap::new(),
        }
    }

    pub fn reset(&mut self) {
        self.procs.clear();
        self.table.clear();
        self.station_index.clear();
    }

    pub fn preprocessor_count(&self) -> usize {
        self.procs.len()
    }

    /// Largest horizontal inter-component delay over all preprocessors.
    pub fn max_horizontal_delay(&self) -> chrono::Duration {
        self.procs
            .iter()
            .map(|p| p.current_delay())
            .max()
            .unwrap_or_else(chrono::Duration::zero)
    }

    pub fn route_record(&mut self, rec: &Record, now: DateTime<Utc>, out: &mut Vec<Output>) -> bool {
        if let Some(&idx) = self.table.get(&rec.id) {
            self.procs[idx].feed(rec, now, out);
            return true;
        }

        self.create_routing(rec);

        match self.table.get(&rec.id) {
            Some(&idx) => {
                self.procs[idx].feed(rec, now, out);
                true
            }
            None => false,
        }
    }

    /// Resolve the three-component group of `rec` and register its two
    /// preprocessors. Failed lookups are not cached: metadata may appear with
    /// a later epoch.
    fn create_routing(&mut self, rec: &Record) {
        let id = &rec.id;
        let instrument = id.instrument().to_string();

        let Some(tc) = self.inventory.three_components(
            &id.net,
            &id.sta,
            &id.loc,
            &instrument,
            rec.start,
        ) else {
            warn!("[{id}] could not query three components: cannot route record");
            return;
        };

        debug!(
            "created new three component routing for {}.{}.{}.{}",
            id.net, id.sta, id.loc, instrument
        );

        let vid = StreamId::new(&id.net, &id.sta, &id.loc, &tc.vertical);
        let hid1 = StreamId::new(&id.net, &id.sta, &id.loc, &tc.first_horizontal);
        let hid2 = StreamId::new(&id.net, &id.sta, &id.loc, &tc.second_horizontal);

        let station_key = id.station_id();

        // Vertical preprocessor, driven by the vertical channel's gain unit
        if let Some(unit) = self.inventory.gain_unit(&vid, rec.start) {
            let unit = unit.to_string();
            match Preprocessor::vertical(&self.config, vid.clone(), &unit, self.dump) {
                Some(proc) => {
                    let idx = self.push_proc(proc, &station_key);
                    self.table.insert(vid.clone(), idx);
                }
                None => warn!("[{vid}] failed to build vertical preprocessor"),
            }
        } else {
            warn!("[{vid}] no epoch for vertical component");
        }

        // One shared horizontal preprocessor for both horizontal ids. Both
        // horizontals are combined into a single component, so the
        // configuration of the first horizontal drives the unit.
        if let Some(unit) = self.inventory.gain_unit(&hid1, rec.start) {
            let unit = unit.to_string();
            let hwid = StreamId::new(&id.net, &id.sta, &id.loc, &instrument);
            match Preprocessor::horizontal(
                &self.config,
                hwid,
                &unit,
                (tc.first_horizontal.clone(), tc.second_horizontal.clone()),
                self.dump,
            ) {
                Some(proc) => {
                    let idx = self.push_proc(proc, &station_key);
                    self.table.insert(hid1.clone(), idx);
                    self.table.insert(hid2.clone(), idx);
                }
                None => warn!("[{hid1}] failed to build horizontal preprocessor"),
            }
        } else {
            warn!("[{hid1}] no epoch for horizontal component");
        }
    }

    fn push_proc(&mut self, proc: Preprocessor, station_key: &str) -> usize {
        let idx = self.procs.len();
        self.procs.push(proc);
        self.station_index
            .entry(station_key.to_string())
            .or_default()
            .push(idx);
        idx
    }

    /// Dispatch a pick to every preprocessor of its station.
    pub fn route_pick(&mut self, pick: &Pick, now: DateTime<Utc>, out: &mut Vec<Output>) -> bool {
        let key = pick.stream.station_id();
        let indices = match self.station_index.get(&key) {
            Some(indices) => indices.clone(),
            None => return false,
        };

        let mut routed = false;
        for idx in indices {
            if self.procs[idx].feed_pick(pick, now, out) {
                routed = true;
            }
        }
        routed
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::tests::sample_inventory;
    use crate::processors::Output;

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn cfg() -> Arc<EngineConfig> {
        let mut cfg = EngineConfig::default();
        cfg.vsfndr.enable = true;
        cfg.vsfndr.filter_acc = false;
        cfg.vsfndr.filter_vel = false;
        cfg.vsfndr.filter_disp = false;
        cfg.filterbank.enable = true;
        Arc::new(cfg)
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
    fn builds_two_preprocessors_and_three_table_entries() {
        let mut router = Router::new(cfg(), Arc::new(sample_inventory()), false);
        let mut out = Vec::new();
        let now = t("2020-01-01T00:00:01Z");

        assert!(router.route_record(&rec("HHZ", "2020-01-01T00:00:00Z", 100, 1.0), now, &mut out));
        // Vertical + horizontal built on first sight
        assert_eq!(router.preprocessor_count(), 2);

        // Both horizontal ids route to the same (already created) processor
        assert!(router.route_record(&rec("HHN", "2020-01-01T00:00:00Z", 100, 3.0), now, &mut out));
        assert!(router.route_record(&rec("HHE", "2020-01-01T00:00:00Z", 100, 4.0), now, &mut out));
        assert_eq!(router.preprocessor_count(), 2);
    }

    #[test]
    fn unknown_station_is_not_routed() {
        let mut router = Router::new(cfg(), Arc::new(sample_inventory()), false);
        let mut out = Vec::new();
        let now = t("2020-01-01T00:00:01Z");
        let mut r = rec("HHZ", "2020-01-01T00:00:00Z", 10, 1.0);
        r.id = StreamId::new("XX", "NOPE", "", "HHZ");
        assert!(!router.route_record(&r, now, &mut out));
        assert_eq!(router.preprocessor_count(), 0);
    }

    #[test]
    fn second_instrument_gets_its_own_group() {
        let mut router = Router::new(cfg(), Arc::new(sample_inventory()), false);
        let mut out = Vec::new();
        let now = t("2020-01-01T00:00:01Z");

        router.route_record(&rec("HHZ", "2020-01-01T00:00:00Z", 10, 1.0), now, &mut out);
        router.route_record(&rec("HGZ", "2020-01-01T00:00:00Z", 10, 1.0), now, &mut out);
        assert_eq!(router.preprocessor_count(), 4);
    }

    #[test]
    fn picks_reach_station_processors() {
        let mut router = Router::new(cfg(), Arc::new(sample_inventory()), false);
        let mut out = Vec::new();
        let now = t("2020-01-01T00:00:02Z");

        router.route_record(&rec("HHZ", "2020-01-01T00:00:00Z", 200, 1.0), now, &mut out);
        out.clear();

        let pick = Pick {
            public_id: "pk1".into(),
            stream: StreamId::new("CH", "HASLI", "", "HHZ"),
            time: t("2020-01-01T00:00:01Z"),
            phase_hint: Some("P".into()),
        };
        assert!(router.route_pick(&pick, now, &mut out));
        // The filter bank on the native velocity published trigger state
        assert!(out
            .iter()
            .any(|o| matches!(o, Output::FilterBank(r) if r.pick_id == "pk1")));

        let unknown = Pick {
            stream: StreamId::new("XX", "NOPE", "", "HHZ"),
            ..pick
        };
        assert!(!router.route_pick(&unknown, now, &mut out));
    }
}
