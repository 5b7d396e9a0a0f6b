//! Read-only station metadata store.
//!
//! Loaded once at startup from a JSON document and stable for the lifetime of
//! the process. Provides the lookups the pipeline needs: response epochs by
//! stream and time, three-component groupings by sensor location and
//! instrument, sensor-location coordinates and the station coordinate list
//! the FinDer driver is initialized with.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use seismic_types::StreamId;

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("cannot read inventory file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse inventory file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

// ── Document model ───────────────────────────────────────────────────────────

/// Validity interval of one instrument response with its gain.
/// `end = None` means open-ended.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Epoch {
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    /// Counts per physical unit; absent means the channel cannot be corrected.
    #[serde(default)]
    pub gain: Option<f64>,
    /// Physical unit of the gain-corrected signal ("M/S", "M/S**2", ...).
    pub gain_unit: String,
    #[serde(default)]
    pub sample_rate: Option<f64>,
}

impl Epoch {
    /// True when `time` falls inside `[start, end)`.
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        if time < self.start {
            return false;
        }
        match self.end {
            Some(end) => time < end,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub code: String,
    /// Degrees from horizontal, positive down. Verticals are ±90.
    pub dip: f64,
    /// Degrees clockwise from north.
    #[serde(default)]
    pub azimuth: f64,
    pub epochs: Vec<Epoch>,
}

impl Channel {
    pub fn epoch_at(&self, time: DateTime<Utc>) -> Option<&Epoch> {
        self.epochs.iter().find(|e| e.contains(time))
    }

    /// Orientation metadata distinguishes the vertical component.
    pub fn is_vertical(&self) -> bool {
        self.dip.abs() >= 45.0
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorLocation {
    pub code: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub elevation: Option<f64>,
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Station {
    pub code: String,
    pub locations: Vec<SensorLocation>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub code: String,
    pub stations: Vec<Station>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    pub networks: Vec<Network>,
}

// ── Lookups ──────────────────────────────────────────────────────────────────

/// The three channels of one sensor at one location, vertical first.
#[derive(Debug, Clone)]
pub struct ThreeComponents {
    pub vertical: String,
    pub first_horizontal: String,
    pub second_horizontal: String,
}

/// One station coordinate entry for FinDer initialization.
#[derive(Debug, Clone)]
pub struct StationCoordinate {
    pub network: String,
    pub station: String,
    pub location: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Inventory {
    pub fn load(path: &Path) -> Result<Self, InventoryError> {
        let text = std::fs::read_to_string(path).map_err(|source| InventoryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| InventoryError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn sensor_location(&self, net: &str, sta: &str, loc: &str) -> Option<&SensorLocation> {
        self.networks
            .iter()
            .find(|n| n.code == net)?
            .stations
            .iter()
            .find(|s| s.code == sta)?
            .locations
            .iter()
            .find(|l| l.code == loc)
    }

    fn channel(&self, id: &StreamId) -> Option<&Channel> {
        self.sensor_location(&id.net, &id.sta, &id.loc)?
            .channels
            .iter()
            .find(|c| c.code == id.cha)
    }

    /// Response epoch covering `time` for the given stream.
    pub fn epoch(&self, id: &StreamId, time: DateTime<Utc>) -> Option<&Epoch> {
        self.channel(id)?.epoch_at(time)
    }

    /// Gain unit of the stream's epoch at `time`.
    pub fn gain_unit(&self, id: &StreamId, time: DateTime<Utc>) -> Option<&str> {
        self.epoch(id, time).map(|e| e.gain_unit.as_str())
    }

    /// Gain unit of any channel of the given instrument at one sensor
    /// location. Combined horizontal channels carry only the two-character
    /// instrument code, so the unit is resolved through the location's
    /// member channels.
    pub fn gain_unit_for_instrument(
        &self,
        net: &str,
        sta: &str,
        loc: &str,
        instrument: &str,
        time: DateTime<Utc>,
    ) -> Option<&str> {
        self.sensor_location(net, sta, loc)?
            .channels
            .iter()
            .filter(|c| c.code.starts_with(instrument))
            .find_map(|c| c.epoch_at(time))
            .map(|e| e.gain_unit.as_str())
    }

    /// Resolve the three-component group of one instrument at one sensor
    /// location. All channels must share the two-character instrument code
    /// and have an epoch covering `time`; the vertical is identified by its
    /// dip, the horizontals are ordered by azimuth.
    pub fn three_components(
        &self,
        net: &str,
        sta: &str,
        loc: &str,
        instrument: &str,
        time: DateTime<Utc>,
    ) -> Option<ThreeComponents> {
        let location = self.sensor_location(net, sta, loc)?;

        let mut vertical: Option<&Channel> = None;
        let mut horizontals: Vec<&Channel> = Vec::new();

        for cha in &location.channels {
            if !cha.code.starts_with(instrument) || cha.epoch_at(time).is_none() {
                continue;
            }
            if cha.is_vertical() {
                vertical = Some(cha);
            } else {
                horizontals.push(cha);
            }
        }

        if horizontals.len() != 2 {
            return None;
        }
        horizontals.sort_by(|a, b| a.azimuth.partial_cmp(&b.azimuth).unwrap_or(std::cmp::Ordering::Equal));

        Some(ThreeComponents {
            vertical: vertical?.code.clone(),
            first_horizontal: horizontals[0].code.clone(),
            second_horizontal: horizontals[1].code.clone(),
        })
    }

    /// All sensor-location coordinates, one entry per location.
    pub fn station_coordinates(&self) -> Vec<StationCoordinate> {
        let mut out = Vec::new();
        for net in &self.networks {
            for sta in &net.stations {
                for loc in &sta.locations {
                    out.push(StationCoordinate {
                        network: net.code.clone(),
                        station: sta.code.clone(),
                        location: loc.code.clone(),
                        latitude: loc.latitude,
                        longitude: loc.longitude,
                    });
                }
            }
        }
        out
    }

    /// All stream ids with an epoch covering `time`, for subscription listing.
    pub fn stream_ids(&self, time: DateTime<Utc>) -> Vec<StreamId> {
        let mut out = Vec::new();
        for net in &self.networks {
            for sta in &net.stations {
                for loc in &sta.locations {
                    for cha in &loc.channels {
                        if cha.epoch_at(time).is_some() {
                            out.push(StreamId::new(&net.code, &sta.code, &loc.code, &cha.code));
                        }
                    }
                }
            }
        }
        out
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_inventory() -> Inventory {
        serde_json::from_str(
            r#"{
              "networks": [{
                "code": "CH",
                "stations": [{
                  "code": "HASLI",
                  "locations": [{
                    "code": "",
                    "latitude": 46.757,
                    "longitude": 8.15,
                    "channels": [
                      { "code": "HHZ", "dip": -90.0, "azimuth": 0.0,
                        "epochs": [
                          { "start": "2010-01-01T00:00:00Z", "end": "2015-01-01T00:00:00Z",
                            "gain": 1.5e9, "gainUnit": "M/S" },
                          { "start": "2015-01-01T00:00:00Z", "end": null,
                            "gain": 6.0e8, "gainUnit": "M/S", "sampleRate": 100.0 }
                        ] },
                      { "code": "HHN", "dip": 0.0, "azimuth": 0.0,
                        "epochs": [ { "start": "2010-01-01T00:00:00Z", "end": null,
                                      "gain": 6.0e8, "gainUnit": "M/S" } ] },
                      { "code": "HHE", "dip": 0.0, "azimuth": 90.0,
                        "epochs": [ { "start": "2010-01-01T00:00:00Z", "end": null,
                                      "gain": 6.0e8, "gainUnit": "M/S" } ] },
                      { "code": "HGZ", "dip": -90.0, "azimuth": 0.0,
                        "epochs": [ { "start": "2010-01-01T00:00:00Z", "end": null,
                                      "gain": 2.5e5, "gainUnit": "M/S**2" } ] },
                      { "code": "HGN", "dip": 0.0, "azimuth": 0.0,
                        "epochs": [ { "start": "2010-01-01T00:00:00Z", "end": null,
                                      "gain": 2.5e5, "gainUnit": "M/S**2" } ] },
                      { "code": "HGE", "dip": 0.0, "azimuth": 90.0,
                        "epochs": [ { "start": "2010-01-01T00:00:00Z", "end": null,
                                      "gain": 2.5e5, "gainUnit": "M/S**2" } ] }
                    ]
                  }]
                }]
              }]
            }"#,
        )
        .unwrap()
    }

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn epoch_selection_honors_boundaries() {
        let inv = sample_inventory();
        let id = StreamId::new("CH", "HASLI", "", "HHZ");

        let old = inv.epoch(&id, t("2012-06-01T00:00:00Z")).unwrap();
        assert_eq!(old.gain, Some(1.5e9));

        // Epoch intervals are half-open: the boundary instant belongs to the
        // newer epoch.
        let new = inv.epoch(&id, t("2015-01-01T00:00:00Z")).unwrap();
        assert_eq!(new.gain, Some(6.0e8));

        assert!(inv.epoch(&id, t("2000-01-01T00:00:00Z")).is_none());
    }

    #[test]
    fn three_component_grouping() {
        let inv = sample_inventory();
        let tc = inv
            .three_components("CH", "HASLI", "", "HH", t("2020-01-01T00:00:00Z"))
            .unwrap();
        assert_eq!(tc.vertical, "HHZ");
        assert_eq!(tc.first_horizontal, "HHN");
        assert_eq!(tc.second_horizontal, "HHE");

        let tc = inv
            .three_components("CH", "HASLI", "", "HG", t("2020-01-01T00:00:00Z"))
            .unwrap();
        assert_eq!(tc.vertical, "HGZ");

        assert!(inv
            .three_components("CH", "HASLI", "", "BH", t("2020-01-01T00:00:00Z"))
            .is_none());
    }

    #[test]
    fn station_coordinates_listing() {
        let inv = sample_inventory();
        let coords = inv.station_coordinates();
        assert_eq!(coords.len(), 1);
        assert_eq!(coords[0].station, "HASLI");
        assert!((coords[0].latitude - 46.757).abs() < 1e-9);
    }
}
