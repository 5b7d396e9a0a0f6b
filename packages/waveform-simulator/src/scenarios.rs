//! Injectable earthquake scenarios for the waveform simulator.
//!
//! A scenario describes one synthetic event relative to the simulator start:
//! when it nucleates, where, how large, and which stations saturate. Without
//! a scenario the simulator streams pure microseism noise.

use serde::{Deserialize, Serialize};

/// One stretch of forced saturation on a station (datalogger overrange).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipStretch {
    /// Station code to saturate.
    pub station: String,
    /// Seconds after the event origin when clipping begins.
    pub start_offset_s: f64,
    pub duration_s: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Event enabled at all; false streams noise only.
    pub event: bool,
    /// Seconds after simulator start when the event nucleates.
    pub origin_offset_s: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub depth_km: f64,
    pub magnitude: f64,
    /// Emit a P pick packet per station at the modeled arrival time.
    pub emit_picks: bool,
    /// Stations pushed into saturation during the event.
    pub clip: Vec<ClipStretch>,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            event: false,
            origin_offset_s: 30.0,
            latitude: 46.7,
            longitude: 8.2,
            depth_km: 8.0,
            magnitude: 5.0,
            emit_picks: true,
            clip: Vec::new(),
        }
    }
}

/// A moderate local mainshock close to the network.
pub fn preset_mainshock() -> ScenarioConfig {
    ScenarioConfig {
        event: true,
        origin_offset_s: 20.0,
        latitude: 46.7,
        longitude: 8.2,
        depth_km: 8.0,
        magnitude: 5.5,
        emit_picks: true,
        clip: Vec::new(),
    }
}

/// A large event that drives the closest station into saturation.
pub fn preset_saturating(station: &str) -> ScenarioConfig {
    ScenarioConfig {
        event: true,
        origin_offset_s: 20.0,
        magnitude: 6.5,
        clip: vec![ClipStretch {
            station: station.to_string(),
            start_offset_s: 2.0,
            duration_s: 8.0,
        }],
        ..preset_mainshock()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
