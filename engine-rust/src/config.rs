//! Engine configuration.
//!
//! Loaded from an optional TOML file; every key has a default so an empty (or
//! absent) file yields a working configuration. Key names follow the
//! camelCase spelling of the operator documentation.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

fn d_saturation() -> f64 {
    80.0
}
fn d_baseline() -> f64 {
    60.0
}
fn d_taper() -> f64 {
    60.0
}
fn d_horizontal_buffer() -> f64 {
    60.0
}
fn d_max_horizontal_gap() -> f64 {
    30.0
}
fn d_max_delay() -> f64 {
    5.0
}
fn d_envelope_interval() -> f64 {
    1.0
}
fn d_true() -> bool {
    true
}
fn d_filter_corner() -> f64 {
    1.0 / 3.0
}
fn d_fb_buffer() -> f64 {
    10.0
}
fn d_fb_cutoff() -> f64 {
    10.0
}
fn d_taup_cutoff() -> f64 {
    3.0
}
fn d_envelope_buffer_size() -> f64 {
    120.0
}
fn d_default_envelope_length() -> f64 {
    60.0
}
fn d_interval_1s() -> f64 {
    1.0
}
fn d_max_envelope_delay() -> f64 {
    15.0
}
fn d_clip_timeout() -> f64 {
    30.0
}
fn d_rupture_scale() -> f64 {
    1.5
}
fn d_magnitude_group() -> String {
    "MAGNITUDE".into()
}
fn d_strong_motion_group() -> String {
    "LOCATION".into()
}
fn d_vs_past() -> i64 {
    120
}
fn d_vs_future() -> i64 {
    30
}
fn d_sync_every() -> usize {
    100
}

/// Nine descending octave passbands with an upper frequency of 48 Hz.
fn d_passbands() -> Vec<(f64, f64)> {
    let mut bands = Vec::with_capacity(9);
    let mut hi = 48.0;
    for _ in 0..9 {
        let lo = hi * 0.5;
        bands.push((lo, hi));
        hi = lo;
    }
    bands
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DebugConfig {
    #[serde(default = "d_max_horizontal_gap")]
    pub max_horizontal_gap: f64,
    #[serde(default = "d_max_delay")]
    pub max_delay: f64,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            max_horizontal_gap: d_max_horizontal_gap(),
            max_delay: d_max_delay(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamsConfig {
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
}

/// Which physical signal units the downstream algorithms want. Streams in
/// other units are converted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SignalConfig {
    #[serde(default = "d_true")]
    pub acc: bool,
    #[serde(default = "d_true")]
    pub vel: bool,
    #[serde(default = "d_true")]
    pub disp: bool,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            acc: true,
            vel: true,
            disp: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VsFndrConfig {
    pub enable: bool,
    #[serde(default = "d_envelope_interval")]
    pub envelope_interval: f64,
    pub filter_acc: bool,
    pub filter_vel: bool,
    #[serde(default = "d_true")]
    pub filter_disp: bool,
    #[serde(default = "d_filter_corner")]
    pub filter_corner_freq: f64,
}

impl Default for VsFndrConfig {
    fn default() -> Self {
        Self {
            enable: false,
            envelope_interval: d_envelope_interval(),
            filter_acc: false,
            filter_vel: false,
            filter_disp: true,
            filter_corner_freq: d_filter_corner(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FilterBankConfig {
    pub enable: bool,
    #[serde(default = "d_fb_buffer")]
    pub buffer_length: f64,
    #[serde(default = "d_fb_cutoff")]
    pub cutoff_time: f64,
    #[serde(default = "d_passbands")]
    pub passbands: Vec<(f64, f64)>,
}

impl Default for FilterBankConfig {
    fn default() -> Self {
        Self {
            enable: false,
            buffer_length: d_fb_buffer(),
            cutoff_time: d_fb_cutoff(),
            passbands: d_passbands(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TaupConfig {
    pub enable: bool,
    pub dead_time: f64,
    #[serde(default = "d_taup_cutoff")]
    pub cut_off_time: f64,
}

impl Default for TaupConfig {
    fn default() -> Self {
        Self {
            enable: false,
            dead_time: 0.0,
            cut_off_time: d_taup_cutoff(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FinderConfig {
    pub enable: bool,
    /// Path to the external FinDer configuration. Mandatory when enabled.
    pub config: Option<PathBuf>,
    #[serde(default = "d_envelope_buffer_size")]
    pub envelope_buffer_size: f64,
    #[serde(default = "d_default_envelope_length", rename = "defaultFinDerEnvelopeLength")]
    pub default_envelope_length: f64,
    #[serde(default = "d_interval_1s")]
    pub process_interval: f64,
    #[serde(default = "d_interval_1s")]
    pub scan_interval: f64,
    #[serde(default = "d_max_envelope_delay")]
    pub max_envelope_buffer_delay: f64,
    #[serde(default = "d_clip_timeout")]
    pub clip_timeout: f64,
    /// Scale applied to the longest active rupture length when widening the
    /// adaptive maximum window.
    #[serde(default = "d_rupture_scale")]
    pub rupture_window_scale: f64,
    #[serde(default = "d_magnitude_group")]
    pub magnitude_group: String,
    #[serde(default = "d_strong_motion_group")]
    pub strong_motion_group: String,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            enable: false,
            config: None,
            envelope_buffer_size: d_envelope_buffer_size(),
            default_envelope_length: d_default_envelope_length(),
            process_interval: d_interval_1s(),
            scan_interval: d_interval_1s(),
            max_envelope_buffer_delay: d_max_envelope_delay(),
            clip_timeout: d_clip_timeout(),
            rupture_window_scale: d_rupture_scale(),
            magnitude_group: d_magnitude_group(),
            strong_motion_group: d_strong_motion_group(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VsConfig {
    pub enable: bool,
    /// Timeline slots kept behind the reference time, seconds.
    #[serde(default = "d_vs_past")]
    pub past: i64,
    /// Timeline slots kept ahead of the reference time, seconds.
    #[serde(default = "d_vs_future")]
    pub future: i64,
    #[serde(default = "d_clip_timeout")]
    pub clip_timeout: f64,
}

impl Default for VsConfig {
    fn default() -> Self {
        Self {
            enable: false,
            past: d_vs_past(),
            future: d_vs_future(),
            clip_timeout: d_clip_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BusConfig {
    /// Request a sync token from the bus every this many sent messages.
    #[serde(default = "d_sync_every")]
    pub sync_every: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            sync_every: d_sync_every(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Relative saturation threshold in percent of 2^23 counts.
    #[serde(default = "d_saturation")]
    pub saturation_threshold: f64,
    /// Running-average baseline window, seconds.
    #[serde(default = "d_baseline")]
    pub baseline_correction_buffer: f64,
    /// Initial taper ramp, seconds. Zero disables the taper.
    #[serde(default = "d_taper")]
    pub taper_length: f64,
    /// Horizontal component buffering, seconds.
    #[serde(default = "d_horizontal_buffer")]
    pub horizontal_buffer: f64,
    pub debug: DebugConfig,
    pub streams: StreamsConfig,
    pub signal: SignalConfig,
    pub vsfndr: VsFndrConfig,
    pub filterbank: FilterBankConfig,
    pub taup: TaupConfig,
    pub finder: FinderConfig,
    pub vs: VsConfig,
    pub bus: BusConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            saturation_threshold: d_saturation(),
            baseline_correction_buffer: d_baseline(),
            taper_length: d_taper(),
            horizontal_buffer: d_horizontal_buffer(),
            debug: DebugConfig::default(),
            streams: StreamsConfig::default(),
            signal: SignalConfig::default(),
            vsfndr: VsFndrConfig::default(),
            filterbank: FilterBankConfig::default(),
            taup: TaupConfig::default(),
            finder: FinderConfig::default(),
            vs: VsConfig::default(),
            bus: BusConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Absolute saturation threshold in raw counts (percent of 2^23).
    pub fn saturation_counts(&self) -> f64 {
        (1u32 << 23) as f64 * self.saturation_threshold * 0.01
    }

    /// Log every effective value (the `--dump-config` surface).
    pub fn dump(&self, dump_records: bool) {
        debug!("------------------------------------------");
        debug!("EEW config");
        debug!("------------------------------------------");
        debug!("dump-records        : {}", yes_no(dump_records));
        debug!("saturation-threshold: {}%", self.saturation_threshold);
        debug!("baseline-corr-buffer: {}s", self.baseline_correction_buffer);
        debug!("taper length        : {}s", self.taper_length);
        debug!("hor-buffer-size     : {}s", self.horizontal_buffer);
        debug!("hor-max-delay       : {}s", self.debug.max_horizontal_gap);
        debug!("max-delay           : {}s", self.debug.max_delay);
        debug!("enable-acc          : {}", yes_no(self.signal.acc));
        debug!("enable-vel          : {}", yes_no(self.signal.vel));
        debug!("enable-disp         : {}", yes_no(self.signal.disp));
        debug!("enable-vsfndr       : {}", yes_no(self.vsfndr.enable));
        debug!("enable-gba          : {}", yes_no(self.filterbank.enable));
        debug!("enable-omp          : {}", yes_no(self.taup.enable));
        debug!("vs-envelope-interval: {}s", self.vsfndr.envelope_interval);
        debug!("vs-filter-acc       : {}", yes_no(self.vsfndr.filter_acc));
        debug!("vs-filter-vel       : {}", yes_no(self.vsfndr.filter_vel));
        debug!("vs-filter-disp      : {}", yes_no(self.vsfndr.filter_disp));
        debug!("gba-buffer-size     : {}s", self.filterbank.buffer_length);
        debug!("gba-cutoff-time     : {}s", self.filterbank.cutoff_time);
        debug!("gba-passbands       : {}", self.filterbank.passbands.len());
        for (i, (lo, hi)) in self.filterbank.passbands.iter().enumerate() {
            debug!("  [{i:02}] {lo} - {hi}Hz");
        }
        debug!("taup-dead-time      : {}s", self.taup.dead_time);
        debug!("taup-cutoff-time    : {}s", self.taup.cut_off_time);
        debug!("finder-enabled      : {}", yes_no(self.finder.enable));
        debug!("finder-buffer       : {}s", self.finder.envelope_buffer_size);
        debug!("finder-window       : {}s", self.finder.default_envelope_length);
        debug!("------------------------------------------");
    }
}

fn yes_no(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
