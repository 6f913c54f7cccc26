//! Relocation parameters.
//!
//! One [`Config`] drives a whole [`Relocator`](crate::relocator::Relocator)
//! instance: which pick types enter the background catalog, the two
//! neighbor-selection profiles (absolute travel times vs cross-correlation),
//! the per-phase cross-correlation windows, signal-to-noise gating, waveform
//! conditioning, artificial-phase synthesis and the external binaries. The
//! defaults mirror a production microseismicity setup; every field is public
//! and plain so deployments override exactly what they need.

use camino::Utf8PathBuf;

use crate::constants::{Kilometer, Second};

/// Neighbor-selection profile, used once for the `dt.ct` stage and once,
/// usually tighter, for the `dt.cc` stage.
#[derive(Debug, Clone)]
pub struct SelectionParams {
    /// Picks below this weight do not count as shared observations.
    pub min_weight: f64,
    /// Event-to-station distance bounds in km (`max_es_dist <= 0` disables
    /// the upper bound).
    pub min_es_dist: Kilometer,
    pub max_es_dist: Kilometer,
    /// Minimum station-distance to inter-event-distance ratio.
    pub min_es_to_ie_ratio: f64,
    /// Maximum inter-event distance in km (`<= 0` disables).
    pub max_ie_dist: Kilometer,
    /// Required shared observations per candidate neighbor.
    pub min_dt_per_evt: usize,
    /// Cap on observations per neighbor; the surplus is trimmed by dropping
    /// the furthest stations (`0` disables).
    pub max_dt_per_evt: usize,
    /// Fewer surviving neighbors than this skips the reference event.
    pub min_num_neigh: usize,
    /// Neighbor quota (`0` means unlimited).
    pub max_num_neigh: usize,
    /// Number of nested selection ellipsoids.
    pub num_ellipsoids: usize,
    /// Vertical axis length of the outermost ellipsoid in km.
    pub max_ellipsoid_size: Kilometer,
}

impl Default for SelectionParams {
    fn default() -> Self {
        SelectionParams {
            min_weight: 0.0,
            min_es_dist: 0.0,
            max_es_dist: -1.0,
            min_es_to_ie_ratio: 5.0,
            max_ie_dist: 10.0,
            min_dt_per_evt: 4,
            max_dt_per_evt: 0,
            min_num_neigh: 4,
            max_num_neigh: 40,
            num_ellipsoids: 5,
            max_ellipsoid_size: 5.0,
        }
    }
}

/// Cross-correlation windowing for one phase type. The short window is
/// `[pick + start_offset, pick + end_offset]`; the long one extends it by
/// `max_delay` on both sides.
#[derive(Debug, Clone, Copy)]
pub struct XcorrParams {
    pub start_offset: Second,
    pub end_offset: Second,
    pub max_delay: Second,
    /// Minimum accepted correlation coefficient.
    pub min_coef: f64,
}

/// Signal-to-noise gating windows, all offsets relative to the pick time.
#[derive(Debug, Clone, Copy)]
pub struct SnrParams {
    /// Minimum accepted ratio; `<= 0` disables the gate.
    pub min_snr: f64,
    pub noise_start: Second,
    pub noise_end: Second,
    pub signal_start: Second,
    pub signal_end: Second,
}

/// Waveform conditioning applied to every loaded trace.
#[derive(Debug, Clone)]
pub struct FilterParams {
    /// Text-specified causal filter, e.g. `"BW(3,1,20)"`; empty disables.
    pub filter_str: String,
    /// Target sampling frequency in Hz; `<= 0` disables resampling.
    pub resample_freq: f64,
    /// Dump processed traces next to the cache (debugging aid).
    pub dump: bool,
}

/// Artificial-phase synthesis (detection of picks missing from the
/// reference event that nearby events observed).
#[derive(Debug, Clone)]
pub struct ArtificialPhaseParams {
    pub enable: bool,
    /// Also replace automatic picks with cross-correlation derived ones.
    pub fix_auto_phase: bool,
    /// Peers further than this (km) are not considered.
    pub max_ie_dist: Kilometer,
    /// Cross-correlations required (and averaged) per synthesized pick.
    pub num_cc: usize,
    /// Hard cap on the synthesis cross-correlation window length (s).
    pub max_cc_tw: Second,
}

/// Paths to one external executable and its template control file(s).
#[derive(Debug, Clone, Default)]
pub struct Ph2dtTool {
    pub exec: Utf8PathBuf,
    pub ctrl_file: Utf8PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct HypoddTool {
    pub exec: Utf8PathBuf,
    /// Control file for single-event step 1 (no cross-correlation).
    pub step1_ctrl_file: Utf8PathBuf,
    /// Control file for step 2 and for multi-event mode.
    pub step2_ctrl_file: Utf8PathBuf,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Pick types accepted as P/S phases, in priority order.
    pub valid_p_phases: Vec<String>,
    pub valid_s_phases: Vec<String>,

    /// Selection profile for absolute travel-time pairs (`dt.ct`).
    pub dtct: SelectionParams,
    /// Selection profile for cross-correlation pairs (`dt.cc`).
    pub dtcc: SelectionParams,

    pub xcorr_p: XcorrParams,
    pub xcorr_s: XcorrParams,

    pub snr: SnrParams,
    pub wf_filter: FilterParams,
    pub artificial_phases: ArtificialPhaseParams,

    pub ph2dt: Ph2dtTool,
    pub hypodd: HypoddTool,

    /// Cache processed catalog waveforms on disk under `<workdir>/wfcache/`.
    pub use_disk_cache: bool,
    /// Remove per-run directories during resource cleanup.
    pub working_dir_cleanup: bool,
}

impl Config {
    /// Cross-correlation parameters for a canonical phase type ("P"/"S").
    pub fn xcorr(&self, phase_type: &str) -> &XcorrParams {
        if phase_type == "S" {
            &self.xcorr_s
        } else {
            &self.xcorr_p
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            valid_p_phases: vec!["Pg".into(), "P".into(), "Px".into()],
            valid_s_phases: vec!["Sg".into(), "S".into(), "Sx".into()],
            dtct: SelectionParams::default(),
            dtcc: SelectionParams::default(),
            xcorr_p: XcorrParams {
                start_offset: -0.50,
                end_offset: 0.50,
                max_delay: 0.50,
                min_coef: 0.50,
            },
            xcorr_s: XcorrParams {
                start_offset: -0.50,
                end_offset: 0.75,
                max_delay: 0.50,
                min_coef: 0.50,
            },
            snr: SnrParams {
                min_snr: 2.0,
                noise_start: -3.0,
                noise_end: -0.35,
                signal_start: -0.35,
                signal_end: 1.0,
            },
            wf_filter: FilterParams {
                filter_str: "BW(3,1,20)".into(),
                resample_freq: 400.0,
                dump: false,
            },
            artificial_phases: ArtificialPhaseParams {
                enable: false,
                fix_auto_phase: false,
                max_ie_dist: 10.0,
                num_cc: 2,
                max_cc_tw: 10.0,
            },
            ph2dt: Ph2dtTool::default(),
            hypodd: HypoddTool::default(),
            use_disk_cache: true,
            working_dir_cleanup: true,
        }
    }
}
