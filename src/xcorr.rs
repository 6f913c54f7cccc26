//! Normalized time-domain cross-correlation with cycle-skipping rejection.
//!
//! A pair measurement always correlates a *short* trace (the window around
//! the trusted pick) against a *long* one (the same window extended by the
//! maximum allowed delay on both sides). The correlation series is scanned
//! for its best lag; local maxima are kept on the side so that measurements
//! with ambiguous period alignment can be rejected afterwards:
//! if two or more local maxima reach `Cmax - (1 - Cmax) / 2`, cycle
//! skipping is assumed and the coefficient is set to NaN.

use hifitime::Epoch;
use smallvec::SmallVec;

use crate::config::XcorrParams;
use crate::utctime;
use crate::waveform::{TimeWindow, Trace};

/// The short window around a pick: `[pick + start_offset, pick + end_offset]`.
pub fn time_window_short(params: &XcorrParams, pick_time: Epoch) -> TimeWindow {
    let duration = params.end_offset - params.start_offset;
    TimeWindow::with_length(
        utctime::add_seconds(pick_time, params.start_offset),
        duration,
    )
}

/// The long window: the short one extended by `max_delay` on both sides.
pub fn time_window_long(params: &XcorrParams, pick_time: Epoch) -> TimeWindow {
    let duration = params.end_offset - params.start_offset + params.max_delay * 2.0;
    TimeWindow::with_length(
        utctime::add_seconds(pick_time, params.start_offset - params.max_delay),
        duration,
    )
}

/// One correlation measurement. `coeff` is NaN when the series was rejected
/// by the cycle-skipping check (or never produced a finite value).
#[derive(Debug, Clone, Copy)]
pub struct XcorrMeasure {
    /// Lag in seconds maximizing the correlation.
    pub lag: f64,
    /// Correlation coefficient at that lag, in [-1, 1].
    pub coeff: f64,
}

/// Correlate two demeaned traces over integer lags within `±max_delay`
/// seconds. None when the sampling frequencies differ.
///
/// The shorter trace slides against the longer one, centered; lags whose
/// indices fall outside the longer trace skip those terms (partial sums,
/// no zero padding). When the first trace is the longer one the sign of
/// the returned lag is negated, so the lag is always expressed in the
/// first-argument time frame.
pub fn xcorr_series(
    tr1: &Trace,
    tr2: &Trace,
    max_delay: f64,
    quality_check: bool,
) -> Option<XcorrMeasure> {
    if tr1.sampling_frequency() != tr2.sampling_frequency() {
        log::info!(
            "Cannot cross correlate traces with different sampling freq ({} != {})",
            tr1.sampling_frequency(),
            tr2.sampling_frequency()
        );
        return None;
    }

    let freq = tr1.sampling_frequency();
    let max_delay_smps = (max_delay * freq) as i64;

    let swap = tr1.sample_count() > tr2.sample_count();
    let (shorter, longer) = if swap { (tr2, tr1) } else { (tr1, tr2) };
    let smps_s = shorter.data();
    let smps_l = longer.data();
    let size_s = smps_s.len() as i64;
    let size_l = smps_l.len() as i64;

    let mut best_coeff = f64::NAN;
    let mut best_lag = 0.0;

    // local maxima of the series, for the quality check
    let mut local_maxs: SmallVec<[f64; 16]> = SmallVec::new();
    let mut not_decreasing = false;
    let mut prev_coeff = -1.0;

    for delay in -max_delay_smps..max_delay_smps {
        let mut numer = 0.0;
        let mut denom_l = 0.0;
        let mut denom_s = 0.0;
        for idx_s in 0..size_s {
            let idx_l = idx_s + (size_l - size_s) / 2 + delay;
            if idx_l < 0 || idx_l >= size_l {
                continue;
            }
            let s = smps_s[idx_s as usize];
            let l = smps_l[idx_l as usize];
            numer += s * l;
            denom_l += l * l;
            denom_s += s * s;
        }
        let coeff = numer / (denom_s * denom_l).sqrt();
        if coeff > best_coeff || !best_coeff.is_finite() {
            best_coeff = coeff;
            best_lag = delay as f64 / freq;
        }

        if coeff < prev_coeff && not_decreasing {
            local_maxs.push(prev_coeff);
        }
        not_decreasing = coeff >= prev_coeff;
        prev_coeff = coeff;
    }

    if swap {
        best_lag = -best_lag;
    }

    if quality_check && best_coeff.is_finite() {
        let threshold = best_coeff - (1.0 - best_coeff) / 2.0;
        let mut num_max = 0;
        for &cc in &local_maxs {
            if cc.is_finite() && cc >= threshold {
                num_max += 1;
            }
            if num_max > 1 {
                log::debug!("Cycle skipping detected when cross correlating traces");
                best_coeff = f64::NAN;
                break;
            }
        }
    }

    Some(XcorrMeasure {
        lag: best_lag,
        coeff: best_coeff,
    })
}
