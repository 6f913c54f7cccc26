//! Waveform traces and the in-place conditioning applied to them.
//!
//! A [`Trace`] is one contiguous, uniformly sampled double-precision
//! sequence. Record sequences fetched from a stream are merged under a
//! half-sample gap/overlap rule; traces are then demeaned, optionally
//! resampled with a deliberately cheap integer-ratio scheme and filtered.
//! The resampler is not SNR-preserving, but it is bit-reproducible for a
//! given configuration, which the deterministic-output guarantees rely on.

pub mod filter;
pub mod loader;
pub mod mseed;

use hifitime::Epoch;
use log::debug;

use crate::utctime;

/// Half-open time span; all lengths in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeWindow {
    start: Epoch,
    end: Epoch,
}

impl TimeWindow {
    pub fn new(start: Epoch, end: Epoch) -> Self {
        TimeWindow { start, end }
    }

    pub fn with_length(start: Epoch, seconds: f64) -> Self {
        TimeWindow {
            start,
            end: utctime::add_seconds(start, seconds),
        }
    }

    pub fn start(&self) -> Epoch {
        self.start
    }

    pub fn end(&self) -> Epoch {
        self.end
    }

    pub fn length(&self) -> f64 {
        (self.end - self.start).to_seconds()
    }
}

/// One contiguous, uniformly sampled trace.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub network_code: String,
    pub station_code: String,
    pub location_code: String,
    pub channel_code: String,
    start_time: Epoch,
    sampling_frequency: f64,
    data: Vec<f64>,
}

impl Trace {
    pub fn new(
        network_code: &str,
        station_code: &str,
        location_code: &str,
        channel_code: &str,
        start_time: Epoch,
        sampling_frequency: f64,
        data: Vec<f64>,
    ) -> Self {
        Trace {
            network_code: network_code.to_string(),
            station_code: station_code.to_string(),
            location_code: location_code.to_string(),
            channel_code: channel_code.to_string(),
            start_time,
            sampling_frequency,
            data,
        }
    }

    pub fn stream_id(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.network_code, self.station_code, self.location_code, self.channel_code
        )
    }

    pub fn start_time(&self) -> Epoch {
        self.start_time
    }

    pub fn set_start_time(&mut self, start: Epoch) {
        self.start_time = start;
    }

    pub fn end_time(&self) -> Epoch {
        utctime::add_seconds(
            self.start_time,
            self.data.len() as f64 / self.sampling_frequency,
        )
    }

    pub fn time_window(&self) -> TimeWindow {
        TimeWindow::new(self.start_time, self.end_time())
    }

    pub fn sampling_frequency(&self) -> f64 {
        self.sampling_frequency
    }

    pub fn sample_count(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Vec<f64> {
        &mut self.data
    }
}

/// Merge a sequence of records into a single trace.
///
/// Records must share the sampling frequency; a gap larger than half a
/// sample or an overlap stricter than half a sample between consecutive
/// records invalidates the merge.
pub fn merge(records: &[Trace]) -> Option<Trace> {
    let first = records.first()?;
    let freq = first.sampling_frequency;
    let max_allowed_gap = 0.5 / freq;
    let max_allowed_overlap = -0.5 / freq;

    let mut merged = Trace::new(
        &first.network_code,
        &first.station_code,
        &first.location_code,
        &first.channel_code,
        first.start_time,
        freq,
        Vec::new(),
    );

    let mut last: Option<&Trace> = None;
    for rec in records {
        if rec.sampling_frequency != freq {
            debug!(
                "{}: record sampling frequencies are not consistent: {} != {}",
                merged.stream_id(),
                freq,
                rec.sampling_frequency
            );
            return None;
        }

        if let Some(last) = last {
            let diff = (rec.start_time - last.end_time()).to_seconds();
            if diff > max_allowed_gap {
                debug!("{}: gap detected of {:.6}s", merged.stream_id(), diff);
                return None;
            }
            if diff < max_allowed_overlap {
                debug!("{}: overlap detected of {:.6}s", merged.stream_id(), diff);
                return None;
            }
        }

        merged.data.extend_from_slice(&rec.data);
        last = Some(rec);
    }

    Some(merged)
}

/// Cut a trace down to a time window. False (trace untouched) when samples
/// are missing at either end.
pub fn trim(trace: &mut Trace, tw: &TimeWindow) -> bool {
    let freq = trace.sampling_frequency;
    let ofs = ((tw.start() - trace.start_time).to_seconds() * freq) as i64;
    let samples = (tw.length() * freq) as i64;

    if ofs < 0 {
        debug!("{}: need {} more samples in past", trace.stream_id(), -ofs);
        return false;
    }
    if ofs + samples > trace.data.len() as i64 {
        debug!(
            "{}: need {} more samples past the end",
            trace.stream_id(),
            ofs + samples - trace.data.len() as i64
        );
        return false;
    }

    trace.data = trace.data[ofs as usize..(ofs + samples) as usize].to_vec();
    trace.start_time = tw.start();
    true
}

/// Subtract the arithmetic mean in place.
pub fn demean(trace: &mut Trace) {
    if trace.data.is_empty() {
        return;
    }
    let mean = trace.data.iter().sum::<f64>() / trace.data.len() as f64;
    for v in &mut trace.data {
        *v -= mean;
    }
}

/// Integer-ratio resampling to `sf` Hz.
///
/// Downsampling strides through the data and, when `average` is set, box
/// averages over a width of about half the stride; upsampling duplicates
/// the nearest lower-indexed sample. Cheap on purpose.
pub fn resample(trace: &mut Trace, sf: f64, average: bool) {
    if sf <= 0.0 || trace.sampling_frequency == sf {
        return;
    }

    let step = trace.sampling_frequency / sf;
    let old = &trace.data;
    let cnt = old.len();

    if trace.sampling_frequency < sf {
        // upsampling: nearest lower-indexed sample
        let new_len = (cnt as f64 / step) as usize;
        let mut data = Vec::with_capacity(new_len);
        let mut fi = 0.0;
        for _ in 0..new_len {
            data.push(old[(fi as usize).min(cnt - 1)]);
            fi += step;
        }
        trace.data = data;
    } else {
        // downsampling: box average of width ~ half the stride
        let w = if average { (step * 0.5 + 0.5) as usize } else { 0 };
        let mut data = Vec::with_capacity((cnt as f64 / step) as usize + 1);
        let mut fi = 0.0;
        while fi < cnt as f64 {
            let ci = fi as usize;
            if w == 0 {
                data.push(old[ci]);
            } else {
                let mut v = old[ci];
                let mut scale = 1.0;
                for g in 1..w {
                    if ci >= g {
                        v += old[ci - g];
                        scale += 1.0;
                    }
                    if ci + g < cnt {
                        v += old[ci + g];
                        scale += 1.0;
                    }
                }
                data.push(v / scale);
            }
            fi += step;
        }
        trace.data = data;
    }
    trace.sampling_frequency = sf;
}

/// Peak-absolute signal-to-noise ratio around a pick.
///
/// The four offsets are in seconds relative to `pick_time`. Returns -1 when
/// any window exceeds the trace boundaries.
pub fn compute_snr(
    trace: &Trace,
    pick_time: Epoch,
    noise_offset_start: f64,
    noise_offset_end: f64,
    signal_offset_start: f64,
    signal_offset_end: f64,
) -> f64 {
    let freq = trace.sampling_frequency;
    let size = trace.data.len();
    let pick_offset = (pick_time - trace.start_time).to_seconds();

    let sec_to_sample =
        |sec: f64| -> f64 { ((sec + pick_offset) * freq).round().clamp(0.0, size as f64 - 1.0) };

    let noise_start = sec_to_sample(noise_offset_start) as usize;
    let noise_end = sec_to_sample(noise_offset_end) as usize;
    let signal_start = sec_to_sample(signal_offset_start) as usize;
    let signal_end = sec_to_sample(signal_offset_end) as usize;

    // the clamping above cannot push a window fully outside without
    // collapsing it; a collapsed window means the trace is too short
    if noise_start >= noise_end || signal_start >= signal_end {
        log::error!("Cannot compute S2N ratio: noise/signal windows exceed waveform boundaries");
        return -1.0;
    }

    let peak_abs = |range: std::ops::Range<usize>| {
        trace.data[range].iter().fold(-1.0f64, |m, v| m.max(v.abs()))
    };
    let noise_max = peak_abs(noise_start..noise_end);
    let signal_max = peak_abs(signal_start..signal_end);

    signal_max / noise_max
}
