//! Text-specified causal filters.
//!
//! The waveform configuration names its filter the way the processing
//! system does, e.g. `"BW(3,1,20)"` for a third-order Butterworth band-pass
//! between 1 and 20 Hz. Supported forms:
//!
//! * `BW(order, locut, hicut)` - band-pass (high-pass at `locut` cascaded
//!   with low-pass at `hicut`)
//! * `BW_HP(order, corner)` - high-pass
//! * `BW_LP(order, corner)` - low-pass
//!
//! Filters are realized as cascaded causal biquad sections obtained from
//! the bilinear transform with frequency pre-warping; odd orders add one
//! first-order section.

use regex::Regex;

use crate::rtdd_errors::RtddError;
use crate::waveform::Trace;

#[derive(Debug, Clone, Copy)]
enum Kind {
    LowPass,
    HighPass,
}

/// One causal second-order (or degenerate first-order) section in direct
/// form II transposed.
#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Biquad {
    /// Second-order Butterworth stage with quality factor `q` at digital
    /// corner `w0` (radians/sample).
    fn second_order(kind: Kind, w0: f64, q: f64) -> Biquad {
        let cosw = w0.cos();
        let alpha = w0.sin() / (2.0 * q);
        let a0 = 1.0 + alpha;
        let (b0, b1, b2) = match kind {
            Kind::LowPass => {
                let b1 = 1.0 - cosw;
                (b1 / 2.0, b1, b1 / 2.0)
            }
            Kind::HighPass => {
                let b1 = -(1.0 + cosw);
                (-b1 / 2.0, b1, -b1 / 2.0)
            }
        };
        Biquad {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: -2.0 * cosw / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// First-order stage (bilinear transform of 1/(s+1) resp. s/(s+1)).
    fn first_order(kind: Kind, w0: f64) -> Biquad {
        let k = (w0 / 2.0).tan();
        let a0 = k + 1.0;
        match kind {
            Kind::LowPass => Biquad {
                b0: k / a0,
                b1: k / a0,
                b2: 0.0,
                a1: (k - 1.0) / a0,
                a2: 0.0,
            },
            Kind::HighPass => Biquad {
                b0: 1.0 / a0,
                b1: -1.0 / a0,
                b2: 0.0,
                a1: (k - 1.0) / a0,
                a2: 0.0,
            },
        }
    }

    fn apply(&self, data: &mut [f64]) {
        let mut z1 = 0.0;
        let mut z2 = 0.0;
        for v in data {
            let x = *v;
            let y = self.b0 * x + z1;
            z1 = self.b1 * x - self.a1 * y + z2;
            z2 = self.b2 * x - self.a2 * y;
            *v = y;
        }
    }
}

/// Butterworth stages of one kind: pole-pair quality factors plus an
/// optional first-order section for odd orders.
fn butterworth_stages(kind: Kind, order: u32, corner_hz: f64, fs: f64) -> Vec<Biquad> {
    let w0 = std::f64::consts::TAU * corner_hz / fs;
    let n = order as usize;
    let mut stages = Vec::with_capacity(n / 2 + 1);
    for k in 0..n / 2 {
        // pole angle of the k-th conjugate pair of the analog prototype
        let theta = std::f64::consts::PI * (2.0 * k as f64 + 1.0) / (2.0 * n as f64);
        let q = 1.0 / (2.0 * theta.sin());
        stages.push(Biquad::second_order(kind, w0, q));
    }
    if n % 2 == 1 {
        stages.push(Biquad::first_order(kind, w0));
    }
    stages
}

/// A compiled filter, ready to run over traces of one sampling frequency.
#[derive(Debug, Clone)]
pub struct InPlaceFilter {
    stages: Vec<Biquad>,
}

impl InPlaceFilter {
    /// Compile a filter specification for a sampling frequency.
    pub fn create(filter_str: &str, sampling_frequency: f64) -> Result<InPlaceFilter, RtddError> {
        let re = Regex::new(r"^\s*(BW|BW_HP|BW_LP)\s*\(\s*([^)]*)\)\s*$").unwrap();
        let caps = re.captures(filter_str).ok_or_else(|| {
            RtddError::Parse(format!("unsupported filter specification '{filter_str}'"))
        })?;

        let args: Vec<f64> = caps[2]
            .split(',')
            .map(|a| a.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|_| {
                RtddError::Parse(format!("invalid filter arguments in '{filter_str}'"))
            })?;

        let nyquist = sampling_frequency / 2.0;
        let corner_ok = |f: f64| f > 0.0 && f < nyquist;
        let order_of = |v: f64| -> Result<u32, RtddError> {
            if v >= 1.0 && v.fract() == 0.0 && v <= 20.0 {
                Ok(v as u32)
            } else {
                Err(RtddError::Parse(format!(
                    "invalid filter order in '{filter_str}'"
                )))
            }
        };

        let stages = match (&caps[1], args.as_slice()) {
            ("BW", [order, locut, hicut]) => {
                if !corner_ok(*locut) || !corner_ok(*hicut) || locut >= hicut {
                    return Err(RtddError::Parse(format!(
                        "invalid band for '{filter_str}' at {sampling_frequency} Hz"
                    )));
                }
                let order = order_of(*order)?;
                let mut stages =
                    butterworth_stages(Kind::HighPass, order, *locut, sampling_frequency);
                stages.extend(butterworth_stages(
                    Kind::LowPass,
                    order,
                    *hicut,
                    sampling_frequency,
                ));
                stages
            }
            ("BW_HP", [order, corner]) => {
                if !corner_ok(*corner) {
                    return Err(RtddError::Parse(format!(
                        "invalid corner for '{filter_str}' at {sampling_frequency} Hz"
                    )));
                }
                butterworth_stages(Kind::HighPass, order_of(*order)?, *corner, sampling_frequency)
            }
            ("BW_LP", [order, corner]) => {
                if !corner_ok(*corner) {
                    return Err(RtddError::Parse(format!(
                        "invalid corner for '{filter_str}' at {sampling_frequency} Hz"
                    )));
                }
                butterworth_stages(Kind::LowPass, order_of(*order)?, *corner, sampling_frequency)
            }
            _ => {
                return Err(RtddError::Parse(format!(
                    "wrong argument count in '{filter_str}'"
                )))
            }
        };

        Ok(InPlaceFilter { stages })
    }

    pub fn apply(&self, trace: &mut Trace) {
        for stage in &self.stages {
            stage.apply(trace.data_mut());
        }
    }
}
