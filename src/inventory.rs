//! Abstract collaborators: station metadata and raw waveform access.
//!
//! The relocator never talks to an acquisition system directly; it goes
//! through these two traits. Production deployments back them with an FDSN
//! or SDS service, tests back them with synthetic implementations.

use hifitime::Epoch;

use crate::rtdd_errors::RtddError;
use crate::waveform::{TimeWindow, Trace};

/// Orientation of one sensor component.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelOrientation {
    /// Full channel code, e.g. `HHZ`.
    pub code: String,
    /// Degrees clockwise from north.
    pub azimuth: f64,
    /// Degrees down from horizontal.
    pub dip: f64,
}

/// Sensor location metadata valid at one point in time.
#[derive(Debug, Clone)]
pub struct SensorLocation {
    pub latitude: f64,
    pub longitude: f64,
    /// Meters above sea level.
    pub elevation: f64,
    pub channels: Vec<ChannelOrientation>,
}

/// The three oriented components sharing one channel-code root.
#[derive(Debug, Clone)]
pub struct ThreeComponents {
    pub vertical: ChannelOrientation,
    pub first_horizontal: ChannelOrientation,
    pub second_horizontal: ChannelOrientation,
}

impl ThreeComponents {
    /// True when `channel_code` names one of the three oriented components,
    /// i.e. the requested stream exists as-is and needs no projection.
    pub fn has_component(&self, channel_code: &str) -> bool {
        self.vertical.code == channel_code
            || self.first_horizontal.code == channel_code
            || self.second_horizontal.code == channel_code
    }
}

impl SensorLocation {
    /// Resolve the three oriented components for a channel-code root
    /// (e.g. `HH`). The vertical is recognized by its dip, the horizontals
    /// are ordered north-ish first. None unless all three are resolvable.
    pub fn three_components(&self, channel_root: &str) -> Option<ThreeComponents> {
        let mut vertical = None;
        let mut horizontals: Vec<&ChannelOrientation> = Vec::new();

        for ch in &self.channels {
            if !ch.code.starts_with(channel_root) || ch.code.len() != channel_root.len() + 1 {
                continue;
            }
            if ch.dip.abs() > 45.0 {
                vertical = Some(ch);
            } else {
                horizontals.push(ch);
            }
        }

        if horizontals.len() != 2 {
            return None;
        }
        // north-ish component first; the angular distance to north breaks
        // the tie for numbered channels (..1/..2)
        let to_north = |az: f64| {
            let az = az.rem_euclid(360.0);
            az.min(360.0 - az)
        };
        horizontals.sort_by(|a, b| {
            to_north(a.azimuth)
                .partial_cmp(&to_north(b.azimuth))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Some(ThreeComponents {
            vertical: vertical?.clone(),
            first_horizontal: horizontals[0].clone(),
            second_horizontal: horizontals[1].clone(),
        })
    }
}

/// Station/channel metadata source.
pub trait Inventory {
    /// Sensor location (with channel orientations) for a stream at a point
    /// in time, or None when the inventory cannot resolve it.
    fn sensor_location(
        &self,
        network: &str,
        station: &str,
        location: &str,
        at: Epoch,
    ) -> Option<SensorLocation>;
}

/// Raw waveform source. Returns the records overlapping a time window as a
/// sequence of contiguous traces; the caller merges, gap-checks and trims.
pub trait RecordStream {
    fn fetch(
        &self,
        network: &str,
        station: &str,
        location: &str,
        channel: &str,
        window: &TimeWindow,
    ) -> Result<Vec<Trace>, RtddError>;
}
