//! Shared fixtures for the integration tests: a synthetic earthquake
//! cluster, an inventory/record-stream pair generating the matching
//! waveforms, and a fake `hypoDD` executable.
#![allow(dead_code)]

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use hifitime::Epoch;

use rtdd::catalog::{Catalog, Event, Phase, Station};
use rtdd::inventory::{ChannelOrientation, Inventory, RecordStream, SensorLocation};
use rtdd::rtdd_errors::RtddError;
use rtdd::utctime;
use rtdd::waveform::{TimeWindow, Trace};

pub const SAMPLING_FREQ: f64 = 100.0;

pub fn base_time() -> Epoch {
    Epoch::from_gregorian_utc(2017, 1, 3, 16, 0, 0, 0)
}

/// One wavelet arriving at a station; every channel of that station
/// carries it.
#[derive(Debug, Clone)]
pub struct Arrival {
    pub station_code: String,
    pub time: Epoch,
}

/// Synthetic station metadata: standard ZNE sensors everywhere.
pub struct ScenarioInventory {
    pub stations: Vec<(String, f64, f64)>, // code, lat, lon
}

impl Inventory for ScenarioInventory {
    fn sensor_location(&self, _: &str, station: &str, _: &str, _: Epoch) -> Option<SensorLocation> {
        let (_, lat, lon) = self.stations.iter().find(|(code, _, _)| code == station)?;
        Some(SensorLocation {
            latitude: *lat,
            longitude: *lon,
            elevation: 800.0,
            channels: vec![
                ChannelOrientation { code: "HHZ".into(), azimuth: 0.0, dip: -90.0 },
                ChannelOrientation { code: "HHN".into(), azimuth: 0.0, dip: 0.0 },
                ChannelOrientation { code: "HHE".into(), azimuth: 90.0, dip: 0.0 },
            ],
        })
    }
}

/// Record stream rendering the arrival list: a faint hum plus a tapered
/// 12 Hz wavelet per arrival, identical on every channel of the station.
pub struct ScenarioStream {
    pub arrivals: Vec<Arrival>,
}

fn wavelet(dt: f64) -> f64 {
    if !(0.0..0.3).contains(&dt) {
        return 0.0;
    }
    let taper = (std::f64::consts::PI * dt / 0.3).sin();
    taper * (std::f64::consts::TAU * 12.0 * dt).sin()
}

impl RecordStream for ScenarioStream {
    fn fetch(
        &self,
        net: &str,
        sta: &str,
        loc: &str,
        cha: &str,
        tw: &TimeWindow,
    ) -> Result<Vec<Trace>, RtddError> {
        let start = utctime::add_seconds(tw.start(), -1.0);
        let n = ((tw.length() + 2.0) * SAMPLING_FREQ) as usize;

        let arrivals: Vec<f64> = self
            .arrivals
            .iter()
            .filter(|a| a.station_code == sta)
            .map(|a| utctime::seconds_between(a.time, start))
            .collect();

        let data = (0..n)
            .map(|i| {
                let t = i as f64 / SAMPLING_FREQ;
                let hum = 5e-4 * (std::f64::consts::TAU * 1.3 * t).sin();
                hum + arrivals.iter().map(|a| wavelet(t - a)).sum::<f64>()
            })
            .collect();
        Ok(vec![Trace::new(net, sta, loc, cha, start, SAMPLING_FREQ, data)])
    }
}

/// A compact cluster of events observed by a ring of distant stations.
///
/// Every event carries manual P and S picks on all stations; the true
/// waveform arrivals are shifted against the picks by a per-event amount,
/// which is what the cross-correlation is supposed to measure.
pub struct Scenario {
    pub catalog: Catalog,
    pub inventory: ScenarioInventory,
    pub arrivals: Vec<Arrival>,
}

pub fn station(code: &str, lat: f64, lon: f64) -> Station {
    Station {
        id: String::new(),
        latitude: lat,
        longitude: lon,
        elevation: 800.0,
        network_code: "CH".into(),
        station_code: code.into(),
        location_code: String::new(),
    }
}

pub fn event_at(lat: f64, lon: f64, depth: f64, origin: Epoch) -> Event {
    Event {
        id: 0,
        time: origin,
        latitude: lat,
        longitude: lon,
        depth,
        magnitude: 1.8,
        horiz_err: 0.1,
        vert_err: 0.2,
        rms: 0.04,
        reloc_info: None,
    }
}

pub fn pick(event: &Event, station_id: &str, phase_type: &str, travel_time: f64) -> Phase {
    Phase {
        event_id: event.id,
        station_id: station_id.to_string(),
        time: utctime::add_seconds(event.time, travel_time),
        weight: 1.0,
        phase_type: phase_type.to_string(),
        network_code: station_id.split('.').next().unwrap().to_string(),
        station_code: station_id.split('.').nth(1).unwrap().to_string(),
        location_code: String::new(),
        channel_code: "HHZ".into(),
        is_manual: true,
        reloc_info: None,
    }
}

/// Build the default cluster: `num_events` hypocenters within ~2 km of
/// (46.3, 7.5, 5 km), four stations 25-30 km away, origins one minute
/// apart. Waveform arrivals are offset from the picks by
/// `0.01 * (event index - 1)` seconds.
pub fn build_scenario(num_events: usize) -> Scenario {
    let center = (46.3, 7.5);
    let mut catalog = Catalog::new();

    let station_defs = [
        ("ST01", center.0 + 0.25, center.1),
        ("ST02", center.0 - 0.25, center.1),
        ("ST03", center.0, center.1 + 0.33),
        ("ST04", center.0, center.1 - 0.33),
    ];
    let mut station_ids = Vec::new();
    for (code, lat, lon) in station_defs {
        station_ids.push(catalog.add_station(station(code, lat, lon)));
    }

    let mut arrivals = Vec::new();
    for i in 0..num_events {
        let lat = center.0 + 0.004 * (i % 3) as f64 - 0.004;
        let lon = center.1 + 0.005 * (i % 2) as f64 - 0.0025;
        let depth = 5.0 + 0.4 * i as f64;
        let origin = utctime::add_seconds(base_time(), 60.0 * i as f64);
        let id = catalog.add_event(event_at(lat, lon, depth, origin));
        let event = catalog.get_event(id).unwrap().clone();

        // the waveform arrives slightly off the pick
        let eps = 0.01 * (i as f64 - 1.0);

        for (sta_idx, sta_id) in station_ids.iter().enumerate() {
            let (_, sta_lat, sta_lon) = station_defs[sta_idx];
            let distance = rtdd::geom::compute_distance(lat, lon, depth, sta_lat, sta_lon, -0.8);
            for (phase_type, velocity) in [("P", 6.0), ("S", 3.0)] {
                let travel_time = distance / velocity;
                let phase = pick(&event, sta_id, phase_type, travel_time);
                arrivals.push(Arrival {
                    station_code: phase.station_code.clone(),
                    time: utctime::add_seconds(phase.time, eps),
                });
                catalog.add_phase(phase);
            }
        }
    }

    let inventory = ScenarioInventory {
        stations: station_defs
            .iter()
            .map(|(code, lat, lon)| (code.to_string(), *lat, *lon))
            .collect(),
    };

    Scenario {
        catalog,
        inventory,
        arrivals,
    }
}

/// A stand-in `hypoDD`: transforms `event.dat` into a `hypoDD.reloc` that
/// moves every event by (+0.001, -0.001, +0.5 km) and reports fixed
/// observation counts and residuals.
pub fn fake_hypodd(dir: &Utf8Path) -> Utf8PathBuf {
    let path = dir.join("hypodd.sh");
    let script = r#"#!/bin/sh
awk '{
  date=$1; time=$2;
  yr=substr(date,1,4); mo=substr(date,5,2); dy=substr(date,7,2);
  hr=substr(time,1,2); mi=substr(time,3,2);
  sc=substr(time,5,2) "." substr(time,7,2);
  printf "%s %.6f %.6f %.3f 0.0 0.0 0.0 120.0 130.0 140.0 %s %s %s %s %s %s %s 3 2 5 4 0.11 0.33 1\n",
         $10, $3+0.001, $4-0.001, $5+0.5, yr, mo, dy, hr, mi, sc, $6
}' event.dat > hypoDD.reloc
touch hypoDD.loc hypoDD.sta hypoDD.src
"#;
    fs::write(&path, script).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// A minimal hypoDD control file template (version 1 layout).
pub fn fake_hypodd_ctrl(dir: &Utf8Path) -> Utf8PathBuf {
    let path = dir.join("hypoDD.inp.template");
    fs::write(
        &path,
        "* hypoDD control file\n\
         dt.cc\ndt.ct\nevent.dat\nstation.dat\n\
         hypoDD.loc\nhypoDD.reloc\nhypoDD.sta\nhypoDD.res\nhypoDD.src\n\
         1 1 200\n",
    )
    .unwrap();
    path
}

pub fn utf8(path: &std::path::Path) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
}
