//! Writers for the text files consumed by `ph2dt` and `hypoDD`.
//!
//! All files are whitespace-tokenized ASCII in the layouts the Fortran
//! binaries expect. Emission iterates events in ascending id order and
//! phases in insertion order, so the output is byte-deterministic for a
//! deterministic catalog. Phases picked before their origin time carry no
//! information for the inversion and are skipped with a warning.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;

use camino::Utf8Path;
use log::{info, warn};

use crate::catalog::{Catalog, Event, Phase, Station};
use crate::constants::EventId;
use crate::rtdd_errors::RtddError;
use crate::utctime;

/// `station.dat`: one line per station, `ID LAT LON ELV`.
///
/// ```text
/// NCAAS 38.4301 -121.11   12
/// NCABA 38.8793 -121.067  25
/// ```
pub fn create_station_dat(catalog: &Catalog, path: &Utf8Path) -> Result<(), RtddError> {
    info!("Creating station file {path}");

    let mut out = String::new();
    for station in catalog.stations().values() {
        writeln!(
            out,
            "{:<12} {:>12.6} {:>12.6} {:>12.0}",
            station.id, station.latitude, station.longitude, station.elevation
        )
        .expect("write to string");
    }
    fs::write(path, out)?;
    Ok(())
}

/// `event.dat`: one line per event,
/// `DATE TIME LAT LON DEP MAG EH EV RMS ID`, the time encoded as
/// `HHMMSSCC` (centiseconds concatenated).
///
/// ```text
/// 19850124   2195871   37.8832  -122.2415   9.800 1.4 0.15 0.51 0.02 38542
/// ```
pub fn create_event_dat(catalog: &Catalog, path: &Utf8Path) -> Result<(), RtddError> {
    info!("Creating event file {path}");

    let mut out = String::new();
    for event in catalog.events().values() {
        out.push_str(&event_dat_line(event));
        out.push('\n');
    }
    fs::write(path, out)?;
    Ok(())
}

fn event_dat_line(event: &Event) -> String {
    let p = utctime::to_parts(event.time);
    let centisec = p.second as u32 * 100 + p.microsecond / 10_000;
    format!(
        "{}{:02}{:02}  {:02}{:02}{:04} {:.6} {:.6} {:.3} {:.2} {:.4} {:.4} {:.4} {}",
        p.year,
        p.month,
        p.day,
        p.hour,
        p.minute,
        centisec,
        event.latitude,
        event.longitude,
        event.depth,
        event.magnitude,
        event.horiz_err,
        event.vert_err,
        event.rms,
        event.id
    )
}

/// `phase.dat` (ph2dt input): per event a header line
/// `# YR MO DY HR MN SC LAT LON DEP MAG EH EZ RMS ID` followed by one
/// observation line `STA TT WGHT PHA` per phase.
pub fn create_phase_dat(catalog: &Catalog, path: &Utf8Path) -> Result<(), RtddError> {
    info!("Creating phase file {path}");

    let mut out = String::new();
    for event in catalog.events().values() {
        let p = utctime::to_parts(event.time);
        writeln!(
            out,
            "# {} {} {} {} {} {:.2} {:.6} {:.6} {:.3} {:.2} {:.4} {:.4} {:.4} {}",
            p.year,
            p.month,
            p.day,
            p.hour,
            p.minute,
            p.second as f64 + p.microsecond as f64 / 1e6,
            event.latitude,
            event.longitude,
            event.depth,
            event.magnitude,
            event.horiz_err,
            event.vert_err,
            event.rms,
            event.id
        )
        .expect("write to string");

        for phase in catalog.phases_of(event.id) {
            let travel_time = utctime::seconds_between(phase.time, event.time);
            if travel_time < 0.0 {
                warn!("Ignoring phase '{phase}' with negative travel time (event '{event}')");
                continue;
            }
            writeln!(
                out,
                "{:<12} {:>12.6} {:>5.2} {:>4}",
                phase.station_id, travel_time, phase.weight, phase.phase_type
            )
            .expect("write to string");
        }
    }
    fs::write(path, out)?;
    Ok(())
}

/// One `dt.ct` block for the pair (ref_ev, event): a header `#  ID1  ID2`
/// followed by `STA TT1 TT2 WGHT PHA` lines for every station/phase both
/// events observe. Empty when no observation survives.
pub fn ct_pair_block(catalog: &Catalog, ref_ev: &Event, event: &Event) -> String {
    let mut block = format!("# {:>10} {:>10}\n", ref_ev.id, event.id);
    let mut dt_count = 0;

    for phase in catalog.phases_of(event.id) {
        let ref_phase =
            match catalog.search_phase(ref_ev.id, &phase.station_id, &phase.phase_type) {
                Some(ph) => ph,
                None => continue,
            };

        let ref_travel_time = utctime::seconds_between(ref_phase.time, ref_ev.time);
        if ref_travel_time < 0.0 {
            warn!("Ignoring phase '{ref_phase}' with negative travel time (event '{ref_ev}')");
            continue;
        }
        let travel_time = utctime::seconds_between(phase.time, event.time);
        if travel_time < 0.0 {
            warn!("Ignoring phase '{phase}' with negative travel time (event '{event}')");
            continue;
        }

        // common observation weight for the pair
        let weight = (ref_phase.weight + phase.weight) / 2.0;

        writeln!(
            block,
            "{:<12} {:.6} {:.6} {:.2} {}",
            ref_phase.station_id, ref_travel_time, travel_time, weight, ref_phase.phase_type
        )
        .expect("write to string");
        dt_count += 1;
    }

    if dt_count > 0 {
        block
    } else {
        String::new()
    }
}

/// Append the `dt.ct` blocks pairing `ref_ev_id` with every other event of
/// the catalog.
pub fn build_abs_ttime_pairs(
    catalog: &Catalog,
    ref_ev_id: EventId,
    out: &mut String,
) -> Result<(), RtddError> {
    let ref_ev = catalog.get_event(ref_ev_id).ok_or_else(|| {
        RtddError::MalformedCatalog(format!("cannot find event id {ref_ev_id} in the catalog"))
    })?;

    for event in catalog.events().values() {
        if event.id == ref_ev.id {
            continue;
        }
        out.push_str(&ct_pair_block(catalog, ref_ev, event));
    }
    Ok(())
}

/// Header of a `dt.cc` block; OTC (origin time correction) is always 0.0.
pub fn cc_pair_header(id1: EventId, id2: EventId) -> String {
    format!("# {id1:>10} {id2:>10}       0.0\n")
}

/// One `dt.cc` observation line: `STA DT WGHT PHA`.
pub fn cc_observation_line(station_id: &str, dt: f64, weight: f64, phase_type: &str) -> String {
    format!("{station_id:<12} {dt:.6} {weight:.4} {phase_type}\n")
}

/// `station.dat` reader. Station ids are split on dots back into
/// network/station/location codes where possible.
pub fn read_station_dat(path: &Utf8Path) -> Result<BTreeMap<String, Station>, RtddError> {
    let content = fs::read_to_string(path)?;
    let mut stations = BTreeMap::new();

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(RtddError::Parse(format!(
                "{path}: unrecognized station line '{line}'"
            )));
        }
        let id = fields[0].to_string();
        let mut codes = id.split('.');
        let station = Station {
            id: id.clone(),
            latitude: parse_num(fields[1], path)?,
            longitude: parse_num(fields[2], path)?,
            elevation: parse_num(fields[3], path)?,
            network_code: codes.next().unwrap_or("").to_string(),
            station_code: codes.next().unwrap_or("").to_string(),
            location_code: codes.next().unwrap_or("").to_string(),
        };
        stations.insert(id, station);
    }
    Ok(stations)
}

/// `phase.dat` reader: rebuilds a catalog (with the given stations) from a
/// ph2dt input file, preserving the event ids it carries.
pub fn read_phase_dat(
    path: &Utf8Path,
    stations: BTreeMap<String, Station>,
) -> Result<Catalog, RtddError> {
    let content = fs::read_to_string(path)?;

    let mut events: BTreeMap<EventId, Event> = BTreeMap::new();
    let mut phases: BTreeMap<EventId, Vec<Phase>> = BTreeMap::new();
    let mut current: Option<Event> = None;

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();

        if fields[0] == "#" {
            if fields.len() != 15 {
                return Err(RtddError::Parse(format!(
                    "{path}: unrecognized event line '{line}'"
                )));
            }
            let seconds: f64 = parse_num(fields[6], path)?;
            let time = utctime::add_seconds(
                hifitime::Epoch::from_gregorian_utc(
                    parse_num::<i32>(fields[1], path)?,
                    parse_num::<u8>(fields[2], path)?,
                    parse_num::<u8>(fields[3], path)?,
                    parse_num::<u8>(fields[4], path)?,
                    parse_num::<u8>(fields[5], path)?,
                    0,
                    0,
                ),
                seconds,
            );
            let event = Event {
                id: parse_num(fields[14], path)?,
                time,
                latitude: parse_num(fields[7], path)?,
                longitude: parse_num(fields[8], path)?,
                depth: parse_num(fields[9], path)?,
                magnitude: parse_num(fields[10], path)?,
                horiz_err: parse_num(fields[11], path)?,
                vert_err: parse_num(fields[12], path)?,
                rms: parse_num(fields[13], path)?,
                reloc_info: None,
            };
            events.insert(event.id, event.clone());
            current = Some(event);
        } else {
            let event = current.as_ref().ok_or_else(|| {
                RtddError::Parse(format!("{path}: observation before any event header"))
            })?;
            if fields.len() != 4 {
                return Err(RtddError::Parse(format!(
                    "{path}: unrecognized observation line '{line}'"
                )));
            }
            let station_id = fields[0].to_string();
            let travel_time: f64 = parse_num(fields[1], path)?;
            let mut codes = station_id.split('.');
            let phase = Phase {
                event_id: event.id,
                station_id: station_id.clone(),
                time: utctime::add_seconds(event.time, travel_time),
                weight: parse_num(fields[2], path)?,
                phase_type: fields[3].to_string(),
                network_code: codes.next().unwrap_or("").to_string(),
                station_code: codes.next().unwrap_or("").to_string(),
                location_code: codes.next().unwrap_or("").to_string(),
                channel_code: String::new(),
                is_manual: false,
                reloc_info: None,
            };
            phases.entry(event.id).or_default().push(phase);
        }
    }

    Ok(Catalog::from_parts(stations, events, phases))
}

fn parse_num<T: std::str::FromStr>(token: &str, path: &Utf8Path) -> Result<T, RtddError> {
    token
        .parse()
        .map_err(|_| RtddError::Parse(format!("{path}: invalid numeric field '{token}'")))
}
