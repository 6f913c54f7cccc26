//! Catalog model: stations, events and phase picks.
//!
//! A [`Catalog`] is a consistent triple of stations-by-id, events-by-id and
//! phases grouped by event id. Event ids are assigned by the catalog and are
//! stable only within one instance: merging two catalogs renumbers, and
//! callers re-resolve their event by value afterwards
//! ([`Catalog::search_event`]). Events iterate in ascending id order and
//! phases keep their insertion order within an event; both orderings are
//! behavioural because the double-difference files are emitted straight from
//! them.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;

use camino::Utf8Path;
use hifitime::Epoch;
use log::{debug, warn};

use crate::constants::{Degree, EventId, Kilometer};
use crate::rtdd_errors::RtddError;
use crate::utctime;

/// A seismic station. Elevation is meters above sea level; geometry code
/// converts it to a negative depth in km.
#[derive(Debug, Clone, PartialEq)]
pub struct Station {
    /// `network.station.location`
    pub id: String,
    pub latitude: Degree,
    pub longitude: Degree,
    pub elevation: f64,
    pub network_code: String,
    pub station_code: String,
    pub location_code: String,
}

impl fmt::Display for Station {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Post-relocation statistics attached to an event by the result loader.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EventRelocInfo {
    pub lon_uncertainty: Kilometer,
    pub lat_uncertainty: Kilometer,
    pub depth_uncertainty: Kilometer,
    pub num_cc_p: u32,
    pub num_cc_s: u32,
    pub num_ct_p: u32,
    pub num_ct_s: u32,
    pub rms_residual_cc: f64,
    pub rms_residual_ct: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: EventId,
    /// Origin time, UTC.
    pub time: Epoch,
    pub latitude: Degree,
    pub longitude: Degree,
    /// Km, positive down.
    pub depth: Kilometer,
    pub magnitude: f64,
    pub horiz_err: f64,
    pub vert_err: f64,
    pub rms: f64,
    pub reloc_info: Option<EventRelocInfo>,
}

impl Event {
    pub fn is_relocated(&self) -> bool {
        self.reloc_info.is_some()
    }

    /// Value identity used by [`Catalog::search_event`]: id and relocation
    /// state are deliberately ignored.
    fn same_origin(&self, other: &Event) -> bool {
        self.time == other.time
            && self.latitude == other.latitude
            && self.longitude == other.longitude
            && self.depth == other.depth
            && self.magnitude == other.magnitude
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:.6}, {:.6}, {:.3} km) {}",
            self.id,
            self.latitude,
            self.longitude,
            self.depth,
            utctime::to_iso(self.time)
        )
    }
}

/// Residual information attached to a phase by the result loader.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseRelocInfo {
    pub residual: f64,
    pub final_weight: f64,
}

/// A picked seismic arrival, belonging to exactly one event and referring
/// to one station.
#[derive(Debug, Clone, PartialEq)]
pub struct Phase {
    pub event_id: EventId,
    pub station_id: String,
    pub time: Epoch,
    /// Pick weight in [0, 1]; 0 means "ignore for inversion".
    pub weight: f64,
    /// Arbitrary pick code before filtering ("Pg", "Sn", ...), normalized to
    /// "P"/"S" by [`Catalog::filter_out_phases`].
    pub phase_type: String,
    pub network_code: String,
    pub station_code: String,
    pub location_code: String,
    pub channel_code: String,
    pub is_manual: bool,
    pub reloc_info: Option<PhaseRelocInfo>,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} phase {} for event {} at {}",
            self.phase_type,
            self.station_id,
            self.event_id,
            utctime::to_iso(self.time)
        )
    }
}

/// An immutable-after-construction set of stations, events and phases.
/// Mutation happens only through the explicit copy-and-mutate operations
/// below.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    stations: BTreeMap<String, Station>,
    events: BTreeMap<EventId, Event>,
    phases: BTreeMap<EventId, Vec<Phase>>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    pub fn from_parts(
        stations: BTreeMap<String, Station>,
        events: BTreeMap<EventId, Event>,
        phases: BTreeMap<EventId, Vec<Phase>>,
    ) -> Self {
        Catalog {
            stations,
            events,
            phases,
        }
    }

    pub fn stations(&self) -> &BTreeMap<String, Station> {
        &self.stations
    }

    pub fn events(&self) -> &BTreeMap<EventId, Event> {
        &self.events
    }

    pub fn phases(&self) -> &BTreeMap<EventId, Vec<Phase>> {
        &self.phases
    }

    /// Phases of one event, in insertion order.
    pub fn phases_of(&self, event_id: EventId) -> &[Phase] {
        self.phases.get(&event_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get_event(&self, event_id: EventId) -> Option<&Event> {
        self.events.get(&event_id)
    }

    pub fn update_event(&mut self, event: Event) {
        self.events.insert(event.id, event);
    }

    /// Add an event under a freshly assigned id (max existing id + 1) and
    /// return that id. The id carried by `event` is ignored.
    pub fn add_event(&mut self, event: Event) -> EventId {
        let next_id = self.events.keys().next_back().copied().unwrap_or(0) + 1;
        let mut event = event;
        event.id = next_id;
        self.events.insert(next_id, event);
        next_id
    }

    /// Add a station, keyed `network.station.location`; an existing entry
    /// with the same id wins. Returns the id.
    pub fn add_station(&mut self, station: Station) -> String {
        let id = format!(
            "{}.{}.{}",
            station.network_code, station.station_code, station.location_code
        );
        self.stations.entry(id.clone()).or_insert_with(|| {
            let mut sta = station;
            sta.id = id.clone();
            sta
        });
        id
    }

    pub fn add_phase(&mut self, phase: Phase) {
        self.phases.entry(phase.event_id).or_default().push(phase);
    }

    /// Copy one event (with its phases and their stations) from another
    /// catalog. With `keep_id` the id is preserved and a clash is a
    /// malformed-catalog error; otherwise a new id is assigned. Returns the
    /// id under which the event now lives.
    pub fn copy_event(
        &mut self,
        event_id: EventId,
        from: &Catalog,
        keep_id: bool,
    ) -> Result<EventId, RtddError> {
        let event = from.events.get(&event_id).ok_or_else(|| {
            RtddError::MalformedCatalog(format!("cannot find event id {event_id} in the catalog"))
        })?;

        let new_id = if keep_id {
            if self.events.contains_key(&event.id) {
                return Err(RtddError::MalformedCatalog(format!(
                    "event id {} already present, cannot copy",
                    event.id
                )));
            }
            self.events.insert(event.id, event.clone());
            event.id
        } else {
            self.add_event(event.clone())
        };

        for phase in from.phases_of(event_id) {
            if let Some(station) = from.stations.get(&phase.station_id) {
                self.add_station(station.clone());
            }
            let mut phase = phase.clone();
            phase.event_id = new_id;
            self.add_phase(phase);
        }

        Ok(new_id)
    }

    /// Merge another catalog into a copy of this one. With `keep_ids` the
    /// other catalog's ids are preserved (duplicates skipped); otherwise all
    /// incoming events are renumbered and callers must re-resolve via
    /// [`Catalog::search_event`].
    pub fn merged(&self, other: &Catalog, keep_ids: bool) -> Catalog {
        let mut merged = self.clone();
        for &id in other.events.keys() {
            if keep_ids && merged.events.contains_key(&id) {
                debug!("Skipping duplicated event id {id}");
                continue;
            }
            // clash checked above, cannot fail
            let _ = merged.copy_event(id, other, keep_ids);
        }
        merged
    }

    /// Extract a single event (with phases and stations) into a new catalog.
    pub fn extract_event(&self, event_id: EventId, keep_id: bool) -> Result<Catalog, RtddError> {
        let mut extracted = Catalog::new();
        extracted.copy_event(event_id, self, keep_id)?;
        Ok(extracted)
    }

    pub fn remove_event(&mut self, event_id: EventId) {
        self.events.remove(&event_id);
        self.phases.remove(&event_id);
    }

    pub fn remove_phase(&mut self, event_id: EventId, station_id: &str, phase_type: &str) {
        if let Some(phases) = self.phases.get_mut(&event_id) {
            phases.retain(|ph| !(ph.station_id == station_id && ph.phase_type == phase_type));
            if phases.is_empty() {
                self.phases.remove(&event_id);
            }
        }
    }

    /// Attach post-relocation residual info to one phase. False when the
    /// (event, station, type) key does not resolve.
    pub fn set_phase_reloc_info(
        &mut self,
        event_id: EventId,
        station_id: &str,
        phase_type: &str,
        info: PhaseRelocInfo,
    ) -> bool {
        if let Some(phases) = self.phases.get_mut(&event_id) {
            for ph in phases.iter_mut() {
                if ph.station_id == station_id && ph.phase_type == phase_type {
                    ph.reloc_info = Some(info);
                    return true;
                }
            }
        }
        false
    }

    /// Find an event by value (origin time, coordinates, magnitude); ids are
    /// not compared. This is how callers re-locate their event after a merge
    /// renumbered it.
    pub fn search_event(&self, event: &Event) -> Option<&Event> {
        self.events.values().find(|ev| ev.same_origin(event))
    }

    pub fn search_station(&self, network: &str, station: &str, location: &str) -> Option<&Station> {
        self.stations.get(&format!("{network}.{station}.{location}"))
    }

    pub fn search_phase(
        &self,
        event_id: EventId,
        station_id: &str,
        phase_type: &str,
    ) -> Option<&Phase> {
        self.phases_of(event_id)
            .iter()
            .find(|ph| ph.station_id == station_id && ph.phase_type == phase_type)
    }

    /// Build a catalog holding only the requested pick types, at most one P
    /// and one S per (event, station), with the surviving types renamed to a
    /// canonical "P" or "S".
    ///
    /// `p_keep`/`s_keep` are priority lists: when one station carries
    /// several candidate picks, the type appearing earliest in its list
    /// wins.
    pub fn filter_out_phases(&self, p_keep: &[String], s_keep: &[String]) -> Catalog {
        let mut filtered: BTreeMap<EventId, Vec<Phase>> = BTreeMap::new();

        for (&event_id, phases) in &self.phases {
            let mut selected_p: Vec<(usize, Phase)> = Vec::new();
            let mut selected_s: Vec<(usize, Phase)> = Vec::new();

            for phase in phases {
                let (selected, priority, canonical) =
                    if let Some(p) = p_keep.iter().position(|t| *t == phase.phase_type) {
                        (&mut selected_p, p, "P")
                    } else if let Some(p) = s_keep.iter().position(|t| *t == phase.phase_type) {
                        (&mut selected_s, p, "S")
                    } else {
                        debug!("Discard phase ({phase}), the type is not among the selected ones");
                        continue;
                    };

                let mut phase = phase.clone();
                phase.phase_type = canonical.to_string();

                match selected
                    .iter_mut()
                    .find(|(_, existing)| existing.station_id == phase.station_id)
                {
                    Some((existing_priority, existing)) => {
                        if priority < *existing_priority {
                            debug!("Preferring phase '{phase}' over '{existing}'");
                            *existing_priority = priority;
                            *existing = phase;
                        }
                    }
                    None => selected.push((priority, phase)),
                }
            }

            let event_phases: Vec<Phase> = selected_p
                .into_iter()
                .chain(selected_s)
                .map(|(_, ph)| ph)
                .collect();
            if !event_phases.is_empty() {
                filtered.insert(event_id, event_phases);
            }
        }

        Catalog {
            stations: self.stations.clone(),
            events: self.events.clone(),
            phases: filtered,
        }
    }

    /// Fixed weighting scheme based on pick time uncertainty:
    ///
    /// ```text
    /// Class 0: 0     - 0.025 s  -> 1.00
    ///       1: 0.025 - 0.050 s  -> 0.80
    ///       2: 0.050 - 0.100 s  -> 0.60
    ///       3: 0.100 - 0.200 s  -> 0.40
    ///       4: 0.200 - 0.400 s  -> 0.20
    ///       5: 0.400 -       s  -> 0.10
    /// ```
    pub fn compute_pick_weight(uncertainty: f64) -> f64 {
        if (0.0..=0.025).contains(&uncertainty) {
            1.00
        } else if uncertainty <= 0.050 {
            0.80
        } else if uncertainty <= 0.100 {
            0.60
        } else if uncertainty <= 0.200 {
            0.40
        } else if uncertainty <= 0.400 {
            0.20
        } else {
            0.10
        }
    }

    /// Dump the catalog as three CSV files (debugging aid written into every
    /// run directory).
    pub fn write_to_files(
        &self,
        event_file: &Utf8Path,
        phase_file: &Utf8Path,
        station_file: &Utf8Path,
    ) -> Result<(), RtddError> {
        let mut ev_out = String::from("id,isotime,latitude,longitude,depth,magnitude,horizErr,vertErr,rms\n");
        for event in self.events.values() {
            ev_out.push_str(&format!(
                "{},{},{:.6},{:.6},{:.4},{:.2},{:.4},{:.4},{:.4}\n",
                event.id,
                utctime::to_iso(event.time),
                event.latitude,
                event.longitude,
                event.depth,
                event.magnitude,
                event.horiz_err,
                event.vert_err,
                event.rms
            ));
        }
        fs::File::create(event_file)?.write_all(ev_out.as_bytes())?;

        let mut ph_out = String::from(
            "eventId,stationId,isotime,weight,type,networkCode,stationCode,locationCode,channelCode,evalMode\n",
        );
        for phases in self.phases.values() {
            for ph in phases {
                ph_out.push_str(&format!(
                    "{},{},{},{:.2},{},{},{},{},{},{}\n",
                    ph.event_id,
                    ph.station_id,
                    utctime::to_iso(ph.time),
                    ph.weight,
                    ph.phase_type,
                    ph.network_code,
                    ph.station_code,
                    ph.location_code,
                    ph.channel_code,
                    if ph.is_manual { "manual" } else { "automatic" }
                ));
            }
        }
        fs::File::create(phase_file)?.write_all(ph_out.as_bytes())?;

        let mut sta_out =
            String::from("id,latitude,longitude,elevation,networkCode,stationCode,locationCode\n");
        for sta in self.stations.values() {
            sta_out.push_str(&format!(
                "{},{:.6},{:.6},{:.1},{},{},{}\n",
                sta.id,
                sta.latitude,
                sta.longitude,
                sta.elevation,
                sta.network_code,
                sta.station_code,
                sta.location_code
            ));
        }
        fs::File::create(station_file)?.write_all(sta_out.as_bytes())?;

        Ok(())
    }

    /// Reload a catalog from the CSV triple written by
    /// [`Catalog::write_to_files`].
    pub fn from_csv_files(
        station_file: &Utf8Path,
        event_file: &Utf8Path,
        phase_file: &Utf8Path,
    ) -> Result<Catalog, RtddError> {
        let mut catalog = Catalog::new();

        for row in read_csv(station_file)? {
            let sta = Station {
                id: field(&row, "id", station_file)?.to_string(),
                latitude: parse_field(&row, "latitude", station_file)?,
                longitude: parse_field(&row, "longitude", station_file)?,
                elevation: parse_field(&row, "elevation", station_file)?,
                network_code: field(&row, "networkCode", station_file)?.to_string(),
                station_code: field(&row, "stationCode", station_file)?.to_string(),
                location_code: field(&row, "locationCode", station_file)?.to_string(),
            };
            catalog.stations.insert(sta.id.clone(), sta);
        }

        for row in read_csv(event_file)? {
            let ev = Event {
                id: parse_field(&row, "id", event_file)?,
                time: utctime::from_iso(field(&row, "isotime", event_file)?)?,
                latitude: parse_field(&row, "latitude", event_file)?,
                longitude: parse_field(&row, "longitude", event_file)?,
                depth: parse_field(&row, "depth", event_file)?,
                magnitude: parse_field(&row, "magnitude", event_file)?,
                horiz_err: parse_field(&row, "horizErr", event_file)?,
                vert_err: parse_field(&row, "vertErr", event_file)?,
                rms: parse_field(&row, "rms", event_file)?,
                reloc_info: None,
            };
            catalog.events.insert(ev.id, ev);
        }

        for row in read_csv(phase_file)? {
            let ph = Phase {
                event_id: parse_field(&row, "eventId", phase_file)?,
                station_id: field(&row, "stationId", phase_file)?.to_string(),
                time: utctime::from_iso(field(&row, "isotime", phase_file)?)?,
                weight: parse_field(&row, "weight", phase_file)?,
                phase_type: field(&row, "type", phase_file)?.to_string(),
                network_code: field(&row, "networkCode", phase_file)?.to_string(),
                station_code: field(&row, "stationCode", phase_file)?.to_string(),
                location_code: field(&row, "locationCode", phase_file)?.to_string(),
                channel_code: field(&row, "channelCode", phase_file)?.to_string(),
                is_manual: field(&row, "evalMode", phase_file)? == "manual",
                reloc_info: None,
            };
            if !catalog.stations.contains_key(&ph.station_id) {
                return Err(RtddError::MalformedCatalog(format!(
                    "phase '{ph}' references unknown station '{}'",
                    ph.station_id
                )));
            }
            if !catalog.events.contains_key(&ph.event_id) {
                warn!("Skipping phase '{ph}': event {} not in catalog", ph.event_id);
                continue;
            }
            catalog.add_phase(ph);
        }

        Ok(catalog)
    }
}

type CsvRow = std::collections::HashMap<String, String, ahash::RandomState>;

fn read_csv(path: &Utf8Path) -> Result<Vec<CsvRow>, RtddError> {
    let content = fs::read_to_string(path)?;
    let mut lines = content.lines();
    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| RtddError::Parse(format!("{path}: empty file")))?
        .split(',')
        .collect();

    let mut rows = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let values: Vec<&str> = line.split(',').collect();
        if values.len() != header.len() {
            return Err(RtddError::Parse(format!(
                "{path}: row with {} fields, header has {}",
                values.len(),
                header.len()
            )));
        }
        rows.push(
            header
                .iter()
                .zip(values)
                .map(|(h, v)| (h.to_string(), v.to_string()))
                .collect(),
        );
    }
    Ok(rows)
}

fn field<'a>(row: &'a CsvRow, name: &str, path: &Utf8Path) -> Result<&'a str, RtddError> {
    row.get(name)
        .map(String::as_str)
        .ok_or_else(|| RtddError::Parse(format!("{path}: missing column '{name}'")))
}

fn parse_field<T: std::str::FromStr>(
    row: &CsvRow,
    name: &str,
    path: &Utf8Path,
) -> Result<T, RtddError> {
    field(row, name, path)?
        .parse()
        .map_err(|_| RtddError::Parse(format!("{path}: invalid value in column '{name}'")))
}
