//! Neighboring-event selection for double-difference pairing.
//!
//! For a reference event the selector keeps up to `max_num_neigh` nearby
//! events that share enough well-constrained station observations, then
//! subsamples them spatially following Waldhauser (2009): space around the
//! reference is carved into concentric, vertically elongated ellipsoidal
//! shells of halving size, each split into 8 octants, and every
//! (shell, octant) cell contributes its closest remaining candidate per
//! sweep. The quota check is a hard global stop for the whole sweep.

use std::collections::BTreeMap;

use ahash::{HashSet, HashSetExt};
use log::debug;
use ordered_float::NotNan;

use crate::catalog::{Catalog, Event};
use crate::config::SelectionParams;
use crate::constants::EventId;
use crate::geom::{compute_distance, compute_distance_azi, ShellEllipsoid};
use crate::rtdd_errors::RtddError;

/// Select the neighbors of `ref_ev` out of `catalog` into a new catalog.
///
/// Fails with [`RtddError::InsufficientNeighbors`] when fewer than
/// `min_num_neigh` candidates survive.
pub fn select_neighbouring_events(
    catalog: &Catalog,
    ref_ev: &Event,
    params: &SelectionParams,
) -> Result<Catalog, RtddError> {
    debug!("Selecting neighbouring events for event {ref_ev}");

    // working copy: observation trimming below must not touch the input
    let mut src_cat = catalog.clone();

    // events within the inter-event distance bound
    let mut distance_by_event: BTreeMap<EventId, f64> = BTreeMap::new();
    let mut azimuth_by_event: BTreeMap<EventId, f64> = BTreeMap::new();
    for (&id, event) in catalog.events() {
        if id == ref_ev.id {
            continue;
        }
        let (distance, da) = compute_distance_azi(
            ref_ev.latitude,
            ref_ev.longitude,
            ref_ev.depth,
            event.latitude,
            event.longitude,
            event.depth,
        );
        if params.max_ie_dist > 0.0 && distance > params.max_ie_dist {
            continue;
        }
        distance_by_event.insert(id, distance);
        azimuth_by_event.insert(id, da.azimuth);
    }

    // keep the events respecting the shared-observation constraints
    let mut selected_events: Vec<(NotNan<f64>, EventId)> = Vec::new();
    let mut included_stations: HashSet<String> = HashSet::new();
    let mut excluded_stations: HashSet<String> = HashSet::new();

    for (&event_id, &event_distance) in &distance_by_event {
        let event = src_cat.get_event(event_id).expect("event vanished").clone();

        // (station distance, station id, phase type) of counted observations
        let mut station_by_distance: Vec<(NotNan<f64>, String, String)> = Vec::new();
        let mut dt_count = 0usize;

        for phase in src_cat.phases_of(event_id) {
            if phase.weight < params.min_weight {
                continue;
            }

            let station = src_cat.stations().get(&phase.station_id).ok_or_else(|| {
                RtddError::MalformedCatalog(format!(
                    "cannot find station '{}' referenced by phase '{}' for event {}",
                    phase.station_id, phase, event
                ))
            })?;

            if excluded_stations.contains(&station.id) {
                continue;
            }

            if !included_stations.contains(&station.id) {
                // station distance to the reference event
                let station_distance = compute_distance(
                    ref_ev.latitude,
                    ref_ev.longitude,
                    ref_ev.depth,
                    station.latitude,
                    station.longitude,
                    -(station.elevation / 1000.0),
                );

                if (params.max_es_dist > 0.0 && station_distance > params.max_es_dist)
                    || station_distance < params.min_es_dist
                {
                    excluded_stations.insert(station.id.clone());
                    continue;
                }

                if station_distance / event_distance < params.min_es_to_ie_ratio {
                    // depends on the current event, cannot exclude globally
                    continue;
                }

                included_stations.insert(station.id.clone());
            }

            // station distance to the current event
            let station_distance = compute_distance(
                event.latitude,
                event.longitude,
                event.depth,
                station.latitude,
                station.longitude,
                -(station.elevation / 1000.0),
            );

            if (params.max_es_dist > 0.0 && station_distance > params.max_es_dist)
                || station_distance < params.min_es_dist
                || (station_distance / event_distance) < params.min_es_to_ie_ratio
            {
                continue;
            }

            // the reference event must observe the same station/phase
            if let Some(ref_phase) =
                src_cat.search_phase(ref_ev.id, &phase.station_id, &phase.phase_type)
            {
                if ref_phase.weight >= params.min_weight {
                    dt_count += 1;
                    station_by_distance.push((
                        NotNan::new(station_distance).unwrap_or_else(|_| NotNan::new(0.0).unwrap()),
                        phase.station_id.clone(),
                        phase.phase_type.clone(),
                    ));
                }
            }
        }

        if dt_count < params.min_dt_per_evt {
            continue;
        }

        // trim the furthest stations beyond the observation cap
        if params.max_dt_per_evt > 0 && dt_count > params.max_dt_per_evt {
            station_by_distance.sort();
            for (_, station_id, phase_type) in station_by_distance.iter().skip(params.max_dt_per_evt)
            {
                src_cat.remove_phase(event_id, station_id, phase_type);
            }
        }

        selected_events.push((
            NotNan::new(event_distance).unwrap_or_else(|_| NotNan::new(f64::MAX).unwrap()),
            event_id,
        ));
        debug!(
            "Selecting possible event {} distance {:.1} azimuth {:.1}",
            event, event_distance, azimuth_by_event[&event_id]
        );
    }

    // closest events first
    selected_events.sort();

    // nested ellipsoids of halving size; the last one is degenerate
    let mut ellipsoids = Vec::with_capacity(params.num_ellipsoids);
    let mut curr_size = params.max_ellipsoid_size;
    for _ in 0..params.num_ellipsoids.saturating_sub(1) {
        ellipsoids.push(ShellEllipsoid::new(
            curr_size,
            ref_ev.latitude,
            ref_ev.longitude,
            ref_ev.depth,
        ));
        curr_size /= 2.0;
    }
    ellipsoids.push(ShellEllipsoid::new(
        0.0,
        ref_ev.latitude,
        ref_ev.longitude,
        ref_ev.depth,
    ));

    // shell x octant sweep: each pass takes at most one event per cell,
    // innermost shell first; reaching the quota stops the whole sweep
    let mut neighbour_cat = Catalog::new();
    let mut num_neighbors = 0usize;

    'sweep: loop {
        let mut picked_this_pass = false;
        for elps_num in (0..ellipsoids.len()).rev() {
            for octant in 1..=8u8 {
                if selected_events.is_empty()
                    || (params.max_num_neigh > 0 && num_neighbors >= params.max_num_neigh)
                {
                    break 'sweep;
                }

                // selected_events is sorted by distance: closest candidate
                // falling inside this cell wins
                let found = selected_events.iter().position(|&(_, id)| {
                    let ev = src_cat.get_event(id).expect("event vanished");
                    if elps_num == 0 {
                        ellipsoids[0].is_outside(ev.latitude, ev.longitude, ev.depth, octant)
                    } else {
                        ellipsoids[elps_num].is_outside(ev.latitude, ev.longitude, ev.depth, octant)
                            && ellipsoids[elps_num - 1].is_inside(
                                ev.latitude,
                                ev.longitude,
                                ev.depth,
                                octant,
                            )
                    }
                });

                if let Some(pos) = found {
                    let (distance, id) = selected_events.remove(pos);
                    neighbour_cat.copy_event(id, &src_cat, true)?;
                    num_neighbors += 1;
                    picked_this_pass = true;
                    debug!(
                        "Chose neighbour event {} ellipsoid {} octant {} distance {:.1} azimuth {:.1}",
                        src_cat.get_event(id).expect("event vanished"),
                        elps_num,
                        octant,
                        distance,
                        azimuth_by_event[&id]
                    );
                }
            }
        }
        if !picked_this_pass {
            break;
        }
    }

    if num_neighbors < params.min_num_neigh {
        return Err(RtddError::InsufficientNeighbors(
            ref_ev.to_string(),
            num_neighbors,
        ));
    }

    Ok(neighbour_cat)
}

/// Neighborhoods for every event of a catalog, keyed by reference event id.
///
/// Each returned catalog contains the reference event itself plus its
/// neighbors. Unordered pairs are reported exactly once: iterating in
/// ascending event id, a pair (A, B) already present in A's neighborhood is
/// removed from B's. Events without enough neighbors are skipped.
pub fn select_neighbouring_events_catalog(
    catalog: &Catalog,
    params: &SelectionParams,
) -> Result<BTreeMap<EventId, Catalog>, RtddError> {
    log::info!("Selecting catalog neighbouring events");

    let mut neighbours_by_event: BTreeMap<EventId, Catalog> = BTreeMap::new();

    for (&event_id, event) in catalog.events() {
        match select_neighbouring_events(catalog, event, params) {
            Ok(mut neighbour_cat) => {
                neighbour_cat.copy_event(event_id, catalog, true)?;
                neighbours_by_event.insert(event_id, neighbour_cat);
            }
            Err(RtddError::InsufficientNeighbors(ev, count)) => {
                debug!("Skipping event {ev}, insufficient number of neighbors ({count})");
            }
            Err(err) => return Err(err),
        }
    }

    // drop duplicated unordered pairs, ascending id order
    let mut existing_pairs: BTreeMap<EventId, Vec<EventId>> = BTreeMap::new();
    for (&curr_event_id, curr_cat) in neighbours_by_event.iter_mut() {
        if let Some(already) = existing_pairs.get(&curr_event_id) {
            for &other in already {
                curr_cat.remove_event(other);
            }
        }
        for &id in curr_cat.events().keys().collect::<Vec<_>>() {
            if id != curr_event_id {
                existing_pairs.entry(id).or_default().push(curr_event_id);
            }
        }
    }

    Ok(neighbours_by_event)
}

#[cfg(test)]
mod clustering_test {
    use super::*;
    use crate::catalog::{Phase, Station};
    use crate::geom::coordinates_at;
    use crate::utctime;
    use hifitime::Epoch;

    fn build_event(lat: f64, lon: f64, depth: f64, seconds_offset: f64) -> Event {
        Event {
            id: 0,
            time: utctime::add_seconds(
                Epoch::from_gregorian_utc(2017, 1, 3, 16, 0, 0, 0),
                seconds_offset,
            ),
            latitude: lat,
            longitude: lon,
            depth,
            magnitude: 1.5,
            horiz_err: 0.1,
            vert_err: 0.2,
            rms: 0.04,
            reloc_info: None,
        }
    }

    fn add_stations(cat: &mut Catalog, ref_lat: f64, ref_lon: f64) -> Vec<String> {
        // ring of stations ~20-30 km away: far enough for a good
        // station-to-interevent distance ratio
        let mut ids = Vec::new();
        for (i, az) in [0.0, 90.0, 180.0, 270.0, 45.0, 225.0].iter().enumerate() {
            let (lat, lon) = coordinates_at(0.22, *az, ref_lat, ref_lon);
            ids.push(cat.add_station(Station {
                id: String::new(),
                latitude: lat,
                longitude: lon,
                elevation: 800.0,
                network_code: "CH".into(),
                station_code: format!("ST{i:02}"),
                location_code: String::new(),
            }));
        }
        ids
    }

    fn add_event_with_picks(cat: &mut Catalog, event: Event, station_ids: &[String]) -> EventId {
        let id = cat.add_event(event);
        let ev = cat.get_event(id).unwrap().clone();
        for sta_id in station_ids {
            for (ptype, tt) in [("P", 3.0), ("S", 5.2)] {
                cat.add_phase(Phase {
                    event_id: id,
                    station_id: sta_id.clone(),
                    time: utctime::add_seconds(ev.time, tt),
                    weight: 1.0,
                    phase_type: ptype.into(),
                    network_code: sta_id.split('.').next().unwrap().into(),
                    station_code: sta_id.split('.').nth(1).unwrap().into(),
                    location_code: String::new(),
                    channel_code: "HHZ".into(),
                    is_manual: true,
                    reloc_info: None,
                });
            }
        }
        id
    }

    /// Eight synthetic neighbors at (+-0.05 deg, +-0.05 deg, depth +-2 km)
    /// around the reference: one per octant must be selected.
    #[test]
    fn one_neighbor_per_octant() {
        let (ref_lat, ref_lon, ref_depth) = (46.3, 7.5, 5.0);
        let mut cat = Catalog::new();
        let station_ids = add_stations(&mut cat, ref_lat, ref_lon);

        let ref_id = add_event_with_picks(
            &mut cat,
            build_event(ref_lat, ref_lon, ref_depth, 0.0),
            &station_ids,
        );

        let mut offset = 10.0;
        for dlat in [0.05, -0.05] {
            for dlon in [0.05, -0.05] {
                for ddepth in [2.0, -2.0] {
                    add_event_with_picks(
                        &mut cat,
                        build_event(ref_lat + dlat, ref_lon + dlon, ref_depth + ddepth, offset),
                        &station_ids,
                    );
                    offset += 10.0;
                }
            }
        }

        let params = SelectionParams {
            max_ie_dist: 30.0,
            min_es_to_ie_ratio: 0.0,
            min_dt_per_evt: 1,
            min_num_neigh: 1,
            max_num_neigh: 8,
            num_ellipsoids: 1,
            max_ellipsoid_size: 20.0,
            ..SelectionParams::default()
        };

        let ref_ev = cat.get_event(ref_id).unwrap().clone();
        let neighbours = select_neighbouring_events(&cat, &ref_ev, &params).unwrap();
        assert_eq!(neighbours.events().len(), 8);
        assert!(!neighbours.events().contains_key(&ref_id));
    }

    #[test]
    fn quota_is_a_hard_stop() {
        let (ref_lat, ref_lon, ref_depth) = (46.3, 7.5, 5.0);
        let mut cat = Catalog::new();
        let station_ids = add_stations(&mut cat, ref_lat, ref_lon);
        let ref_id = add_event_with_picks(
            &mut cat,
            build_event(ref_lat, ref_lon, ref_depth, 0.0),
            &station_ids,
        );

        // plenty of candidates in every direction
        let mut offset = 10.0;
        for d in [0.01, 0.02, 0.03] {
            for dlat in [d, -d] {
                for dlon in [d, -d] {
                    for ddepth in [1.0, -1.0] {
                        add_event_with_picks(
                            &mut cat,
                            build_event(ref_lat + dlat, ref_lon + dlon, ref_depth + ddepth, offset),
                            &station_ids,
                        );
                        offset += 10.0;
                    }
                }
            }
        }

        let params = SelectionParams {
            max_ie_dist: 30.0,
            min_es_to_ie_ratio: 0.0,
            min_dt_per_evt: 1,
            min_num_neigh: 1,
            max_num_neigh: 5,
            num_ellipsoids: 3,
            max_ellipsoid_size: 20.0,
            ..SelectionParams::default()
        };

        let ref_ev = cat.get_event(ref_id).unwrap().clone();
        let neighbours = select_neighbouring_events(&cat, &ref_ev, &params).unwrap();
        assert_eq!(neighbours.events().len(), 5);
    }

    #[test]
    fn too_few_neighbors_is_an_error() {
        let (ref_lat, ref_lon) = (46.3, 7.5);
        let mut cat = Catalog::new();
        let station_ids = add_stations(&mut cat, ref_lat, ref_lon);
        let ref_id = add_event_with_picks(
            &mut cat,
            build_event(ref_lat, ref_lon, 5.0, 0.0),
            &station_ids,
        );
        add_event_with_picks(
            &mut cat,
            build_event(ref_lat + 0.01, ref_lon, 5.0, 10.0),
            &station_ids,
        );

        let params = SelectionParams {
            max_ie_dist: 30.0,
            min_es_to_ie_ratio: 0.0,
            min_dt_per_evt: 1,
            min_num_neigh: 4,
            max_num_neigh: 10,
            num_ellipsoids: 2,
            max_ellipsoid_size: 20.0,
            ..SelectionParams::default()
        };

        let ref_ev = cat.get_event(ref_id).unwrap().clone();
        let res = select_neighbouring_events(&cat, &ref_ev, &params);
        assert!(matches!(res, Err(RtddError::InsufficientNeighbors(_, 1))));
    }

    /// Every unordered pair appears in exactly one neighborhood.
    #[test]
    fn catalog_mode_reports_each_pair_once() {
        let (ref_lat, ref_lon) = (46.3, 7.5);
        let mut cat = Catalog::new();
        let station_ids = add_stations(&mut cat, ref_lat, ref_lon);

        let mut offset = 0.0;
        for dlat in [0.0, 0.01, -0.01] {
            for dlon in [0.0, 0.01] {
                add_event_with_picks(
                    &mut cat,
                    build_event(ref_lat + dlat, ref_lon + dlon, 5.0 + dlat * 10.0, offset),
                    &station_ids,
                );
                offset += 10.0;
            }
        }

        let params = SelectionParams {
            max_ie_dist: 30.0,
            min_es_to_ie_ratio: 0.0,
            min_dt_per_evt: 1,
            min_num_neigh: 1,
            max_num_neigh: 10,
            num_ellipsoids: 2,
            max_ellipsoid_size: 20.0,
            ..SelectionParams::default()
        };

        let neighbourhoods = select_neighbouring_events_catalog(&cat, &params).unwrap();

        let mut seen: std::collections::BTreeSet<(EventId, EventId)> = Default::default();
        for (&ref_id, ncat) in &neighbourhoods {
            for &other in ncat.events().keys() {
                if other == ref_id {
                    continue;
                }
                let pair = (ref_id.min(other), ref_id.max(other));
                assert!(seen.insert(pair), "pair {pair:?} reported twice");
            }
        }
        // with 6 tightly packed events every pair must show up
        assert_eq!(seen.len(), 15);
    }

    /// Random cloud: each sweep takes at most one event per (shell, octant)
    /// cell, and the selected set always contains the closest candidate of
    /// every non-empty cell while below the quota.
    #[test]
    fn random_cloud_octant_coverage() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let (ref_lat, ref_lon, ref_depth) = (46.3, 7.5, 5.0);
        let mut rng = StdRng::seed_from_u64(7);

        let mut cat = Catalog::new();
        let station_ids = add_stations(&mut cat, ref_lat, ref_lon);
        let ref_id = add_event_with_picks(
            &mut cat,
            build_event(ref_lat, ref_lon, ref_depth, 0.0),
            &station_ids,
        );

        let mut offset = 10.0;
        for _ in 0..80 {
            let dlat: f64 = rng.gen_range(-0.05..0.05);
            let dlon: f64 = rng.gen_range(-0.05..0.05);
            let ddepth: f64 = rng.gen_range(-3.0..3.0);
            add_event_with_picks(
                &mut cat,
                build_event(ref_lat + dlat, ref_lon + dlon, ref_depth + ddepth, offset),
                &station_ids,
            );
            offset += 10.0;
        }

        let params = SelectionParams {
            max_ie_dist: 50.0,
            min_es_to_ie_ratio: 0.0,
            min_dt_per_evt: 1,
            min_num_neigh: 1,
            max_num_neigh: 8,
            num_ellipsoids: 1,
            max_ellipsoid_size: 40.0,
            ..SelectionParams::default()
        };

        let ref_ev = cat.get_event(ref_id).unwrap().clone();
        let neighbours = select_neighbouring_events(&cat, &ref_ev, &params).unwrap();

        // single degenerate ellipsoid: one pass picks at most one event per
        // octant, so with quota 8 each octant contributes at most one
        let shell = ShellEllipsoid::new(0.0, ref_lat, ref_lon, ref_depth);
        let mut per_octant = [0usize; 9];
        for ev in neighbours.events().values() {
            let octant = (1..=8u8)
                .find(|&q| shell.is_in_octant(ev.latitude, ev.longitude, ev.depth, q))
                .unwrap();
            per_octant[octant as usize] += 1;
        }
        assert!(per_octant[1..].iter().all(|&n| n <= 1));

        // and each selected event is the closest of its octant
        for ev in neighbours.events().values() {
            let octant = (1..=8u8)
                .find(|&q| shell.is_in_octant(ev.latitude, ev.longitude, ev.depth, q))
                .unwrap();
            let ev_dist =
                compute_distance(ref_lat, ref_lon, ref_depth, ev.latitude, ev.longitude, ev.depth);
            for other in cat.events().values() {
                if other.id == ref_id || neighbours.events().contains_key(&other.id) {
                    continue;
                }
                if shell.is_in_octant(other.latitude, other.longitude, other.depth, octant) {
                    let other_dist = compute_distance(
                        ref_lat,
                        ref_lon,
                        ref_depth,
                        other.latitude,
                        other.longitude,
                        other.depth,
                    );
                    assert!(
                        ev_dist <= other_dist + 1e-9,
                        "octant {octant}: picked {ev_dist:.3} km but {other_dist:.3} km was available"
                    );
                }
            }
        }
    }
}
