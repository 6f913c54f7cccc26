//! Parsing of `hypoDD.reloc` and `hypoDD.res` back into the catalog.

mod common;

use std::collections::BTreeMap;
use std::fs;

use camino::Utf8PathBuf;
use rtdd::catalog::{Catalog, Event, Phase};
use rtdd::config::Config;
use rtdd::utctime;
use rtdd::Relocator;

use common::{base_time, event_at, pick, station, utf8, ScenarioInventory, ScenarioStream};

/// A catalog whose event ids are chosen freely (42 and 43 here).
fn catalog_with_ids() -> (Catalog, String) {
    let mut tmp = Catalog::new();
    let sta_id = tmp.add_station(station("ST01", 46.55, 7.5));
    let stations = tmp.stations().clone();

    let mut events: BTreeMap<u32, Event> = BTreeMap::new();
    let mut phases: BTreeMap<u32, Vec<Phase>> = BTreeMap::new();
    for (id, offset) in [(42u32, 0.0), (43u32, 60.0)] {
        let mut event = event_at(46.3, 7.5, 5.0, utctime::add_seconds(base_time(), offset));
        event.id = id;
        phases.insert(id, vec![pick(&event, &sta_id, "P", 4.0)]);
        events.insert(id, event);
    }

    (Catalog::from_parts(stations, events, phases), sta_id)
}

fn dummy_relocator(base: &Utf8PathBuf, catalog: Catalog) -> Relocator {
    Relocator::new(
        catalog,
        Config::default(),
        base.join("run"),
        Box::new(ScenarioInventory { stations: vec![] }),
        Box::new(ScenarioStream { arrivals: vec![] }),
    )
    .unwrap()
}

#[test]
fn reloc_line_updates_the_matched_event() {
    let dir = tempfile::tempdir().unwrap();
    let base = utf8(dir.path());
    let (catalog, _) = catalog_with_ids();
    let relocator = dummy_relocator(&base, catalog.clone());

    let reloc = base.join("hypoDD.reloc");
    fs::write(
        &reloc,
        "42 46.301000 7.499000 5.500 0.0 0.0 0.0 120.0 130.0 140.0 \
         2017 01 03 16 00 01.25 1.8 3 2 5 4 0.11 0.33 1\n",
    )
    .unwrap();

    let result = relocator
        .load_relocated_catalog(&catalog, &reloc, &base.join("hypoDD.res"))
        .unwrap();

    let ev42 = result.get_event(42).unwrap();
    assert!(ev42.is_relocated());
    assert!((ev42.latitude - 46.301).abs() < 1e-9);
    assert!((ev42.longitude - 7.499).abs() < 1e-9);
    assert!((ev42.depth - 5.5).abs() < 1e-9);
    assert_eq!(
        utctime::to_iso(ev42.time),
        "2017-01-03T16:00:01.250000Z"
    );
    let info = ev42.reloc_info.unwrap();
    assert_eq!((info.num_cc_p, info.num_cc_s), (3, 2));
    assert_eq!((info.num_ct_p, info.num_ct_s), (5, 4));
    assert!((info.lon_uncertainty - 0.12).abs() < 1e-9);
    assert!((info.lat_uncertainty - 0.13).abs() < 1e-9);
    assert!((info.depth_uncertainty - 0.14).abs() < 1e-9);
    // both categories present: rms is their mean
    assert!((ev42.rms - 0.22).abs() < 1e-9);

    // the other event is untouched
    assert!(!result.get_event(43).unwrap().is_relocated());
}

#[test]
fn rms_uses_the_single_available_category() {
    let dir = tempfile::tempdir().unwrap();
    let base = utf8(dir.path());
    let (catalog, _) = catalog_with_ids();
    let relocator = dummy_relocator(&base, catalog.clone());

    let reloc = base.join("hypoDD.reloc");
    // no cross-correlation observations at all
    fs::write(
        &reloc,
        "42 46.301000 7.499000 5.500 0.0 0.0 0.0 120.0 130.0 140.0 \
         2017 01 03 16 00 01.25 1.8 0 0 5 4 0.11 0.33 1\n",
    )
    .unwrap();

    let result = relocator
        .load_relocated_catalog(&catalog, &reloc, &base.join("hypoDD.res"))
        .unwrap();
    assert!((result.get_event(42).unwrap().rms - 0.33).abs() < 1e-9);
}

#[test]
fn residuals_are_averaged_per_event_station_phase() {
    let dir = tempfile::tempdir().unwrap();
    let base = utf8(dir.path());
    let (catalog, sta_id) = catalog_with_ids();
    let relocator = dummy_relocator(&base, catalog.clone());

    let reloc = base.join("hypoDD.reloc");
    fs::write(
        &reloc,
        "42 46.301000 7.499000 5.500 0.0 0.0 0.0 120.0 130.0 140.0 \
         2017 01 03 16 00 01.25 1.8 3 2 5 4 0.11 0.33 1\n",
    )
    .unwrap();

    // two lines for the same pair and phase: category 1 (ccP) and 3 (ctP),
    // residuals in milliseconds
    let res = base.join("hypoDD.res");
    fs::write(
        &res,
        format!(
            "{sta_id} 1 42 43 1 0 50.0 0.8 0.1\n\
             {sta_id} 1 42 43 3 0 30.0 0.6 0.1\n"
        ),
    )
    .unwrap();

    let result = relocator.load_relocated_catalog(&catalog, &reloc, &res).unwrap();

    for event_id in [42, 43] {
        let phase = result.search_phase(event_id, &sta_id, "P").unwrap();
        let info = phase.reloc_info.expect("phase missed its residual info");
        assert!((info.residual - 0.04).abs() < 1e-9, "got {}", info.residual);
        assert!((info.final_weight - 0.7).abs() < 1e-9);
    }
}

#[test]
fn missing_reloc_file_is_a_failed_relocation() {
    let dir = tempfile::tempdir().unwrap();
    let base = utf8(dir.path());
    let (catalog, _) = catalog_with_ids();
    let relocator = dummy_relocator(&base, catalog.clone());

    let res = relocator.load_relocated_catalog(
        &catalog,
        &base.join("does-not-exist.reloc"),
        &base.join("hypoDD.res"),
    );
    assert!(matches!(res, Err(rtdd::RtddError::RelocationFailed(_))));
}

#[test]
fn unknown_event_id_is_a_malformed_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let base = utf8(dir.path());
    let (catalog, _) = catalog_with_ids();
    let relocator = dummy_relocator(&base, catalog.clone());

    let reloc = base.join("hypoDD.reloc");
    fs::write(
        &reloc,
        "99 46.301000 7.499000 5.500 0.0 0.0 0.0 120.0 130.0 140.0 \
         2017 01 03 16 00 01.25 1.8 3 2 5 4 0.11 0.33 1\n",
    )
    .unwrap();

    let res = relocator.load_relocated_catalog(&catalog, &reloc, &base.join("hypoDD.res"));
    assert!(matches!(res, Err(rtdd::RtddError::MalformedCatalog(_))));
}
