//! The double-difference relocator.
//!
//! A [`Relocator`] owns one background catalog, one working directory and
//! the waveform machinery, and drives the whole pipeline: neighbor
//! selection, double-difference file emission (absolute and
//! cross-correlated), the external `ph2dt`/`hypoDD` runs and the merge of
//! their results back into the catalog.
//!
//! Two modes exist. **Multi-event** ([`Relocator::relocate_catalog`])
//! relocates the whole background catalog inside `<workdir>/catalog/`.
//! **Single-event** ([`Relocator::relocate_single_event`]) relocates one
//! new origin against the background in two steps under
//! `<workdir>/<event-stamp>/`: step 1 refines the location with absolute
//! travel times only (empty `dt.cc`), step 2 repeats the selection around
//! the refined hypocenter with cross-correlation; if step 2 fails the
//! step 1 result stands, and only both failing is an error.
//!
//! Everything is synchronous and single-threaded; the only concurrency is
//! blocking on the external child processes.

use std::collections::BTreeMap;
use std::fs;

use ahash::{HashMapExt, HashSet, HashSetExt};
use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, error, info, warn};
use ordered_float::NotNan;
use smallvec::SmallVec;

use crate::catalog::{Catalog, Event, EventRelocInfo, Phase, PhaseRelocInfo};
use crate::clustering::{select_neighbouring_events, select_neighbouring_events_catalog};
use crate::config::{Config, SelectionParams};
use crate::constants::EventId;
use crate::ddfiles;
use crate::geom::compute_distance;
use crate::inventory::{Inventory, RecordStream};
use crate::process;
use crate::rtdd_errors::RtddError;
use crate::utctime;
use crate::waveform::filter::InPlaceFilter;
use crate::waveform::loader::{waveform_id_of, WaveformLoader, WfCache};
use crate::waveform::{self, TimeWindow};
use crate::xcorr;

/// Cross-correlation bookkeeping, reset at the start of every `dt.cc`
/// emission and logged in summary afterwards.
#[derive(Debug, Default, Clone, Copy)]
pub struct XcorrCounters {
    pub xcorr_tot: u32,
    pub xcorr_performed: u32,
    pub xcorr_cc_good: u32,
    pub xcorr_cc_low: u32,
}

pub struct Relocator {
    cfg: Config,
    working_dir: Utf8PathBuf,
    cache_dir: Utf8PathBuf,
    src_catalog: Catalog,
    /// The background catalog: src with only the valid P/S picks.
    background: Catalog,
    loader: WaveformLoader,
    wf_cache: WfCache,
    counters: XcorrCounters,
}

impl Relocator {
    pub fn new(
        catalog: Catalog,
        cfg: Config,
        working_dir: Utf8PathBuf,
        inventory: Box<dyn Inventory>,
        record_stream: Box<dyn RecordStream>,
    ) -> Result<Self, RtddError> {
        fs::create_dir_all(&working_dir).map_err(|err| {
            RtddError::Config(format!("unable to create working directory {working_dir}: {err}"))
        })?;
        let cache_dir = working_dir.join("wfcache");
        fs::create_dir_all(&cache_dir).map_err(|err| {
            RtddError::Config(format!("unable to create cache directory {cache_dir}: {err}"))
        })?;

        // fail fast on an unparsable filter specification
        if !cfg.wf_filter.filter_str.is_empty() {
            InPlaceFilter::create(&cfg.wf_filter.filter_str, 100.0)
                .map_err(|err| RtddError::Config(format!("invalid waveform filter: {err}")))?;
        }

        let background = catalog.filter_out_phases(&cfg.valid_p_phases, &cfg.valid_s_phases);
        let loader = WaveformLoader::new(
            inventory,
            record_stream,
            cache_dir.clone(),
            cfg.wf_filter.clone(),
            cfg.snr,
        );

        Ok(Relocator {
            cfg,
            working_dir,
            cache_dir,
            src_catalog: catalog,
            background,
            loader,
            wf_cache: WfCache::new(),
            counters: XcorrCounters::default(),
        })
    }

    /// Replace the background catalog (phase-type filtering reruns).
    pub fn set_catalog(&mut self, catalog: Catalog) {
        self.background =
            catalog.filter_out_phases(&self.cfg.valid_p_phases, &self.cfg.valid_s_phases);
        self.src_catalog = catalog;
    }

    pub fn background_catalog(&self) -> &Catalog {
        &self.background
    }

    pub fn counters(&self) -> XcorrCounters {
        self.counters
    }

    /// Per-run directory name: `OriginTime_LatMillideg_LonMillideg_Now`,
    /// e.g. `20111210115715_46343_007519_20111210115740`.
    fn generate_working_sub_dir(&self, event: &Event) -> String {
        let p = utctime::to_parts(event.time);
        let n = utctime::to_parts(utctime::now());
        format!(
            "{}{:02}{:02}{:02}{:02}{:02}_{:05}_{:06}_{}{:02}{:02}{:02}{:02}{:02}",
            p.year,
            p.month,
            p.day,
            p.hour,
            p.minute,
            p.second,
            (event.latitude * 1000.0) as i64,
            (event.longitude * 1000.0) as i64,
            n.year,
            n.month,
            n.day,
            n.hour,
            n.minute,
            n.second
        )
    }

    /// Load (and thereby cache, on disk and in memory) the long-window
    /// waveform of every background phase.
    pub fn preload_waveforms(&mut self) {
        self.counters = XcorrCounters::default();
        self.loader.reset_counters();

        let requests: Vec<(Event, Phase)> = self
            .background
            .events()
            .values()
            .flat_map(|ev| {
                self.background
                    .phases_of(ev.id)
                    .iter()
                    .map(move |ph| (ev.clone(), ph.clone()))
            })
            .collect();

        for (event, phase) in requests {
            let tw = xcorr::time_window_long(self.cfg.xcorr(&phase.phase_type), phase.time);
            self.loader.get(
                &tw,
                &event,
                &phase,
                &mut self.wf_cache,
                self.cfg.use_disk_cache,
                true,
            );
        }
        info!(
            "Finished preloading catalog waveform data: waveforms with Signal to Noise ratio too low {}, waveforms not available {}",
            self.loader.counters.snr_low, self.loader.counters.wf_no_avail
        );
    }

    /// Tear down per-run directories (when configured) and evict cache
    /// entries that no longer belong to a background phase.
    pub fn clean_unused_resources(&mut self) {
        info!("Cleaning unused resources");

        if self.cfg.working_dir_cleanup {
            if let Ok(entries) = fs::read_dir(&self.working_dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path == std::path::Path::new(self.cache_dir.as_str()) {
                        continue;
                    }
                    info!("Deleting {}", path.display());
                    let _ = if path.is_dir() {
                        fs::remove_dir_all(&path)
                    } else {
                        fs::remove_file(&path)
                    };
                }
            }
        }

        // fingerprints and file prefixes of the waveforms worth keeping
        let mut wf_to_keep: HashSet<String> = HashSet::new();
        let mut file_prefixes_to_keep: HashSet<String> = HashSet::new();
        for event in self.background.events().values() {
            for phase in self.background.phases_of(event.id) {
                let tw = xcorr::time_window_long(self.cfg.xcorr(&phase.phase_type), phase.time);
                wf_to_keep.insert(waveform_id_of(phase, &tw));
                file_prefixes_to_keep.insert(format!(
                    "{}.{}.{}.",
                    phase.network_code, phase.station_code, phase.location_code
                ));
            }
        }

        self.wf_cache.retain(|id, _| wf_to_keep.contains(id));

        if self.cfg.use_disk_cache {
            if let Ok(entries) = fs::read_dir(&self.cache_dir) {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if !file_prefixes_to_keep.iter().any(|p| name.starts_with(p.as_str())) {
                        info!("Deleting {}", entry.path().display());
                        let _ = fs::remove_file(entry.path());
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // multi-event mode
    // ------------------------------------------------------------------

    /// Relocate the whole background catalog.
    ///
    /// With `use_ph2dt` the pair selection is delegated to the external
    /// `ph2dt` (its `station.sel`/`event.sel` replace the staged inputs and
    /// `dt.cc` is derived from the pairs it kept in `dt.ct`); otherwise the
    /// built-in neighbor selector emits `dt.ct` and `dt.cc` directly.
    /// `force` regenerates intermediate files that already exist.
    pub fn relocate_catalog(&mut self, force: bool, use_ph2dt: bool) -> Result<Catalog, RtddError> {
        info!("Starting double-difference relocator in multiple events mode");

        let mut cat_to_reloc = self.background.clone();
        if self.cfg.artificial_phases.enable {
            cat_to_reloc = self.create_missing_phases(&cat_to_reloc)?;
        }

        let catalog_dir = self.working_dir.join("catalog");
        fs::create_dir_all(&catalog_dir).map_err(|err| {
            RtddError::Config(format!("unable to create working directory {catalog_dir}: {err}"))
        })?;

        cat_to_reloc.write_to_files(
            &catalog_dir.join("starting-event.csv"),
            &catalog_dir.join("starting-phase.csv"),
            &catalog_dir.join("starting-station.csv"),
        )?;

        let station_file = catalog_dir.join("station.dat");
        if force || !station_file.is_file() {
            ddfiles::create_station_dat(&cat_to_reloc, &station_file)?;
        }

        let event_file = catalog_dir.join("event.dat");
        let dtct_file = catalog_dir.join("dt.ct");
        let dtcc_file = catalog_dir.join("dt.cc");

        if !use_ph2dt {
            if force || !event_file.is_file() {
                ddfiles::create_event_dat(&cat_to_reloc, &event_file)?;
            }
            if force || !dtct_file.is_file() {
                self.create_dtct_catalog(&cat_to_reloc, &dtct_file)?;
            }
            if force || !dtcc_file.is_file() {
                self.create_dtcc_catalog(&cat_to_reloc, &dtcc_file)?;
            }
        } else {
            let phase_file = catalog_dir.join("phase.dat");
            if force || !phase_file.is_file() {
                ddfiles::create_phase_dat(&cat_to_reloc, &phase_file)?;
            }

            if force || !dtct_file.is_file() {
                process::run_ph2dt(&self.cfg.ph2dt, &catalog_dir, &station_file, &phase_file)?;
                let station_sel = catalog_dir.join("station.sel");
                if station_sel.is_file() {
                    fs::copy(&station_sel, &station_file)?;
                }
                let event_sel = catalog_dir.join("event.sel");
                if event_sel.is_file() {
                    fs::copy(&event_sel, &event_file)?;
                }
            }

            if force || !dtcc_file.is_file() {
                self.create_dtcc_from_dtct(&cat_to_reloc, &dtct_file, &dtcc_file)?;
            }
        }

        let reloc_file = catalog_dir.join("hypoDD.reloc");
        let residual_file = catalog_dir.join("hypoDD.res");
        if force || !reloc_file.is_file() || !residual_file.is_file() {
            process::run_hypodd(
                &self.cfg.hypodd,
                &catalog_dir,
                &dtcc_file,
                &dtct_file,
                &event_file,
                &station_file,
                &self.cfg.hypodd.step2_ctrl_file,
            )?;
        }

        let relocated = self.load_relocated_catalog(&cat_to_reloc, &reloc_file, &residual_file)?;

        relocated.write_to_files(
            &catalog_dir.join("relocated-event.csv"),
            &catalog_dir.join("relocated-phase.csv"),
            &catalog_dir.join("relocated-station.csv"),
        )?;

        Ok(relocated)
    }

    // ------------------------------------------------------------------
    // single-event mode
    // ------------------------------------------------------------------

    /// Relocate one new origin against the background catalog. The input
    /// catalog must hold exactly that event with its picks.
    pub fn relocate_single_event(&mut self, single_event: &Catalog) -> Result<Catalog, RtddError> {
        info!("Starting double-difference relocator in single event mode");

        let ev_to_relocate = single_event
            .events()
            .values()
            .next()
            .ok_or_else(|| RtddError::MalformedCatalog("no event to relocate".into()))?
            .clone();

        let sub_dir = self
            .working_dir
            .join(self.generate_working_sub_dir(&ev_to_relocate));
        if sub_dir.exists() {
            fs::remove_dir_all(&sub_dir)?;
        }

        // step 1: refine the location without cross correlation
        info!("Performing step 1: initial location refinement (no cross correlation)");
        let filtered =
            single_event.filter_out_phases(&self.cfg.valid_p_phases, &self.cfg.valid_s_phases);
        let step1_dir = sub_dir.join("step1");
        let relocated_step1 = match self.single_event_step(
            &filtered,
            &step1_dir,
            &self.cfg.dtct.clone(),
            false,
            false,
            &self.cfg.hypodd.step1_ctrl_file.clone(),
        ) {
            Ok(cat) => Some(cat),
            Err(err) => {
                error!("{err}");
                None
            }
        };
        if relocated_step1.is_none() {
            error!("Failed to perform step 1 origin relocation");
        }

        // step 2: relocate the refined origin, this time with cross
        // correlation
        info!("Performing step 2: relocation with cross correlation");
        let step2_input = relocated_step1.clone().unwrap_or_else(|| filtered.clone());
        let step2_dir = sub_dir.join("step2");
        let relocated_step2 = match self.single_event_step(
            &step2_input,
            &step2_dir,
            &self.cfg.dtcc.clone(),
            true,
            self.cfg.artificial_phases.enable,
            &self.cfg.hypodd.step2_ctrl_file.clone(),
        ) {
            Ok(cat) => Some(cat),
            Err(err) => {
                error!("{err}");
                None
            }
        };
        if relocated_step2.is_none() {
            error!("Failed to perform step 2 origin relocation");
        }

        match (relocated_step2, relocated_step1) {
            (Some(cat), _) => Ok(cat),
            (None, Some(cat)) => Ok(cat),
            (None, None) => Err(RtddError::RelocationFailed(
                "failed origin relocation with and without crosscorrelation".into(),
            )),
        }
    }

    /// One single-event relocation step: merge the event into the
    /// background, select its neighbors, stage the DD files, run `hypoDD`
    /// and extract the relocated event.
    fn single_event_step(
        &mut self,
        ev_cat: &Catalog,
        step_dir: &Utf8Path,
        profile: &SelectionParams,
        with_xcorr: bool,
        with_artificial: bool,
        ctrl_file: &Utf8Path,
    ) -> Result<Catalog, RtddError> {
        fs::create_dir_all(step_dir).map_err(|err| {
            RtddError::Config(format!("unable to create working directory {step_dir}: {err}"))
        })?;

        let event = ev_cat
            .events()
            .values()
            .next()
            .ok_or_else(|| RtddError::MalformedCatalog("no event to relocate".into()))?
            .clone();

        // the event gets a new id inside the merged catalog
        let mut merged = self.background.merged(ev_cat, false);
        let mut event = merged
            .search_event(&event)
            .ok_or_else(|| {
                RtddError::MalformedCatalog("event to relocate lost while merging".into())
            })?
            .clone();

        if with_artificial {
            self.add_missing_event_phases(&mut merged, &event)?;
            // the catalog content changed under this id, refetch
            event = merged
                .get_event(event.id)
                .ok_or_else(|| {
                    RtddError::MalformedCatalog("event to relocate lost after phase synthesis".into())
                })?
                .clone();
        }

        let mut neighbour_cat = select_neighbouring_events(&merged, &event, profile)?;
        let ref_id = neighbour_cat.copy_event(event.id, &merged, false)?;

        neighbour_cat.write_to_files(
            &step_dir.join("starting-event.csv"),
            &step_dir.join("starting-phase.csv"),
            &step_dir.join("starting-station.csv"),
        )?;

        let station_file = step_dir.join("station.dat");
        ddfiles::create_station_dat(&neighbour_cat, &station_file)?;
        let event_file = step_dir.join("event.dat");
        ddfiles::create_event_dat(&neighbour_cat, &event_file)?;

        let dtct_file = step_dir.join("dt.ct");
        info!("Creating differential travel time file {dtct_file}");
        let mut dtct = String::new();
        ddfiles::build_abs_ttime_pairs(&neighbour_cat, ref_id, &mut dtct)?;
        fs::write(&dtct_file, dtct)?;

        let dtcc_file = step_dir.join("dt.cc");
        if with_xcorr {
            self.create_dtcc_single_event(&neighbour_cat, ref_id, &dtcc_file)?;
        } else {
            fs::write(&dtcc_file, "")?;
        }

        process::run_hypodd(
            &self.cfg.hypodd,
            step_dir,
            &dtcc_file,
            &dtct_file,
            &event_file,
            &station_file,
            ctrl_file,
        )?;

        let reloc_file = step_dir.join("hypoDD.reloc");
        let residual_file = step_dir.join("hypoDD.res");
        let relocated = self.load_relocated_catalog(&neighbour_cat, &reloc_file, &residual_file)?;

        relocated.write_to_files(
            &step_dir.join("relocated-event.csv"),
            &step_dir.join("relocated-phase.csv"),
            &step_dir.join("relocated-station.csv"),
        )?;

        let extracted = relocated.extract_event(ref_id, false)?;

        // the reloc file can exist yet not contain the event of interest
        let only_event = extracted
            .events()
            .values()
            .next()
            .ok_or_else(|| RtddError::RelocationFailed("relocated event lost".into()))?;
        if !only_event.is_relocated() {
            return Err(RtddError::RelocationFailed(format!(
                "event {event} was not relocated"
            )));
        }

        Ok(extracted)
    }

    // ------------------------------------------------------------------
    // dt.ct / dt.cc emission
    // ------------------------------------------------------------------

    fn create_dtct_catalog(&self, catalog: &Catalog, path: &Utf8Path) -> Result<(), RtddError> {
        info!("Creating differential travel time file {path}");

        let neighbour_cats = select_neighbouring_events_catalog(catalog, &self.cfg.dtct)?;
        let mut out = String::new();
        for (&event_id, neighbour_cat) in &neighbour_cats {
            ddfiles::build_abs_ttime_pairs(neighbour_cat, event_id, &mut out)?;
        }
        fs::write(path, out)?;
        Ok(())
    }

    fn create_dtcc_catalog(&mut self, catalog: &Catalog, path: &Utf8Path) -> Result<(), RtddError> {
        info!("Creating cross correlation differential travel time file {path}");

        let neighbour_cats = select_neighbouring_events_catalog(catalog, &self.cfg.dtcc)?;

        self.counters = XcorrCounters::default();
        self.loader.reset_counters();

        let mut out = String::new();
        for (&event_id, neighbour_cat) in &neighbour_cats {
            self.build_xcorr_diff_ttime_pairs(neighbour_cat, event_id, &mut out)?;
        }
        fs::write(path, out)?;

        self.log_xcorr_summary();
        Ok(())
    }

    fn create_dtcc_single_event(
        &mut self,
        catalog: &Catalog,
        ev_to_relocate_id: EventId,
        path: &Utf8Path,
    ) -> Result<(), RtddError> {
        info!("Creating cross correlation differential travel time file {path}");

        self.counters = XcorrCounters::default();
        self.loader.reset_counters();

        let mut out = String::new();
        self.build_xcorr_diff_ttime_pairs(catalog, ev_to_relocate_id, &mut out)?;
        fs::write(path, out)?;

        self.log_xcorr_summary();
        Ok(())
    }

    fn log_xcorr_summary(&self) {
        info!(
            "Cross correlation statistics: attempted {} performed {} with good cc coefficient {} \
             with too low cc coefficient {} waveforms with Signal to Noise ratio too low {} \
             waveforms not available {}",
            self.counters.xcorr_tot,
            self.counters.xcorr_performed,
            self.counters.xcorr_cc_good,
            self.counters.xcorr_cc_low,
            self.loader.counters.snr_low,
            self.loader.counters.wf_no_avail
        );
    }

    /// Append the `dt.cc` blocks pairing `ref_ev_id` with every other
    /// event of the catalog.
    fn build_xcorr_diff_ttime_pairs(
        &mut self,
        catalog: &Catalog,
        ref_ev_id: EventId,
        out: &mut String,
    ) -> Result<(), RtddError> {
        let ref_ev = catalog
            .get_event(ref_ev_id)
            .ok_or_else(|| {
                RtddError::MalformedCatalog(format!(
                    "cannot find event id {ref_ev_id} in the catalog"
                ))
            })?
            .clone();

        for event in catalog.events().values() {
            if event.id == ref_ev.id {
                continue;
            }

            let mut block = ddfiles::cc_pair_header(ref_ev.id, event.id);
            let mut dt_count = 0;

            for phase in catalog.phases_of(event.id) {
                let ref_phase =
                    match catalog.search_phase(ref_ev.id, &phase.station_id, &phase.phase_type) {
                        Some(ph) => ph.clone(),
                        None => continue,
                    };

                if let Some((dtcc, weight)) = self.xcorr_phases(&ref_ev, &ref_phase, event, phase)
                {
                    block.push_str(&ddfiles::cc_observation_line(
                        &ref_phase.station_id,
                        dtcc,
                        weight,
                        &ref_phase.phase_type,
                    ));
                    dt_count += 1;
                }
            }

            if dt_count > 0 {
                out.push_str(&block);
            }
        }
        Ok(())
    }

    /// Re-cross-correlate the event pairs `ph2dt` selected in `dt.ct`.
    fn create_dtcc_from_dtct(
        &mut self,
        catalog: &Catalog,
        dtct_file: &Utf8Path,
        dtcc_file: &Utf8Path,
    ) -> Result<(), RtddError> {
        info!("Creating cross correlation differential travel time file {dtcc_file}");

        if !dtct_file.is_file() {
            return Err(RtddError::Config(format!(
                "unable to perform cross correlation, cannot find file: {dtct_file}"
            )));
        }

        self.counters = XcorrCounters::default();
        self.loader.reset_counters();

        let content = fs::read_to_string(dtct_file)?;
        let mut out = String::new();
        let mut current: Option<(Event, Event)> = None;
        let mut block = String::new();
        let mut dt_count = 0;

        for line in content.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();

            if fields.first() == Some(&"#") && fields.len() == 3 {
                if dt_count > 0 {
                    out.push_str(&block);
                }
                block.clear();
                dt_count = 0;

                let parse_id = |token: &str| -> Result<EventId, RtddError> {
                    token.parse().map_err(|_| {
                        RtddError::Parse(format!("{dtct_file}: invalid event id '{token}'"))
                    })
                };
                let ev1 = catalog.get_event(parse_id(fields[1])?).ok_or_else(|| {
                    RtddError::MalformedCatalog(format!(
                        "dt.ct file contains event id {} that is not part of the catalog",
                        fields[1]
                    ))
                })?;
                let ev2 = catalog.get_event(parse_id(fields[2])?).ok_or_else(|| {
                    RtddError::MalformedCatalog(format!(
                        "dt.ct file contains event id {} that is not part of the catalog",
                        fields[2]
                    ))
                })?;

                block.push_str(&ddfiles::cc_pair_header(ev1.id, ev2.id));
                current = Some((ev1.clone(), ev2.clone()));
            } else if let (Some((ev1, ev2)), 5) = (&current, fields.len()) {
                let station_id = fields[0];
                let phase_type = fields[4];

                let phase1 = catalog.search_phase(ev1.id, station_id, phase_type);
                let phase2 = catalog.search_phase(ev2.id, station_id, phase_type);
                if let (Some(phase1), Some(phase2)) = (phase1, phase2) {
                    let (ev1, ev2) = (ev1.clone(), ev2.clone());
                    let (phase1, phase2) = (phase1.clone(), phase2.clone());
                    if let Some((dtcc, weight)) = self.xcorr_phases(&ev1, &phase1, &ev2, &phase2) {
                        block.push_str(&ddfiles::cc_observation_line(
                            station_id, dtcc, weight, phase_type,
                        ));
                        dt_count += 1;
                    }
                }
            } else if !line.trim().is_empty() {
                current = None;
                warn!("Skipping unrecognized line from '{dtct_file}' (line='{line}')");
            }
        }
        if dt_count > 0 {
            out.push_str(&block);
        }

        fs::write(dtcc_file, out)?;
        self.log_xcorr_summary();
        Ok(())
    }

    // ------------------------------------------------------------------
    // cross correlation of a phase pair
    // ------------------------------------------------------------------

    /// Cross-correlate the same station/phase of two events. On success
    /// returns the differential travel time and its weight (coefficient
    /// squared).
    ///
    /// The trace around the trusted pick is kept short and slid inside the
    /// long window of the other: a manual pick is trusted over an
    /// automatic one; when both (or neither) are manual, both pairings are
    /// attempted and the higher coefficient wins.
    fn xcorr_phases(
        &mut self,
        event1: &Event,
        phase1: &Phase,
        event2: &Event,
        phase2: &Phase,
    ) -> Option<(f64, f64)> {
        let params = *self.cfg.xcorr(&phase1.phase_type);
        let use_disk = self.cfg.use_disk_cache;

        self.counters.xcorr_tot += 1;
        debug!("Calculating cross correlation for phase pair phase1='{phase1}', phase2='{phase2}'");

        let tw1 = xcorr::time_window_long(&params, phase1.time);
        let tw2 = xcorr::time_window_long(&params, phase2.time);

        // cache the long versions, trim afterwards
        let tr1 = self
            .loader
            .get(&tw1, event1, phase1, &mut self.wf_cache, use_disk, true)?;
        let tr2 = self
            .loader
            .get(&tw2, event2, phase2, &mut self.wf_cache, use_disk, true)?;

        // trust the manual pick on phase2: short phase2 against long trace1
        let mut measure1 = None;
        if phase2.is_manual || (!phase1.is_manual && !phase2.is_manual) {
            let mut tr2_short = (*tr2).clone();
            if !waveform::trim(&mut tr2_short, &xcorr::time_window_short(&params, phase2.time)) {
                debug!(
                    "Cannot trim phase2 waveform, skipping cross correlation \
                     for phase pair phase1='{phase1}', phase2='{phase2}'"
                );
                return None;
            }
            measure1 = Some(xcorr::xcorr_series(&tr1, &tr2_short, params.max_delay, true)?);
        }

        // trust the manual pick on phase1: short phase1 against long trace2
        let mut measure2 = None;
        if phase1.is_manual || (!phase1.is_manual && !phase2.is_manual) {
            let mut tr1_short = (*tr1).clone();
            if !waveform::trim(&mut tr1_short, &xcorr::time_window_short(&params, phase1.time)) {
                debug!(
                    "Cannot trim phase1 waveform, skipping cross correlation \
                     for phase pair phase1='{phase1}', phase2='{phase2}'"
                );
                return None;
            }
            measure2 = Some(xcorr::xcorr_series(&tr1_short, &tr2, params.max_delay, true)?);
        }

        self.counters.xcorr_performed += 1;

        let coeff1 = measure1.map(|m| m.coeff).unwrap_or(f64::NAN);
        let coeff2 = measure2.map(|m| m.coeff).unwrap_or(f64::NAN);
        if !coeff1.is_finite() && !coeff2.is_finite() {
            self.counters.xcorr_cc_low += 1;
            return None;
        }

        let best = if !coeff1.is_finite() || (coeff2.is_finite() && coeff2 > coeff1) {
            measure2.expect("finite coefficient implies a measurement")
        } else {
            measure1.expect("finite coefficient implies a measurement")
        };

        if best.coeff < params.min_coef {
            self.counters.xcorr_cc_low += 1;
            return None;
        }

        let travel_time1 = utctime::seconds_between(phase1.time, event1.time);
        let travel_time2 = utctime::seconds_between(phase2.time, event2.time);
        let dtcc = travel_time1 - travel_time2 - best.lag;
        let weight = best.coeff * best.coeff;

        self.counters.xcorr_cc_good += 1;
        Some((dtcc, weight))
    }

    // ------------------------------------------------------------------
    // artificial phases
    // ------------------------------------------------------------------

    /// Catalog copy where every event got its missing P/S picks
    /// synthesized (where possible) from nearby manual picks.
    pub fn create_missing_phases(&mut self, catalog: &Catalog) -> Result<Catalog, RtddError> {
        let mut new_catalog = catalog.clone();
        for event in catalog.events().values().cloned().collect::<Vec<_>>() {
            self.add_missing_event_phases(&mut new_catalog, &event)?;
        }
        Ok(new_catalog)
    }

    fn add_missing_event_phases(
        &mut self,
        catalog: &mut Catalog,
        ref_ev: &Event,
    ) -> Result<(), RtddError> {
        let new_phases = self.find_missing_event_phases(catalog, ref_ev);
        for phase in new_phases {
            catalog.remove_phase(phase.event_id, &phase.station_id, &phase.phase_type);
            catalog.add_phase(phase);
        }
        Ok(())
    }

    /// Detect stations for which `ref_ev` has no P or S pick while nearby
    /// events carry a manual one, and synthesize a replacement pick by
    /// cross-correlating over the travel-time interval the nearby events
    /// bracket.
    fn find_missing_event_phases(&mut self, catalog: &Catalog, ref_ev: &Event) -> Vec<Phase> {
        let ap = self.cfg.artificial_phases.clone();
        let ref_phases = catalog.phases_of(ref_ev.id);
        info!(
            "Creating missing phases for event {} (current num phases {})",
            ref_ev,
            ref_phases.len()
        );

        // stations missing a P or S pick, with their distance to ref_ev
        let mut missing: BTreeMap<(String, String), f64> = BTreeMap::new();
        for station in catalog.stations().values() {
            let mut found_p = false;
            let mut found_s = false;
            for phase in ref_phases {
                if station.network_code == phase.network_code
                    && station.station_code == phase.station_code
                {
                    if ap.fix_auto_phase && !phase.is_manual {
                        continue;
                    }
                    if phase.phase_type == "P" {
                        found_p = true;
                    }
                    if phase.phase_type == "S" {
                        found_s = true;
                    }
                }
                if found_p && found_s {
                    break;
                }
            }
            if !found_p || !found_s {
                let station_distance = compute_distance(
                    ref_ev.latitude,
                    ref_ev.longitude,
                    ref_ev.depth,
                    station.latitude,
                    station.longitude,
                    -(station.elevation / 1000.0),
                );
                if !found_p {
                    missing.insert((station.id.clone(), "P".into()), station_distance);
                }
                if !found_s {
                    missing.insert((station.id.clone(), "S".into()), station_distance);
                }
            }
        }

        // other events sorted by distance to ref_ev
        let mut event_by_distance: Vec<(NotNan<f64>, EventId)> = catalog
            .events()
            .values()
            .filter(|ev| ev.id != ref_ev.id)
            .map(|ev| {
                let distance = compute_distance(
                    ref_ev.latitude,
                    ref_ev.longitude,
                    ref_ev.depth,
                    ev.latitude,
                    ev.longitude,
                    ev.depth,
                );
                (
                    NotNan::new(distance).unwrap_or_else(|_| NotNan::new(f64::MAX).unwrap()),
                    ev.id,
                )
            })
            .collect();
        event_by_distance.sort();

        let mut new_phases = Vec::new();
        // the reference trace is request-specific, no point caching it
        // across runs
        let mut tmp_cache = WfCache::new();

        for ((station_id, phase_type), ref_ev_dist_to_station) in missing {
            let station = &catalog.stations()[&station_id];
            debug!(
                "Event {}: try to detect missing {} phase for station {} (distance {:.2} km)",
                ref_ev, phase_type, station, ref_ev_dist_to_station
            );

            // nearby events with a manual pick for the missing
            // station/type, keyed by their travel time; also track the
            // stream codes of the pick closest in time to ref_ev
            let mut xcorr_peers: Vec<(NotNan<f64>, Event, Phase)> = Vec::new();
            let mut stream_info: Option<(String, String, hifitime::Epoch)> = None;

            for &(distance, event_id) in &event_by_distance {
                if distance.into_inner() > ap.max_ie_dist {
                    continue;
                }
                let event = &catalog.events()[&event_id];
                for phase in catalog.phases_of(event_id) {
                    if station.network_code != phase.network_code
                        || station.station_code != phase.station_code
                    {
                        continue;
                    }
                    if phase.phase_type == phase_type && phase.is_manual {
                        let travel_time = utctime::seconds_between(phase.time, event.time);
                        xcorr_peers.push((
                            NotNan::new(travel_time)
                                .unwrap_or_else(|_| NotNan::new(f64::MAX).unwrap()),
                            event.clone(),
                            phase.clone(),
                        ));
                    }
                    let closer = match &stream_info {
                        None => true,
                        Some((_, _, time)) => {
                            utctime::seconds_between(ref_ev.time, phase.time).abs()
                                < utctime::seconds_between(ref_ev.time, *time).abs()
                        }
                    };
                    if closer {
                        stream_info = Some((
                            phase.location_code.clone(),
                            phase.channel_code.clone(),
                            phase.time,
                        ));
                    }
                }
            }
            xcorr_peers.sort_by(|a, b| a.0.cmp(&b.0));

            if xcorr_peers.len() < ap.num_cc || xcorr_peers.len() < 2 {
                debug!(
                    "Event {}: cannot create phase {} for station {}. Not enough close-by events",
                    ref_ev, phase_type, station
                );
                continue;
            }

            // the closest and furthest travel times bracket the interval
            // over which to cross correlate for the missing phase
            let closer_travel_time = xcorr_peers.first().expect("nonempty").0.into_inner();
            let further_travel_time = xcorr_peers.last().expect("nonempty").0.into_inner();

            let params = *self.cfg.xcorr(&phase_type);
            let mut start_time =
                utctime::add_seconds(ref_ev.time, closer_travel_time + params.start_offset);
            let mut end_time =
                utctime::add_seconds(ref_ev.time, further_travel_time + params.end_offset);
            if utctime::seconds_between(end_time, start_time) > ap.max_cc_tw {
                start_time = utctime::add_seconds(ref_ev.time, -ap.max_cc_tw / 2.0);
                end_time = utctime::add_seconds(ref_ev.time, ap.max_cc_tw / 2.0);
            }
            let xcorr_tw = TimeWindow::new(start_time, end_time);

            let (location_code, channel_code) = match &stream_info {
                Some((loc, cha, _)) => (loc.clone(), cha.clone()),
                None => continue,
            };

            let mut new_phase = Phase {
                event_id: ref_ev.id,
                station_id: station.id.clone(),
                time: utctime::add_seconds(start_time, xcorr_tw.length() / 2.0),
                weight: 0.0,
                phase_type: phase_type.clone(),
                network_code: station.network_code.clone(),
                station_code: station.station_code.clone(),
                location_code,
                channel_code,
                is_manual: false,
                reloc_info: None,
            };

            let ref_tr = match self
                .loader
                .get(&xcorr_tw, ref_ev, &new_phase, &mut tmp_cache, false, false)
            {
                Some(tr) => tr,
                None => {
                    debug!(
                        "Event {}: cannot create phase {} for station {}. Cannot load waveform",
                        ref_ev, phase_type, station
                    );
                    continue;
                }
            };

            // cross correlate each peer's picked window inside the search
            // interval; keep (coeff, lag), best coefficients first
            let mut xcorr_out: SmallVec<[(f64, f64); 8]> = SmallVec::new();
            let use_disk = self.cfg.use_disk_cache;
            for (_, event, phase) in &xcorr_peers {
                let tw_long = xcorr::time_window_long(&params, phase.time);
                let tr = match self
                    .loader
                    .get(&tw_long, event, phase, &mut self.wf_cache, use_disk, true)
                {
                    Some(tr) => tr,
                    None => continue,
                };

                let tw_short = xcorr::time_window_short(&params, phase.time);
                let mut tr_short = (*tr).clone();
                if !waveform::trim(&mut tr_short, &tw_short) {
                    continue;
                }

                let max_delay = (xcorr_tw.length() - tw_short.length()) / 2.0;
                let measure = match xcorr::xcorr_series(&tr_short, &ref_tr, max_delay, true) {
                    Some(m) => m,
                    None => continue,
                };
                if !measure.coeff.is_finite() {
                    continue;
                }
                xcorr_out.push((measure.coeff, measure.lag));
            }

            if xcorr_out.len() < ap.num_cc {
                debug!(
                    "Event {}: rejected artificial phase {} for station {}. \
                     Not enough close-by events to crosscorrelate ({})",
                    ref_ev,
                    phase_type,
                    station,
                    xcorr_out.len()
                );
                continue;
            }

            xcorr_out.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            let top = &xcorr_out[..ap.num_cc];
            let coeff_avg = top.iter().map(|(c, _)| c).sum::<f64>() / top.len() as f64;
            let lag_avg = top.iter().map(|(_, l)| l).sum::<f64>() / top.len() as f64;

            if coeff_avg < params.min_coef {
                debug!(
                    "Event {}: rejected artificial phase {} for station {}. \
                     Crosscorrelation coefficient too low ({:.2})",
                    ref_ev, phase_type, station, coeff_avg
                );
                continue;
            }

            // lag scatter (mean absolute deviation) drives the pick weight
            let abs_mean_dev =
                top.iter().map(|(_, l)| (l - lag_avg).abs()).sum::<f64>() / top.len() as f64;

            new_phase.time = utctime::add_seconds(new_phase.time, lag_avg);
            new_phase.weight = Catalog::compute_pick_weight(abs_mean_dev);
            info!(
                "Event {}: new phase {} for station {} created with weight {:.2} \
                 (average crosscorrelation coefficient {:.2} over {} close-by events)",
                ref_ev, phase_type, station, new_phase.weight, coeff_avg, ap.num_cc
            );
            new_phases.push(new_phase);
        }

        info!("Event {}: created {} new phases", ref_ev, new_phases.len());
        new_phases
    }

    // ------------------------------------------------------------------
    // relocation result loading
    // ------------------------------------------------------------------

    /// Merge `hypoDD.reloc` (and, when present, `hypoDD.res`) back into a
    /// copy of the original catalog.
    pub fn load_relocated_catalog(
        &self,
        original: &Catalog,
        reloc_file: &Utf8Path,
        residual_file: &Utf8Path,
    ) -> Result<Catalog, RtddError> {
        info!("Loading catalog relocated by hypodd...");

        if !reloc_file.is_file() {
            return Err(RtddError::RelocationFailed(format!(
                "cannot load hypodd relocated catalog file: {reloc_file}"
            )));
        }

        let mut catalog = original.clone();

        for row in fs::read_to_string(reloc_file)?.lines() {
            let fields: Vec<&str> = row.split_whitespace().collect();
            if fields.is_empty() {
                continue;
            }
            if fields.len() != 24 {
                warn!("Skipping unrecognized line from '{reloc_file}' (line='{row}')");
                continue;
            }

            let event_id: EventId = fields[0].parse().map_err(|_| {
                RtddError::Parse(format!("{reloc_file}: invalid event id '{}'", fields[0]))
            })?;
            let mut event = catalog
                .get_event(event_id)
                .ok_or_else(|| {
                    RtddError::MalformedCatalog(format!(
                        "cannot find relocated event {event_id} in the original catalog"
                    ))
                })?
                .clone();

            let num = |idx: usize| -> Result<f64, RtddError> {
                fields[idx].parse().map_err(|_| {
                    RtddError::Parse(format!(
                        "{reloc_file}: invalid numeric field '{}'",
                        fields[idx]
                    ))
                })
            };

            event.latitude = num(1)?;
            event.longitude = num(2)?;
            event.depth = num(3)?;

            let seconds = num(15)?;
            event.time = utctime::add_seconds(
                hifitime::Epoch::from_gregorian_utc(
                    num(10)? as i32,
                    num(11)? as u8,
                    num(12)? as u8,
                    num(13)? as u8,
                    num(14)? as u8,
                    0,
                    0,
                ),
                seconds,
            );

            let reloc_info = EventRelocInfo {
                lon_uncertainty: num(7)? / 1000.0,
                lat_uncertainty: num(8)? / 1000.0,
                depth_uncertainty: num(9)? / 1000.0,
                num_cc_p: num(17)? as u32,
                num_cc_s: num(18)? as u32,
                num_ct_p: num(19)? as u32,
                num_ct_s: num(20)? as u32,
                rms_residual_cc: num(21)?,
                rms_residual_ct: num(22)?,
            };

            let num_ct = reloc_info.num_ct_p + reloc_info.num_ct_s;
            let num_cc = reloc_info.num_cc_p + reloc_info.num_cc_s;
            event.rms = if num_ct > 0 && num_cc > 0 {
                (reloc_info.rms_residual_cc + reloc_info.rms_residual_ct) / 2.0
            } else if num_ct > 0 {
                reloc_info.rms_residual_ct
            } else if num_cc > 0 {
                reloc_info.rms_residual_cc
            } else {
                0.0
            };

            event.reloc_info = Some(reloc_info);
            catalog.update_event(event);
        }

        if residual_file.is_file() {
            #[derive(Default)]
            struct Residual {
                residuals: f64,
                weights: f64,
                count: u32,
            }
            let mut res_infos: BTreeMap<(EventId, String, String), Residual> = BTreeMap::new();

            // field 5 encodes the observation category: 1=ccP 2=ccS 3=ctP 4=ctS
            let data_type = |token: &str| match token {
                "1" | "3" => Some("P"),
                "2" | "4" => Some("S"),
                _ => None,
            };

            for row in fs::read_to_string(residual_file)?.lines() {
                let fields: Vec<&str> = row.split_whitespace().collect();
                if fields.is_empty() {
                    continue;
                }
                if fields.len() != 9 {
                    warn!("Skipping unrecognized line from '{residual_file}' (line='{row}')");
                    continue;
                }

                let station_id = fields[0].to_string();
                let (Ok(ev1_id), Ok(ev2_id)) =
                    (fields[2].parse::<EventId>(), fields[3].parse::<EventId>())
                else {
                    warn!("Skipping unrecognized line from '{residual_file}' (line='{row}')");
                    continue;
                };
                let Some(phase_type) = data_type(fields[4]) else {
                    warn!("Skipping unrecognized line from '{residual_file}' (line='{row}')");
                    continue;
                };
                let (Ok(residual_ms), Ok(final_weight)) =
                    (fields[6].parse::<f64>(), fields[7].parse::<f64>())
                else {
                    warn!("Skipping unrecognized line from '{residual_file}' (line='{row}')");
                    continue;
                };
                let residual = residual_ms / 1000.0;

                for ev_id in [ev1_id, ev2_id] {
                    let info = res_infos
                        .entry((ev_id, station_id.clone(), phase_type.to_string()))
                        .or_default();
                    info.residuals += residual;
                    info.weights += final_weight;
                    info.count += 1;
                }
            }

            for ((event_id, station_id, phase_type), info) in res_infos {
                catalog.set_phase_reloc_info(
                    event_id,
                    &station_id,
                    &phase_type,
                    PhaseRelocInfo {
                        residual: info.residuals / info.count as f64,
                        final_weight: info.weights / info.count as f64,
                    },
                );
            }
        }

        Ok(catalog)
    }
}
