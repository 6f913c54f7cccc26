//! Waveform fetch, projection, conditioning and two-level caching.
//!
//! [`WaveformLoader::get`] is the single entry point: it returns the
//! processed trace for a (time window, event, phase) request, serving
//! repeats of the same fingerprint from the memory cache. A request that
//! fails anywhere along the pipeline (inventory miss, missing components,
//! record-stream gap, low SNR, incomplete samples) returns None and the
//! fingerprint joins a sticky exclusion set, so the expensive miss path
//! runs at most once per process.

use std::sync::Arc;

use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use camino::Utf8PathBuf;
use log::{debug, warn};
use nalgebra::{Matrix3, Vector3};

use crate::catalog::{Event, Phase};
use crate::config::{FilterParams, SnrParams};
use crate::geom::delazi;
use crate::inventory::{ChannelOrientation, Inventory, RecordStream, SensorLocation, ThreeComponents};
use crate::rtdd_errors::RtddError;
use crate::utctime;
use crate::waveform::filter::InPlaceFilter;
use crate::waveform::{self, mseed, TimeWindow, Trace};

/// Fingerprint-keyed cache of processed traces, shared-read after insert.
pub type WfCache = HashMap<String, Arc<Trace>>;

#[derive(Debug, Default, Clone, Copy)]
pub struct WfCounters {
    /// Requests that could not produce a trace at all.
    pub wf_no_avail: u32,
    /// Requests rejected by the signal-to-noise gate.
    pub snr_low: u32,
}

/// Content-identifying fingerprint of a waveform request.
pub fn waveform_id(
    network: &str,
    station: &str,
    location: &str,
    channel: &str,
    tw: &TimeWindow,
) -> String {
    format!(
        "{}.{}.{}.{}.{}.{}",
        network,
        station,
        location,
        channel,
        utctime::to_iso(tw.start()),
        utctime::to_iso(tw.end())
    )
}

pub fn waveform_id_of(phase: &Phase, tw: &TimeWindow) -> String {
    waveform_id(
        &phase.network_code,
        &phase.station_code,
        &phase.location_code,
        &phase.channel_code,
        tw,
    )
}

pub struct WaveformLoader {
    inventory: Box<dyn Inventory>,
    record_stream: Box<dyn RecordStream>,
    cache_dir: Utf8PathBuf,
    filter: FilterParams,
    snr: SnrParams,
    excluded: HashSet<String>,
    pub counters: WfCounters,
}

impl WaveformLoader {
    pub fn new(
        inventory: Box<dyn Inventory>,
        record_stream: Box<dyn RecordStream>,
        cache_dir: Utf8PathBuf,
        filter: FilterParams,
        snr: SnrParams,
    ) -> Self {
        WaveformLoader {
            inventory,
            record_stream,
            cache_dir,
            filter,
            snr,
            excluded: HashSet::new(),
            counters: WfCounters::default(),
        }
    }

    pub fn reset_counters(&mut self) {
        self.counters = WfCounters::default();
    }

    /// Disk cache path for a request.
    pub fn waveform_filename(&self, phase: &Phase, tw: &TimeWindow) -> Utf8PathBuf {
        self.cache_dir.join(format!("{}.mseed", waveform_id_of(phase, tw)))
    }

    /// The window to actually load: when SNR gating applies, the union of
    /// the requested window and the noise/signal windows around the pick.
    pub fn trace_time_window_to_load(&self, phase: &Phase, needed: &TimeWindow) -> TimeWindow {
        if self.snr.min_snr <= 0.0 {
            return *needed;
        }
        let start = needed
            .start()
            .min(utctime::add_seconds(phase.time, self.snr.noise_start))
            .min(utctime::add_seconds(phase.time, self.snr.signal_start));
        let end = needed
            .end()
            .max(utctime::add_seconds(phase.time, self.snr.noise_end))
            .max(utctime::add_seconds(phase.time, self.snr.signal_end));
        TimeWindow::new(start, end)
    }

    /// Load the processed waveform for a request, or None (sticky) when it
    /// is not obtainable. Identical fingerprints share one cached trace.
    pub fn get(
        &mut self,
        tw: &TimeWindow,
        event: &Event,
        phase: &Phase,
        cache: &mut WfCache,
        use_disk_cache: bool,
        check_snr: bool,
    ) -> Option<Arc<Trace>> {
        let wf_id = waveform_id_of(phase, tw);
        let wf_desc = format!(
            "Waveform for phase '{}' and time slice from {} length {:.2} sec",
            phase,
            utctime::to_iso(tw.start()),
            tw.length()
        );

        if let Some(trace) = cache.get(&wf_id) {
            return Some(trace.clone());
        }
        if self.excluded.contains(&wf_id) {
            return None;
        }

        // sensor orientation at the time of interest
        let mut projection_required = true;
        let mut components: Option<(ThreeComponents, SensorLocation)> = None;

        match self.inventory.sensor_location(
            &phase.network_code,
            &phase.station_code,
            &phase.location_code,
            tw.start(),
        ) {
            None => {
                debug!("Unable to fetch sensor location information ({wf_desc})");
                // try to load the waveform anyway, just without projection
                projection_required = false;
            }
            Some(loc) if !phase.channel_code.is_empty() => {
                let channel_root = &phase.channel_code[..phase.channel_code.len() - 1];
                if let Some(tc) = loc.three_components(channel_root) {
                    if tc.has_component(&phase.channel_code) {
                        projection_required = false;
                    }
                    components = Some((tc, loc));
                }
            }
            Some(_) => {
                debug!("Phase without channel code, loading without projection ({wf_desc})");
                projection_required = false;
            }
        }

        let tw_to_load = if check_snr {
            self.trace_time_window_to_load(phase, tw)
        } else {
            *tw
        };

        let loaded = if !projection_required {
            self.load_waveform(
                &tw_to_load,
                &phase.network_code,
                &phase.station_code,
                &phase.location_code,
                &phase.channel_code,
                use_disk_cache,
            )
        } else {
            match &components {
                None => {
                    debug!("Unable to fetch orientation information ({wf_desc})");
                    self.exclude(wf_id);
                    self.counters.wf_no_avail += 1;
                    return None;
                }
                Some((tc, loc)) => {
                    self.load_projected_waveform(&tw_to_load, event, phase, tc, loc, use_disk_cache)
                }
            }
        };

        let mut trace = match loaded {
            Ok(trace) => trace,
            Err(err) => {
                debug!("{err}");
                self.exclude(wf_id);
                self.counters.wf_no_avail += 1;
                return None;
            }
        };

        if let Err(err) = self.process(&mut trace) {
            debug!("{err} ({wf_desc})");
            self.exclude(wf_id);
            self.counters.wf_no_avail += 1;
            return None;
        }

        if self.filter.dump {
            self.dump_trace(&trace, phase, &tw_to_load, ".processed");
        }

        if check_snr && self.snr.min_snr > 0.0 {
            let snr = waveform::compute_snr(
                &trace,
                phase.time,
                self.snr.noise_start,
                self.snr.noise_end,
                self.snr.signal_start,
                self.snr.signal_end,
            );
            if snr < self.snr.min_snr {
                debug!("Trace has too low SNR ({snr:.2}), discard it ({wf_desc})");
                if self.filter.dump {
                    self.dump_trace(&trace, phase, &tw_to_load, "-S2Nratio-rejected.mseed");
                }
                self.exclude(wf_id);
                self.counters.snr_low += 1;
                return None;
            }
        }

        // drop the extra data loaded for the SNR windows
        if tw_to_load != *tw && !waveform::trim(&mut trace, tw) {
            debug!("Incomplete trace, not enough data ({wf_desc})");
            self.exclude(wf_id);
            return None;
        }

        let trace = Arc::new(trace);
        cache.insert(wf_id, trace.clone());
        Some(trace)
    }

    // exclusions are sticky for the whole process lifetime
    fn exclude(&mut self, wf_id: String) {
        self.excluded.insert(wf_id);
    }

    /// Demean, resample to the configured frequency and apply the
    /// configured filter.
    fn process(&self, trace: &mut Trace) -> Result<(), RtddError> {
        waveform::demean(trace);
        if self.filter.resample_freq > 0.0 {
            waveform::resample(trace, self.filter.resample_freq, true);
        }
        if !self.filter.filter_str.is_empty() {
            let filter = InPlaceFilter::create(&self.filter.filter_str, trace.sampling_frequency())?;
            filter.apply(trace);
        }
        Ok(())
    }

    fn dump_trace(&self, trace: &Trace, phase: &Phase, tw: &TimeWindow, suffix: &str) {
        let path = Utf8PathBuf::from(format!("{}{}", self.waveform_filename(phase, tw), suffix));
        if let Err(err) = mseed::write_trace(trace, &path) {
            warn!("Couldn't dump waveform {path}: {err}");
        }
    }

    /// Read one stream from the disk cache or, failing that, from the
    /// record stream (merging, gap-checking and trimming the records).
    fn load_waveform(
        &self,
        tw: &TimeWindow,
        network: &str,
        station: &str,
        location: &str,
        channel: &str,
        use_disk_cache: bool,
    ) -> Result<Trace, RtddError> {
        let cache_file = self
            .cache_dir
            .join(format!("{}.mseed", waveform_id(network, station, location, channel, tw)));

        if use_disk_cache && cache_file.is_file() {
            match mseed::read_trace(&cache_file) {
                Ok(trace) => return Ok(trace),
                Err(err) => {
                    warn!("Couldn't load cached waveform {cache_file}, read it from record stream ({err})");
                }
            }
        }

        let trace = self.read_from_record_stream(tw, network, station, location, channel)?;

        if use_disk_cache {
            if let Err(err) = mseed::write_trace(&trace, &cache_file) {
                warn!("Couldn't write waveform cache to disk {cache_file}: {err}");
            }
        }
        Ok(trace)
    }

    fn read_from_record_stream(
        &self,
        tw: &TimeWindow,
        network: &str,
        station: &str,
        location: &str,
        channel: &str,
    ) -> Result<Trace, RtddError> {
        let stream_desc = format!(
            "stream {}.{}.{}.{} from {} length {:.2} sec",
            network,
            station,
            location,
            channel,
            utctime::to_iso(tw.start()),
            tw.length()
        );

        let records = self
            .record_stream
            .fetch(network, station, location, channel, tw)?;
        if records.is_empty() {
            return Err(RtddError::Parse(format!("Data could not be loaded ({stream_desc})")));
        }

        let mut trace = waveform::merge(&records).ok_or_else(|| {
            RtddError::Parse(format!(
                "Data records could not be merged into a single trace ({stream_desc})"
            ))
        })?;

        if !waveform::trim(&mut trace, tw) {
            return Err(RtddError::Parse(format!(
                "Incomplete trace, not enough data for requested time window ({stream_desc})"
            )));
        }
        Ok(trace)
    }

    /// Load the three oriented components and project them onto the
    /// requested ZNE or ZRT channel.
    fn load_projected_waveform(
        &self,
        tw: &TimeWindow,
        event: &Event,
        phase: &Phase,
        tc: &ThreeComponents,
        loc: &SensorLocation,
        use_disk_cache: bool,
    ) -> Result<Trace, RtddError> {
        debug!(
            "Loading the 3 components waveforms ({} {} {}) to perform the projection...",
            tc.vertical.code, tc.first_horizontal.code, tc.second_horizontal.code
        );

        // sensor matrix: each row is one component's direction in (E, N, Z);
        // inverting it recovers ground motion from the recorded samples
        let unit = |ch: &ChannelOrientation| -> Vector3<f64> {
            let az = ch.azimuth.to_radians();
            let dip_up = (-ch.dip).to_radians();
            Vector3::new(
                dip_up.cos() * az.sin(),
                dip_up.cos() * az.cos(),
                dip_up.sin(),
            )
        };
        let sensor = Matrix3::from_rows(&[
            unit(&tc.second_horizontal).transpose(),
            unit(&tc.first_horizontal).transpose(),
            unit(&tc.vertical).transpose(),
        ]);
        let to_zne = sensor.try_inverse().ok_or_else(|| {
            RtddError::Parse(format!(
                "Channel orientations of {} are not invertible, cannot project",
                phase.station_id
            ))
        })?;

        let component = phase.channel_code.chars().next_back().unwrap_or(' ');
        let (transformation, out_row) = match component {
            'Z' => (to_zne, 2),
            'N' => (to_zne, 1),
            'E' => (to_zne, 0),
            'R' | 'T' => {
                // rotate about vertical by back azimuth + 180
                let da = delazi(event.latitude, event.longitude, loc.latitude, loc.longitude);
                let theta = (da.back_azimuth + 180.0).to_radians();
                let rot = Matrix3::new(
                    theta.cos(),
                    -theta.sin(),
                    0.0,
                    theta.sin(),
                    theta.cos(),
                    0.0,
                    0.0,
                    0.0,
                    1.0,
                );
                (rot * to_zne, if component == 'R' { 1 } else { 0 })
            }
            _ => {
                return Err(RtddError::Parse(format!(
                    "Unknown channel '{component}', cannot load waveform for phase '{phase}'"
                )))
            }
        };

        let tr2h = self.load_waveform(
            tw,
            &phase.network_code,
            &phase.station_code,
            &phase.location_code,
            &tc.second_horizontal.code,
            use_disk_cache,
        )?;
        let tr1h = self.load_waveform(
            tw,
            &phase.network_code,
            &phase.station_code,
            &phase.location_code,
            &tc.first_horizontal.code,
            use_disk_cache,
        )?;
        let trv = self.load_waveform(
            tw,
            &phase.network_code,
            &phase.station_code,
            &phase.location_code,
            &tc.vertical.code,
            use_disk_cache,
        )?;

        // the three inputs must align sample-wise
        if tr2h.sampling_frequency() != tr1h.sampling_frequency()
            || tr1h.sampling_frequency() != trv.sampling_frequency()
            || tr2h.sample_count() != tr1h.sample_count()
            || tr1h.sample_count() != trv.sample_count()
            || tr2h.start_time() != tr1h.start_time()
            || tr1h.start_time() != trv.start_time()
        {
            return Err(RtddError::Parse(format!(
                "Component traces are not aligned, cannot project waveform for phase '{phase}'"
            )));
        }

        let row = transformation.row(out_row);
        let data: Vec<f64> = (0..trv.sample_count())
            .map(|i| row[0] * tr2h.data()[i] + row[1] * tr1h.data()[i] + row[2] * trv.data()[i])
            .collect();

        let mut trace = Trace::new(
            &phase.network_code,
            &phase.station_code,
            &phase.location_code,
            &phase.channel_code,
            trv.start_time(),
            trv.sampling_frequency(),
            data,
        );

        if !waveform::trim(&mut trace, tw) {
            return Err(RtddError::Parse(format!(
                "Incomplete trace after projection for phase '{phase}'"
            )));
        }
        Ok(trace)
    }
}

#[cfg(test)]
mod loader_test {
    use super::*;
    use crate::catalog::{Event, Phase};
    use crate::inventory::ChannelOrientation;
    use hifitime::Epoch;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn origin() -> Epoch {
        Epoch::from_gregorian_utc(2017, 1, 3, 16, 13, 0, 0)
    }

    fn test_event() -> Event {
        Event {
            id: 1,
            time: origin(),
            latitude: 46.3,
            longitude: 7.5,
            depth: 5.0,
            magnitude: 2.0,
            horiz_err: 0.1,
            vert_err: 0.2,
            rms: 0.03,
            reloc_info: None,
        }
    }

    fn test_phase(channel: &str) -> Phase {
        Phase {
            event_id: 1,
            station_id: "CH.AIGLE.".into(),
            time: utctime::add_seconds(origin(), 10.0),
            weight: 1.0,
            phase_type: "P".into(),
            network_code: "CH".into(),
            station_code: "AIGLE".into(),
            location_code: String::new(),
            channel_code: channel.into(),
            is_manual: true,
            reloc_info: None,
        }
    }

    struct FakeInventory {
        channels: Vec<ChannelOrientation>,
    }

    impl FakeInventory {
        fn zne() -> Self {
            FakeInventory {
                channels: vec![
                    ChannelOrientation { code: "HHZ".into(), azimuth: 0.0, dip: -90.0 },
                    ChannelOrientation { code: "HHN".into(), azimuth: 0.0, dip: 0.0 },
                    ChannelOrientation { code: "HHE".into(), azimuth: 90.0, dip: 0.0 },
                ],
            }
        }

        fn rotated(angle: f64) -> Self {
            FakeInventory {
                channels: vec![
                    ChannelOrientation { code: "HHZ".into(), azimuth: 0.0, dip: -90.0 },
                    ChannelOrientation { code: "HH1".into(), azimuth: angle, dip: 0.0 },
                    ChannelOrientation { code: "HH2".into(), azimuth: angle + 90.0, dip: 0.0 },
                ],
            }
        }
    }

    impl Inventory for FakeInventory {
        fn sensor_location(&self, _: &str, _: &str, _: &str, _: Epoch) -> Option<SensorLocation> {
            Some(SensorLocation {
                latitude: 46.5,
                longitude: 7.6,
                elevation: 1200.0,
                channels: self.channels.clone(),
            })
        }
    }

    /// Ground motion: east-west wavelet around the pick, nothing on N/Z.
    /// Each channel records the projection onto its own orientation.
    struct FakeStream {
        fetches: Rc<Cell<u32>>,
        fail: Rc<RefCell<bool>>,
        orientations: std::collections::HashMap<String, (f64, f64)>, // code -> (azimuth, dip)
    }

    impl FakeStream {
        fn new(inventory: &FakeInventory) -> Self {
            FakeStream {
                fetches: Rc::new(Cell::new(0)),
                fail: Rc::new(RefCell::new(false)),
                orientations: inventory
                    .channels
                    .iter()
                    .map(|c| (c.code.clone(), (c.azimuth, c.dip)))
                    .collect(),
            }
        }

        fn east_signal(t: f64) -> f64 {
            // quiet before the pick at t=10, 12 Hz wavelet after it
            if (10.0..10.4).contains(&t) {
                (std::f64::consts::TAU * 12.0 * (t - 10.0)).sin()
            } else {
                0.001 * (std::f64::consts::TAU * 2.0 * t).sin()
            }
        }
    }

    impl RecordStream for FakeStream {
        fn fetch(
            &self,
            net: &str,
            sta: &str,
            loc: &str,
            cha: &str,
            tw: &TimeWindow,
        ) -> Result<Vec<Trace>, RtddError> {
            self.fetches.set(self.fetches.get() + 1);
            if *self.fail.borrow() {
                return Err(RtddError::Parse("record stream unavailable".into()));
            }

            let (azimuth, dip) = *self
                .orientations
                .get(cha)
                .unwrap_or(&(90.0, 0.0)); // unknown channels behave like east

            let freq = 100.0;
            // deliver a bit more than asked
            let start = utctime::add_seconds(tw.start(), -1.0);
            let n = ((tw.length() + 2.0) * freq) as usize;
            // ground motion: east-west wavelet plus faint vertical hum
            let east_amp = (-dip).to_radians().cos() * azimuth.to_radians().sin();
            let vert_amp = (-dip).to_radians().sin();
            let data = (0..n)
                .map(|i| {
                    let t = utctime::seconds_between(
                        utctime::add_seconds(start, i as f64 / freq),
                        origin(),
                    );
                    let hum = 1e-4 * (std::f64::consts::TAU * 3.7 * t).sin();
                    east_amp * Self::east_signal(t) + vert_amp * hum
                })
                .collect();
            Ok(vec![Trace::new(net, sta, loc, cha, start, freq, data)])
        }
    }

    fn loader_with(
        inventory: FakeInventory,
        filter: FilterParams,
        snr: SnrParams,
    ) -> (WaveformLoader, Rc<Cell<u32>>, Rc<RefCell<bool>>, tempfile::TempDir) {
        let stream = FakeStream::new(&inventory);
        let fetches = stream.fetches.clone();
        let fail = stream.fail.clone();
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let loader = WaveformLoader::new(
            Box::new(inventory),
            Box::new(stream),
            cache_dir,
            filter,
            snr,
        );
        (loader, fetches, fail, dir)
    }

    fn no_filter() -> FilterParams {
        FilterParams {
            filter_str: String::new(),
            resample_freq: 0.0,
            dump: false,
        }
    }

    fn no_snr() -> SnrParams {
        SnrParams {
            min_snr: 0.0,
            noise_start: -3.0,
            noise_end: -0.35,
            signal_start: -0.35,
            signal_end: 1.0,
        }
    }

    fn pick_window(phase: &Phase) -> TimeWindow {
        TimeWindow::with_length(utctime::add_seconds(phase.time, -0.5), 1.5)
    }

    #[test]
    fn cache_returns_the_same_object() {
        let (mut loader, fetches, _, _dir) = loader_with(FakeInventory::zne(), no_filter(), no_snr());
        let mut cache = WfCache::new();
        let (event, phase) = (test_event(), test_phase("HHE"));
        let tw = pick_window(&phase);

        let tr1 = loader.get(&tw, &event, &phase, &mut cache, false, false).unwrap();
        let n = fetches.get();
        let tr2 = loader.get(&tw, &event, &phase, &mut cache, false, false).unwrap();
        assert!(Arc::ptr_eq(&tr1, &tr2));
        assert_eq!(fetches.get(), n, "cache hit must not fetch again");
    }

    #[test]
    fn failed_requests_are_sticky() {
        let (mut loader, fetches, fail, _dir) =
            loader_with(FakeInventory::zne(), no_filter(), no_snr());
        let mut cache = WfCache::new();
        let (event, phase) = (test_event(), test_phase("HHE"));
        let tw = pick_window(&phase);

        *fail.borrow_mut() = true;
        assert!(loader.get(&tw, &event, &phase, &mut cache, false, false).is_none());
        assert_eq!(loader.counters.wf_no_avail, 1);
        let n = fetches.get();

        // the stream recovers, but the fingerprint stays excluded
        *fail.borrow_mut() = false;
        assert!(loader.get(&tw, &event, &phase, &mut cache, false, false).is_none());
        assert_eq!(fetches.get(), n, "excluded fingerprints must not refetch");
    }

    #[test]
    fn snr_gate_rejects_quiet_traces() {
        let snr = SnrParams {
            min_snr: 2.0,
            ..no_snr()
        };
        let (mut loader, _, _, _dir) = loader_with(FakeInventory::zne(), no_filter(), snr);
        let mut cache = WfCache::new();
        let event = test_event();

        // the east channel sees the wavelet: passes
        let phase = test_phase("HHE");
        let tw = pick_window(&phase);
        assert!(loader.get(&tw, &event, &phase, &mut cache, false, true).is_some());

        // the vertical is silent: rejected and counted
        let phase = test_phase("HHZ");
        let tw = pick_window(&phase);
        assert!(loader.get(&tw, &event, &phase, &mut cache, false, true).is_none());
        assert_eq!(loader.counters.snr_low, 1);
    }

    #[test]
    fn requested_window_is_returned_even_with_snr_extension() {
        let snr = SnrParams {
            min_snr: 2.0,
            ..no_snr()
        };
        let (mut loader, _, _, _dir) = loader_with(FakeInventory::zne(), no_filter(), snr);
        let mut cache = WfCache::new();
        let (event, phase) = (test_event(), test_phase("HHE"));
        let tw = pick_window(&phase);

        let trace = loader.get(&tw, &event, &phase, &mut cache, false, true).unwrap();
        assert!((trace.time_window().length() - tw.length()).abs() < 1e-9);
        assert_eq!(trace.start_time(), tw.start());
    }

    #[test]
    fn rotated_horizontals_project_back_to_east() {
        // borehole sensor rotated by 30 degrees; requesting HHE must
        // reconstruct the east-west ground motion
        let inventory = FakeInventory::rotated(30.0);
        let reference = FakeInventory::zne();

        let (mut loader, _, _, _dir) = loader_with(inventory, no_filter(), no_snr());
        let (mut ref_loader, _, _, _dir2) = loader_with(reference, no_filter(), no_snr());

        let mut cache = WfCache::new();
        let mut ref_cache = WfCache::new();
        let (event, phase) = (test_event(), test_phase("HHE"));
        let tw = pick_window(&phase);

        let projected = loader.get(&tw, &event, &phase, &mut cache, false, false).unwrap();
        let direct = ref_loader.get(&tw, &event, &phase, &mut ref_cache, false, false).unwrap();

        assert_eq!(projected.sample_count(), direct.sample_count());
        for (a, b) in projected.data().iter().zip(direct.data()) {
            assert!((a - b).abs() < 1e-9, "projection mismatch: {a} vs {b}");
        }
    }

    #[test]
    fn zrt_projection_produces_the_radial_component() {
        let (mut loader, _, _, _dir) = loader_with(FakeInventory::zne(), no_filter(), no_snr());
        let mut cache = WfCache::new();
        let (event, phase) = (test_event(), test_phase("HHR"));
        let tw = pick_window(&phase);

        // station is north-east of the event: the east-west motion has a
        // non-trivial radial projection
        let radial = loader.get(&tw, &event, &phase, &mut cache, false, false).unwrap();
        let peak = radial.data().iter().fold(0.0f64, |m, v| m.max(v.abs()));
        assert!(peak > 0.1, "radial peak = {peak}");
    }

    #[test]
    fn disk_cache_round_trip_and_corruption_fallback() {
        let (mut loader, fetches, _, _dir) =
            loader_with(FakeInventory::zne(), no_filter(), no_snr());
        let (event, phase) = (test_event(), test_phase("HHE"));
        let tw = pick_window(&phase);

        let mut cache = WfCache::new();
        let first = loader.get(&tw, &event, &phase, &mut cache, true, false).unwrap();
        let cache_file = loader.waveform_filename(&phase, &tw);
        assert!(cache_file.is_file());

        // new memory cache: the disk must satisfy the request
        let mut cache = WfCache::new();
        let n = fetches.get();
        let second = loader.get(&tw, &event, &phase, &mut cache, true, false).unwrap();
        assert_eq!(fetches.get(), n, "disk hit must not fetch");
        assert_eq!(first.data(), second.data());

        // corrupt the file: falls back to the stream and rewrites
        std::fs::write(&cache_file, b"garbage").unwrap();
        let mut cache = WfCache::new();
        let third = loader.get(&tw, &event, &phase, &mut cache, true, false).unwrap();
        assert!(fetches.get() > n);
        assert_eq!(first.data(), third.data());
    }

    #[test]
    fn existing_component_skips_projection() {
        let (mut loader, fetches, _, _dir) =
            loader_with(FakeInventory::zne(), no_filter(), no_snr());
        let mut cache = WfCache::new();
        let (event, phase) = (test_event(), test_phase("HHZ"));
        let tw = pick_window(&phase);

        loader.get(&tw, &event, &phase, &mut cache, false, false).unwrap();
        assert_eq!(fetches.get(), 1, "ZNE-native channel must load exactly one stream");
    }

    #[test]
    fn missing_components_exclude() {
        // inventory without horizontals: ZRT request cannot be projected
        let inventory = FakeInventory {
            channels: vec![ChannelOrientation { code: "HHZ".into(), azimuth: 0.0, dip: -90.0 }],
        };
        let (mut loader, _, _, _dir) = loader_with(inventory, no_filter(), no_snr());
        let mut cache = WfCache::new();
        let (event, phase) = (test_event(), test_phase("HHR"));
        let tw = pick_window(&phase);

        assert!(loader.get(&tw, &event, &phase, &mut cache, false, false).is_none());
        assert_eq!(loader.counters.wf_no_avail, 1);
    }
}
