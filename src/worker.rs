use std::sync::Arc;

use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use num_complex::Complex32;

use crate::acf::merge_autocorrelations;
use crate::config::{chunk_partition, ResultLayout};
use crate::core::CoreShared;
use crate::error::CoreError;
use crate::mode::Mode;
use crate::polyco::{Polyco, PolycoSet};
use crate::pulsar::{
    fan_out_in_place, fan_out_scrunch, finalize_in_place, finalize_scrunch, PulsarAccumulator,
};
use crate::slot::{ProcessingSlot, SlotData};
use crate::sta::{decimate_power, StaRecord};
use crate::utils::{add_in_place, multiply_into, pin_current_thread, zero};
use crate::xcf::cross_multiply_accumulate;

/// Everything a compute thread builds for one configuration.
struct LoadedConfig {
    index: usize,
    layout: ResultLayout,
    modes: Vec<Box<dyn Mode>>,
    polycos: Option<PolycoSet>,
    start_chunk: usize,
    num_chunks: usize,
    chunk_ns: f64,
}

/// One compute thread: walks the slot ring behind the receiver and
/// correlates its static share of every interval's FFT chunks.
pub struct ComputeWorker {
    shared: Arc<CoreShared>,
    thread_id: usize,
    loaded: Option<LoadedConfig>,
    thread_results: Vec<Complex32>,
    scratch: Vec<Complex32>,
    bins: Vec<Vec<usize>>,
    accum: PulsarAccumulator,
    weights: Vec<f32>,
    sta_data: Vec<f32>,
    processed: u64,
}

impl ComputeWorker {
    pub(crate) fn new(shared: Arc<CoreShared>, thread_id: usize) -> Self {
        Self {
            shared,
            thread_id,
            loaded: None,
            thread_results: Vec::new(),
            scratch: Vec::new(),
            bins: Vec::new(),
            accum: PulsarAccumulator::default(),
            weights: Vec::new(),
            sta_data: Vec::new(),
            processed: 0,
        }
    }

    /// Thread body. Fatal errors go to the job abort hook.
    pub(crate) fn run(mut self, ready: Sender<usize>) {
        if let Err(err) = self.run_loop(ready) {
            error!(
                "core {} thread {}: {} (interval {})",
                self.shared.core_id, self.thread_id, err, self.processed
            );
            self.shared.abort.abort(&err);
        }
    }

    fn run_loop(&mut self, ready: Sender<usize>) -> Result<(), CoreError> {
        let shared = Arc::clone(&self.shared);
        let depth = shared.slots.len();
        let tid = self.thread_id;

        if shared.pin_threads {
            let cpu = (tid + 1) % shared.num_cpus;
            if !pin_current_thread(&[cpu]) {
                warn!("core {} thread {tid}: failed to pin to cpu {cpu}", shared.core_id);
            }
        }

        shared.slots[0].gate(tid).acquire()?;
        ready
            .send(tid)
            .map_err(|_| CoreError::Gate("receiver gone before start-up handshake".into()))?;
        drop(ready);

        loop {
            let index = (self.processed % depth as u64) as usize;
            let slot = &shared.slots[index];
            let (keep_processing, config_index) = {
                let data = slot.read()?;
                (data.keep_processing, data.config_index)
            };
            if !keep_processing {
                break;
            }
            if self.loaded.as_ref().map(|l| l.index) != Some(config_index) {
                self.load_config(config_index)?;
            }
            self.process_slot(slot)?;

            let next = &shared.slots[(index + 1) % depth];
            next.gate(tid).acquire()?;
            slot.gate(tid).release()?;
            self.processed += 1;
        }

        shared.slots[(self.processed % depth as u64) as usize]
            .gate(tid)
            .release()?;
        info!(
            "core {} thread {tid}: exiting after {} intervals",
            shared.core_id, self.processed
        );
        Ok(())
    }

    /// Swap in modes, polycos, chunk range and pulsar space for `index`.
    pub(crate) fn load_config(&mut self, index: usize) -> Result<(), CoreError> {
        let previous = self.loaded.take().map(|l| l.index);
        let provider = Arc::clone(&self.shared.provider);
        let config = provider.config(index);
        let num_datastreams = provider.num_datastreams();
        let layout = ResultLayout::new(config, provider.freq_table(), num_datastreams)?;

        let mut modes = Vec::with_capacity(num_datastreams);
        for datastream in 0..num_datastreams {
            let mode = provider.make_mode(index, datastream);
            if !mode.initialised_ok() {
                return Err(CoreError::ModeInvalid {
                    config: index,
                    datastream,
                });
            }
            modes.push(mode);
        }

        let polycos = if layout.binning {
            let table = provider.polycos(index).ok_or_else(|| {
                CoreError::InvalidConfig(format!("config {index} bins pulsars but has no polycos"))
            })?;
            if let Some(p) = table.iter().find(|p| p.num_bins() != layout.num_bins) {
                return Err(CoreError::InvalidConfig(format!(
                    "config {index} bins into {} pulsar bins but a polyco has {}",
                    layout.num_bins,
                    p.num_bins()
                )));
            }
            Some(PolycoSet::for_thread(&table, self.thread_id))
        } else {
            None
        };

        let (start_chunk, num_chunks) =
            chunk_partition(config.blocks_per_send, self.shared.num_threads, self.thread_id);

        if layout.scrunch {
            if self.accum.fits(&layout) {
                self.accum.clear();
            } else {
                self.accum = PulsarAccumulator::new(&layout);
            }
        } else if !self.accum.is_empty() {
            self.accum = PulsarAccumulator::default();
        }

        self.thread_results.clear();
        self.thread_results
            .resize(layout.cross_length, Complex32::new(0.0, 0.0));
        let max_stride = layout.cross.iter().map(|r| r.stride()).max().unwrap_or(0);
        self.scratch.resize(max_stride, Complex32::new(0.0, 0.0));
        self.bins = if layout.binning {
            provider
                .freq_table()
                .iter()
                .map(|f| vec![0; f.num_channels + 1])
                .collect()
        } else {
            Vec::new()
        };
        self.weights.clear();
        self.weights.resize(num_datastreams, 0.0);

        info!(
            "core {} thread {}: config {:?} -> {index}, chunks {}..{}, pulsar bins {}{}",
            self.shared.core_id,
            self.thread_id,
            previous,
            start_chunk,
            start_chunk + num_chunks,
            layout.num_bins,
            if layout.scrunch { " (scrunched)" } else { "" }
        );

        self.loaded = Some(LoadedConfig {
            index,
            layout,
            modes,
            polycos,
            start_chunk,
            num_chunks,
            chunk_ns: config.chunk_ns(),
        });
        Ok(())
    }

    /// Correlate this thread's chunks of `slot` and merge them into the
    /// slot's results.
    pub(crate) fn process_slot(&mut self, slot: &ProcessingSlot) -> Result<(), CoreError> {
        let shared = Arc::clone(&self.shared);
        let data = slot.read()?;
        let Self {
            loaded,
            thread_results,
            scratch,
            bins,
            accum,
            weights,
            sta_data,
            thread_id,
            ..
        } = self;
        let loaded = loaded
            .as_mut()
            .ok_or_else(|| CoreError::InvalidConfig("no configuration loaded".into()))?;
        let LoadedConfig {
            layout,
            modes,
            polycos,
            start_chunk,
            num_chunks,
            chunk_ns,
            ..
        } = loaded;
        let freqs = shared.provider.freq_table();
        let binning = data.pulsar.binning;
        let scrunch = data.pulsar.scrunch;

        for mode in modes.iter_mut() {
            mode.zero_autocorrelations();
        }
        zero(thread_results);

        let polyco = if binning {
            let set = polycos
                .as_ref()
                .ok_or_else(|| CoreError::InvalidConfig("pulsar binning without polycos".into()))?;
            Some(set.current(data.offset.mjd_seconds(shared.start_mjd, shared.start_seconds))?)
        } else {
            None
        };
        let interval_mjd = data.offset.mjd(shared.start_mjd, shared.start_seconds);

        for chunk in *start_chunk..*start_chunk + *num_chunks {
            for (datastream, mode) in modes.iter_mut().enumerate() {
                let input = data.antennas[datastream].input(data.offset);
                weights[datastream] = mode.process(&input, chunk);
            }

            if let Some(polyco) = polyco {
                let offset_mins = chunk as f64 * *chunk_ns / 60_000_000_000.0;
                polyco.bins(interval_mjd, offset_mins, freqs, bins);
            }

            for record in &layout.cross {
                let m1 = &modes[record.datastream1];
                let m2 = &modes[record.datastream2];
                let w1 = weights[record.datastream1];
                let w2 = weights[record.datastream2];
                let stride = record.stride();
                for (p, product) in record.products.iter().enumerate() {
                    let vis1 = m1.freqs(product.band1);
                    let vis2 = m2.conjugated_freqs(product.band2);
                    if vis1.len() != stride || vis2.len() != stride {
                        return Err(CoreError::InvalidConfig(format!(
                            "baseline {} freq {} product {p}: spectra of {} and {} values, expected {stride}",
                            record.baseline,
                            record.freq_index,
                            vis1.len(),
                            vis2.len()
                        )));
                    }
                    if binning {
                        let scratch = &mut scratch[..stride];
                        multiply_into(vis1, vis2, scratch);
                        let chan_bins = &bins[record.freq_index];
                        if scrunch {
                            fan_out_scrunch(accum, record, p, scratch, chan_bins, w1 * w2)?;
                        } else {
                            fan_out_in_place(thread_results, record, p, scratch, chan_bins, w1 * w2)?;
                        }
                    } else {
                        let start = record.product_offset(p, 0);
                        cross_multiply_accumulate(
                            record,
                            vis1,
                            vis2,
                            w1,
                            w2,
                            &mut thread_results[start..start + stride],
                        );
                    }
                }
            }
        }

        if let Some(polyco) = polyco {
            if scrunch {
                finalize_scrunch(accum, layout, polyco.bin_weights(), thread_results)?;
            } else {
                finalize_in_place(layout, polyco.bin_weights(), thread_results)?;
            }
        }

        if let Some(diagnostics) = &shared.diagnostics {
            if diagnostics.control.is_enabled() {
                send_sta(&shared, *thread_id, &data, modes, sta_data);
            }
        }

        let mut results = slot.results()?;
        if results.buffer.len() != layout.total_length {
            return Err(CoreError::ResultLength {
                config: data.config_index,
                declared: results.buffer.len(),
                computed: layout.total_length,
            });
        }
        add_in_place(&mut results.buffer[..layout.cross_length], thread_results);
        merge_autocorrelations(layout, modes, &mut results.buffer)?;
        debug!(
            "core {} thread {}: merged interval {} into slot {}",
            shared.core_id,
            thread_id,
            data.sequence,
            slot.index()
        );
        Ok(())
    }
}

fn send_sta(
    shared: &CoreShared,
    thread_id: usize,
    data: &SlotData,
    modes: &[Box<dyn Mode>],
    sta_data: &mut Vec<f32>,
) {
    let Some(diagnostics) = &shared.diagnostics else {
        return;
    };
    let config = shared.provider.config(data.config_index);
    let freqs = shared.provider.freq_table();
    let max_channels = diagnostics.control.channels();
    for (antenna, mode) in modes.iter().enumerate() {
        let table = &config.datastreams[antenna];
        for band in 0..table.num_total_bands() {
            let freq = &freqs[table.band_freq_index(band)];
            decimate_power(mode.autocorrelation(false, band), freq, max_channels, sta_data);
            let record = StaRecord {
                core_id: shared.core_id,
                thread_id,
                num_threads: shared.num_threads,
                antenna,
                band,
                seconds: data.offset.seconds,
                nanoseconds: data.offset.nanoseconds,
                num_channels: sta_data.len(),
                data: sta_data.clone(),
            };
            if let Err(err) = diagnostics.sink.send(&record) {
                warn!(
                    "core {} thread {thread_id}: dropped diagnostic for antenna {antenna} band {band}: {err}",
                    shared.core_id
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigProvider, ConfigTable, PulsarSettings};
    use crate::core::{CoreSettings, Diagnostics};
    use crate::polyco::{LinearPolyco, Polyco};
    use crate::sta::StaControl;
    use crate::testkit::{self, RecordingSink};

    const START_MJD: i32 = 60000;

    fn settings(num_threads: usize) -> CoreSettings {
        CoreSettings {
            num_threads,
            max_data_bytes: 64,
            control_length: 3,
            start_mjd: START_MJD,
            ..CoreSettings::default()
        }
    }

    fn shared_for(table: ConfigTable, num_threads: usize) -> Arc<CoreShared> {
        Arc::new(CoreShared::new(settings(num_threads), Arc::new(table)).unwrap())
    }

    fn covering_polyco(bins: usize) -> Vec<Box<dyn Polyco>> {
        vec![Box::new(LinearPolyco::new(START_MJD as f64, 1440.0, 0.0, bins))]
    }

    fn slot_results(shared: &CoreShared) -> Vec<Complex32> {
        shared.slots[0].results().unwrap().buffer.clone()
    }

    #[test]
    fn cross_products_scale_with_chunk_count() {
        let (freqs, config) = testkit::two_station_config(8, 2, None);
        let mut table = ConfigTable::new(freqs, 2, testkit::synthetic_factory(0.75));
        table.push(config).unwrap();
        let shared = shared_for(table, 1);
        let mut worker = ComputeWorker::new(Arc::clone(&shared), 0);
        worker.load_config(0).unwrap();
        worker.process_slot(&shared.slots[0]).unwrap();

        let results = slot_results(&shared);
        let n = testkit::BLOCKS_PER_SEND as f32;
        for p in 0..2 {
            let a = testkit::synthetic_spectrum(0, p, 8);
            let b = testkit::synthetic_spectrum(1, p, 8);
            let base = p * 9;
            for c in 0..8 {
                let expected = a[c] * b[c].conj() * n;
                assert!((results[base + c] - expected).norm() < 1e-3, "product {p} channel {c}");
            }
            assert!((results[base + 8].re - n * a[8].re * b[8].re).abs() < 1e-2);
            assert!((results[base + 8].im - n * 0.75 * 0.75).abs() < 1e-5);
        }
    }

    #[test]
    fn threads_split_chunks_and_sum_to_whole() {
        let (freqs, config) = testkit::two_station_config(4, 1, None);
        let mut table = ConfigTable::new(freqs, 2, testkit::synthetic_factory(1.0));
        table.push(config).unwrap();
        let shared = shared_for(table, 3);
        for tid in 0..3 {
            let mut worker = ComputeWorker::new(Arc::clone(&shared), tid);
            worker.load_config(0).unwrap();
            worker.process_slot(&shared.slots[0]).unwrap();
        }
        let results = slot_results(&shared);
        assert!((results[4].im - testkit::BLOCKS_PER_SEND as f32).abs() < 1e-6);
        // autocorr weight of the first station's first band
        assert!((results[5 + 4].im - testkit::BLOCKS_PER_SEND as f32).abs() < 1e-6);
    }

    #[test]
    fn invalid_mode_is_fatal() {
        let (freqs, config) = testkit::two_station_config(4, 1, None);
        let mut table = ConfigTable::new(freqs, 2, testkit::failing_factory(0));
        table.push(config).unwrap();
        let shared = shared_for(table, 1);
        let mut worker = ComputeWorker::new(shared, 0);
        assert_eq!(
            worker.load_config(0).err(),
            Some(CoreError::ModeInvalid {
                config: 0,
                datastream: 0
            })
        );
    }

    #[test]
    fn missing_polyco_is_fatal() {
        let pulsar = PulsarSettings {
            num_bins: 4,
            scrunch: false,
        };
        let (freqs, config) = testkit::two_station_config(4, 1, Some(pulsar));
        let mut table = ConfigTable::new(freqs, 2, testkit::synthetic_factory(1.0));
        let index = table.push(config).unwrap();
        table.set_polycos(
            index,
            vec![Box::new(LinearPolyco::new(START_MJD as f64 + 10.0, 60.0, 1.0, 4))],
        );
        let shared = shared_for(table, 1);
        let mut worker = ComputeWorker::new(Arc::clone(&shared), 0);
        worker.load_config(0).unwrap();
        assert!(matches!(
            worker.process_slot(&shared.slots[0]),
            Err(CoreError::NoPolyco { .. })
        ));
    }

    #[test]
    fn polyco_bin_count_must_match_config() {
        let pulsar = PulsarSettings {
            num_bins: 4,
            scrunch: false,
        };
        let (freqs, config) = testkit::two_station_config(4, 1, Some(pulsar));
        let mut table = ConfigTable::new(freqs, 2, testkit::synthetic_factory(1.0));
        let index = table.push(config).unwrap();
        table.set_polycos(index, covering_polyco(8));
        let shared = shared_for(table, 1);
        let mut worker = ComputeWorker::new(shared, 0);
        assert!(matches!(
            worker.load_config(0),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn scrunch_into_one_bin_reproduces_plain_output() {
        let (freqs, plain) = testkit::two_station_config(8, 2, None);
        let scrunched = PulsarSettings {
            num_bins: 4,
            scrunch: true,
        };
        let (_, binned) = testkit::two_station_config(8, 2, Some(scrunched));

        let mut plain_table = ConfigTable::new(freqs.clone(), 2, testkit::synthetic_factory(1.0));
        plain_table.push(plain).unwrap();
        let plain_shared = shared_for(plain_table, 2);

        let mut binned_table = ConfigTable::new(freqs, 2, testkit::synthetic_factory(1.0));
        let index = binned_table.push(binned).unwrap();
        binned_table.set_polycos(index, covering_polyco(4));
        let binned_shared = shared_for(binned_table, 2);

        for shared in [&plain_shared, &binned_shared] {
            for tid in 0..2 {
                let mut worker = ComputeWorker::new(Arc::clone(shared), tid);
                worker.load_config(0).unwrap();
                worker.process_slot(&shared.slots[0]).unwrap();
            }
        }
        assert_eq!(slot_results(&plain_shared), slot_results(&binned_shared));
    }

    #[test]
    fn reconfiguration_swaps_pulsar_space() {
        let (freqs, plain) = testkit::two_station_config(4, 1, None);
        let (_, scrunched) = testkit::two_station_config(
            4,
            1,
            Some(PulsarSettings {
                num_bins: 2,
                scrunch: true,
            }),
        );
        let mut table = ConfigTable::new(freqs, 2, testkit::synthetic_factory(1.0));
        table.push(plain).unwrap();
        let index = table.push(scrunched).unwrap();
        table.set_polycos(index, covering_polyco(2));
        let shared = shared_for(table, 2);

        let mut worker = ComputeWorker::new(Arc::clone(&shared), 1);
        worker.load_config(1).unwrap();
        assert_eq!(worker.accum.len(), 2 * 5);
        assert!(worker.loaded.as_ref().unwrap().polycos.as_ref().unwrap().is_private());
        worker.load_config(0).unwrap();
        assert!(worker.accum.is_empty());
        assert!(worker.loaded.as_ref().unwrap().polycos.is_none());
        assert_eq!(worker.loaded.as_ref().unwrap().start_chunk, 4);
    }

    #[test]
    fn sta_records_are_sent_per_antenna_band() {
        let (freqs, config) = testkit::two_station_config(8, 1, None);
        let mut table = ConfigTable::new(freqs, 2, testkit::synthetic_factory(1.0));
        table.push(config).unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut core_shared = CoreShared::new(settings(1), Arc::new(table)).unwrap();
        core_shared.diagnostics = Some(Diagnostics {
            control: Arc::new(StaControl::new(true, 2)),
            sink: sink.clone(),
        });
        let shared = Arc::new(core_shared);
        let mut worker = ComputeWorker::new(Arc::clone(&shared), 0);
        worker.load_config(0).unwrap();
        worker.process_slot(&shared.slots[0]).unwrap();

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 4);
        let first = &records[0];
        assert_eq!((first.antenna, first.band, first.num_channels), (0, 0, 2));
        let spectrum = testkit::synthetic_spectrum(0, 0, 8);
        let n = testkit::BLOCKS_PER_SEND as f32;
        let expected: f32 = spectrum[..4].iter().map(|v| n * v.norm_sqr()).sum();
        assert!((first.data[0] - expected).abs() < 1e-2);
        assert_eq!(shared.provider.num_configs(), 1);
    }
}
