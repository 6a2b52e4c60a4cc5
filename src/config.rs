use std::sync::Arc;

use crate::error::CoreError;
use crate::mode::Mode;
use crate::polyco::Polyco;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Polarisation {
    R,
    L,
    X,
    Y,
}

/// One entry of the global frequency table.
#[derive(Clone, Debug, PartialEq)]
pub struct FreqEntry {
    pub num_channels: usize,
    pub lower_sideband: bool,
    pub bandwidth_mhz: f64,
}

impl FreqEntry {
    pub fn new(num_channels: usize, lower_sideband: bool, bandwidth_mhz: f64) -> Self {
        Self {
            num_channels,
            lower_sideband,
            bandwidth_mhz,
        }
    }

    /// The real-only band-edge channel: first channel for LSB, last for USB.
    pub fn nyquist_channel(&self) -> usize {
        if self.lower_sideband {
            0
        } else {
            self.num_channels
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RecordedBand {
    pub freq_index: usize,
    pub pol: Polarisation,
}

/// A narrow band carved out of a recorded parent band.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ZoomBand {
    pub freq_index: usize,
    pub parent_freq_index: usize,
    pub pol: Polarisation,
    /// First parent channel covered by the zoom band.
    pub channel_offset: usize,
}

/// Band layout of one datastream: recorded bands first, then zoom bands.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DatastreamTable {
    pub recorded: Vec<RecordedBand>,
    pub zoom: Vec<ZoomBand>,
}

impl DatastreamTable {
    pub fn num_recorded_bands(&self) -> usize {
        self.recorded.len()
    }

    pub fn num_total_bands(&self) -> usize {
        self.recorded.len() + self.zoom.len()
    }

    pub fn is_zoom(&self, band: usize) -> bool {
        band >= self.recorded.len()
    }

    pub fn band_freq_index(&self, band: usize) -> usize {
        if self.is_zoom(band) {
            self.zoom[band - self.recorded.len()].freq_index
        } else {
            self.recorded[band].freq_index
        }
    }

    pub fn band_pol(&self, band: usize) -> Polarisation {
        if self.is_zoom(band) {
            self.zoom[band - self.recorded.len()].pol
        } else {
            self.recorded[band].pol
        }
    }

    /// Recorded band a zoom band inherits its weight from: same parent
    /// frequency, same polarisation.
    pub fn parent_band(&self, band: usize) -> Option<usize> {
        if !self.is_zoom(band) {
            return None;
        }
        let zoom = &self.zoom[band - self.recorded.len()];
        self.recorded
            .iter()
            .position(|r| r.freq_index == zoom.parent_freq_index && r.pol == zoom.pol)
    }

    /// Band with the same frequency and the other polarisation, for cross-pol
    /// autocorrelations.
    pub fn cross_pol_partner(&self, band: usize) -> Option<usize> {
        let freq = self.band_freq_index(band);
        let pol = self.band_pol(band);
        (0..self.num_total_bands())
            .find(|&other| other != band && self.band_freq_index(other) == freq && self.band_pol(other) != pol)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PolProduct {
    /// Band index within the first datastream.
    pub band1: usize,
    /// Band index within the second datastream.
    pub band2: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BaselineFreq {
    pub freq_index: usize,
    pub products: Vec<PolProduct>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BaselineEntry {
    pub datastream1: usize,
    pub datastream2: usize,
    pub freqs: Vec<BaselineFreq>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PulsarSettings {
    pub num_bins: usize,
    pub scrunch: bool,
}

/// One correlation configuration: channelisation, baselines, pulsar settings.
#[derive(Clone, Debug, PartialEq)]
pub struct Configuration {
    /// FFT chunks per interval.
    pub blocks_per_send: usize,
    /// Interval duration in nanoseconds.
    pub interval_ns: u64,
    pub datastreams: Vec<DatastreamTable>,
    pub baselines: Vec<BaselineEntry>,
    pub pulsar: Option<PulsarSettings>,
    pub write_cross_autocorrs: bool,
    /// Empty means every frequency is used.
    pub freq_used: Vec<bool>,
    /// Length the provider declares for the result buffer; `None` lets the
    /// table derive it from the layout.
    pub declared_result_length: Option<usize>,
}

impl Configuration {
    pub fn new(blocks_per_send: usize, interval_ns: u64) -> Self {
        Self {
            blocks_per_send,
            interval_ns,
            datastreams: Vec::new(),
            baselines: Vec::new(),
            pulsar: None,
            write_cross_autocorrs: false,
            freq_used: Vec::new(),
            declared_result_length: None,
        }
    }

    pub fn pulsar_bin_on(&self) -> bool {
        self.pulsar.is_some()
    }

    pub fn scrunch_on(&self) -> bool {
        self.pulsar.map(|p| p.scrunch).unwrap_or(false)
    }

    pub fn num_pulsar_bins(&self) -> usize {
        self.pulsar.map(|p| p.num_bins).unwrap_or(1)
    }

    pub fn is_frequency_used(&self, freq_index: usize) -> bool {
        self.freq_used.get(freq_index).copied().unwrap_or(true)
    }

    pub fn max_products(&self) -> usize {
        self.baselines
            .iter()
            .flat_map(|b| b.freqs.iter())
            .map(|f| f.products.len())
            .max()
            .unwrap_or(0)
    }

    /// Nanoseconds covered by one FFT chunk.
    pub fn chunk_ns(&self) -> f64 {
        self.interval_ns as f64 / self.blocks_per_send.max(1) as f64
    }
}

/// Everything a mode factory needs to build a `Mode` for one datastream.
pub struct ModeRequest<'a> {
    pub config_index: usize,
    pub datastream: usize,
    pub config: &'a Configuration,
    pub freqs: &'a [FreqEntry],
}

pub type ModeFactory = Arc<dyn Fn(ModeRequest<'_>) -> Box<dyn Mode> + Send + Sync>;
pub type PolycoTable = Arc<Vec<Box<dyn Polyco>>>;

/// Query interface onto the correlator configuration.
pub trait ConfigProvider: Send + Sync {
    fn num_configs(&self) -> usize;
    fn num_datastreams(&self) -> usize;
    fn freq_table(&self) -> &[FreqEntry];
    fn config(&self, index: usize) -> &Configuration;
    fn result_length(&self, index: usize) -> usize;
    /// Configuration covering an interval that starts `seconds` after the
    /// observation start.
    fn config_index_for(&self, seconds: i32) -> Option<usize>;
    fn make_mode(&self, index: usize, datastream: usize) -> Box<dyn Mode>;
    /// Externally-owned polyco set for a pulsar-binned configuration.
    fn polycos(&self, index: usize) -> Option<PolycoTable>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanWindow {
    pub start_seconds: i32,
    pub end_seconds: i32,
    pub config_index: usize,
}

/// In-memory configuration provider.
pub struct ConfigTable {
    freqs: Vec<FreqEntry>,
    configs: Vec<Configuration>,
    result_lengths: Vec<usize>,
    polycos: Vec<Option<PolycoTable>>,
    scans: Vec<ScanWindow>,
    num_datastreams: usize,
    mode_factory: ModeFactory,
}

impl ConfigTable {
    pub fn new(freqs: Vec<FreqEntry>, num_datastreams: usize, mode_factory: ModeFactory) -> Self {
        Self {
            freqs,
            configs: Vec::new(),
            result_lengths: Vec::new(),
            polycos: Vec::new(),
            scans: Vec::new(),
            num_datastreams,
            mode_factory,
        }
    }

    /// Add a configuration, returning its index.
    pub fn push(&mut self, config: Configuration) -> Result<usize, CoreError> {
        let index = self.configs.len();
        let length = match config.declared_result_length {
            Some(declared) => declared,
            None => ResultLayout::new(&config, &self.freqs, self.num_datastreams)?.total_length,
        };
        self.configs.push(config);
        self.result_lengths.push(length);
        self.polycos.push(None);
        Ok(index)
    }

    pub fn set_polycos(&mut self, index: usize, polycos: Vec<Box<dyn Polyco>>) {
        self.polycos[index] = Some(Arc::new(polycos));
    }

    /// Map `[start_seconds, end_seconds)` to a configuration. Without any scan
    /// windows every interval uses configuration 0.
    pub fn add_scan(&mut self, start_seconds: i32, end_seconds: i32, config_index: usize) {
        self.scans.push(ScanWindow {
            start_seconds,
            end_seconds,
            config_index,
        });
    }
}

impl ConfigProvider for ConfigTable {
    fn num_configs(&self) -> usize {
        self.configs.len()
    }

    fn num_datastreams(&self) -> usize {
        self.num_datastreams
    }

    fn freq_table(&self) -> &[FreqEntry] {
        &self.freqs
    }

    fn config(&self, index: usize) -> &Configuration {
        &self.configs[index]
    }

    fn result_length(&self, index: usize) -> usize {
        self.result_lengths[index]
    }

    fn config_index_for(&self, seconds: i32) -> Option<usize> {
        if self.scans.is_empty() {
            return if self.configs.is_empty() { None } else { Some(0) };
        }
        self.scans
            .iter()
            .find(|s| seconds >= s.start_seconds && seconds < s.end_seconds)
            .map(|s| s.config_index)
    }

    fn make_mode(&self, index: usize, datastream: usize) -> Box<dyn Mode> {
        (self.mode_factory)(ModeRequest {
            config_index: index,
            datastream,
            config: &self.configs[index],
            freqs: &self.freqs,
        })
    }

    fn polycos(&self, index: usize) -> Option<PolycoTable> {
        self.polycos.get(index).cloned().flatten()
    }
}

/// Output position of one baseline/frequency and all its polarisation products.
#[derive(Clone, Debug, PartialEq)]
pub struct CrossRecord {
    pub baseline: usize,
    pub datastream1: usize,
    pub datastream2: usize,
    pub freq_index: usize,
    pub channels: usize,
    pub nyquist: usize,
    pub products: Vec<PolProduct>,
    /// Start of this record in the result buffer.
    pub offset: usize,
    /// Bins stored in the result buffer: `num_bins` when binning without
    /// scrunch, otherwise 1.
    pub bins_in_output: usize,
    /// Start of this record in the scrunch accumulation arena.
    pub accum_offset: usize,
}

impl CrossRecord {
    pub fn stride(&self) -> usize {
        self.channels + 1
    }

    /// Offset of (product, bin) in the result buffer.
    pub fn product_offset(&self, product: usize, bin: usize) -> usize {
        self.offset + (bin * self.products.len() + product) * self.stride()
    }

    pub fn span(&self) -> usize {
        self.products.len() * self.bins_in_output * self.stride()
    }

    /// Channels that carry a normal complex product; the Nyquist channel is
    /// handled separately.
    pub fn spectral_channels(&self) -> std::ops::Range<usize> {
        if self.nyquist == 0 {
            1..self.channels + 1
        } else {
            0..self.channels
        }
    }
}

/// Where a zoom band picks up its Nyquist-channel weight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParentWeight {
    pub band: usize,
    /// Parent's Nyquist channel, where its weight lives.
    pub nyquist: usize,
    /// Parent's record offset in the same result section, when the parent is output.
    pub offset: Option<usize>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AutoRecord {
    pub datastream: usize,
    pub band: usize,
    pub cross_pol: bool,
    pub freq_index: usize,
    pub channels: usize,
    pub nyquist: usize,
    pub offset: usize,
    pub parent: Option<ParentWeight>,
}

/// Ordering of everything written into a slot's result buffer: cross
/// products by baseline/frequency/polarisation (per bin when not
/// scrunching), then autocorrelations per datastream and band, then
/// optional cross-polarisation autocorrelations.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultLayout {
    pub cross: Vec<CrossRecord>,
    pub cross_length: usize,
    pub autos: Vec<AutoRecord>,
    pub total_length: usize,
    pub num_bins: usize,
    pub binning: bool,
    pub scrunch: bool,
    /// Size of the scrunch arena (zero unless scrunching).
    pub accum_length: usize,
}

impl ResultLayout {
    pub fn new(
        config: &Configuration,
        freqs: &[FreqEntry],
        num_datastreams: usize,
    ) -> Result<Self, CoreError> {
        let binning = config.pulsar_bin_on();
        let scrunch = config.scrunch_on();
        let num_bins = config.num_pulsar_bins();
        if binning && num_bins == 0 {
            return Err(CoreError::InvalidConfig(
                "pulsar binning requires at least one bin".into(),
            ));
        }
        if config.datastreams.len() != num_datastreams {
            return Err(CoreError::InvalidConfig(format!(
                "{} datastream tables for {} datastreams",
                config.datastreams.len(),
                num_datastreams
            )));
        }
        let bins_in_output = if binning && !scrunch { num_bins } else { 1 };

        let mut cross = Vec::new();
        let mut offset = 0usize;
        let mut accum_offset = 0usize;
        for (b, baseline) in config.baselines.iter().enumerate() {
            let ds1 = config.datastreams.get(baseline.datastream1);
            let ds2 = config.datastreams.get(baseline.datastream2);
            let (ds1, ds2) = match (ds1, ds2) {
                (Some(a), Some(c)) => (a, c),
                _ => {
                    return Err(CoreError::InvalidConfig(format!(
                        "baseline {b} references a missing datastream"
                    )))
                }
            };
            for bf in &baseline.freqs {
                let entry = lookup_freq(freqs, bf.freq_index)?;
                for p in &bf.products {
                    if p.band1 >= ds1.num_total_bands() || p.band2 >= ds2.num_total_bands() {
                        return Err(CoreError::InvalidConfig(format!(
                            "baseline {b} frequency {} references a missing band",
                            bf.freq_index
                        )));
                    }
                    // both sides must share the baseline's channelisation and sideband
                    for (side, ds, band) in [(1, ds1, p.band1), (2, ds2, p.band2)] {
                        let band_entry = lookup_freq(freqs, ds.band_freq_index(band))?;
                        if band_entry.num_channels != entry.num_channels
                            || band_entry.lower_sideband != entry.lower_sideband
                        {
                            return Err(CoreError::InvalidConfig(format!(
                                "baseline {b} frequency {}: antenna {side} band {band} has a different channelisation or sideband",
                                bf.freq_index
                            )));
                        }
                    }
                }
                let record = CrossRecord {
                    baseline: b,
                    datastream1: baseline.datastream1,
                    datastream2: baseline.datastream2,
                    freq_index: bf.freq_index,
                    channels: entry.num_channels,
                    nyquist: entry.nyquist_channel(),
                    products: bf.products.clone(),
                    offset,
                    bins_in_output,
                    accum_offset,
                };
                offset += record.span();
                if scrunch {
                    accum_offset += record.products.len() * num_bins * record.stride();
                }
                cross.push(record);
            }
        }
        let cross_length = offset;

        let mut autos = Vec::new();
        let sections: &[bool] = if config.write_cross_autocorrs && config.max_products() > 1 {
            &[false, true]
        } else {
            &[false]
        };
        for (ds_index, ds) in config.datastreams.iter().enumerate() {
            for &cross_pol in sections {
                let section_start = autos.len();
                for band in 0..ds.num_total_bands() {
                    let freq_index = ds.band_freq_index(band);
                    if !config.is_frequency_used(freq_index) {
                        continue;
                    }
                    let entry = lookup_freq(freqs, freq_index)?;
                    autos.push(AutoRecord {
                        datastream: ds_index,
                        band,
                        cross_pol,
                        freq_index,
                        channels: entry.num_channels,
                        nyquist: entry.nyquist_channel(),
                        offset,
                        parent: None,
                    });
                    offset += entry.num_channels + 1;
                }
                for idx in section_start..autos.len() {
                    let band = autos[idx].band;
                    if let Some(parent_band) = ds.parent_band(band) {
                        let parent_offset = autos[section_start..]
                            .iter()
                            .find(|r| r.band == parent_band)
                            .map(|r| r.offset);
                        let parent_entry = lookup_freq(freqs, ds.band_freq_index(parent_band))?;
                        autos[idx].parent = Some(ParentWeight {
                            band: parent_band,
                            nyquist: parent_entry.nyquist_channel(),
                            offset: parent_offset,
                        });
                    }
                }
            }
        }

        Ok(Self {
            cross,
            cross_length,
            autos,
            total_length: offset,
            num_bins,
            binning,
            scrunch,
            accum_length: accum_offset,
        })
    }
}

fn lookup_freq(freqs: &[FreqEntry], index: usize) -> Result<&FreqEntry, CoreError> {
    freqs
        .get(index)
        .ok_or_else(|| CoreError::InvalidConfig(format!("frequency index {index} out of range")))
}

/// Contiguous share of `blocks` chunks for `thread_id`; the remainder goes to
/// the lowest-indexed threads.
pub fn chunk_partition(blocks: usize, num_threads: usize, thread_id: usize) -> (usize, usize) {
    let base = blocks / num_threads;
    let remainder = blocks % num_threads;
    let count = base + usize::from(thread_id < remainder);
    let start = thread_id * base + thread_id.min(remainder);
    (start, count)
}
