//! Synthetic configurations and modes shared by the unit tests.

use std::sync::{Arc, Mutex};

use num_complex::Complex32;

use crate::config::{
    BaselineEntry, BaselineFreq, Configuration, DatastreamTable, FreqEntry, ModeFactory,
    ModeRequest, Polarisation, PolProduct, PulsarSettings, RecordedBand, ZoomBand,
};
use crate::core::JobAbort;
use crate::error::CoreError;
use crate::mode::{AntennaInput, Mode};
use crate::sta::{DiagnosticSink, StaRecord};
use crate::utils::{accumulate_cross_power, accumulate_power_add, zero};

pub const BLOCKS_PER_SEND: usize = 8;
pub const INTERVAL_NS: u64 = 1_000_000_000;

/// Two stations, each recording R and L on one USB frequency, one baseline.
/// `products` is 1 (RR) or 2 (RR, LL).
pub fn two_station_config(
    channels: usize,
    products: usize,
    pulsar: Option<PulsarSettings>,
) -> (Vec<FreqEntry>, Configuration) {
    let freqs = vec![FreqEntry::new(channels, false, 16.0)];
    let mut config = Configuration::new(BLOCKS_PER_SEND, INTERVAL_NS);
    let station = DatastreamTable {
        recorded: vec![
            RecordedBand {
                freq_index: 0,
                pol: Polarisation::R,
            },
            RecordedBand {
                freq_index: 0,
                pol: Polarisation::L,
            },
        ],
        zoom: Vec::new(),
    };
    config.datastreams = vec![station.clone(), station];
    let mut pol_products = vec![PolProduct { band1: 0, band2: 0 }];
    if products > 1 {
        pol_products.push(PolProduct { band1: 1, band2: 1 });
    }
    config.baselines = vec![BaselineEntry {
        datastream1: 0,
        datastream2: 1,
        freqs: vec![BaselineFreq {
            freq_index: 0,
            products: pol_products,
        }],
    }];
    config.pulsar = pulsar;
    (freqs, config)
}

/// One station with a recorded band on frequency 0 and a zoom band on
/// frequency 1 carved out of it.
pub fn zoom_config(parent_channels: usize, zoom_channels: usize, offset: usize) -> (Vec<FreqEntry>, Configuration) {
    let freqs = vec![
        FreqEntry::new(parent_channels, false, 16.0),
        FreqEntry::new(
            zoom_channels,
            false,
            16.0 * zoom_channels as f64 / parent_channels as f64,
        ),
    ];
    let mut config = Configuration::new(4, INTERVAL_NS);
    config.datastreams = vec![DatastreamTable {
        recorded: vec![RecordedBand {
            freq_index: 0,
            pol: Polarisation::R,
        }],
        zoom: vec![ZoomBand {
            freq_index: 1,
            parent_freq_index: 0,
            pol: Polarisation::R,
            channel_offset: offset,
        }],
    }];
    (freqs, config)
}

/// Deterministic spectrum for one datastream band. Modes built from it zero
/// the imaginary part of the Nyquist channel.
pub fn synthetic_spectrum(datastream: usize, band: usize, channels: usize) -> Vec<Complex32> {
    (0..=channels)
        .map(|c| {
            Complex32::new(
                1.0 + 0.5 * datastream as f32 + 0.125 * c as f32,
                0.25 * band as f32 - 0.0625 * c as f32 + 0.3 * datastream as f32,
            )
        })
        .collect()
}

/// Mode producing the same spectrum every chunk. Zoom bands report a quarter
/// of the chunk weight so weight inheritance is visible.
pub struct SyntheticMode {
    spectra: Vec<Vec<Complex32>>,
    conjugated: Vec<Vec<Complex32>>,
    autocorr: Vec<Vec<Complex32>>,
    cross_autocorr: Vec<Vec<Complex32>>,
    partners: Vec<usize>,
    nyquist: Vec<usize>,
    band_weights: Vec<f32>,
    weight: f32,
    cross_autocorrs: bool,
    valid: bool,
}

impl SyntheticMode {
    pub fn new(request: ModeRequest<'_>, weight: f32, valid: bool) -> Self {
        let table = &request.config.datastreams[request.datastream];
        let bands = table.num_total_bands();
        let mut spectra = Vec::with_capacity(bands);
        let mut nyquist = Vec::with_capacity(bands);
        let mut band_weights = Vec::with_capacity(bands);
        let mut partners = Vec::with_capacity(bands);
        for band in 0..bands {
            let entry = &request.freqs[table.band_freq_index(band)];
            let mut spectrum = synthetic_spectrum(request.datastream, band, entry.num_channels);
            spectrum[entry.nyquist_channel()].im = 0.0;
            spectra.push(spectrum);
            nyquist.push(entry.nyquist_channel());
            band_weights.push(if table.is_zoom(band) { 0.25 * weight } else { weight });
            partners.push(table.cross_pol_partner(band).unwrap_or(band));
        }
        let conjugated = spectra
            .iter()
            .map(|s| s.iter().map(|v| v.conj()).collect())
            .collect();
        let empty: Vec<Vec<Complex32>> = spectra
            .iter()
            .map(|s| vec![Complex32::new(0.0, 0.0); s.len()])
            .collect();
        Self {
            spectra,
            conjugated,
            autocorr: empty.clone(),
            cross_autocorr: empty,
            partners,
            nyquist,
            band_weights,
            weight,
            cross_autocorrs: request.config.write_cross_autocorrs,
            valid,
        }
    }
}

impl Mode for SyntheticMode {
    fn initialised_ok(&self) -> bool {
        self.valid
    }

    fn write_cross_autocorrs(&self) -> bool {
        self.cross_autocorrs
    }

    fn zero_autocorrelations(&mut self) {
        for ac in self.autocorr.iter_mut().chain(self.cross_autocorr.iter_mut()) {
            zero(ac);
        }
    }

    fn process(&mut self, _input: &AntennaInput<'_>, _chunk: usize) -> f32 {
        for band in 0..self.spectra.len() {
            let nyq = self.nyquist[band];
            let w = self.band_weights[band];
            accumulate_power_add(&mut self.autocorr[band], &self.spectra[band]);
            self.autocorr[band][nyq].im += w;

            let partner = self.partners[band];
            let carried = self.cross_autocorr[band][nyq].im;
            accumulate_cross_power(
                &mut self.cross_autocorr[band],
                &self.spectra[band],
                &self.spectra[partner],
            );
            self.cross_autocorr[band][nyq].im = carried + w;
        }
        self.weight
    }

    fn freqs(&self, band: usize) -> &[Complex32] {
        &self.spectra[band]
    }

    fn conjugated_freqs(&self, band: usize) -> &[Complex32] {
        &self.conjugated[band]
    }

    fn autocorrelation(&self, cross_pol: bool, band: usize) -> &[Complex32] {
        if cross_pol {
            &self.cross_autocorr[band]
        } else {
            &self.autocorr[band]
        }
    }
}

pub fn synthetic_factory(weight: f32) -> ModeFactory {
    Arc::new(move |request: ModeRequest<'_>| Box::new(SyntheticMode::new(request, weight, true)) as Box<dyn Mode>)
}

/// Factory whose modes fail self-validation for `bad_config`.
pub fn failing_factory(bad_config: usize) -> ModeFactory {
    Arc::new(move |request: ModeRequest<'_>| {
        let valid = request.config_index != bad_config;
        Box::new(SyntheticMode::new(request, 1.0, valid)) as Box<dyn Mode>
    })
}

/// Abort hook that panics so tests can observe fatal errors.
pub struct PanicAbort;

impl JobAbort for PanicAbort {
    fn abort(&self, error: &CoreError) -> ! {
        panic!("job aborted: {error}")
    }
}

/// Diagnostic sink that keeps every record.
#[derive(Default)]
pub struct RecordingSink {
    pub records: Mutex<Vec<StaRecord>>,
}

impl DiagnosticSink for RecordingSink {
    fn send(&self, record: &StaRecord) -> Result<(), CoreError> {
        self.records
            .lock()
            .map_err(|_| CoreError::Diagnostic("recording sink poisoned".into()))?
            .push(record.clone());
        Ok(())
    }
}
