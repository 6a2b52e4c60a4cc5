use std::sync::Arc;

use log::warn;
use num_complex::Complex32;

use crate::config::{ModeFactory, ModeRequest};
use crate::mode::{AntennaInput, Mode};
use crate::utils::{
    accumulate_cross_power, accumulate_power_add, apply_delay_regular_bins, decode_2bit_into,
    zero, FftHelper,
};

/// Zoom band as a window onto a recorded band's spectrum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ZoomWindow {
    parent: usize,
    offset: usize,
    channels: usize,
}

/// Per-band geometry resolved from a configuration.
#[derive(Clone, Debug, PartialEq)]
struct BandPlan {
    num_recorded: usize,
    channels: usize,
    bandwidth_hz: f64,
    lower_sideband: bool,
    zooms: Vec<ZoomWindow>,
    nyquist: Vec<usize>,
    partners: Vec<Option<usize>>,
}

impl BandPlan {
    fn resolve(request: &ModeRequest<'_>) -> Result<Self, String> {
        let table = request
            .config
            .datastreams
            .get(request.datastream)
            .ok_or_else(|| format!("no band table for datastream {}", request.datastream))?;
        let freq = |index: usize| {
            request
                .freqs
                .get(index)
                .ok_or_else(|| format!("frequency {index} out of range"))
        };
        let first = table
            .recorded
            .first()
            .ok_or_else(|| "no recorded bands".to_string())?;
        let reference = freq(first.freq_index)?;
        if reference.num_channels == 0 {
            return Err("zero channels".into());
        }
        for band in &table.recorded {
            let entry = freq(band.freq_index)?;
            if entry.num_channels != reference.num_channels
                || entry.bandwidth_mhz != reference.bandwidth_mhz
                || entry.lower_sideband != reference.lower_sideband
            {
                return Err("recorded bands differ in channelisation".into());
            }
        }
        let num_recorded = table.recorded.len();
        if (2 * reference.num_channels * num_recorded) % 4 != 0 {
            return Err("chunk does not fill whole bytes".into());
        }

        let mut zooms = Vec::with_capacity(table.zoom.len());
        for (z, zoom) in table.zoom.iter().enumerate() {
            let parent = table
                .parent_band(num_recorded + z)
                .ok_or_else(|| format!("zoom band {z} has no recorded parent"))?;
            let channels = freq(zoom.freq_index)?.num_channels;
            if zoom.channel_offset + channels > reference.num_channels {
                return Err(format!("zoom band {z} runs past its parent"));
            }
            zooms.push(ZoomWindow {
                parent,
                offset: zoom.channel_offset,
                channels,
            });
        }

        let total = table.num_total_bands();
        let mut nyquist = Vec::with_capacity(total);
        for band in 0..total {
            nyquist.push(freq(table.band_freq_index(band))?.nyquist_channel());
        }
        let partners = (0..total).map(|b| table.cross_pol_partner(b)).collect();

        Ok(Self {
            num_recorded,
            channels: reference.num_channels,
            bandwidth_hz: reference.bandwidth_mhz * 1e6,
            lower_sideband: reference.lower_sideband,
            zooms,
            nyquist,
            partners,
        })
    }

    fn fft_len(&self) -> usize {
        2 * self.channels
    }

    fn bytes_per_chunk(&self) -> usize {
        self.fft_len() * self.num_recorded / 4
    }

    fn band_channels(&self, band: usize) -> usize {
        if band < self.num_recorded {
            self.channels
        } else {
            self.zooms[band - self.num_recorded].channels
        }
    }
}

/// Reference station-based processing for real-sampled 2-bit data with
/// recorded bands interleaved sample by sample.
///
/// Each chunk is `2 * channels` samples per band. Control delays are the
/// signal's arrival delay polynomial in seconds, evaluated at the chunk centre
/// and removed as a phase slope.
pub struct FftMode {
    plan: Option<BandPlan>,
    fft: Option<FftHelper>,
    levels: [f32; 4],
    chunk_ns: f64,
    cross_autocorrs: bool,
    samples: Vec<f32>,
    band_samples: Vec<f32>,
    fft_out: Vec<Complex32>,
    spectra: Vec<Vec<Complex32>>,
    conjugated: Vec<Vec<Complex32>>,
    autocorr: Vec<Vec<Complex32>>,
    cross_autocorr: Vec<Vec<Complex32>>,
}

impl FftMode {
    pub fn new(request: ModeRequest<'_>, levels: [f32; 4]) -> Self {
        let plan = match BandPlan::resolve(&request) {
            Ok(plan) => Some(plan),
            Err(reason) => {
                warn!(
                    "config {} datastream {}: cannot build FFT mode: {reason}",
                    request.config_index, request.datastream
                );
                None
            }
        };
        let mut mode = Self {
            plan: None,
            fft: None,
            levels,
            chunk_ns: request.config.chunk_ns(),
            cross_autocorrs: request.config.write_cross_autocorrs,
            samples: Vec::new(),
            band_samples: Vec::new(),
            fft_out: Vec::new(),
            spectra: Vec::new(),
            conjugated: Vec::new(),
            autocorr: Vec::new(),
            cross_autocorr: Vec::new(),
        };
        if let Some(plan) = plan {
            let fft_len = plan.fft_len();
            let bands = plan.nyquist.len();
            let spectrum = |b: usize| vec![Complex32::new(0.0, 0.0); plan.band_channels(b) + 1];
            mode.fft = Some(FftHelper::new(fft_len));
            mode.samples = vec![0.0; fft_len * plan.num_recorded];
            mode.band_samples = vec![0.0; fft_len];
            mode.fft_out = vec![Complex32::new(0.0, 0.0); plan.channels + 1];
            mode.spectra = (0..bands).map(spectrum).collect();
            mode.conjugated = (0..bands).map(spectrum).collect();
            mode.autocorr = (0..bands).map(spectrum).collect();
            mode.cross_autocorr = (0..bands).map(spectrum).collect();
            mode.plan = Some(plan);
        }
        mode
    }

    /// Factory producing `FftMode`s with the given sampler levels.
    pub fn factory(levels: [f32; 4]) -> ModeFactory {
        Arc::new(move |request: ModeRequest<'_>| {
            Box::new(FftMode::new(request, levels)) as Box<dyn Mode>
        })
    }

    /// Bytes of one interval for this datastream.
    pub fn bytes_per_interval(&self, blocks_per_send: usize) -> usize {
        self.plan
            .as_ref()
            .map(|p| p.bytes_per_chunk() * blocks_per_send)
            .unwrap_or(0)
    }
}

fn clear_spectra(spectra: &mut [Vec<Complex32>], conjugated: &mut [Vec<Complex32>]) {
    for s in spectra.iter_mut().chain(conjugated.iter_mut()) {
        zero(s);
    }
}

impl Mode for FftMode {
    fn initialised_ok(&self) -> bool {
        self.plan.is_some()
    }

    fn write_cross_autocorrs(&self) -> bool {
        self.cross_autocorrs
    }

    fn zero_autocorrelations(&mut self) {
        for ac in self.autocorr.iter_mut().chain(self.cross_autocorr.iter_mut()) {
            zero(ac);
        }
    }

    fn process(&mut self, input: &AntennaInput<'_>, chunk: usize) -> f32 {
        let (Some(plan), Some(fft)) = (self.plan.as_ref(), self.fft.as_mut()) else {
            return 0.0;
        };
        let bytes = plan.bytes_per_chunk();
        let start = chunk * bytes;
        let raw = input
            .data
            .get(start..)
            .map(|rest| &rest[..rest.len().min(bytes)])
            .unwrap_or(&[]);
        let decoded = decode_2bit_into(raw, &self.levels, &mut self.samples);
        let validity = input.validity.clamp(0.0, 1.0) as f32;
        let weight = validity * decoded as f32 / self.samples.len() as f32;
        if weight <= 0.0 {
            clear_spectra(&mut self.spectra, &mut self.conjugated);
            return 0.0;
        }

        let t = (chunk as f64 + 0.5) * self.chunk_ns * 1e-9;
        let delay: f64 = input
            .delays
            .iter()
            .enumerate()
            .map(|(k, c)| c * t.powi(k as i32))
            .sum();
        let channels = plan.channels;
        let freq_step_hz = plan.bandwidth_hz / channels as f64;
        let nrec = plan.num_recorded;

        for band in 0..nrec {
            for (i, sample) in self.band_samples.iter_mut().enumerate() {
                *sample = self.samples[i * nrec + band];
            }
            if let Err(err) = fft.forward_r2c_process(&mut self.band_samples, &mut self.fft_out) {
                warn!("band {band} chunk {chunk}: FFT failed: {err}");
                clear_spectra(&mut self.spectra, &mut self.conjugated);
                return 0.0;
            }
            apply_delay_regular_bins(&mut self.fft_out, freq_step_hz, -delay);
            let spectrum = &mut self.spectra[band];
            if plan.lower_sideband {
                for (c, value) in spectrum.iter_mut().enumerate() {
                    *value = self.fft_out[channels - c];
                }
            } else {
                spectrum.copy_from_slice(&self.fft_out);
            }
        }

        for (z, window) in plan.zooms.iter().enumerate() {
            let (recorded, zoomed) = self.spectra.split_at_mut(nrec);
            zoomed[z].copy_from_slice(
                &recorded[window.parent][window.offset..window.offset + window.channels + 1],
            );
        }

        for (band, spectrum) in self.spectra.iter().enumerate() {
            for (dest, value) in self.conjugated[band].iter_mut().zip(spectrum.iter()) {
                *dest = value.conj();
            }
            let nyq = plan.nyquist[band];
            accumulate_power_add(&mut self.autocorr[band], spectrum);
            self.autocorr[band][nyq].im += weight;

            if self.cross_autocorrs {
                let partner = plan.partners[band].unwrap_or(band);
                let carried = self.cross_autocorr[band][nyq].im;
                accumulate_cross_power(&mut self.cross_autocorr[band], spectrum, &self.spectra[partner]);
                self.cross_autocorr[band][nyq].im = carried + weight;
            }
        }
        weight
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Configuration, FreqEntry};
    use crate::slot::TimeOffset;
    use crate::testkit;
    use crate::utils::{pack_2bit_codes, quantise_2bit, tone, DEFAULT_LEVELS_2BIT};

    fn request<'a>(config: &'a Configuration, freqs: &'a [FreqEntry], datastream: usize) -> ModeRequest<'a> {
        ModeRequest {
            config_index: 0,
            datastream,
            config,
            freqs,
        }
    }

    /// Interleave per-band sample streams and pack them as 2-bit codes.
    fn pack_bands(bands: &[Vec<f32>]) -> Vec<u8> {
        let len = bands[0].len();
        let mut codes = Vec::with_capacity(len * bands.len());
        for i in 0..len {
            for band in bands {
                codes.push(quantise_2bit(band[i], &DEFAULT_LEVELS_2BIT));
            }
        }
        pack_2bit_codes(&codes)
    }

    fn input(data: &[u8]) -> AntennaInput<'_> {
        AntennaInput {
            data,
            validity: 1.0,
            delays: &[],
            offset: TimeOffset::default(),
        }
    }

    #[test]
    fn tone_lands_in_its_channel() {
        let (freqs, config) = testkit::two_station_config(16, 1, None);
        let mut mode = FftMode::new(request(&config, &freqs, 0), DEFAULT_LEVELS_2BIT);
        assert!(mode.initialised_ok());
        // channel 5 of 16: 5 cycles per 32 samples
        let signal = tone(32, 5.0 / 32.0, 0.0, 1.5);
        let data = pack_bands(&[signal.clone(), signal]);
        mode.zero_autocorrelations();
        let weight = mode.process(&input(&data), 0);
        assert_eq!(weight, 1.0);
        let ac = mode.autocorrelation(false, 0);
        let peak = (0..16)
            .max_by(|&a, &b| ac[a].re.partial_cmp(&ac[b].re).unwrap())
            .unwrap();
        assert_eq!(peak, 5);
        assert_eq!(ac[16].im, 1.0);
    }

    #[test]
    fn lower_sideband_reverses_channels() {
        let (_, config) = testkit::two_station_config(16, 1, None);
        let lsb = vec![FreqEntry::new(16, true, 16.0)];
        let mut mode = FftMode::new(request(&config, &lsb, 0), DEFAULT_LEVELS_2BIT);
        let signal = tone(32, 5.0 / 32.0, 0.0, 1.5);
        let data = pack_bands(&[signal.clone(), signal]);
        mode.process(&input(&data), 0);
        let ac = mode.autocorrelation(false, 0);
        let peak = (0..=16)
            .max_by(|&a, &b| ac[a].re.partial_cmp(&ac[b].re).unwrap())
            .unwrap();
        assert_eq!(peak, 16 - 5);
        assert_eq!(ac[0].im, 1.0);
    }

    #[test]
    fn short_read_lowers_weight_and_missing_chunk_is_zero() {
        let (freqs, config) = testkit::two_station_config(16, 1, None);
        let mut mode = FftMode::new(request(&config, &freqs, 0), DEFAULT_LEVELS_2BIT);
        assert_eq!(mode.bytes_per_interval(config.blocks_per_send), 16 * config.blocks_per_send);
        let data = vec![0x1B; 24];
        assert_eq!(mode.process(&input(&data), 1), 0.5);
        assert_eq!(mode.process(&input(&data), 2), 0.0);
        assert!(mode.freqs(0).iter().all(|v| v.norm() == 0.0));
        let flagged = AntennaInput {
            validity: 0.0,
            ..input(&data)
        };
        assert_eq!(mode.process(&flagged, 0), 0.0);
    }

    #[test]
    fn zoom_band_is_a_window_of_its_parent() {
        let (freqs, config) = testkit::zoom_config(16, 4, 8);
        let mut mode = FftMode::new(request(&config, &freqs, 0), DEFAULT_LEVELS_2BIT);
        assert!(mode.initialised_ok());
        let signal = tone(32, 9.0 / 32.0, 0.3, 1.5);
        let data = pack_bands(&[signal]);
        mode.process(&input(&data), 0);
        assert_eq!(mode.freqs(1), &mode.freqs(0)[8..13]);
        assert_eq!(mode.conjugated_freqs(1)[1], mode.freqs(0)[9].conj());
    }

    #[test]
    fn delay_is_removed_as_phase_slope() {
        let (freqs, config) = testkit::two_station_config(16, 1, None);
        let mut plain = FftMode::new(request(&config, &freqs, 0), DEFAULT_LEVELS_2BIT);
        let mut delayed = FftMode::new(request(&config, &freqs, 0), DEFAULT_LEVELS_2BIT);
        let signal = tone(32, 8.0 / 32.0, 0.3, 1.5);
        let data = pack_bands(&[signal.clone(), signal]);
        plain.process(&input(&data), 0);
        let delays = [1.0 / 16e6];
        delayed.process(
            &AntennaInput {
                delays: &delays,
                ..input(&data)
            },
            0,
        );
        // two samples at 32 Msps: half a turn by channel 8
        let ratio = delayed.freqs(0)[8] / plain.freqs(0)[8];
        assert!((ratio.norm() - 1.0).abs() < 1e-3);
        assert!((ratio.arg().abs() - std::f32::consts::PI).abs() < 1e-3);
        assert_eq!(delayed.freqs(0)[0], plain.freqs(0)[0]);
    }

    #[test]
    fn mismatched_recorded_bands_fail_validation() {
        let (_, mut config) = testkit::two_station_config(16, 1, None);
        let freqs = vec![FreqEntry::new(16, false, 16.0), FreqEntry::new(8, false, 8.0)];
        config.datastreams[0].recorded[1].freq_index = 1;
        let mut mode = FftMode::new(request(&config, &freqs, 0), DEFAULT_LEVELS_2BIT);
        assert!(!mode.initialised_ok());
        assert_eq!(mode.process(&input(&[0; 8]), 0), 0.0);
    }
}
