use num_complex::Complex32;
use rustfft::FftPlanner;

use crate::utils::DynError;

/// Strongest delay found in one accumulated cross spectrum.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LagPeak {
    /// Signed lag in samples. Positive when the first antenna's signal
    /// arrives later than the second's.
    pub lag_samples: isize,
    pub amplitude: f32,
    /// Peak amplitude over the RMS of all other lags.
    pub snr: f32,
}

/// Lag search on one cross spectrum of `channels + 1` values as laid out in
/// the result buffer (Nyquist last for USB, first for LSB).
///
/// The spectrum is mirrored to a full Hermitian spectrum and inverse
/// transformed; the Nyquist imaginary part carries the weight and is ignored.
pub fn lag_peak(spectrum: &[Complex32], lower_sideband: bool) -> Result<LagPeak, DynError> {
    if spectrum.len() < 2 {
        return Err("Cross spectrum needs at least one channel plus Nyquist".into());
    }
    let channels = spectrum.len() - 1;
    let fft_len = 2 * channels;

    let mut full = vec![Complex32::new(0.0, 0.0); fft_len];
    for k in 0..=channels {
        let value = if lower_sideband {
            spectrum[channels - k]
        } else {
            spectrum[k]
        };
        if k == channels {
            full[k] = Complex32::new(value.re, 0.0);
        } else {
            full[k] = value;
            if k > 0 {
                full[fft_len - k] = value.conj();
            }
        }
    }

    let mut planner = FftPlanner::<f32>::new();
    let ifft = planner.plan_fft_inverse(fft_len);
    ifft.process(&mut full);
    let scale = 1.0 / fft_len as f32;

    let mut peak_idx = 0;
    let mut peak = 0.0f32;
    let mut power_sum = 0.0f64;
    for (idx, value) in full.iter().enumerate() {
        let magnitude = value.norm() * scale;
        power_sum += (magnitude as f64).powi(2);
        if magnitude > peak {
            peak = magnitude;
            peak_idx = idx;
        }
    }
    let rest = (power_sum - (peak as f64).powi(2)).max(0.0);
    let rms = if fft_len > 1 {
        (rest / (fft_len - 1) as f64).sqrt() as f32
    } else {
        0.0
    };

    // bins past the middle are negative lags
    let lag_samples = if peak_idx >= fft_len / 2 {
        peak_idx as isize - fft_len as isize
    } else {
        peak_idx as isize
    };
    Ok(LagPeak {
        lag_samples,
        amplitude: peak,
        snr: if rms > 0.0 { peak / rms } else { f32::INFINITY },
    })
}
