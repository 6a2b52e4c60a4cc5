use std::error::Error;
use std::f32::consts::PI;
use std::sync::Arc;

use num_complex::Complex32;
use realfft::{RealFftPlanner, RealToComplex};

pub type DynError = Box<dyn Error + Send + Sync>;

pub const DEFAULT_LEVELS_2BIT: [f32; 4] = [-1.5, -0.5, 0.5, 1.5];

pub struct FftHelper {
    len: usize,
    forward_r2c: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
}

impl FftHelper {
    pub fn new(len: usize) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let forward_r2c = planner.plan_fft_forward(len);
        let scratch = forward_r2c.make_scratch_vec();
        Self {
            len,
            forward_r2c,
            scratch,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Real-to-complex forward transform; `output` receives `len / 2 + 1` bins.
    pub fn forward_r2c_process(
        &mut self,
        input: &mut [f32],
        output: &mut [Complex32],
    ) -> Result<(), DynError> {
        if input.len() != self.len {
            return Err("Input length for R2C does not match FFT configuration".into());
        }
        if output.len() != self.len / 2 + 1 {
            return Err(
                "Output length for R2C does not match expected half-spectrum length".into(),
            );
        }
        self.forward_r2c
            .process_with_scratch(input, output, &mut self.scratch)?;
        Ok(())
    }
}

#[inline(always)]
fn decode_2bit_byte_to_levels(byte: u8, levels: &[f32; 4], out4: &mut [f32]) {
    // sample0 <- bits[1:0], sample1 <- bits[3:2], sample2 <- bits[5:4], sample3 <- bits[7:6]
    out4[0] = levels[(byte & 0b11) as usize];
    out4[1] = levels[((byte >> 2) & 0b11) as usize];
    out4[2] = levels[((byte >> 4) & 0b11) as usize];
    out4[3] = levels[((byte >> 6) & 0b11) as usize];
}

/// Decode packed 2-bit samples (LSB first) into `output`.
///
/// Returns the number of samples actually decoded; samples past the end of
/// `raw` are left at zero so that a short read only lowers the weight.
pub fn decode_2bit_into(raw: &[u8], levels: &[f32; 4], output: &mut [f32]) -> usize {
    let available = (raw.len() * 4).min(output.len());
    let full_bytes = available / 4;
    for (out4, &byte) in output.chunks_exact_mut(4).zip(raw.iter()).take(full_bytes) {
        decode_2bit_byte_to_levels(byte, levels, out4);
    }
    let tail = available - full_bytes * 4;
    if tail > 0 {
        let mut out4 = [0.0f32; 4];
        decode_2bit_byte_to_levels(raw[full_bytes], levels, &mut out4);
        output[full_bytes * 4..available].copy_from_slice(&out4[..tail]);
    }
    for value in output[available..].iter_mut() {
        *value = 0.0;
    }
    available
}

/// Pack 2-bit codes LSB first, four per byte.
pub fn pack_2bit_codes(codes: &[u8]) -> Vec<u8> {
    codes
        .chunks(4)
        .map(|quad| {
            quad.iter()
                .enumerate()
                .fold(0u8, |byte, (idx, &code)| byte | ((code & 0b11) << (2 * idx)))
        })
        .collect()
}

/// Nearest 2-bit code for a sample, using the thresholds between `levels`.
pub fn quantise_2bit(value: f32, levels: &[f32; 4]) -> u8 {
    let mut code = 0u8;
    for idx in 1..4 {
        let threshold = 0.5 * (levels[idx - 1] + levels[idx]);
        if value >= threshold {
            code = idx as u8;
        }
    }
    code
}

/// `acc[i] += a[i] * b[i]`
pub fn add_product(acc: &mut [Complex32], a: &[Complex32], b: &[Complex32]) {
    debug_assert_eq!(acc.len(), a.len());
    debug_assert_eq!(acc.len(), b.len());
    for ((dest, &x), &y) in acc.iter_mut().zip(a.iter()).zip(b.iter()) {
        *dest += x * y;
    }
}

/// `out[i] = a[i] * b[i]`
pub fn multiply_into(a: &[Complex32], b: &[Complex32], out: &mut [Complex32]) {
    debug_assert_eq!(out.len(), a.len());
    debug_assert_eq!(out.len(), b.len());
    for ((dest, &x), &y) in out.iter_mut().zip(a.iter()).zip(b.iter()) {
        *dest = x * y;
    }
}

/// `dest[i] += src[i]`
pub fn add_in_place(dest: &mut [Complex32], src: &[Complex32]) {
    debug_assert_eq!(dest.len(), src.len());
    for (acc, &value) in dest.iter_mut().zip(src.iter()) {
        *acc += value;
    }
}

/// Scale both real and imaginary parts by `factor`.
pub fn scale_in_place(buf: &mut [Complex32], factor: f32) {
    for value in buf.iter_mut() {
        *value *= factor;
    }
}

pub fn zero(buf: &mut [Complex32]) {
    buf.fill(Complex32::new(0.0, 0.0));
}

/// 累積バッファの実部に複素スペクトルのパワー `|z|^2` を加算する。
pub fn accumulate_power_add(dest: &mut [Complex32], src: &[Complex32]) {
    debug_assert_eq!(dest.len(), src.len());
    for (acc, value) in dest.iter_mut().zip(src.iter()) {
        acc.re += value.norm_sqr();
    }
}

/// `dest[i] += a[i] * conj(b[i])`
pub fn accumulate_cross_power(dest: &mut [Complex32], a: &[Complex32], b: &[Complex32]) {
    debug_assert_eq!(dest.len(), a.len());
    debug_assert_eq!(dest.len(), b.len());
    for ((acc, &x), &y) in dest.iter_mut().zip(a.iter()).zip(b.iter()) {
        *acc += x * y.conj();
    }
}

/// Apply a linear phase slope across uniformly spaced bins starting at DC.
/// Uses a complex phase recurrence instead of per-bin sin/cos.
pub fn apply_delay_regular_bins(spectrum: &mut [Complex32], freq_step_hz: f64, delay_seconds: f64) {
    if spectrum.is_empty() || delay_seconds == 0.0 {
        return;
    }
    let phase_step = -2.0 * std::f64::consts::PI * freq_step_hz * delay_seconds;
    let step = Complex32::from_polar(1.0, (phase_step % (2.0 * std::f64::consts::PI)) as f32);
    let mut rot = Complex32::new(1.0, 0.0);
    for bin in spectrum.iter_mut() {
        *bin *= rot;
        rot *= step;
    }
}

/// Deterministic test tone helper: `amplitude * cos(2 pi f n / fs + phase)`.
pub fn tone(len: usize, cycles_per_sample: f32, phase: f32, amplitude: f32) -> Vec<f32> {
    (0..len)
        .map(|n| amplitude * (2.0 * PI * cycles_per_sample * n as f32 + phase).cos())
        .collect()
}

/// Pin the calling thread to the given CPUs. Returns false if the kernel refused.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpus: &[usize]) -> bool {
    if cpus.is_empty() {
        return false;
    }
    unsafe {
        let mut cpu_set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut cpu_set);
        for &cpu in cpus {
            libc::CPU_SET(cpu, &mut cpu_set);
        }
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpu_set) == 0
    }
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_cpus: &[usize]) -> bool {
    false
}

pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_2bit_keeps_00_01_10_11_order() {
        let codes = [0u8, 1, 2, 3, 0, 1, 2, 3];
        let raw = pack_2bit_codes(&codes);
        let mut output = vec![9.0; 8];
        let decoded = decode_2bit_into(&raw, &DEFAULT_LEVELS_2BIT, &mut output);
        assert_eq!(decoded, 8);
        let expected: Vec<f32> = codes
            .iter()
            .map(|&c| DEFAULT_LEVELS_2BIT[c as usize])
            .collect();
        assert_eq!(output, expected);
    }

    #[test]
    fn short_raw_buffer_zero_fills_the_tail() {
        let raw = pack_2bit_codes(&[3, 3, 3, 3, 0, 0]);
        let mut output = vec![9.0; 12];
        let decoded = decode_2bit_into(&raw[..1], &DEFAULT_LEVELS_2BIT, &mut output);
        assert_eq!(decoded, 4);
        assert!(output[..4].iter().all(|&v| v == 1.5));
        assert!(output[4..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn quantise_round_trips_levels() {
        for (code, &level) in DEFAULT_LEVELS_2BIT.iter().enumerate() {
            assert_eq!(quantise_2bit(level, &DEFAULT_LEVELS_2BIT), code as u8);
        }
        assert_eq!(quantise_2bit(-7.0, &DEFAULT_LEVELS_2BIT), 0);
        assert_eq!(quantise_2bit(0.1, &DEFAULT_LEVELS_2BIT), 2);
    }

    #[test]
    fn r2c_of_dc_lands_in_bin_zero() {
        let mut helper = FftHelper::new(16);
        let mut input = vec![1.0f32; 16];
        let mut output = vec![Complex32::new(0.0, 0.0); 9];
        helper.forward_r2c_process(&mut input, &mut output).unwrap();
        assert!((output[0].re - 16.0).abs() < 1e-4);
        assert!(output[1..].iter().all(|v| v.norm() < 1e-4));
    }

    #[test]
    fn cross_power_of_self_is_real_power() {
        let a = vec![Complex32::new(1.0, 2.0), Complex32::new(-3.0, 0.5)];
        let mut acc = vec![Complex32::new(0.0, 0.0); 2];
        accumulate_cross_power(&mut acc, &a, &a);
        let mut power = vec![Complex32::new(0.0, 0.0); 2];
        accumulate_power_add(&mut power, &a);
        assert_eq!(acc, power);
    }
}
