use num_complex::Complex32;

use crate::config::{CrossRecord, ResultLayout};
use crate::error::CoreError;
use crate::utils::{add_in_place, scale_in_place, zero};

/// Per-bin accumulation space for scrunched pulsar output, one contiguous
/// arena indexed by (record, product, bin).
#[derive(Debug, Default)]
pub struct PulsarAccumulator {
    data: Vec<Complex32>,
    num_bins: usize,
}

impl PulsarAccumulator {
    pub fn new(layout: &ResultLayout) -> Self {
        Self {
            data: vec![Complex32::new(0.0, 0.0); layout.accum_length],
            num_bins: layout.num_bins,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether this arena can serve `layout` without reallocating.
    pub fn fits(&self, layout: &ResultLayout) -> bool {
        self.data.len() == layout.accum_length && self.num_bins == layout.num_bins
    }

    fn range(&self, record: &CrossRecord, product: usize, bin: usize) -> Result<std::ops::Range<usize>, CoreError> {
        if bin >= self.num_bins {
            return Err(CoreError::BinOutOfRange {
                bin,
                num_bins: self.num_bins,
            });
        }
        let start = record.accum_offset + (product * self.num_bins + bin) * record.stride();
        let end = start + record.stride();
        if end > self.data.len() {
            return Err(CoreError::InvalidConfig(format!(
                "pulsar arena of {} values too small for baseline {} freq {} product {product} bin {bin}",
                self.data.len(),
                record.baseline,
                record.freq_index
            )));
        }
        Ok(start..end)
    }

    pub fn bin(&self, record: &CrossRecord, product: usize, bin: usize) -> Result<&[Complex32], CoreError> {
        let range = self.range(record, product, bin)?;
        Ok(&self.data[range])
    }

    pub fn bin_mut(
        &mut self,
        record: &CrossRecord,
        product: usize,
        bin: usize,
    ) -> Result<&mut [Complex32], CoreError> {
        let range = self.range(record, product, bin)?;
        Ok(&mut self.data[range])
    }

    pub fn clear(&mut self) {
        zero(&mut self.data);
    }
}

/// Per-channel fan-out of one product's chunk cross spectrum into the scrunch arena.
///
/// `scratch` is `vis1 * vis2` over all `channels + 1` values, `bins` the bin
/// per channel for the record's frequency. The Nyquist real part follows its
/// channel's bin; the weight always lands in bin 0.
pub fn fan_out_scrunch(
    accum: &mut PulsarAccumulator,
    record: &CrossRecord,
    product: usize,
    scratch: &[Complex32],
    bins: &[usize],
    weight: f32,
) -> Result<(), CoreError> {
    for l in record.spectral_channels() {
        accum.bin_mut(record, product, bins[l])?[l] += scratch[l];
    }
    let nyq = record.nyquist;
    accum.bin_mut(record, product, bins[nyq])?[nyq].re += scratch[nyq].re;
    accum.bin_mut(record, product, 0)?[nyq].im += weight;
    Ok(())
}

/// Per-channel fan-out straight into the per-bin regions of the thread's
/// result buffer. The whole Nyquist value goes to bin 0.
pub fn fan_out_in_place(
    results: &mut [Complex32],
    record: &CrossRecord,
    product: usize,
    scratch: &[Complex32],
    bins: &[usize],
    weight: f32,
) -> Result<(), CoreError> {
    for l in record.spectral_channels() {
        let bin = bins[l];
        if bin >= record.bins_in_output {
            return Err(CoreError::BinOutOfRange {
                bin,
                num_bins: record.bins_in_output,
            });
        }
        results[record.product_offset(product, bin) + l] += scratch[l];
    }
    let nyq = record.product_offset(product, 0) + record.nyquist;
    results[nyq].re += scratch[record.nyquist].re;
    results[nyq].im += weight;
    Ok(())
}

fn check_weights(layout: &ResultLayout, bin_weights: &[f64]) -> Result<(), CoreError> {
    if bin_weights.len() < layout.num_bins {
        return Err(CoreError::InvalidConfig(format!(
            "polyco supplies {} bin weights for {} bins",
            bin_weights.len(),
            layout.num_bins
        )));
    }
    Ok(())
}

/// Scale every bin by its weight and fold it into the single record per
/// product in `results`. The arena is left zeroed. The Nyquist imaginary slot
/// ends up holding the unscaled accumulated weight.
pub fn finalize_scrunch(
    accum: &mut PulsarAccumulator,
    layout: &ResultLayout,
    bin_weights: &[f64],
    results: &mut [Complex32],
) -> Result<(), CoreError> {
    check_weights(layout, bin_weights)?;
    for record in &layout.cross {
        for p in 0..record.products.len() {
            let baseline_weight = accum.bin(record, p, 0)?[record.nyquist].im;
            let out_start = record.product_offset(p, 0);
            let out = &mut results[out_start..out_start + record.stride()];
            for (bin, &weight) in bin_weights.iter().enumerate().take(layout.num_bins) {
                let space = accum.bin_mut(record, p, bin)?;
                scale_in_place(space, weight as f32);
                add_in_place(out, space);
                zero(space);
            }
            out[record.nyquist].im = baseline_weight;
        }
    }
    Ok(())
}

/// Scale each bin in place. Bin 0 carries the interval weight, so its Nyquist
/// imaginary slot is divided back by bin 0's own weight; other bins keep the
/// scaled value.
pub fn finalize_in_place(
    layout: &ResultLayout,
    bin_weights: &[f64],
    results: &mut [Complex32],
) -> Result<(), CoreError> {
    check_weights(layout, bin_weights)?;
    for record in &layout.cross {
        for (bin, &weight) in bin_weights.iter().enumerate().take(record.bins_in_output) {
            for p in 0..record.products.len() {
                let start = record.product_offset(p, bin);
                let region = &mut results[start..start + record.stride()];
                scale_in_place(region, weight as f32);
                if bin == 0 {
                    region[record.nyquist].im /= weight as f32;
                }
            }
        }
    }
    Ok(())
}
