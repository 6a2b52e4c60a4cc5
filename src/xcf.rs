use num_complex::Complex32;

use crate::config::CrossRecord;
use crate::utils::add_product;

/// Cross-multiply one polarisation product of one chunk into `acc`, which is
/// the record's `channels + 1` values for that product.
///
/// `vis1` is the first antenna's spectrum and `vis2` the second antenna's
/// conjugated spectrum. The Nyquist channel is real-only, so its imaginary
/// slot accumulates the product of the two antennas' chunk weights instead.
pub fn cross_multiply_accumulate(
    record: &CrossRecord,
    vis1: &[Complex32],
    vis2: &[Complex32],
    weight1: f32,
    weight2: f32,
    acc: &mut [Complex32],
) {
    let channels = record.spectral_channels();
    add_product(
        &mut acc[channels.clone()],
        &vis1[channels.clone()],
        &vis2[channels],
    );
    let nyq = record.nyquist;
    acc[nyq].re += vis1[nyq].re * vis2[nyq].re;
    acc[nyq].im += weight1 * weight2;
}
