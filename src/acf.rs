use num_complex::Complex32;

use crate::config::{AutoRecord, ResultLayout};
use crate::error::CoreError;
use crate::mode::Mode;
use crate::utils::add_in_place;

/// Add every datastream's autocorrelations (and cross-pol autocorrelations
/// when laid out) into the shared results. Must be called with the
/// accumulation gate held, after this thread's cross products were merged.
///
/// A zoom band only sees part of its parent's samples, so its Nyquist weight
/// is taken from the parent's merged weight in `results`. When the parent is
/// not part of the output this thread's own parent weight is used.
pub fn merge_autocorrelations(
    layout: &ResultLayout,
    modes: &[Box<dyn Mode>],
    results: &mut [Complex32],
) -> Result<(), CoreError> {
    for record in &layout.autos {
        let mode = modes.get(record.datastream).ok_or_else(|| {
            CoreError::InvalidConfig(format!("no mode for datastream {}", record.datastream))
        })?;
        let src = checked_autocorrelation(mode.as_ref(), record, record.band)?;
        let len = record.channels + 1;
        add_in_place(&mut results[record.offset..record.offset + len], src);

        if let Some(parent) = record.parent {
            let weight_slot = record.offset + record.nyquist;
            match parent.offset {
                Some(parent_offset) => {
                    results[weight_slot].im = results[parent_offset + parent.nyquist].im;
                }
                None => {
                    let parent_ac = mode.autocorrelation(record.cross_pol, parent.band);
                    let parent_weight = parent_ac.get(parent.nyquist).map(|v| v.im).unwrap_or(0.0);
                    results[weight_slot].im += parent_weight - src[record.nyquist].im;
                }
            }
        }
    }
    Ok(())
}

fn checked_autocorrelation<'m>(
    mode: &'m dyn Mode,
    record: &AutoRecord,
    band: usize,
) -> Result<&'m [Complex32], CoreError> {
    let ac = mode.autocorrelation(record.cross_pol, band);
    if ac.len() != record.channels + 1 {
        return Err(CoreError::InvalidConfig(format!(
            "datastream {} band {} autocorrelation has {} values, expected {}",
            record.datastream,
            band,
            ac.len(),
            record.channels + 1
        )));
    }
    Ok(ac)
}
