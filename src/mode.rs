use num_complex::Complex32;

use crate::slot::TimeOffset;

/// One antenna's raw interval as handed to a [`Mode`].
#[derive(Clone, Copy, Debug)]
pub struct AntennaInput<'a> {
    /// Received bytes; may be shorter than a full interval after a short read.
    pub data: &'a [u8],
    /// Validity scalar from the control vector (0 flags the whole interval).
    pub validity: f64,
    /// Delay polynomial coefficients, seconds and seconds per second.
    pub delays: &'a [f64],
    pub offset: TimeOffset,
}

/// Per-antenna station-based processing for one configuration.
///
/// Built fresh by the configuration provider on every configuration change.
/// Spectra for band `b` hold `channels + 1` values with the Nyquist channel at
/// the position given by the band's sideband sense.
pub trait Mode: Send {
    fn initialised_ok(&self) -> bool;

    /// Whether cross-polarisation autocorrelations are produced.
    fn write_cross_autocorrs(&self) -> bool {
        false
    }

    fn zero_autocorrelations(&mut self);

    /// Produce spectra for FFT chunk `chunk`, accumulate autocorrelations and
    /// return the fraction of valid samples in the chunk.
    fn process(&mut self, input: &AntennaInput<'_>, chunk: usize) -> f32;

    fn freqs(&self, band: usize) -> &[Complex32];

    fn conjugated_freqs(&self, band: usize) -> &[Complex32];

    fn autocorrelation(&self, cross_pol: bool, band: usize) -> &[Complex32];
}
