use crate::config::{FreqEntry, PolycoTable};
use crate::error::CoreError;

/// Pulsar rotational phase model valid over a window of time.
pub trait Polyco: Send + Sync {
    /// Whether the validity window contains `mjd`.
    fn covers(&self, mjd: f64) -> bool;

    fn num_bins(&self) -> usize;

    /// Fill `bins[freq][channel]` with the phase bin for every channel of every
    /// frequency-table entry, `offset_mins` after `interval_mjd`.
    fn bins(&self, interval_mjd: f64, offset_mins: f64, freqs: &[FreqEntry], bins: &mut [Vec<usize>]);

    /// Scale applied to each bin when the interval is finalised.
    fn bin_weights(&self) -> &[f64];

    fn clone_box(&self) -> Box<dyn Polyco>;
}

impl Clone for Box<dyn Polyco> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// The polyco set one compute thread works with. Thread 0 reads the
/// externally-owned table directly; every other thread holds private clones.
pub enum PolycoSet {
    Shared(PolycoTable),
    Private(Vec<Box<dyn Polyco>>),
}

impl PolycoSet {
    pub fn for_thread(table: &PolycoTable, thread_id: usize) -> Self {
        if thread_id == 0 {
            PolycoSet::Shared(PolycoTable::clone(table))
        } else {
            PolycoSet::Private(table.iter().map(|p| p.clone_box()).collect())
        }
    }

    pub fn as_slice(&self) -> &[Box<dyn Polyco>] {
        match self {
            PolycoSet::Shared(table) => table.as_slice(),
            PolycoSet::Private(copies) => copies.as_slice(),
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(self, PolycoSet::Private(_))
    }

    /// The first polyco whose window covers `mjd`.
    pub fn current(&self, mjd: f64) -> Result<&dyn Polyco, CoreError> {
        select_polyco(self.as_slice(), mjd)
    }
}

pub fn select_polyco(polycos: &[Box<dyn Polyco>], mjd: f64) -> Result<&dyn Polyco, CoreError> {
    polycos
        .iter()
        .find(|p| p.covers(mjd))
        .map(|p| &**p)
        .ok_or(CoreError::NoPolyco { mjd })
}

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Constant spin-frequency phase model with an optional per-channel
/// dispersive delay.
#[derive(Clone, Debug)]
pub struct LinearPolyco {
    ref_mjd: f64,
    span_minutes: f64,
    spin_hz: f64,
    num_bins: usize,
    weights: Vec<f64>,
    /// Seconds of delay per frequency-table entry and channel.
    channel_delays: Vec<Vec<f64>>,
}

impl LinearPolyco {
    pub fn new(ref_mjd: f64, span_minutes: f64, spin_hz: f64, num_bins: usize) -> Self {
        Self {
            ref_mjd,
            span_minutes,
            spin_hz,
            num_bins: num_bins.max(1),
            weights: vec![1.0; num_bins.max(1)],
            channel_delays: Vec::new(),
        }
    }

    pub fn with_bin_weights(mut self, weights: Vec<f64>) -> Self {
        debug_assert_eq!(weights.len(), self.num_bins);
        self.weights = weights;
        self
    }

    pub fn with_channel_delays(mut self, delays: Vec<Vec<f64>>) -> Self {
        self.channel_delays = delays;
        self
    }

    /// Cold-plasma dispersion delays relative to infinite frequency for a
    /// channel grid starting at `low_mhz`.
    pub fn dispersion_delays(dm: f64, low_mhz: f64, bandwidth_mhz: f64, channels: usize) -> Vec<f64> {
        const KDM_S: f64 = 4.148_808e3;
        (0..=channels)
            .map(|c| {
                let f = low_mhz + bandwidth_mhz * c as f64 / channels.max(1) as f64;
                KDM_S * dm / (f * f)
            })
            .collect()
    }

    fn phase_bin(&self, seconds_since_ref: f64) -> usize {
        let phase = self.spin_hz * seconds_since_ref;
        let frac = phase - phase.floor();
        ((frac * self.num_bins as f64) as usize).min(self.num_bins - 1)
    }
}

impl Polyco for LinearPolyco {
    fn covers(&self, mjd: f64) -> bool {
        let end = self.ref_mjd + self.span_minutes / 1440.0;
        mjd >= self.ref_mjd && mjd < end
    }

    fn num_bins(&self) -> usize {
        self.num_bins
    }

    fn bins(&self, interval_mjd: f64, offset_mins: f64, freqs: &[FreqEntry], bins: &mut [Vec<usize>]) {
        let t0 = (interval_mjd - self.ref_mjd) * SECONDS_PER_DAY + offset_mins * 60.0;
        for (f, (entry, out)) in freqs.iter().zip(bins.iter_mut()).enumerate() {
            let delays = self.channel_delays.get(f);
            for (c, bin) in out.iter_mut().enumerate().take(entry.num_channels + 1) {
                let delay = delays.and_then(|d| d.get(c)).copied().unwrap_or(0.0);
                *bin = self.phase_bin(t0 - delay);
            }
        }
    }

    fn bin_weights(&self) -> &[f64] {
        &self.weights
    }

    fn clone_box(&self) -> Box<dyn Polyco> {
        Box::new(self.clone())
    }
}
