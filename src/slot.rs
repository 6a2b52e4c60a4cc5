use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use num_complex::Complex32;

use crate::config::Configuration;
use crate::error::CoreError;
use crate::gate::Gate;
use crate::mode::AntennaInput;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Interval start relative to the observation start epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimeOffset {
    pub seconds: i32,
    pub nanoseconds: i32,
}

impl TimeOffset {
    pub fn new(seconds: i32, nanoseconds: i32) -> Self {
        Self {
            seconds,
            nanoseconds,
        }
    }

    /// MJD of the interval start, whole seconds only.
    pub fn mjd_seconds(&self, start_mjd: i32, start_seconds: i32) -> f64 {
        start_mjd as f64 + (start_seconds as f64 + self.seconds as f64) / SECONDS_PER_DAY
    }

    pub fn mjd(&self, start_mjd: i32, start_seconds: i32) -> f64 {
        start_mjd as f64
            + (start_seconds as f64 + self.seconds as f64 + self.nanoseconds as f64 * 1e-9)
                / SECONDS_PER_DAY
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultStatus {
    Valid,
    Invalid,
}

/// Raw bytes and control vector received from one antenna.
#[derive(Clone, Debug)]
pub struct AntennaBuffer {
    pub data: Vec<u8>,
    /// Bytes actually received; less than `data.len()` after a short read.
    pub valid_bytes: usize,
    /// `[validity, delay coefficients...]`
    pub control: Vec<f64>,
}

impl AntennaBuffer {
    pub fn new(max_bytes: usize, control_length: usize) -> Self {
        Self {
            data: vec![0; max_bytes],
            valid_bytes: 0,
            control: vec![0.0; control_length.max(1)],
        }
    }

    pub fn input(&self, offset: TimeOffset) -> AntennaInput<'_> {
        AntennaInput {
            data: &self.data[..self.valid_bytes],
            validity: self.control[0],
            delays: &self.control[1..],
            offset,
        }
    }
}

/// Pulsar settings of the configuration currently loaded into a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PulsarSnapshot {
    pub binning: bool,
    pub scrunch: bool,
    pub num_bins: usize,
}

impl PulsarSnapshot {
    pub fn of(config: &Configuration) -> Self {
        Self {
            binning: config.pulsar_bin_on(),
            scrunch: config.scrunch_on(),
            num_bins: config.num_pulsar_bins(),
        }
    }
}

/// Everything the receiver writes into a slot and the compute threads read.
#[derive(Debug)]
pub struct SlotData {
    pub config_index: usize,
    pub offset: TimeOffset,
    /// Running interval number, for logging.
    pub sequence: u64,
    pub antennas: Vec<AntennaBuffer>,
    pub keep_processing: bool,
    pub pulsar: PulsarSnapshot,
}

#[derive(Debug)]
pub struct SlotResults {
    pub buffer: Vec<Complex32>,
    pub status: ResultStatus,
    pub config_index: usize,
}

impl SlotResults {
    pub fn reset(&mut self) {
        self.buffer.fill(Complex32::new(0.0, 0.0));
        self.status = ResultStatus::Valid;
    }
}

/// One ring position: raw data, shared results, one gate per compute thread.
///
/// The locks are never contended while the gate protocol is followed; the
/// `Mutex` on the results is the accumulation gate that serialises merges.
pub struct ProcessingSlot {
    index: usize,
    data: RwLock<SlotData>,
    results: Mutex<SlotResults>,
    gates: Vec<Gate>,
}

impl ProcessingSlot {
    pub fn new(
        index: usize,
        num_threads: usize,
        antenna_buffers: Vec<AntennaBuffer>,
        config_index: usize,
        config: &Configuration,
        result_length: usize,
    ) -> Result<Self, CoreError> {
        let gates = (0..num_threads)
            .map(|t| Gate::new(index, t))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            index,
            data: RwLock::new(SlotData {
                config_index,
                offset: TimeOffset::default(),
                sequence: 0,
                antennas: antenna_buffers,
                keep_processing: true,
                pulsar: PulsarSnapshot::of(config),
            }),
            results: Mutex::new(SlotResults {
                buffer: vec![Complex32::new(0.0, 0.0); result_length],
                status: ResultStatus::Valid,
                config_index,
            }),
            gates,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn gate(&self, thread: usize) -> &Gate {
        &self.gates[thread]
    }

    pub fn gates(&self) -> &[Gate] {
        &self.gates
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, SlotData>, CoreError> {
        self.data
            .read()
            .map_err(|_| CoreError::Gate(format!("slot {} data lock poisoned", self.index)))
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, SlotData>, CoreError> {
        self.data
            .write()
            .map_err(|_| CoreError::Gate(format!("slot {} data lock poisoned", self.index)))
    }

    /// Take the accumulation gate.
    pub fn results(&self) -> Result<MutexGuard<'_, SlotResults>, CoreError> {
        self.results
            .lock()
            .map_err(|_| CoreError::Gate(format!("slot {} results lock poisoned", self.index)))
    }
}
