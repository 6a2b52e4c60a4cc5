//! Compute core of a distributed FX correlator worker.
//!
//! A [`core::Core`] owns a ring of processing slots. Its receiver fills slots
//! with raw antenna data for successive time intervals while a pool of compute
//! threads walks the ring behind it, each thread correlating its own share of
//! FFT chunks and merging the partial results into the slot. Finished slots go
//! back to the coordinator in interval order.

pub mod acf;
pub mod config;
pub mod core;
pub mod error;
pub mod fftmode;
pub mod fringe;
pub mod gate;
pub mod mode;
pub mod polyco;
pub mod pulsar;
pub mod slot;
pub mod sta;
pub mod transport;
pub mod utils;
pub mod worker;
pub mod xcf;

#[cfg(test)]
mod testkit;

pub use crate::config::{ConfigProvider, ConfigTable, Configuration, ResultLayout};
pub use crate::core::{Core, CoreSettings, CoreStats, JobAbort};
pub use crate::error::CoreError;
pub use crate::mode::{AntennaInput, Mode};
pub use crate::transport::{Coordinator, DatastreamLink};
