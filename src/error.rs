use thiserror::Error;

/// Errors raised by the correlation core.
///
/// Most of these are fatal for the whole distributed job: partial results from
/// one worker would corrupt the aggregate, so callers hand them to a
/// [`JobAbort`](crate::core::JobAbort) hook rather than trying to carry on.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("mode for datastream {datastream} in config {config} failed self-validation")]
    ModeInvalid { config: usize, datastream: usize },

    #[error("no polyco covers MJD {mjd:.8}")]
    NoPolyco { mjd: f64 },

    #[error("no configuration covers interval starting at {seconds} s")]
    NoConfig { seconds: i32 },

    #[error("config {config} declares result length {declared} but its layout needs {computed}")]
    ResultLength {
        config: usize,
        declared: usize,
        computed: usize,
    },

    #[error("pulsar bin {bin} out of range for {num_bins} bins")]
    BinOutOfRange { bin: usize, num_bins: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("gate protocol violation: {0}")]
    Gate(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("antenna {antenna} sent {len} bytes, more than the negotiated maximum {max}")]
    Oversize { antenna: usize, len: usize, max: usize },

    #[error("diagnostic send failed: {0}")]
    Diagnostic(String),
}
