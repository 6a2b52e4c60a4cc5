use clap::Parser;

use xcorr_worker::utils::DynError;

pub const DEFAULT_LEVELS_2BIT_CSV: &str = "-1.5,-0.5,0.5,1.5";

#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about = "Run one correlator core over synthetic delayed 2-bit antenna streams",
    long_about = None,
    after_help = "Examples:\n  xcorr-worker --antennas 3 --threads 3 --intervals 10\n  xcorr-worker --antennas 4 --delay-step 3 --apply-delays\n  xcorr-worker --pulsar-bins 8 --pulsar-from 5 --spin 10000\n  xcorr-worker --pulsar-bins 8 --pulsar-from 0 --scrunch --sta-channels 16\n"
)]
pub struct Args {
    /// Number of antennas (datastreams)
    #[arg(long, default_value_t = 3)]
    pub antennas: usize,

    /// Record R and L on every antenna and correlate RR and LL
    #[arg(long)]
    pub dual_pol: bool,

    /// Also produce cross-polarisation autocorrelations (needs --dual-pol)
    #[arg(long)]
    pub cross_autocorrs: bool,

    /// Number of compute threads
    #[arg(long, default_value_t = 2)]
    pub threads: usize,

    /// Number of slots in the processing ring (at least 3)
    #[arg(long, default_value_t = 4)]
    pub ring_depth: usize,

    /// Intervals to correlate, one per second of simulated time
    #[arg(long, visible_alias = "sec", default_value_t = 10)]
    pub intervals: usize,

    /// Spectral channels per band
    #[arg(long, default_value_t = 64)]
    pub channels: usize,

    /// FFT chunks per interval
    #[arg(long, default_value_t = 32)]
    pub blocks: usize,

    /// Band width in MHz (sampling rate is twice this)
    #[arg(long, default_value_t = 16.0)]
    pub bandwidth: f64,

    /// Correlated fraction of the signal power (0..1)
    #[arg(long, default_value_t = 0.5)]
    pub correlation: f64,

    /// Arrival delay step between consecutive antennas (samples)
    #[arg(long, default_value_t = 2)]
    pub delay_step: usize,

    /// Put the injected delays into the control vectors so they are removed
    #[arg(long)]
    pub apply_delays: bool,

    /// Pulsar bins; 0 disables the binned configuration
    #[arg(long, default_value_t = 0)]
    pub pulsar_bins: usize,

    /// Second from which the binned configuration is used
    #[arg(long, default_value_t = 0)]
    pub pulsar_from: i32,

    /// Collapse pulsar bins into one output spectrum
    #[arg(long)]
    pub scrunch: bool,

    /// Pulsar spin frequency (Hz)
    #[arg(long, default_value_t = 10_000.0)]
    pub spin: f64,

    /// Channels per diagnostic (STA) record; 0 disables diagnostics
    #[arg(long, default_value_t = 0)]
    pub sta_channels: usize,

    /// Pin compute threads to CPUs
    #[arg(long)]
    pub pin: bool,

    /// Comma-separated list of the four 2-bit quantisation levels
    #[arg(long, allow_hyphen_values = true, default_value = DEFAULT_LEVELS_2BIT_CSV)]
    pub level: String,

    /// MJD of the start of the job
    #[arg(long, default_value_t = 60_000)]
    pub start_mjd: i32,

    /// Seed for the synthetic signal generator
    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// Identifier of this core in logs and diagnostics
    #[arg(long, default_value_t = 0)]
    pub core_id: usize,
}

impl Args {
    pub fn num_pols(&self) -> usize {
        if self.dual_pol {
            2
        } else {
            1
        }
    }

    pub fn sampling_hz(&self) -> f64 {
        2.0 * self.bandwidth * 1e6
    }

    pub fn validate(&self) -> Result<(), DynError> {
        if self.antennas < 2 {
            return Err("--antennas must be at least 2".into());
        }
        if self.channels == 0 || self.blocks == 0 || self.intervals == 0 {
            return Err("--channels, --blocks and --intervals must be positive".into());
        }
        if (self.channels * self.num_pols()) % 2 != 0 {
            return Err("--channels must be even for single-polarisation data".into());
        }
        if self.bandwidth <= 0.0 {
            return Err("--bandwidth must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.correlation) {
            return Err("--correlation must lie in 0..1".into());
        }
        if self.cross_autocorrs && !self.dual_pol {
            return Err("--cross-autocorrs needs --dual-pol".into());
        }
        if self.pulsar_bins > 0 && self.spin <= 0.0 {
            return Err("--spin must be positive when binning".into());
        }
        Ok(())
    }
}

pub fn parse_levels(list: &str) -> Result<[f32; 4], DynError> {
    let levels = list
        .split(',')
        .map(|v| v.trim().parse::<f32>())
        .collect::<Result<Vec<_>, _>>()?;
    let levels: [f32; 4] = levels.try_into().map_err(|found: Vec<f32>| {
        format!("Expected 4 quantisation levels for 2 bits, received {}", found.len())
    })?;
    if levels.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err("Quantisation levels must be strictly increasing".into());
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_in_code_order() {
        assert_eq!(
            parse_levels(" -3, -1,1 ,3").unwrap(),
            [-3.0, -1.0, 1.0, 3.0]
        );
        assert!(parse_levels("-1,1").is_err());
        assert!(parse_levels("1,0,2,3").is_err());
    }

    #[test]
    fn defaults_validate() {
        let args = Args::parse_from(["xcorr-worker"]);
        assert!(args.validate().is_ok());
        assert_eq!(args.sampling_hz(), 32e6);
        let args = Args::parse_from(["xcorr-worker", "--cross-autocorrs"]);
        assert!(args.validate().is_err());
    }
}
