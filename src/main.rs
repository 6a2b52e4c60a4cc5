mod args;

use std::sync::Arc;

use clap::Parser;
use log::{debug, info, warn};
use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use xcorr_worker::config::{
    BaselineEntry, BaselineFreq, ConfigProvider, ConfigTable, Configuration, DatastreamTable,
    FreqEntry, Polarisation, PolProduct, PulsarSettings, RecordedBand, ResultLayout,
};
use xcorr_worker::core::{Core, CoreSettings};
use xcorr_worker::fftmode::FftMode;
use xcorr_worker::fringe::lag_peak;
use xcorr_worker::polyco::{LinearPolyco, Polyco};
use xcorr_worker::slot::{ResultStatus, TimeOffset};
use xcorr_worker::sta::{ChannelSink, StaControl};
use xcorr_worker::transport::{local_coordinator, local_datastreams, AntennaPayload};
use xcorr_worker::utils::{pack_2bit_codes, quantise_2bit, DynError};

use args::{parse_levels, Args};

/// Nanoseconds of data in one interval.
fn interval_ns(args: &Args) -> u64 {
    let samples = (args.blocks * 2 * args.channels) as f64;
    (samples / args.sampling_hz() * 1e9).round() as u64
}

fn build_configuration(args: &Args, pulsar: Option<PulsarSettings>) -> Configuration {
    let mut config = Configuration::new(args.blocks, interval_ns(args));
    let pols: &[Polarisation] = if args.dual_pol {
        &[Polarisation::R, Polarisation::L]
    } else {
        &[Polarisation::R]
    };
    let station = DatastreamTable {
        recorded: pols
            .iter()
            .map(|&pol| RecordedBand { freq_index: 0, pol })
            .collect(),
        zoom: Vec::new(),
    };
    config.datastreams = vec![station; args.antennas];
    let products: Vec<PolProduct> = (0..pols.len())
        .map(|band| PolProduct {
            band1: band,
            band2: band,
        })
        .collect();
    for ds1 in 0..args.antennas {
        for ds2 in ds1 + 1..args.antennas {
            config.baselines.push(BaselineEntry {
                datastream1: ds1,
                datastream2: ds2,
                freqs: vec![BaselineFreq {
                    freq_index: 0,
                    products: products.clone(),
                }],
            });
        }
    }
    config.pulsar = pulsar;
    config.write_cross_autocorrs = args.cross_autocorrs;
    config
}

/// Plain configuration 0, plus a binned configuration 1 from `--pulsar-from`.
fn build_table(args: &Args, freqs: Vec<FreqEntry>, levels: [f32; 4]) -> Result<ConfigTable, DynError> {
    let mut table = ConfigTable::new(freqs, args.antennas, FftMode::factory(levels));
    let plain = table.push(build_configuration(args, None))?;
    if args.pulsar_bins > 0 {
        let binned = table.push(build_configuration(
            args,
            Some(PulsarSettings {
                num_bins: args.pulsar_bins,
                scrunch: args.scrunch,
            }),
        ))?;
        let polyco = LinearPolyco::new(args.start_mjd as f64, 1440.0, args.spin, args.pulsar_bins);
        table.set_polycos(binned, vec![Box::new(polyco) as Box<dyn Polyco>]);
        if args.pulsar_from > 0 {
            table.add_scan(0, args.pulsar_from, plain);
        }
        table.add_scan(args.pulsar_from, i32::MAX, binned);
    }
    Ok(table)
}

/// Arrival delay of each antenna's copy of the common signal.
fn injected_delays(args: &Args) -> Vec<usize> {
    (0..args.antennas).map(|a| a * args.delay_step).collect()
}

/// One interval of 2-bit data per antenna: a common Gaussian signal, pulsed
/// during the first bin of each rotation when binning, plus independent noise.
fn synthesise_interval(args: &Args, levels: &[f32; 4], second: i32, rng: &mut StdRng) -> Vec<Vec<u8>> {
    let samples = args.blocks * 2 * args.channels;
    let delays = injected_delays(args);
    let max_delay = delays.iter().copied().max().unwrap_or(0);
    let pols = args.num_pols();
    let sampling_hz = args.sampling_hz();
    let signal_amp = args.correlation.sqrt() as f32;
    let noise_amp = (1.0 - args.correlation).sqrt() as f32;

    let common: Vec<Vec<f32>> = (0..pols)
        .map(|_| {
            (0..samples + max_delay)
                .map(|i| {
                    let value: f32 = StandardNormal.sample(rng);
                    if args.pulsar_bins == 0 {
                        return value;
                    }
                    // index i holds the signal emitted at sample i - max_delay
                    let t = second as f64 + (i as f64 - max_delay as f64) / sampling_hz;
                    let phase = (args.spin * t).rem_euclid(1.0);
                    if phase < 1.0 / args.pulsar_bins as f64 {
                        2.0 * value
                    } else {
                        value
                    }
                })
                .collect()
        })
        .collect();

    delays
        .iter()
        .map(|&delay| {
            let mut codes = Vec::with_capacity(samples * pols);
            for n in 0..samples {
                for signal in &common {
                    let noise: f32 = StandardNormal.sample(rng);
                    let value = signal_amp * signal[n + max_delay - delay] + noise_amp * noise;
                    codes.push(quantise_2bit(value, levels));
                }
            }
            pack_2bit_codes(&codes)
        })
        .collect()
}

fn control_vector(args: &Args, antenna: usize) -> Vec<f64> {
    let delay_s = if args.apply_delays {
        injected_delays(args)[antenna] as f64 / args.sampling_hz()
    } else {
        0.0
    };
    vec![1.0, delay_s, 0.0]
}

fn report(args: &Args, table: &ConfigTable, sums: &[(usize, Vec<Complex32>)]) -> Result<(), DynError> {
    let delays = injected_delays(args);
    for (config_index, (count, sum)) in sums.iter().enumerate() {
        if *count == 0 {
            continue;
        }
        let layout = ResultLayout::new(
            table.config(config_index),
            table.freq_table(),
            table.num_datastreams(),
        )?;
        info!(
            "config {config_index}: {count} intervals, {} values, {} bins{}",
            sum.len(),
            layout.num_bins,
            if layout.scrunch { " (scrunched)" } else { "" }
        );
        for record in &layout.cross {
            let expected = if args.apply_delays {
                0
            } else {
                delays[record.datastream1] as isize - delays[record.datastream2] as isize
            };
            for product in 0..record.products.len() {
                let mut spectrum = vec![Complex32::new(0.0, 0.0); record.stride()];
                let mut profile = Vec::with_capacity(record.bins_in_output);
                for bin in 0..record.bins_in_output {
                    let start = record.product_offset(product, bin);
                    let values = &sum[start..start + record.stride()];
                    profile.push(values.iter().map(|v| v.norm()).sum::<f32>() / values.len() as f32);
                    for (acc, value) in spectrum.iter_mut().zip(values) {
                        *acc += value;
                    }
                }
                let freq = &table.freq_table()[record.freq_index];
                let peak = lag_peak(&spectrum, freq.lower_sideband)?;
                info!(
                    "baseline {}-{} product {product}: lag {} samples (expected {expected}), amplitude {:.4}, snr {:.1}",
                    record.datastream1, record.datastream2, peak.lag_samples, peak.amplitude, peak.snr
                );
                if peak.lag_samples != expected {
                    warn!(
                        "baseline {}-{} product {product}: lag peak off by {} samples",
                        record.datastream1,
                        record.datastream2,
                        peak.lag_samples - expected
                    );
                }
                if profile.len() > 1 {
                    let formatted: Vec<String> = profile.iter().map(|p| format!("{p:.4}")).collect();
                    info!("  bin profile: [{}]", formatted.join(", "));
                }
            }
        }
        for record in layout.autos.iter().filter(|r| !r.cross_pol) {
            let weight = sum[record.offset + record.nyquist].im / *count as f32;
            debug!(
                "datastream {} band {}: mean weight {weight:.3}",
                record.datastream, record.band
            );
        }
    }
    Ok(())
}

fn main() -> Result<(), DynError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    args.validate()?;
    let levels = parse_levels(&args.level)?;

    let freqs = vec![FreqEntry::new(args.channels, false, args.bandwidth)];
    let table = Arc::new(build_table(&args, freqs, levels)?);
    let bytes_per_interval = args.blocks * 2 * args.channels * args.num_pols() / 4;

    let settings = CoreSettings {
        core_id: args.core_id,
        num_threads: args.threads,
        ring_depth: args.ring_depth,
        max_data_bytes: bytes_per_interval,
        control_length: 3,
        start_mjd: args.start_mjd,
        start_seconds: 0,
        pin_threads: args.pin,
    };
    info!(
        "{} antennas, {} channels x {} chunks per interval ({} ns), {} threads, ring depth {}",
        args.antennas,
        args.channels,
        args.blocks,
        interval_ns(&args),
        args.threads,
        args.ring_depth
    );

    let (coordinator, handle) = local_coordinator();
    let (links, senders) = local_datastreams(args.antennas);
    let mut rng = StdRng::seed_from_u64(args.seed);
    for second in 0..args.intervals as i32 {
        let interval = synthesise_interval(&args, &levels, second, &mut rng);
        for (antenna, (data, sender)) in interval.into_iter().zip(&senders).enumerate() {
            sender.send(AntennaPayload {
                data,
                control: control_vector(&args, antenna),
            })?;
        }
    }
    handle.schedule(TimeOffset::new(0, 0), 1_000_000_000, args.intervals)?;

    let mut core = Core::new(settings, table.clone(), Box::new(coordinator), Box::new(links))?;
    let sta_lines = if args.sta_channels > 0 {
        let (sink, lines) = ChannelSink::new(4 * args.intervals * args.antennas * args.num_pols());
        core = core.with_diagnostics(
            Arc::new(StaControl::new(true, args.sta_channels)),
            Arc::new(sink),
        );
        Some(lines)
    } else {
        None
    };

    let stats = core.execute();
    info!(
        "core {} finished: {} intervals received, {} transmitted",
        args.core_id, stats.received, stats.transmitted
    );

    let mut sums: Vec<(usize, Vec<Complex32>)> = (0..table.num_configs())
        .map(|c| (0, vec![Complex32::new(0.0, 0.0); table.result_length(c)]))
        .collect();
    for (second, message) in handle.results.try_iter().enumerate() {
        if message.status != ResultStatus::Valid {
            warn!("interval {second} came back invalid");
            continue;
        }
        let Some(config_index) = table.config_index_for(second as i32) else {
            warn!("interval {second} has no configuration");
            continue;
        };
        let values = message.to_complex();
        let (count, sum) = &mut sums[config_index];
        if values.len() != sum.len() {
            return Err(format!(
                "interval {second}: {} values for config {config_index} of length {}",
                values.len(),
                sum.len()
            )
            .into());
        }
        for (acc, value) in sum.iter_mut().zip(values) {
            *acc += value;
        }
        *count += 1;
    }
    report(&args, &table, &sums)?;

    if let Some(lines) = sta_lines {
        let records: Vec<String> = lines.try_iter().collect();
        info!("{} diagnostic records", records.len());
        if let Some(first) = records.first() {
            debug!("first diagnostic record: {first}");
        }
    }
    Ok(())
}
