use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use num_complex::Complex32;
use serde::Serialize;

use crate::config::FreqEntry;
use crate::error::CoreError;

/// Decimated autocorrelation power of one antenna band over one interval.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StaRecord {
    pub core_id: usize,
    pub thread_id: usize,
    pub num_threads: usize,
    pub antenna: usize,
    pub band: usize,
    pub seconds: i32,
    pub nanoseconds: i32,
    pub num_channels: usize,
    pub data: Vec<f32>,
}

/// Runtime switch for diagnostic sampling, polled once per slot.
#[derive(Debug)]
pub struct StaControl {
    enabled: AtomicBool,
    channels: AtomicUsize,
}

impl StaControl {
    pub fn new(enabled: bool, channels: usize) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            channels: AtomicUsize::new(channels),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_channels(&self, channels: usize) {
        self.channels.store(channels, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed) && self.channels() > 0
    }

    pub fn channels(&self) -> usize {
        self.channels.load(Ordering::Relaxed)
    }
}

/// Where diagnostic records go. Sends must never block.
pub trait DiagnosticSink: Send + Sync {
    fn send(&self, record: &StaRecord) -> Result<(), CoreError>;
}

/// JSON-lines sink over a bounded channel; a full channel drops the record.
pub struct ChannelSink {
    tx: Sender<String>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, Receiver<String>) {
        let (tx, rx) = bounded(capacity);
        (Self { tx }, rx)
    }
}

impl DiagnosticSink for ChannelSink {
    fn send(&self, record: &StaRecord) -> Result<(), CoreError> {
        let line = serde_json::to_string(record).map_err(|e| CoreError::Diagnostic(e.to_string()))?;
        match self.tx.try_send(line) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(CoreError::Diagnostic(format!(
                "channel full, dropped antenna {} band {}",
                record.antenna, record.band
            ))),
            Err(TrySendError::Disconnected(_)) => {
                Err(CoreError::Diagnostic("diagnostic receiver gone".into()))
            }
        }
    }
}

/// Sum the real autocorrelation power into at most `max_channels` channels.
/// The LSB Nyquist channel (channel 0) is skipped.
pub fn decimate_power(autocorr: &[Complex32], freq: &FreqEntry, max_channels: usize, out: &mut Vec<f32>) {
    out.clear();
    let num_channels = max_channels.min(freq.num_channels);
    if num_channels == 0 {
        return;
    }
    let inc = freq.num_channels / num_channels;
    let offset = usize::from(freq.lower_sideband);
    for k in 0..num_channels {
        let start = k * inc + offset;
        let sum: f32 = autocorr
            .iter()
            .skip(start)
            .take(inc)
            .map(|v| v.re)
            .sum();
        out.push(sum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Vec<Complex32> {
        (0..n).map(|i| Complex32::new(i as f32, 100.0)).collect()
    }

    #[test]
    fn decimation_sums_adjacent_channels() {
        let freq = FreqEntry::new(8, false, 8.0);
        let mut out = Vec::new();
        decimate_power(&ramp(9), &freq, 4, &mut out);
        assert_eq!(out, vec![1.0, 5.0, 9.0, 13.0]);
    }

    #[test]
    fn lsb_skips_nyquist_and_channels_cap_at_band() {
        let freq = FreqEntry::new(4, true, 4.0);
        let mut out = Vec::new();
        decimate_power(&ramp(5), &freq, 16, &mut out);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn control_is_toggled_at_runtime() {
        let control = StaControl::new(false, 8);
        assert!(!control.is_enabled());
        control.set_enabled(true);
        assert!(control.is_enabled());
        control.set_channels(0);
        assert!(!control.is_enabled());
    }

    #[test]
    fn channel_sink_drops_when_full() {
        let (sink, rx) = ChannelSink::new(1);
        let record = StaRecord {
            core_id: 1,
            thread_id: 0,
            num_threads: 2,
            antenna: 3,
            band: 0,
            seconds: 10,
            nanoseconds: 0,
            num_channels: 2,
            data: vec![1.0, 2.0],
        };
        sink.send(&record).unwrap();
        assert!(matches!(sink.send(&record), Err(CoreError::Diagnostic(_))));
        let line = rx.recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["antenna"], 3);
        assert_eq!(value["data"][1], 2.0);
    }
}
