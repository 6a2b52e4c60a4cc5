use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;
use log::{debug, error, info, warn};
use num_complex::Complex32;

use crate::config::{ConfigProvider, ResultLayout};
use crate::error::CoreError;
use crate::slot::{AntennaBuffer, ProcessingSlot, PulsarSnapshot, ResultStatus};
use crate::sta::{DiagnosticSink, StaControl};
use crate::transport::{AntennaPayload, Coordinator, DatastreamLink, IntervalCommand};
use crate::utils::{available_cpus, pin_current_thread};
use crate::worker::ComputeWorker;

/// Reaction to a condition that invalidates the whole distributed job.
pub trait JobAbort: Send + Sync {
    fn abort(&self, error: &CoreError) -> !;
}

/// Logs and aborts the process.
pub struct ProcessAbort;

impl JobAbort for ProcessAbort {
    fn abort(&self, error: &CoreError) -> ! {
        error!("fatal: {error}; aborting job");
        std::process::abort()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CoreSettings {
    pub core_id: usize,
    pub num_threads: usize,
    /// Number of slots in the ring. Must be at least 3.
    pub ring_depth: usize,
    /// Largest interval a single antenna may send, in bytes.
    pub max_data_bytes: usize,
    /// Length of the per-antenna control vector.
    pub control_length: usize,
    pub start_mjd: i32,
    pub start_seconds: i32,
    pub pin_threads: bool,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            core_id: 0,
            num_threads: 1,
            ring_depth: 4,
            max_data_bytes: 0,
            control_length: 1,
            start_mjd: 0,
            start_seconds: 0,
            pin_threads: false,
        }
    }
}

impl CoreSettings {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.num_threads == 0 {
            return Err(CoreError::InvalidSettings("need at least one compute thread".into()));
        }
        // the receiver holds one slot while a thread holds the next
        if self.ring_depth < 3 {
            return Err(CoreError::InvalidSettings(format!(
                "ring depth {} is below the minimum of 3",
                self.ring_depth
            )));
        }
        if self.control_length == 0 {
            return Err(CoreError::InvalidSettings(
                "control vector must hold at least the validity".into(),
            ));
        }
        Ok(())
    }
}

/// Diagnostic sampling switch and destination.
#[derive(Clone)]
pub struct Diagnostics {
    pub control: Arc<StaControl>,
    pub sink: Arc<dyn DiagnosticSink>,
}

/// State shared between the receiver and the compute threads.
pub(crate) struct CoreShared {
    pub(crate) core_id: usize,
    pub(crate) num_threads: usize,
    pub(crate) start_mjd: i32,
    pub(crate) start_seconds: i32,
    pub(crate) pin_threads: bool,
    pub(crate) num_cpus: usize,
    pub(crate) slots: Vec<ProcessingSlot>,
    pub(crate) provider: Arc<dyn ConfigProvider>,
    pub(crate) abort: Arc<dyn JobAbort>,
    pub(crate) diagnostics: Option<Diagnostics>,
}

impl CoreShared {
    /// Validate settings and every configuration, then build the ring.
    pub(crate) fn new(settings: CoreSettings, provider: Arc<dyn ConfigProvider>) -> Result<Self, CoreError> {
        settings.validate()?;
        if provider.num_configs() == 0 {
            return Err(CoreError::InvalidConfig("no configurations".into()));
        }
        for index in 0..provider.num_configs() {
            let config = provider.config(index);
            let layout = ResultLayout::new(config, provider.freq_table(), provider.num_datastreams())?;
            let declared = provider.result_length(index);
            if layout.total_length != declared {
                return Err(CoreError::ResultLength {
                    config: index,
                    declared,
                    computed: layout.total_length,
                });
            }
            if config.blocks_per_send < settings.num_threads {
                warn!(
                    "core {}: config {index} has {} chunks for {} threads, some threads will idle",
                    settings.core_id, config.blocks_per_send, settings.num_threads
                );
            }
        }

        let slots = (0..settings.ring_depth)
            .map(|index| {
                let antennas = (0..provider.num_datastreams())
                    .map(|_| AntennaBuffer::new(settings.max_data_bytes, settings.control_length))
                    .collect();
                ProcessingSlot::new(
                    index,
                    settings.num_threads,
                    antennas,
                    0,
                    provider.config(0),
                    provider.result_length(0),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            core_id: settings.core_id,
            num_threads: settings.num_threads,
            start_mjd: settings.start_mjd,
            start_seconds: settings.start_seconds,
            pin_threads: settings.pin_threads,
            num_cpus: available_cpus(),
            slots,
            provider,
            abort: Arc::new(ProcessAbort),
            diagnostics: None,
        })
    }
}

/// Counters reported when a core finishes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CoreStats {
    pub received: u64,
    pub transmitted: u64,
}

/// One correlator worker: the receiver loop plus its compute threads.
pub struct Core {
    shared: CoreShared,
    coordinator: Box<dyn Coordinator>,
    datastreams: Box<dyn DatastreamLink>,
}

impl Core {
    pub fn new(
        settings: CoreSettings,
        provider: Arc<dyn ConfigProvider>,
        coordinator: Box<dyn Coordinator>,
        datastreams: Box<dyn DatastreamLink>,
    ) -> Result<Self, CoreError> {
        if datastreams.num_antennas() != provider.num_datastreams() {
            return Err(CoreError::InvalidSettings(format!(
                "{} antenna links for {} datastreams",
                datastreams.num_antennas(),
                provider.num_datastreams()
            )));
        }
        Ok(Self {
            shared: CoreShared::new(settings, provider)?,
            coordinator,
            datastreams,
        })
    }

    pub fn with_abort(mut self, abort: Arc<dyn JobAbort>) -> Self {
        self.shared.abort = abort;
        self
    }

    pub fn with_diagnostics(mut self, control: Arc<StaControl>, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.shared.diagnostics = Some(Diagnostics { control, sink });
        self
    }

    /// Run until the coordinator terminates the job. Fatal errors go to the
    /// abort hook and never return.
    pub fn execute(self) -> CoreStats {
        let Core {
            shared,
            coordinator,
            datastreams,
        } = self;
        let mut receiver = Receiver {
            shared: Arc::new(shared),
            coordinator,
            datastreams,
            stats: CoreStats::default(),
        };
        match receiver.run() {
            Ok(stats) => stats,
            Err(err) => {
                error!(
                    "core {}: receiver failed after {} intervals: {err}",
                    receiver.shared.core_id, receiver.stats.received
                );
                receiver.shared.abort.abort(&err)
            }
        }
    }
}

struct Receiver {
    shared: Arc<CoreShared>,
    coordinator: Box<dyn Coordinator>,
    datastreams: Box<dyn DatastreamLink>,
    stats: CoreStats,
}

impl Receiver {
    fn depth(&self) -> u64 {
        self.shared.slots.len() as u64
    }

    fn slot_index(&self, sequence: u64) -> usize {
        (sequence % self.depth()) as usize
    }

    fn run(&mut self) -> Result<CoreStats, CoreError> {
        let shared = Arc::clone(&self.shared);
        let depth = self.depth();
        info!(
            "core {}: starting with {} compute threads, ring depth {depth}",
            shared.core_id, shared.num_threads
        );
        if shared.pin_threads && !pin_current_thread(&[0]) {
            warn!("core {}: failed to pin receiver to cpu 0", shared.core_id);
        }

        for gate in shared.slots[0].gates() {
            gate.acquire()?;
        }

        let mut terminated = false;
        while self.stats.received < depth - 1 {
            if self.receive_interval(self.slot_index(self.stats.received))? {
                terminated = true;
                break;
            }
            self.stats.received += 1;
        }
        if terminated {
            self.release_all(self.slot_index(self.stats.received))?;
        }

        let (ready_tx, ready_rx) = bounded(shared.num_threads);
        let mut handles = Vec::with_capacity(shared.num_threads);
        for thread_id in 0..shared.num_threads {
            let worker = ComputeWorker::new(Arc::clone(&shared), thread_id);
            let ready = ready_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("core{}-compute{thread_id}", shared.core_id))
                .spawn(move || worker.run(ready))
                .map_err(|e| CoreError::Gate(format!("failed to spawn compute thread {thread_id}: {e}")))?;
            handles.push(handle);
        }
        drop(ready_tx);
        for _ in 0..shared.num_threads {
            ready_rx
                .recv()
                .map_err(|_| CoreError::Gate("compute thread exited before start-up handshake".into()))?;
        }

        if !terminated {
            loop {
                if self.receive_interval(self.slot_index(self.stats.received))? {
                    break;
                }
                self.stats.received += 1;
                self.transmit(self.slot_index(self.stats.received))?;
            }
            self.release_all(self.slot_index(self.stats.received))?;
        }

        // flush everything still in flight, oldest first
        let first = (self.stats.received + 1).saturating_sub(depth);
        for sequence in first..self.stats.received {
            let index = self.slot_index(sequence);
            for gate in shared.slots[index].gates() {
                gate.pass_through()?;
            }
            self.transmit(index)?;
        }

        for (thread_id, handle) in handles.into_iter().enumerate() {
            handle
                .join()
                .map_err(|_| CoreError::Gate(format!("compute thread {thread_id} panicked")))?;
        }
        info!(
            "core {}: finished, {} intervals received, {} transmitted",
            shared.core_id, self.stats.received, self.stats.transmitted
        );
        Ok(self.stats)
    }

    fn release_all(&self, index: usize) -> Result<(), CoreError> {
        for gate in self.shared.slots[index].gates() {
            gate.release()?;
        }
        Ok(())
    }

    /// Fill slot `index` with the next interval and hand it to the compute
    /// threads. Returns true when the coordinator terminated the job; the
    /// gates are left untouched in that case.
    fn receive_interval(&mut self, index: usize) -> Result<bool, CoreError> {
        let shared = Arc::clone(&self.shared);
        let slot = &shared.slots[index];
        let offset = match self.coordinator.next_interval()? {
            IntervalCommand::Terminate => {
                slot.write()?.keep_processing = false;
                slot.results()?.status = ResultStatus::Invalid;
                info!(
                    "core {}: terminate received after {} intervals",
                    shared.core_id, self.stats.received
                );
                return Ok(true);
            }
            IntervalCommand::Process(offset) => offset,
        };
        let config_index = shared
            .provider
            .config_index_for(offset.seconds)
            .ok_or(CoreError::NoConfig {
                seconds: offset.seconds,
            })?;

        {
            let mut data = slot.write()?;
            data.offset = offset;
            data.sequence = self.stats.received;
            data.keep_processing = true;
            if data.config_index != config_index {
                let config = shared.provider.config(config_index);
                data.config_index = config_index;
                data.pulsar = PulsarSnapshot::of(config);
                let mut results = slot.results()?;
                results.buffer.clear();
                results.buffer.resize(
                    shared.provider.result_length(config_index),
                    Complex32::new(0.0, 0.0),
                );
                results.config_index = config_index;
                info!(
                    "core {}: slot {index} switched to config {config_index} at {}s, {} results",
                    shared.core_id,
                    offset.seconds,
                    results.buffer.len()
                );
            }
            for (antenna, buffer) in data.antennas.iter_mut().enumerate() {
                let payload = self.datastreams.receive(antenna, offset)?;
                store_payload(antenna, buffer, payload)?;
            }
        }

        let next = &shared.slots[(index + 1) % shared.slots.len()];
        for (next_gate, gate) in next.gates().iter().zip(slot.gates()) {
            next_gate.acquire()?;
            gate.release()?;
        }
        debug!(
            "core {}: interval {} ({}s+{}ns) in slot {index}",
            shared.core_id, self.stats.received, offset.seconds, offset.nanoseconds
        );
        Ok(false)
    }

    /// Send a finished slot's results and reset it for reuse.
    fn transmit(&mut self, index: usize) -> Result<(), CoreError> {
        let mut results = self.shared.slots[index].results()?;
        self.coordinator.send_results(&results.buffer, results.status)?;
        debug!(
            "core {}: sent slot {index} ({:?}, config {})",
            self.shared.core_id, results.status, results.config_index
        );
        results.reset();
        self.stats.transmitted += 1;
        Ok(())
    }
}

fn store_payload(antenna: usize, buffer: &mut AntennaBuffer, payload: AntennaPayload) -> Result<(), CoreError> {
    let len = payload.data.len();
    if len > buffer.data.len() {
        return Err(CoreError::Oversize {
            antenna,
            len,
            max: buffer.data.len(),
        });
    }
    if payload.control.len() > buffer.control.len() {
        return Err(CoreError::Transport(format!(
            "antenna {antenna} sent {} control values, expected at most {}",
            payload.control.len(),
            buffer.control.len()
        )));
    }
    buffer.data[..len].copy_from_slice(&payload.data);
    buffer.valid_bytes = len;
    buffer.control.fill(0.0);
    buffer.control[..payload.control.len()].copy_from_slice(&payload.control);
    Ok(())
}
