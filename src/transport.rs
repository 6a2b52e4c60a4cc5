use crossbeam_channel::{unbounded, Receiver, Sender};
use num_complex::Complex32;

use crate::error::CoreError;
use crate::slot::{ResultStatus, TimeOffset};

/// What the coordinator wants done next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntervalCommand {
    Process(TimeOffset),
    Terminate,
}

/// Link to the job coordinator: interval assignments in, results out.
pub trait Coordinator: Send {
    fn next_interval(&mut self) -> Result<IntervalCommand, CoreError>;

    /// Send one slot's results, `2 * results.len()` real values.
    fn send_results(&mut self, results: &[Complex32], status: ResultStatus) -> Result<(), CoreError>;
}

/// One antenna's contribution to an interval.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AntennaPayload {
    pub data: Vec<u8>,
    pub control: Vec<f64>,
}

/// Links to the antenna-side data producers.
pub trait DatastreamLink: Send {
    fn num_antennas(&self) -> usize;

    fn receive(&mut self, antenna: usize, offset: TimeOffset) -> Result<AntennaPayload, CoreError>;
}

/// A result message as it goes out on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultMessage {
    pub status: ResultStatus,
    /// Interleaved re/im pairs.
    pub values: Vec<f32>,
}

impl ResultMessage {
    pub fn from_complex(results: &[Complex32], status: ResultStatus) -> Self {
        let mut values = Vec::with_capacity(results.len() * 2);
        for v in results {
            values.push(v.re);
            values.push(v.im);
        }
        Self { status, values }
    }

    pub fn to_complex(&self) -> Vec<Complex32> {
        self.values
            .chunks_exact(2)
            .map(|pair| Complex32::new(pair[0], pair[1]))
            .collect()
    }
}

/// In-process coordinator over crossbeam channels.
pub struct LocalCoordinator {
    commands: Receiver<IntervalCommand>,
    results: Sender<ResultMessage>,
}

/// Handle the driving side keeps: push commands, collect results.
pub struct CoordinatorHandle {
    pub commands: Sender<IntervalCommand>,
    pub results: Receiver<ResultMessage>,
}

impl CoordinatorHandle {
    /// Queue `count` intervals of `interval_ns` each, starting at `first`, then a terminate.
    pub fn schedule(&self, first: TimeOffset, interval_ns: u64, count: usize) -> Result<(), CoreError> {
        for i in 0..count {
            let total_ns = first.nanoseconds as u64 + i as u64 * interval_ns;
            let offset = TimeOffset::new(
                first.seconds + (total_ns / 1_000_000_000) as i32,
                (total_ns % 1_000_000_000) as i32,
            );
            self.commands
                .send(IntervalCommand::Process(offset))
                .map_err(|e| CoreError::Transport(e.to_string()))?;
        }
        self.commands
            .send(IntervalCommand::Terminate)
            .map_err(|e| CoreError::Transport(e.to_string()))
    }
}

pub fn local_coordinator() -> (LocalCoordinator, CoordinatorHandle) {
    let (cmd_tx, cmd_rx) = unbounded();
    let (res_tx, res_rx) = unbounded();
    (
        LocalCoordinator {
            commands: cmd_rx,
            results: res_tx,
        },
        CoordinatorHandle {
            commands: cmd_tx,
            results: res_rx,
        },
    )
}

impl Coordinator for LocalCoordinator {
    fn next_interval(&mut self) -> Result<IntervalCommand, CoreError> {
        self.commands
            .recv()
            .map_err(|_| CoreError::Transport("coordinator hung up".into()))
    }

    fn send_results(&mut self, results: &[Complex32], status: ResultStatus) -> Result<(), CoreError> {
        self.results
            .send(ResultMessage::from_complex(results, status))
            .map_err(|_| CoreError::Transport("result receiver dropped".into()))
    }
}

/// In-process antenna links, one channel per antenna.
pub struct LocalDatastreams {
    inputs: Vec<Receiver<AntennaPayload>>,
}

pub fn local_datastreams(num_antennas: usize) -> (LocalDatastreams, Vec<Sender<AntennaPayload>>) {
    let (senders, inputs): (Vec<_>, Vec<_>) = (0..num_antennas).map(|_| unbounded()).unzip();
    (LocalDatastreams { inputs }, senders)
}

impl DatastreamLink for LocalDatastreams {
    fn num_antennas(&self) -> usize {
        self.inputs.len()
    }

    fn receive(&mut self, antenna: usize, offset: TimeOffset) -> Result<AntennaPayload, CoreError> {
        let input = self.inputs.get(antenna).ok_or_else(|| {
            CoreError::Transport(format!("no link for antenna {antenna}"))
        })?;
        input.recv().map_err(|_| {
            CoreError::Transport(format!(
                "antenna {antenna} hung up before interval {}s+{}ns",
                offset.seconds, offset.nanoseconds
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_go_out_as_interleaved_floats() {
        let (mut coordinator, handle) = local_coordinator();
        let results = vec![Complex32::new(1.0, -1.0), Complex32::new(2.5, 0.0)];
        coordinator
            .send_results(&results, ResultStatus::Invalid)
            .unwrap();
        let msg = handle.results.recv().unwrap();
        assert_eq!(msg.values, vec![1.0, -1.0, 2.5, 0.0]);
        assert_eq!(msg.status, ResultStatus::Invalid);
        assert_eq!(msg.to_complex(), results);
    }

    #[test]
    fn schedule_carries_nanoseconds_into_seconds() {
        let (mut coordinator, handle) = local_coordinator();
        handle
            .schedule(TimeOffset::new(10, 0), 400_000_000, 3)
            .unwrap();
        let expected = [
            TimeOffset::new(10, 0),
            TimeOffset::new(10, 400_000_000),
            TimeOffset::new(10, 800_000_000),
        ];
        for offset in expected {
            assert_eq!(
                coordinator.next_interval().unwrap(),
                IntervalCommand::Process(offset)
            );
        }
        assert_eq!(
            coordinator.next_interval().unwrap(),
            IntervalCommand::Terminate
        );
        drop(handle);
        assert!(matches!(
            coordinator.next_interval(),
            Err(CoreError::Transport(_))
        ));
    }

    #[test]
    fn datastreams_receive_per_antenna() {
        let (mut links, senders) = local_datastreams(2);
        senders[1]
            .send(AntennaPayload {
                data: vec![1, 2, 3],
                control: vec![1.0],
            })
            .unwrap();
        let payload = links.receive(1, TimeOffset::default()).unwrap();
        assert_eq!(payload.data, vec![1, 2, 3]);
        assert!(links.receive(5, TimeOffset::default()).is_err());
    }
}
