use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};

use crate::error::CoreError;

/// Token-passing gate between the receiver and one compute thread for one slot.
///
/// A single token lives in a bounded channel of capacity 1. Taking the token
/// is `acquire`, putting it back is `release`; the gate is *held* exactly when
/// the token is out of the channel. Unlike a mutex the holder may change
/// between threads, which is what the ring hand-off needs.
#[derive(Clone, Debug)]
pub struct Gate {
    slot: usize,
    thread: usize,
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Gate {
    /// A new, free gate.
    pub fn new(slot: usize, thread: usize) -> Result<Self, CoreError> {
        let (tx, rx) = bounded(1);
        let gate = Self { slot, thread, tx, rx };
        gate.release()?;
        Ok(gate)
    }

    /// Block until the token is available and take it.
    pub fn acquire(&self) -> Result<(), CoreError> {
        self.rx.recv().map_err(|_| {
            CoreError::Gate(format!(
                "gate for slot {} thread {} disconnected",
                self.slot, self.thread
            ))
        })
    }

    /// Take the token if it is free.
    pub fn try_acquire(&self) -> Result<bool, CoreError> {
        match self.rx.try_recv() {
            Ok(()) => Ok(true),
            Err(TryRecvError::Empty) => Ok(false),
            Err(TryRecvError::Disconnected) => Err(CoreError::Gate(format!(
                "gate for slot {} thread {} disconnected",
                self.slot, self.thread
            ))),
        }
    }

    /// Return the token. Releasing a gate that is not held is a protocol error.
    pub fn release(&self) -> Result<(), CoreError> {
        match self.tx.try_send(()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(())) => Err(CoreError::Gate(format!(
                "released gate for slot {} thread {} that was not held",
                self.slot, self.thread
            ))),
            Err(TrySendError::Disconnected(())) => Err(CoreError::Gate(format!(
                "gate for slot {} thread {} disconnected",
                self.slot, self.thread
            ))),
        }
    }

    /// Wait until the current holder lets go, without keeping the gate.
    pub fn pass_through(&self) -> Result<(), CoreError> {
        self.acquire()?;
        self.release()
    }

    pub fn is_held(&self) -> bool {
        self.rx.is_empty()
    }
}
