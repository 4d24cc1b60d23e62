//! IMU ingestion channel.
//!
//! Producers push samples through a cloneable [`ImuSender`] from any thread.
//! The orchestrator drains the channel into a local buffer at each step and
//! consumes only the samples up to the scan time; later samples stay buffered
//! for the next step.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{LioError, Result};
use crate::imu::ImuSample;

/// Counters shared between producers and the consumer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestStats {
    /// Samples accepted by the channel.
    pub received: u64,
    /// Samples handed to the pre-integrator.
    pub consumed: u64,
}

/// Producer handle for IMU samples.
#[derive(Debug, Clone)]
pub struct ImuSender {
    tx: Sender<ImuSample>,
    stats: Arc<Mutex<IngestStats>>,
}

impl ImuSender {
    /// Queue a sample.
    ///
    /// # Errors
    /// [`LioError::Input`] if the consuming orchestrator has been dropped.
    pub fn send(&self, sample: ImuSample) -> Result<()> {
        self.tx
            .send(sample)
            .map_err(|_| LioError::Input("IMU consumer has shut down".to_string()))?;
        self.stats.lock().received += 1;
        Ok(())
    }

    /// Snapshot of the channel counters.
    pub fn stats(&self) -> IngestStats {
        self.stats.lock().clone()
    }
}

/// Consumer side, owned by the orchestrator.
#[derive(Debug)]
pub(crate) struct ImuQueue {
    rx: Receiver<ImuSample>,
    pending: VecDeque<ImuSample>,
    stats: Arc<Mutex<IngestStats>>,
}

impl ImuQueue {
    /// Samples with `timestamp <= t`, in arrival order.
    pub fn drain_until(&mut self, t: f64) -> Vec<ImuSample> {
        self.pending.extend(self.rx.try_iter());

        let mut ready = Vec::new();
        while let Some(sample) = self.pending.front() {
            if sample.timestamp > t {
                break;
            }
            if let Some(sample) = self.pending.pop_front() {
                ready.push(sample);
            }
        }
        self.stats.lock().consumed += ready.len() as u64;
        ready
    }

    /// Samples received but not yet consumed.
    pub fn pending(&mut self) -> usize {
        self.pending.extend(self.rx.try_iter());
        self.pending.len()
    }
}

/// Create a connected sender/queue pair.
pub(crate) fn channel() -> (ImuSender, ImuQueue) {
    let (tx, rx) = mpsc::channel();
    let stats = Arc::new(Mutex::new(IngestStats::default()));
    (
        ImuSender {
            tx,
            stats: Arc::clone(&stats),
        },
        ImuQueue {
            rx,
            pending: VecDeque::new(),
            stats,
        },
    )
}
