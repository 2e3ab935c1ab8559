// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright © 2024 RemasteredArch
//
// This file is part of smtp_intake.
//
// smtp_intake is free software: you can redistribute it and/or modify it under the terms of the
// GNU Affero General Public License as published by the Free Software Foundation, either version
// 3 of the License, or (at your option) any later version.
//
// smtp_intake is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See
// the GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License along with
// smtp_intake. If not, see <https://www.gnu.org/licenses/>.

//! Hand-off of received messages to storage workers.
//!
//! ```text
//! connection task ──Job──▶ bounded queue ──▶ worker thread ──▶ Backend::save
//!        ▲                                        │
//!        └──────────── Status (oneshot) ◀─────────┘
//! ```
//!
//! The queue holds as many jobs as there are workers, so a burst of messages makes submitting
//! connections wait rather than grow memory. Each job carries its own one-shot acknowledgment
//! channel; a connection only ever observes the outcome of its own message.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use tokio::sync::{mpsc, oneshot};

pub use self::backend::Backend;
use crate::envelope::Envelope;

pub mod backend;

/// A worker's verdict on one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Failure,
}

/// What a connection learns about its submitted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// The backend reported an error, or the job was lost without an acknowledgment.
    Failed,
    /// No acknowledgment arrived in time. The job may still complete later.
    TimedOut,
}

/// One message in flight to a worker.
#[derive(Debug)]
pub struct Job {
    envelope: Envelope,
    ack: oneshot::Sender<Status>,
}

impl Job {
    /// Create a job and the receiver its acknowledgment will arrive on.
    pub fn new(envelope: Envelope) -> (Self, oneshot::Receiver<Status>) {
        let (ack, receiver) = oneshot::channel();

        (Self { envelope, ack }, receiver)
    }

    pub const fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Report `status` to the submitting connection.
    ///
    /// Consumes the job, so a job is acknowledged at most once. Returns `false` if the connection
    /// stopped waiting.
    pub fn acknowledge(self, status: Status) -> bool {
        self.ack.send(status).is_ok()
    }
}

/// The submitting side of the queue, shared by all connections.
#[derive(Debug, Clone)]
pub struct PersistenceGateway {
    jobs: mpsc::Sender<Job>,
    ack_timeout: Duration,
}

impl PersistenceGateway {
    /// Create a gateway whose queue holds `capacity` jobs, and the [`JobQueue`] workers read from.
    pub fn new(capacity: usize, ack_timeout: Duration) -> (Self, JobQueue) {
        let (jobs, receiver) = mpsc::channel(capacity.max(1));

        (
            Self { jobs, ack_timeout },
            JobQueue {
                jobs: Arc::new(Mutex::new(receiver)),
            },
        )
    }

    /// Queue `envelope` and wait for its acknowledgment.
    ///
    /// Waits for queue space if every worker is busy; the acknowledgment timeout only starts once
    /// the job is queued.
    pub async fn submit(&self, envelope: Envelope) -> SaveOutcome {
        let hash = envelope.hash.clone();
        let (job, ack) = Job::new(envelope);

        if self.jobs.send(job).await.is_err() {
            tracing::error!(%hash, "Persistence queue closed, message not saved");
            return SaveOutcome::Failed;
        }

        match tokio::time::timeout(self.ack_timeout, ack).await {
            Ok(Ok(Status::Success)) => SaveOutcome::Saved,
            Ok(Ok(Status::Failure)) => SaveOutcome::Failed,
            Ok(Err(_)) => {
                tracing::warn!(%hash, "Job dropped without acknowledgment");
                SaveOutcome::Failed
            }
            Err(_elapsed) => {
                tracing::warn!(%hash, timeout = ?self.ack_timeout, "Save acknowledgment timed out");
                SaveOutcome::TimedOut
            }
        }
    }
}

/// The receiving side of the queue, shared by all workers.
#[derive(Debug, Clone)]
pub struct JobQueue {
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
}

impl JobQueue {
    /// Block the current thread until a job arrives.
    ///
    /// Returns `None` once every [`PersistenceGateway`] is dropped and the queue is drained.
    /// Must not be called from within an async runtime.
    pub fn blocking_next(&self) -> Option<Job> {
        let mut jobs = self.jobs.lock().ok()?;

        jobs.blocking_recv()
    }
}

/// A fixed set of threads running [`Backend::save`] on queued jobs.
#[derive(Debug)]
pub struct WorkerPool {
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `count` workers on `queue`.
    ///
    /// # Errors
    ///
    /// Any error spawning a thread. Workers already started keep running until the queue closes.
    pub fn spawn(queue: &JobQueue, backend: &Arc<dyn Backend>, count: usize) -> std::io::Result<Self> {
        let workers = (0..count)
            .map(|index| {
                let queue = queue.clone();
                let backend = Arc::clone(backend);

                thread::Builder::new()
                    .name(format!("save-worker-{index}"))
                    .spawn(move || work(&queue, backend.as_ref()))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        tracing::info!(workers = count, backend = backend.name(), "Persistence workers started");

        Ok(Self { workers })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker to finish. Workers finish once all gateways are dropped.
    pub fn join(self) {
        for worker in self.workers {
            if worker.join().is_err() {
                tracing::error!("Persistence worker panicked");
            }
        }
    }
}

fn work(queue: &JobQueue, backend: &dyn Backend) {
    while let Some(job) = queue.blocking_next() {
        let hash = job.envelope().hash.clone();

        let status = match panic::catch_unwind(AssertUnwindSafe(|| backend.save(job.envelope()))) {
            Ok(Ok(())) => {
                tracing::debug!(%hash, "Message saved");
                Status::Success
            }
            Ok(Err(err)) => {
                tracing::warn!(%hash, %err, "Message not saved");
                Status::Failure
            }
            Err(_) => {
                tracing::error!(%hash, "Backend panicked while saving");
                Status::Failure
            }
        };

        if !job.acknowledge(status) {
            tracing::debug!(%hash, "Acknowledgment arrived after the connection stopped waiting");
        }
    }
}
