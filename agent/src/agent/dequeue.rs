use crate::{
    config::Intervals,
    executors::{pool::WorkerPool, Executor},
    pilot::PilotId,
    slots::SlotPool,
    store::{CoordinationStore, Dequeued},
};
use std::{sync::Arc, thread};
use tracing::{debug, info, warn};

/// Why the dequeue loop returned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DequeueExit {
    /// the pilot was flagged as stopped in the coordination store
    Stopped,
    /// the `STOP` sentinel was popped from the queue
    StopSentinel,
}

/// Pulls job URLs from the pilot queue and hands them to the worker pool
pub struct DequeueLoop {
    pub pilot: PilotId,
    pub store: Arc<dyn CoordinationStore>,
    pub slots: Arc<SlotPool>,
    pub pool: WorkerPool,
    pub executor: Arc<Executor>,
    pub intervals: Intervals,
}

impl DequeueLoop {
    pub fn run(self) -> DequeueExit {
        let mut dequeued: usize = 0;

        let exit = loop {
            match self.store.is_pilot_stopped(&self.pilot) {
                Ok(true) => {
                    info!(pilot = %self.pilot, "Pilot stopped, leaving dequeue loop");
                    break DequeueExit::Stopped;
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(pilot = %self.pilot, error = ?error, "Failed to check pilot state");
                    thread::sleep(self.intervals.dequeue_idle());
                    continue;
                }
            }

            // racy on purpose, allocate does the real check
            if self.slots.free_count() == 0 {
                debug!("No free slots, waiting");
                thread::sleep(self.intervals.dequeue_idle());
                continue;
            }

            let job_url = match self
                .store
                .dequeue_job(&self.pilot, self.intervals.dequeue_timeout())
            {
                Ok(Dequeued::Job(job_url)) => job_url,
                Ok(Dequeued::Stop) => {
                    info!(pilot = %self.pilot, "Received STOP, leaving dequeue loop");
                    break DequeueExit::StopSentinel;
                }
                Ok(Dequeued::Empty) => {
                    thread::sleep(self.intervals.dequeue_idle());
                    continue;
                }
                Err(error) => {
                    warn!(pilot = %self.pilot, error = ?error, "Failed to dequeue job");
                    thread::sleep(self.intervals.dequeue_idle());
                    continue;
                }
            };

            dequeued += 1;

            // admission throttle, at most one pool worth of jobs in flight
            if dequeued % self.pool.size() == 0 {
                debug!(in_flight = self.pool.in_flight(), "Waiting for workers to drain");
                self.pool.wait();
            }

            let executor = Arc::clone(&self.executor);
            self.pool.submit(move || executor.run(&job_url));
        };

        self.pool.wait();
        debug!(dequeued, "Dequeue loop finished, worker pool drained");

        exit
    }
}
