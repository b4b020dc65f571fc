use crate::{
    executors::process::{Finished, ProcessTable},
    job::JobState,
    pilot::PilotId,
    slots::SlotPool,
    store::{CoordinationStore, StoreError},
};
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Coordination store request failed")]
    Store(#[from] StoreError),
    #[error("Failed to poll job processes")]
    Poll(#[source] io::Error),
}

/// Why the monitor loop returned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorExit {
    Stopped,
    /// the dequeue loop is gone and no process is left to watch
    Drained,
    /// too many consecutive passes failed
    FailStop { failures: u32 },
}

/// Periodically reaps finished job processes, records their final state and
/// hands their slots back.
pub struct MonitorLoop {
    pub pilot: PilotId,
    pub store: Arc<dyn CoordinationStore>,
    pub slots: Arc<SlotPool>,
    pub processes: Arc<ProcessTable>,
    pub period: Duration,
    pub max_failed_polls: u32,
    /// set once the dequeue loop has returned
    pub dequeue_finished: Arc<AtomicBool>,
}

impl MonitorLoop {
    pub fn run(self) -> MonitorExit {
        let mut failures = 0;

        loop {
            let outcome = self
                .store
                .is_pilot_stopped(&self.pilot)
                .map_err(MonitorError::from)
                .and_then(|stopped| match stopped {
                    true => Ok(None),
                    false => self.pass().map(Some),
                });

            match outcome {
                Ok(None) => {
                    info!(
                        pilot = %self.pilot,
                        tracked = self.processes.len(),
                        "Pilot stopped, leaving monitor loop"
                    );
                    return MonitorExit::Stopped;
                }
                Ok(Some(_)) => {
                    failures = 0;

                    if self.dequeue_finished.load(Ordering::SeqCst) && self.processes.is_empty() {
                        info!(pilot = %self.pilot, "No jobs left to monitor");
                        return MonitorExit::Drained;
                    }
                }
                Err(error) => {
                    failures += 1;
                    error!(
                        pilot = %self.pilot,
                        failures,
                        error = ?error,
                        "Monitor pass failed"
                    );

                    if failures >= self.max_failed_polls {
                        error!(
                            pilot = %self.pilot,
                            "Giving up monitoring after {failures} failed passes"
                        );
                        return MonitorExit::FailStop { failures };
                    }
                }
            }

            thread::sleep(self.period);
        }
    }

    /// One sweep over the process table, returns the number of jobs finished.
    ///
    /// A failing store write aborts the pass. The affected entry stays in the
    /// table and is picked up again on the next pass.
    #[instrument(skip(self), fields(pilot = %self.pilot), level = "trace")]
    pub fn pass(&self) -> Result<usize, MonitorError> {
        let finished = self.processes.poll_finished().map_err(MonitorError::Poll)?;

        for process in finished.iter() {
            self.finish(process)?;
        }

        Ok(finished.len())
    }

    fn finish(&self, process: &Finished) -> Result<(), MonitorError> {
        let state = JobState::from_exit_code(process.code);
        let job_url = process.job_url.as_str();

        info!(
            job = job_url,
            executable = process.executable.as_str(),
            code = ?process.code,
            state = %state,
            "Job process finished"
        );

        let current = self.store.get_job_state(job_url).unwrap_or_else(|error| {
            warn!(job = job_url, error = ?error, "Failed to read job state, overwriting it");
            None
        });

        match current {
            Some(current) if !current.can_advance_to(state) => {
                warn!(
                    job = job_url,
                    current = %current,
                    "Job already reached a final state, keeping it"
                );
            }
            _ => self.store.set_job_state(job_url, state)?,
        }

        // the restart-in-place policy would hook in here for failed jobs
        match self.slots.release(&process.job_id) {
            Ok(released) => debug!(job = job_url, released, "Released job slots"),
            Err(error) => error!(job = job_url, error = ?error, "Failed to free job slots"),
        }

        self.processes.remove(job_url);

        Ok(())
    }
}
