pub mod pool;
pub mod process;

use crate::{
    config::LaunchConfig,
    job::{DescriptionError, JobDescription, JobState},
    launch::{LaunchCommand, LaunchError},
    pilot::PilotId,
    slots::{AllocationError, SlotPool},
    store::{CoordinationStore, StoreError},
};
use process::{ProcessTable, TrackedProcess};
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Coordination store request failed")]
    Store(#[from] StoreError),
    #[error("Job {0} has no description in the coordination store")]
    MissingDescription(String),
    #[error("Invalid job description")]
    Description(#[from] DescriptionError),
    #[error("Failed to allocate slots")]
    Allocation(#[from] AllocationError),
    #[error("Failed to launch job")]
    Launch(#[from] LaunchError),
    #[error("Failed to create working directory {path:?}")]
    WorkingDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What happened to a dequeued job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Launched,
    /// no slots right now, the job went back to the tail of the queue
    Requeued,
    /// the job was already past the point where it could be started
    Skipped(JobState),
}

/// Turns a dequeued job URL into a running, tracked process.
#[derive(Debug)]
pub struct Executor {
    pub pilot: PilotId,
    pub store: Arc<dyn CoordinationStore>,
    pub slots: Arc<SlotPool>,
    pub processes: Arc<ProcessTable>,
    pub launch: LaunchConfig,
    pub pilot_dir: PathBuf,
    pub requeue_delay: Duration,
}

impl Executor {
    /// Entry point of a worker. Errors are logged here and the job keeps
    /// whatever state was last persisted, it is not retried.
    pub fn run(&self, job_url: &str) {
        match self.execute(job_url) {
            Ok(Dispatch::Launched) => {}
            Ok(Dispatch::Requeued) => debug!(job = job_url, "Job deferred"),
            Ok(Dispatch::Skipped(state)) => {
                info!(job = job_url, state = %state, "Job is not startable, skipping")
            }
            Err(error) => error!(job = job_url, error = ?error, "Failed to execute job"),
        }
    }

    #[instrument(skip(self), fields(pilot = %self.pilot), level = "debug")]
    pub fn execute(&self, job_url: &str) -> Result<Dispatch, ExecutorError> {
        let fields = self
            .store
            .get_job(job_url)?
            .ok_or_else(|| ExecutorError::MissingDescription(job_url.to_string()))?;
        let mut description = JobDescription::from_fields(&fields)?;

        if description.state == JobState::Unknown {
            self.store.set_job_state(job_url, JobState::New)?;
            description.state = JobState::New;
        }

        if !description.state.is_dispatchable() {
            return Ok(Dispatch::Skipped(description.state));
        }

        let working_directory = description.working_directory_in(&self.pilot_dir);
        create_working_directory(&working_directory)?;

        let allocation = match self
            .slots
            .allocate(&description.job_id, description.number_of_processes)
        {
            Ok(allocation) => allocation,
            Err(AllocationError::Insufficient { requested, free }) => {
                if !self.slots.fits(requested) {
                    warn!(
                        job = job_url,
                        requested,
                        total = self.slots.total(),
                        "Job needs more slots than the pilot has, it will never start here"
                    );
                } else {
                    debug!(
                        job = job_url,
                        requested, free, "Not enough free slots, requeueing"
                    );
                }

                return self.requeue(job_url);
            }
            Err(AllocationError::AlreadyAllocated(job_id)) => {
                // another job with the same id holds the machine file
                warn!(
                    job = job_url,
                    job_id = %job_id,
                    "Job id is already running, requeueing"
                );

                return self.requeue(job_url);
            }
            Err(error) => return Err(error.into()),
        };

        let child = match LaunchCommand::build(
            &description,
            &working_directory,
            &self.launch,
            &allocation,
        )
        .and_then(|command| {
            info!(job = job_url, "Launching {command}");
            command.spawn()
        }) {
            Ok(child) => child,
            Err(error) => {
                // nothing runs on the slots, hand them back
                if let Err(release) = self.slots.release(&description.job_id) {
                    warn!(job = job_url, error = ?release, "Failed to release slots");
                }

                return Err(error.into());
            }
        };

        debug!(job = job_url, pid = child.id(), "Spawned job process");

        // written before the process becomes visible to the monitor, which
        // may record the final state on its next pass
        if let Err(error) = self.store.set_job_state(job_url, JobState::Running) {
            error!(job = job_url, error = ?error, "Failed to mark job as running");
        }

        self.processes.insert(
            job_url,
            TrackedProcess {
                child,
                job_id: description.job_id.clone(),
                executable: description.executable.clone(),
            },
        );

        Ok(Dispatch::Launched)
    }

    fn requeue(&self, job_url: &str) -> Result<Dispatch, ExecutorError> {
        thread::sleep(self.requeue_delay);
        self.store.queue_job(&self.pilot, job_url)?;

        Ok(Dispatch::Requeued)
    }
}

fn create_working_directory(path: &Path) -> Result<(), ExecutorError> {
    fs::create_dir_all(path).map_err(|source| ExecutorError::WorkingDirectory {
        path: path.to_path_buf(),
        source,
    })
}
