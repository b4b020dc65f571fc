pub mod dequeue;
pub mod monitor;

use crate::{
    config::AgentConfig,
    executors::{pool::WorkerPool, process::ProcessTable, Executor},
    launch::{
        probe::{self, Availability},
        LaunchMethod,
    },
    pilot::{Pilot, PilotError},
    slots::SlotPool,
    store::{CoordinationStore, HashQueue, StoreAdapters, StoreError},
};
use dequeue::{DequeueExit, DequeueLoop};
use monitor::{MonitorExit, MonitorLoop};
use rayon::ThreadPoolBuildError;
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};
use thiserror::Error;
use tracing::{debug, info};

/// connections kept aside for the two loops and bootstrap on top of one per worker
const EXTRA_CONNECTIONS: u32 = 3;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid pilot URL")]
    Pilot(#[from] PilotError),
    #[error("Coordination store unavailable")]
    Store(#[from] StoreError),
    #[error("Failed to create pilot directory {path:?}")]
    PilotDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to start the worker pool")]
    WorkerPool(#[from] ThreadPoolBuildError),
    #[error("Failed to spawn the {0} thread")]
    Thread(&'static str, #[source] io::Error),
    #[error("The {0} loop panicked")]
    Panicked(&'static str),
}

/// How both loops ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AgentReport {
    pub dequeue: DequeueExit,
    pub monitor: MonitorExit,
}

/// A bootstrapped pilot agent, ready to `run`.
#[derive(Debug)]
pub struct Agent {
    pilot: Pilot,
    config: AgentConfig,
    pilot_dir: PathBuf,
    store: Arc<dyn CoordinationStore>,
    slots: Arc<SlotPool>,
    processes: Arc<ProcessTable>,
}

impl Agent {
    /// connect to the coordination store behind `coordination_url` and register the pilot
    pub fn bootstrap(
        coordination_url: &str,
        pilot_url: &str,
        config: AgentConfig,
    ) -> Result<Self, AgentError> {
        let connections = u32::try_from(config.threads)
            .unwrap_or(u32::MAX)
            .saturating_add(EXTRA_CONNECTIONS);
        let store = StoreAdapters::load(coordination_url, connections)?;
        info!("Connected to coordination store {}", store.address());

        Self::with_store(Arc::new(store), pilot_url, config)
    }

    /// Register the pilot with an already connected store.
    ///
    /// Creates the pilot directory, marks the pilot as running, seeds the slot
    /// pool from the inventory and settles the launch method.
    pub fn with_store(
        store: Arc<dyn CoordinationStore>,
        pilot_url: &str,
        mut config: AgentConfig,
    ) -> Result<Self, AgentError> {
        let pilot = Pilot::from_url(pilot_url)?;
        let pilot_dir = config.pilot_dir(pilot.id.as_str());
        create_pilot_directory(&pilot_dir)?;

        store.set_pilot_state(&pilot.id, pilot.state, false)?;
        info!(
            pilot = %pilot.id,
            url = pilot.url.as_str(),
            dir = ?pilot_dir,
            "Pilot registered"
        );

        let machine_file_dir = config
            .machine_file_dir
            .clone()
            .unwrap_or_else(|| pilot_dir.clone());
        let slots = SlotPool::new(config.inventory.discover(), machine_file_dir);

        config.launch.method = match config.launch.method {
            method @ (LaunchMethod::Ssh | LaunchMethod::Aprun) if config.launch.probe => {
                probe::resolve(method, Availability::probe(&config.launch))
            }
            method => method,
        };
        info!(
            pilot = %pilot.id,
            slots = slots.total(),
            method = %config.launch.method,
            workers = config.threads,
            "Agent ready"
        );

        Ok(Self {
            pilot,
            config,
            pilot_dir,
            store,
            slots: Arc::new(slots),
            processes: Arc::new(ProcessTable::new()),
        })
    }

    pub fn pilot(&self) -> &Pilot {
        &self.pilot
    }

    pub fn pilot_dir(&self) -> &Path {
        &self.pilot_dir
    }

    pub fn slots(&self) -> Arc<SlotPool> {
        Arc::clone(&self.slots)
    }

    pub fn processes(&self) -> Arc<ProcessTable> {
        Arc::clone(&self.processes)
    }

    /// Run the dequeue and monitor loops on their own threads until both return.
    pub fn run(self) -> Result<AgentReport, AgentError> {
        let pool = WorkerPool::new(self.config.threads)?;
        let executor = Arc::new(Executor {
            pilot: self.pilot.id.clone(),
            store: Arc::clone(&self.store),
            slots: Arc::clone(&self.slots),
            processes: Arc::clone(&self.processes),
            launch: self.config.launch.clone(),
            pilot_dir: self.pilot_dir.clone(),
            requeue_delay: self.config.intervals.requeue_delay(),
        });
        let dequeue_finished = Arc::new(AtomicBool::new(false));

        let dequeue = DequeueLoop {
            pilot: self.pilot.id.clone(),
            store: Arc::clone(&self.store),
            slots: Arc::clone(&self.slots),
            pool,
            executor,
            intervals: self.config.intervals.clone(),
        };
        let monitor = MonitorLoop {
            pilot: self.pilot.id.clone(),
            store: Arc::clone(&self.store),
            slots: Arc::clone(&self.slots),
            processes: Arc::clone(&self.processes),
            period: self.config.intervals.monitor_period(),
            max_failed_polls: self.config.max_failed_polls,
            dequeue_finished: Arc::clone(&dequeue_finished),
        };

        let dequeue = thread::Builder::new()
            .name("dequeue".into())
            .spawn(move || {
                let exit = dequeue.run();
                dequeue_finished.store(true, Ordering::SeqCst);
                exit
            })
            .map_err(|error| AgentError::Thread("dequeue", error))?;
        let monitor = thread::Builder::new()
            .name("monitor".into())
            .spawn(move || monitor.run())
            .map_err(|error| AgentError::Thread("monitor", error))?;

        let report = AgentReport {
            dequeue: dequeue
                .join()
                .map_err(|_| AgentError::Panicked("dequeue"))?,
            monitor: monitor
                .join()
                .map_err(|_| AgentError::Panicked("monitor"))?,
        };

        debug!(
            pilot = %self.pilot.id,
            report = ?report,
            busy = self.slots.busy_count(),
            "Agent finished"
        );

        Ok(report)
    }
}

fn create_pilot_directory(path: &Path) -> Result<(), AgentError> {
    fs::create_dir_all(path).map_err(|source| AgentError::PilotDirectory {
        path: path.to_path_buf(),
        source,
    })
}
