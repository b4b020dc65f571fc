use crate::job::path_component;
use itertools::Itertools;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::{self, File},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, warn};

const MACHINE_FILE_PREFIX: &str = "machinefile-";

/// One schedulable unit of the pilot allocation, usually a hostname.
/// The same value shows up once per core the host offers.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Slot(String);

impl Slot {
    pub fn new(slot: impl Into<String>) -> Self {
        Self(slot.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Slot {
    fn from(slot: &str) -> Self {
        Self(slot.to_string())
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("At least one slot has to be requested")]
    NothingRequested,
    #[error("Not enough free slots: requested {requested}, free {free}")]
    Insufficient { requested: usize, free: usize },
    #[error("Job {0} already holds an allocation")]
    AlreadyAllocated(String),
    #[error("Failed to write machine file {path:?}")]
    MachineFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
#[error("Failed to read machine file {path:?}, its slots are not recovered")]
pub struct ReleaseError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Slots granted to a single job
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub machine_file: PathBuf,
    pub slots: Vec<Slot>,
}

impl Allocation {
    pub fn first_host(&self) -> Option<&Slot> {
        self.slots.first()
    }
}

#[derive(Debug, Default)]
struct SlotState {
    free: Vec<Slot>,
    busy: Vec<Slot>,
}

/// Free/busy bookkeeping for the pilot allocation.
///
/// Both sides are multisets kept as plain vectors. A single lock covers the
/// whole allocate/release critical section including the machine file I/O,
/// so a machine file exists exactly as long as its job holds slots.
#[derive(Debug)]
pub struct SlotPool {
    state: Mutex<SlotState>,
    machine_file_dir: PathBuf,
    total: usize,
}

impl SlotPool {
    pub fn new(inventory: Vec<Slot>, machine_file_dir: impl Into<PathBuf>) -> Self {
        Self {
            total: inventory.len(),
            state: Mutex::new(SlotState {
                free: inventory,
                busy: Vec::new(),
            }),
            machine_file_dir: machine_file_dir.into(),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// whether `requested` slots could ever be granted by this pool
    pub fn fits(&self, requested: usize) -> bool {
        requested <= self.total
    }

    /// Advisory only, the authoritative check happens inside `allocate`.
    pub fn free_count(&self) -> usize {
        self.state.lock().free.len()
    }

    pub fn busy_count(&self) -> usize {
        self.state.lock().busy.len()
    }

    /// copies of the free and busy multisets
    pub fn snapshot(&self) -> (Vec<Slot>, Vec<Slot>) {
        let state = self.state.lock();

        (state.free.clone(), state.busy.clone())
    }

    pub fn machine_file_path(&self, job_id: &str) -> PathBuf {
        self.machine_file_dir
            .join(format!("{MACHINE_FILE_PREFIX}{}", path_component(job_id)))
    }

    /// Grab `requested` slots for `job_id` and write its machine file.
    ///
    /// Slots are taken group by group in order of first appearance, each
    /// distinct value drained before moving on. Whole hosts are not guaranteed,
    /// an allocation may span a partial host.
    pub fn allocate(&self, job_id: &str, requested: usize) -> Result<Allocation, AllocationError> {
        if requested == 0 {
            return Err(AllocationError::NothingRequested);
        }

        let mut state = self.state.lock();

        if state.free.len() < requested {
            return Err(AllocationError::Insufficient {
                requested,
                free: state.free.len(),
            });
        }

        let mut selected = Vec::with_capacity(requested);

        for slot in state.free.iter().unique().cloned().collect_vec() {
            let available = state.free.iter().filter(|free| **free == slot).count();
            let take = available.min(requested - selected.len());

            debug!(slot = %slot, available, take, "Allocate from slot group");
            selected.extend(std::iter::repeat(slot).take(take));

            if selected.len() == requested {
                break;
            }
        }

        for slot in selected.iter() {
            take_one(&mut state.free, slot);
            state.busy.push(slot.clone());
        }

        let machine_file = self.machine_file_path(job_id);

        if let Err(error) = write_machine_file(&machine_file, &selected) {
            // roll back, the job holds nothing without its machine file
            for slot in selected.iter() {
                take_one(&mut state.busy, slot);
                state.free.push(slot.clone());
            }

            return Err(match error.kind() {
                ErrorKind::AlreadyExists => AllocationError::AlreadyAllocated(job_id.to_string()),
                _ => {
                    let _ = fs::remove_file(&machine_file);

                    AllocationError::MachineFile {
                        path: machine_file,
                        source: error,
                    }
                }
            });
        }

        debug!(
            job = job_id,
            machine_file = ?machine_file,
            slots = ?selected,
            free = state.free.len(),
            busy = state.busy.len(),
            "Wrote machine file"
        );

        Ok(Allocation {
            machine_file,
            slots: selected,
        })
    }

    /// Return the slots listed in the machine file of `job_id` and delete it.
    ///
    /// A missing machine file means there is nothing to release and is not an
    /// error. An unreadable one leaks its slots, which is reported but never
    /// fatal.
    pub fn release(&self, job_id: &str) -> Result<usize, ReleaseError> {
        let path = self.machine_file_path(job_id);
        let mut state = self.state.lock();

        let slots = match read_machine_file(&path) {
            Ok(slots) => slots,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                debug!(job = job_id, "No machine file, nothing to release");

                return Ok(0);
            }
            Err(source) => {
                error!(job = job_id, path = ?path, error = ?source, "Failed to read machine file");

                return Err(ReleaseError { path, source });
            }
        };

        let mut released = 0;

        for slot in slots {
            if take_one(&mut state.busy, &slot) {
                state.free.push(slot);
                released += 1;
            } else {
                warn!(job = job_id, slot = %slot, "Machine file lists a slot that is not busy, skipping");
            }
        }

        if let Err(error) = fs::remove_file(&path) {
            warn!(path = ?path, error = ?error, "Failed to delete machine file");
        }

        debug!(
            job = job_id,
            released,
            free = state.free.len(),
            busy = state.busy.len(),
            "Released slots"
        );

        Ok(released)
    }
}

/// remove a single occurrence of `slot`
fn take_one(slots: &mut Vec<Slot>, slot: &Slot) -> bool {
    match slots.iter().position(|candidate| candidate == slot) {
        Some(index) => {
            slots.remove(index);
            true
        }
        None => false,
    }
}

fn write_machine_file(path: &Path, slots: &[Slot]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = File::options().write(true).create_new(true).open(path)?;

    for slot in slots {
        writeln!(file, "{slot}")?;
    }

    file.sync_all()
}

/// one slot per non empty line
pub fn read_machine_file(path: &Path) -> io::Result<Vec<Slot>> {
    Ok(fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(Slot::from)
        .collect())
}
