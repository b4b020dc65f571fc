use parking_lot::Mutex;
use std::{collections::BTreeMap, io, process::Child};
use tracing::{trace, warn};

#[derive(Debug)]
pub struct TrackedProcess {
    pub child: Child,
    pub job_id: String,
    pub executable: String,
}

/// A tracked process that has exited
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Finished {
    pub job_url: String,
    pub job_id: String,
    pub executable: String,
    /// `None` if the process was terminated by a signal
    pub code: Option<i32>,
}

/// Running job processes, keyed by job URL.
///
/// Entries are inserted by the workers and removed by the monitor only.
#[derive(Debug, Default)]
pub struct ProcessTable {
    processes: Mutex<BTreeMap<String, TrackedProcess>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job_url: &str, process: TrackedProcess) {
        if let Some(previous) = self
            .processes
            .lock()
            .insert(job_url.to_string(), process)
        {
            warn!(
                job = job_url,
                pid = previous.child.id(),
                "Job was already tracked, dropping the old process handle"
            );
        }
    }

    pub fn len(&self) -> usize {
        self.processes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.lock().is_empty()
    }

    pub fn contains(&self, job_url: &str) -> bool {
        self.processes.lock().contains_key(job_url)
    }

    /// Non-blocking check of every tracked process. Finished processes stay in
    /// the table until `remove` is called for them.
    pub fn poll_finished(&self) -> io::Result<Vec<Finished>> {
        let mut processes = self.processes.lock();
        let mut finished = Vec::new();

        for (job_url, process) in processes.iter_mut() {
            match process.child.try_wait()? {
                Some(status) => finished.push(Finished {
                    job_url: job_url.clone(),
                    job_id: process.job_id.clone(),
                    executable: process.executable.clone(),
                    code: status.code(),
                }),
                None => trace!(job = %job_url, pid = process.child.id(), "Still running"),
            }
        }

        Ok(finished)
    }

    pub fn remove(&self, job_url: &str) -> Option<TrackedProcess> {
        self.processes.lock().remove(job_url)
    }
}
