#![allow(dead_code)]

use pilot_agent::{
    config::{AgentConfig, Intervals, LaunchConfig},
    inventory::InventoryConfig,
    job::{JobDescription, JobState},
    launch::LaunchMethod,
    store::{job_key, memory::MemoryStore, CoordinationStore, HashQueue, StoreError},
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::{Duration, Instant},
};

pub const PILOT_URL: &str = "memory://local/bigjob:bj-e2e:localhost";

/// fast intervals, local launches, `slots` localhost slots
pub fn config(work_dir: &Path, slots: usize) -> AgentConfig {
    AgentConfig {
        threads: 2,
        launch: LaunchConfig {
            method: LaunchMethod::Local,
            probe: false,
            ..LaunchConfig::default()
        },
        inventory: InventoryConfig::Hosts {
            hosts: vec!["localhost".to_string(); slots],
        },
        intervals: Intervals {
            dequeue_idle_ms: 20,
            dequeue_timeout_ms: 100,
            monitor_period_ms: 20,
            requeue_delay_ms: 20,
        },
        work_dir: work_dir.to_path_buf(),
        ..AgentConfig::default()
    }
}

pub fn shell_job(job_id: &str, script: &str, processes: usize) -> JobDescription {
    let mut description = JobDescription::new(job_id, "/bin/sh");
    description.arguments = vec!["-c".to_string(), script.to_string()];
    description.number_of_processes = processes;

    description
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }

    condition()
}

pub fn wait_for_state(store: &dyn CoordinationStore, job_url: &str, state: JobState) -> bool {
    wait_until(Duration::from_secs(10), || {
        store.get_job_state(job_url).ok().flatten() == Some(state)
    })
}

/// In-memory store whose next `failures` requests fail
#[derive(Debug, Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub failures: AtomicUsize,
}

impl FlakyStore {
    pub fn failing(failures: usize) -> Self {
        Self {
            inner: MemoryStore::default(),
            failures: AtomicUsize::new(failures),
        }
    }

    fn check(&self) -> Result<(), StoreError> {
        match self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        {
            Ok(_) => Err(StoreError::Unavailable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

impl HashQueue for FlakyStore {
    fn address(&self) -> &str {
        self.inner.address()
    }

    fn hash_set(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.hash_set(key, fields)
    }

    fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        self.inner.hash_get(key, field)
    }

    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.check()?;
        self.inner.hash_get_all(key)
    }

    fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.delete(keys)
    }

    fn push(&self, queue: &str, value: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.push(queue, value)
    }

    fn pop_blocking(&self, queue: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        self.check()?;
        self.inner.pop_blocking(queue, timeout)
    }
}

/// In-memory store that remembers every queue push and answers description
/// reads for `slow_job` only after `delay`
#[derive(Debug, Default)]
pub struct RecordingStore {
    pub inner: MemoryStore,
    pub pushed: Mutex<Vec<String>>,
    slow_key: Option<String>,
    delay: Duration,
}

impl RecordingStore {
    pub fn slowing(slow_job: &str, delay: Duration) -> Self {
        Self {
            slow_key: Some(job_key(slow_job)),
            delay,
            ..Self::default()
        }
    }

    pub fn pushes_of(&self, value: &str) -> usize {
        self.pushed.lock().iter().filter(|pushed| *pushed == value).count()
    }
}

impl HashQueue for RecordingStore {
    fn address(&self) -> &str {
        self.inner.address()
    }

    fn hash_set(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), StoreError> {
        self.inner.hash_set(key, fields)
    }

    fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.inner.hash_get(key, field)
    }

    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        if self.slow_key.as_deref() == Some(key) {
            thread::sleep(self.delay);
        }
        self.inner.hash_get_all(key)
    }

    fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        self.inner.delete(keys)
    }

    fn push(&self, queue: &str, value: &str) -> Result<(), StoreError> {
        self.pushed.lock().push(value.to_string());
        self.inner.push(queue, value)
    }

    fn pop_blocking(&self, queue: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        self.inner.pop_blocking(queue, timeout)
    }
}
