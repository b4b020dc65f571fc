use super::{HashQueue, StoreError};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

pub const SCHEME: &str = "memory";

/// Process local backend, hashes and queues live in this process only.
///
/// Useful for single host runs where submitter and agent share a process, and
/// for tests.
#[derive(Debug)]
pub struct MemoryStore {
    address: String,
    inner: Mutex<Inner>,
    pushed: Condvar,
}

#[derive(Debug, Default)]
struct Inner {
    hashes: HashMap<String, HashMap<String, String>>,
    queues: HashMap<String, VecDeque<String>>,
}

impl MemoryStore {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            inner: Mutex::new(Inner::default()),
            pushed: Condvar::new(),
        }
    }

    /// number of entries currently waiting in a queue
    pub fn queue_len(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map_or(0, VecDeque::len)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(format!("{SCHEME}://local"))
    }
}

impl HashQueue for MemoryStore {
    fn address(&self) -> &str {
        &self.address
    }

    fn hash_set(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let hash = inner.hashes.entry(key.to_string()).or_default();

        for (field, value) in fields {
            hash.insert(field.to_string(), value.to_string());
        }

        Ok(())
    }

    fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .hashes
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();

        for key in keys {
            inner.hashes.remove(key);
            inner.queues.remove(key);
        }

        Ok(())
    }

    fn push(&self, queue: &str, value: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(value.to_string());
        self.pushed.notify_all();

        Ok(())
    }

    fn pop_blocking(&self, queue: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();

        loop {
            if let Some(value) = inner.queues.get_mut(queue).and_then(VecDeque::pop_front) {
                return Ok(Some(value));
            }

            if self.pushed.wait_until(&mut inner, deadline).timed_out() {
                return Ok(inner.queues.get_mut(queue).and_then(VecDeque::pop_front));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        job::JobState,
        pilot::{PilotId, PilotState},
        store::{CoordinationStore, Dequeued, STOP_SENTINEL},
    };
    use std::{sync::Arc, thread};

    #[test]
    fn queue_is_fifo() {
        let store = MemoryStore::default();
        let pilot = PilotId::new("bj-1");

        store.queue_job(&pilot, "job-a").unwrap();
        store.queue_job(&pilot, "job-b").unwrap();

        let timeout = Duration::from_millis(10);
        assert_eq!(
            store.dequeue_job(&pilot, timeout).unwrap(),
            Dequeued::Job("job-a".into())
        );
        assert_eq!(
            store.dequeue_job(&pilot, timeout).unwrap(),
            Dequeued::Job("job-b".into())
        );
        assert_eq!(store.dequeue_job(&pilot, timeout).unwrap(), Dequeued::Empty);
    }

    #[test]
    fn stop_sentinel_is_recognized() {
        let store = MemoryStore::default();
        let pilot = PilotId::new("bj-1");

        store.queue_job(&pilot, STOP_SENTINEL).unwrap();
        assert_eq!(
            store.dequeue_job(&pilot, Duration::from_millis(10)).unwrap(),
            Dequeued::Stop
        );
    }

    #[test]
    fn blocking_pop_wakes_up_on_push() {
        let store = Arc::new(MemoryStore::default());
        let pilot = PilotId::new("bj-1");

        let producer = {
            let store = Arc::clone(&store);
            let pilot = pilot.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                store.queue_job(&pilot, "late-job").unwrap();
            })
        };

        let dequeued = store.dequeue_job(&pilot, Duration::from_secs(5)).unwrap();
        producer.join().unwrap();

        assert_eq!(dequeued, Dequeued::Job("late-job".into()));
    }

    #[test]
    fn pilot_and_job_state_round_trip() {
        let store = MemoryStore::default();
        let pilot = PilotId::new("bj-1");

        assert!(store.get_pilot_state(&pilot).unwrap().is_none());
        assert!(store.is_pilot_stopped(&pilot).unwrap());

        store
            .set_pilot_state(&pilot, PilotState::Running, false)
            .unwrap();
        assert!(!store.is_pilot_stopped(&pilot).unwrap());

        store.set_job_state("job-a", JobState::Running).unwrap();
        assert_eq!(
            store.get_job_state("job-a").unwrap(),
            Some(JobState::Running)
        );

        store.delete_pilot(&pilot).unwrap();
        assert!(store.get_pilot_state(&pilot).unwrap().is_none());
    }

    #[test]
    fn job_description_round_trip_and_delete() {
        let store = MemoryStore::default();
        let mut fields = crate::job::JobFields::new();
        fields.insert("job-id".into(), "a".into());
        fields.insert("Executable".into(), "/bin/date".into());

        assert!(store.get_job("job-a").unwrap().is_none());
        store.set_job("job-a", &fields).unwrap();
        assert_eq!(store.get_job("job-a").unwrap(), Some(fields));

        store.delete_job("job-a").unwrap();
        assert!(store.get_job("job-a").unwrap().is_none());
        assert!(store.get_job_state("job-a").unwrap().is_none());
    }
}
