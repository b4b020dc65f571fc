pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use crate::{
    job::{JobFields, JobState, FIELD_STATE},
    pilot::{PilotId, PilotState, PilotStatus, FIELD_PILOT_STATE, FIELD_PILOT_STOPPED},
};
use std::{collections::HashMap, fmt::Debug, time::Duration};
use thiserror::Error;
use tracing::debug;

/// queue entry that tells the agent to shut down its dequeue loop
pub const STOP_SENTINEL: &str = "STOP";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Coordination backend {0:?} is not supported")]
    UnsupportedBackend(String),
    #[error("Coordination URL {0:?} is malformed")]
    InvalidUrl(String),
    #[error("Stored job state {0:?} is not understood")]
    InvalidState(String),
    #[cfg(feature = "redis")]
    #[error("Redis request failed")]
    Redis(#[from] ::redis::RedisError),
    #[cfg(feature = "redis")]
    #[error("Failed to acquire a pooled connection")]
    Pool(#[from] r2d2::Error),
    #[error("Coordination backend unavailable: {0}")]
    Unavailable(String),
}

/// result of a blocking pop on the pilot queue
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Dequeued {
    Job(String),
    /// the pop timed out
    Empty,
    Stop,
}

/// Primitive hash + list operations a coordination backend has to offer.
///
/// Everything pilot and job specific is layered on top in `CoordinationStore`,
/// so a backend only has to get these right.
pub trait HashQueue: Send + Sync + Debug {
    fn address(&self) -> &str;

    /// set (and overwrite) the given fields of a hash
    fn hash_set(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), StoreError>;

    fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// an absent hash is returned as an empty map
    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    fn delete(&self, keys: &[String]) -> Result<(), StoreError>;

    /// append to the tail of a FIFO
    fn push(&self, queue: &str, value: &str) -> Result<(), StoreError>;

    /// pop the head of a FIFO, waiting at most `timeout`
    fn pop_blocking(&self, queue: &str, timeout: Duration) -> Result<Option<String>, StoreError>;
}

pub fn pilot_key(pilot: &PilotId) -> String {
    format!("pilot:{pilot}")
}

pub fn queue_key(pilot: &PilotId) -> String {
    format!("pilot:{pilot}:queue")
}

pub fn job_key(job_url: &str) -> String {
    format!("job:{job_url}")
}

/// Contract between the agent and the shared coordination service.
///
/// Every call is independent, only per-key atomicity is assumed.
pub trait CoordinationStore: Send + Sync + Debug {
    fn set_pilot_state(
        &self,
        pilot: &PilotId,
        state: PilotState,
        stopped: bool,
    ) -> Result<(), StoreError>;

    fn get_pilot_state(&self, pilot: &PilotId) -> Result<Option<PilotStatus>, StoreError>;

    /// remove the pilot entry together with its queue
    fn delete_pilot(&self, pilot: &PilotId) -> Result<(), StoreError>;

    fn set_job_state(&self, job_url: &str, state: JobState) -> Result<(), StoreError>;

    fn get_job_state(&self, job_url: &str) -> Result<Option<JobState>, StoreError>;

    fn set_job(&self, job_url: &str, description: &JobFields) -> Result<(), StoreError>;

    fn get_job(&self, job_url: &str) -> Result<Option<JobFields>, StoreError>;

    fn delete_job(&self, job_url: &str) -> Result<(), StoreError>;

    /// push a job to the tail of the pilot queue
    fn queue_job(&self, pilot: &PilotId, job_url: &str) -> Result<(), StoreError>;

    fn dequeue_job(&self, pilot: &PilotId, timeout: Duration) -> Result<Dequeued, StoreError>;

    /// An absent entry, a missing flag or `stopped = true` all mean stopped.
    fn is_pilot_stopped(&self, pilot: &PilotId) -> Result<bool, StoreError> {
        let status = self.get_pilot_state(pilot)?;
        debug!(pilot = %pilot, status = ?status, "Pilot state");

        Ok(status.map_or(true, |status| status.is_stopped()))
    }
}

impl<T: HashQueue + ?Sized> CoordinationStore for T {
    fn set_pilot_state(
        &self,
        pilot: &PilotId,
        state: PilotState,
        stopped: bool,
    ) -> Result<(), StoreError> {
        debug!(pilot = %pilot, state = %state, stopped, "Update pilot state");

        let state = state.to_string();
        let stopped = stopped.to_string();
        self.hash_set(
            &pilot_key(pilot),
            &[
                (FIELD_PILOT_STATE, state.as_str()),
                (FIELD_PILOT_STOPPED, stopped.as_str()),
            ],
        )
    }

    fn get_pilot_state(&self, pilot: &PilotId) -> Result<Option<PilotStatus>, StoreError> {
        let fields = self.hash_get_all(&pilot_key(pilot))?;

        if fields.is_empty() {
            Ok(None)
        } else {
            Ok(Some(PilotStatus::from_fields(&fields)))
        }
    }

    fn delete_pilot(&self, pilot: &PilotId) -> Result<(), StoreError> {
        self.delete(&[pilot_key(pilot), queue_key(pilot)])
    }

    fn set_job_state(&self, job_url: &str, state: JobState) -> Result<(), StoreError> {
        debug!(job = job_url, state = %state, "Update job state");

        let state = state.to_string();
        self.hash_set(&job_key(job_url), &[(FIELD_STATE, state.as_str())])
    }

    fn get_job_state(&self, job_url: &str) -> Result<Option<JobState>, StoreError> {
        match self.hash_get(&job_key(job_url), FIELD_STATE)? {
            Some(state) => state
                .parse()
                .map(Some)
                .map_err(|_| StoreError::InvalidState(state)),
            None => Ok(None),
        }
    }

    fn set_job(&self, job_url: &str, description: &JobFields) -> Result<(), StoreError> {
        let fields = description
            .iter()
            .map(|(field, value)| (field.as_str(), value.as_str()))
            .collect::<Vec<_>>();

        self.hash_set(&job_key(job_url), &fields)
    }

    fn get_job(&self, job_url: &str) -> Result<Option<JobFields>, StoreError> {
        let fields = self.hash_get_all(&job_key(job_url))?;

        Ok(Some(fields).filter(|fields| !fields.is_empty()))
    }

    fn delete_job(&self, job_url: &str) -> Result<(), StoreError> {
        self.delete(&[job_key(job_url)])
    }

    fn queue_job(&self, pilot: &PilotId, job_url: &str) -> Result<(), StoreError> {
        debug!(pilot = %pilot, job = job_url, "Queue job");

        self.push(&queue_key(pilot), job_url)
    }

    fn dequeue_job(&self, pilot: &PilotId, timeout: Duration) -> Result<Dequeued, StoreError> {
        Ok(match self.pop_blocking(&queue_key(pilot), timeout)? {
            None => Dequeued::Empty,
            Some(value) if value == STOP_SENTINEL => Dequeued::Stop,
            Some(job_url) => {
                debug!(pilot = %pilot, job = %job_url, "Dequeued job");

                Dequeued::Job(job_url)
            }
        })
    }
}

/// All available coordination backends, selected by URL scheme in `load`
#[derive(Debug)]
pub enum StoreAdapters {
    Memory(memory::MemoryStore),
    #[cfg(feature = "redis")]
    Redis(redis::RedisStore),
}

impl StoreAdapters {
    /// `connections` bounds the size of connection pools for pooled backends
    #[cfg_attr(not(feature = "redis"), allow(unused_variables))]
    pub fn load(url: &str, connections: u32) -> Result<Self, StoreError> {
        let (scheme, _) = url
            .split_once("://")
            .ok_or_else(|| StoreError::InvalidUrl(url.to_string()))?;

        match scheme.to_lowercase().as_str() {
            memory::SCHEME => Ok(Self::Memory(memory::MemoryStore::new(url))),
            #[cfg(feature = "redis")]
            redis::SCHEME => Ok(Self::Redis(redis::RedisStore::connect(url, connections)?)),
            _ => Err(StoreError::UnsupportedBackend(scheme.to_string())),
        }
    }
}

impl HashQueue for StoreAdapters {
    fn address(&self) -> &str {
        match self {
            Self::Memory(store) => HashQueue::address(store),
            #[cfg(feature = "redis")]
            Self::Redis(store) => HashQueue::address(store),
        }
    }

    fn hash_set(&self, key: &str, fields: &[(&str, &str)]) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => store.hash_set(key, fields),
            #[cfg(feature = "redis")]
            Self::Redis(store) => store.hash_set(key, fields),
        }
    }

    fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        match self {
            Self::Memory(store) => store.hash_get(key, field),
            #[cfg(feature = "redis")]
            Self::Redis(store) => store.hash_get(key, field),
        }
    }

    fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        match self {
            Self::Memory(store) => store.hash_get_all(key),
            #[cfg(feature = "redis")]
            Self::Redis(store) => store.hash_get_all(key),
        }
    }

    fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => store.delete(keys),
            #[cfg(feature = "redis")]
            Self::Redis(store) => store.delete(keys),
        }
    }

    fn push(&self, queue: &str, value: &str) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => store.push(queue, value),
            #[cfg(feature = "redis")]
            Self::Redis(store) => store.push(queue, value),
        }
    }

    fn pop_blocking(&self, queue: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        match self {
            Self::Memory(store) => store.pop_blocking(queue, timeout),
            #[cfg(feature = "redis")]
            Self::Redis(store) => store.pop_blocking(queue, timeout),
        }
    }
}
