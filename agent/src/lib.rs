//! Resource side agent of a pilot job system.
//!
//! The agent registers its pilot in a shared coordination store, pulls job
//! URLs from the pilot's queue, places them on the slots of its allocation and
//! keeps their persisted state up to date until they finish.

pub mod agent;
pub mod config;
pub mod executors;
pub mod inventory;
pub mod job;
pub mod launch;
pub mod pilot;
pub mod slots;
pub mod store;

#[cfg(test)]
mod executors_test;
