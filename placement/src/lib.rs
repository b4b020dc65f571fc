//! Affinity aware placement of pilot data and work units.
//!
//! Candidates and requests may carry a datacenter and a machine label. A
//! request naming both is only ever placed on a candidate with exactly the
//! same two labels, there is no fallback to unconstrained placement.

pub mod description;
pub mod scheduler;

pub use description::{
    AffinityLabels, Labeled, PilotComputeDescription, PilotDataDescription, WorkUnitDescription,
};
pub use scheduler::{select, select_with, AffinityScheduler};
