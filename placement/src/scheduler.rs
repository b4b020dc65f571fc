use crate::description::{
    Labeled, PilotComputeDescription, PilotDataDescription, WorkUnitDescription,
};
use rand::{seq::IndexedRandom, Rng};
use tracing::debug;

/// Pick a candidate for `request` uniformly at random.
///
/// If the request carries both labels only candidates with the same two
/// labels are eligible, otherwise all are. Returns `None` when nothing is
/// eligible.
pub fn select_with<'a, C, R>(candidates: &'a [C], request: &impl Labeled, rng: &mut R) -> Option<&'a C>
where
    C: Labeled,
    R: Rng + ?Sized,
{
    let wanted = request.labels();

    if !wanted.is_constrained() {
        return candidates.choose(rng);
    }

    let eligible = candidates
        .iter()
        .filter(|candidate| candidate.labels().matches(wanted))
        .collect::<Vec<_>>();
    debug!(
        candidates = candidates.len(),
        eligible = eligible.len(),
        labels = ?wanted,
        "Filtered candidates by affinity"
    );

    eligible.choose(rng).copied()
}

/// `select_with` on the thread local generator
pub fn select<'a, C: Labeled>(candidates: &'a [C], request: &impl Labeled) -> Option<&'a C> {
    select_with(candidates, request, &mut rand::rng())
}

/// Holds the known pilot data stores and pilot compute resources and places
/// requests on them.
#[derive(Clone, Debug, Default)]
pub struct AffinityScheduler {
    pilot_data: Vec<PilotDataDescription>,
    pilot_compute: Vec<PilotComputeDescription>,
}

impl AffinityScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// replace the pilot data candidates
    pub fn set_pilot_data(&mut self, pilot_data: Vec<PilotDataDescription>) {
        self.pilot_data = pilot_data;
    }

    /// replace the pilot compute candidates
    pub fn set_pilot_compute(&mut self, pilot_compute: Vec<PilotComputeDescription>) {
        self.pilot_compute = pilot_compute;
    }

    pub fn schedule_pilot_data(
        &self,
        request: &PilotDataDescription,
    ) -> Option<&PilotDataDescription> {
        debug!("Schedule pilot data, {} stores available", self.pilot_data.len());

        select(&self.pilot_data, request)
    }

    /// Place a work unit. With both labels set and no matching resource the
    /// work unit can't be scheduled.
    pub fn schedule_pilot_compute(
        &self,
        request: &WorkUnitDescription,
    ) -> Option<&PilotComputeDescription> {
        debug!(
            "Schedule work unit {}, {} pilots available",
            request.executable,
            self.pilot_compute.len()
        );

        select(&self.pilot_compute, request)
    }
}
