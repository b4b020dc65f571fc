use serde::{Deserialize, Serialize};

/// Location labels shared by candidates and requests
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AffinityLabels {
    /// entities sharing this label are located in the same datacenter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity_datacenter_label: Option<String>,
    /// entities sharing this label are located on the same machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity_machine_label: Option<String>,
}

impl AffinityLabels {
    pub fn new(datacenter: impl Into<String>, machine: impl Into<String>) -> Self {
        Self {
            affinity_datacenter_label: Some(datacenter.into()),
            affinity_machine_label: Some(machine.into()),
        }
    }

    /// both labels are given, placement is constrained
    pub fn is_constrained(&self) -> bool {
        self.affinity_datacenter_label.is_some() && self.affinity_machine_label.is_some()
    }

    /// exact match of both labels
    pub fn matches(&self, other: &AffinityLabels) -> bool {
        self.affinity_datacenter_label.is_some()
            && self.affinity_datacenter_label == other.affinity_datacenter_label
            && self.affinity_machine_label.is_some()
            && self.affinity_machine_label == other.affinity_machine_label
    }
}

/// Anything that can be placed or placed upon
pub trait Labeled {
    fn labels(&self) -> &AffinityLabels;
}

impl Labeled for AffinityLabels {
    fn labels(&self) -> &AffinityLabels {
        self
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct PilotDataDescription {
    pub service_url: String,
    /// capacity in MB
    #[serde(default)]
    pub size: u64,
    #[serde(flatten)]
    pub labels: AffinityLabels,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct PilotComputeDescription {
    pub service_url: String,
    #[serde(default = "default_processes")]
    pub number_of_processes: usize,
    #[serde(flatten)]
    pub labels: AffinityLabels,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct WorkUnitDescription {
    pub executable: String,
    #[serde(flatten)]
    pub labels: AffinityLabels,
}

fn default_processes() -> usize {
    1
}

impl Labeled for PilotDataDescription {
    fn labels(&self) -> &AffinityLabels {
        &self.labels
    }
}

impl Labeled for PilotComputeDescription {
    fn labels(&self) -> &AffinityLabels {
        &self.labels
    }
}

impl Labeled for WorkUnitDescription {
    fn labels(&self) -> &AffinityLabels {
        &self.labels
    }
}
