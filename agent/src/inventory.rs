use crate::slots::Slot;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const LOCALHOST: &str = "localhost";

/// Where the slots of this pilot's allocation come from.
///
/// Batch system specific node files are expected to be turned into a `hosts`
/// list before they reach the agent.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase", deny_unknown_fields)]
pub enum InventoryConfig {
    /// one `localhost` slot per CPU of this machine
    #[default]
    Local,
    /// `count` synthetic `slot-N` tokens, for launchers that own placement
    Slots { count: usize },
    /// explicit host list, a host appears once per slot it offers
    Hosts { hosts: Vec<String> },
}

static HOSTNAME: Lazy<Option<String>> = Lazy::new(|| match nix::unistd::gethostname() {
    Ok(hostname) => Some(hostname.to_string_lossy().into_owned()),
    Err(error) => {
        warn!(error = ?error, "Failed to retrieve the local hostname");

        None
    }
});

/// name of the machine the agent runs on, if it can be determined
pub fn local_hostname() -> Option<&'static str> {
    HOSTNAME.as_deref()
}

pub fn is_local_host(host: &str) -> bool {
    let host = host.trim();

    host == LOCALHOST
        || host == "127.0.0.1"
        || local_hostname().map_or(false, |local| {
            local == host || local.split('.').next() == Some(host)
        })
}

impl InventoryConfig {
    /// Produce the ordered multiset of slots, falling back to a single
    /// `localhost` slot if nothing usable is configured.
    pub fn discover(&self) -> Vec<Slot> {
        let slots = match self {
            Self::Local => {
                let cpus = num_cpus::get();
                debug!("Detected {cpus} local cpus");

                vec![Slot::from(LOCALHOST); cpus]
            }
            Self::Slots { count } => (0..*count).map(|i| Slot::new(format!("slot-{i}"))).collect(),
            Self::Hosts { hosts } => hosts
                .iter()
                .map(|host| host.trim())
                .filter(|host| !host.is_empty())
                .map(Slot::from)
                .collect(),
        };

        if slots.is_empty() {
            warn!("Inventory {self:?} did not yield any slot, falling back to a single local slot");

            return vec![Slot::from(LOCALHOST)];
        }

        info!("Inventory provides {} slots", slots.len());
        slots
    }
}
