use crate::{inventory::InventoryConfig, launch::LaunchMethod};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::Error,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: Error,
    },
    #[error("Config file is not valid")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// size of the execution worker pool
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub launch: LaunchConfig,
    #[serde(default)]
    pub inventory: InventoryConfig,
    #[serde(default)]
    pub intervals: Intervals,
    /// consecutive failed monitor passes before the monitor gives up
    #[serde(default = "default_max_failed_polls")]
    pub max_failed_polls: u32,
    /// base directory, the pilot works in `<work_dir>/<pilot id>`
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// defaults to the pilot directory
    #[serde(default)]
    pub machine_file_dir: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LaunchConfig {
    #[serde(default = "default_launch_method")]
    pub method: LaunchMethod,
    #[serde(default = "default_mpirun")]
    pub mpirun: String,
    #[serde(default = "default_aprun")]
    pub aprun: String,
    #[serde(default = "default_ssh")]
    pub ssh: String,
    /// check that the requested method actually works before using it
    #[serde(default = "default_probe")]
    pub probe: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Intervals {
    /// pause of the dequeue loop when no slot is free or the queue was empty
    #[serde(default = "default_dequeue_idle")]
    pub dequeue_idle_ms: u64,
    /// upper bound for a single blocking pop
    #[serde(default = "default_dequeue_timeout")]
    pub dequeue_timeout_ms: u64,
    #[serde(default = "default_monitor_period")]
    pub monitor_period_ms: u64,
    /// delay before a job that did not fit is pushed back onto the queue
    #[serde(default = "default_requeue_delay")]
    pub requeue_delay_ms: u64,
}

impl Intervals {
    pub fn dequeue_idle(&self) -> Duration {
        Duration::from_millis(self.dequeue_idle_ms)
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    pub fn monitor_period(&self) -> Duration {
        Duration::from_millis(self.monitor_period_ms)
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            launch: LaunchConfig::default(),
            inventory: InventoryConfig::default(),
            intervals: Intervals::default(),
            max_failed_polls: default_max_failed_polls(),
            work_dir: default_work_dir(),
            machine_file_dir: None,
        }
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            method: default_launch_method(),
            mpirun: default_mpirun(),
            aprun: default_aprun(),
            ssh: default_ssh(),
            probe: default_probe(),
        }
    }
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            dequeue_idle_ms: default_dequeue_idle(),
            dequeue_timeout_ms: default_dequeue_timeout(),
            monitor_period_ms: default_monitor_period(),
            requeue_delay_ms: default_requeue_delay(),
        }
    }
}

impl AgentConfig {
    /// load a YAML config file, or the defaults if no file is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigErrors> {
        match path {
            Some(path) => {
                let content = fs::read_to_string(path).map_err(|source| ConfigErrors::Read {
                    path: path.to_path_buf(),
                    source,
                })?;

                Self::from_yaml(&content)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Validate the whole config at once and report every problem instead of
    /// stopping at the first one. Returns `true` if an error was found.
    pub fn preflight_checks(&mut self) -> bool {
        let mut contains_error = false;

        if self.threads == 0 {
            error!("threads must be at least 1");
            contains_error = true;
        }

        if self.max_failed_polls == 0 {
            error!("max_failed_polls must be at least 1");
            contains_error = true;
        }

        for (name, value) in [
            ("intervals.dequeue_timeout_ms", self.intervals.dequeue_timeout_ms),
            ("intervals.monitor_period_ms", self.intervals.monitor_period_ms),
        ] {
            if value == 0 {
                error!("{name} cannot be 0");
                contains_error = true;
            }
        }

        for (name, value) in [
            ("launch.mpirun", &self.launch.mpirun),
            ("launch.aprun", &self.launch.aprun),
            ("launch.ssh", &self.launch.ssh),
        ] {
            if value.trim().is_empty() {
                error!("{name} must name an executable");
                contains_error = true;
            }
        }

        match self.inventory {
            InventoryConfig::Slots { count: 0 } => {
                warn!("inventory.slots.count is 0, falling back to a single local slot");
            }
            InventoryConfig::Hosts { ref hosts } if hosts.is_empty() => {
                warn!("inventory.hosts is empty, falling back to a single local slot");
            }
            _ => {}
        }

        if self.launch.method == LaunchMethod::Aprun
            && !matches!(self.inventory, InventoryConfig::Slots { .. })
        {
            warn!("aprun places processes itself, consider `inventory: {{slots: {{count: <nodes>}}}}`");
        }

        if self.work_dir.as_os_str().is_empty() {
            warn!("work_dir is empty, using the current directory");
            self.work_dir = default_work_dir();
        }

        contains_error
    }

    pub fn pilot_dir(&self, pilot_id: &str) -> PathBuf {
        self.work_dir.join(pilot_id)
    }
}

fn default_threads() -> usize {
    4
}

fn default_max_failed_polls() -> u32 {
    3
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_launch_method() -> LaunchMethod {
    LaunchMethod::Ssh
}

fn default_mpirun() -> String {
    String::from("mpirun")
}

fn default_aprun() -> String {
    String::from("aprun")
}

fn default_ssh() -> String {
    String::from("ssh")
}

fn default_probe() -> bool {
    true
}

fn default_dequeue_idle() -> u64 {
    3_000
}

fn default_dequeue_timeout() -> u64 {
    120_000
}

fn default_monitor_period() -> u64 {
    5_000
}

fn default_requeue_delay() -> u64 {
    1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let config = AgentConfig::load(None).unwrap();

        assert_eq!(config.threads, 4);
        assert_eq!(config.max_failed_polls, 3);
        assert_eq!(config.launch.method, LaunchMethod::Ssh);
        assert_eq!(config.inventory, InventoryConfig::Local);
        assert_eq!(config.intervals.dequeue_idle(), Duration::from_secs(3));
        assert_eq!(config.intervals.dequeue_timeout(), Duration::from_secs(120));
        assert_eq!(config.intervals.monitor_period(), Duration::from_secs(5));
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = AgentConfig::from_yaml(
            "threads: 8\nlaunch:\n  method: mpirun\n  mpirun: /opt/mpi/bin/mpirun\ninventory:\n  hosts:\n    hosts: [node1, node1, node2]\n",
        )
        .unwrap();

        assert_eq!(config.threads, 8);
        assert_eq!(config.launch.method, LaunchMethod::Mpirun);
        assert_eq!(config.launch.mpirun, "/opt/mpi/bin/mpirun");
        assert_eq!(config.launch.aprun, "aprun");
        assert_eq!(
            config.inventory,
            InventoryConfig::Hosts {
                hosts: vec!["node1".into(), "node1".into(), "node2".into()]
            }
        );
        assert_eq!(config.intervals, Intervals::default());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(AgentConfig::from_yaml("thread: 8\n").is_err());
    }

    #[test]
    fn preflight_reports_errors() {
        let mut config = AgentConfig::default();
        assert!(!config.preflight_checks());

        config.threads = 0;
        config.launch.mpirun = String::new();
        assert!(config.preflight_checks());
    }
}
