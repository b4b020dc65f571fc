use super::LaunchMethod;
use crate::config::LaunchConfig;
use std::{
    process::{Command, Stdio},
    time::Duration,
};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_COMMAND: &str = "/bin/date";

/// Which of the optional launchers work on this host
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Availability {
    pub aprun: bool,
    pub ssh: bool,
}

impl Availability {
    /// run a trivial command through aprun and ssh to localhost
    pub fn probe(config: &LaunchConfig) -> Self {
        let availability = Self {
            aprun: succeeds(&config.aprun, &["-n", "1", PROBE_COMMAND]),
            ssh: succeeds(&config.ssh, &["localhost", PROBE_COMMAND]),
        };

        debug!(availability = ?availability, "Probed launchers");
        availability
    }
}

fn succeeds(program: &str, args: &[&str]) -> bool {
    let mut child = match Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(error) => {
            debug!("{program} is not usable: {error}");
            return false;
        }
    };

    match child.wait_timeout(PROBE_TIMEOUT) {
        Ok(Some(status)) => status.success(),
        Ok(None) => {
            warn!("{program} did not answer within {PROBE_TIMEOUT:?}, killing the probe");

            if let Err(error) = child.kill() {
                warn!("Failed to kill {program} probe: {error}");
            }
            let _ = child.wait();

            false
        }
        Err(error) => {
            warn!("Failed to wait for {program} probe: {error}");
            false
        }
    }
}

/// Pick the method actually used for launching.
///
/// aprun wins where it works and ssh doesn't, otherwise ssh remains the
/// fallback. `local` and `mpirun` are never second guessed.
pub fn resolve(requested: LaunchMethod, availability: Availability) -> LaunchMethod {
    let resolved = match requested {
        LaunchMethod::Local | LaunchMethod::Mpirun => requested,
        LaunchMethod::Aprun if availability.aprun => LaunchMethod::Aprun,
        LaunchMethod::Ssh if availability.ssh => LaunchMethod::Ssh,
        _ if availability.aprun && !availability.ssh => LaunchMethod::Aprun,
        _ => LaunchMethod::Ssh,
    };

    if resolved != requested {
        info!("Launch method {requested} is not available, using {resolved}");
    }

    resolved
}
