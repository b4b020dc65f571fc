mod common;

use common::{shell_job, FlakyStore};
use pilot_agent::{
    agent::monitor::{MonitorExit, MonitorLoop},
    config::LaunchConfig,
    executors::process::{ProcessTable, TrackedProcess},
    job::JobState,
    launch::LaunchCommand,
    pilot::{PilotId, PilotState},
    slots::{Slot, SlotPool},
    store::CoordinationStore,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tempfile::TempDir;

fn monitor(store: Arc<FlakyStore>, dequeue_finished: bool) -> (MonitorLoop, TempDir) {
    let dir = tempfile::tempdir().unwrap();

    let monitor = MonitorLoop {
        pilot: PilotId::new("bj-monitor"),
        store,
        slots: Arc::new(SlotPool::new(vec![Slot::from("localhost"); 2], dir.path())),
        processes: Arc::new(ProcessTable::new()),
        period: Duration::from_millis(10),
        max_failed_polls: 3,
        dequeue_finished: Arc::new(AtomicBool::new(dequeue_finished)),
    };

    (monitor, dir)
}

/// start `script` on one slot of the monitor's pool, like a worker would
fn launch(monitor: &MonitorLoop, dir: &TempDir, job_url: &str, script: &str) {
    let description = shell_job(job_url, script, 1);
    let allocation = monitor.slots.allocate(job_url, 1).unwrap();
    let child = LaunchCommand::build(&description, dir.path(), &LaunchConfig::default(), &allocation)
        .unwrap()
        .spawn()
        .unwrap();

    monitor
        .store
        .set_job_state(job_url, JobState::Running)
        .unwrap();
    monitor.processes.insert(
        job_url,
        TrackedProcess {
            child,
            job_id: job_url.to_string(),
            executable: description.executable,
        },
    );
}

#[test]
fn repeated_failures_stop_the_monitor() {
    let store = Arc::new(FlakyStore::failing(usize::MAX));
    let (monitor, _dir) = monitor(store, false);

    assert_eq!(monitor.run(), MonitorExit::FailStop { failures: 3 });
}

#[test]
fn a_successful_pass_resets_the_failure_count() {
    let store = Arc::new(FlakyStore::failing(0));
    store
        .set_pilot_state(&PilotId::new("bj-monitor"), PilotState::Running, false)
        .unwrap();
    store.failures.store(2, Ordering::SeqCst);

    let (monitor, _dir) = monitor(store, true);

    assert_eq!(monitor.run(), MonitorExit::Drained);
}

#[test]
fn pass_records_exit_codes_and_frees_slots() {
    let store = Arc::new(FlakyStore::failing(0));
    let (monitor, dir) = monitor(store.clone(), false);

    launch(&monitor, &dir, "job-ok", "exit 0");
    launch(&monitor, &dir, "job-bad", "exit 1");
    assert_eq!(monitor.slots.busy_count(), 2);

    let mut finished = 0;
    assert!(common::wait_until(Duration::from_secs(10), || {
        finished += monitor.pass().unwrap();
        finished == 2
    }));

    assert_eq!(store.get_job_state("job-ok").unwrap(), Some(JobState::Done));
    assert_eq!(store.get_job_state("job-bad").unwrap(), Some(JobState::Failed));
    assert_eq!(monitor.slots.busy_count(), 0);
    assert!(monitor.processes.is_empty());
}

#[test]
fn failed_state_write_keeps_the_process_for_the_next_pass() {
    let store = Arc::new(FlakyStore::failing(0));
    let (monitor, dir) = monitor(store.clone(), false);

    launch(&monitor, &dir, "job-1", "exit 0");
    assert!(common::wait_until(Duration::from_secs(10), || {
        monitor
            .processes
            .poll_finished()
            .map_or(false, |finished| !finished.is_empty())
    }));

    // state read and write of the pass both fail
    store.failures.store(2, Ordering::SeqCst);
    assert!(monitor.pass().is_err());
    assert!(monitor.processes.contains("job-1"));
    assert_eq!(monitor.slots.busy_count(), 1);

    assert_eq!(monitor.pass().unwrap(), 1);
    assert_eq!(store.get_job_state("job-1").unwrap(), Some(JobState::Done));
    assert_eq!(monitor.slots.busy_count(), 0);
}

#[test]
fn terminal_state_is_not_overwritten() {
    let store = Arc::new(FlakyStore::failing(0));
    let (monitor, dir) = monitor(store.clone(), false);

    launch(&monitor, &dir, "job-1", "exit 1");
    // finished elsewhere in the meantime
    store.set_job_state("job-1", JobState::Done).unwrap();

    assert!(common::wait_until(Duration::from_secs(10), || {
        monitor.pass().unwrap() == 1
    }));

    assert_eq!(store.get_job_state("job-1").unwrap(), Some(JobState::Done));
    assert_eq!(monitor.slots.busy_count(), 0);
}
