use crate::{
    config::LaunchConfig,
    executors::{process::ProcessTable, Dispatch, Executor, ExecutorError},
    job::{JobDescription, JobState},
    launch::LaunchMethod,
    pilot::PilotId,
    slots::{Slot, SlotPool},
    store::{memory::MemoryStore, queue_key, CoordinationStore},
};
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;

struct Fixture {
    store: Arc<MemoryStore>,
    executor: Executor,
    _dir: TempDir,
}

fn fixture(slots: usize) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::default());

    let executor = Executor {
        pilot: PilotId::new("bj-test"),
        store: Arc::clone(&store) as Arc<dyn CoordinationStore>,
        slots: Arc::new(SlotPool::new(vec![Slot::from("localhost"); slots], dir.path())),
        processes: Arc::new(ProcessTable::new()),
        launch: LaunchConfig {
            method: LaunchMethod::Local,
            probe: false,
            ..LaunchConfig::default()
        },
        pilot_dir: dir.path().to_path_buf(),
        requeue_delay: Duration::ZERO,
    };

    Fixture {
        store,
        executor,
        _dir: dir,
    }
}

fn submit(store: &MemoryStore, job_url: &str, description: &JobDescription) {
    store.set_job(job_url, &description.to_fields()).unwrap();
}

fn sleeper(job_id: &str, processes: usize) -> JobDescription {
    let mut description = JobDescription::new(job_id, "/bin/sh");
    description.arguments = vec!["-c".into(), "sleep 5".into()];
    description.number_of_processes = processes;

    description
}

fn kill_all(executor: &Executor, job_urls: &[&str]) {
    for job_url in job_urls {
        if let Some(mut process) = executor.processes.remove(job_url) {
            let _ = process.child.kill();
            let _ = process.child.wait();
        }
    }
}

#[test]
pub fn unknown_job_is_launched_and_marked_running() {
    let Fixture {
        store, executor, ..
    } = fixture(4);
    submit(&store, "job-a", &sleeper("a", 2));

    assert_eq!(executor.execute("job-a").unwrap(), Dispatch::Launched);

    assert_eq!(store.get_job_state("job-a").unwrap(), Some(JobState::Running));
    assert!(executor.processes.contains("job-a"));
    assert_eq!(executor.slots.busy_count(), 2);
    assert!(executor.slots.machine_file_path("a").exists());
    assert!(executor.pilot_dir.join("a").is_dir());

    kill_all(&executor, &["job-a"]);
}

#[test]
pub fn insufficient_slots_requeue_the_job() {
    let Fixture {
        store, executor, ..
    } = fixture(1);
    submit(&store, "job-a", &sleeper("a", 2));

    assert_eq!(executor.execute("job-a").unwrap(), Dispatch::Requeued);

    assert_eq!(store.get_job_state("job-a").unwrap(), Some(JobState::New));
    assert_eq!(store.queue_len(&queue_key(&executor.pilot)), 1);
    assert_eq!(executor.slots.busy_count(), 0);
    assert!(executor.processes.is_empty());
}

#[test]
pub fn finished_jobs_are_not_started_again() {
    let Fixture {
        store, executor, ..
    } = fixture(2);
    let mut description = sleeper("a", 1);
    description.state = JobState::Done;
    submit(&store, "job-a", &description);

    assert_eq!(
        executor.execute("job-a").unwrap(),
        Dispatch::Skipped(JobState::Done)
    );
    assert_eq!(store.get_job_state("job-a").unwrap(), Some(JobState::Done));
    assert_eq!(executor.slots.busy_count(), 0);
}

#[test]
pub fn missing_description_is_an_error() {
    let Fixture { executor, .. } = fixture(2);

    assert!(matches!(
        executor.execute("job-missing"),
        Err(ExecutorError::MissingDescription(_))
    ));
}

#[test]
pub fn spawn_failure_releases_the_slots() {
    let Fixture {
        store, executor, ..
    } = fixture(2);
    submit(
        &store,
        "job-a",
        &JobDescription::new("a", "/nonexistent/program"),
    );

    assert!(matches!(
        executor.execute("job-a"),
        Err(ExecutorError::Launch(_))
    ));

    // left in its last persisted state, not requeued
    assert_eq!(store.get_job_state("job-a").unwrap(), Some(JobState::New));
    assert_eq!(store.queue_len(&queue_key(&executor.pilot)), 0);
    assert_eq!(executor.slots.busy_count(), 0);
    assert_eq!(executor.slots.free_count(), 2);
    assert!(!executor.slots.machine_file_path("a").exists());
}

#[test]
pub fn oversized_job_is_requeued_and_stays_new() {
    let Fixture {
        store, executor, ..
    } = fixture(2);
    submit(&store, "job-a", &sleeper("a", 3));

    assert_eq!(executor.execute("job-a").unwrap(), Dispatch::Requeued);

    assert!(!executor.slots.fits(3));
    assert_eq!(store.get_job_state("job-a").unwrap(), Some(JobState::New));
    assert_eq!(store.queue_len(&queue_key(&executor.pilot)), 1);
    assert_eq!(executor.slots.busy_count(), 0);
}

#[test]
pub fn similar_job_ids_run_side_by_side() {
    let Fixture {
        store, executor, ..
    } = fixture(4);
    submit(&store, "job-a", &sleeper("run/1", 1));
    submit(&store, "job-b", &sleeper("run_1", 1));

    assert_eq!(executor.execute("job-a").unwrap(), Dispatch::Launched);
    assert_eq!(executor.execute("job-b").unwrap(), Dispatch::Launched);

    assert_eq!(executor.slots.busy_count(), 2);
    assert_eq!(store.get_job_state("job-b").unwrap(), Some(JobState::Running));

    kill_all(&executor, &["job-a", "job-b"]);
}

#[test]
pub fn duplicate_job_id_waits_for_the_running_one() {
    let Fixture {
        store, executor, ..
    } = fixture(4);
    submit(&store, "job-a", &sleeper("shared", 1));
    submit(&store, "job-b", &sleeper("shared", 1));

    assert_eq!(executor.execute("job-a").unwrap(), Dispatch::Launched);
    assert_eq!(executor.execute("job-b").unwrap(), Dispatch::Requeued);

    assert_eq!(store.get_job_state("job-b").unwrap(), Some(JobState::New));
    assert_eq!(store.queue_len(&queue_key(&executor.pilot)), 1);
    assert_eq!(executor.slots.busy_count(), 1);

    kill_all(&executor, &["job-a"]);
}
