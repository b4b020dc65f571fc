use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Default)]
struct InFlight {
    count: Mutex<usize>,
    drained: Condvar,
}

/// decrements the counter even if the task panics
struct Guard(Arc<InFlight>);

impl Drop for Guard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count -= 1;

        if *count == 0 {
            self.0.drained.notify_all();
        }
    }
}

/// Fixed size pool that executes jobs handed over by the dequeue loop
pub struct WorkerPool {
    pool: ThreadPool,
    in_flight: Arc<InFlight>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self, ThreadPoolBuildError> {
        let size = size.max(1);
        debug!("Starting worker pool with {size} threads");

        let pool = ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|index| format!("agent-worker-{index}"))
            .panic_handler(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|message| message.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| String::from("unknown panic"));

                error!("Worker panicked: {message}");
            })
            .build()?;

        Ok(Self {
            pool,
            in_flight: Arc::new(InFlight::default()),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// number of submitted tasks that have not finished yet
    pub fn in_flight(&self) -> usize {
        *self.in_flight.count.lock()
    }

    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.in_flight.count.lock() += 1;
        let guard = Guard(Arc::clone(&self.in_flight));

        self.pool.spawn(move || {
            let _guard = guard;
            task();
        });
    }

    /// block until every submitted task has finished
    pub fn wait(&self) {
        let mut count = self.in_flight.count.lock();

        while *count > 0 {
            self.in_flight.drained.wait(&mut count);
        }
    }
}
