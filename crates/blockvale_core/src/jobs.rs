use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use tracing::info;

pub struct JobSystem {
    pool: ThreadPool,
}

/// Cores minus one for the thread that owns the graphics context, kept within 2..=8.
pub fn default_worker_threads() -> usize {
    let available = std::thread::available_parallelism()
        .map(|parallelism| parallelism.get())
        .unwrap_or(4);
    available.saturating_sub(1).max(2).min(8)
}

/// Runs `job`, returning the panic message instead of unwinding.
pub fn catch_job<T>(job: impl FnOnce() -> T) -> Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(job)).map_err(|payload| panic_message(payload.as_ref()))
}

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl JobSystem {
    pub fn new(num_threads: Option<usize>, name: &str) -> Result<Self, ThreadPoolBuildError> {
        let count = num_threads
            .filter(|count| *count > 0)
            .unwrap_or_else(default_worker_threads);
        let prefix = name.to_string();
        let pool = ThreadPoolBuilder::new()
            .num_threads(count)
            .thread_name(move |index| format!("{prefix}-{index}"))
            .build()?;

        info!("Started {name} pool with {count} thread(s)");
        Ok(Self { pool })
    }

    pub fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.spawn(job);
    }

    pub fn thread_count(&self) -> usize {
        self.pool.current_num_threads()
    }
}
