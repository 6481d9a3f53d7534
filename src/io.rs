// The I/O execution context is a fixed pool of worker threads, each driving
// its own event loop. Every connect, send, receive and timer of a client runs
// here; callers only ever park on a completion.

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::Duration,
};

use tokio::{
    runtime::{Handle, Runtime, RuntimeFlavor},
    sync::oneshot,
    task::JoinHandle,
};
use tracing::debug;
use typed_builder::TypedBuilder;

use crate::client::{Error, Result};

fn default_worker_threads() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

#[derive(Clone, Debug, TypedBuilder)]
pub struct PoolConfig {
    /// Defaults to the number of hardware threads.
    #[builder(default = default_worker_threads())]
    pub worker_threads: usize,
    #[builder(default = "dendrite-io".into(), setter(into))]
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

pub struct IoContext {
    runtime: Option<Runtime>,
    handle: Handle,
    workers: usize,
}

impl IoContext {
    pub fn new(config: PoolConfig) -> Result<Arc<Self>> {
        let workers = config.worker_threads.max(1);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name(config.thread_name)
            .enable_all()
            .build()
            .map_err(|e| Error::connection_failed(format!("I/O pool: {e}")))?;
        debug!(workers, "I/O pool started");
        Ok(Arc::new(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            workers,
        }))
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs a closure on some worker, never inline.
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn(async move { task() });
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Fires `callback` on a worker once `after` has elapsed. Aborting the
    /// returned handle disarms the timer.
    pub fn schedule_timer<F>(&self, after: Duration, callback: F) -> JoinHandle<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn(async move {
            tokio::time::sleep(after).await;
            callback()
        })
    }

    /// Drives a future to completion from a thread outside the pool.
    ///
    /// Panics when called from one of the pool's own workers.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        // the last reference may go away on a worker; never block there
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
            debug!("I/O pool stopped");
        }
    }
}

/// Parks the calling thread until `rx` resolves. Pool workers hand their
/// slot to the scheduler first so that the completion can still make
/// progress.
pub(crate) fn wait<T>(rx: oneshot::Receiver<T>) -> Option<T> {
    let parked = || futures::executor::block_on(rx).ok();
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(parked)
        }
        _ => parked(),
    }
}

static GLOBAL: Mutex<Option<Arc<IoContext>>> = Mutex::new(None);

/// Starts the process-wide pool with default settings.
pub fn global_init() -> Result<()> {
    global_init_with(PoolConfig::default())
}

/// Fails if the pool is already running.
pub fn global_init_with(config: PoolConfig) -> Result<()> {
    let mut global = GLOBAL.lock().unwrap_or_else(PoisonError::into_inner);
    if global.is_some() {
        Err(Error::invalid_argument("I/O pool is already initialized"))?
    }
    *global = Some(IoContext::new(config)?);
    Ok(())
}

/// Stops handing out the process-wide pool. Clients created from it keep
/// their reference but refuse new operations.
pub fn global_uninit() {
    let pool = GLOBAL.lock().unwrap_or_else(PoisonError::into_inner).take();
    drop(pool);
}

pub fn global() -> Result<Arc<IoContext>> {
    GLOBAL
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .ok_or_else(Error::not_initialized)
}

pub fn is_initialized() -> bool {
    GLOBAL.lock().unwrap_or_else(PoisonError::into_inner).is_some()
}
