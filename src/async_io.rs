use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::fdwait::FdExhausted;
use crate::macros::trace;
use crate::Config;


/// The error returned by `FdPool::acquire` after the pool was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("descriptor pool is closed")]
pub struct PoolClosed;


#[derive(Debug)]
struct PoolInner {
    capacity: NonZeroUsize,
    slots: Arc<Semaphore>,
    /// Tasks currently suspended in `FdPool::acquire`.
    waiting: AtomicUsize,
}

/// Counts a task as waiting for as long as it is alive.
struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn new(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::Relaxed);
        Self(count)
    }
}

impl Drop for Waiting<'_> {
    #[inline]
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}


/// A worker's pool of file descriptor slots for task-based servers.
///
/// This is the `async` counterpart of the FD-Wait Queue, backed by a fair
/// [`Semaphore`]. A task that finds the pool exhausted parks in
/// `FdPool::acquire` until a [`FdPermit`] is dropped elsewhere, and parked
/// tasks are admitted in the order in which they started waiting. Released
/// slots go to parked tasks first, so `FdPool::try_acquire` never overtakes
/// them.
///
/// Cloning an [`FdPool`] yields another handle to the same pool.
#[derive(Debug, Clone)]
pub struct FdPool(Arc<PoolInner>);

impl FdPool {
    /// Creates a pool of `capacity` free slots.
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self(Arc::new(PoolInner {
            capacity,
            slots: Arc::new(Semaphore::new(capacity.get())),
            waiting: AtomicUsize::new(0),
        }))
    }

    /// Returns the total number of slots.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.0.capacity.get()
    }

    /// Returns the number of free slots.
    #[inline]
    #[must_use]
    pub fn available(&self) -> usize {
        self.0.slots.available_permits()
    }

    /// Returns the number of slots held by permits, including slots handed
    /// to parked tasks that have not resumed yet.
    #[inline]
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.capacity().saturating_sub(self.available())
    }

    /// Returns the number of tasks waiting for a slot.
    #[inline]
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.0.waiting.load(Ordering::Relaxed)
    }

    /// Takes a slot without waiting.
    ///
    /// # Errors
    /// Fails with [`FdExhausted`] if no slot is free, other tasks are already
    /// waiting for one, or the pool is closed.
    pub fn try_acquire(&self) -> Result<FdPermit, FdExhausted> {
        match self.0.slots.clone().try_acquire_owned() {
            Ok(permit) => Ok(FdPermit(permit)),
            Err(_) => Err(FdExhausted { in_use: self.in_use(), waiters: self.waiters() }),
        }
    }

    /// Takes a slot, waiting for one to be released if necessary.
    ///
    /// Waiters are served in FIFO order. Dropping the returned future gives
    /// up the caller's place in line.
    ///
    /// # Errors
    /// Fails with [`PoolClosed`] once `FdPool::close` was called, including
    /// for tasks that were already waiting.
    pub async fn acquire(&self) -> Result<FdPermit, PoolClosed> {
        if let Ok(permit) = self.0.slots.clone().try_acquire_owned() {
            return Ok(FdPermit(permit));
        }

        let _waiting = Waiting::new(&self.0.waiting);
        trace!(waiters = self.waiters(), "waiting for a descriptor slot");
        match self.0.slots.clone().acquire_owned().await {
            Ok(permit) => Ok(FdPermit(permit)),
            Err(_) => Err(PoolClosed),
        }
    }

    /// Closes the pool. Waiting and future calls to `FdPool::acquire` fail,
    /// while existing permits stay valid.
    pub fn close(&self) {
        tracing::debug!(waiters = self.waiters(), "closing descriptor pool");
        self.0.slots.close();
    }

    /// Tests whether the pool was closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.slots.is_closed()
    }
}


/// A descriptor slot taken from an [`FdPool`]. The slot is returned when the
/// permit is dropped, so keep it alongside the descriptor it stands for.
#[derive(Debug)]
#[must_use = "dropping the permit releases the slot immediately"]
pub struct FdPermit(OwnedSemaphorePermit);


/// The scheduling state of one `async` worker: its descriptor pool and the
/// set of live connection tasks.
///
/// Each connection is an independent task spawned through `Worker::spawn`.
/// Tasks yield at every `.await`, and waiting for a descriptor is simply
/// `FdPool::acquire`. Workers share nothing, so run one per runtime thread.
#[derive(Debug)]
pub struct Worker {
    pool: FdPool,
    conns: TaskTracker,
}

impl Worker {
    /// Creates a worker with a pool of [`Config::fd_capacity`] slots.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self { pool: FdPool::new(config.fd_capacity), conns: TaskTracker::new() }
    }

    /// Returns the descriptor pool of this worker.
    #[inline]
    #[must_use]
    pub fn pool(&self) -> &FdPool {
        &self.pool
    }

    /// Spawns a connection task on the current runtime. The connection
    /// counts as live until the task completes.
    ///
    /// # Panics
    /// Panics if called outside of a tokio runtime.
    pub fn spawn<F>(&self, conn: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.conns.spawn(conn)
    }

    /// Returns the number of live connection tasks.
    #[inline]
    #[must_use]
    pub fn live(&self) -> usize {
        self.conns.len()
    }

    /// Waits for every live connection task to complete.
    ///
    /// Stop accepting new connections before awaiting this.
    pub async fn shutdown(self) {
        tracing::debug!(
            live = self.conns.len(), waiters = self.pool.waiters(),
            "waiting for connections to finish",
        );
        self.conns.close();
        self.conns.wait().await;
    }
}
