use std::fmt;
use std::time::Instant;

use crate::conn::{ConnId, ConnState, ConnTable, Queued, Record};
use crate::fdwait::{FdPool, FdWaitQueue};
use crate::macros::{fault, trace};
use crate::ready::ReadyQueue;
use crate::stage::{Stage, StepContext};
use crate::{Config, Fault, TerminateReason, Verdict};


/// The hook through which the scheduler hands torn-down connections back to
/// the I/O layer.
///
/// The I/O layer closes the client socket (or keeps it alive and spawns a new
/// connection on it after [`TerminateReason::Finished`]) and releases the
/// connection's buffers.
pub trait Teardown<C> {
    /// Called exactly once for every connection reaching
    /// [`ConnState::Terminal`].
    fn terminate(&mut self, id: ConnId, data: C, reason: TerminateReason);
}

impl<C, F> Teardown<C> for F
where
    F: FnMut(ConnId, C, TerminateReason),
{
    #[inline]
    fn terminate(&mut self, id: ConnId, data: C, reason: TerminateReason) {
        self(id, data, reason);
    }
}


/// Counters describing the work done in a single `Scheduler::run_turn`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TurnStats {
    /// Stage steps executed, including chained ones.
    pub stepped: usize,
    /// Steps executed by chaining into a cheap stage after an advance.
    pub chained: usize,
    /// Connections parked in the FD-Wait Queue.
    pub parked: usize,
    /// Connections admitted from the FD-Wait Queue.
    pub admitted: usize,
    /// Connections evicted from the FD-Wait Queue after waiting too long.
    pub evicted: usize,
    /// Connections torn down for any reason.
    pub terminated: usize,
}


/// What to do with a connection after one of its steps.
enum Next {
    Chain,
    Done,
    Terminate(TerminateReason),
}


/// The per-worker connection scheduler.
///
/// A [`Scheduler`] owns the worker's Ready Queue, FD-Wait Queue, descriptor
/// pool, and the records of all live connections. It is driven by the
/// worker's event loop, which interleaves calls to `Scheduler::run_turn`
/// with blocking on I/O readiness:
///
/// 1. `run_turn` drains the Ready Queue and steps every drained connection
///    once, following each stage's [`Verdict`]. Connections re-queued during
///    the turn only run again on the next one.
/// 2. Parked connections are admitted for every descriptor slot released
///    during the turn, oldest first, and appended to the tail of the Ready
///    Queue.
/// 3. The event loop blocks on I/O and reports readiness via
///    `Scheduler::readable`/`Scheduler::writable`, closed descriptors via
///    `Scheduler::release_fds`, and vanished clients via
///    `Scheduler::disconnect`.
///
/// Schedulers share no state with each other. Run one per worker thread or
/// process.
pub struct Scheduler<C, T> {
    config: Config,
    stages: Vec<Box<dyn Stage<C>>>,
    teardown: T,
    table: ConnTable<C>,
    ready: ReadyQueue,
    fd_wait: FdWaitQueue,
    pool: FdPool,
    /// Descriptor slots freed since the last admission pass.
    released: usize,
}

impl<C, T: Teardown<C>> Scheduler<C, T> {
    /// Creates a scheduler running connections through `stages` in order.
    ///
    /// Connections advancing past the final stage finish successfully.
    #[must_use]
    pub fn new(config: Config, stages: Vec<Box<dyn Stage<C>>>, teardown: T) -> Self {
        Self {
            pool: FdPool::new(config.fd_capacity),
            config,
            stages,
            teardown,
            table: ConnTable::new(),
            ready: ReadyQueue::new(),
            fd_wait: FdWaitQueue::new(),
            released: 0,
        }
    }

    /// Returns the configuration of this scheduler.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the teardown hook.
    #[inline]
    #[must_use]
    pub fn teardown(&self) -> &T {
        &self.teardown
    }

    /// Returns the teardown hook for modification.
    #[inline]
    #[must_use]
    pub fn teardown_mut(&mut self) -> &mut T {
        &mut self.teardown
    }

    /// Returns the descriptor pool of this worker.
    #[inline]
    #[must_use]
    pub fn pool(&self) -> &FdPool {
        &self.pool
    }

    /// Returns the number of live connections.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Tests whether there are no live connections.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Returns the number of connections waiting for their next turn.
    #[inline]
    #[must_use]
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    /// Returns the number of connections parked in the FD-Wait Queue.
    #[inline]
    #[must_use]
    pub fn parked_len(&self) -> usize {
        self.fd_wait.len()
    }

    /// Tests whether the next turn has nothing to do, so the event loop may
    /// block on I/O indefinitely.
    #[inline]
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.ready.is_empty() && (self.fd_wait.is_empty() || self.released == 0)
    }

    /// Returns the scheduler-visible state of a connection.
    ///
    /// Connections that were torn down are [`ConnState::Terminal`].
    #[must_use]
    pub fn state(&self, id: ConnId) -> ConnState {
        self.table.get(id).map_or(ConnState::Terminal, Record::state)
    }

    /// Returns the record of a live connection.
    #[inline]
    #[must_use]
    pub fn get(&self, id: ConnId) -> Option<&Record<C>> {
        self.table.get(id)
    }

    /// Returns the state of a live connection for modification.
    #[inline]
    #[must_use]
    pub fn data_mut(&mut self, id: ConnId) -> Option<&mut C> {
        self.table.get_mut(id).map(|r| &mut r.data)
    }

    /// Adds a new connection to this worker. It starts at the first stage
    /// and runs on the next turn.
    pub fn spawn(&mut self, data: C) -> ConnId {
        let id = self.table.insert(data);
        let record = self.table.get_mut(id).expect("inserted connection should be live");
        self.ready.enqueue(id, &mut record.queued);
        tracing::debug!(conn = %id, live = self.table.len(), "connection spawned");
        id
    }

    /// Reports that the connection's socket became readable.
    ///
    /// Returns whether the connection was newly queued. Connections that are
    /// already queued, or parked in the FD-Wait Queue, stay where they are.
    ///
    /// # Errors
    /// Fails with [`Fault::Terminated`] if the connection was torn down.
    #[inline]
    pub fn readable(&mut self, id: ConnId) -> Result<bool, Fault> {
        self.wake(id)
    }

    /// Reports that the connection's socket became writable.
    ///
    /// See `Scheduler::readable` for details.
    ///
    /// # Errors
    /// Fails with [`Fault::Terminated`] if the connection was torn down.
    #[inline]
    pub fn writable(&mut self, id: ConnId) -> Result<bool, Fault> {
        self.wake(id)
    }

    fn wake(&mut self, id: ConnId) -> Result<bool, Fault> {
        let record = self.table.get_mut(id).ok_or(Fault::Terminated(id))?;
        match record.state {
            ConnState::Runnable => Ok(self.ready.enqueue(id, &mut record.queued)),
            // Parked connections see the data once they are admitted
            ConnState::Parked => Ok(false),
            ConnState::Running | ConnState::Terminal => {
                Err(Fault::NotRunnable { conn: id, state: record.state })
            },
        }
    }

    /// Reports that `n` descriptors taken via `StepContext::acquire_fd` were
    /// closed. Parked connections are admitted for the freed slots at the end
    /// of the next turn.
    ///
    /// # Errors
    /// Releasing more descriptors than are in use fails with
    /// [`Fault::OverRelease`]. The surplus is ignored.
    pub fn release_fds(&mut self, n: usize) -> Result<(), Fault> {
        let freed = match self.pool.release(n) {
            Ok(()) => n,
            Err(e @ Fault::OverRelease(surplus)) => {
                let error: &dyn std::error::Error = &e;
                tracing::error!(error, released = n, "descriptor accounting is off");
                self.released += n - surplus;
                return Err(e);
            },
            Err(e) => return Err(e),
        };
        self.released += freed;
        trace!(freed, in_use = self.pool.in_use(), waiters = self.fd_wait.len(), "descriptors released");
        Ok(())
    }

    /// Tears down a connection whose client went away, wherever it is
    /// queued. The teardown hook is called with
    /// [`TerminateReason::Disconnected`].
    ///
    /// # Errors
    /// Fails with [`Fault::Terminated`] if the connection was already torn
    /// down.
    pub fn disconnect(&mut self, id: ConnId) -> Result<(), Fault> {
        if self.table.get(id).is_none() {
            return Err(Fault::Terminated(id));
        }
        self.terminate(id, TerminateReason::Disconnected);
        Ok(())
    }

    /// Runs one scheduler turn and returns what was done.
    ///
    /// Every connection in the Ready Queue is stepped once, in FIFO order.
    /// Connections advancing into a cheap stage may run up to
    /// [`Config::max_chain`] steps. Afterwards, waiters are admitted for
    /// every descriptor slot freed since the previous turn, and connections
    /// still parked longer than [`Config::max_fd_wait`] are evicted.
    pub fn run_turn(&mut self) -> TurnStats {
        let mut stats = TurnStats::default();
        let batch = self.ready.drain();
        trace!(batch = batch.len(), "turn started");

        for id in batch {
            let Some(record) = self.table.get_mut(id) else {
                // Connections are purged from the Ready Queue when they terminate
                fault!(Fault::Terminated(id), id);
                continue;
            };
            record.queued.remove(Queued::READY);
            if record.state != ConnState::Runnable {
                let f = fault!(Fault::NotRunnable { conn: id, state: record.state }, id);
                self.terminate(id, TerminateReason::Fault(f));
                stats.terminated += 1;
                continue;
            }
            self.run_conn(id, &mut stats);
        }

        self.admit_waiters(&mut stats);
        self.evict_expired(&mut stats);
        stats
    }

    /// Steps a single connection, chaining into cheap stages where allowed.
    fn run_conn(&mut self, id: ConnId, stats: &mut TurnStats) {
        let max_chain = usize::from(self.config.max_chain.get());
        let mut steps = 0;
        loop {
            steps += 1;
            stats.stepped += 1;
            match self.step(id, steps < max_chain, stats) {
                Next::Chain => stats.chained += 1,
                Next::Done => return,
                Next::Terminate(reason) => {
                    self.terminate(id, reason);
                    stats.terminated += 1;
                    return;
                },
            }
        }
    }

    fn step(&mut self, id: ConnId, may_chain: bool, stats: &mut TurnStats) -> Next {
        let Some(record) = self.table.get_mut(id) else {
            return Next::Done;
        };
        let Some(stage) = self.stages.get_mut(record.stage) else {
            // Advancing past the final stage completes the pipeline
            return Next::Terminate(TerminateReason::Finished);
        };

        let span = tracing::debug_span!("conn_step", conn = %id, stage = stage.name());
        let _enter = span.enter();
        record.state = ConnState::Running;
        let mut cx = StepContext {
            id,
            stage: record.stage,
            data: &mut record.data,
            reservation: &mut record.reservation,
            admitted: record.admitted.take(),
            pool: &mut self.pool,
            waiters: self.fd_wait.len(),
        };
        let verdict = stage.step(&mut cx);
        record.state = ConnState::Runnable;
        trace!(verdict = verdict.name(), "stage stepped");

        match verdict {
            Verdict::Advance => {
                record.stage += 1;
                match self.stages.get(record.stage) {
                    None => Next::Terminate(TerminateReason::Finished),
                    Some(next) if may_chain && next.is_cheap() => Next::Chain,
                    Some(_) => {
                        self.ready.enqueue(id, &mut record.queued);
                        Next::Done
                    },
                }
            },
            Verdict::Yield => {
                self.ready.enqueue(id, &mut record.queued);
                Next::Done
            },
            Verdict::AwaitFd(request) if record.reservation => {
                // A slot is already set aside, parking would only waste it
                tracing::debug!(%request, "stage awaits a descriptor it has reserved");
                self.ready.enqueue(id, &mut record.queued);
                Next::Done
            },
            Verdict::AwaitFd(request) => {
                tracing::debug!(%request, waiters = self.fd_wait.len(), "connection parked");
                match self.fd_wait.park(id, &mut record.queued, request) {
                    Ok(()) => {
                        record.state = ConnState::Parked;
                        stats.parked += 1;
                        Next::Done
                    },
                    Err(f) => Next::Terminate(TerminateReason::Fault(fault!(f, id))),
                }
            },
            Verdict::Finished => Next::Terminate(TerminateReason::Finished),
            Verdict::Failed(failure) => {
                let error: &dyn std::error::Error = &failure;
                tracing::debug!(error, "stage failed");
                Next::Terminate(TerminateReason::Failed(failure))
            },
        }
    }

    fn evict_expired(&mut self, stats: &mut TurnStats) {
        let Some(max_wait) = self.config.max_fd_wait else { return };
        for (id, request) in self.fd_wait.evict_expired(Instant::now(), max_wait) {
            tracing::info!(conn = %id, %request, ?max_wait, "evicting connection from FD-Wait Queue");
            if let Some(record) = self.table.get_mut(id) {
                record.queued.remove(Queued::PARKED);
            }
            self.terminate(id, TerminateReason::FdWaitTimeout);
            stats.evicted += 1;
            stats.terminated += 1;
        }
    }

    fn admit_waiters(&mut self, stats: &mut TurnStats) {
        let freed = std::mem::take(&mut self.released);
        if freed == 0 || self.fd_wait.is_empty() {
            return;
        }

        // Slots taken by arrivals before anyone parked this turn are gone
        let count = freed.min(self.pool.available());
        for (id, request) in self.fd_wait.on_resource_released(count) {
            let Some(record) = self.table.get_mut(id) else {
                // Connections are purged from the FD-Wait Queue when they terminate
                fault!(Fault::Terminated(id), id);
                continue;
            };
            record.queued.remove(Queued::PARKED);
            record.state = ConnState::Runnable;
            record.reservation = self.pool.reserve(1) == 1;
            debug_assert!(record.reservation, "admitted connection should get a slot");
            tracing::debug!(conn = %id, %request, "connection admitted");
            record.admitted = Some(request);
            self.ready.enqueue(id, &mut record.queued);
            stats.admitted += 1;
        }
    }

    /// Removes a connection from every scheduling structure and hands it to
    /// the teardown hook.
    fn terminate(&mut self, id: ConnId, reason: TerminateReason) {
        let Some(record) = self.table.get_mut(id) else { return };
        if record.queued.contains(Queued::READY) {
            self.ready.remove(id, &mut record.queued);
        }
        if record.queued.contains(Queued::PARKED) {
            self.fd_wait.remove(id, &mut record.queued);
        }
        if record.reservation {
            self.pool.unreserve();
            self.released += 1;
        }

        let Some(record) = self.table.remove(id) else { return };
        tracing::debug!(conn = %id, %reason, live = self.table.len(), "connection terminated");
        self.teardown.terminate(id, record.data, reason);
    }
}

impl<C, T> fmt::Debug for Scheduler<C, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let stages: Vec<_> = self.stages.iter().map(|s| s.name()).collect();
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("stages", &stages)
            .field("live", &self.table.len())
            .field("ready", &self.ready.len())
            .field("parked", &self.fd_wait.len())
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}
