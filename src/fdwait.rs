use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use compact_str::CompactString;
use smallvec::SmallVec;

use crate::conn::{ConnId, Queued};
use crate::macros::trace;
use crate::Fault;


/// The kind of descriptor a parked connection is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
#[non_exhaustive]
pub enum Purpose {
    /// A regular file, e.g. a static response body or a temporary file.
    File,
    /// A pipe to or from a spawned process.
    Pipe,
    /// An outgoing socket, e.g. to a backend.
    Socket,
    /// Anything else that occupies a descriptor slot.
    Other,
}

impl fmt::Display for Purpose {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.into())
    }
}


/// A description of what a parked connection waits for.
///
/// The request is handed back to the connection's stage on its first step
/// after admission (see `StepContext::admitted`), which lets the stage
/// resume where it left off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdRequest {
    /// The kind of descriptor requested.
    pub purpose: Purpose,
    /// A free-form label for logging, such as a file path.
    pub label: CompactString,
}

impl FdRequest {
    /// Creates a new [`FdRequest`].
    #[inline]
    #[must_use]
    pub fn new(purpose: Purpose, label: impl Into<CompactString>) -> Self {
        Self { purpose, label: label.into() }
    }
}

impl fmt::Display for FdRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.label.is_empty() {
            fmt::Display::fmt(&self.purpose, f)
        } else {
            write!(f, "{} {:?}", self.purpose, self.label)
        }
    }
}


/// Connections leaving the [`FdWaitQueue`] in a single operation, oldest first.
pub type Admitted = SmallVec<[(ConnId, FdRequest); 4]>;

#[derive(Debug)]
struct Waiter {
    id: ConnId,
    request: FdRequest,
    since: Instant,
}


/// The FIFO set of connections parked until a descriptor slot frees up.
///
/// Admission is strictly in arrival order: the connection that has waited
/// longest receives the next released slot. Like the
/// [`ReadyQueue`](crate::ready::ReadyQueue), membership is tracked by a
/// marker ([`Queued::PARKED`]) on the connection itself.
#[derive(Debug, Default)]
pub struct FdWaitQueue {
    waiters: VecDeque<Waiter>,
}

impl FdWaitQueue {
    /// Creates an empty [`FdWaitQueue`].
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of parked connections.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Tests whether no connection is parked.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Returns the parked connections in admission order.
    pub fn iter(&self) -> impl ExactSizeIterator<Item = (ConnId, &FdRequest)> + '_ {
        self.waiters.iter().map(|w| (w.id, &w.request))
    }

    /// Parks `id` at the tail of the queue.
    ///
    /// # Errors
    /// A connection waits for one resource at a time. Parking a connection
    /// whose markers already contain [`Queued::PARKED`] fails with
    /// [`Fault::AlreadyParked`] and leaves the queue untouched.
    pub fn park(&mut self, id: ConnId, queued: &mut Queued, request: FdRequest) -> Result<(), Fault> {
        self.park_at(id, queued, request, Instant::now())
    }

    pub(crate) fn park_at(
        &mut self,
        id: ConnId,
        queued: &mut Queued,
        request: FdRequest,
        since: Instant,
    ) -> Result<(), Fault> {
        if queued.contains(Queued::PARKED) {
            return Err(Fault::AlreadyParked(id));
        }
        trace!(conn = %id, %request, waiters = self.waiters.len(), "parking connection");
        queued.insert(Queued::PARKED);
        self.waiters.push_back(Waiter { id, request, since });
        Ok(())
    }

    /// Pops up to `count` connections from the head of the queue.
    ///
    /// The caller is responsible for clearing their [`Queued::PARKED`]
    /// markers and resubmitting them to the Ready Queue. Released capacity
    /// exceeding the number of waiters is left for new requests.
    #[must_use = "admitted connections must be resubmitted to the Ready Queue"]
    pub fn on_resource_released(&mut self, count: usize) -> Admitted {
        let n = count.min(self.waiters.len());
        self.waiters.drain(..n).map(|w| (w.id, w.request)).collect()
    }

    /// Removes `id` from wherever it sits in the queue. This is O(n).
    ///
    /// Returns the request the connection was waiting for, if it was parked.
    /// Its [`Queued::PARKED`] marker is cleared either way.
    pub fn remove(&mut self, id: ConnId, queued: &mut Queued) -> Option<FdRequest> {
        queued.remove(Queued::PARKED);
        let pos = self.waiters.iter().position(|w| w.id == id)?;
        self.waiters.remove(pos).map(|w| w.request)
    }

    /// Pops every connection that was parked for at least `max_wait` at time
    /// `now`.
    ///
    /// Since the queue is ordered by park time, expired waiters always form
    /// a prefix of the queue.
    #[must_use = "evicted connections must be torn down"]
    pub fn evict_expired(&mut self, now: Instant, max_wait: Duration) -> Admitted {
        let n = self.waiters.iter()
            .take_while(|w| now.saturating_duration_since(w.since) >= max_wait)
            .count();
        self.waiters.drain(..n).map(|w| (w.id, w.request)).collect()
    }
}


/// The error returned when no descriptor slot can be handed out right now.
///
/// Stages react to it by returning [`Verdict::AwaitFd`](crate::Verdict::AwaitFd).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no file descriptor slot available ({in_use} in use, {waiters} waiting)")]
pub struct FdExhausted {
    /// The number of slots in use when the request failed.
    pub in_use: usize,
    /// The number of connections parked ahead of the caller.
    pub waiters: usize,
}


/// The accounting of a worker's descriptor slots.
///
/// Slots are either free, in use, or reserved for a connection that was
/// just admitted from the [`FdWaitQueue`] and has not run yet. Reservations
/// keep newly arriving connections from overtaking admitted waiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdPool {
    capacity: NonZeroUsize,
    in_use: usize,
    reserved: usize,
}

impl FdPool {
    /// Creates a pool of `capacity` free slots.
    #[inline]
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self { capacity, in_use: 0, reserved: 0 }
    }

    /// Returns the total number of slots.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Returns the number of slots in use.
    #[inline]
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Returns the number of slots reserved for admitted connections.
    #[inline]
    #[must_use]
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Returns the number of slots neither in use nor reserved.
    #[inline]
    #[must_use]
    pub fn available(&self) -> usize {
        self.capacity.get() - self.in_use - self.reserved
    }

    /// Takes one slot.
    ///
    /// A caller holding a `reservation` consumes it. Otherwise a free slot
    /// is only handed out if no connection is parked (`waiters == 0`), so
    /// arrivals never overtake the FD-Wait Queue.
    ///
    /// # Errors
    /// Returns [`FdExhausted`] if the caller has to park instead.
    pub fn try_acquire(&mut self, reservation: &mut bool, waiters: usize) -> Result<(), FdExhausted> {
        if std::mem::take(reservation) {
            debug_assert!(self.reserved > 0);
            self.reserved -= 1;
            self.in_use += 1;
            return Ok(());
        }
        if waiters == 0 && self.available() > 0 {
            self.in_use += 1;
            return Ok(());
        }
        Err(FdExhausted { in_use: self.in_use, waiters })
    }

    /// Marks up to `n` free slots as reserved, returning how many were.
    pub(crate) fn reserve(&mut self, n: usize) -> usize {
        let n = n.min(self.available());
        self.reserved += n;
        n
    }

    /// Returns a reservation that will never be used.
    pub(crate) fn unreserve(&mut self) {
        debug_assert!(self.reserved > 0);
        self.reserved = self.reserved.saturating_sub(1);
    }

    /// Returns `n` slots to the pool.
    ///
    /// # Errors
    /// Releasing more slots than are in use indicates broken accounting in
    /// the I/O layer. The surplus is ignored and reported as
    /// [`Fault::OverRelease`].
    pub fn release(&mut self, n: usize) -> Result<(), Fault> {
        if n > self.in_use {
            let surplus = n - self.in_use;
            self.in_use = 0;
            return Err(Fault::OverRelease(surplus));
        }
        self.in_use -= n;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ids, FlagMap};

    fn req(label: &str) -> FdRequest {
        FdRequest::new(Purpose::File, label)
    }

    #[test]
    fn admit_oldest_first() {
        let [x, y] = ids();
        let mut flags = FlagMap::default();
        let mut q = FdWaitQueue::new();
        q.park(x, flags.get(x), req("req1")).expect("x should not be parked");
        q.park(y, flags.get(y), req("req2")).expect("y should not be parked");

        let admitted = q.on_resource_released(1);
        assert_eq!(admitted.as_slice(), [(x, req("req1"))]);
        assert_eq!(q.iter().collect::<Vec<_>>(), [(y, &req("req2"))]);

        let admitted = q.on_resource_released(5);
        assert_eq!(admitted.as_slice(), [(y, req("req2"))]);
        assert!(q.is_empty());
        assert!(q.on_resource_released(3).is_empty());
    }

    #[test]
    fn double_park() {
        let [x] = ids();
        let mut flags = FlagMap::default();
        let mut q = FdWaitQueue::new();
        q.park(x, flags.get(x), req("a")).expect("x should not be parked");
        let res = q.park(x, flags.get(x), req("b"));
        assert!(matches!(res, Err(Fault::AlreadyParked(id)) if id == x));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn remove_parked() {
        let [x, z, y] = ids();
        let mut flags = FlagMap::default();
        let mut q = FdWaitQueue::new();
        for id in [x, z, y] {
            q.park(id, flags.get(id), req("f")).expect("connection should not be parked");
        }

        assert_eq!(q.remove(z, flags.get(z)), Some(req("f")));
        assert!(!flags.get(z).contains(Queued::PARKED));
        assert_eq!(q.remove(z, flags.get(z)), None);

        let admitted = q.on_resource_released(3);
        let admitted: Vec<_> = admitted.into_iter().map(|(id, _)| id).collect();
        assert_eq!(admitted, [x, y]);
    }

    #[test]
    fn eventually_admitted() {
        let pool: Vec<_> = (0..200).map(|i| ConnId::new(i, 1)).collect();
        let mut flags = FlagMap::default();
        let mut q = FdWaitQueue::new();
        for &id in &pool {
            q.park(id, flags.get(id), req("")).expect("connection should not be parked");
        }

        // A steady trickle of releases drains the queue in arrival order
        let mut order = Vec::with_capacity(pool.len());
        while !q.is_empty() {
            let n = fastrand::usize(0..=2);
            order.extend(q.on_resource_released(n).into_iter().map(|(id, _)| id));
        }
        assert_eq!(order, pool);
    }

    #[test]
    fn evict_prefix() {
        let [a, b, c] = ids();
        let mut flags = FlagMap::default();
        let mut q = FdWaitQueue::new();
        let t0 = Instant::now();
        q.park_at(a, flags.get(a), req("a"), t0).expect("a should not be parked");
        q.park_at(b, flags.get(b), req("b"), t0 + Duration::from_secs(5)).expect("b should not be parked");
        q.park_at(c, flags.get(c), req("c"), t0 + Duration::from_secs(9)).expect("c should not be parked");

        let now = t0 + Duration::from_secs(10);
        let evicted = q.evict_expired(now, Duration::from_secs(5));
        let evicted: Vec<_> = evicted.into_iter().map(|(id, _)| id).collect();
        assert_eq!(evicted, [a, b]);
        assert_eq!(q.len(), 1);
        assert!(q.evict_expired(now, Duration::from_secs(5)).is_empty());
    }

    #[test]
    fn pool_accounting() {
        let mut pool = FdPool::new(2.try_into().unwrap());
        let mut no_res = false;
        pool.try_acquire(&mut no_res, 0).expect("pool should have free slots");
        // Free slot, but someone is parked: must not overtake
        let err = pool.try_acquire(&mut no_res, 1).unwrap_err();
        assert_eq!(err, FdExhausted { in_use: 1, waiters: 1 });
        pool.try_acquire(&mut no_res, 0).expect("pool should have a free slot");
        assert!(pool.try_acquire(&mut no_res, 0).is_err());
        assert_eq!(pool.available(), 0);

        pool.release(1).expect("slot should be in use");
        assert_eq!(pool.reserve(3), 1);
        assert_eq!(pool.available(), 0);
        let mut res = true;
        pool.try_acquire(&mut res, 5).expect("reservation should always succeed");
        assert!(!res);
        assert_eq!((pool.in_use(), pool.reserved()), (2, 0));

        assert!(matches!(pool.release(3), Err(Fault::OverRelease(1))));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn display() {
        assert_eq!(req("/tmp/x").to_string(), "file \"/tmp/x\"");
        assert_eq!(FdRequest::new(Purpose::Pipe, "").to_string(), "pipe");
    }
}
