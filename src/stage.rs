use std::fmt;

use crate::conn::ConnId;
use crate::fdwait::{FdExhausted, FdPool, FdRequest};
use crate::Verdict;


/// A single stage of the request-processing pipeline.
///
/// The scheduler calls `Stage::step` once per turn for every connection
/// currently at this stage. Each call performs one bounded unit of work and
/// must not block the worker thread. Blocking operations have to be split
/// into several non-blocking steps, and a missing descriptor slot is reported
/// as [`Verdict::AwaitFd`] instead of failing.
///
/// Stages have no access to queue membership. Everything they want the
/// scheduler to do goes through the returned [`Verdict`].
pub trait Stage<C> {
    /// Returns a name for the stage, used in log events.
    fn name(&self) -> &str;

    /// Tests whether the stage is guaranteed to be cheap and non-blocking.
    ///
    /// Connections advancing into a cheap stage run it within the same turn,
    /// up to [`Config::max_chain`](crate::Config::max_chain) stages.
    #[inline]
    fn is_cheap(&self) -> bool {
        false
    }

    /// Performs one step of work on the connection.
    fn step(&mut self, cx: &mut StepContext<'_, C>) -> Verdict;
}

impl<C, S: Stage<C> + ?Sized> Stage<C> for Box<S> {
    #[inline]
    fn name(&self) -> &str {
        (**self).name()
    }

    #[inline]
    fn is_cheap(&self) -> bool {
        (**self).is_cheap()
    }

    #[inline]
    fn step(&mut self, cx: &mut StepContext<'_, C>) -> Verdict {
        (**self).step(cx)
    }
}


/// The view of a connection handed to `Stage::step`.
pub struct StepContext<'a, C> {
    pub(crate) id: ConnId,
    pub(crate) stage: usize,
    pub(crate) data: &'a mut C,
    pub(crate) reservation: &'a mut bool,
    pub(crate) admitted: Option<FdRequest>,
    pub(crate) pool: &'a mut FdPool,
    pub(crate) waiters: usize,
}

impl<C> StepContext<'_, C> {
    /// Returns the handle of the connection being stepped.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Returns the index of the running stage in the pipeline.
    #[inline]
    #[must_use]
    pub fn stage(&self) -> usize {
        self.stage
    }

    /// Returns the connection's state.
    #[inline]
    #[must_use]
    pub fn data(&self) -> &C {
        &*self.data
    }

    /// Returns the connection's state for modification.
    #[inline]
    #[must_use]
    pub fn data_mut(&mut self) -> &mut C {
        &mut *self.data
    }

    /// Returns the request this connection was parked for, if it was
    /// admitted from the FD-Wait Queue right before this step.
    #[inline]
    #[must_use]
    pub fn admitted(&self) -> Option<&FdRequest> {
        self.admitted.as_ref()
    }

    /// Tests whether a descriptor slot is reserved for this connection, in
    /// which case `StepContext::acquire_fd` is guaranteed to succeed.
    #[inline]
    #[must_use]
    pub fn has_reservation(&self) -> bool {
        *self.reservation
    }

    /// Takes a descriptor slot from the worker's pool.
    ///
    /// This is the only way for a stage to obtain a descriptor. The slot is
    /// returned when the I/O layer reports the descriptor as closed via
    /// `Scheduler::release_fds`.
    ///
    /// # Errors
    /// Returns [`FdExhausted`] if every slot is taken or other connections
    /// are already waiting for one. The stage should then return
    /// [`Verdict::AwaitFd`].
    pub fn acquire_fd(&mut self) -> Result<(), FdExhausted> {
        self.pool.try_acquire(self.reservation, self.waiters)
    }
}

impl<C: fmt::Debug> fmt::Debug for StepContext<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("id", &self.id)
            .field("stage", &self.stage)
            .field("data", &self.data)
            .field("reservation", &self.reservation)
            .field("admitted", &self.admitted)
            .finish_non_exhaustive()
    }
}


/// A [`Stage`] implemented by a closure. Created by [`stage_fn`].
pub struct FnStage<F> {
    name: &'static str,
    cheap: bool,
    f: F,
}

impl<F> FnStage<F> {
    /// Marks the stage as cheap, see `Stage::is_cheap`.
    #[inline]
    #[must_use]
    pub fn cheap(mut self) -> Self {
        self.cheap = true;
        self
    }

    /// Boxes the stage for use in a pipeline.
    #[inline]
    #[must_use]
    pub fn into_boxed<C>(self) -> Box<dyn Stage<C>>
    where
        F: FnMut(&mut StepContext<'_, C>) -> Verdict + 'static,
    {
        Box::new(self)
    }
}

impl<F> fmt::Debug for FnStage<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FnStage")
            .field("name", &self.name)
            .field("cheap", &self.cheap)
            .finish_non_exhaustive()
    }
}

impl<C, F> Stage<C> for FnStage<F>
where
    F: FnMut(&mut StepContext<'_, C>) -> Verdict,
{
    #[inline]
    fn name(&self) -> &str {
        self.name
    }

    #[inline]
    fn is_cheap(&self) -> bool {
        self.cheap
    }

    #[inline]
    fn step(&mut self, cx: &mut StepContext<'_, C>) -> Verdict {
        (self.f)(cx)
    }
}

/// Wraps a closure into a [`Stage`].
#[inline]
pub fn stage_fn<C, F>(name: &'static str, f: F) -> FnStage<F>
where
    F: FnMut(&mut StepContext<'_, C>) -> Verdict,
{
    FnStage { name, cheap: false, f }
}


#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::fdwait::Purpose;

    fn context<'a>(
        data: &'a mut u32,
        reservation: &'a mut bool,
        pool: &'a mut FdPool,
        waiters: usize,
    ) -> StepContext<'a, u32> {
        StepContext {
            id: ConnId::new(0, 0), stage: 2, data, reservation,
            admitted: Some(FdRequest::new(Purpose::Socket, "backend")),
            pool, waiters,
        }
    }

    #[test]
    fn closure_stage() {
        let mut stage = stage_fn("count", |cx: &mut StepContext<'_, u32>| {
            *cx.data_mut() += 1;
            if cx.acquire_fd().is_ok() { Verdict::Advance } else { Verdict::Yield }
        }).cheap();
        assert_eq!(Stage::<u32>::name(&stage), "count");
        assert!(Stage::<u32>::is_cheap(&stage));

        let mut pool = FdPool::new(NonZeroUsize::new(1).unwrap());
        let (mut data, mut res) = (0, false);
        let mut cx = context(&mut data, &mut res, &mut pool, 0);
        assert_eq!(cx.stage(), 2);
        assert_eq!(cx.admitted().map(|r| r.purpose), Some(Purpose::Socket));
        assert_eq!(stage.step(&mut cx), Verdict::Advance);
        assert_eq!(stage.step(&mut cx), Verdict::Yield);
        assert_eq!(data, 2);
        assert_eq!(pool.in_use(), 1);
    }

    #[test]
    fn queued_waiters_block_acquire() {
        let mut pool = FdPool::new(NonZeroUsize::new(1).unwrap());
        let (mut data, mut res) = (0, false);
        let mut cx = context(&mut data, &mut res, &mut pool, 3);
        let err = cx.acquire_fd().unwrap_err();
        assert_eq!(err.waiters, 3);
        assert!(!cx.has_reservation());
    }

    #[test]
    fn boxed_stage() {
        let stage = stage_fn("boxed", |_: &mut StepContext<'_, u32>| Verdict::Finished);
        let mut boxed: Box<dyn Stage<u32>> = Box::new(stage);
        assert!(!boxed.is_cheap());

        let mut pool = FdPool::new(NonZeroUsize::new(1).unwrap());
        let (mut data, mut res) = (0, false);
        let mut cx = context(&mut data, &mut res, &mut pool, 0);
        assert_eq!(boxed.step(&mut cx), Verdict::Finished);
    }
}
