#![deny(missing_docs)]
#![deny(unsafe_code, single_use_lifetimes, unused_lifetimes)]
#![warn(keyword_idents, let_underscore_drop, unreachable_pub, unused_import_braces)]

#![deny(clippy::suspicious, clippy::cargo)]
#![deny(clippy::exit, clippy::semicolon_inside_block, clippy::unwrap_used)]
#![warn(clippy::pedantic, clippy::multiple_crate_versions)]
#![allow(clippy::enum_glob_use, clippy::items_after_statements, clippy::module_name_repetitions)]

//! Cooperative connection scheduling for single-threaded, event-driven
//! HTTP servers.
//!
//! A [`Scheduler`] owns two queues per worker: the Ready Queue
//! ([`ready::ReadyQueue`]) of connections due for another pipeline step, and
//! the FD-Wait Queue ([`fdwait::FdWaitQueue`]) of connections parked until a
//! file descriptor slot frees up. Request handling is split into
//! [`Stage`]s, each of which performs one bounded unit of work per turn and
//! reports back with a [`Verdict`].

use std::num::{NonZeroU8, NonZeroUsize};
use std::time::Duration;

mod macros;

/// Connection handles, states and the slab owning per-connection records.
pub mod conn;
/// The FD-Wait Queue and the per-worker descriptor pool.
pub mod fdwait;
/// The Ready Queue, also known as the joblist.
pub mod ready;
mod sched;
mod stage;
mod verdict;

/// A content negotiation stage probing the filesystem for extension matches.
pub mod negotiate;

/// Task-based scheduling primitives for `async` runtimes.
#[cfg(feature = "async")]
pub mod async_io;

#[cfg(test)]
mod test_support;

pub use conn::{ConnId, ConnState};
pub use fdwait::{FdExhausted, FdRequest, Purpose};
pub use sched::{Scheduler, Teardown, TurnStats};
pub use stage::{stage_fn, FnStage, Stage, StepContext};
pub use verdict::{Failure, Fault, TerminateReason, Verdict};


/// Per-worker scheduler configuration.
///
/// Only the descriptor pool size is a deployment parameter. The remaining
/// fields have defaults suitable for most servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// The number of file descriptor slots handed out to pipeline stages.
    pub fd_capacity: NonZeroUsize,
    /// The maximum number of stages a connection may run in a single turn
    /// when advancing into cheap stages.
    pub max_chain: NonZeroU8,
    /// Parked connections waiting longer than this are torn down, unless a
    /// slot freed up for them in the same turn. [`None`] lets connections
    /// wait indefinitely.
    pub max_fd_wait: Option<Duration>,
}

impl Config {
    /// The default value of [`Config::max_chain`].
    pub const DEFAULT_MAX_CHAIN: NonZeroU8 = match NonZeroU8::new(4) {
        Some(n) => n,
        None => unreachable!(),
    };

    /// Creates a [`Config`] with a pool of `fds` descriptor slots and default
    /// values for everything else.
    #[inline]
    #[must_use]
    pub fn with_fds(fds: NonZeroUsize) -> Self {
        Self { fd_capacity: fds, max_chain: Self::DEFAULT_MAX_CHAIN, max_fd_wait: None }
    }

    /// Sets [`Config::max_chain`].
    #[inline]
    #[must_use]
    pub fn with_max_chain(mut self, max_chain: NonZeroU8) -> Self {
        self.max_chain = max_chain;
        self
    }

    /// Sets [`Config::max_fd_wait`].
    #[inline]
    #[must_use]
    pub fn with_max_fd_wait(mut self, max_fd_wait: Duration) -> Self {
        self.max_fd_wait = Some(max_fd_wait);
        self
    }
}
