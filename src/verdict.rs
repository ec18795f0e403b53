use std::fmt;

use compact_str::CompactString;

use crate::conn::ConnId;
use crate::fdwait::FdRequest;


/// The outcome of a single stage step, telling the scheduler what to do with
/// the connection next.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "the scheduler needs the verdict to make progress"]
pub enum Verdict {
    /// The current stage is done. The connection moves on to the next stage,
    /// either immediately or on its next turn.
    Advance,
    /// Give up the rest of this turn and run the same stage again on the next
    /// one.
    Yield,
    /// Park the connection until a descriptor slot is available. The stage
    /// runs again after admission and receives the request back through
    /// `StepContext::admitted`.
    AwaitFd(FdRequest),
    /// The pipeline completed successfully.
    Finished,
    /// The pipeline failed. The connection is torn down, with an error
    /// response if the I/O layer can still send one.
    Failed(Failure),
}

impl Verdict {
    /// Returns a short name for the verdict, for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Advance => "advance",
            Self::Yield => "yield",
            Self::AwaitFd(_) => "await-fd",
            Self::Finished => "finished",
            Self::Failed(_) => "failed",
        }
    }
}


/// A terminal pipeline error of a single connection.
///
/// Carries the HTTP status code the I/O layer should respond with, if the
/// response has not been started yet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (status {status})")]
pub struct Failure {
    status: u16,
    message: CompactString,
}

impl Failure {
    /// Creates a [`Failure`] with status `500 Internal Server Error`.
    #[inline]
    #[must_use]
    pub fn new(message: impl Into<CompactString>) -> Self {
        Self::with_status(500, message)
    }

    /// Creates a [`Failure`] with a custom HTTP status.
    ///
    /// Status codes outside of `100..=999` are replaced with
    /// `500 Internal Server Error`.
    #[must_use]
    pub fn with_status(status: u16, message: impl Into<CompactString>) -> Self {
        let message = message.into();
        if !(100..1000).contains(&status) {
            tracing::warn!(status, %message, "invalid HTTP status code, using 500");
            return Self { status: 500, message };
        }
        Self { status, message }
    }

    /// Returns the HTTP status code as a number.
    #[inline]
    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.status
    }

    /// Returns the HTTP status code.
    #[cfg(feature = "http")]
    #[must_use]
    pub fn status(&self) -> http::StatusCode {
        http::StatusCode::from_u16(self.status)
            .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Returns the error message.
    #[inline]
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(feature = "http")]
impl From<http::StatusCode> for Failure {
    #[inline]
    fn from(status: http::StatusCode) -> Self {
        let message = status.canonical_reason().unwrap_or("request failed");
        Self { status: status.as_u16(), message: message.into() }
    }
}


/// A violated scheduler invariant.
///
/// Faults are caused by broken callers (e.g. a stage or I/O layer touching a
/// connection that was already torn down) and are never part of normal
/// operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Fault {
    /// The connection was torn down or never existed.
    #[error("connection {0} is terminated")]
    Terminated(ConnId),
    /// The connection is already parked in the FD-Wait Queue.
    #[error("connection {0} is already parked")]
    AlreadyParked(ConnId),
    /// A connection taken from the Ready Queue was not runnable.
    #[error("connection {conn} dequeued in state {state}")]
    NotRunnable {
        /// The offending connection.
        conn: ConnId,
        /// Its state at dequeue time.
        state: crate::ConnState,
    },
    /// The I/O layer released more descriptors than were in use.
    #[error("released {0} more descriptor slot(s) than were in use")]
    OverRelease(usize),
}


/// The reason a connection reached [`ConnState::Terminal`](crate::ConnState::Terminal).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateReason {
    /// The pipeline finished successfully. The I/O layer may keep the
    /// client socket open and spawn a new connection on it.
    Finished,
    /// A stage failed.
    Failed(Failure),
    /// The client went away.
    Disconnected,
    /// The connection was parked longer than
    /// [`Config::max_fd_wait`](crate::Config::max_fd_wait).
    FdWaitTimeout,
    /// The connection was dropped after a scheduler invariant was violated.
    Fault(Fault),
}

impl TerminateReason {
    /// Tests whether the connection terminated successfully.
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Returns the HTTP status the I/O layer should respond with, if any.
    ///
    /// Successful and disconnected connections have no error response.
    #[must_use]
    pub fn error_status(&self) -> Option<u16> {
        match self {
            Self::Finished | Self::Disconnected => None,
            Self::Failed(f) => Some(f.status_code()),
            Self::FdWaitTimeout => Some(503),
            Self::Fault(_) => Some(500),
        }
    }
}

impl fmt::Display for TerminateReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Finished => f.write_str("finished"),
            Self::Failed(e) => write!(f, "failed: {e}"),
            Self::Disconnected => f.write_str("client disconnected"),
            Self::FdWaitTimeout => f.write_str("timed out waiting for a descriptor"),
            Self::Fault(e) => write!(f, "fault: {e}"),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::fdwait::Purpose;

    #[test]
    fn failure_status() {
        let f = Failure::new("boom");
        assert_eq!(f.status_code(), 500);
        assert_eq!(f.message(), "boom");
        assert_eq!(f.to_string(), "boom (status 500)");

        let f = Failure::with_status(404, "no such file");
        assert_eq!(TerminateReason::Failed(f).error_status(), Some(404));
        assert_eq!(TerminateReason::FdWaitTimeout.error_status(), Some(503));
        assert_eq!(TerminateReason::Disconnected.error_status(), None);
        assert!(TerminateReason::Finished.is_success());
    }

    #[test]
    fn failure_bad_status() {
        let f = Failure::with_status(42, "nope");
        assert_eq!((f.status_code(), f.message()), (500, "nope"));
        assert_eq!(Failure::with_status(1000, "big").status_code(), 500);
        assert_eq!(Failure::with_status(999, "odd").status_code(), 999);
    }

    #[cfg(feature = "http")]
    #[test]
    fn failure_http() {
        let f = Failure::from(http::StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(f.status(), http::StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(f.message(), "Service Unavailable");
    }

    #[test]
    fn verdict_names() {
        let req = FdRequest::new(Purpose::Pipe, "cgi");
        let names: Vec<_> = [
            Verdict::Advance, Verdict::Yield, Verdict::AwaitFd(req),
            Verdict::Finished, Verdict::Failed(Failure::new("x")),
        ].iter().map(Verdict::name).collect();
        assert_eq!(names, ["advance", "yield", "await-fd", "finished", "failed"]);
    }
}
