/// Constructs an event at the trace level if `trace-more` is enabled.
#[cfg(feature = "trace-more")]
macro_rules! trace {
    ($($arg:tt)+) => (::tracing::trace!($($arg)+));
}
/// Constructs an event at the trace level if `trace-more` is enabled.
#[cfg(not(feature = "trace-more"))]
macro_rules! trace {
    ($($arg:tt)+) => {};
}
pub(crate) use trace;

/// Reports a violated scheduler invariant.
///
/// Debug builds panic with the given message. Release builds log it at the
/// error level and carry on, leaving it to the caller to drop the offending
/// connection.
macro_rules! fault {
    ($fault:expr, $conn:expr) => {{
        let fault: $crate::Fault = $fault;
        if cfg!(debug_assertions) {
            panic!("scheduler invariant violated for {}: {}", $conn, fault);
        }
        let error: &dyn ::std::error::Error = &fault;
        ::tracing::error!(conn = %$conn, error, "scheduler invariant violated, dropping connection");
        fault
    }};
}
pub(crate) use fault;
