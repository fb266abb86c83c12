//! Logging for the transport.
//!
//! Built with `--features tracing`, the submit, pull, push and timer paths
//! emit structured `tracing` events keyed by command id. Without the
//! feature every macro below expands to nothing.
//!
//! The filter comes from `UPCALL_LOG`, then `RUST_LOG`, then
//! [`DEFAULT_FILTER`].

/// Filter used when neither `UPCALL_LOG` nor `RUST_LOG` is set.
pub const DEFAULT_FILTER: &str = "upcall=trace";

/// Installs a global subscriber printing uptime, thread and target.
///
/// Safe to call more than once; later calls keep the first subscriber. A
/// no-op without the `tracing` feature.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_env("UPCALL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let layer = fmt::layer()
        .with_timer(fmt::time::uptime())
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! discard {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use discard as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as error;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as trace;
#[cfg(not(feature = "tracing"))]
pub(crate) use discard as warn;
