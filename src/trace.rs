//! Log plumbing for the driver.
//!
//! All logging in the crate goes through these re-exports. With the
//! `tracing` feature the macros come from the `tracing` crate; without it
//! they expand to nothing and the receive hot path carries no logging code.

/// Installs a `tracing` subscriber with an env-filter and uptime timestamps.
///
/// Intended for tests and embedding applications that do not install their
/// own subscriber. Compiles to a no-op without the `tracing` feature.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gale=debug"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
mod noop {
    macro_rules! noop_trace {
        ($($arg:tt)*) => {
            ()
        };
    }
    macro_rules! noop_debug {
        ($($arg:tt)*) => {
            ()
        };
    }
    macro_rules! noop_info {
        ($($arg:tt)*) => {
            ()
        };
    }
    macro_rules! noop_warn {
        ($($arg:tt)*) => {
            ()
        };
    }
    macro_rules! noop_error {
        ($($arg:tt)*) => {
            ()
        };
    }

    pub(crate) use noop_debug as debug;
    pub(crate) use noop_error as error;
    pub(crate) use noop_info as info;
    pub(crate) use noop_trace as trace;
    pub(crate) use noop_warn as warn;
}

#[cfg(not(feature = "tracing"))]
pub(crate) use noop::{debug, error, info, trace, warn};
