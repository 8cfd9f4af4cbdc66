use core::result;
use std::io;

use thiserror::Error;

/// A helper type for wrapping a [result::Result] such that we can reduce
/// noise in our signatures.
pub type Result<T> = result::Result<T, Error>;

/// A failure from one of the ring's setup-style calls: queue construction,
/// probe registration, or file/buffer registration.
///
/// Operation results never travel through this type; they are delivered to
/// the caller as the raw completion code of the awaited operation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io_uring {action} failed: {source}")]
    Setup {
        action: &'static str,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Wrap a failed setup call, naming the ring action that failed. Debug
    /// builds also log the error with a captured backtrace, since setup
    /// failures tend to be reported far from where they were caused.
    pub(crate) fn setup(action: &'static str, source: io::Error) -> Error {
        #[cfg(debug_assertions)]
        tracing::error!(
            action,
            error = %source,
            backtrace = %std::backtrace::Backtrace::force_capture(),
            "io_uring setup call failed"
        );
        Error::Setup { action, source }
    }
}
