use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while resolving or programming hardware performance counters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The backend does not know an event by this name.
    #[error("event '{name}' is not known to the {backend} counter backend")]
    UnknownEvent {
        /// The event name as requested.
        name: String,
        /// Name of the backend that attempted the resolution.
        backend: &'static str,
    },

    /// The event name looks like a raw encoding but could not be parsed.
    #[error("invalid event syntax '{name}': {problem}")]
    InvalidEventSyntax {
        /// The event name as requested.
        name: String,
        /// What is wrong with it.
        problem: String,
    },

    /// The requested counter access strategy does not exist on this platform.
    #[error("counter access via {strategy} is not supported on this platform")]
    Unsupported {
        /// The strategy that was requested.
        strategy: &'static str,
    },

    /// The performance monitoring unit is switched off and cannot be used from this privilege
    /// level.
    #[error("the performance monitoring unit is disabled: {reason}")]
    PmuDisabled {
        /// What was found to be disabled.
        reason: &'static str,
    },

    /// A privileged device that counters are programmed through could not be used.
    #[error("counter device {} failed", path.display())]
    Device {
        /// The device path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A system call required for counter access failed.
    #[error("{operation} failed")]
    Syscall {
        /// The operation that was attempted.
        operation: &'static str,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A vendor performance-monitor API call returned an error code.
    #[error("vendor performance monitor call {call} returned {code}")]
    Vendor {
        /// The API call that failed.
        call: &'static str,
        /// The status code it returned.
        code: i32,
    },

    /// A session was opened with an event encoding resolved by a different backend.
    #[error("the {backend} counter backend cannot program a foreign event encoding {encoding}")]
    ForeignEncoding {
        /// Name of the backend that was handed the encoding.
        backend: &'static str,
        /// Human-readable form of the foreign encoding.
        encoding: String,
    },
}

/// A specialized `Result` type for counter operations, returning the crate's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;
