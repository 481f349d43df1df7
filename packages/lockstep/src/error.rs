use std::io;

use thiserror::Error;

use crate::ProcessorId;

/// Errors raised while preparing or running measurements.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The requested configuration cannot be honored.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A processor list could not be parsed.
    #[error("invalid processor set")]
    InvalidCpuSet(#[from] cpulist::Error),

    /// A resource that measurements depend on could not be acquired, such as a worker thread or
    /// a processor binding.
    #[error("failed to {action}")]
    ResourceAcquisition {
        /// What was being attempted.
        action: String,
        /// The underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Work was submitted to an executor that had not yet finished its previous work.
    #[error("the executor for processor {processor} already has unfinished work")]
    ExecutorBusy {
        /// The processor of the executor.
        processor: ProcessorId,
    },

    /// Hardware performance counters could not be programmed or read.
    #[error(transparent)]
    Counters(#[from] lockstep_pmu::Error),

    /// A benchmark hook panicked.
    #[error("benchmark '{benchmark}' panicked on processor {processor}: {message}")]
    BenchmarkPanicked {
        /// Name of the benchmark.
        benchmark: String,
        /// The processor whose executor ran the hook.
        processor: ProcessorId,
        /// The panic message, if it was a string.
        message: String,
    },

    /// An executor failed outside of benchmark code.
    #[error("the executor for processor {processor} panicked")]
    ExecutorPanicked {
        /// The processor of the executor.
        processor: ProcessorId,
    },
}

/// A specialized `Result` type for measurement operations, returning the crate's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Extracts a human-readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::error::Error as _;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync);

    #[test]
    fn counter_errors_are_transparent() {
        let error = Error::from(lockstep_pmu::Error::PmuDisabled { reason: "test" });

        assert_eq!(
            error.to_string(),
            "the performance monitoring unit is disabled: test"
        );
    }

    #[test]
    fn invalid_cpu_set_keeps_cause() {
        let error = Error::from(cpulist::parse("1-").unwrap_err());

        assert!(error.source().is_some());
    }

    #[test]
    fn panic_messages_are_extracted() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");

        let payload: Box<dyn std::any::Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
