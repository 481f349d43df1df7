#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing and examples in lockstep packages.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use std::{env, fs, panic};

/// Runs a test with a timeout to prevent infinite hangs.
///
/// This function wraps a test closure with a timeout mechanism. If the test
/// takes longer than the timeout to complete, the process will be terminated
/// to prevent CI/build systems from hanging.
///
/// The timeout is 10 seconds under normal conditions and 60 seconds under
/// Miri, where thread synchronization primitives are significantly slower.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog
/// is disabled and the test function is executed directly. This allows mutation
/// testing to properly detect hanging mutations.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode).
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// with_watchdog(|| {
///     // Your test code here
///     assert_eq!(2 + 2, 4);
/// });
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    // Check if we are running under mutation testing.
    if env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        // Under mutation testing, disable the watchdog to allow hanging mutations.
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    // Run the test in a separate thread
    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // Send the result back - if this fails, the receiver has timed out
        drop(tx.send(result));
    });

    // Miri is dramatically slower for thread synchronization, so we use a
    // longer timeout to avoid false positives while still catching real hangs.
    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    // Wait for either the test to complete or timeout.
    match rx.recv_timeout(timeout) {
        Ok(result) => {
            // Test completed successfully, join the thread to clean up
            test_handle.join().expect("Test thread should not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            // Test timed out - this indicates the test is hanging
            panic!("Test exceeded 10-second timeout");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            // Thread panicked, join it to get the panic
            match test_handle.join() {
                Ok(()) => panic!("Test thread disconnected unexpectedly"),
                Err(e) => panic::resume_unwind(e),
            }
        }
    }
}

/// Number of threads the current process has, as reported by the operating system.
///
/// Returns `None` where the operating system does not report it. On Linux, this is the
/// `Threads:` line of `/proc/self/status`.
#[must_use]
pub fn live_thread_count() -> Option<usize> {
    let status = fs::read_to_string("/proc/self/status").ok()?;

    status
        .lines()
        .find_map(|line| line.strip_prefix("Threads:"))
        .and_then(|count| count.trim().parse().ok())
}

/// Coefficient of variation (standard deviation divided by mean) of a sample.
///
/// Returns `None` for an empty sample or one with a zero mean.
#[must_use]
pub fn coefficient_of_variation(sample: &[u64]) -> Option<f64> {
    if sample.iter().all(|&value| value == 0) {
        return None;
    }

    #[expect(
        clippy::cast_precision_loss,
        reason = "test statistics, precision does not matter"
    )]
    let values: Vec<f64> = sample.iter().map(|&value| value as f64).collect();

    #[expect(
        clippy::cast_precision_loss,
        reason = "test statistics, precision does not matter"
    )]
    let count = values.len() as f64;

    let mean = values.iter().sum::<f64>() / count;

    let variance = values
        .iter()
        .map(|value| (value - mean).powi(2))
        .sum::<f64>()
        / count;

    Some(variance.sqrt() / mean)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn watchdog_allows_fast_tests() {
        let result = with_watchdog(|| {
            // A test that completes quickly
            42
        });
        assert_eq!(result, 42);
    }

    #[test]
    fn watchdog_returns_correct_value() {
        let result = with_watchdog(|| "hello world");
        assert_eq!(result, "hello world");
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn live_threads_include_spawned_ones() {
        let before = live_thread_count().unwrap();

        let (tx, rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || rx.recv());

        assert!(live_thread_count().unwrap() > before);

        drop(tx);
        handle.join().unwrap().unwrap_err();
    }

    #[test]
    fn constant_sample_has_no_variation() {
        assert!(coefficient_of_variation(&[5, 5, 5]).unwrap() < f64::EPSILON);
    }

    #[test]
    fn variation_is_relative_to_mean() {
        // Mean 10, population standard deviation 5.
        let cov = coefficient_of_variation(&[5, 15]).unwrap();

        assert!((cov - 0.5).abs() < 1e-12);
    }

    #[test]
    fn degenerate_samples_have_no_variation() {
        assert_eq!(coefficient_of_variation(&[]), None);
        assert_eq!(coefficient_of_variation(&[0, 0]), None);
    }
}
