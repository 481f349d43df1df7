//! A runner over K processors owns K - 1 threads and releases all of them when dropped.
//!
//! One test per file to enforce process isolation (the thread count is process-level state).

#![cfg(target_os = "linux")]
#![allow(clippy::arithmetic_side_effects, reason = "panic is fine in tests")]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lockstep::{FakeTopology, NullBenchmark, Runner, Topology};
use lockstep_pmu::ActiveCounters;
use testing::{live_thread_count, with_watchdog};

// Threads disappear from the process shortly after they are joined, not at the same instant.
fn settled_thread_count(expected: usize) -> usize {
    let deadline = Instant::now() + Duration::from_secs(2);

    loop {
        let count = live_thread_count().expect("Linux reports the thread count");

        if count == expected || Instant::now() > deadline {
            return count;
        }

        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn runner_threads_live_and_die_with_runner() {
    with_watchdog(|| {
        const PROCESSORS: u32 = 4;

        let before = live_thread_count().expect("Linux reports the thread count");

        let topology: Arc<dyn Topology> =
            Arc::new(FakeTopology::with_processor_count(PROCESSORS));

        let mut runner = Runner::builder()
            .topology(Arc::clone(&topology))
            .affinity_fallback(topology)
            .build()
            .unwrap();

        assert_eq!(runner.worker_thread_count(), 3);
        assert_eq!(settled_thread_count(before + 3), before + 3);

        // Rounds reuse the threads instead of spawning new ones.
        runner
            .parallel(&NullBenchmark, 5, &ActiveCounters::none())
            .unwrap();
        assert_eq!(settled_thread_count(before + 3), before + 3);

        drop(runner);

        assert_eq!(settled_thread_count(before), before);
    });
}
