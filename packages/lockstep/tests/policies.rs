//! End-to-end behavior of the measurement policies on a fake topology.

#![allow(
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    reason = "panic is fine in tests"
)]

use std::collections::HashMap;
use std::hint::black_box;
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, ThreadId};
use std::time::Instant;

use lockstep::{
    Affinity, Benchmark, BenchmarkArg, BindingMode, CpuSet, Error, Executor, FakeTopology,
    NullBenchmark, Runner, RunnerBuilder, Synchronization, Topology,
};
use lockstep_pmu::ActiveCounters;
use testing::{coefficient_of_variation, with_watchdog};

fn runner_on(processors: u32) -> Runner {
    builder_on(processors).build().unwrap()
}

fn builder_on(processors: u32) -> RunnerBuilder {
    let topology: Arc<dyn Topology> = Arc::new(FakeTopology::with_processor_count(processors));

    Runner::builder()
        .topology(Arc::clone(&topology))
        .affinity_fallback(topology)
}

/// Records the wall-clock window of every call, per thread.
#[derive(Debug, Default)]
struct Windows {
    windows: Mutex<Vec<(ThreadId, Instant, Instant)>>,
}

impl Windows {
    fn by_thread(&self) -> HashMap<ThreadId, Vec<(Instant, Instant)>> {
        let mut by_thread: HashMap<_, Vec<_>> = HashMap::new();

        for &(thread, start, end) in self.windows.lock().unwrap().iter() {
            by_thread.entry(thread).or_default().push((start, end));
        }

        by_thread
    }
}

impl Benchmark for Windows {
    fn name(&self) -> &str {
        "windows"
    }

    fn call(&self, _arg: &mut BenchmarkArg) {
        let start = Instant::now();
        spin(1 << 12);
        let end = Instant::now();

        self.windows
            .lock()
            .unwrap()
            .push((thread::current().id(), start, end));
    }
}

/// Fixed work quantum: an empty loop of a fixed number of rounds.
#[derive(Debug)]
struct FixedWorkQuantum;

impl Benchmark for FixedWorkQuantum {
    fn name(&self) -> &str {
        "fwq"
    }

    fn call(&self, _arg: &mut BenchmarkArg) {
        spin(1 << 20);
    }
}

fn spin(rounds: u64) {
    for round in 0..rounds {
        black_box(round);
    }
}

#[test]
fn parallel_fills_one_row_per_processor() {
    with_watchdog(|| {
        let mut runner = runner_on(3);

        let matrix = runner
            .parallel(&NullBenchmark, 7, &ActiveCounters::none())
            .unwrap();

        assert_eq!(matrix.rows(), 3);
        assert_eq!(matrix.repetitions(), 7);
        assert_eq!(matrix.columns(), 1);

        for row in 0..3 {
            for rep in 0..7 {
                assert!(matrix.timestamp(row, rep).unwrap() > 0);
            }
        }
    });
}

#[test]
fn single_null_measurement() {
    with_watchdog(|| {
        let mut runner = runner_on(1);

        assert_eq!(runner.worker_thread_count(), 0);

        let matrix = runner
            .parallel(&NullBenchmark, 1, &ActiveCounters::none())
            .unwrap();

        assert_eq!(matrix.as_slice().len(), 1);
        assert!(matrix.as_slice()[0] > 0);
    });
}

#[test]
fn serial_windows_never_overlap() {
    with_watchdog(|| {
        let mut runner = runner_on(3);
        let windows = Windows::default();

        runner
            .serial(&windows, 5, &ActiveCounters::none())
            .unwrap();

        let mut spans: Vec<(Instant, Instant)> = windows
            .by_thread()
            .into_values()
            .map(|windows| {
                let first_start = windows.iter().map(|w| w.0).min().unwrap();
                let last_end = windows.iter().map(|w| w.1).max().unwrap();
                (first_start, last_end)
            })
            .collect();

        assert_eq!(spans.len(), 3);

        spans.sort_by_key(|span| span.0);

        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "serial windows overlap");
        }
    });
}

#[test]
fn parallel_repetitions_are_barrier_aligned() {
    with_watchdog(|| {
        const REPETITIONS: usize = 20;

        let mut runner = builder_on(3)
            .synchronization(Synchronization::PerRepetition)
            .build()
            .unwrap();
        let windows = Windows::default();

        runner
            .parallel(&windows, REPETITIONS, &ActiveCounters::none())
            .unwrap();

        let by_thread = windows.by_thread();
        assert_eq!(by_thread.len(), 3);

        // No processor starts repetition k + 1 before every processor has finished repetition k.
        for rep in 0..REPETITIONS - 1 {
            let latest_end = by_thread.values().map(|w| w[rep].1).max().unwrap();
            let earliest_next_start = by_thread.values().map(|w| w[rep + 1].0).min().unwrap();

            assert!(latest_end <= earliest_next_start);
        }
    });
}

#[test]
fn paired_rows_cover_both_sets() {
    with_watchdog(|| {
        let mut runner = runner_on(5);

        let first: CpuSet = [0, 1].into_iter().collect();
        let second: CpuSet = [2, 3, 4].into_iter().collect();

        let matrix = runner
            .paired(
                &NullBenchmark,
                &FixedWorkQuantum,
                &first,
                &second,
                2,
                &ActiveCounters::none(),
            )
            .unwrap();

        assert_eq!(matrix.rows(), 5);
        assert!(matrix.as_slice().iter().all(|&timestamp| timestamp > 0));
    });
}

#[test]
#[should_panic]
fn paired_sets_must_not_intersect() {
    let mut runner = runner_on(3);

    let first: CpuSet = [0, 1].into_iter().collect();
    let second: CpuSet = [1, 2].into_iter().collect();

    let _result = runner.paired(
        &NullBenchmark,
        &NullBenchmark,
        &first,
        &second,
        1,
        &ActiveCounters::none(),
    );
}

#[test]
fn busy_executor_rejects_second_submit() {
    with_watchdog(|| {
        let topology: Arc<dyn Topology> = Arc::new(FakeTopology::with_processor_count(1));
        let affinity = Affinity::new(Arc::clone(&topology), topology, BindingMode::Enabled);

        let executor = Executor::spawn(0, affinity).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let first = executor
            .submit(move || {
                release_rx.recv().unwrap();
                Ok(())
            })
            .unwrap();

        assert!(matches!(
            executor.submit(|| Ok(())),
            Err(Error::ExecutorBusy { processor: 0 })
        ));

        release_tx.send(()).unwrap();
        first.wait().unwrap();

        executor.submit(|| Ok(())).unwrap().wait().unwrap();
        executor.shutdown().unwrap();
    });
}

#[test]
fn fixed_work_quantum_is_stable() {
    with_watchdog(|| {
        let mut runner = runner_on(1);

        let matrix = runner
            .parallel(&FixedWorkQuantum, 10, &ActiveCounters::none())
            .unwrap();

        let deltas: Vec<u64> = (0..10).map(|rep| matrix.timestamp(0, rep).unwrap()).collect();

        // Generous: shared test machines are noisy, but the same work must take about the same
        // time every repetition.
        let cov = coefficient_of_variation(&deltas).unwrap();
        assert!(cov < 1.0, "coefficient of variation {cov} of {deltas:?}");
    });
}
