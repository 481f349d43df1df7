use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lockstep_pmu::{ActiveCounters, CounterSet, NullBackend, PmuBackend};
use tracing::{debug, info, warn};

use crate::{
    Affinity, Barrier, Benchmark, BenchmarkConfig, BindingMode, Completion, CpuSet,
    DEFAULT_SKEW_TOLERANCE, Error, Executor, NullBenchmark, ProcessorId, Result, ResultMatrix,
    Synchronization, SystemTopology, Task, Topology, WorkItem,
};

/// Runs benchmarks on a fixed set of processors, one executor per processor.
///
/// The executor of the first processor is the dirigent: it runs on the thread that calls the
/// runner, so a runner over K processors owns K - 1 threads. Every executor binds its thread to
/// its processor while the runner is being built. A runner over no processors has no executors
/// and every policy gives it an empty result matrix.
///
/// ```
/// use std::sync::Arc;
///
/// use lockstep::{FakeTopology, NullBenchmark, Runner};
/// use lockstep_pmu::ActiveCounters;
///
/// let mut runner = Runner::builder()
///     .topology(Arc::new(FakeTopology::with_processor_count(2)))
///     .build()?;
///
/// let matrix = runner.parallel(&NullBenchmark, 3, &ActiveCounters::none())?;
///
/// assert_eq!(matrix.rows(), 2);
/// assert_eq!(matrix.repetitions(), 3);
/// # Ok::<(), lockstep::Error>(())
/// ```
#[derive(Debug)]
pub struct Runner {
    processors: CpuSet,

    // One per processor, in the same order. The first one is the dirigent.
    executors: Vec<Executor>,

    topology: Arc<dyn Topology>,
    pmu: Arc<dyn PmuBackend>,
    synchronization: Synchronization,
    skew_tolerance: Duration,
}

impl Runner {
    /// Starts configuring a runner.
    #[must_use]
    pub fn builder() -> RunnerBuilder {
        RunnerBuilder::new()
    }

    /// The processors the runner measures on, in row order of its result matrices.
    #[must_use]
    pub fn processors(&self) -> &CpuSet {
        &self.processors
    }

    /// Number of threads the runner owns: one per processor except the dirigent's.
    #[must_use]
    pub fn worker_thread_count(&self) -> usize {
        self.executors
            .iter()
            .filter(|executor| !executor.is_dirigent())
            .count()
    }

    /// The processor whose executor runs on the caller's thread, if the runner has processors.
    #[must_use]
    pub fn dirigent_processor(&self) -> Option<ProcessorId> {
        self.executors.first().map(Executor::processor)
    }

    /// The PMU backend that programs the counters.
    #[must_use]
    pub fn pmu(&self) -> &Arc<dyn PmuBackend> {
        &self.pmu
    }

    /// Resolves counter names against the PMU backend of the runner.
    ///
    /// Counters that cannot be resolved are dropped and counters beyond the available slots
    /// are truncated, with a warning for each.
    #[must_use]
    pub fn activate_counters(&self, counters: &CounterSet) -> ActiveCounters {
        counters.activate(&*self.pmu)
    }

    /// Cache properties of the topology, for sizing benchmark data.
    #[must_use]
    pub fn benchmark_config(&self) -> BenchmarkConfig {
        BenchmarkConfig::from_topology(&*self.topology)
    }

    /// Runs the benchmark on all processors at once.
    ///
    /// All executors meet at one barrier before their first and after their last repetition,
    /// so their measurement windows are aligned. The result has one row per processor.
    ///
    /// # Errors
    ///
    /// Returns the first failure of any executor. The whole round is discarded.
    #[expect(
        clippy::needless_pass_by_ref_mut,
        reason = "concurrent rounds on the same executors would deadlock"
    )]
    pub fn parallel(
        &mut self,
        benchmark: &dyn Benchmark,
        repetitions: usize,
        counters: &ActiveCounters,
    ) -> Result<ResultMatrix> {
        self.run_parallel(benchmark, repetitions, counters, &*self.pmu)
    }

    /// Runs the benchmark on one processor at a time, in processor order.
    ///
    /// Measurement windows of different processors never overlap. Progress is reported after
    /// every processor.
    ///
    /// # Errors
    ///
    /// Returns the first failure. Processors after the failing one are not measured.
    #[expect(
        clippy::needless_pass_by_ref_mut,
        reason = "concurrent rounds on the same executors would deadlock"
    )]
    pub fn serial(
        &mut self,
        benchmark: &dyn Benchmark,
        repetitions: usize,
        counters: &ActiveCounters,
    ) -> Result<ResultMatrix> {
        let mut matrix = ResultMatrix::new(self.processors.clone(), repetitions, counters.names());
        let total = self.processors.len();

        if total == 0 {
            return Ok(matrix);
        }

        let mut last_took = None;

        for (index, output) in matrix.rows_mut().enumerate() {
            report_progress(index, total, last_took);

            let started = Instant::now();
            let barrier = Barrier::with_skew_tolerance(1, self.skew_tolerance);

            let item = self.work_item(benchmark, counters, output, &barrier, index);
            self.dispatch(vec![(index, item)])?;

            last_took = Some(started.elapsed());
        }

        report_progress(total, total, last_took);

        Ok(matrix)
    }

    /// Runs two benchmarks at once, `first` on the processors of `first_set` and `second` on
    /// those of `second_set`.
    ///
    /// All participating executors meet at one barrier. The result has one row per processor
    /// of `first_set` followed by one row per processor of `second_set`. Two empty sets give an
    /// empty matrix.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a set has processors that the runner does not
    /// measure on, or the first failure of any executor.
    ///
    /// # Panics
    ///
    /// Panics if the two sets share a processor.
    #[expect(
        clippy::needless_pass_by_ref_mut,
        reason = "concurrent rounds on the same executors would deadlock"
    )]
    pub fn paired(
        &mut self,
        first: &dyn Benchmark,
        second: &dyn Benchmark,
        first_set: &CpuSet,
        second_set: &CpuSet,
        repetitions: usize,
        counters: &ActiveCounters,
    ) -> Result<ResultMatrix> {
        assert!(
            first_set.is_disjoint(second_set),
            "paired processor sets must not intersect: {first_set} and {second_set}"
        );

        for set in [first_set, second_set] {
            if !set.is_subset(&self.processors) {
                return Err(Error::Configuration(format!(
                    "processors {set} are not all among the processors {} of the runner",
                    self.processors
                )));
            }
        }

        let union = first_set.union(second_set);
        let mut matrix = ResultMatrix::new(union.clone(), repetitions, counters.names());

        if union.is_empty() {
            return Ok(matrix);
        }

        let barrier = Barrier::with_skew_tolerance(union.len(), self.skew_tolerance);

        let work = union
            .iter()
            .zip(matrix.rows_mut())
            .map(|(processor, output)| {
                let benchmark = if first_set.contains(processor) {
                    first
                } else {
                    second
                };

                let index = self
                    .processors
                    .index_of(processor)
                    .expect("verified that both sets are subsets of the runner processors");

                (
                    index,
                    self.work_item(benchmark, counters, output, &barrier, index),
                )
            })
            .collect();

        self.dispatch(work)?;

        Ok(matrix)
    }

    /// Stops every executor and joins its thread.
    ///
    /// Dropping the runner does the same but cannot report failures.
    ///
    /// # Errors
    ///
    /// Returns the first executor that did not stop cleanly.
    pub fn shutdown(self) -> Result<()> {
        self.executors
            .into_iter()
            .map(Executor::shutdown)
            .fold(Ok(()), Result::and)
    }

    fn run_parallel(
        &self,
        benchmark: &dyn Benchmark,
        repetitions: usize,
        counters: &ActiveCounters,
        pmu: &dyn PmuBackend,
    ) -> Result<ResultMatrix> {
        let mut matrix = ResultMatrix::new(self.processors.clone(), repetitions, counters.names());

        if self.processors.is_empty() {
            return Ok(matrix);
        }

        let barrier = Barrier::with_skew_tolerance(self.processors.len(), self.skew_tolerance);

        let work = matrix
            .rows_mut()
            .enumerate()
            .map(|(index, output)| {
                let processor = self
                    .processors
                    .get(index)
                    .expect("the matrix has one row per processor");

                let item = WorkItem::new(benchmark, pmu, counters, output, &barrier, processor)
                    .synchronization(self.synchronization);

                (index, item)
            })
            .collect();

        self.dispatch(work)?;

        Ok(matrix)
    }

    fn work_item<'w>(
        &'w self,
        benchmark: &'w dyn Benchmark,
        counters: &'w ActiveCounters,
        output: &'w mut [u64],
        barrier: &'w Barrier,
        index: usize,
    ) -> WorkItem<'w> {
        let processor = self
            .processors
            .get(index)
            .expect("work is only created for processors of the runner");

        WorkItem::new(benchmark, &*self.pmu, counters, output, barrier, processor)
            .synchronization(self.synchronization)
    }

    /// Hands every work item to the executor with the given index and waits for all of them.
    ///
    /// The dirigent, if it has work, runs it on the current thread after every other executor
    /// has been woken up.
    fn dispatch<'w>(&self, mut work: Vec<(usize, WorkItem<'w>)>) -> Result<()> {
        // The dirigent is the first executor, so its work is awaited (and run) first.
        work.sort_by_key(|(index, _)| *index);

        let mut round = PendingRound {
            completions: Vec::with_capacity(work.len()),
        };

        for (index, item) in work {
            let executor = self
                .executors
                .get(index)
                .expect("work is only created for processors of the runner");

            let task: Box<dyn FnOnce() -> Result<()> + Send + 'w> =
                Box::new(move || item.execute());

            // SAFETY: The work item borrows the result matrix, the barrier and the benchmark for
            // 'w. Every submitted task is awaited before this function returns, either by
            // `finish()` or by the drop of `round` while unwinding, so nothing it borrows can be
            // released while it runs. The executor only pretends that the task is 'static.
            let task = unsafe {
                mem::transmute::<Box<dyn FnOnce() -> Result<()> + Send + 'w>, Task>(task)
            };

            round.completions.push(
                executor
                    .submit_task(task)
                    .expect("executors are idle between rounds"),
            );
        }

        round.finish()
    }
}

/// The completions of one round that have not been awaited yet.
///
/// Dropping it waits for all of them, so that work borrowing from the caller never outlives the
/// caller's frame, even if the caller unwinds.
#[derive(Debug)]
struct PendingRound<'e> {
    completions: Vec<Completion<'e>>,
}

impl PendingRound<'_> {
    fn finish(mut self) -> Result<()> {
        self.completions
            .drain(..)
            .map(Completion::wait)
            .fold(Ok(()), Result::and)
    }
}

impl Drop for PendingRound<'_> {
    #[cfg_attr(test, mutants::skip)] // Only reached while unwinding.
    fn drop(&mut self) {
        for completion in self.completions.drain(..) {
            if let Err(error) = completion.wait() {
                warn!(%error, "work failed while its round was being abandoned");
            }
        }
    }
}

fn report_progress(done: usize, total: usize, last_took: Option<Duration>) {
    let Some(last_took) = last_took else {
        info!("Running 1 of {total}.");
        return;
    };

    let seconds = last_took.as_secs();
    let (hours, minutes, seconds_in_minute) = split_hms(seconds);

    if done < total {
        info!(
            "Running {} of {total}. Last took {hours}:{minutes:02}:{seconds_in_minute:02} ({seconds})",
            done.wrapping_add(1)
        );
    } else {
        info!("Finished {total}. Last took {hours}:{minutes:02}:{seconds_in_minute:02} ({seconds})");
    }
}

#[expect(
    clippy::integer_division,
    reason = "we want whole hours and minutes, the remainder is taken separately"
)]
fn split_hms(seconds: u64) -> (u64, u64, u64) {
    (seconds / 3600, seconds / 60 % 60, seconds % 60)
}

/// Configures a [`Runner`].
///
/// Everything has a default: all processors of the system, operating system binding, no
/// hardware counters, synchronization per invocation and the default barrier skew tolerance.
#[derive(Debug)]
#[must_use]
pub struct RunnerBuilder {
    processors: Option<CpuSet>,
    topology: Option<Arc<dyn Topology>>,
    affinity_fallback: Option<Arc<dyn Topology>>,
    pmu: Option<Arc<dyn PmuBackend>>,
    binding: BindingMode,
    synchronization: Synchronization,
    skew_tolerance: Duration,
}

impl RunnerBuilder {
    fn new() -> Self {
        Self {
            processors: None,
            topology: None,
            affinity_fallback: None,
            pmu: None,
            binding: BindingMode::default(),
            synchronization: Synchronization::default(),
            skew_tolerance: DEFAULT_SKEW_TOLERANCE,
        }
    }

    /// Measures on these processors instead of every processor of the topology. The first one
    /// hosts the dirigent.
    pub fn processors(mut self, processors: CpuSet) -> Self {
        self.processors = Some(processors);
        self
    }

    /// Describes the processors with this topology instead of the running system's.
    pub fn topology(mut self, topology: Arc<dyn Topology>) -> Self {
        self.topology = Some(topology);
        self
    }

    /// Binds threads through this topology when the primary one cannot, instead of the
    /// running system's.
    pub fn affinity_fallback(mut self, fallback: Arc<dyn Topology>) -> Self {
        self.affinity_fallback = Some(fallback);
        self
    }

    /// Programs counters through this PMU backend instead of measuring timestamps only.
    pub fn pmu(mut self, pmu: Arc<dyn PmuBackend>) -> Self {
        self.pmu = Some(pmu);
        self
    }

    /// Sets whether executors bind their threads to their processors.
    pub fn binding(mut self, binding: BindingMode) -> Self {
        self.binding = binding;
        self
    }

    /// Sets how often executors meet at the barrier.
    pub fn synchronization(mut self, synchronization: Synchronization) -> Self {
        self.synchronization = synchronization;
        self
    }

    /// Sets the barrier release skew above which wake-ups are reported.
    pub fn skew_tolerance(mut self, skew_tolerance: Duration) -> Self {
        self.skew_tolerance = skew_tolerance;
        self
    }

    /// Starts the executors and waits until every one of them has bound itself.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if some processors are not processors of the topology,
    /// [`Error::ResourceAcquisition`] if an executor thread cannot be started.
    pub fn build(self) -> Result<Runner> {
        let topology = self
            .topology
            .unwrap_or_else(|| Arc::new(SystemTopology::new()));
        let fallback = self
            .affinity_fallback
            .unwrap_or_else(|| Arc::new(SystemTopology::new()));
        let pmu = self.pmu.unwrap_or_else(|| Arc::new(NullBackend));

        let available = topology.enumerate_processors();
        let processors = self.processors.unwrap_or_else(|| available.clone());

        if !processors.is_subset(&available) {
            return Err(Error::Configuration(format!(
                "processors {processors} are not all among the available processors {available}"
            )));
        }

        let affinity = Affinity::new(Arc::clone(&topology), fallback, self.binding);

        debug!(
            %processors,
            pmu = pmu.name(),
            "spawning {} executors",
            processors.len()
        );

        let executors = processors
            .iter()
            .enumerate()
            .map(|(index, processor)| {
                if index == 0 {
                    Ok(Executor::dirigent(processor, affinity.clone()))
                } else {
                    Executor::spawn(processor, affinity.clone())
                }
            })
            .collect::<Result<Vec<_>>>()?;

        assert_eq!(
            executors
                .iter()
                .filter(|executor| executor.is_dirigent())
                .count(),
            usize::from(!executors.is_empty()),
            "a runner with processors has exactly one dirigent"
        );

        let runner = Runner {
            processors,
            executors,
            topology,
            pmu,
            synchronization: self.synchronization,
            skew_tolerance: self.skew_tolerance,
        };

        // The first work of every executor binds it, so a round of nothing binds them all
        // before the first real measurement.
        runner.run_parallel(&NullBenchmark, 1, &ActiveCounters::none(), &NullBackend)?;

        let unbound = runner
            .executors
            .iter()
            .filter(|executor| !executor.is_bound())
            .map(Executor::processor)
            .collect::<CpuSet>();

        if self.binding == BindingMode::Enabled && !unbound.is_empty() {
            warn!(%unbound, "some executors are not bound to their processors");
        }

        Ok(runner)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::thread::{self, ThreadId};

    use static_assertions::assert_impl_all;
    use testing::with_watchdog;

    use super::*;
    use crate::{BenchmarkArg, FakeTopology};

    assert_impl_all!(Runner: Send, Sync);
    assert_impl_all!(RunnerBuilder: Send);

    /// Records which thread called it, once per call.
    #[derive(Debug, Default)]
    struct ThreadRecorder {
        threads: Mutex<Vec<ThreadId>>,
    }

    impl Benchmark for ThreadRecorder {
        fn name(&self) -> &str {
            "threads"
        }

        fn call(&self, _arg: &mut BenchmarkArg) {
            self.threads.lock().unwrap().push(thread::current().id());
        }
    }

    #[derive(Debug)]
    struct Failing;

    impl Benchmark for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn call(&self, _arg: &mut BenchmarkArg) {
            panic!("kernel fault");
        }
    }

    fn runner_on(count: ProcessorId) -> (Runner, Arc<FakeTopology>) {
        let topology = Arc::new(FakeTopology::with_processor_count(count));
        let shared: Arc<dyn Topology> = Arc::<FakeTopology>::clone(&topology);

        let runner = Runner::builder()
            .topology(Arc::clone(&shared))
            .affinity_fallback(shared)
            .build()
            .unwrap();

        (runner, topology)
    }

    #[test]
    fn one_dirigent_and_workers() {
        with_watchdog(|| {
            let (runner, topology) = runner_on(3);

            assert_eq!(runner.worker_thread_count(), 2);
            assert_eq!(runner.dirigent_processor(), Some(0));

            // Building bound every executor exactly once.
            assert_eq!(topology.bind_attempts(), 3);
            assert_eq!(topology.binding_of(thread::current().id()), Some(0));

            runner.shutdown().unwrap();
        });
    }

    #[test]
    fn parallel_uses_every_executor_once_per_repetition() {
        with_watchdog(|| {
            let (mut runner, _) = runner_on(3);
            let recorder = ThreadRecorder::default();

            let matrix = runner
                .parallel(&recorder, 4, &ActiveCounters::none())
                .unwrap();

            assert_eq!(matrix.rows(), 3);

            let threads = recorder.threads.lock().unwrap();
            assert_eq!(threads.len(), 12);

            assert_eq!(threads.iter().collect::<HashSet<_>>().len(), 3);
            assert!(threads.contains(&thread::current().id()));
        });
    }

    #[test]
    fn processors_outside_topology_are_rejected() {
        let topology = Arc::new(FakeTopology::with_processor_count(2));

        let result = Runner::builder()
            .topology(topology)
            .processors([1, 5].into_iter().collect())
            .build();

        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn empty_runner_gives_empty_matrices() {
        with_watchdog(|| {
            let topology = Arc::new(FakeTopology::with_processor_count(2));
            let shared: Arc<dyn Topology> = Arc::<FakeTopology>::clone(&topology);

            let mut runner = Runner::builder()
                .topology(Arc::clone(&shared))
                .affinity_fallback(shared)
                .processors(CpuSet::new())
                .build()
                .unwrap();

            assert_eq!(runner.worker_thread_count(), 0);
            assert_eq!(runner.dirigent_processor(), None);

            let recorder = ThreadRecorder::default();

            let parallel = runner
                .parallel(&recorder, 3, &ActiveCounters::none())
                .unwrap();
            assert_eq!(parallel.rows(), 0);
            assert!(parallel.is_empty());

            let serial = runner.serial(&recorder, 3, &ActiveCounters::none()).unwrap();
            assert_eq!(serial.rows(), 0);

            // Nothing was bound and nothing was called.
            assert_eq!(topology.bind_attempts(), 0);
            assert!(recorder.threads.lock().unwrap().is_empty());

            runner.shutdown().unwrap();
        });
    }

    #[test]
    fn disabled_binding_leaves_executors_unbound() {
        with_watchdog(|| {
            let topology = Arc::new(FakeTopology::with_processor_count(2));
            let shared: Arc<dyn Topology> = Arc::<FakeTopology>::clone(&topology);

            let runner = Runner::builder()
                .topology(Arc::clone(&shared))
                .affinity_fallback(shared)
                .binding(BindingMode::Disabled)
                .build()
                .unwrap();

            assert!(runner.executors.iter().all(|executor| !executor.is_bound()));
            assert_eq!(topology.bind_attempts(), 0);

            runner.shutdown().unwrap();
        });
    }

    #[test]
    fn explicit_processors_order_rows() {
        with_watchdog(|| {
            let topology: Arc<dyn Topology> = Arc::new(FakeTopology::with_processor_count(4));

            let mut runner = Runner::builder()
                .topology(Arc::clone(&topology))
                .affinity_fallback(topology)
                .processors([3, 1].into_iter().collect())
                .build()
                .unwrap();

            assert_eq!(runner.dirigent_processor(), Some(3));

            let matrix = runner
                .serial(&NullBenchmark, 2, &ActiveCounters::none())
                .unwrap();

            assert_eq!(matrix.processors().iter().collect::<Vec<_>>(), [3, 1]);
            assert!(matrix.as_slice().iter().all(|&timestamp| timestamp > 0));
        });
    }

    #[test]
    fn failure_aborts_round_and_runner_recovers() {
        with_watchdog(|| {
            let (mut runner, _) = runner_on(2);

            let result = runner.parallel(&Failing, 3, &ActiveCounters::none());

            assert!(matches!(result, Err(Error::BenchmarkPanicked { .. })));

            // Every executor is idle again.
            runner
                .parallel(&NullBenchmark, 1, &ActiveCounters::none())
                .unwrap();
        });
    }

    #[test]
    fn paired_runs_each_benchmark_on_its_set() {
        with_watchdog(|| {
            let (mut runner, _) = runner_on(4);
            let first = ThreadRecorder::default();
            let second = ThreadRecorder::default();

            let first_set: CpuSet = [2].into_iter().collect();
            let second_set: CpuSet = [0, 3].into_iter().collect();

            let matrix = runner
                .paired(&first, &second, &first_set, &second_set, 2, &ActiveCounters::none())
                .unwrap();

            assert_eq!(matrix.processors().iter().collect::<Vec<_>>(), [2, 0, 3]);
            assert_eq!(first.threads.lock().unwrap().len(), 2);
            assert_eq!(second.threads.lock().unwrap().len(), 4);
        });
    }

    #[test]
    fn paired_empty_sets_give_empty_matrix() {
        with_watchdog(|| {
            let (mut runner, _) = runner_on(2);

            let matrix = runner
                .paired(
                    &NullBenchmark,
                    &NullBenchmark,
                    &CpuSet::new(),
                    &CpuSet::new(),
                    5,
                    &ActiveCounters::none(),
                )
                .unwrap();

            assert!(matrix.is_empty());
            assert_eq!(matrix.rows(), 0);
        });
    }

    #[test]
    fn paired_sets_outside_runner_are_rejected() {
        with_watchdog(|| {
            let (mut runner, _) = runner_on(2);

            let result = runner.paired(
                &NullBenchmark,
                &NullBenchmark,
                &[0].into_iter().collect(),
                &[7].into_iter().collect(),
                1,
                &ActiveCounters::none(),
            );

            assert!(matches!(result, Err(Error::Configuration(_))));
        });
    }

    #[test]
    fn hours_minutes_seconds() {
        assert_eq!(split_hms(0), (0, 0, 0));
        assert_eq!(split_hms(59), (0, 0, 59));
        assert_eq!(split_hms(3_723), (1, 2, 3));
    }
}
