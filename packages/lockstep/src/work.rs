use std::panic::{self, AssertUnwindSafe};

use lockstep_pmu::{ActiveCounters, MeasurementSession, PmuBackend};

use crate::error::panic_message;
use crate::{Barrier, Benchmark, Error, ProcessorId, Result};

/// How often the participants of a run meet at the barrier.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum Synchronization {
    /// Before the first and after the last repetition of the benchmark.
    #[default]
    PerInvocation,

    /// As `PerInvocation`, plus before every repetition, so that every repetition starts at the
    /// same moment on all processors.
    PerRepetition,
}

/// One executor's share of a measurement round: run a benchmark `repetitions` times and write
/// one measurement row per repetition.
///
/// The output holds `repetitions` rows of `1 + counters` values each.
#[derive(Debug)]
pub struct WorkItem<'a> {
    benchmark: &'a dyn Benchmark,
    pmu: &'a dyn PmuBackend,
    counters: &'a ActiveCounters,
    output: &'a mut [u64],
    barrier: &'a Barrier,
    synchronization: Synchronization,
    processor: ProcessorId,
}

impl<'a> WorkItem<'a> {
    /// Creates the work for the executor of `processor`, writing into `output`.
    ///
    /// # Panics
    ///
    /// Panics if the length of `output` is not a whole number of measurement rows.
    #[must_use]
    pub fn new(
        benchmark: &'a dyn Benchmark,
        pmu: &'a dyn PmuBackend,
        counters: &'a ActiveCounters,
        output: &'a mut [u64],
        barrier: &'a Barrier,
        processor: ProcessorId,
    ) -> Self {
        let columns = counters.len().wrapping_add(1);

        assert!(
            output.len().checked_rem(columns) == Some(0),
            "output of {} values is not a whole number of rows of {columns} values",
            output.len()
        );

        Self {
            benchmark,
            pmu,
            counters,
            output,
            barrier,
            synchronization: Synchronization::default(),
            processor,
        }
    }

    /// Sets how often the work meets the other participants at the barrier.
    #[must_use]
    pub fn synchronization(mut self, synchronization: Synchronization) -> Self {
        self.synchronization = synchronization;
        self
    }

    /// Number of repetitions, one per output row.
    #[must_use]
    pub fn repetitions(&self) -> usize {
        self.output
            .len()
            .checked_div(self.counters.len().wrapping_add(1))
            .unwrap_or(0)
    }

    /// Runs the benchmark lifecycle on the current thread.
    ///
    /// The barrier discipline is kept even when something fails, so the other participants
    /// are never left waiting: a failed step skips the remaining measurements but not the
    /// barrier waits.
    ///
    /// # Errors
    ///
    /// Returns the first failure: a panicking benchmark hook or counters that cannot be
    /// programmed or read.
    pub fn execute(self) -> Result<()> {
        let Self {
            benchmark,
            pmu,
            counters,
            output,
            barrier,
            synchronization,
            processor,
        } = self;

        let mut first_error = None;

        let mut arg = record(
            &mut first_error,
            contain(benchmark, processor, || benchmark.init_arg()),
        );

        // The session programs the counters of this thread's processor.
        let mut session = arg.as_ref().and_then(|_| {
            record(
                &mut first_error,
                MeasurementSession::open(pmu, counters).map_err(Error::from),
            )
        });

        barrier.wait();

        for row in output.chunks_exact_mut(counters.len().wrapping_add(1)) {
            if synchronization == Synchronization::PerRepetition {
                barrier.wait();
            }

            if first_error.is_some() {
                continue;
            }

            let (Some(arg), Some(session)) = (arg.as_mut(), session.as_mut()) else {
                continue;
            };

            let measured = contain(benchmark, processor, || {
                benchmark.reset_arg(arg);
                session.measure(row, || benchmark.call(arg))
            });

            record(&mut first_error, measured.and_then(|r| r.map_err(Error::from)));
        }

        barrier.wait();

        drop(session);

        if let Some(arg) = arg {
            record(
                &mut first_error,
                contain(benchmark, processor, || benchmark.destroy_arg(arg)),
            );
        }

        first_error.map_or(Ok(()), Err)
    }
}

// Runs a benchmark hook, turning a panic into an error.
fn contain<R>(
    benchmark: &dyn Benchmark,
    processor: ProcessorId,
    hook: impl FnOnce() -> R,
) -> Result<R> {
    panic::catch_unwind(AssertUnwindSafe(hook)).map_err(|payload| Error::BenchmarkPanicked {
        benchmark: benchmark.name().to_string(),
        processor,
        message: panic_message(payload.as_ref()),
    })
}

fn record<T>(first_error: &mut Option<Error>, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(error) => {
            if first_error.is_none() {
                *first_error = Some(error);
            }

            None
        }
    }
}
