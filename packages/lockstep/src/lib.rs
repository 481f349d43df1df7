#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Measures benchmark kernels on many processors at once, with every measurement window of
//! every processor started and stopped in lockstep.
//!
//! A [`Runner`] owns one [`Executor`] per processor of a [`CpuSet`]. Each executor binds its
//! thread to its processor once and then runs the work it is handed: a [`Benchmark`] repeated a
//! number of times, each repetition bracketed by a timestamp pair and the hardware performance
//! counters of `lockstep_pmu`. Executors meet at a cyclic [`Barrier`] before the first and after
//! the last repetition, so measurements taken on different processors cover the same moments.
//!
//! Measurements land in a [`ResultMatrix`] with one row per processor, one measurement per
//! repetition and one column for the timestamp plus one per counter.
//!
//! # Policies
//!
//! * [`Runner::parallel()`] runs one benchmark on every processor at once.
//! * [`Runner::serial()`] runs it on one processor at a time, so windows never overlap.
//! * [`Runner::paired()`] runs two benchmarks at once on two disjoint sets of processors, for
//!   measuring interference.
//!
//! ```
//! use std::sync::Arc;
//!
//! use lockstep::{FakeTopology, NullBenchmark, Runner};
//! use lockstep_pmu::CounterSet;
//!
//! let mut runner = Runner::builder()
//!     .topology(Arc::new(FakeTopology::with_processor_count(2)))
//!     .build()?;
//!
//! // The default PMU backend has no counters, so only the timestamp column remains.
//! let counters = runner.activate_counters(&CounterSet::from_names(["cycles"]));
//! let matrix = runner.parallel(&NullBenchmark, 10, &counters)?;
//!
//! assert_eq!(matrix.rows(), 2);
//! assert!((0..10).all(|rep| matrix.timestamp(1, rep).unwrap() > 0));
//! # Ok::<(), lockstep::Error>(())
//! ```
//!
//! # The dirigent
//!
//! The executor of the first processor of a runner does not own a thread. Its work runs on the
//! thread that calls the runner, after every other executor has been woken up, so a runner over
//! K processors costs K - 1 threads and the calling thread takes part in every round.

mod affinity;
mod barrier;
mod benchmark;
mod cpu_set;
mod error;
mod executor;
mod registry;
mod result_matrix;
mod runner;
mod topology;
mod work;

pub use affinity::*;
pub use barrier::*;
pub use benchmark::*;
pub use cpu_set::*;
pub use error::*;
pub use executor::*;
pub use registry::*;
pub use result_matrix::*;
pub use runner::*;
pub use topology::*;
pub use work::*;
