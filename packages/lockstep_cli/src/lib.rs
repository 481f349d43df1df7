#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Command line harness that measures benchmark kernels on many processors in lockstep.
//!
//! This crate provides the core logic of the `lockstep` tool, exposed via the [`run`] function.
//! The binary entry point is in `main.rs`.

mod kernels;
mod output;
mod types;

use std::io::{self, Write};
use std::sync::Arc;

use lockstep::{
    Benchmark, BenchmarkConfig, BenchmarkOptions, CpuSet, ResultMatrix, Runner, SystemTopology,
    Topology,
};
use lockstep_pmu::{CounterSet, backend_for};
use tracing::{info, warn};
pub use types::*;

/// Core logic of the tool, extracted for testability.
///
/// This function contains all the business logic without any process-global dependencies
/// like `std::env::args()`, making it suitable for direct testing.
#[doc(hidden)]
pub fn run(input: &RunInput) -> Result<RunOutcome, RunError> {
    run_with_topology(input, Arc::new(SystemTopology::new()))
}

/// Internal implementation of `run` that accepts a topology.
///
/// This allows running on simulated processors in tests.
fn run_with_topology(
    input: &RunInput,
    topology: Arc<dyn Topology>,
) -> Result<RunOutcome, RunError> {
    let mut config = BenchmarkConfig::from_topology(&*topology);

    if let Some(bytes) = input.cache_size {
        config = config.with_cache_size(bytes);
    }

    if let Some(fill) = input.fill {
        if fill.is_nan() || fill <= 0.0 || fill > 1.0 {
            return Err(RunError::Usage(format!(
                "fill factor must be greater than 0 and at most 1, got {fill}"
            )));
        }

        config = config.with_fill_factor(fill);
    }

    let mut registry = kernels::registry(config)?;
    registry.parse_args(&BenchmarkOptions::parse(&input.options)?)?;

    if input.list_benchmarks {
        let benchmarks: Vec<String> = registry.names().map(str::to_string).collect();

        for name in &benchmarks {
            println!("{name}");
        }

        return Ok(RunOutcome::Listed { benchmarks });
    }

    let selected = if input.benchmarks.is_empty() {
        registry.iter().collect()
    } else {
        registry.select(&input.benchmarks)
    };

    if selected.is_empty() {
        return Err(RunError::Usage(format!(
            "none of the requested benchmarks exist, available are: {}",
            registry.names().collect::<Vec<_>>().join(", ")
        )));
    }

    let processor_sets = ProcessorSets::resolve(input, &*topology)?;

    // An existing file is refused before anything is measured, but the file is only created
    // once every measurement has succeeded.
    output::ensure_absent(&input.output)?;

    let pmu = backend_for(input.counter_access)?;

    let mut runner = Runner::builder()
        .processors(processor_sets.all())
        .topology(Arc::clone(&topology))
        .affinity_fallback(topology)
        .pmu(pmu)
        .binding(input.binding)
        .synchronization(input.synchronization)
        .skew_tolerance(input.skew_tolerance)
        .build()?;

    let counters = runner.activate_counters(&CounterSet::from_names(input.pmcs.iter().cloned()));

    info!(
        policy = %input.policy,
        processors = %runner.processors(),
        iterations = input.iterations,
        counters = counters.len(),
        "starting measurements"
    );

    let mut results: Vec<(String, ResultMatrix)> = Vec::new();

    match (input.policy, &processor_sets) {
        (Policy::Pair, ProcessorSets::Pair { first, second }) => {
            for (a, b) in pairs(&selected) {
                let name = format!("{}+{}", a.name(), b.name());
                info!(benchmark = %name, "measuring");

                let matrix = runner.paired(a, b, first, second, input.iterations, &counters)?;
                results.push((name, matrix));
            }
        }
        _ => {
            for benchmark in selected {
                let name = benchmark.name();
                info!(benchmark = name, "measuring");

                let matrix = match input.policy {
                    Policy::Parallel => runner.parallel(benchmark, input.iterations, &counters)?,
                    _ => runner.serial(benchmark, input.iterations, &counters)?,
                };
                results.push((name.to_string(), matrix));
            }
        }
    }

    runner.shutdown()?;

    let write_failed = |source: io::Error| RunError::Output {
        destination: input.output.clone(),
        source,
    };

    let mut out = output::open(&input.output)?;

    for (name, matrix) in &results {
        matrix
            .render(name, &mut out, input.layout)
            .map_err(write_failed)?;
    }

    out.flush().map_err(write_failed)?;

    let sections = results.into_iter().map(|(name, _)| name).collect();

    Ok(RunOutcome::Measured { sections })
}

/// The processors a run measures on.
#[derive(Debug)]
enum ProcessorSets {
    Single(CpuSet),
    Pair { first: CpuSet, second: CpuSet },
}

impl ProcessorSets {
    fn resolve(input: &RunInput, topology: &dyn Topology) -> Result<Self, RunError> {
        let available = if input.no_hyperthreads {
            topology.enumerate_physical_cores()
        } else {
            topology.enumerate_processors()
        };

        let restrict = |cpulist: Option<&str>| -> Result<Option<CpuSet>, RunError> {
            let Some(cpulist) = cpulist else {
                return Ok(None);
            };

            let requested = CpuSet::parse(cpulist)?;

            Ok(Some(if input.no_hyperthreads {
                requested.intersection(&available)
            } else {
                requested
            }))
        };

        let first = restrict(input.cpuset_1.as_deref())?;
        let second = restrict(input.cpuset_2.as_deref())?;

        if input.policy != Policy::Pair {
            if second.is_some() {
                warn!("the second processor set is only used by the pair policy, ignoring it");
            }

            return Ok(Self::Single(first.unwrap_or(available)));
        }

        let (Some(first), Some(second)) = (first, second) else {
            return Err(RunError::Usage(
                "the pair policy needs both --cpuset-1 and --cpuset-2".to_string(),
            ));
        };

        if !first.is_disjoint(&second) {
            return Err(RunError::Usage(format!(
                "the processor sets of the pair policy must not intersect: {first} and {second}"
            )));
        }

        if first.is_empty() && second.is_empty() {
            return Err(RunError::Usage(
                "the processor sets of the pair policy are both empty".to_string(),
            ));
        }

        Ok(Self::Pair { first, second })
    }

    fn all(&self) -> CpuSet {
        match self {
            Self::Single(set) => set.clone(),
            Self::Pair { first, second } => first.union(second),
        }
    }
}

/// Consecutive benchmarks, two at a time. An odd one out is paired with itself.
fn pairs<'a>(
    benchmarks: &[&'a dyn Benchmark],
) -> impl Iterator<Item = (&'a dyn Benchmark, &'a dyn Benchmark)> {
    benchmarks.chunks(2).filter_map(|chunk| match *chunk {
        [a, b] => Some((a, b)),
        [a] => Some((a, a)),
        _ => None,
    })
}
