#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]

//! Binary entry point for the lockstep tool.
//!
//! This module is excluded from mutation testing because testing process entry/exit behavior
//! is impractical - it requires spawning subprocesses and checking exit codes.

use std::io;
use std::process::ExitCode;
use std::time::Duration;

use argh::FromArgs;
use lockstep::{BindingMode, Layout, Synchronization};
use lockstep_cli::{
    DEFAULT_ITERATIONS, Policy, RunInput, RunOutcome, STDOUT, parse_synchronization, run,
};
use lockstep_pmu::CounterAccess;
use tracing_subscriber::EnvFilter;

/// Environment variable with the log filter, such as `debug` or `lockstep=trace`.
const LOG_FILTER_VARIABLE: &str = "LOCKSTEP_LOG";

/// Measures benchmark kernels on many processors at once, with the measurement windows of all
/// processors started and stopped in lockstep.
#[derive(FromArgs)]
struct Args {
    /// how benchmarks are spread over the processors (parallel, one-by-one, pair)
    #[argh(option, default = "Policy::default()")]
    policy: Policy,

    /// comma-separated benchmarks to run, all of them if not given
    #[argh(option)]
    benchmarks: Option<String>,

    /// measurements per processor and benchmark
    #[argh(option, default = "DEFAULT_ITERATIONS")]
    iterations: usize,

    /// list the available benchmarks and exit
    #[argh(switch)]
    list_benchmarks: bool,

    /// file to write measurements to, which must not exist yet; standard output if not given
    #[argh(option)]
    output: Option<String>,

    /// processors to measure on, in cpulist format such as 0-3,8; all available if not given
    #[argh(option)]
    cpuset_1: Option<String>,

    /// processors that run the second benchmark of the pair policy, in cpulist format
    #[argh(option)]
    cpuset_2: Option<String>,

    /// comma-separated hardware performance counters to measure
    #[argh(option)]
    pmcs: Option<String>,

    /// how counters are accessed (auto, none, perf, rdpmc, msr, lwk-pmc, lwk-msr, arm)
    #[argh(option, default = "CounterAccess::default()")]
    counter_access: CounterAccess,

    /// use only one logical processor per physical core
    #[argh(switch)]
    no_ht: bool,

    /// do not bind executor threads to their processors
    #[argh(switch)]
    disable_binding: bool,

    /// how often executors meet at the barrier (invocation, repetition)
    #[argh(option, from_str_fn(parse_synchronization))]
    sync: Option<Synchronization>,

    /// barrier release skew in microseconds above which wake-ups are reported
    #[argh(option)]
    skew_tolerance_us: Option<u64>,

    /// output layout (wide, long)
    #[argh(option, default = "Layout::default()")]
    layout: Layout,

    /// cache size in bytes that benchmarks size their data by, defaults to the L1 data cache
    #[argh(option)]
    size: Option<usize>,

    /// share of the cache that benchmarks fill, greater than 0 and at most 1
    #[argh(option)]
    fill: Option<f64>,

    /// benchmark option as <benchmark>-<option>=<value>, such as fwq-rounds=20; repeatable
    #[argh(option)]
    option: Vec<String>,
}

fn comma_separated(list: Option<&str>) -> Vec<String> {
    let Some(list) = list else {
        return Vec::new();
    };

    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

// Binary entry point - mutations would require subprocess testing which is impractical.
#[cfg_attr(test, mutants::skip)]
fn main() -> ExitCode {
    let env_args: Vec<String> = std::env::args().collect();
    let str_args: Vec<&str> = env_args.iter().map(String::as_str).collect();

    let program_name = str_args
        .first()
        .expect("std::env::args() always provides at least the program name");

    let args: Args = match Args::from_args(&[program_name], str_args.get(1..).unwrap_or(&[])) {
        Ok(args) => args,
        Err(early_exit) => {
            println!("{}", early_exit.output);
            return if early_exit.output.contains("help") {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            };
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_FILTER_VARIABLE).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let input = RunInput {
        policy: args.policy,
        benchmarks: comma_separated(args.benchmarks.as_deref()),
        iterations: args.iterations,
        list_benchmarks: args.list_benchmarks,
        output: args.output.unwrap_or_else(|| STDOUT.to_string()),
        cpuset_1: args.cpuset_1,
        cpuset_2: args.cpuset_2,
        pmcs: comma_separated(args.pmcs.as_deref()),
        counter_access: args.counter_access,
        no_hyperthreads: args.no_ht,
        binding: if args.disable_binding {
            BindingMode::Disabled
        } else {
            BindingMode::Enabled
        },
        synchronization: args.sync.unwrap_or_default(),
        skew_tolerance: args
            .skew_tolerance_us
            .map_or(lockstep::DEFAULT_SKEW_TOLERANCE, Duration::from_micros),
        layout: args.layout,
        cache_size: args.size,
        fill: args.fill,
        options: args.option,
    };

    match run(&input) {
        Ok(RunOutcome::Listed { .. } | RunOutcome::Measured { .. }) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
