// Public API types for the lockstep command line tool.
//
// These types are used by main.rs and exposed via the crate's public API.

use std::fmt::{self, Display};
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use lockstep::{BindingMode, Layout, Synchronization};
use lockstep_pmu::CounterAccess;
use thiserror::Error;

/// How the selected benchmarks are spread over the processors.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum Policy {
    /// Every processor at once.
    Parallel,

    /// One processor at a time.
    #[default]
    Serial,

    /// Two benchmarks at once on two disjoint processor sets.
    Pair,
}

// Mutations to match arms are caught by the parsing test, but the aliases are not worth one
// test each.
#[cfg_attr(test, mutants::skip)]
impl FromStr for Policy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "parallel" => Ok(Self::Parallel),
            "serial" | "onebyone" | "one-by-one" => Ok(Self::Serial),
            "pair" | "paired" => Ok(Self::Pair),
            _ => Err(format!(
                "Invalid policy: '{s}'. Valid options are: parallel, one-by-one, pair"
            )),
        }
    }
}

impl Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parallel => f.write_str("parallel"),
            Self::Serial => f.write_str("one-by-one"),
            Self::Pair => f.write_str("pair"),
        }
    }
}

/// Parses how often executors meet at the barrier: `invocation` (before the first and after the
/// last repetition) or `repetition` (before every repetition as well).
///
/// # Errors
///
/// Returns a description of the valid values if the value is neither.
pub fn parse_synchronization(value: &str) -> Result<Synchronization, String> {
    match value.to_lowercase().as_str() {
        "invocation" => Ok(Synchronization::PerInvocation),
        "repetition" => Ok(Synchronization::PerRepetition),
        _ => Err(format!(
            "Invalid synchronization: '{value}'. Valid options are: invocation, repetition"
        )),
    }
}

/// Input parameters for the `run` function.
///
/// This is the parsed and validated input that the core logic operates on.
#[doc(hidden)]
#[derive(Debug)]
#[allow(
    clippy::exhaustive_structs,
    reason = "This is a hidden struct for internal/test use only"
)]
pub struct RunInput {
    /// How the benchmarks are spread over the processors.
    pub policy: Policy,
    /// Names of the benchmarks to run, all of them if empty.
    pub benchmarks: Vec<String>,
    /// Measurements per processor and benchmark.
    pub iterations: usize,
    /// List the available benchmarks instead of running any.
    pub list_benchmarks: bool,
    /// Where measurements go, `-` for standard output.
    pub output: String,
    /// The processors to measure on, in cpulist format. All available ones if absent.
    pub cpuset_1: Option<String>,
    /// The second processor set of the pair policy, in cpulist format.
    pub cpuset_2: Option<String>,
    /// Hardware performance counters to measure.
    pub pmcs: Vec<String>,
    /// How the hardware performance counters are accessed.
    pub counter_access: CounterAccess,
    /// Use one logical processor per physical core only.
    pub no_hyperthreads: bool,
    /// Whether executors bind their threads to their processors.
    pub binding: BindingMode,
    /// How often executors meet at the barrier.
    pub synchronization: Synchronization,
    /// Barrier release skew above which wake-ups are reported.
    pub skew_tolerance: Duration,
    /// How measurements are laid out in the output.
    pub layout: Layout,
    /// Cache size that benchmarks size their data by, instead of the level 1 data cache.
    pub cache_size: Option<usize>,
    /// Share of the cache that benchmarks fill.
    pub fill: Option<f64>,
    /// Benchmark options, each `<benchmark>-<option>=<value>`.
    pub options: Vec<String>,
}

impl Default for RunInput {
    fn default() -> Self {
        Self {
            policy: Policy::default(),
            benchmarks: Vec::new(),
            iterations: DEFAULT_ITERATIONS,
            list_benchmarks: false,
            output: STDOUT.to_string(),
            cpuset_1: None,
            cpuset_2: None,
            pmcs: Vec::new(),
            counter_access: CounterAccess::default(),
            no_hyperthreads: false,
            binding: BindingMode::default(),
            synchronization: Synchronization::default(),
            skew_tolerance: lockstep::DEFAULT_SKEW_TOLERANCE,
            layout: Layout::default(),
            cache_size: None,
            fill: None,
            options: Vec::new(),
        }
    }
}

/// Measurements per processor and benchmark unless configured otherwise.
pub const DEFAULT_ITERATIONS: usize = 13;

/// The output destination that means standard output.
pub const STDOUT: &str = "-";

/// The outcome of a successful run.
#[doc(hidden)]
#[derive(Clone, Debug, Eq, PartialEq)]
#[allow(
    clippy::exhaustive_enums,
    reason = "This is a hidden enum for internal/test use only"
)]
pub enum RunOutcome {
    /// The available benchmarks were listed.
    Listed {
        /// Names of the benchmarks, in registration order.
        benchmarks: Vec<String>,
    },
    /// Benchmarks were measured and their results written.
    Measured {
        /// Names of the result sections written, in output order.
        sections: Vec<String>,
    },
}

/// Errors that can occur during a run.
#[doc(hidden)]
#[derive(Debug, Error)]
#[allow(
    clippy::exhaustive_enums,
    reason = "This is a hidden enum for internal/test use only"
)]
pub enum RunError {
    /// The command line does not describe a run that can be performed.
    #[error("{0}")]
    Usage(String),

    /// Preparing or performing the measurements failed.
    #[error(transparent)]
    Measurement(#[from] lockstep::Error),

    /// The hardware performance counters cannot be accessed as requested.
    #[error(transparent)]
    Counters(#[from] lockstep_pmu::Error),

    /// The output file exists and would be overwritten.
    #[error("output file {} already exists, refusing to overwrite it", path.display())]
    OutputExists {
        /// The output file.
        path: PathBuf,
    },

    /// Measurements could not be written.
    #[error("cannot write measurements to {destination}")]
    Output {
        /// The output destination.
        destination: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}
