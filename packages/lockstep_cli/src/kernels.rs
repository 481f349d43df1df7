//! The benchmark kernels the command line tool ships with.

use std::hint::black_box;

use lockstep::{
    Benchmark, BenchmarkArg, BenchmarkConfig, BenchmarkRegistry, Error, NullBenchmark, Result,
};

/// Iterations of the empty loop that make up one quantum of fixed work.
const QUANTUM: u64 = 1 << 20;

/// Rounds per call unless configured with `<kernel>-rounds=<n>`.
const DEFAULT_ROUNDS: u32 = 10;

/// Registers every kernel, sized by `config`.
///
/// # Errors
///
/// Returns [`Error::Configuration`] if two kernels share a name.
pub(crate) fn registry(config: BenchmarkConfig) -> Result<BenchmarkRegistry> {
    BenchmarkRegistry::builder()
        .config(config)
        .register(NullBenchmark)
        .register(FixedWorkQuantum::default())
        .register(Syscall::default())
        .register(VectorCopy::default())
        .build()
}

fn parse_rounds(benchmark: &str, option: &str, value: &str) -> Result<u32> {
    match option {
        "rounds" => value.parse().map_err(|e| {
            Error::Configuration(format!(
                "benchmark '{benchmark}' expects a number of rounds, got '{value}': {e}"
            ))
        }),
        _ => Err(Error::Configuration(format!(
            "benchmark '{benchmark}' has no option '{option}' (value '{value}')"
        ))),
    }
}

/// Fixed work quantum: a fixed number of empty loops, each of [`QUANTUM`] iterations.
///
/// Anything that interrupts the processor shows up as a longer measurement, which makes this
/// the kernel for measuring operating system noise.
#[derive(Debug)]
struct FixedWorkQuantum {
    rounds: u32,
}

impl Default for FixedWorkQuantum {
    fn default() -> Self {
        Self {
            rounds: DEFAULT_ROUNDS,
        }
    }
}

impl Benchmark for FixedWorkQuantum {
    fn name(&self) -> &str {
        "fwq"
    }

    fn parse_option(&mut self, option: &str, value: &str) -> Result<()> {
        self.rounds = parse_rounds(self.name(), option, value)?;
        Ok(())
    }

    fn call(&self, _arg: &mut BenchmarkArg) {
        for _ in 0..self.rounds {
            for iteration in 0..QUANTUM {
                black_box(iteration);
            }
        }
    }
}

/// Enters the kernel with a cheap system call, a fixed number of times.
#[derive(Debug)]
struct Syscall {
    rounds: u32,
}

impl Default for Syscall {
    fn default() -> Self {
        Self {
            rounds: DEFAULT_ROUNDS,
        }
    }
}

impl Benchmark for Syscall {
    fn name(&self) -> &str {
        "syscall"
    }

    fn parse_option(&mut self, option: &str, value: &str) -> Result<()> {
        self.rounds = parse_rounds(self.name(), option, value)?;
        Ok(())
    }

    fn call(&self, _arg: &mut BenchmarkArg) {
        for _ in 0..self.rounds {
            black_box(cheap_syscall());
        }
    }
}

#[cfg(unix)]
fn cheap_syscall() -> u32 {
    use std::os::unix::process;

    process::parent_id()
}

#[cfg(not(unix))]
fn cheap_syscall() -> u32 {
    use std::process;

    process::id()
}

/// Copies one cache-sized vector into another.
#[derive(Debug, Default)]
struct VectorCopy {
    elements: usize,
}

/// Source and destination of one executor's copy.
#[derive(Debug)]
struct CopyBuffers {
    source: Vec<u64>,
    destination: Vec<u64>,
}

impl Benchmark for VectorCopy {
    fn name(&self) -> &str {
        "copy"
    }

    fn configure(&mut self, config: &BenchmarkConfig) {
        self.elements = config.elements_per_dimension(size_of::<u64>(), 2, 1);
    }

    fn init_arg(&self) -> BenchmarkArg {
        BenchmarkArg::new(CopyBuffers {
            source: (0_u64..).take(self.elements).collect(),
            destination: vec![0; self.elements],
        })
    }

    fn reset_arg(&self, arg: &mut BenchmarkArg) {
        if let Some(buffers) = arg.downcast_mut::<CopyBuffers>() {
            buffers.destination.fill(0);
        }
    }

    fn call(&self, arg: &mut BenchmarkArg) {
        if let Some(buffers) = arg.downcast_mut::<CopyBuffers>() {
            buffers.destination.copy_from_slice(&buffers.source);
            black_box(&mut buffers.destination);
        }
    }
}
