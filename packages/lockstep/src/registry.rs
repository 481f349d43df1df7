use std::fmt::{self, Display};

use itertools::Itertools;
use tracing::warn;

use crate::{Benchmark, BenchmarkConfig, Error, Result};

/// The benchmarks available to a run, looked up by case-insensitive name.
///
/// ```
/// use lockstep::{BenchmarkRegistry, NullBenchmark};
///
/// let registry = BenchmarkRegistry::builder().register(NullBenchmark).build()?;
///
/// assert!(registry.get("NULL").is_some());
/// assert!(registry.get("dgemm").is_none());
/// # Ok::<(), lockstep::Error>(())
/// ```
#[derive(Debug)]
pub struct BenchmarkRegistry {
    benchmarks: Vec<Box<dyn Benchmark>>,
    config: BenchmarkConfig,
}

impl BenchmarkRegistry {
    /// Starts assembling a registry.
    #[must_use]
    pub fn builder() -> BenchmarkRegistryBuilder {
        BenchmarkRegistryBuilder::default()
    }

    /// The benchmark with the given name, ignoring case.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&dyn Benchmark> {
        self.position(name)
            .and_then(|index| self.benchmarks.get(index))
            .map(AsRef::as_ref)
    }

    /// The named benchmarks in the requested order. Unknown names are skipped with a warning.
    #[must_use]
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> Vec<&dyn Benchmark> {
        names
            .iter()
            .filter_map(|name| {
                let name = name.as_ref();
                let benchmark = self.get(name);

                if benchmark.is_none() {
                    warn!(benchmark = name, "unknown benchmark, skipping");
                }

                benchmark
            })
            .collect()
    }

    /// Names of all benchmarks in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.benchmarks.iter().map(|benchmark| benchmark.name())
    }

    /// All benchmarks in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn Benchmark> {
        self.benchmarks.iter().map(AsRef::as_ref)
    }

    /// Number of registered benchmarks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.benchmarks.len()
    }

    /// Whether no benchmark is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.benchmarks.is_empty()
    }

    /// The configuration the benchmarks were sized with.
    #[must_use]
    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    /// Hands each option to the benchmark it names.
    ///
    /// Options for benchmarks that are not registered are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns the first error a benchmark reports for an option it does not accept.
    pub fn parse_args(&mut self, options: &BenchmarkOptions) -> Result<()> {
        for option in options.iter() {
            let Some(index) = self.position(option.benchmark()) else {
                warn!(%option, "option for unknown benchmark, skipping");
                continue;
            };

            self.benchmarks
                .get_mut(index)
                .expect("position returns valid indexes")
                .parse_option(option.option(), option.value())?;
        }

        Ok(())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.benchmarks
            .iter()
            .position(|benchmark| benchmark.name().eq_ignore_ascii_case(name))
    }
}

/// Assembles a [`BenchmarkRegistry`].
#[derive(Debug, Default)]
pub struct BenchmarkRegistryBuilder {
    benchmarks: Vec<Box<dyn Benchmark>>,
    config: BenchmarkConfig,
}

impl BenchmarkRegistryBuilder {
    /// Sets the configuration every benchmark is sized with.
    #[must_use]
    pub fn config(mut self, config: BenchmarkConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a benchmark.
    #[must_use]
    pub fn register(mut self, benchmark: impl Benchmark + 'static) -> Self {
        self.benchmarks.push(Box::new(benchmark));
        self
    }

    /// Configures every benchmark and assembles the registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if two benchmarks have the same name, ignoring case.
    pub fn build(self) -> Result<BenchmarkRegistry> {
        if let Some(duplicate) = self
            .benchmarks
            .iter()
            .map(|benchmark| benchmark.name().to_ascii_lowercase())
            .duplicates()
            .next()
        {
            return Err(Error::Configuration(format!(
                "more than one benchmark is named '{duplicate}'"
            )));
        }

        let mut benchmarks = self.benchmarks;

        for benchmark in &mut benchmarks {
            benchmark.configure(&self.config);
        }

        Ok(BenchmarkRegistry {
            benchmarks,
            config: self.config,
        })
    }
}

/// One benchmark-specific option, written `<benchmark>-<option>=<value>`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BenchmarkOption {
    benchmark: String,
    option: String,
    value: String,
}

impl BenchmarkOption {
    /// Parses `<benchmark>-<option>=<value>`, such as `fwq-rounds=20`.
    ///
    /// The benchmark name ends at the first `-`, so option names may contain dashes but
    /// benchmark names may not.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if any of the three parts is missing.
    pub fn parse(item: &str) -> Result<Self> {
        let malformed = || {
            Error::Configuration(format!(
                "benchmark option '{item}' is not of the form <benchmark>-<option>=<value>"
            ))
        };

        let (key, value) = item.split_once('=').ok_or_else(malformed)?;
        let (benchmark, option) = key.trim().split_once('-').ok_or_else(malformed)?;

        if benchmark.is_empty() || option.is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            benchmark: benchmark.to_string(),
            option: option.to_string(),
            value: value.trim().to_string(),
        })
    }

    /// Name of the benchmark the option is for.
    #[must_use]
    pub fn benchmark(&self) -> &str {
        &self.benchmark
    }

    /// Name of the option.
    #[must_use]
    pub fn option(&self) -> &str {
        &self.option
    }

    /// The value, possibly empty.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl Display for BenchmarkOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}={}", self.benchmark, self.option, self.value)
    }
}

/// Benchmark-specific options collected from the command surface.
#[derive(Clone, Debug, Default)]
pub struct BenchmarkOptions {
    options: Vec<BenchmarkOption>,
}

impl BenchmarkOptions {
    /// No options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses every item as a [`BenchmarkOption`].
    ///
    /// # Errors
    ///
    /// Returns the error of the first malformed item.
    pub fn parse<I, S>(items: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            options: items
                .into_iter()
                .map(|item| BenchmarkOption::parse(item.as_ref()))
                .collect::<Result<_>>()?,
        })
    }

    /// The options in the order given.
    pub fn iter(&self) -> impl Iterator<Item = &BenchmarkOption> {
        self.options.iter()
    }

    /// Whether there are no options.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}
