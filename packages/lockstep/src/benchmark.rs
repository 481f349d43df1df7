use std::any::Any;
use std::fmt::Debug;

use tracing::debug;

use crate::{Error, Result, Topology};

/// Cache size assumed when the topology does not report one.
pub const DEFAULT_CACHE_SIZE: usize = 32 * 1024;

/// Cache line size assumed when the topology does not report one.
pub const DEFAULT_LINE_SIZE: usize = 64;

/// Share of the cache that cache-sized benchmarks fill, leaving room for the stack and the
/// harness itself.
pub const DEFAULT_FILL_FACTOR: f64 = 0.9;

/// A compute kernel that can be measured.
///
/// One benchmark value is shared by all executors of a run, so the hooks take `&self`; anything
/// an executor mutates lives in the [`BenchmarkArg`] it creates. For every executor that runs
/// the benchmark, the hooks are called on that executor's thread in this order:
///
/// 1. [`init_arg()`][Self::init_arg] once, creating the argument.
/// 2. For every repetition, [`reset_arg()`][Self::reset_arg] outside the measurement window,
///    then [`call()`][Self::call] inside it.
/// 3. [`destroy_arg()`][Self::destroy_arg] once, consuming the argument.
///
/// [`configure()`][Self::configure] and [`parse_option()`][Self::parse_option] are called while
/// the benchmark is being registered, before any run.
pub trait Benchmark: Debug + Send + Sync {
    /// Name used to select the benchmark, matched case-insensitively.
    fn name(&self) -> &str;

    /// Adapts the benchmark to the system it runs on, such as sizing data to the cache.
    fn configure(&mut self, _config: &BenchmarkConfig) {}

    /// Applies one benchmark-specific option.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the option is unknown or the value is invalid. The
    /// default implementation accepts no options.
    fn parse_option(&mut self, option: &str, value: &str) -> Result<()> {
        Err(Error::Configuration(format!(
            "benchmark '{}' has no option '{option}' (value '{value}')",
            self.name()
        )))
    }

    /// Creates the argument that one executor passes to every call.
    fn init_arg(&self) -> BenchmarkArg {
        BenchmarkArg::empty()
    }

    /// Restores the argument to its initial state before a repetition.
    fn reset_arg(&self, _arg: &mut BenchmarkArg) {}

    /// Runs the kernel once. This is the code being measured.
    fn call(&self, arg: &mut BenchmarkArg);

    /// Releases the argument after the last repetition.
    fn destroy_arg(&self, arg: BenchmarkArg) {
        drop(arg);
    }
}

/// The state a benchmark keeps for one executor, opaque to the harness.
///
/// Created by [`Benchmark::init_arg()`], borrowed by [`Benchmark::reset_arg()`] and
/// [`Benchmark::call()`], consumed by [`Benchmark::destroy_arg()`]. An argument never leaves the
/// thread of the executor that created it.
///
/// ```
/// use lockstep::BenchmarkArg;
///
/// let mut arg = BenchmarkArg::new(vec![0_u64; 16]);
///
/// arg.downcast_mut::<Vec<u64>>().unwrap()[3] = 7;
/// assert_eq!(arg.downcast_ref::<Vec<u64>>().unwrap()[3], 7);
/// assert!(arg.downcast_ref::<String>().is_none());
/// ```
#[derive(Debug, Default)]
pub struct BenchmarkArg {
    value: Option<Box<dyn Any>>,
}

impl BenchmarkArg {
    /// Wraps a value.
    #[must_use]
    pub fn new<T: Any>(value: T) -> Self {
        Self {
            value: Some(Box::new(value)),
        }
    }

    /// An argument without a value, for benchmarks that need no state.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the argument holds no value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    /// The value, if it is a `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.as_ref()?.downcast_ref()
    }

    /// The value, if it is a `T`.
    #[must_use]
    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.value.as_mut()?.downcast_mut()
    }

    /// Takes the value out, if it is a `T`.
    #[must_use]
    pub fn into_inner<T: Any>(self) -> Option<T> {
        self.value?.downcast().ok().map(|value| *value)
    }
}

/// Properties of the system that benchmarks size their data by.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BenchmarkConfig {
    cache_size: usize,
    line_size: usize,
    fill_factor: f64,
}

impl BenchmarkConfig {
    /// Takes the cache sizes from the level 1 data cache of the topology, or the defaults if the
    /// topology does not know it.
    #[must_use]
    pub fn from_topology(topology: &dyn Topology) -> Self {
        let mut config = Self::default();

        if let Some(geometry) = topology.cache_geometry(1) {
            config.cache_size = geometry.size;
            config.line_size = geometry.line_size;
        } else {
            debug!(
                cache_size = config.cache_size,
                line_size = config.line_size,
                "topology reports no level 1 cache, assuming defaults"
            );
        }

        config
    }

    /// Sets the cache size in bytes.
    #[must_use]
    pub fn with_cache_size(mut self, bytes: usize) -> Self {
        self.cache_size = bytes;
        self
    }

    /// Sets the cache line size in bytes.
    ///
    /// # Panics
    ///
    /// Panics if the size is zero.
    #[must_use]
    pub fn with_line_size(mut self, bytes: usize) -> Self {
        assert!(bytes > 0, "cache line size must be positive");

        self.line_size = bytes;
        self
    }

    /// Sets the share of the cache to fill.
    ///
    /// # Panics
    ///
    /// Panics if the factor is not in `(0, 1]`.
    #[must_use]
    pub fn with_fill_factor(mut self, factor: f64) -> Self {
        assert!(
            factor > 0.0 && factor <= 1.0,
            "fill factor must be in (0, 1], got {factor}"
        );

        self.fill_factor = factor;
        self
    }

    /// Cache size in bytes.
    #[must_use]
    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    /// Cache line size in bytes.
    #[must_use]
    pub fn line_size(&self) -> usize {
        self.line_size
    }

    /// Share of the cache to fill.
    #[must_use]
    pub fn fill_factor(&self) -> f64 {
        self.fill_factor
    }

    /// Number of elements per dimension that fills the configured share of the cache with
    /// whole cache lines.
    ///
    /// `datasets` is the number of arrays the benchmark uses, `power` is how the dimension
    /// enters the memory requirement (1 for vectors, 2 for square matrices).
    ///
    /// ```
    /// use lockstep::BenchmarkConfig;
    ///
    /// let config = BenchmarkConfig::default();
    ///
    /// // Two vectors of u64 in 90% of a 32 KiB cache: 230 lines of 8 elements each.
    /// assert_eq!(config.elements_per_dimension(8, 2, 1), 1840);
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if any argument is zero.
    #[must_use]
    pub fn elements_per_dimension(
        &self,
        element_size: usize,
        datasets: usize,
        power: u32,
    ) -> usize {
        assert!(
            element_size > 0 && datasets > 0 && power > 0,
            "element size, dataset count and power must be positive"
        );

        #[expect(
            clippy::cast_precision_loss,
            reason = "cache sizes and dataset counts are far below the f64 mantissa range"
        )]
        let elements_per_set =
            self.cache_size as f64 * self.fill_factor / datasets as f64 / element_size as f64;

        let elements_per_dimension = elements_per_set.powf(f64::from(power).recip());

        #[expect(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "we want the whole number of elements, the value is never negative"
        )]
        let whole_elements = elements_per_dimension as usize;

        let elements_per_line = self.line_size.checked_div(element_size).unwrap_or(0).max(1);
        let lines = whole_elements.checked_div(elements_per_line).unwrap_or(0);

        let n = lines
            .saturating_mul(self.line_size)
            .checked_div(element_size)
            .unwrap_or(0);

        #[expect(
            clippy::cast_precision_loss,
            reason = "diagnostic only, precision does not matter"
        )]
        let bytes = (n as f64).powi(i32::try_from(power).unwrap_or(i32::MAX))
            * element_size as f64
            * datasets as f64;

        #[expect(
            clippy::cast_precision_loss,
            reason = "diagnostic only, precision does not matter"
        )]
        let percent = bytes * 100.0 / self.cache_size as f64;

        debug!(
            elements = n,
            bytes,
            cache_size = self.cache_size,
            percent,
            "sized benchmark data to the cache"
        );

        n
    }
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            line_size: DEFAULT_LINE_SIZE,
            fill_factor: DEFAULT_FILL_FACTOR,
        }
    }
}

/// A benchmark that does nothing, measuring the cost of the measurement itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullBenchmark;

impl Benchmark for NullBenchmark {
    fn name(&self) -> &str {
        "null"
    }

    fn call(&self, _arg: &mut BenchmarkArg) {}
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{CacheGeometry, FakeTopology};

    assert_impl_all!(BenchmarkConfig: Send, Sync);
    assert_impl_all!(NullBenchmark: Benchmark);

    #[test]
    fn arg_round_trips_its_value() {
        let arg = BenchmarkArg::new(String::from("state"));

        assert!(!arg.is_empty());
        assert_eq!(arg.into_inner::<String>().as_deref(), Some("state"));
    }

    #[test]
    fn empty_arg_has_no_value() {
        let mut arg = BenchmarkArg::empty();

        assert!(arg.is_empty());
        assert!(arg.downcast_mut::<u32>().is_none());
        assert!(arg.into_inner::<u32>().is_none());
    }

    #[test]
    fn default_options_are_rejected() {
        let mut benchmark = NullBenchmark;

        assert!(matches!(
            benchmark.parse_option("rounds", "5"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn config_follows_level_one_cache() {
        let topology = FakeTopology::with_processor_count(1).with_cache(
            1,
            CacheGeometry {
                size: 48 * 1024,
                line_size: 128,
            },
        );

        let config = BenchmarkConfig::from_topology(&topology);

        assert_eq!(config.cache_size(), 48 * 1024);
        assert_eq!(config.line_size(), 128);
    }

    #[test]
    fn config_without_cache_uses_defaults() {
        let config = BenchmarkConfig::from_topology(&FakeTopology::with_processor_count(1));

        assert_eq!(config, BenchmarkConfig::default());
    }

    #[test]
    fn square_matrices_fill_whole_lines() {
        let config = BenchmarkConfig::default();

        // 90% of 32 KiB over three matrices of u64 is 1228.8 elements each, a 35x35 matrix,
        // rounded down to whole lines of 8 elements.
        assert_eq!(config.elements_per_dimension(8, 3, 2), 32);
    }

    #[test]
    fn elements_scale_with_fill_factor() {
        let full = BenchmarkConfig::default().with_fill_factor(1.0);

        assert_eq!(full.elements_per_dimension(4, 1, 1), 8192);
    }

    #[test]
    #[should_panic]
    fn zero_fill_factor_panics() {
        let _config = BenchmarkConfig::default().with_fill_factor(0.0);
    }
}
