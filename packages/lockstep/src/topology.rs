use std::fmt::Debug;

use crate::{CpuSet, ProcessorId, Result};

#[cfg(any(test, feature = "test-util"))]
mod fake;
#[cfg(any(test, feature = "test-util"))]
pub use fake::*;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::SystemTopology;

#[cfg(not(target_os = "linux"))]
mod fallback;
#[cfg(not(target_os = "linux"))]
pub use fallback::SystemTopology;

/// Size and line size of one level of data cache, in bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CacheGeometry {
    /// Total size of the cache.
    pub size: usize,

    /// Size of one cache line.
    pub line_size: usize,
}

/// Describes the processors of a system and binds threads to them.
///
/// The processors a topology enumerates are the ones the current process may run on. A topology
/// may describe a system other than the one the process runs on (for example a recorded layout),
/// in which case it reports so through [`is_this_system()`][Self::is_this_system] and threads are
/// bound through the operating system directly.
#[cfg_attr(test, mockall::automock)]
pub trait Topology: Debug + Send + Sync {
    /// Every logical processor available to the current process.
    fn enumerate_processors(&self) -> CpuSet;

    /// One logical processor per physical core, the lowest identifier of each core's siblings.
    fn enumerate_physical_cores(&self) -> CpuSet;

    /// Geometry of the data (or unified) cache at the given level, starting from 1.
    fn cache_geometry(&self, level: u8) -> Option<CacheGeometry>;

    /// Whether the topology describes the system the current process runs on.
    fn is_this_system(&self) -> bool;

    /// Restricts the current thread to one processor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceAcquisition`][crate::Error::ResourceAcquisition] if the operating
    /// system refuses the binding.
    fn bind_current_thread(&self, processor: ProcessorId) -> Result<()>;

    /// The processor the current thread is restricted to, if it is restricted to exactly one.
    fn current_binding(&self) -> Option<ProcessorId>;

    /// The processor the current thread is running on at this moment.
    fn current_processor(&self) -> Option<ProcessorId>;
}
