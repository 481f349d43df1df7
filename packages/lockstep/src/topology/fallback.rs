use std::cell::Cell;
use std::num::NonZeroUsize;

use crate::{CacheGeometry, CpuSet, ProcessorId, Topology};

thread_local! {
    /// The processor the current thread was bound to, if any.
    ///
    /// Binding is simulated on platforms without a scheduler affinity API that we support, so
    /// that binding verification behaves as on real platforms.
    static BOUND_PROCESSOR: Cell<Option<ProcessorId>> = const { Cell::new(None) };
}

/// Processor layout of a platform without topology support: `available_parallelism()`
/// processors numbered from zero, one per core, with no cache information.
#[derive(Debug, Default)]
pub struct SystemTopology;

impl SystemTopology {
    /// Creates a topology over the running system.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Topology for SystemTopology {
    fn enumerate_processors(&self) -> CpuSet {
        let count = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);

        (0..ProcessorId::try_from(count).unwrap_or(ProcessorId::MAX)).collect()
    }

    fn enumerate_physical_cores(&self) -> CpuSet {
        self.enumerate_processors()
    }

    fn cache_geometry(&self, _level: u8) -> Option<CacheGeometry> {
        None
    }

    fn is_this_system(&self) -> bool {
        true
    }

    fn bind_current_thread(&self, processor: ProcessorId) -> crate::Result<()> {
        BOUND_PROCESSOR.set(Some(processor));
        Ok(())
    }

    fn current_binding(&self) -> Option<ProcessorId> {
        BOUND_PROCESSOR.get()
    }

    fn current_processor(&self) -> Option<ProcessorId> {
        BOUND_PROCESSOR.get()
    }
}
