//! Simulated processor layouts for testing code that depends on a topology.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

use crate::{CacheGeometry, CpuSet, Error, ProcessorId, Result, Topology};

/// A topology with a configurable processor layout that only pretends to bind threads.
///
/// Bindings are recorded per thread, so [`current_binding()`][Topology::current_binding] on a
/// thread reports what that thread was bound to, without any effect on the scheduler.
///
/// ```
/// use lockstep::{FakeTopology, Topology};
///
/// let topology = FakeTopology::with_processor_count(4);
///
/// topology.bind_current_thread(2)?;
/// assert_eq!(topology.current_binding(), Some(2));
/// # Ok::<(), lockstep::Error>(())
/// ```
#[derive(Debug)]
pub struct FakeTopology {
    processors: CpuSet,
    physical_cores: Option<CpuSet>,
    caches: Vec<(u8, CacheGeometry)>,
    this_system: bool,
    failing_binding: bool,

    bindings: Mutex<HashMap<ThreadId, ProcessorId>>,
    bind_calls: AtomicUsize,
}

impl FakeTopology {
    /// A topology with the given processors, each its own physical core.
    #[must_use]
    pub fn new(processors: CpuSet) -> Self {
        Self {
            processors,
            physical_cores: None,
            caches: Vec::new(),
            this_system: true,
            failing_binding: false,
            bindings: Mutex::new(HashMap::new()),
            bind_calls: AtomicUsize::new(0),
        }
    }

    /// A topology with processors `0..count`.
    #[must_use]
    pub fn with_processor_count(count: ProcessorId) -> Self {
        Self::new((0..count).collect())
    }

    /// Sets the processors that represent physical cores.
    #[must_use]
    pub fn with_physical_cores(mut self, cores: CpuSet) -> Self {
        self.physical_cores = Some(cores);
        self
    }

    /// Adds a cache level.
    #[must_use]
    pub fn with_cache(mut self, level: u8, geometry: CacheGeometry) -> Self {
        self.caches.push((level, geometry));
        self
    }

    /// Marks the topology as describing some other system.
    #[must_use]
    pub fn foreign(mut self) -> Self {
        self.this_system = false;
        self
    }

    /// Makes every binding attempt fail.
    #[must_use]
    pub fn failing_binding(mut self) -> Self {
        self.failing_binding = true;
        self
    }

    /// The processor a thread was bound to through this topology.
    #[must_use]
    pub fn binding_of(&self, thread: ThreadId) -> Option<ProcessorId> {
        self.bindings
            .lock()
            .expect("poisoned lock - cannot continue execution")
            .get(&thread)
            .copied()
    }

    /// How many times any thread attempted to bind through this topology.
    #[must_use]
    pub fn bind_attempts(&self) -> usize {
        self.bind_calls.load(Ordering::Relaxed)
    }
}

impl Topology for FakeTopology {
    fn enumerate_processors(&self) -> CpuSet {
        self.processors.clone()
    }

    fn enumerate_physical_cores(&self) -> CpuSet {
        self.physical_cores
            .as_ref()
            .map_or_else(
                || self.processors.clone(),
                |cores| cores.intersection(&self.processors),
            )
    }

    fn cache_geometry(&self, level: u8) -> Option<CacheGeometry> {
        self.caches
            .iter()
            .find(|(cache_level, _)| *cache_level == level)
            .map(|(_, geometry)| *geometry)
    }

    fn is_this_system(&self) -> bool {
        self.this_system
    }

    fn bind_current_thread(&self, processor: ProcessorId) -> Result<()> {
        self.bind_calls.fetch_add(1, Ordering::Relaxed);

        let refusal = if self.failing_binding {
            Some("simulated binding failure")
        } else if !self.processors.contains(processor) {
            Some("processor is not part of the topology")
        } else {
            None
        };

        if let Some(reason) = refusal {
            return Err(Error::ResourceAcquisition {
                action: format!("bind the current thread to processor {processor}"),
                source: io::Error::new(io::ErrorKind::InvalidInput, reason),
            });
        }

        self.bindings
            .lock()
            .expect("poisoned lock - cannot continue execution")
            .insert(thread::current().id(), processor);

        Ok(())
    }

    fn current_binding(&self) -> Option<ProcessorId> {
        self.binding_of(thread::current().id())
    }

    fn current_processor(&self) -> Option<ProcessorId> {
        self.current_binding().or_else(|| self.processors.get(0))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(FakeTopology: Send, Sync);

    #[test]
    fn bindings_are_per_thread() {
        let topology = FakeTopology::with_processor_count(2);

        topology.bind_current_thread(1).unwrap();

        thread::scope(|s| {
            s.spawn(|| {
                assert_eq!(topology.current_binding(), None);
                assert_eq!(topology.current_processor(), Some(0));
            });
        });

        assert_eq!(topology.current_binding(), Some(1));
        assert_eq!(topology.bind_attempts(), 1);
    }

    #[test]
    fn unknown_processor_cannot_be_bound() {
        let topology = FakeTopology::with_processor_count(2);

        assert!(topology.bind_current_thread(5).is_err());
        assert_eq!(topology.current_binding(), None);
    }

    #[test]
    fn failing_binding_fails() {
        let topology = FakeTopology::with_processor_count(2).failing_binding();

        assert!(matches!(
            topology.bind_current_thread(0),
            Err(Error::ResourceAcquisition { .. })
        ));
    }

    #[test]
    fn layout_is_configurable() {
        let geometry = CacheGeometry {
            size: 32 * 1024,
            line_size: 64,
        };

        let topology = FakeTopology::with_processor_count(4)
            .with_physical_cores([0, 2, 9].into_iter().collect())
            .with_cache(1, geometry)
            .foreign();

        assert_eq!(topology.enumerate_physical_cores().to_string(), "0,2");
        assert_eq!(topology.cache_geometry(1), Some(geometry));
        assert_eq!(topology.cache_geometry(2), None);
        assert!(!topology.is_this_system());
    }
}
