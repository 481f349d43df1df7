use std::sync::{Arc, OnceLock};

use tracing::warn;

use crate::topology::linux::{Bindings, Filesystem, FilesystemFacade, SchedulerBindings};
use crate::{CacheGeometry, CpuSet, Error, ProcessorId, Result, Topology};

// Linux exposes at most a handful of cache indexes per processor. We stop at the first missing
// one, this is only an upper bound for malformed trees.
const MAX_CACHE_INDEXES: u32 = 16;

// Binding narrows the mask of the binding thread, which may later enumerate again, so the mask
// is read once per process, before the first binding.
static PROCESS_ALLOWED: OnceLock<Option<CpuSet>> = OnceLock::new();

/// The processor layout of the system the process runs on, read from sysfs.
///
/// Enumeration yields the online processors that the affinity mask of the process permitted
/// before any thread was bound through a system topology, in ascending order. Binding uses
/// `sched_setaffinity`.
#[derive(Debug)]
pub struct SystemTopology {
    bindings: Arc<dyn Bindings>,
    fs: FilesystemFacade,
    allowed_at_start: &'static OnceLock<Option<CpuSet>>,
}

impl SystemTopology {
    /// Creates a topology over the running system.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bindings: Arc::new(SchedulerBindings),
            fs: FilesystemFacade::target(),
            allowed_at_start: &PROCESS_ALLOWED,
        }
    }

    fn online_processors(&self) -> Option<CpuSet> {
        let contents = self.fs.get_online_processors_contents()?;

        match CpuSet::parse(&contents) {
            Ok(online) => Some(online),
            Err(error) => {
                warn!(
                    %error,
                    contents = contents.trim(),
                    "ignoring malformed list of online processors"
                );
                None
            }
        }
    }

    fn allowed_processors(&self) -> Option<CpuSet> {
        self.allowed_at_start
            .get_or_init(|| self.thread_processors())
            .clone()
    }

    fn thread_processors(&self) -> Option<CpuSet> {
        match self.bindings.current_thread_processors() {
            Ok(processors) => Some(processors),
            Err(error) => {
                warn!(%error, "cannot read the affinity mask of the current thread");
                None
            }
        }
    }

    fn cache_attribute(
        &self,
        processor: ProcessorId,
        index: u32,
        attribute: &str,
    ) -> Option<String> {
        self.fs
            .get_cache_attribute_contents(processor, index, attribute)
            .map(|contents| contents.trim().to_string())
    }
}

impl Default for SystemTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl Topology for SystemTopology {
    fn enumerate_processors(&self) -> CpuSet {
        match (self.online_processors(), self.allowed_processors()) {
            (Some(online), Some(allowed)) => online.intersection(&allowed),
            (Some(processors), None) | (None, Some(processors)) => processors,
            (None, None) => CpuSet::new(),
        }
    }

    fn enumerate_physical_cores(&self) -> CpuSet {
        let processors = self.enumerate_processors();

        processors
            .iter()
            .filter(|&processor| {
                let siblings = self
                    .fs
                    .get_thread_siblings_contents(processor)
                    .and_then(|contents| CpuSet::parse(&contents).ok());

                // A processor without sibling information is its own core.
                siblings.is_none_or(|siblings| {
                    siblings.intersection(&processors).iter().min() == Some(processor)
                })
            })
            .collect()
    }

    fn cache_geometry(&self, level: u8) -> Option<CacheGeometry> {
        let processor = self.enumerate_processors().get(0)?;
        let wanted_level = level.to_string();

        for index in 0..MAX_CACHE_INDEXES {
            let found_level = self.cache_attribute(processor, index, "level")?;

            if found_level != wanted_level {
                continue;
            }

            let cache_type = self.cache_attribute(processor, index, "type")?;

            if cache_type != "Data" && cache_type != "Unified" {
                continue;
            }

            let size = parse_cache_size(&self.cache_attribute(processor, index, "size")?)?;
            let line_size = self
                .cache_attribute(processor, index, "coherency_line_size")?
                .parse()
                .ok()?;

            return Some(CacheGeometry { size, line_size });
        }

        None
    }

    fn is_this_system(&self) -> bool {
        true
    }

    fn bind_current_thread(&self, processor: ProcessorId) -> Result<()> {
        // Taken before the first binding narrows the mask.
        self.allowed_processors();

        self.bindings
            .bind_current_thread(processor)
            .map_err(|source| Error::ResourceAcquisition {
                action: format!("bind the current thread to processor {processor}"),
                source,
            })
    }

    fn current_binding(&self) -> Option<ProcessorId> {
        let allowed = self.thread_processors()?;

        if allowed.len() == 1 {
            allowed.get(0)
        } else {
            None
        }
    }

    fn current_processor(&self) -> Option<ProcessorId> {
        self.bindings.current_processor()
    }
}

/// Parses a sysfs cache size such as `48K`, `2048K` or `32M` into bytes.
fn parse_cache_size(contents: &str) -> Option<usize> {
    let contents = contents.trim();

    let (number, multiplier) = match contents.char_indices().last()? {
        (position, 'K') => (contents.get(..position)?, 1024),
        (position, 'M') => (contents.get(..position)?, 1_048_576),
        (position, 'G') => (contents.get(..position)?, 1_073_741_824),
        _ => (contents, 1),
    };

    number.parse::<usize>().ok()?.checked_mul(multiplier)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    #![allow(clippy::arithmetic_side_effects, reason = "panic is fine in tests")]

    use std::io;
    use std::sync::Mutex;

    use mockall::predicate::eq;

    use super::*;
    use crate::topology::linux::{MockBindings, MockFilesystem};

    fn allowing(processors: &'static [ProcessorId]) -> MockBindings {
        let mut bindings = MockBindings::new();

        bindings
            .expect_current_thread_processors()
            .returning(move || Ok(processors.iter().copied().collect()));

        bindings
    }

    fn system_with(bindings: MockBindings, fs: MockFilesystem) -> SystemTopology {
        SystemTopology {
            bindings: Arc::new(bindings),
            fs: FilesystemFacade::from_mock(fs),
            // Each test is its own process as far as the snapshot is concerned.
            allowed_at_start: Box::leak(Box::new(OnceLock::new())),
        }
    }

    #[test]
    fn enumerates_online_processors_allowed_by_affinity() {
        let mut fs = MockFilesystem::new();
        fs.expect_get_online_processors_contents()
            .return_const(Some("0-5\n".to_string()));

        let topology = system_with(allowing(&[1, 2, 3, 7]), fs);

        assert_eq!(
            topology.enumerate_processors().iter().collect::<Vec<_>>(),
            [1, 2, 3]
        );
    }

    #[test]
    fn missing_online_list_uses_affinity_alone() {
        let mut fs = MockFilesystem::new();
        fs.expect_get_online_processors_contents().return_const(None);

        let topology = system_with(allowing(&[0, 4]), fs);

        assert_eq!(topology.enumerate_processors().to_string(), "0,4");
    }

    #[test]
    fn physical_cores_keep_lowest_available_sibling() {
        let mut fs = MockFilesystem::new();
        fs.expect_get_online_processors_contents()
            .return_const(Some("0-7".to_string()));
        fs.expect_get_thread_siblings_contents()
            .returning(|processor| Some(format!("{},{}", processor % 4, processor % 4 + 4)));

        // Processor 0 is not available, so its sibling 4 represents the core.
        let topology = system_with(allowing(&[1, 2, 3, 4, 5, 6, 7]), fs);

        assert_eq!(topology.enumerate_physical_cores().to_string(), "1-4");
    }

    #[test]
    fn cache_geometry_skips_instruction_caches() {
        let mut fs = MockFilesystem::new();
        fs.expect_get_online_processors_contents()
            .return_const(Some("0".to_string()));
        fs.expect_get_cache_attribute_contents()
            .returning(|_, index, attribute| {
                let value = match (index, attribute) {
                    (0 | 1, "level") => "1",
                    (0, "type") => "Instruction",
                    (1, "type") => "Data",
                    (1, "size") => "48K",
                    (1, "coherency_line_size") => "64",
                    (2, "level") => "2",
                    (2, "type") => "Unified",
                    (2, "size") => "2048K",
                    (2, "coherency_line_size") => "64",
                    _ => return None,
                };

                Some(format!("{value}\n"))
            });

        let topology = system_with(allowing(&[0]), fs);

        assert_eq!(
            topology.cache_geometry(1),
            Some(CacheGeometry {
                size: 48 * 1024,
                line_size: 64
            })
        );
        assert_eq!(
            topology.cache_geometry(2),
            Some(CacheGeometry {
                size: 2048 * 1024,
                line_size: 64
            })
        );
        assert_eq!(topology.cache_geometry(3), None);
    }

    #[test]
    fn binds_through_bindings() {
        let mut bindings = MockBindings::new();

        bindings
            .expect_current_thread_processors()
            .returning(|| Ok([0, 3].into_iter().collect()));
        bindings
            .expect_bind_current_thread()
            .with(eq(3))
            .times(1)
            .returning(|_| Ok(()));

        let topology = system_with(bindings, MockFilesystem::new());

        topology.bind_current_thread(3).unwrap();
    }

    #[test]
    fn refused_binding_is_resource_error() {
        let mut bindings = allowing(&[1]);

        bindings
            .expect_bind_current_thread()
            .returning(|_| Err(io::Error::from_raw_os_error(libc::EINVAL)));

        let topology = system_with(bindings, MockFilesystem::new());

        assert!(matches!(
            topology.bind_current_thread(1),
            Err(Error::ResourceAcquisition { .. })
        ));
    }

    #[test]
    fn binding_does_not_narrow_enumeration() {
        let mask: Arc<Mutex<CpuSet>> = Arc::new(Mutex::new((0..4).collect()));
        let mut bindings = MockBindings::new();

        bindings.expect_current_thread_processors().returning({
            let mask = Arc::clone(&mask);
            move || Ok(mask.lock().unwrap().clone())
        });
        bindings.expect_bind_current_thread().returning({
            let mask = Arc::clone(&mask);
            move |processor| {
                *mask.lock().unwrap() = [processor].into_iter().collect();
                Ok(())
            }
        });

        let mut fs = MockFilesystem::new();
        fs.expect_get_online_processors_contents()
            .return_const(Some("0-3\n".to_string()));

        let topology = system_with(bindings, fs);

        topology.bind_current_thread(2).unwrap();

        // The thread mask is now {2} but the process may still use every processor.
        assert_eq!(topology.current_binding(), Some(2));
        assert_eq!(topology.enumerate_processors().to_string(), "0-3");
    }

    #[test]
    fn current_binding_requires_single_processor() {
        let topology = system_with(allowing(&[6]), MockFilesystem::new());
        assert_eq!(topology.current_binding(), Some(6));

        let topology = system_with(allowing(&[1, 6]), MockFilesystem::new());
        assert_eq!(topology.current_binding(), None);
    }

    #[test]
    fn current_processor_comes_from_bindings() {
        let mut unknown = MockBindings::new();
        unknown.expect_current_processor().return_const(None);

        let mut running_on_two = MockBindings::new();
        running_on_two.expect_current_processor().return_const(Some(2));

        assert_eq!(
            system_with(unknown, MockFilesystem::new()).current_processor(),
            None
        );
        assert_eq!(
            system_with(running_on_two, MockFilesystem::new()).current_processor(),
            Some(2)
        );
    }

    #[test]
    fn cache_sizes() {
        assert_eq!(parse_cache_size("48K"), Some(49_152));
        assert_eq!(parse_cache_size("32M\n"), Some(32 * 1024 * 1024));
        assert_eq!(parse_cache_size("512"), Some(512));
        assert_eq!(parse_cache_size(""), None);
        assert_eq!(parse_cache_size("K"), None);
    }

    #[test]
    fn real_system_smoke_test() {
        let topology = SystemTopology::new();
        let processors = topology.enumerate_processors();

        assert!(!processors.is_empty());
        assert!(topology.enumerate_physical_cores().is_subset(&processors));
        assert!(topology.is_this_system());
    }
}
