use std::fs;

use crate::ProcessorId;
use crate::topology::linux::Filesystem;

/// The sysfs tree of the operating system the build targets.
#[derive(Debug, Default)]
pub(crate) struct BuildTargetFilesystem;

// Exercised by integration tests on real Linux.
#[cfg_attr(coverage_nightly, coverage(off))]
impl Filesystem for BuildTargetFilesystem {
    fn get_online_processors_contents(&self) -> Option<String> {
        fs::read_to_string("/sys/devices/system/cpu/online").ok()
    }

    fn get_thread_siblings_contents(&self, processor: ProcessorId) -> Option<String> {
        fs::read_to_string(format!(
            "/sys/devices/system/cpu/cpu{processor}/topology/thread_siblings_list"
        ))
        .ok()
    }

    fn get_cache_attribute_contents(
        &self,
        processor: ProcessorId,
        index: u32,
        attribute: &str,
    ) -> Option<String> {
        fs::read_to_string(format!(
            "/sys/devices/system/cpu/cpu{processor}/cache/index{index}/{attribute}"
        ))
        .ok()
    }
}
