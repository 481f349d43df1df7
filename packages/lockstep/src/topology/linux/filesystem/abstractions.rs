#![cfg_attr(
    test,
    expect(
        clippy::struct_field_names,
        reason = "false positive from automock generated code"
    )
)]

use std::fmt::Debug;

use crate::ProcessorId;

/// The parts of the sysfs virtual filesystem that describe processors and caches.
///
/// Every read returns `None` if the file does not exist, which happens on kernels or
/// virtualized environments that do not expose the information.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait Filesystem: Debug + Send + Sync + 'static {
    /// Contents of `/sys/devices/system/cpu/online`, a cpulist.
    fn get_online_processors_contents(&self) -> Option<String>;

    /// Contents of `/sys/devices/system/cpu/cpu{N}/topology/thread_siblings_list`, a cpulist of
    /// the logical processors sharing a physical core with processor N (including itself).
    fn get_thread_siblings_contents(&self, processor: ProcessorId) -> Option<String>;

    /// Contents of `/sys/devices/system/cpu/cpu{N}/cache/index{I}/{attribute}`.
    ///
    /// The attributes we read are `level` (a number), `type` (`Data`, `Instruction` or
    /// `Unified`), `size` (such as `48K`) and `coherency_line_size` (bytes).
    fn get_cache_attribute_contents(
        &self,
        processor: ProcessorId,
        index: u32,
        attribute: &str,
    ) -> Option<String>;
}
