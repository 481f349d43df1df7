#![cfg_attr(
    test,
    expect(
        clippy::struct_field_names,
        reason = "false positive from automock generated code"
    )
)]

use std::fmt::Debug;
use std::{io, mem};

use libc::cpu_set_t;

use crate::{CpuSet, ProcessorId};

/// Number of processors a fixed-size `cpu_set_t` can describe.
const CPU_SET_CAPACITY: usize = size_of::<cpu_set_t>().wrapping_mul(8);

/// Scheduler calls made by the system topology, in terms of processor sets.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait Bindings: Debug + Send + Sync + 'static {
    /// Restricts the current thread to one processor.
    fn bind_current_thread(&self, processor: ProcessorId) -> io::Result<()>;

    /// The processors the current thread may run on.
    fn current_thread_processors(&self) -> io::Result<CpuSet>;

    /// The processor the current thread runs on, if the kernel can tell.
    fn current_processor(&self) -> Option<ProcessorId>;
}

/// `sched_setaffinity`, `sched_getaffinity` and `sched_getcpu` on the running kernel.
#[derive(Debug, Default)]
pub(crate) struct SchedulerBindings;

// The error paths need the kernel to refuse, which the real-system tests cannot arrange.
#[cfg_attr(coverage_nightly, coverage(off))]
impl Bindings for SchedulerBindings {
    fn bind_current_thread(&self, processor: ProcessorId) -> io::Result<()> {
        let mask = mask_of(processor).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "processor does not fit into an affinity mask",
            )
        })?;

        // SAFETY: The mask is initialized and its size is passed along. Thread 0 is the caller.
        let result = unsafe { libc::sched_setaffinity(0, size_of::<cpu_set_t>(), &raw const mask) };

        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn current_thread_processors(&self) -> io::Result<CpuSet> {
        // SAFETY: All zeroes is a valid cpu_set_t.
        let mut mask: cpu_set_t = unsafe { mem::zeroed() };

        // SAFETY: The mask is writable and its size is passed along. Thread 0 is the caller.
        let result = unsafe { libc::sched_getaffinity(0, size_of::<cpu_set_t>(), &raw mut mask) };

        if result == 0 {
            Ok(processors_in(&mask))
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn current_processor(&self) -> Option<ProcessorId> {
        // SAFETY: No safety requirements.
        let cpu = unsafe { libc::sched_getcpu() };

        // Negative on failure.
        ProcessorId::try_from(cpu).ok()
    }
}

/// An affinity mask holding exactly one processor, or `None` if the processor does not fit
/// into a fixed-size mask.
fn mask_of(processor: ProcessorId) -> Option<cpu_set_t> {
    let index = usize::try_from(processor)
        .ok()
        .filter(|index| *index < CPU_SET_CAPACITY)?;

    // SAFETY: All zeroes is a valid cpu_set_t.
    let mut mask: cpu_set_t = unsafe { mem::zeroed() };

    // SAFETY: The index is within the bounds of the mask.
    unsafe {
        libc::CPU_SET(index, &mut mask);
    }

    Some(mask)
}

fn processors_in(mask: &cpu_set_t) -> CpuSet {
    (0..CPU_SET_CAPACITY)
        // SAFETY: The index is within the bounds of the mask.
        .filter(|index| unsafe { libc::CPU_ISSET(*index, mask) })
        .filter_map(|index| ProcessorId::try_from(index).ok())
        .collect()
}
