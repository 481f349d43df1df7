use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr::{self, NonNull};
use std::sync::atomic::{Ordering, fence};

use perf_event_open_sys::bindings::perf_event_mmap_page;

use super::rdpmc;
use crate::perf::{PerfBindingsFacade, open_counters};
use crate::{
    CounterGeometry, Error, EventEncoding, OverflowMask, PmuBackend, PmuSession, Result,
    parse_perf_event, wrapping_delta,
};

/// Counters programmed by the kernel's perf subsystem and read from user space with `rdpmc`.
///
/// Avoids a syscall per reading, which keeps the bracket around the measured code tight. Each
/// counter's perf mapping tells us which hardware counter to read and the offset the kernel has
/// accumulated for it; the kernel must permit user-space `rdpmc` (`/sys/devices/cpu/rdpmc`).
#[derive(Debug)]
pub struct RdpmcBackend {
    bindings: PerfBindingsFacade,
    slots: usize,
}

impl RdpmcBackend {
    /// Creates a backend for the current system.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bindings: PerfBindingsFacade::target(),
            slots: CounterGeometry::current().general_purpose(),
        }
    }
}

impl Default for RdpmcBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PmuBackend for RdpmcBackend {
    fn name(&self) -> &'static str {
        "rdpmc"
    }

    fn resolve(&self, event: &str) -> Result<EventEncoding> {
        parse_perf_event(event)
    }

    fn counter_slots(&self) -> usize {
        self.slots
    }

    fn detects_overflow(&self) -> bool {
        true
    }

    #[cfg_attr(test, mutants::skip)] // Requires perf support the tests cannot rely on.
    fn open_session(&self, events: &[EventEncoding]) -> Result<Box<dyn PmuSession>> {
        let counters = open_counters(&self.bindings, self.name(), events)?
            .into_iter()
            .map(MappedCounter::map)
            .collect::<Result<Vec<_>>>()?;

        Ok(Box::new(RdpmcSession {
            begin_values: vec![0; counters.len()],
            counters,
        }))
    }
}

/// A perf counter with its metadata page mapped into our address space.
#[derive(Debug)]
struct MappedCounter {
    page: NonNull<perf_event_mmap_page>,
    length: usize,

    // Keeps the counter alive for as long as the mapping exists.
    _fd: OwnedFd,
}

impl MappedCounter {
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn map(fd: OwnedFd) -> Result<Self> {
        // SAFETY: No safety requirements.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let length = usize::try_from(page_size).map_err(|_| Error::Syscall {
            operation: "sysconf(_SC_PAGESIZE)",
            source: io::Error::last_os_error(),
        })?;

        // SAFETY: We map a fresh region, letting the kernel choose the address.
        let address = unsafe {
            libc::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };

        if address == libc::MAP_FAILED {
            return Err(Error::Syscall {
                operation: "mmap perf counter page",
                source: io::Error::last_os_error(),
            });
        }

        let page = NonNull::new(address.cast::<perf_event_mmap_page>())
            .expect("mmap never returns null on success");

        let counter = Self {
            page,
            length,
            _fd: fd,
        };

        // SAFETY: The capability bits live in a union of a plain u64 and its bitfield view; both
        // views are valid for any bit pattern.
        let can_rdpmc = unsafe { counter.page.as_ref().__bindgen_anon_1.__bindgen_anon_1 }
            .cap_user_rdpmc()
            != 0;

        // An index of 0 means the kernel did not place the event on a hardware counter.
        // SAFETY: The page stays mapped for as long as `counter` lives.
        let index = unsafe { ptr::addr_of!((*counter.page.as_ptr()).index).read_volatile() };

        if !can_rdpmc || index == 0 {
            return Err(Error::PmuDisabled {
                reason: "the kernel does not permit rdpmc for this counter",
            });
        }

        Ok(counter)
    }

    /// Reads the 64-bit count of the event, retrying while the kernel updates the page.
    #[inline(always)]
    fn read(&self) -> u64 {
        let page = self.page.as_ptr();

        loop {
            // SAFETY: The page stays mapped for as long as `self` lives. The kernel updates it
            // concurrently, which is why every field is read volatile under the sequence lock.
            let sequence = unsafe { ptr::addr_of!((*page).lock).read_volatile() };
            fence(Ordering::Acquire);

            // SAFETY: As above.
            let index = unsafe { ptr::addr_of!((*page).index).read_volatile() };
            // SAFETY: As above.
            let offset = unsafe { ptr::addr_of!((*page).offset).read_volatile() };
            // SAFETY: As above.
            let width = unsafe { ptr::addr_of!((*page).pmc_width).read_volatile() };

            let raw = if index == 0 {
                0
            } else {
                rdpmc(index.wrapping_sub(1))
            };

            fence(Ordering::Acquire);

            // SAFETY: As above.
            if unsafe { ptr::addr_of!((*page).lock).read_volatile() } == sequence {
                let count = offset.wrapping_add(sign_extend(raw, u32::from(width)));
                return u64::from_ne_bytes(count.to_ne_bytes());
            }
        }
    }
}

impl Drop for MappedCounter {
    fn drop(&mut self) {
        // SAFETY: We mapped exactly this region in map() and nothing else unmaps it.
        unsafe {
            libc::munmap(self.page.as_ptr().cast(), self.length);
        }
    }
}

/// Sign-extends the low `width` bits of a raw counter reading, as the perf ABI requires before
/// adding the kernel's offset.
fn sign_extend(raw: u64, width: u32) -> i64 {
    let as_signed = |value: u64| i64::from_ne_bytes(value.to_ne_bytes());

    if width == 0 || width >= 64 {
        return as_signed(raw);
    }

    let shift = 64_u32.wrapping_sub(width);
    as_signed(raw << shift) >> shift
}

#[derive(Debug)]
struct RdpmcSession {
    counters: Vec<MappedCounter>,
    begin_values: Vec<u64>,
}

impl PmuSession for RdpmcSession {
    fn begin(&mut self) -> Result<()> {
        for (counter, value) in self.counters.iter().zip(self.begin_values.iter_mut()) {
            *value = counter.read();
        }

        Ok(())
    }

    fn end(&mut self, deltas: &mut [u64]) -> Result<OverflowMask> {
        let mut overflow = OverflowMask::NONE;

        for (index, ((counter, begin), delta)) in self
            .counters
            .iter()
            .zip(&self.begin_values)
            .zip(deltas.iter_mut())
            .enumerate()
        {
            let (value, wrapped) = wrapping_delta(*begin, counter.read(), 64);
            *delta = value;

            if wrapped {
                overflow.set(index);
            }
        }

        Ok(overflow)
    }
}
