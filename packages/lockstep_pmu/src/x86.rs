//! x86-family counter strategies.
//!
//! All strategies share the event vocabulary in [`parse_x86_event()`]. The perf-based
//! [`RdpmcBackend`] lets the kernel program the counters and only reads them from user space,
//! while [`ProgrammedBackend`] programs the event-select registers itself, either through MSR
//! access ([`MsrProgramming`]) or through the programming syscalls of a lightweight kernel
//! ([`LightweightPmcProgramming`]).

mod events;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod msr;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod programmed;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod rdpmc;

pub use events::*;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use msr::*;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use programmed::*;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use rdpmc::*;

/// Counter width assumed when the processor does not report one.
const DEFAULT_COUNTER_WIDTH: u32 = 48;

/// General-purpose counter count assumed when the processor does not report one.
const DEFAULT_GENERAL_PURPOSE_COUNTERS: usize = 4;

/// Number and width of the general-purpose performance counters of the processor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CounterGeometry {
    general_purpose: usize,
    width: u32,
}

impl CounterGeometry {
    /// Creates a geometry description from known values.
    #[must_use]
    pub const fn new(general_purpose: usize, width: u32) -> Self {
        Self {
            general_purpose,
            width,
        }
    }

    /// Queries the architectural performance monitoring leaf (CPUID 0xA) of the current
    /// processor, falling back to conservative defaults if it is not implemented.
    #[must_use]
    pub fn current() -> Self {
        Self::from_cpuid_leaf(architectural_pmu_leaf())
    }

    /// Decodes EAX of CPUID leaf 0xA. Bits 15:8 hold the counter count, bits 23:16 the width.
    #[must_use]
    pub fn from_cpuid_leaf(eax: Option<u32>) -> Self {
        let Some(eax) = eax else {
            return Self::new(DEFAULT_GENERAL_PURPOSE_COUNTERS, DEFAULT_COUNTER_WIDTH);
        };

        let count = (eax >> 8) & 0xFF;
        let width = (eax >> 16) & 0xFF;

        Self {
            general_purpose: match usize::try_from(count) {
                Ok(count) if count > 0 => count,
                _ => DEFAULT_GENERAL_PURPOSE_COUNTERS,
            },
            width: if width == 0 {
                DEFAULT_COUNTER_WIDTH
            } else {
                width
            },
        }
    }

    /// Number of general-purpose counters.
    #[must_use]
    pub const fn general_purpose(&self) -> usize {
        self.general_purpose
    }

    /// Width of each counter in bits.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }
}

#[cfg(target_arch = "x86_64")]
#[cfg_attr(test, mutants::skip)] // Result depends on the hardware the tests run on.
fn architectural_pmu_leaf() -> Option<u32> {
    use std::arch::x86_64::__cpuid;

    // SAFETY: CPUID is available on every x86_64 processor.
    let max_leaf = unsafe { __cpuid(0) }.eax;

    if max_leaf < 0xA {
        return None;
    }

    // SAFETY: We verified above that the leaf is implemented.
    let eax = unsafe { __cpuid(0xA) }.eax;

    // Version 0 means there is no architectural performance monitoring.
    (eax & 0xFF != 0).then_some(eax)
}

#[cfg(not(target_arch = "x86_64"))]
fn architectural_pmu_leaf() -> Option<u32> {
    None
}

/// Difference between two readings of a `width`-bit counter.
///
/// Returns the delta and whether the counter wrapped between the readings. A single wrap is
/// accounted for in the delta; whether it wrapped more than once cannot be known.
#[must_use]
pub fn wrapping_delta(begin: u64, end: u64, width: u32) -> (u64, bool) {
    let mask = 1_u64.checked_shl(width).map_or(u64::MAX, |bit| bit.wrapping_sub(1));

    let begin = begin & mask;
    let end = end & mask;

    (end.wrapping_sub(begin) & mask, end < begin)
}

/// Reads a performance counter with the `rdpmc` instruction.
///
/// The caller must have arranged for user-space `rdpmc` to be permitted (CR4.PCE) and for
/// `index` to name a counter that exists.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[inline(always)]
fn rdpmc(index: u32) -> u64 {
    let low: u32;
    let high: u32;

    // SAFETY: The instruction only reads registers. A fault (counter access not permitted) is
    // delivered as a signal, not as undefined behavior.
    unsafe {
        std::arch::asm!(
            "rdpmc",
            in("ecx") index,
            lateout("eax") low,
            lateout("edx") high,
            options(nostack, nomem),
        );
    }

    (u64::from(high) << 32) | u64::from(low)
}
