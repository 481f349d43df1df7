//! Cycle-granular timestamps that bracket a measured region.
//!
//! [`begin()`] and [`end()`] differ on architectures where the read has to be fenced against
//! instructions on the measured side of the bracket. Values are only meaningful as differences
//! between readings taken on the same processor.

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    all(
        feature = "powerpc-timebase",
        any(target_arch = "powerpc", target_arch = "powerpc64")
    )
)))]
use std::{sync::OnceLock, time::Instant};

/// Human-readable name of the timestamp source on this platform.
#[cfg(target_arch = "x86_64")]
pub const TIMESTAMP_SOURCE: &str = "time stamp counter";

/// Human-readable name of the timestamp source on this platform.
#[cfg(target_arch = "aarch64")]
pub const TIMESTAMP_SOURCE: &str = "virtual counter";

/// Human-readable name of the timestamp source on this platform.
#[cfg(all(
    feature = "powerpc-timebase",
    any(target_arch = "powerpc", target_arch = "powerpc64")
))]
pub const TIMESTAMP_SOURCE: &str = "time base";

/// Human-readable name of the timestamp source on this platform.
#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    all(
        feature = "powerpc-timebase",
        any(target_arch = "powerpc", target_arch = "powerpc64")
    )
)))]
pub const TIMESTAMP_SOURCE: &str = "monotonic clock (ns)";

/// Reads the timestamp that opens a measured region.
///
/// Earlier instructions are retired before the counter is read.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
#[must_use]
pub fn begin() -> u64 {
    use std::arch::x86_64::{__cpuid, _rdtsc};

    // SAFETY: CPUID and RDTSC are available on every x86_64 processor. CPUID serializes the
    // instruction stream.
    unsafe {
        __cpuid(0);
        _rdtsc()
    }
}

/// Reads the timestamp that closes a measured region.
///
/// RDTSCP waits for earlier instructions; the trailing CPUID keeps later ones from starting
/// before the read.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
#[must_use]
pub fn end() -> u64 {
    use std::arch::x86_64::{__cpuid, __rdtscp};

    let mut processor = 0_u32;

    // SAFETY: RDTSCP is available on every x86_64 processor we can bind to; it writes only to
    // `processor`, which outlives the call.
    let ticks = unsafe { __rdtscp(&raw mut processor) };

    // SAFETY: See begin().
    unsafe {
        __cpuid(0);
    }

    ticks
}

/// Reads the timestamp that opens a measured region.
#[cfg(target_arch = "aarch64")]
#[inline(always)]
#[must_use]
pub fn begin() -> u64 {
    read_virtual_counter()
}

/// Reads the timestamp that closes a measured region.
#[cfg(target_arch = "aarch64")]
#[inline(always)]
#[must_use]
pub fn end() -> u64 {
    read_virtual_counter()
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn read_virtual_counter() -> u64 {
    let ticks: u64;

    // SAFETY: CNTVCT_EL0 is readable from EL0 on every supported kernel. The ISB keeps the read
    // from being speculated ahead of earlier instructions.
    unsafe {
        std::arch::asm!("isb", "mrs {}, cntvct_el0", out(reg) ticks, options(nostack));
    }

    ticks
}

/// Reads the timestamp that opens a measured region.
#[cfg(all(
    feature = "powerpc-timebase",
    any(target_arch = "powerpc", target_arch = "powerpc64")
))]
#[inline(always)]
#[must_use]
pub fn begin() -> u64 {
    read_time_base()
}

/// Reads the timestamp that closes a measured region.
#[cfg(all(
    feature = "powerpc-timebase",
    any(target_arch = "powerpc", target_arch = "powerpc64")
))]
#[inline(always)]
#[must_use]
pub fn end() -> u64 {
    read_time_base()
}

#[cfg(all(feature = "powerpc-timebase", target_arch = "powerpc64"))]
#[inline(always)]
fn read_time_base() -> u64 {
    let ticks: u64;

    // SAFETY: The time base is readable from user space.
    unsafe {
        std::arch::asm!("mftb {}", out(reg) ticks, options(nomem, nostack));
    }

    ticks
}

#[cfg(all(feature = "powerpc-timebase", target_arch = "powerpc"))]
#[inline(always)]
fn read_time_base() -> u64 {
    read_split(
        || {
            let upper: u32;
            // SAFETY: The time base is readable from user space.
            unsafe {
                std::arch::asm!("mftbu {}", out(reg) upper, options(nomem, nostack));
            }
            upper
        },
        || {
            let lower: u32;
            // SAFETY: The time base is readable from user space.
            unsafe {
                std::arch::asm!("mftb {}", out(reg) lower, options(nomem, nostack));
            }
            lower
        },
    )
}

/// Reads the timestamp that opens a measured region.
#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    all(
        feature = "powerpc-timebase",
        any(target_arch = "powerpc", target_arch = "powerpc64")
    )
)))]
#[must_use]
pub fn begin() -> u64 {
    monotonic_nanos()
}

/// Reads the timestamp that closes a measured region.
#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    all(
        feature = "powerpc-timebase",
        any(target_arch = "powerpc", target_arch = "powerpc64")
    )
)))]
#[must_use]
pub fn end() -> u64 {
    monotonic_nanos()
}

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    all(
        feature = "powerpc-timebase",
        any(target_arch = "powerpc", target_arch = "powerpc64")
    )
)))]
fn monotonic_nanos() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();

    let elapsed = EPOCH.get_or_init(Instant::now).elapsed();
    u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
}

/// Combines a 64-bit counter that can only be read as two 32-bit halves.
///
/// The upper half is read before and after the lower half and the read is retried until both
/// upper readings agree, so a carry from the lower half between the reads cannot produce a torn
/// value.
pub fn read_split(mut upper: impl FnMut() -> u32, mut lower: impl FnMut() -> u32) -> u64 {
    loop {
        let before = upper();
        let low = lower();
        let after = upper();

        if before == after {
            return (u64::from(before) << 32) | u64::from(low);
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    #![allow(clippy::indexing_slicing, reason = "panic is fine in tests")]

    use std::cell::Cell;

    use super::*;

    #[test]
    fn split_read_combines_halves() {
        assert_eq!(read_split(|| 0x1, || 0x2), 0x1_0000_0002);
    }

    #[test]
    fn split_read_retries_on_carry() {
        // The lower half wraps between the two upper reads on the first attempt.
        let uppers = [7_u32, 8, 8, 8];
        let lowers = [0xFFFF_FFFF_u32, 0x10];
        let upper_reads = Cell::new(0_usize);
        let lower_reads = Cell::new(0_usize);

        let value = read_split(
            || {
                let index = upper_reads.get();
                upper_reads.set(index + 1);
                uppers[index]
            },
            || {
                let index = lower_reads.get();
                lower_reads.set(index + 1);
                lowers[index]
            },
        );

        assert_eq!(value, (8_u64 << 32) | 0x10);
        assert_eq!(lower_reads.get(), 2);
    }

    #[test]
    fn timestamps_do_not_go_backwards() {
        let first = begin();
        let second = end();

        assert!(second >= first);
    }
}
