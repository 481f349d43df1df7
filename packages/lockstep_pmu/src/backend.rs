use std::fmt::{self, Debug, Display};
use std::str::FromStr;
use std::sync::Arc;

use crate::{Error, NullBackend, Result};

/// An architecture-specific encoding of one hardware event, produced by
/// [`PmuBackend::resolve()`].
///
/// Encodings are only meaningful to the backend that produced them.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum EventEncoding {
    /// A Linux perf event type and configuration word.
    Perf {
        /// `perf_event_attr::type_`.
        kind: u32,
        /// `perf_event_attr::config`.
        config: u64,
    },

    /// The low bits of an x86 `IA32_PERFEVTSELx` value: event select, unit mask and the
    /// edge/invert/counter-mask modifiers. Enable and privilege bits are added when programming.
    X86EventSelect(u64),

    /// An ARM PMUv3 common event number.
    Arm(u16),

    /// An event identifier of a vendor performance-monitor API.
    Vendor(u32),
}

impl Display for EventEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Perf { kind, config } => write!(f, "perf:{kind}:{config:#x}"),
            Self::X86EventSelect(select) => write!(f, "evtsel:{select:#x}"),
            Self::Arm(event) => write!(f, "armv8:{event:#x}"),
            Self::Vendor(event) => write!(f, "vendor:{event}"),
        }
    }
}

/// Which counters overflowed during a measurement window, by position in the session.
///
/// Backends that cannot detect overflow always report an empty mask.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct OverflowMask(u64);

impl OverflowMask {
    /// A mask with no counter flagged.
    pub const NONE: Self = Self(0);

    /// Creates a mask from raw bits, bit `i` standing for counter `i`.
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// The raw bits of the mask.
    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Flags the counter at `index`. Indexes beyond 63 are ignored.
    pub fn set(&mut self, index: usize) {
        if let Some(bit) = u32::try_from(index).ok().and_then(|i| 1_u64.checked_shl(i)) {
            self.0 |= bit;
        }
    }

    /// Whether the counter at `index` is flagged.
    #[must_use]
    pub fn is_set(self, index: usize) -> bool {
        u32::try_from(index)
            .ok()
            .and_then(|i| 1_u64.checked_shl(i))
            .is_some_and(|bit| self.0 & bit != 0)
    }

    /// Whether no counter is flagged.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Indexes of the flagged counters, in ascending order.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..64_usize).filter(move |&index| self.is_set(index))
    }
}

/// An architecture-specific strategy for programming and reading hardware performance counters.
///
/// A backend is shared by every executor of a run; all per-processor state lives in the
/// [`PmuSession`] objects it opens.
pub trait PmuBackend: Debug + Send + Sync {
    /// Short human-readable name of the strategy, for diagnostics.
    fn name(&self) -> &'static str;

    /// Translates an event name into an encoding this backend can program.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is not known to this backend or is malformed.
    fn resolve(&self, event: &str) -> Result<EventEncoding>;

    /// How many counters can be active in one session.
    fn counter_slots(&self) -> usize;

    /// Whether [`PmuSession::end()`] can ever report an overflow.
    fn detects_overflow(&self) -> bool;

    /// Programs the counters of the current processor for the given events and returns a session
    /// that owns them until dropped.
    ///
    /// Must be called on the thread that will perform the measurements, after it has been bound
    /// to its processor.
    ///
    /// # Errors
    ///
    /// Returns an error if the counters cannot be programmed. Callers treat this as fatal for
    /// the executor that attempted it.
    fn open_session(&self, events: &[EventEncoding]) -> Result<Box<dyn PmuSession>>;
}

/// Exclusive ownership of the counters of one processor for the duration of a benchmark
/// invocation.
///
/// Dropping the session restores the counter enable state that was in place before it was
/// opened.
pub trait PmuSession: Debug {
    /// Zeroes or snapshots every counter of the session.
    ///
    /// # Errors
    ///
    /// Returns an error if the counters cannot be accessed.
    fn begin(&mut self) -> Result<()>;

    /// Writes the per-counter deltas since the last [`begin()`][Self::begin] into `deltas`,
    /// which has one entry per event the session was opened with.
    ///
    /// # Errors
    ///
    /// Returns an error if the counters cannot be accessed. Overflow is not an error; it is
    /// reported through the returned mask.
    fn end(&mut self, deltas: &mut [u64]) -> Result<OverflowMask>;
}

/// How hardware performance counters are accessed.
///
/// Parses from the lowercase names used on the command line (`auto`, `none`, `perf`, `rdpmc`,
/// `msr`, `lwk-pmc`, `lwk-msr`, `arm`).
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum CounterAccess {
    /// Linux perf file descriptors where available, otherwise no counters.
    #[default]
    Auto,

    /// No counters; measurements carry timestamps only.
    None,

    /// Linux `perf_event_open` file descriptors, reset and read through syscalls.
    PerfEvent,

    /// Linux `perf_event_open` mappings read with the unprivileged `rdpmc` instruction.
    Rdpmc,

    /// Event-select and counter MSRs written through `/dev/cpu/N/msr`.
    RawMsr,

    /// Lightweight-kernel counter programming syscalls, read with `rdpmc`.
    LightweightProgrammed,

    /// Event-select and counter MSRs written through lightweight-kernel MSR syscalls.
    LightweightRawMsr,

    /// ARM PMUv3 system registers accessed directly from user space.
    ArmSystemRegisters,
}

impl FromStr for CounterAccess {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "none" => Ok(Self::None),
            "perf" => Ok(Self::PerfEvent),
            "rdpmc" => Ok(Self::Rdpmc),
            "msr" => Ok(Self::RawMsr),
            "lwk-pmc" => Ok(Self::LightweightProgrammed),
            "lwk-msr" => Ok(Self::LightweightRawMsr),
            "arm" => Ok(Self::ArmSystemRegisters),
            _ => Err(format!(
                "invalid counter access '{s}', expected one of: auto, none, perf, rdpmc, msr, lwk-pmc, lwk-msr, arm"
            )),
        }
    }
}

/// Creates the backend for a counter access strategy.
///
/// # Errors
///
/// Returns [`Error::Unsupported`] if the strategy does not exist on the build target.
pub fn backend_for(access: CounterAccess) -> Result<Arc<dyn PmuBackend>> {
    match access {
        CounterAccess::None => Ok(Arc::new(NullBackend)),
        CounterAccess::Auto => Ok(auto_backend()),
        CounterAccess::PerfEvent => perf_event_backend(),
        CounterAccess::Rdpmc => x86_backend(access, "rdpmc"),
        CounterAccess::RawMsr => x86_backend(access, "raw MSR"),
        CounterAccess::LightweightProgrammed => x86_backend(access, "lightweight-kernel PMC"),
        CounterAccess::LightweightRawMsr => x86_backend(access, "lightweight-kernel MSR"),
        CounterAccess::ArmSystemRegisters => arm_backend(),
    }
}

#[cfg(target_os = "linux")]
fn auto_backend() -> Arc<dyn PmuBackend> {
    Arc::new(crate::PerfEventBackend::new())
}

#[cfg(not(target_os = "linux"))]
fn auto_backend() -> Arc<dyn PmuBackend> {
    Arc::new(NullBackend)
}

#[cfg(target_os = "linux")]
#[expect(
    clippy::unnecessary_wraps,
    reason = "other platforms return an error from the same signature"
)]
fn perf_event_backend() -> Result<Arc<dyn PmuBackend>> {
    Ok(Arc::new(crate::PerfEventBackend::new()))
}

#[cfg(not(target_os = "linux"))]
fn perf_event_backend() -> Result<Arc<dyn PmuBackend>> {
    Err(Error::Unsupported {
        strategy: "perf events",
    })
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
#[expect(
    clippy::unnecessary_wraps,
    reason = "other platforms return an error from the same signature"
)]
fn x86_backend(access: CounterAccess, _strategy: &'static str) -> Result<Arc<dyn PmuBackend>> {
    use crate::{
        DevCpuMsr, LightweightMsr, LightweightPmcProgramming, MsrProgramming, ProgrammedBackend,
        RdpmcBackend,
    };

    let backend: Arc<dyn PmuBackend> = match access {
        CounterAccess::Rdpmc => Arc::new(RdpmcBackend::new()),
        CounterAccess::RawMsr => Arc::new(ProgrammedBackend::<MsrProgramming<DevCpuMsr>>::new(
            "raw MSR",
            MsrProgramming::open_current,
        )),
        CounterAccess::LightweightRawMsr => {
            Arc::new(ProgrammedBackend::<MsrProgramming<LightweightMsr>>::new(
                "lightweight-kernel MSR",
                || Ok(MsrProgramming::new(LightweightMsr)),
            ))
        }
        _ => Arc::new(ProgrammedBackend::<LightweightPmcProgramming>::new(
            "lightweight-kernel PMC",
            || Ok(LightweightPmcProgramming),
        )),
    };

    Ok(backend)
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn x86_backend(_access: CounterAccess, strategy: &'static str) -> Result<Arc<dyn PmuBackend>> {
    Err(Error::Unsupported { strategy })
}

#[cfg(target_arch = "aarch64")]
#[expect(
    clippy::unnecessary_wraps,
    reason = "other platforms return an error from the same signature"
)]
fn arm_backend() -> Result<Arc<dyn PmuBackend>> {
    Ok(Arc::new(crate::ArmBackend::new(crate::SystemRegisters)))
}

#[cfg(not(target_arch = "aarch64"))]
fn arm_backend() -> Result<Arc<dyn PmuBackend>> {
    Err(Error::Unsupported {
        strategy: "ARM system registers",
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(OverflowMask: Send, Sync, Copy);
    assert_impl_all!(CounterAccess: Send, Sync, Copy);

    #[test]
    fn overflow_mask_tracks_flagged_counters() {
        let mut mask = OverflowMask::NONE;
        assert!(mask.is_empty());

        mask.set(0);
        mask.set(5);
        mask.set(200);

        assert!(!mask.is_empty());
        assert!(mask.is_set(0));
        assert!(!mask.is_set(1));
        assert!(mask.is_set(5));
        assert!(!mask.is_set(200));
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 5]);
        assert_eq!(mask.bits(), 0b10_0001);
    }

    #[test]
    fn counter_access_parses_case_insensitively() {
        assert_eq!("AUTO".parse::<CounterAccess>(), Ok(CounterAccess::Auto));
        assert_eq!("perf".parse::<CounterAccess>(), Ok(CounterAccess::PerfEvent));
        assert_eq!(
            "Lwk-Pmc".parse::<CounterAccess>(),
            Ok(CounterAccess::LightweightProgrammed)
        );
        assert_eq!(
            "lwk-msr".parse::<CounterAccess>(),
            Ok(CounterAccess::LightweightRawMsr)
        );
        assert!("papi".parse::<CounterAccess>().is_err());
    }

    #[test]
    fn none_backend_is_always_available() {
        let backend = backend_for(CounterAccess::None).unwrap();
        assert_eq!(backend.counter_slots(), 0);
    }

    #[test]
    fn encoding_display_names_the_family() {
        assert_eq!(
            EventEncoding::Perf { kind: 0, config: 1 }.to_string(),
            "perf:0:0x1"
        );
        assert_eq!(EventEncoding::X86EventSelect(0x3c).to_string(), "evtsel:0x3c");
        assert_eq!(EventEncoding::Arm(0x11).to_string(), "armv8:0x11");
        assert_eq!(EventEncoding::Vendor(7).to_string(), "vendor:7");
    }

    #[cfg(not(target_arch = "aarch64"))]
    #[test]
    fn arm_registers_are_unsupported_elsewhere() {
        assert!(matches!(
            backend_for(CounterAccess::ArmSystemRegisters),
            Err(Error::Unsupported { .. })
        ));
    }
}
