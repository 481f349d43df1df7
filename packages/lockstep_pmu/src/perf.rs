//! Counters owned by the Linux perf subsystem, accessed through file descriptors.

use std::fmt::{self, Debug};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
#[cfg(test)]
use std::sync::Arc;

use perf_event_open_sys::bindings::{
    PERF_COUNT_HW_BRANCH_INSTRUCTIONS, PERF_COUNT_HW_BRANCH_MISSES, PERF_COUNT_HW_BUS_CYCLES,
    PERF_COUNT_HW_CACHE_MISSES, PERF_COUNT_HW_CACHE_REFERENCES, PERF_COUNT_HW_CPU_CYCLES,
    PERF_COUNT_HW_INSTRUCTIONS, PERF_COUNT_HW_REF_CPU_CYCLES,
    PERF_COUNT_HW_STALLED_CYCLES_BACKEND, PERF_COUNT_HW_STALLED_CYCLES_FRONTEND,
    PERF_COUNT_SW_ALIGNMENT_FAULTS, PERF_COUNT_SW_CONTEXT_SWITCHES, PERF_COUNT_SW_CPU_CLOCK,
    PERF_COUNT_SW_CPU_MIGRATIONS, PERF_COUNT_SW_EMULATION_FAULTS, PERF_COUNT_SW_PAGE_FAULTS,
    PERF_COUNT_SW_PAGE_FAULTS_MAJ, PERF_COUNT_SW_PAGE_FAULTS_MIN, PERF_COUNT_SW_TASK_CLOCK,
    PERF_FLAG_FD_CLOEXEC, PERF_TYPE_HARDWARE, PERF_TYPE_RAW, PERF_TYPE_SOFTWARE,
    perf_event_attr,
};
use perf_event_open_sys::{ioctls, perf_event_open};

use crate::{
    CounterGeometry, Error, EventEncoding, OverflowMask, PmuBackend, PmuSession, Result,
};

/// Generic event names understood by the perf subsystem on every architecture.
const NAMED_EVENTS: &[(&[&str], u32, u32)] = &[
    (&["cycles", "cpu-cycles"], PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES),
    (&["instructions"], PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS),
    (&["cache-references"], PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_REFERENCES),
    (&["cache-misses"], PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_MISSES),
    (
        &["branches", "branch-instructions"],
        PERF_TYPE_HARDWARE,
        PERF_COUNT_HW_BRANCH_INSTRUCTIONS,
    ),
    (&["branch-misses"], PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_MISSES),
    (&["bus-cycles"], PERF_TYPE_HARDWARE, PERF_COUNT_HW_BUS_CYCLES),
    (
        &["stalled-cycles-frontend", "idle-cycles-frontend"],
        PERF_TYPE_HARDWARE,
        PERF_COUNT_HW_STALLED_CYCLES_FRONTEND,
    ),
    (
        &["stalled-cycles-backend", "idle-cycles-backend"],
        PERF_TYPE_HARDWARE,
        PERF_COUNT_HW_STALLED_CYCLES_BACKEND,
    ),
    (&["ref-cycles"], PERF_TYPE_HARDWARE, PERF_COUNT_HW_REF_CPU_CYCLES),
    (&["cpu-clock"], PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_CLOCK),
    (&["task-clock"], PERF_TYPE_SOFTWARE, PERF_COUNT_SW_TASK_CLOCK),
    (&["page-faults", "faults"], PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS),
    (
        &["context-switches", "cs"],
        PERF_TYPE_SOFTWARE,
        PERF_COUNT_SW_CONTEXT_SWITCHES,
    ),
    (
        &["cpu-migrations", "migrations"],
        PERF_TYPE_SOFTWARE,
        PERF_COUNT_SW_CPU_MIGRATIONS,
    ),
    (&["minor-faults"], PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS_MIN),
    (&["major-faults"], PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS_MAJ),
    (
        &["alignment-faults"],
        PERF_TYPE_SOFTWARE,
        PERF_COUNT_SW_ALIGNMENT_FAULTS,
    ),
    (
        &["emulation-faults"],
        PERF_TYPE_SOFTWARE,
        PERF_COUNT_SW_EMULATION_FAULTS,
    ),
];

/// Resolves a perf event name: a generic hardware or software event name as used by
/// `perf stat -e` (case-insensitive, optionally with a `:u` modifier) or a raw encoding.
///
/// Raw encodings are `r<hex>` on every architecture, plus the `event=..,umask=..` term syntax
/// on x86.
///
/// # Errors
///
/// Returns an error if the name is neither a known event nor a valid raw encoding.
pub fn parse_perf_event(name: &str) -> Result<EventEncoding> {
    let normalized = name.trim().to_lowercase();
    let normalized = normalized.strip_suffix(":u").unwrap_or(&normalized);

    if let Some((_, kind, config)) = NAMED_EVENTS
        .iter()
        .find(|(names, _, _)| names.contains(&normalized))
    {
        return Ok(EventEncoding::Perf {
            kind: *kind,
            config: u64::from(*config),
        });
    }

    Ok(EventEncoding::Perf {
        kind: PERF_TYPE_RAW,
        config: parse_raw(name, normalized)?,
    })
}

#[cfg(target_arch = "x86_64")]
fn parse_raw(name: &str, normalized: &str) -> Result<u64> {
    crate::parse_x86_event(normalized).map_err(|error| match error {
        Error::UnknownEvent { .. } => Error::UnknownEvent {
            name: name.to_string(),
            backend: "perf",
        },
        other => other,
    })
}

#[cfg(not(target_arch = "x86_64"))]
fn parse_raw(name: &str, normalized: &str) -> Result<u64> {
    normalized
        .strip_prefix('r')
        .filter(|hex| !hex.is_empty())
        .and_then(|hex| u64::from_str_radix(hex, 16).ok())
        .ok_or_else(|| Error::UnknownEvent {
            name: name.to_string(),
            backend: "perf",
        })
}

/// Operations on perf event file descriptors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum PerfIoctl {
    Reset,
    Enable,
}

/// The perf syscalls the perf-based backends depend on, abstracted so that session logic can be
/// tested without kernel support.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait PerfBindings: Debug + Send + Sync + 'static {
    /// Opens a disabled counter for the calling thread on any processor, counting user space
    /// only.
    fn perf_event_open(&self, kind: u32, config: u64) -> io::Result<OwnedFd>;

    fn ioctl(&self, fd: RawFd, request: PerfIoctl) -> io::Result<()>;

    /// Reads the current 64-bit value of a counter.
    fn read_counter(&self, fd: RawFd) -> io::Result<u64>;
}

/// Perf bindings for the operating system the build is targeting.
#[derive(Debug, Default)]
pub(crate) struct BuildTargetPerfBindings;

// Real kernel bindings are excluded from coverage measurement because perf events are frequently
// unavailable in the containers tests run in.
#[cfg_attr(coverage_nightly, coverage(off))]
impl PerfBindings for BuildTargetPerfBindings {
    fn perf_event_open(&self, kind: u32, config: u64) -> io::Result<OwnedFd> {
        let mut attr = perf_event_attr {
            size: u32::try_from(size_of::<perf_event_attr>())
                .expect("perf_event_attr is a few hundred bytes"),
            type_: kind,
            config,
            ..perf_event_attr::default()
        };

        attr.set_disabled(1);
        attr.set_exclude_kernel(1);
        attr.set_exclude_hv(1);

        // pid 0 and cpu -1 mean "the calling thread, wherever it runs". The thread is bound to a
        // single processor, so this is the same as counting on that processor.
        // SAFETY: attr is a valid, fully initialized perf_event_attr.
        let fd = unsafe { perf_event_open(&raw mut attr, 0, -1, -1, PERF_FLAG_FD_CLOEXEC.into()) };

        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: perf_event_open returned a fresh descriptor that nothing else owns.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn ioctl(&self, fd: RawFd, request: PerfIoctl) -> io::Result<()> {
        // SAFETY: The perf ioctls only act on the descriptor, which the caller keeps open.
        let result = unsafe {
            match request {
                PerfIoctl::Reset => ioctls::RESET(fd, 0),
                PerfIoctl::Enable => ioctls::ENABLE(fd, 0),
            }
        };

        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    }

    fn read_counter(&self, fd: RawFd) -> io::Result<u64> {
        let mut value = 0_u64;

        // SAFETY: We read at most size_of::<u64>() bytes into a u64 we own.
        let read = unsafe { libc::read(fd, (&raw mut value).cast(), size_of::<u64>()) };

        match usize::try_from(read) {
            Ok(read) if read == size_of::<u64>() => Ok(value),
            Ok(_) => Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Err(_) => Err(io::Error::last_os_error()),
        }
    }
}

/// Enum to hide the real/mock choice behind a single wrapper type.
#[derive(Clone)]
pub(crate) enum PerfBindingsFacade {
    Target(&'static BuildTargetPerfBindings),

    #[cfg(test)]
    Mock(Arc<MockPerfBindings>),
}

impl PerfBindingsFacade {
    pub(crate) const fn target() -> Self {
        Self::Target(&BuildTargetPerfBindings)
    }

    #[cfg(test)]
    pub(crate) fn from_mock(mock: MockPerfBindings) -> Self {
        Self::Mock(Arc::new(mock))
    }
}

#[cfg_attr(coverage_nightly, coverage(off))] // Pure forwarding.
impl PerfBindings for PerfBindingsFacade {
    fn perf_event_open(&self, kind: u32, config: u64) -> io::Result<OwnedFd> {
        match self {
            Self::Target(bindings) => bindings.perf_event_open(kind, config),
            #[cfg(test)]
            Self::Mock(mock) => mock.perf_event_open(kind, config),
        }
    }

    fn ioctl(&self, fd: RawFd, request: PerfIoctl) -> io::Result<()> {
        match self {
            Self::Target(bindings) => bindings.ioctl(fd, request),
            #[cfg(test)]
            Self::Mock(mock) => mock.ioctl(fd, request),
        }
    }

    fn read_counter(&self, fd: RawFd) -> io::Result<u64> {
        match self {
            Self::Target(bindings) => bindings.read_counter(fd),
            #[cfg(test)]
            Self::Mock(mock) => mock.read_counter(fd),
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))] // No API contract to test.
impl Debug for PerfBindingsFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Target(inner) => inner.fmt(f),
            #[cfg(test)]
            Self::Mock(inner) => inner.fmt(f),
        }
    }
}

/// Opens one enabled perf counter per event, in order.
pub(crate) fn open_counters(
    bindings: &PerfBindingsFacade,
    backend: &'static str,
    events: &[EventEncoding],
) -> Result<Vec<OwnedFd>> {
    events
        .iter()
        .map(|encoding| {
            let EventEncoding::Perf { kind, config } = *encoding else {
                return Err(Error::ForeignEncoding {
                    backend,
                    encoding: encoding.to_string(),
                });
            };

            let fd = bindings
                .perf_event_open(kind, config)
                .map_err(|source| Error::Syscall {
                    operation: "perf_event_open",
                    source,
                })?;

            bindings
                .ioctl(fd.as_raw_fd(), PerfIoctl::Enable)
                .map_err(|source| Error::Syscall {
                    operation: "PERF_EVENT_IOC_ENABLE",
                    source,
                })?;

            Ok(fd)
        })
        .collect()
}

/// Counters owned by the kernel's perf subsystem, reset and read through syscalls.
///
/// The kernel multiplexes when more events are requested than the hardware has counters, so the
/// slot count reported here is the number of general-purpose hardware counters, beyond which
/// measurements would be scaled estimates. Overflow cannot be observed: the kernel extends
/// the counters to 64 bits.
#[derive(Debug)]
pub struct PerfEventBackend {
    bindings: PerfBindingsFacade,
    slots: usize,
}

impl PerfEventBackend {
    /// Creates a backend for the current system.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bindings: PerfBindingsFacade::target(),
            slots: CounterGeometry::current().general_purpose(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_bindings(bindings: PerfBindingsFacade, slots: usize) -> Self {
        Self { bindings, slots }
    }
}

impl Default for PerfEventBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PmuBackend for PerfEventBackend {
    fn name(&self) -> &'static str {
        "perf"
    }

    fn resolve(&self, event: &str) -> Result<EventEncoding> {
        parse_perf_event(event)
    }

    fn counter_slots(&self) -> usize {
        self.slots
    }

    fn detects_overflow(&self) -> bool {
        false
    }

    fn open_session(&self, events: &[EventEncoding]) -> Result<Box<dyn PmuSession>> {
        Ok(Box::new(PerfEventSession {
            counters: open_counters(&self.bindings, self.name(), events)?,
            bindings: self.bindings.clone(),
        }))
    }
}

#[derive(Debug)]
struct PerfEventSession {
    bindings: PerfBindingsFacade,
    counters: Vec<OwnedFd>,
}

impl PmuSession for PerfEventSession {
    fn begin(&mut self) -> Result<()> {
        for counter in &self.counters {
            self.bindings
                .ioctl(counter.as_raw_fd(), PerfIoctl::Reset)
                .map_err(|source| Error::Syscall {
                    operation: "PERF_EVENT_IOC_RESET",
                    source,
                })?;
        }

        Ok(())
    }

    fn end(&mut self, deltas: &mut [u64]) -> Result<OverflowMask> {
        for (counter, delta) in self.counters.iter().zip(deltas.iter_mut()) {
            *delta = self
                .bindings
                .read_counter(counter.as_raw_fd())
                .map_err(|source| Error::Syscall {
                    operation: "read perf counter",
                    source,
                })?;
        }

        Ok(OverflowMask::NONE)
    }
}

// Dropping the descriptors releases the counters.

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fs::File;

    use mockall::predicate::eq;
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(PerfEventBackend: Send, Sync);

    fn dev_null() -> OwnedFd {
        File::open("/dev/null").unwrap().into()
    }

    #[test]
    fn generic_names_resolve() {
        assert_eq!(
            parse_perf_event("cycles").unwrap(),
            EventEncoding::Perf {
                kind: PERF_TYPE_HARDWARE,
                config: u64::from(PERF_COUNT_HW_CPU_CYCLES)
            }
        );
        assert_eq!(
            parse_perf_event("Instructions:u").unwrap(),
            EventEncoding::Perf {
                kind: PERF_TYPE_HARDWARE,
                config: u64::from(PERF_COUNT_HW_INSTRUCTIONS)
            }
        );
        assert_eq!(
            parse_perf_event("task-clock").unwrap(),
            EventEncoding::Perf {
                kind: PERF_TYPE_SOFTWARE,
                config: u64::from(PERF_COUNT_SW_TASK_CLOCK)
            }
        );
    }

    #[test]
    fn raw_events_resolve() {
        assert_eq!(
            parse_perf_event("r01c2").unwrap(),
            EventEncoding::Perf {
                kind: PERF_TYPE_RAW,
                config: 0x01C2
            }
        );
    }

    #[test]
    fn unknown_events_are_reported_against_perf() {
        match parse_perf_event("L1D_CACHE_REFILL") {
            Err(Error::UnknownEvent { name, backend }) => {
                assert_eq!(name, "L1D_CACHE_REFILL");
                assert_eq!(backend, "perf");
            }
            other => panic!("expected an unknown event error, got {other:?}"),
        }
    }

    #[test]
    fn session_resets_on_begin_and_reads_on_end() {
        let mut bindings = MockPerfBindings::new();
        bindings
            .expect_perf_event_open()
            .times(2)
            .returning(|_, _| Ok(dev_null()));
        bindings
            .expect_ioctl()
            .with(mockall::predicate::always(), eq(PerfIoctl::Enable))
            .times(2)
            .returning(|_, _| Ok(()));
        bindings
            .expect_ioctl()
            .with(mockall::predicate::always(), eq(PerfIoctl::Reset))
            .times(2)
            .returning(|_, _| Ok(()));

        let mut values = [1_234_u64, 56].into_iter();
        bindings
            .expect_read_counter()
            .times(2)
            .returning(move |_| Ok(values.next().unwrap()));

        let backend = PerfEventBackend::with_bindings(PerfBindingsFacade::from_mock(bindings), 4);
        let events = [
            backend.resolve("cycles").unwrap(),
            backend.resolve("instructions").unwrap(),
        ];

        let mut session = backend.open_session(&events).unwrap();
        session.begin().unwrap();

        let mut deltas = [0_u64; 2];
        let overflow = session.end(&mut deltas).unwrap();

        assert_eq!(deltas, [1_234, 56]);
        assert!(overflow.is_empty());
        assert!(!backend.detects_overflow());
    }

    #[test]
    fn open_failure_is_a_syscall_error() {
        let mut bindings = MockPerfBindings::new();
        bindings
            .expect_perf_event_open()
            .returning(|_, _| Err(io::Error::from(io::ErrorKind::PermissionDenied)));

        let backend = PerfEventBackend::with_bindings(PerfBindingsFacade::from_mock(bindings), 4);
        let events = [backend.resolve("cycles").unwrap()];

        let result = backend.open_session(&events);

        assert!(matches!(
            result,
            Err(Error::Syscall {
                operation: "perf_event_open",
                ..
            })
        ));
    }

    #[test]
    fn foreign_encodings_are_rejected() {
        let backend = PerfEventBackend::with_bindings(
            PerfBindingsFacade::from_mock(MockPerfBindings::new()),
            4,
        );

        let result = backend.open_session(&[EventEncoding::Arm(0x11)]);

        assert!(matches!(result, Err(Error::ForeignEncoding { .. })));
    }
}
