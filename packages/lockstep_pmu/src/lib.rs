#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(
    all(feature = "powerpc-timebase", target_arch = "powerpc64"),
    feature(asm_experimental_arch)
)]

//! Hardware performance counters behind one strategy interface per architecture.
//!
//! A [`PmuBackend`] knows how to turn an event name such as `cycles` or `L1D_CACHE_REFILL`
//! into an [`EventEncoding`] and how to open a [`PmuSession`] that programs the counters of the
//! current processor. A [`MeasurementSession`] combines a PMU session with the architecture's
//! timestamp source and brackets a closure:
//!
//! ```rust
//! use lockstep_pmu::{CounterAccess, CounterSet, MeasurementSession, backend_for};
//!
//! let backend = backend_for(CounterAccess::None)?;
//! let counters = CounterSet::from_names(["cycles"]);
//! let active = counters.activate(&*backend);
//!
//! let mut session = MeasurementSession::open(&*backend, &active)?;
//! let mut row = vec![0_u64; session.columns()];
//!
//! session.measure(&mut row, || std::hint::black_box(2 + 2))?;
//!
//! // The first column is the elapsed timestamp delta, which is never zero.
//! assert!(row[0] > 0);
//! # Ok::<(), lockstep_pmu::Error>(())
//! ```
//!
//! # Strategies
//!
//! | [`CounterAccess`]       | Mechanism                                                          |
//! |-------------------------|--------------------------------------------------------------------|
//! | `PerfEvent`             | Linux `perf_event_open` file descriptors                           |
//! | `Rdpmc`                 | `perf_event_open` mapping + unprivileged `rdpmc` (x86_64)          |
//! | `RawMsr`                | event-select MSRs through `/dev/cpu/N/msr` (x86_64)                |
//! | `LightweightProgrammed` | lightweight-kernel PMC syscalls + `rdpmc` (x86_64)                 |
//! | `LightweightRawMsr`     | lightweight-kernel MSR syscalls (x86_64)                           |
//! | `ArmSystemRegisters`    | PMUv3 system registers from EL0 (aarch64)                          |
//! | `None`                  | timestamps only                                                    |
//!
//! PowerPC vendor performance monitors plug in through [`VendorBackend`].
//!
//! Unresolvable events are dropped with a warning, surplus events are truncated to the number of
//! available counter slots and an overflowed counter is flagged rather than failing the
//! measurement. Everything that would break the precision of a measurement (a device that cannot
//! be opened, a syscall that fails) is an error.

mod arm;
mod backend;
mod counter;
mod error;
mod measurement;
mod null;
#[cfg(target_os = "linux")]
mod perf;
mod powerpc;
pub mod timestamp;
mod x86;

pub use arm::*;
pub use backend::*;
pub use counter::*;
pub use error::*;
pub use measurement::*;
pub use null::*;
#[cfg(target_os = "linux")]
pub use perf::*;
pub use powerpc::*;
pub use x86::*;
