use std::fmt::Debug;
use std::io;

use tracing::warn;

use super::rdpmc;
use crate::{
    CounterGeometry, DevCpuMsr, Error, EventEncoding, MsrAccess, OverflowMask, PmuBackend,
    PmuSession, Result, parse_x86_event,
};

const IA32_PMC_BASE: u32 = 0x0C1;
const IA32_PERFEVTSEL_BASE: u32 = 0x186;
const IA32_PERF_GLOBAL_STATUS: u32 = 0x38E;
const IA32_PERF_GLOBAL_CTRL: u32 = 0x38F;
const IA32_PERF_GLOBAL_OVF_CTRL: u32 = 0x390;

/// `IA32_PERFEVTSELx.EN`.
const EVTSEL_ENABLE: u64 = 1 << 22;

/// `IA32_PERFEVTSELx.USR`: count in ring 3 only.
const EVTSEL_USER: u64 = 1 << 16;

/// Lightweight-kernel syscalls that program counters on behalf of user space.
const LIGHTWEIGHT_PMC_INIT_SYSCALL: libc::c_long = 601;
const LIGHTWEIGHT_PMC_START_SYSCALL: libc::c_long = 602;
const LIGHTWEIGHT_PMC_STOP_SYSCALL: libc::c_long = 603;
const LIGHTWEIGHT_PMC_RESET_SYSCALL: libc::c_long = 604;

/// Counting mode argument of the lightweight-kernel init syscall: user mode only.
const LIGHTWEIGHT_PMC_MODE_USER: libc::c_long = 0x4;

/// The register-level operations a [`ProgrammedBackend`] needs to run a session.
///
/// Counter indexes are general-purpose counter numbers, masks have bit `i` set for counter `i`.
pub trait CounterProgramming: Debug {
    /// Whether [`stop()`][Self::stop] can report overflowed counters.
    const DETECTS_OVERFLOW: bool;

    /// Remembers whatever global state [`restore()`][Self::restore] puts back. Called once,
    /// before anything is programmed.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read.
    fn save(&mut self) -> Result<()>;

    /// Configures counter `index` to count the event described by `event_select`.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter cannot be configured.
    fn program(&mut self, index: u32, event_select: u64) -> Result<()>;

    /// Zeroes counter `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter cannot be written.
    fn reset(&mut self, index: u32) -> Result<()>;

    /// Enables the counters in `mask`.
    ///
    /// # Errors
    ///
    /// Returns an error if the counters cannot be enabled.
    fn start(&mut self, mask: u64) -> Result<()>;

    /// Disables the counters in `mask` and returns the subset of them that overflowed.
    ///
    /// # Errors
    ///
    /// Returns an error if the counters cannot be disabled.
    fn stop(&mut self, mask: u64) -> Result<u64>;

    /// Reads counter `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter cannot be read.
    fn read(&mut self, index: u32) -> Result<u64>;

    /// Puts back the state remembered by [`save()`][Self::save].
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be written.
    fn restore(&mut self) -> Result<()>;
}

/// Counter programming through the architectural performance monitoring MSRs.
///
/// Saves `IA32_PERF_GLOBAL_CTRL` and every event-select register it overwrites, and restores them
/// when the session ends.
#[derive(Debug)]
pub struct MsrProgramming<M: MsrAccess> {
    msr: M,
    saved_global_ctrl: Option<u64>,
    saved_event_selects: Vec<(u32, u64)>,
}

impl<M: MsrAccess> MsrProgramming<M> {
    /// Creates a programming layer over the given MSR access.
    pub fn new(msr: M) -> Self {
        Self {
            msr,
            saved_global_ctrl: None,
            saved_event_selects: Vec::new(),
        }
    }
}

impl MsrProgramming<DevCpuMsr> {
    /// Creates a programming layer over the MSR device of the current processor.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be opened.
    pub fn open_current() -> Result<Self> {
        DevCpuMsr::open_current().map(Self::new)
    }
}

impl<M: MsrAccess> CounterProgramming for MsrProgramming<M> {
    const DETECTS_OVERFLOW: bool = true;

    fn save(&mut self) -> Result<()> {
        self.saved_global_ctrl = Some(self.msr.read(IA32_PERF_GLOBAL_CTRL)?);
        Ok(())
    }

    fn program(&mut self, index: u32, event_select: u64) -> Result<()> {
        let register = IA32_PERFEVTSEL_BASE.wrapping_add(index);

        let previous = self.msr.read(register)?;
        self.saved_event_selects.push((register, previous));

        self.msr
            .write(register, EVTSEL_ENABLE | EVTSEL_USER | event_select)
    }

    fn reset(&mut self, index: u32) -> Result<()> {
        self.msr.write(IA32_PMC_BASE.wrapping_add(index), 0)
    }

    fn start(&mut self, mask: u64) -> Result<()> {
        // Clear stale overflow flags so that stop() only reports this window.
        self.msr.write(IA32_PERF_GLOBAL_OVF_CTRL, mask)?;
        self.msr.write(IA32_PERF_GLOBAL_CTRL, mask)
    }

    fn stop(&mut self, mask: u64) -> Result<u64> {
        self.msr.write(IA32_PERF_GLOBAL_CTRL, 0)?;

        let overflowed = self.msr.read(IA32_PERF_GLOBAL_STATUS)? & mask;

        if overflowed != 0 {
            self.msr.write(IA32_PERF_GLOBAL_OVF_CTRL, overflowed)?;
        }

        Ok(overflowed)
    }

    fn read(&mut self, index: u32) -> Result<u64> {
        self.msr.read(IA32_PMC_BASE.wrapping_add(index))
    }

    fn restore(&mut self) -> Result<()> {
        for (register, value) in self.saved_event_selects.drain(..).rev() {
            self.msr.write(register, value)?;
        }

        if let Some(global_ctrl) = self.saved_global_ctrl.take() {
            self.msr.write(IA32_PERF_GLOBAL_CTRL, global_ctrl)?;
        }

        Ok(())
    }
}

/// Counter programming through the PMC syscalls of a lightweight kernel, reading the counters
/// with `rdpmc`.
///
/// The kernel owns the global control state, so there is nothing to save or restore and
/// overflow cannot be observed.
#[derive(Debug, Default)]
pub struct LightweightPmcProgramming;

impl LightweightPmcProgramming {
    fn syscall(operation: &'static str, number: libc::c_long, args: [libc::c_long; 3]) -> Result<()> {
        let [a, b, c] = args;

        // SAFETY: The PMC syscalls take their arguments by value and touch no user memory.
        let result = unsafe { libc::syscall(number, a, b, c) };

        if result < 0 {
            return Err(Error::Syscall {
                operation,
                source: io::Error::last_os_error(),
            });
        }

        Ok(())
    }
}

#[expect(
    clippy::cast_possible_wrap,
    reason = "the syscalls take masks and event selects through signed longs"
)]
#[cfg_attr(coverage_nightly, coverage(off))] // Only works under a lightweight kernel.
impl CounterProgramming for LightweightPmcProgramming {
    const DETECTS_OVERFLOW: bool = false;

    fn save(&mut self) -> Result<()> {
        Ok(())
    }

    fn program(&mut self, index: u32, event_select: u64) -> Result<()> {
        Self::syscall(
            "lightweight-kernel pmc_init",
            LIGHTWEIGHT_PMC_INIT_SYSCALL,
            [
                libc::c_long::from(index),
                event_select as libc::c_long,
                LIGHTWEIGHT_PMC_MODE_USER,
            ],
        )
    }

    fn reset(&mut self, index: u32) -> Result<()> {
        Self::syscall(
            "lightweight-kernel pmc_reset",
            LIGHTWEIGHT_PMC_RESET_SYSCALL,
            [libc::c_long::from(index), 0, 0],
        )
    }

    fn start(&mut self, mask: u64) -> Result<()> {
        Self::syscall(
            "lightweight-kernel pmc_start",
            LIGHTWEIGHT_PMC_START_SYSCALL,
            [mask as libc::c_long, 0, 0],
        )
    }

    fn stop(&mut self, mask: u64) -> Result<u64> {
        Self::syscall(
            "lightweight-kernel pmc_stop",
            LIGHTWEIGHT_PMC_STOP_SYSCALL,
            [mask as libc::c_long, 0, 0],
        )?;

        Ok(0)
    }

    fn read(&mut self, index: u32) -> Result<u64> {
        Ok(rdpmc(index))
    }

    fn restore(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A backend that programs x86 event-select registers itself instead of delegating to the
/// kernel's perf subsystem.
///
/// Each session creates a fresh `P` through the factory, on the executor's thread.
#[derive(Debug)]
pub struct ProgrammedBackend<P: CounterProgramming> {
    name: &'static str,
    factory: fn() -> Result<P>,
    geometry: CounterGeometry,
}

impl<P: CounterProgramming> ProgrammedBackend<P> {
    /// Creates a backend that uses `factory` to acquire counter programming access for each
    /// session.
    #[must_use]
    pub fn new(name: &'static str, factory: fn() -> Result<P>) -> Self {
        Self::with_geometry(name, factory, CounterGeometry::current())
    }

    /// Creates a backend for a processor with a known counter geometry.
    #[must_use]
    pub fn with_geometry(
        name: &'static str,
        factory: fn() -> Result<P>,
        geometry: CounterGeometry,
    ) -> Self {
        Self {
            name,
            factory,
            geometry,
        }
    }
}

impl<P: CounterProgramming + 'static> PmuBackend for ProgrammedBackend<P> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn resolve(&self, event: &str) -> Result<EventEncoding> {
        parse_x86_event(event).map(EventEncoding::X86EventSelect)
    }

    fn counter_slots(&self) -> usize {
        self.geometry.general_purpose()
    }

    fn detects_overflow(&self) -> bool {
        P::DETECTS_OVERFLOW
    }

    fn open_session(&self, events: &[EventEncoding]) -> Result<Box<dyn PmuSession>> {
        let selects = events
            .iter()
            .map(|encoding| match encoding {
                EventEncoding::X86EventSelect(select) => Ok(*select),
                other => Err(Error::ForeignEncoding {
                    backend: self.name,
                    encoding: other.to_string(),
                }),
            })
            .collect::<Result<Vec<_>>>()?;

        let mut programming = (self.factory)()?;
        programming.save()?;

        // From here on, dropping the session restores whatever was already changed.
        let mut session = ProgrammedSession {
            programming,
            programmed: 0,
            mask: 0,
            width: self.geometry.width(),
        };

        for (index, select) in (0_u32..).zip(selects) {
            session.programming.program(index, select)?;
            session.programmed = session.programmed.wrapping_add(1);
            session.mask |= 1_u64.checked_shl(index).unwrap_or(0);
        }

        Ok(Box::new(session))
    }
}

#[derive(Debug)]
struct ProgrammedSession<P: CounterProgramming> {
    programming: P,
    programmed: u32,
    mask: u64,
    width: u32,
}

impl<P: CounterProgramming> PmuSession for ProgrammedSession<P> {
    fn begin(&mut self) -> Result<()> {
        for index in 0..self.programmed {
            self.programming.reset(index)?;
        }

        self.programming.start(self.mask)
    }

    fn end(&mut self, deltas: &mut [u64]) -> Result<OverflowMask> {
        let overflowed = self.programming.stop(self.mask)?;

        let value_mask = 1_u64
            .checked_shl(self.width)
            .map_or(u64::MAX, |bit| bit.wrapping_sub(1));

        for (index, delta) in (0..self.programmed).zip(deltas.iter_mut()) {
            // The counter was zeroed by begin(), so its value is the delta.
            *delta = self.programming.read(index)? & value_mask;
        }

        Ok(OverflowMask::from_bits(overflowed))
    }
}

impl<P: CounterProgramming> Drop for ProgrammedSession<P> {
    fn drop(&mut self) {
        if let Err(error) = self.programming.restore() {
            warn!(%error, "failed to restore performance counter state");
        }
    }
}
