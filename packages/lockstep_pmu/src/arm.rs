//! ARMv8 PMUv3 counters programmed directly through system registers.

#[cfg(target_arch = "aarch64")]
mod registers;

use std::fmt::Debug;
use std::sync::Arc;

#[cfg(target_arch = "aarch64")]
pub use registers::*;
use tracing::warn;

use crate::{Error, EventEncoding, OverflowMask, PmuBackend, PmuSession, Result};

/// PMUv3 common events (ARM ARM D5.10).
const COMMON_EVENTS: &[(&str, u16)] = &[
    ("SW_INCR", 0x00),
    ("L1I_CACHE_REFILL", 0x01),
    ("L1D_CACHE_REFILL", 0x03),
    ("L1D_CACHE", 0x04),
    ("INST_RETIRED", 0x08),
    ("BR_MIS_PRED", 0x10),
    ("CPU_CYCLES", 0x11),
    ("BR_PRED", 0x12),
    ("MEM_ACCESS", 0x13),
    ("L2D_CACHE", 0x16),
    ("L2D_CACHE_REFILL", 0x17),
    ("CHAIN", 0x1E),
];

/// `PMCR_EL0.E`: all counters enabled.
const PMCR_ENABLE: u64 = 1;

/// `PMXEVTYPER_EL0.NSH`: count events at EL2 as well, matching the filter the hardware resets to
/// on most hypervisor-less systems.
const EVTYPER_NSH: u64 = 0x0800_0000;

/// Resolves a PMUv3 common event name (case-insensitive) or a raw event number written as
/// `r<hex>` or `0x<hex>`.
///
/// # Errors
///
/// Returns [`Error::UnknownEvent`] if the name is neither.
pub fn parse_arm_event(name: &str) -> Result<u16> {
    let trimmed = name.trim();

    if let Some((_, number)) = COMMON_EVENTS
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(trimmed))
    {
        return Ok(*number);
    }

    let lowered = trimmed.to_lowercase();

    lowered
        .strip_prefix("0x")
        .or_else(|| lowered.strip_prefix('r'))
        .filter(|hex| !hex.is_empty())
        .and_then(|hex| u16::from_str_radix(hex, 16).ok())
        .ok_or_else(|| Error::UnknownEvent {
            name: name.to_string(),
            backend: "ARM system registers",
        })
}

/// The PMUv3 system register operations a session performs, abstracted so that the programming
/// sequence can be verified without hardware.
///
/// Counter indexes are event counter numbers; selection-based operations act on the counter last
/// passed to [`select()`][Self::select].
#[cfg_attr(test, mockall::automock)]
pub trait ArmPmuRegisters: Debug + Send + Sync {
    /// Reads `PMCR_EL0`.
    fn control(&self) -> u64;

    /// Reads `PMCNTENSET_EL0`: the set of enabled counters.
    fn enabled_counters(&self) -> u64;

    /// Writes `PMSELR_EL0`.
    fn select(&self, index: u32);

    /// Writes `PMXEVTYPER_EL0` of the selected counter.
    fn write_event_type(&self, value: u64);

    /// Writes `PMCNTENSET_EL0`.
    fn enable(&self, mask: u64);

    /// Writes `PMCNTENCLR_EL0`.
    fn disable(&self, mask: u64);

    /// Writes `PMXEVCNTR_EL0` of the selected counter.
    fn write_counter(&self, value: u64);

    /// Reads `PMXEVCNTR_EL0` of the selected counter.
    fn read_counter(&self) -> u64;

    /// Writes `PMOVSCLR_EL0`.
    fn clear_overflow(&self, mask: u64);

    /// Reads `PMOVSSET_EL0`.
    fn overflow_status(&self) -> u64;

    /// Instruction synchronization barrier.
    fn isb(&self);

    /// Full-system data memory barrier.
    fn dmb(&self);
}

/// Counters programmed through PMUv3 system registers from user space.
///
/// The kernel must grant EL0 access (`PMUSERENR_EL0`) and the PMU must be globally enabled;
/// otherwise opening a session fails.
#[derive(Debug)]
pub struct ArmBackend<R: ArmPmuRegisters> {
    registers: Arc<R>,
}

impl<R: ArmPmuRegisters> ArmBackend<R> {
    /// Creates a backend over the given registers.
    pub fn new(registers: R) -> Self {
        Self {
            registers: Arc::new(registers),
        }
    }

    fn counter_count(&self) -> usize {
        // PMCR_EL0.N, bits 15:11.
        usize::try_from((self.registers.control() >> 11) & 0x1F).unwrap_or(0)
    }
}

impl<R: ArmPmuRegisters + 'static> PmuBackend for ArmBackend<R> {
    fn name(&self) -> &'static str {
        "ARM system registers"
    }

    fn resolve(&self, event: &str) -> Result<EventEncoding> {
        parse_arm_event(event).map(EventEncoding::Arm)
    }

    fn counter_slots(&self) -> usize {
        self.counter_count()
    }

    fn detects_overflow(&self) -> bool {
        true
    }

    fn open_session(&self, events: &[EventEncoding]) -> Result<Box<dyn PmuSession>> {
        let session = ArmSession::open(
            Arc::clone(&self.registers),
            self.name(),
            events,
            self.counter_count(),
        )?;

        Ok(Box::new(session))
    }
}

#[derive(Debug)]
struct ArmSession<R: ArmPmuRegisters> {
    registers: Arc<R>,
    count: u32,
    previously_enabled: u64,
}

impl<R: ArmPmuRegisters> ArmSession<R> {
    fn open(
        registers: Arc<R>,
        backend: &'static str,
        events: &[EventEncoding],
        available: usize,
    ) -> Result<Self> {
        if registers.control() & PMCR_ENABLE == 0 {
            return Err(Error::PmuDisabled {
                reason: "PMCR_EL0.E is clear",
            });
        }

        let numbers = events
            .iter()
            .map(|encoding| match encoding {
                EventEncoding::Arm(number) => Ok(*number),
                other => Err(Error::ForeignEncoding {
                    backend,
                    encoding: other.to_string(),
                }),
            })
            .collect::<Result<Vec<_>>>()?;

        if numbers.len() > available {
            warn!(
                requested = numbers.len(),
                available, "more events than event counters, ignoring the surplus"
            );
        }

        let previously_enabled = registers.enabled_counters();
        let mut count = 0_u32;

        for (index, number) in (0_u32..).zip(numbers.into_iter().take(available)) {
            registers.select(index);
            registers.write_event_type(EVTYPER_NSH | u64::from(number));
            count = index.wrapping_add(1);
        }

        // Enable from the highest counter down so that a chained pair never runs half-enabled.
        for index in (0..count).rev() {
            registers.enable(bit(index));
            registers.isb();
        }

        Ok(Self {
            registers,
            count,
            previously_enabled,
        })
    }
}

impl<R: ArmPmuRegisters> ArmSession<R> {
    fn counters(&self) -> u64 {
        (0..self.count).fold(0, |mask, index| mask | bit(index))
    }
}

impl<R: ArmPmuRegisters> PmuSession for ArmSession<R> {
    fn begin(&mut self) -> Result<()> {
        for index in 0..self.count {
            self.registers.clear_overflow(bit(index));
            self.registers.select(index);
            self.registers.write_counter(0);
        }

        // The previous window ended by stopping the counters.
        self.registers.enable(self.counters());
        self.registers.isb();
        Ok(())
    }

    fn end(&mut self, deltas: &mut [u64]) -> Result<OverflowMask> {
        // Stop every counter at once, so the window closes at the same instruction for all
        // of them regardless of the order they are read in.
        self.registers.disable(self.counters());
        self.registers.isb();
        self.registers.dmb();

        let status = self.registers.overflow_status();
        let mut overflow = OverflowMask::NONE;

        for ((slot, index), delta) in (0..self.count).enumerate().zip(deltas.iter_mut()) {
            self.registers.select(index);
            *delta = self.registers.read_counter();

            if status & bit(index) != 0 {
                overflow.set(slot);
            }
        }

        Ok(overflow)
    }
}

impl<R: ArmPmuRegisters> Drop for ArmSession<R> {
    fn drop(&mut self) {
        let ours = self.counters();

        self.registers.disable(ours & !self.previously_enabled);
        self.registers.enable(ours & self.previously_enabled);
        self.registers.isb();
    }
}

fn bit(index: u32) -> u64 {
    1_u64.checked_shl(index).unwrap_or(0)
}
