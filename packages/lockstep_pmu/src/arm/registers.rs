use std::arch::asm;

use crate::ArmPmuRegisters;

/// The PMUv3 registers of the processor the calling thread runs on.
///
/// Every access traps unless the kernel has granted EL0 access to the PMU via `PMUSERENR_EL0`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRegisters;

macro_rules! read_register {
    ($name:literal) => {{
        let value: u64;
        // SAFETY: Reading a PMU system register has no memory effects. Access rights are
        // checked by the hardware, which traps if EL0 access has not been granted.
        unsafe {
            asm!(concat!("mrs {}, ", $name), out(reg) value, options(nomem, nostack));
        }
        value
    }};
}

macro_rules! write_register {
    ($name:literal, $value:expr) => {{
        let value: u64 = $value;
        // SAFETY: Writing a PMU system register affects only counter state. Access rights are
        // checked by the hardware, which traps if EL0 access has not been granted.
        unsafe {
            asm!(concat!("msr ", $name, ", {}"), in(reg) value, options(nomem, nostack));
        }
    }};
}

#[cfg_attr(coverage_nightly, coverage(off))] // Requires EL0 PMU access.
impl ArmPmuRegisters for SystemRegisters {
    fn control(&self) -> u64 {
        read_register!("pmcr_el0")
    }

    fn enabled_counters(&self) -> u64 {
        read_register!("pmcntenset_el0")
    }

    fn select(&self, index: u32) {
        write_register!("pmselr_el0", u64::from(index));
    }

    fn write_event_type(&self, value: u64) {
        write_register!("pmxevtyper_el0", value);
    }

    fn enable(&self, mask: u64) {
        write_register!("pmcntenset_el0", mask);
    }

    fn disable(&self, mask: u64) {
        write_register!("pmcntenclr_el0", mask);
    }

    fn write_counter(&self, value: u64) {
        write_register!("pmxevcntr_el0", value);
    }

    fn read_counter(&self) -> u64 {
        read_register!("pmxevcntr_el0")
    }

    fn clear_overflow(&self, mask: u64) {
        write_register!("pmovsclr_el0", mask);
    }

    fn overflow_status(&self) -> u64 {
        read_register!("pmovsset_el0")
    }

    fn isb(&self) {
        // SAFETY: A barrier has no preconditions.
        unsafe {
            asm!("isb", options(nostack, preserves_flags));
        }
    }

    fn dmb(&self) {
        // SAFETY: A barrier has no preconditions.
        unsafe {
            asm!("dmb sy", options(nostack, preserves_flags));
        }
    }
}
