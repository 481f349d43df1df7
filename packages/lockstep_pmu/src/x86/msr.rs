use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use crate::{Error, Result};

/// Syscall that reads an MSR on lightweight kernels that expose raw register access.
const LIGHTWEIGHT_RDMSR_SYSCALL: libc::c_long = 850;

/// Syscall that writes an MSR on lightweight kernels that expose raw register access.
const LIGHTWEIGHT_WRMSR_SYSCALL: libc::c_long = 851;

/// Read and write access to the model-specific registers of the current processor.
#[cfg_attr(test, mockall::automock)]
pub trait MsrAccess: Debug {
    /// Reads the 64-bit value of an MSR.
    ///
    /// # Errors
    ///
    /// Returns an error if the register cannot be read.
    fn read(&self, register: u32) -> Result<u64>;

    /// Writes the 64-bit value of an MSR.
    ///
    /// # Errors
    ///
    /// Returns an error if the register cannot be written.
    fn write(&self, register: u32, value: u64) -> Result<()>;
}

/// MSR access through the Linux `msr` driver (`/dev/cpu/N/msr`) of the processor the calling
/// thread runs on.
///
/// Requires the `msr` kernel module and `CAP_SYS_RAWIO`. The thread must stay on the same
/// processor for as long as the value is used, which executors guarantee by binding first.
#[derive(Debug)]
pub struct DevCpuMsr {
    file: File,
    path: PathBuf,
}

impl DevCpuMsr {
    /// Opens the MSR device of the processor the calling thread currently runs on.
    ///
    /// # Errors
    ///
    /// Returns an error if the current processor cannot be determined or its device cannot be
    /// opened for reading and writing.
    #[cfg_attr(test, mutants::skip)] // Requires privileges the tests do not have.
    pub fn open_current() -> Result<Self> {
        // SAFETY: No safety requirements.
        let cpu = unsafe { libc::sched_getcpu() };

        if cpu < 0 {
            return Err(Error::Syscall {
                operation: "sched_getcpu",
                source: io::Error::last_os_error(),
            });
        }

        Self::open(PathBuf::from(format!("/dev/cpu/{cpu}/msr")))
    }

    /// Opens a specific MSR device.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be opened for reading and writing.
    pub fn open(path: PathBuf) -> Result<Self> {
        match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => Ok(Self { file, path }),
            Err(source) => Err(Error::Device { path, source }),
        }
    }

    fn device_error(&self, source: io::Error) -> Error {
        Error::Device {
            path: self.path.clone(),
            source,
        }
    }
}

// The msr driver maps the file offset to the register number.
#[cfg_attr(coverage_nightly, coverage(off))]
impl MsrAccess for DevCpuMsr {
    fn read(&self, register: u32) -> Result<u64> {
        let mut buffer = [0_u8; 8];

        self.file
            .read_exact_at(&mut buffer, u64::from(register))
            .map_err(|e| self.device_error(e))?;

        Ok(u64::from_ne_bytes(buffer))
    }

    fn write(&self, register: u32, value: u64) -> Result<()> {
        self.file
            .write_all_at(&value.to_ne_bytes(), u64::from(register))
            .map_err(|e| self.device_error(e))
    }
}

/// MSR access through the dedicated fast syscalls of a lightweight kernel.
///
/// Only meaningful when running under such a kernel; on Linux the syscall numbers are unassigned
/// and every access fails with `ENOSYS`.
#[derive(Debug, Default)]
pub struct LightweightMsr;

#[cfg_attr(coverage_nightly, coverage(off))]
impl MsrAccess for LightweightMsr {
    fn read(&self, register: u32) -> Result<u64> {
        // SAFETY: errno is thread-local and always valid to write.
        unsafe {
            *libc::__errno_location() = 0;
        }

        // SAFETY: The syscall takes the register number by value and touches no user memory.
        let value = unsafe { libc::syscall(LIGHTWEIGHT_RDMSR_SYSCALL, libc::c_long::from(register)) };

        // The register value may legitimately be all ones, so only -1 with errno set is an error.
        if value == -1 {
            let error = io::Error::last_os_error();

            if error.raw_os_error().is_some_and(|code| code != 0) {
                return Err(Error::Syscall {
                    operation: "lightweight-kernel rdmsr",
                    source: error,
                });
            }
        }

        #[expect(
            clippy::cast_sign_loss,
            reason = "the syscall returns the 64-bit register value through a signed long"
        )]
        let value = value as u64;

        Ok(value)
    }

    fn write(&self, register: u32, value: u64) -> Result<()> {
        #[expect(
            clippy::cast_possible_wrap,
            reason = "the syscall takes the 64-bit register value through a signed long"
        )]
        let value = value as libc::c_long;

        // SAFETY: The syscall takes its arguments by value and touches no user memory.
        let result = unsafe {
            libc::syscall(
                LIGHTWEIGHT_WRMSR_SYSCALL,
                libc::c_long::from(register),
                value,
            )
        };

        if result < 0 {
            return Err(Error::Syscall {
                operation: "lightweight-kernel wrmsr",
                source: io::Error::last_os_error(),
            });
        }

        Ok(())
    }
}
