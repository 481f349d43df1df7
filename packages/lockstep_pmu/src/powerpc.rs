//! Counters of large PowerPC systems, reached through the vendor's performance-monitor library.
//!
//! The library itself is not linked by this crate. Platforms that have one implement
//! [`VendorPerfMonitor`] over it and wrap it in a [`VendorBackend`]; without one, PowerPC
//! measurements use the null backend and carry only time base timestamps.

use std::fmt::Debug;
use std::sync::Arc;

use tracing::warn;

use crate::{Error, EventEncoding, OverflowMask, PmuBackend, PmuSession, Result};

/// Status code returned by a failed vendor library call.
pub type VendorStatus = i32;

/// Handle of an event set created by the vendor library.
pub type EventSetHandle = i32;

/// The operations of a vendor performance-monitor library that a session performs.
///
/// Calls mirror the library's event set life cycle: an event set is created, filled with events
/// and applied to the hardware once, then reset, started, stopped and read once per bracket.
#[cfg_attr(test, mockall::automock)]
pub trait VendorPerfMonitor: Debug + Send + Sync {
    /// Looks up the numeric identifier of an event by its case-insensitive name.
    fn event_id(&self, name: &str) -> Option<u32>;

    /// How many events one event set can hold.
    fn max_events(&self) -> usize;

    /// Initializes the library for the calling thread.
    fn init(&self) -> std::result::Result<(), VendorStatus>;

    /// Creates an empty event set.
    fn create_event_set(&self) -> std::result::Result<EventSetHandle, VendorStatus>;

    /// Adds an event to an event set that has not been applied yet.
    fn add_event(&self, set: EventSetHandle, id: u32) -> std::result::Result<(), VendorStatus>;

    /// Programs the hardware for an event set.
    fn apply(&self, set: EventSetHandle) -> std::result::Result<(), VendorStatus>;

    /// Zeroes the counters of an event set.
    fn reset(&self, set: EventSetHandle) -> std::result::Result<(), VendorStatus>;

    /// Starts counting.
    fn start(&self, set: EventSetHandle) -> std::result::Result<(), VendorStatus>;

    /// Stops counting.
    fn stop(&self, set: EventSetHandle) -> std::result::Result<(), VendorStatus>;

    /// Reads the count of the event at `index` within the set.
    fn read_event(
        &self,
        set: EventSetHandle,
        index: u32,
    ) -> std::result::Result<u64, VendorStatus>;

    /// Releases an event set.
    fn delete_event_set(&self, set: EventSetHandle) -> std::result::Result<(), VendorStatus>;

    /// Shuts the library down for the calling thread.
    fn disable(&self) -> std::result::Result<(), VendorStatus>;
}

/// Counters provided by a vendor performance-monitor library.
#[derive(Debug)]
pub struct VendorBackend<V: VendorPerfMonitor> {
    monitor: Arc<V>,
}

impl<V: VendorPerfMonitor> VendorBackend<V> {
    /// Creates a backend over the given library binding.
    pub fn new(monitor: V) -> Self {
        Self {
            monitor: Arc::new(monitor),
        }
    }
}

impl<V: VendorPerfMonitor + 'static> PmuBackend for VendorBackend<V> {
    fn name(&self) -> &'static str {
        "vendor performance monitor"
    }

    fn resolve(&self, event: &str) -> Result<EventEncoding> {
        self.monitor
            .event_id(event.trim())
            .map(EventEncoding::Vendor)
            .ok_or_else(|| Error::UnknownEvent {
                name: event.to_string(),
                backend: self.name(),
            })
    }

    fn counter_slots(&self) -> usize {
        self.monitor.max_events()
    }

    fn detects_overflow(&self) -> bool {
        false
    }

    fn open_session(&self, events: &[EventEncoding]) -> Result<Box<dyn PmuSession>> {
        let ids = events
            .iter()
            .map(|encoding| match encoding {
                EventEncoding::Vendor(id) => Ok(*id),
                other => Err(Error::ForeignEncoding {
                    backend: self.name(),
                    encoding: other.to_string(),
                }),
            })
            .collect::<Result<Vec<_>>>()?;

        let monitor = &self.monitor;

        vendor_call("init", monitor.init())?;
        let library = InitializedLibrary {
            monitor: Arc::clone(monitor),
        };

        let set = vendor_call("create_event_set", monitor.create_event_set())?;

        // From here on the session owns the set and releases it even if programming fails.
        let session = VendorSession {
            library,
            set,
            count: u32::try_from(ids.len()).unwrap_or(u32::MAX),
        };

        for id in ids {
            vendor_call("add_event", monitor.add_event(set, id))?;
        }

        vendor_call("apply", monitor.apply(set))?;

        Ok(Box::new(session))
    }
}

fn vendor_call<T>(
    call: &'static str,
    result: std::result::Result<T, VendorStatus>,
) -> Result<T> {
    result.map_err(|code| Error::Vendor { call, code })
}

/// The library, initialized for the calling thread until dropped.
#[derive(Debug)]
struct InitializedLibrary<V: VendorPerfMonitor> {
    monitor: Arc<V>,
}

impl<V: VendorPerfMonitor> Drop for InitializedLibrary<V> {
    fn drop(&mut self) {
        if let Err(code) = self.monitor.disable() {
            warn!(code, "failed to disable vendor performance monitor");
        }
    }
}

#[derive(Debug)]
struct VendorSession<V: VendorPerfMonitor> {
    // Dropped after the event set is deleted.
    library: InitializedLibrary<V>,
    set: EventSetHandle,
    count: u32,
}

impl<V: VendorPerfMonitor> PmuSession for VendorSession<V> {
    fn begin(&mut self) -> Result<()> {
        let monitor = &self.library.monitor;

        vendor_call("reset", monitor.reset(self.set))?;
        vendor_call("start", monitor.start(self.set))
    }

    fn end(&mut self, deltas: &mut [u64]) -> Result<OverflowMask> {
        let monitor = &self.library.monitor;

        vendor_call("stop", monitor.stop(self.set))?;

        for (index, delta) in (0..self.count).zip(deltas.iter_mut()) {
            *delta = vendor_call("read_event", monitor.read_event(self.set, index))?;
        }

        Ok(OverflowMask::NONE)
    }
}

impl<V: VendorPerfMonitor> Drop for VendorSession<V> {
    fn drop(&mut self) {
        if let Err(code) = self.library.monitor.delete_event_set(self.set) {
            warn!(code, "failed to delete vendor event set");
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use mockall::Sequence;
    use mockall::predicate::eq;

    use super::*;

    const LOAD_MISSES: u32 = 17;
    const L2_MISSES: u32 = 42;

    fn with_known_events(monitor: &mut MockVendorPerfMonitor) {
        monitor
            .expect_event_id()
            .returning(|name| match name.to_uppercase().as_str() {
                "PEVT_LSU_COMMIT_LD_MISSES" => Some(LOAD_MISSES),
                "PEVT_L2_MISSES" => Some(L2_MISSES),
                _ => None,
            });
    }

    #[test]
    fn resolves_known_events_only() {
        let mut monitor = MockVendorPerfMonitor::new();
        with_known_events(&mut monitor);

        let backend = VendorBackend::new(monitor);

        assert!(matches!(
            backend.resolve("pevt_l2_misses"),
            Ok(EventEncoding::Vendor(L2_MISSES))
        ));
        assert!(matches!(
            backend.resolve("cycles"),
            Err(Error::UnknownEvent { .. })
        ));
    }

    #[test]
    fn session_follows_event_set_life_cycle() {
        let mut monitor = MockVendorPerfMonitor::new();
        let mut sequence = Sequence::new();

        with_known_events(&mut monitor);

        monitor
            .expect_init()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|| Ok(()));
        monitor
            .expect_create_event_set()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|| Ok(3));
        monitor
            .expect_add_event()
            .with(eq(3), eq(LOAD_MISSES))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| Ok(()));
        monitor
            .expect_add_event()
            .with(eq(3), eq(L2_MISSES))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| Ok(()));
        monitor
            .expect_apply()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(()));
        monitor
            .expect_reset()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(()));
        monitor
            .expect_start()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(()));
        monitor
            .expect_stop()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(()));
        monitor
            .expect_read_event()
            .times(2)
            .returning(|_, index| Ok(u64::from(index) + 100));
        monitor
            .expect_delete_event_set()
            .with(eq(3))
            .times(1)
            .returning(|_| Ok(()));
        monitor.expect_disable().times(1).returning(|| Ok(()));

        let backend = VendorBackend::new(monitor);
        let events = [
            backend.resolve("PEVT_LSU_COMMIT_LD_MISSES").unwrap(),
            backend.resolve("PEVT_L2_MISSES").unwrap(),
        ];

        let mut session = backend.open_session(&events).unwrap();
        session.begin().unwrap();

        let mut deltas = [0_u64; 2];
        let overflow = session.end(&mut deltas).unwrap();

        assert_eq!(deltas, [100, 101]);
        assert!(overflow.is_empty());
    }

    #[test]
    fn failed_apply_releases_event_set() {
        let mut monitor = MockVendorPerfMonitor::new();

        with_known_events(&mut monitor);
        monitor.expect_init().returning(|| Ok(()));
        monitor.expect_create_event_set().returning(|| Ok(1));
        monitor.expect_add_event().returning(|_, _| Ok(()));
        monitor.expect_apply().returning(|_| Err(-5));
        monitor
            .expect_delete_event_set()
            .times(1)
            .returning(|_| Ok(()));
        monitor.expect_disable().times(1).returning(|| Ok(()));

        let backend = VendorBackend::new(monitor);
        let events = [backend.resolve("PEVT_L2_MISSES").unwrap()];

        assert!(matches!(
            backend.open_session(&events),
            Err(Error::Vendor {
                call: "apply",
                code: -5
            })
        ));
    }

    #[test]
    fn failed_event_set_creation_shuts_library_down() {
        let mut monitor = MockVendorPerfMonitor::new();
        let mut sequence = Sequence::new();

        with_known_events(&mut monitor);
        monitor
            .expect_init()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|| Ok(()));
        monitor
            .expect_create_event_set()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|| Err(-12));
        monitor
            .expect_disable()
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|| Ok(()));
        monitor.expect_delete_event_set().never();

        let backend = VendorBackend::new(monitor);
        let events = [backend.resolve("PEVT_L2_MISSES").unwrap()];

        assert!(matches!(
            backend.open_session(&events),
            Err(Error::Vendor {
                call: "create_event_set",
                code: -12
            })
        ));
    }
}
