use std::sync::OnceLock;

use tracing::{debug, warn};

use crate::{EventEncoding, PmuBackend, Result};

/// Width in bytes of a counter value unless configured otherwise.
pub const DEFAULT_COUNTER_WIDTH_BYTES: usize = 8;

/// One requested hardware event and the place of its value in a measurement row.
///
/// The architecture-specific encoding is resolved lazily on first use. The descriptor remembers
/// the encoding of the first backend that resolved it. Other backends resolve it afresh.
#[derive(Clone, Debug)]
pub struct CounterDescriptor {
    name: String,
    width: usize,
    offset: usize,

    // Keyed by the name of the backend that resolved it.
    encoding: OnceLock<(&'static str, EventEncoding)>,
}

impl CounterDescriptor {
    /// Describes the event with the given name, 8 bytes wide.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            width: DEFAULT_COUNTER_WIDTH_BYTES,
            offset: 0,
            encoding: OnceLock::new(),
        }
    }

    /// Sets the width of the counter value in bytes. Wider values are truncated to it.
    ///
    /// # Panics
    ///
    /// Panics if the width is zero or more than 8 bytes.
    #[must_use]
    pub fn with_width(mut self, width: usize) -> Self {
        assert!(
            (1..=DEFAULT_COUNTER_WIDTH_BYTES).contains(&width),
            "counter width must be 1..=8 bytes, got {width}"
        );

        self.width = width;
        self
    }

    /// The event name as requested.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Width of the counter value in bytes.
    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Column of the counter value within a measurement row. Column 0 is the timestamp.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The cached encoding, if resolution has happened. Counters of [`ActiveCounters`] always
    /// hold the encoding of the backend they were activated against.
    #[must_use]
    pub fn encoding(&self) -> Option<EventEncoding> {
        self.encoding.get().map(|&(_, encoding)| encoding)
    }

    /// Resolves the event against a backend, or returns the encoding that the same backend
    /// resolved earlier.
    ///
    /// # Errors
    ///
    /// Returns the backend's error if the name cannot be resolved. A failed resolution is not
    /// cached.
    pub fn resolve(&self, backend: &dyn PmuBackend) -> Result<EventEncoding> {
        if let Some(&(resolved_by, encoding)) = self.encoding.get() {
            if resolved_by == backend.name() {
                return Ok(encoding);
            }
        }

        let resolved = backend.resolve(&self.name)?;

        // Fails if another backend or a racing thread got there first, which leaves that one.
        let _first = self.encoding.set((backend.name(), resolved));

        Ok(resolved)
    }

    fn resolved_by(&self, backend: &'static str, encoding: EventEncoding) -> Self {
        Self {
            name: self.name.clone(),
            width: self.width,
            offset: self.offset,
            encoding: OnceLock::from((backend, encoding)),
        }
    }

    /// Mask selecting the bits of a raw value that fit the counter width.
    pub(crate) fn value_mask(&self) -> u64 {
        let bits = self.width.saturating_mul(8);

        u32::try_from(bits)
            .ok()
            .and_then(|bits| 1_u64.checked_shl(bits))
            .map_or(u64::MAX, |bit| bit.wrapping_sub(1))
    }
}

/// The counters requested for a run, in request order.
#[derive(Clone, Debug, Default)]
pub struct CounterSet {
    counters: Vec<CounterDescriptor>,
}

impl CounterSet {
    /// Creates an empty set. Measurements will carry only timestamps.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set of 8-byte counters from event names.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            counters: names.into_iter().map(CounterDescriptor::new).collect(),
        }
    }

    /// Appends a counter.
    pub fn add(&mut self, counter: CounterDescriptor) {
        self.counters.push(counter);
    }

    /// Number of requested counters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether no counter is requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// The requested counters, in request order.
    pub fn iter(&self) -> impl Iterator<Item = &CounterDescriptor> {
        self.counters.iter()
    }

    /// Resolves every counter against the backend and keeps those that can be measured.
    ///
    /// Counters the backend does not know are dropped with a warning. If more counters remain
    /// than the backend has slots for, the surplus at the end is dropped with a warning. The
    /// surviving counters get consecutive row offsets starting at 1.
    #[must_use]
    pub fn activate(&self, backend: &dyn PmuBackend) -> ActiveCounters {
        let mut resolved = Vec::with_capacity(self.counters.len());

        for counter in &self.counters {
            match counter.resolve(backend) {
                Ok(encoding) => {
                    debug!(name = counter.name(), %encoding, "resolved counter");
                    resolved.push(counter.resolved_by(backend.name(), encoding));
                }
                Err(error) => {
                    warn!(
                        name = counter.name(),
                        backend = backend.name(),
                        %error,
                        "dropping counter that cannot be resolved"
                    );
                }
            }
        }

        let slots = backend.counter_slots();

        if resolved.len() > slots {
            for dropped in resolved.get(slots..).unwrap_or_default() {
                warn!(
                    name = dropped.name(),
                    slots,
                    backend = backend.name(),
                    "dropping counter beyond the available counter slots"
                );
            }

            resolved.truncate(slots);
        }

        for (offset, counter) in (1_usize..).zip(resolved.iter_mut()) {
            counter.offset = offset;
        }

        ActiveCounters { counters: resolved }
    }
}

impl<S: Into<String>> FromIterator<S> for CounterSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::from_names(iter)
    }
}

/// The counters of a [`CounterSet`] that survived resolution against a backend.
///
/// Every counter here has an encoding and a row offset.
#[derive(Clone, Debug, Default)]
pub struct ActiveCounters {
    counters: Vec<CounterDescriptor>,
}

impl ActiveCounters {
    /// No counters: measurements carry only timestamps.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Number of active counters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether no counter is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Names of the active counters, in row order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.counters.iter().map(CounterDescriptor::name)
    }

    /// Encodings of the active counters, in row order.
    #[must_use]
    pub fn encodings(&self) -> Vec<EventEncoding> {
        self.counters
            .iter()
            .map(|counter| {
                counter
                    .encoding()
                    .expect("active counters are resolved during activation")
            })
            .collect()
    }

    /// The active counters, in row order.
    #[must_use]
    pub fn descriptors(&self) -> &[CounterDescriptor] {
        &self.counters
    }
}
