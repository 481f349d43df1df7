use tracing::warn;

use crate::{ActiveCounters, PmuBackend, PmuSession, Result, timestamp};

/// Brackets measured code with a timestamp pair and the counters of one processor.
///
/// A measurement fills one row of `1 + counters` values: the elapsed timestamp delta followed by
/// the delta of each active counter in activation order.
///
/// Open it on the thread that will run the measured code, after binding that thread to its
/// processor.
#[derive(Debug)]
pub struct MeasurementSession {
    session: Box<dyn PmuSession>,
    names: Vec<String>,
    masks: Vec<u64>,
}

impl MeasurementSession {
    /// Programs the counters of the current processor.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot program the counters.
    pub fn open(backend: &dyn PmuBackend, active: &ActiveCounters) -> Result<Self> {
        let session = backend.open_session(&active.encodings())?;

        Ok(Self {
            session,
            names: active.names().map(str::to_string).collect(),
            masks: active
                .descriptors()
                .iter()
                .map(|counter| counter.value_mask())
                .collect(),
        })
    }

    /// Number of values in one measurement row.
    #[must_use]
    pub fn columns(&self) -> usize {
        self.names.len().wrapping_add(1)
    }

    /// Runs `f` between a begin and an end bracket and writes the measurement into `row`.
    ///
    /// The timestamp delta is never zero, even for code that completes within one tick. An
    /// overflowed counter is logged and its value kept; the measurement does not fail.
    ///
    /// # Errors
    ///
    /// Returns an error if the counters cannot be read.
    ///
    /// # Panics
    ///
    /// Panics if `row` does not have exactly [`columns()`][Self::columns] entries.
    #[inline]
    pub fn measure<R>(&mut self, row: &mut [u64], f: impl FnOnce() -> R) -> Result<R> {
        assert_eq!(
            row.len(),
            self.columns(),
            "measurement row must hold the timestamp and every counter"
        );

        let (timestamp_cell, counter_cells) = row
            .split_first_mut()
            .expect("rows always have a timestamp column");

        self.session.begin()?;
        let started = timestamp::begin();

        let result = f();

        let finished = timestamp::end();
        let overflow = self.session.end(counter_cells)?;

        *timestamp_cell = finished.wrapping_sub(started).max(1);

        for (value, mask) in counter_cells.iter_mut().zip(&self.masks) {
            *value &= mask;
        }

        for index in overflow.iter() {
            if let Some(name) = self.names.get(index) {
                warn!(counter = name, "counter overflowed, its value is unreliable");
            }
        }

        Ok(result)
    }
}
