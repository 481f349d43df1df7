use crate::{Error, EventEncoding, OverflowMask, PmuBackend, PmuSession, Result};

/// A backend without counters. Measurements carry only timestamps.
///
/// Every event fails to resolve, so requested counters are dropped with a warning.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullBackend;

impl PmuBackend for NullBackend {
    fn name(&self) -> &'static str {
        "none"
    }

    fn resolve(&self, event: &str) -> Result<EventEncoding> {
        Err(Error::UnknownEvent {
            name: event.to_string(),
            backend: self.name(),
        })
    }

    fn counter_slots(&self) -> usize {
        0
    }

    fn detects_overflow(&self) -> bool {
        false
    }

    fn open_session(&self, _events: &[EventEncoding]) -> Result<Box<dyn PmuSession>> {
        Ok(Box::new(NullSession))
    }
}

#[derive(Debug)]
struct NullSession;

impl PmuSession for NullSession {
    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn end(&mut self, _deltas: &mut [u64]) -> Result<OverflowMask> {
        Ok(OverflowMask::NONE)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn nothing_resolves() {
        assert!(matches!(
            NullBackend.resolve("cycles"),
            Err(Error::UnknownEvent { backend: "none", .. })
        ));
    }

    #[test]
    fn session_is_a_no_op() {
        let mut session = NullBackend.open_session(&[]).unwrap();

        session.begin().unwrap();
        let overflow = session.end(&mut []).unwrap();

        assert!(overflow.is_empty());
    }
}
