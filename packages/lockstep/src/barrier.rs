use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

/// Release skew tolerated before a barrier reports it, unless configured otherwise.
pub const DEFAULT_SKEW_TOLERANCE: Duration = Duration::from_micros(100);

/// A cyclic rendezvous of a fixed number of threads.
///
/// Every call to [`wait()`][Self::wait] blocks until all participants have called it for the
/// current round, then all of them are released and the barrier is immediately ready for the
/// next round. A thread released from round K cannot be counted towards round K + 1 before every
/// participant has been released from round K, so rounds never mix.
///
/// Release is not instantaneous: participants wake up one after another. The delay between the
/// release and a participant waking up is its skew; a barrier counts and logs every wake-up that
/// exceeds the skew tolerance.
#[derive(Debug)]
pub struct Barrier {
    participants: usize,
    skew_tolerance: Duration,

    state: Mutex<BarrierState>,
    released: Condvar,

    skew_exceedances: AtomicU64,
}

#[derive(Debug)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    released_at: Option<Instant>,
}

impl Barrier {
    /// Creates a barrier for `participants` threads with the default skew tolerance.
    ///
    /// # Panics
    ///
    /// Panics if `participants` is zero.
    #[must_use]
    pub fn new(participants: usize) -> Self {
        Self::with_skew_tolerance(participants, DEFAULT_SKEW_TOLERANCE)
    }

    /// Creates a barrier for `participants` threads that reports wake-ups later than
    /// `skew_tolerance` after release.
    ///
    /// # Panics
    ///
    /// Panics if `participants` is zero.
    #[must_use]
    pub fn with_skew_tolerance(participants: usize, skew_tolerance: Duration) -> Self {
        assert!(participants > 0, "a barrier needs at least one participant");

        Self {
            participants,
            skew_tolerance,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
                released_at: None,
            }),
            released: Condvar::new(),
            skew_exceedances: AtomicU64::new(0),
        }
    }

    /// Blocks until every participant has arrived in the current round.
    ///
    /// Returns `true` on exactly one participant per round: the last one to arrive, which is the
    /// one that released the others.
    pub fn wait(&self) -> bool {
        let mut state = self
            .state
            .lock()
            .expect("poisoned lock - cannot continue execution");

        // Cannot overflow: arrivals reset before exceeding the participant count.
        state.arrived = state.arrived.wrapping_add(1);

        if state.arrived == self.participants {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            state.released_at = Some(Instant::now());

            drop(state);
            self.released.notify_all();
            return true;
        }

        let generation = state.generation;

        let state = self
            .released
            .wait_while(state, |state| state.generation == generation)
            .expect("poisoned lock - cannot continue execution");

        let released_at = state
            .released_at
            .expect("a released round always records its release time");

        drop(state);

        let skew = released_at.elapsed();

        if skew > self.skew_tolerance {
            self.skew_exceedances.fetch_add(1, Ordering::Relaxed);

            warn!(
                skew_us = skew.as_micros(),
                tolerance_us = self.skew_tolerance.as_micros(),
                "barrier participant woke up late, measurement windows may not be aligned"
            );
        }

        false
    }

    /// Number of threads that meet at the barrier each round.
    #[must_use]
    pub fn participants(&self) -> usize {
        self.participants
    }

    /// The release skew above which wake-ups are reported.
    #[must_use]
    pub fn skew_tolerance(&self) -> Duration {
        self.skew_tolerance
    }

    /// How many wake-ups so far exceeded the skew tolerance.
    #[must_use]
    pub fn skew_exceedances(&self) -> u64 {
        self.skew_exceedances.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    #![allow(clippy::arithmetic_side_effects, reason = "panic is fine in tests")]

    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use static_assertions::assert_impl_all;
    use testing::with_watchdog;

    use super::*;

    assert_impl_all!(Barrier: Send, Sync);

    #[test]
    fn single_participant_never_blocks() {
        let barrier = Barrier::new(1);

        assert!(barrier.wait());
        assert!(barrier.wait());
    }

    #[test]
    #[should_panic]
    fn zero_participants_panics() {
        let _barrier = Barrier::new(0);
    }

    #[test]
    fn exactly_one_leader_per_round() {
        with_watchdog(|| {
            const THREADS: usize = 4;
            const ROUNDS: usize = 50;

            let barrier = Barrier::new(THREADS);
            let leaders = AtomicUsize::new(0);

            thread::scope(|s| {
                for _ in 0..THREADS {
                    s.spawn(|| {
                        for _ in 0..ROUNDS {
                            if barrier.wait() {
                                leaders.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    });
                }
            });

            assert_eq!(leaders.load(Ordering::Relaxed), ROUNDS);
        });
    }

    #[test]
    fn rounds_do_not_mix() {
        with_watchdog(|| {
            const THREADS: usize = 3;
            const ROUNDS: usize = 100;

            let barrier = Barrier::new(THREADS);
            let arrivals = AtomicUsize::new(0);

            thread::scope(|s| {
                for _ in 0..THREADS {
                    s.spawn(|| {
                        for round in 0..ROUNDS {
                            arrivals.fetch_add(1, Ordering::SeqCst);
                            barrier.wait();

                            // Everyone has arrived in this round and nobody can have arrived in
                            // the next round until we all pass the second barrier.
                            assert_eq!(
                                arrivals.load(Ordering::SeqCst),
                                (round + 1) * THREADS
                            );

                            barrier.wait();
                        }
                    });
                }
            });
        });
    }

    #[test]
    fn late_wake_ups_are_counted() {
        with_watchdog(|| {
            let barrier = Barrier::with_skew_tolerance(2, Duration::ZERO);

            thread::scope(|s| {
                s.spawn(|| barrier.wait());
                s.spawn(|| barrier.wait());
            });

            // With zero tolerance, the one released participant is always late.
            assert_eq!(barrier.skew_exceedances(), 1);
            assert_eq!(barrier.participants(), 2);
            assert_eq!(barrier.skew_tolerance(), Duration::ZERO);
        });
    }
}
