use std::fmt::{self, Debug};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::error::panic_message;
use crate::{Affinity, Error, ProcessorId, Result};

/// Work submitted to an [`Executor`].
pub type Task = Box<dyn FnOnce() -> Result<()> + Send>;

/// Where an executor is in processing its single task slot.
///
/// The producer (the thread that owns the executor) moves the slot from `Idle` to `Queued` by
/// submitting and from `Done` to `Idle` by collecting the outcome. The consumer (the executor
/// thread, or the producer itself for the dirigent) moves it from `Queued` to `Working` and from
/// `Working` to `Done`. Every transition checks the state it starts from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ExecutorState {
    /// Ready to accept work.
    Idle,

    /// Holds work that has not started.
    Queued,

    /// Running work.
    Working,

    /// Finished work whose outcome has not been collected.
    Done,
}

enum Command {
    Run(Task),
    Stop,
}

impl Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run(_) => f.write_str("Run"),
            Self::Stop => f.write_str("Stop"),
        }
    }
}

#[derive(Debug)]
struct Slot {
    state: ExecutorState,
    command: Option<Command>,
    outcome: Option<Result<()>>,

    // The producer dropped the completion before the outcome arrived; the consumer collects it.
    abandoned: bool,
}

#[derive(Debug)]
struct Shared {
    processor: ProcessorId,
    affinity: Affinity,

    activated: AtomicBool,
    bound_as_requested: AtomicBool,

    slot: Mutex<Slot>,
    queued: Condvar,
    finished: Condvar,
}

impl Shared {
    fn new(processor: ProcessorId, affinity: Affinity) -> Self {
        Self {
            processor,
            affinity,
            activated: AtomicBool::new(false),
            bound_as_requested: AtomicBool::new(false),
            slot: Mutex::new(Slot {
                state: ExecutorState::Idle,
                command: None,
                outcome: None,
                abandoned: false,
            }),
            queued: Condvar::new(),
            finished: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot
            .lock()
            .expect("poisoned lock - cannot continue execution")
    }

    fn state(&self) -> ExecutorState {
        self.lock().state
    }

    // Idle -> Queued
    fn submit(&self, command: Command) -> Result<()> {
        let mut slot = self.lock();

        if slot.state != ExecutorState::Idle {
            return Err(Error::ExecutorBusy {
                processor: self.processor,
            });
        }

        slot.state = ExecutorState::Queued;
        slot.command = Some(command);

        drop(slot);
        self.queued.notify_one();

        Ok(())
    }

    // Queued -> Working, blocking until there is work.
    fn dequeue(&self) -> Command {
        let slot = self.lock();

        let mut slot = self
            .queued
            .wait_while(slot, |slot| slot.state != ExecutorState::Queued)
            .expect("poisoned lock - cannot continue execution");

        Self::start(&mut slot)
    }

    // Queued -> Working, if there is work.
    fn try_dequeue(&self) -> Option<Command> {
        let mut slot = self.lock();

        (slot.state == ExecutorState::Queued).then(|| Self::start(&mut slot))
    }

    fn start(slot: &mut Slot) -> Command {
        assert_eq!(
            slot.state,
            ExecutorState::Queued,
            "only queued work can start"
        );

        slot.state = ExecutorState::Working;
        slot.command
            .take()
            .expect("a queued slot always holds a command")
    }

    // Working -> Done, or straight back to Idle if nobody will collect the outcome.
    fn complete(&self, outcome: Result<()>) {
        let mut slot = self.lock();

        assert_eq!(
            slot.state,
            ExecutorState::Working,
            "only working executors can complete"
        );

        if slot.abandoned {
            slot.abandoned = false;
            slot.state = ExecutorState::Idle;

            if let Err(error) = outcome {
                warn!(
                    processor = self.processor,
                    %error,
                    "work failed after its completion was abandoned"
                );
            }
        } else {
            slot.state = ExecutorState::Done;
            slot.outcome = Some(outcome);
        }

        drop(slot);
        self.finished.notify_all();
    }

    // Done -> Idle, blocking until the outcome is there.
    fn collect(&self) -> Result<()> {
        let slot = self.lock();

        let mut slot = self
            .finished
            .wait_while(slot, |slot| slot.state != ExecutorState::Done)
            .expect("poisoned lock - cannot continue execution");

        Self::take_outcome(&mut slot)
    }

    fn take_outcome(slot: &mut Slot) -> Result<()> {
        assert_eq!(
            slot.state,
            ExecutorState::Done,
            "only finished work has an outcome"
        );

        slot.state = ExecutorState::Idle;
        slot.outcome
            .take()
            .expect("a finished slot always holds an outcome")
    }

    fn abandon(&self) {
        let mut slot = self.lock();

        match slot.state {
            ExecutorState::Done => {
                if let Err(error) = Self::take_outcome(&mut slot) {
                    warn!(
                        processor = self.processor,
                        %error,
                        "work failed but its completion was never awaited"
                    );
                }
            }
            ExecutorState::Queued | ExecutorState::Working => slot.abandoned = true,
            ExecutorState::Idle => {}
        }
    }

    fn wait_idle(&self) {
        let slot = self.lock();

        drop(
            self.finished
                .wait_while(slot, |slot| slot.state != ExecutorState::Idle)
                .expect("poisoned lock - cannot continue execution"),
        );
    }

    /// Runs queued work on the current thread. Returns whether there was any.
    fn run_queued_inline(&self) -> bool {
        let Some(command) = self.try_dequeue() else {
            return false;
        };

        let outcome = match command {
            Command::Run(task) => self.run(task),
            Command::Stop => Ok(()),
        };

        self.complete(outcome);
        true
    }

    fn run(&self, task: Task) -> Result<()> {
        self.activate();

        panic::catch_unwind(AssertUnwindSafe(task)).unwrap_or_else(|payload| {
            warn!(
                processor = self.processor,
                message = panic_message(payload.as_ref()),
                "executor task panicked"
            );

            Err(Error::ExecutorPanicked {
                processor: self.processor,
            })
        })
    }

    // The first work an executor runs binds the running thread.
    fn activate(&self) {
        if self.activated.swap(true, Ordering::AcqRel) {
            return;
        }

        let bound = self.affinity.bind_current_thread(self.processor);
        self.bound_as_requested.store(bound, Ordering::Release);
    }
}

#[cfg_attr(test, mutants::skip)] // Mutations here hang the executor thread.
fn worker_loop(shared: &Shared) {
    loop {
        match shared.dequeue() {
            Command::Run(task) => {
                let outcome = shared.run(task);
                shared.complete(outcome);
            }
            Command::Stop => {
                shared.complete(Ok(()));
                return;
            }
        }
    }
}

/// Runs work for one logical processor.
///
/// An executor holds at most one piece of work at a time: submitting while earlier work has not
/// been collected fails with [`Error::ExecutorBusy`] and leaves the earlier work untouched.
///
/// A spawned executor owns a thread named `lockstep-<processor>` that waits for work. The
/// dirigent executor owns no thread; its work runs on the thread that waits for its completion,
/// or that calls [`run_inline()`][Self::run_inline]. Either way, the thread that runs the first
/// work of an executor is bound to the executor's processor, once.
///
/// ```
/// use std::sync::Arc;
///
/// use lockstep::{Affinity, BindingMode, Executor, FakeTopology};
///
/// let topology = Arc::new(FakeTopology::with_processor_count(2));
/// let affinity = Affinity::new(topology.clone(), topology, BindingMode::Enabled);
///
/// let executor = Executor::spawn(1, affinity)?;
///
/// executor.submit(|| Ok(()))?.wait()?;
/// executor.shutdown()?;
/// # Ok::<(), lockstep::Error>(())
/// ```
#[derive(Debug)]
pub struct Executor {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    dirigent: bool,
}

impl Executor {
    /// Starts an executor thread for the processor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceAcquisition`] if the thread cannot be created.
    pub fn spawn(processor: ProcessorId, affinity: Affinity) -> Result<Self> {
        let shared = Arc::new(Shared::new(processor, affinity));

        let thread = thread::Builder::new()
            .name(format!("lockstep-{processor}"))
            .spawn({
                let shared = Arc::clone(&shared);

                move || {
                    debug!(processor, "executor thread started");
                    worker_loop(&shared);
                    debug!(processor, "executor thread stopped");
                }
            })
            .map_err(|source| Error::ResourceAcquisition {
                action: format!("spawn the executor thread for processor {processor}"),
                source,
            })?;

        Ok(Self {
            shared,
            thread: Some(thread),
            dirigent: false,
        })
    }

    /// Creates the dirigent executor for the processor, which borrows the caller's thread.
    #[must_use]
    pub fn dirigent(processor: ProcessorId, affinity: Affinity) -> Self {
        Self {
            shared: Arc::new(Shared::new(processor, affinity)),
            thread: None,
            dirigent: true,
        }
    }

    /// The processor the executor runs work on.
    #[must_use]
    pub fn processor(&self) -> ProcessorId {
        self.shared.processor
    }

    /// Whether this is the dirigent, which runs work on the caller's thread.
    #[must_use]
    pub fn is_dirigent(&self) -> bool {
        self.dirigent
    }

    /// Where the executor is in processing its task slot.
    #[must_use]
    pub fn state(&self) -> ExecutorState {
        self.shared.state()
    }

    /// Whether the executor has run work and its thread ended up bound to its processor.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.shared.bound_as_requested.load(Ordering::Acquire)
    }

    /// Queues work and wakes the executor.
    ///
    /// The work of the dirigent only runs once the returned completion is awaited or
    /// [`run_inline()`][Self::run_inline] is called.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExecutorBusy`] if earlier work has not been collected yet.
    pub fn submit<F>(&self, task: F) -> Result<Completion<'_>>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.submit_task(Box::new(task))
    }

    /// Queues boxed work and wakes the executor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExecutorBusy`] if earlier work has not been collected yet.
    pub fn submit_task(&self, task: Task) -> Result<Completion<'_>> {
        self.shared.submit(Command::Run(task))?;

        Ok(Completion {
            shared: &self.shared,
            inline: self.dirigent,
            collected: false,
        })
    }

    /// Runs the queued work of the dirigent on the current thread. Returns whether there was
    /// any.
    ///
    /// # Panics
    ///
    /// Panics if this is not the dirigent: work of a spawned executor must run on its own
    /// bound thread.
    pub fn run_inline(&self) -> bool {
        assert!(
            self.dirigent,
            "only the dirigent runs work on the caller's thread"
        );

        self.shared.run_queued_inline()
    }

    /// Stops the executor after its current work and joins its thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExecutorPanicked`] if the executor thread died.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            // The dirigent has no loop to stop. Work nobody ran is discarded.
            if self.shared.try_dequeue().is_some() {
                self.shared.complete(Ok(()));
            }

            return Ok(());
        };

        self.shared.wait_idle();

        self.shared
            .submit(Command::Stop)
            .expect("an idle executor always accepts a command");
        self.shared.collect()?;

        thread.join().map_err(|payload| {
            warn!(
                processor = self.shared.processor,
                message = panic_message(payload.as_ref()),
                "executor thread panicked"
            );

            Error::ExecutorPanicked {
                processor: self.shared.processor,
            }
        })
    }
}

impl Drop for Executor {
    #[cfg_attr(test, mutants::skip)] // Impractical to test that stuff stops happening.
    fn drop(&mut self) {
        if thread::panicking() {
            // Stopping may block on a thread that is in an inconsistent state, hiding the
            // original panic.
            return;
        }

        if let Err(error) = self.stop() {
            warn!(processor = self.shared.processor, %error, "executor did not stop cleanly");
        }
    }
}

/// Signals that work submitted to an [`Executor`] has finished.
///
/// Dropping a completion without waiting for it discards the outcome of the work; the work
/// itself still runs to completion.
#[derive(Debug)]
#[must_use = "dropping a completion discards the outcome of the work"]
pub struct Completion<'a> {
    shared: &'a Shared,
    inline: bool,
    collected: bool,
}

impl Completion<'_> {
    /// Blocks until the work has finished and returns its outcome.
    ///
    /// For the dirigent, runs the work on the current thread if it has not run yet.
    ///
    /// # Errors
    ///
    /// Returns the error of the work, or [`Error::ExecutorPanicked`] if it panicked.
    pub fn wait(mut self) -> Result<()> {
        if self.inline {
            self.shared.run_queued_inline();
        }

        self.collected = true;
        self.shared.collect()
    }

    /// Whether the work has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared.state() == ExecutorState::Done
    }
}

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        if self.collected {
            return;
        }

        if self.inline && !thread::panicking() {
            self.shared.run_queued_inline();
        }

        self.shared.abandon();
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::mpsc;

    use static_assertions::assert_impl_all;
    use testing::with_watchdog;

    use super::*;
    use crate::{BindingMode, FakeTopology, Topology};

    assert_impl_all!(Executor: Send, Sync);

    fn fake_affinity(processors: ProcessorId) -> (Affinity, Arc<FakeTopology>) {
        let topology = Arc::new(FakeTopology::with_processor_count(processors));
        let shared: Arc<dyn Topology> = Arc::<FakeTopology>::clone(&topology);

        (
            Affinity::new(Arc::clone(&shared), shared, BindingMode::Enabled),
            topology,
        )
    }

    #[test]
    fn runs_work_on_named_bound_thread() {
        with_watchdog(|| {
            let (affinity, topology) = fake_affinity(4);
            let executor = Executor::spawn(3, affinity).unwrap();

            let (tx, rx) = mpsc::channel();

            executor
                .submit(move || {
                    let current = thread::current();
                    tx.send((current.name().map(str::to_string), current.id()))
                        .unwrap();
                    Ok(())
                })
                .unwrap()
                .wait()
                .unwrap();

            let (name, thread_id) = rx.recv().unwrap();

            assert_eq!(name.as_deref(), Some("lockstep-3"));
            assert_eq!(topology.binding_of(thread_id), Some(3));
            assert!(executor.is_bound());
            assert_eq!(executor.state(), ExecutorState::Idle);

            executor.shutdown().unwrap();
        });
    }

    #[test]
    fn binds_only_once() {
        with_watchdog(|| {
            let (affinity, topology) = fake_affinity(2);
            let executor = Executor::spawn(1, affinity).unwrap();

            for _ in 0..3 {
                executor.submit(|| Ok(())).unwrap().wait().unwrap();
            }

            assert_eq!(topology.bind_attempts(), 1);
        });
    }

    #[test]
    fn second_submit_is_rejected_without_losing_first() {
        with_watchdog(|| {
            let (affinity, _) = fake_affinity(1);
            let executor = Executor::spawn(0, affinity).unwrap();

            let (release_tx, release_rx) = mpsc::channel::<()>();
            let (ran_tx, ran_rx) = mpsc::channel();

            let first = executor
                .submit(move || {
                    release_rx.recv().unwrap();
                    ran_tx.send("first").unwrap();
                    Ok(())
                })
                .unwrap();

            let second = executor.submit(|| panic!("must never run"));

            assert!(matches!(
                second,
                Err(Error::ExecutorBusy { processor: 0 })
            ));

            release_tx.send(()).unwrap();
            first.wait().unwrap();

            assert_eq!(ran_rx.recv().unwrap(), "first");
            assert!(ran_rx.try_recv().is_err());
        });
    }

    #[test]
    fn errors_reach_the_completion() {
        with_watchdog(|| {
            let (affinity, _) = fake_affinity(1);
            let executor = Executor::spawn(0, affinity).unwrap();

            let outcome = executor
                .submit(|| Err(Error::Configuration("nope".to_string())))
                .unwrap()
                .wait();

            assert!(matches!(outcome, Err(Error::Configuration(_))));

            // The executor is idle again and keeps working.
            executor.submit(|| Ok(())).unwrap().wait().unwrap();
        });
    }

    #[test]
    fn panics_are_contained() {
        with_watchdog(|| {
            let (affinity, _) = fake_affinity(1);
            let executor = Executor::spawn(0, affinity).unwrap();

            let outcome = executor.submit(|| panic!("kaboom")).unwrap().wait();

            assert!(matches!(
                outcome,
                Err(Error::ExecutorPanicked { processor: 0 })
            ));

            executor.submit(|| Ok(())).unwrap().wait().unwrap();
            executor.shutdown().unwrap();
        });
    }

    #[test]
    fn dirigent_runs_on_caller_thread() {
        with_watchdog(|| {
            let (affinity, topology) = fake_affinity(2);
            let executor = Executor::dirigent(0, affinity);
            let caller = thread::current().id();

            assert!(executor.is_dirigent());
            assert!(!executor.run_inline());

            let completion = executor
                .submit(move || {
                    assert_eq!(thread::current().id(), caller);
                    Ok(())
                })
                .unwrap();

            assert_eq!(executor.state(), ExecutorState::Queued);
            assert!(executor.run_inline());
            assert!(completion.is_finished());

            completion.wait().unwrap();

            assert_eq!(topology.binding_of(caller), Some(0));
            executor.shutdown().unwrap();
        });
    }

    #[test]
    fn dirigent_work_runs_when_awaited() {
        with_watchdog(|| {
            let (affinity, _) = fake_affinity(1);
            let executor = Executor::dirigent(0, affinity);

            let (tx, rx) = mpsc::channel();

            executor
                .submit(move || {
                    tx.send(()).unwrap();
                    Ok(())
                })
                .unwrap()
                .wait()
                .unwrap();

            rx.try_recv().unwrap();
        });
    }

    #[test]
    #[should_panic]
    fn spawned_executor_cannot_run_inline() {
        let (affinity, _) = fake_affinity(1);
        let executor = Executor::spawn(0, affinity).unwrap();

        executor.run_inline();
    }

    #[test]
    fn abandoned_completion_frees_the_slot() {
        with_watchdog(|| {
            let (affinity, _) = fake_affinity(1);
            let executor = Executor::spawn(0, affinity).unwrap();

            drop(executor.submit(|| Ok(())).unwrap());

            // Shutting down waits for the abandoned work to finish.
            executor.shutdown().unwrap();
        });
    }
}
