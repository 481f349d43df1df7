use std::sync::Arc;

use tracing::{debug, warn};

use crate::{ProcessorId, Topology};

/// Whether executors restrict their threads to their processors.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum BindingMode {
    /// Each executor binds its thread to its processor before running any work.
    #[default]
    Enabled,

    /// Threads run wherever the scheduler puts them. Executors only log the processor they
    /// observe, which makes measurements of an unbound system possible.
    Disabled,
}

/// Binds the current thread to a processor and checks that the binding took effect.
///
/// The topology binds the thread if it describes this system. Otherwise, or if it refuses, the
/// fallback topology (the operating system affinity API) binds it instead. A binding that does
/// not take effect is logged but is not an error: the measurement can still proceed, it is just
/// less precise.
#[derive(Clone, Debug)]
pub struct Affinity {
    topology: Arc<dyn Topology>,
    fallback: Arc<dyn Topology>,
    mode: BindingMode,
}

impl Affinity {
    /// Binds through `topology`, falling back to `fallback` when `topology` cannot bind.
    #[must_use]
    pub fn new(
        topology: Arc<dyn Topology>,
        fallback: Arc<dyn Topology>,
        mode: BindingMode,
    ) -> Self {
        Self {
            topology,
            fallback,
            mode,
        }
    }

    /// Returns whether the current thread ended up bound to the requested processor, which is
    /// never the case with binding disabled.
    pub fn bind_current_thread(&self, processor: ProcessorId) -> bool {
        if self.mode == BindingMode::Disabled {
            let observed = self.topology.current_processor();
            debug!(processor, ?observed, "binding disabled, running unbound");
            return false;
        }

        let verifier = if self.topology.is_this_system() {
            match self.topology.bind_current_thread(processor) {
                Ok(()) => &self.topology,
                Err(error) => {
                    warn!(
                        processor,
                        %error,
                        "topology could not bind thread, using operating system affinity"
                    );
                    self.bind_with_fallback(processor);
                    &self.fallback
                }
            }
        } else {
            self.bind_with_fallback(processor);
            &self.fallback
        };

        match verifier.current_binding() {
            Some(observed) if observed == processor => {
                debug!(processor, "thread bound to processor");
                true
            }
            observed => {
                warn!(
                    processor,
                    ?observed,
                    "thread is not bound to the requested processor, measurements may be imprecise"
                );
                false
            }
        }
    }

    /// The topology that describes the processors.
    #[must_use]
    pub fn topology(&self) -> &Arc<dyn Topology> {
        &self.topology
    }

    fn bind_with_fallback(&self, processor: ProcessorId) {
        if let Err(error) = self.fallback.bind_current_thread(processor) {
            warn!(processor, %error, "operating system refused to bind thread");
        }
    }
}
