//! Pipeline lifecycle management
//!
//! ```text
//!  Init ──init()──▶ Ready ──run()──▶ Playing ──stop()──▶ Stopping ──join──▶ Stopped
//!    │                │                 │                    ▲
//!    └────────────────┴─────error───────┴────────────────────┘
//! ```
//!
//! [`Lifecycle`] is the only place the pipeline state changes. It also owns the
//! user's ready and end-of-stream hooks and guarantees each fires at most once
//! per pipeline. Hooks are invoked without the internal lock held, so they may
//! call back into the pipeline.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::error::{StreamerError, StreamerResult, classify};

/// Pipeline state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    /// Constructed, downstream not checked yet
    #[default]
    Init,

    /// Downstream collaborator is available, waiting for `run`
    Ready,

    /// Pump is running and frames are being forwarded
    Playing,

    /// Stop requested or fatal error seen, pump is draining
    Stopping,

    /// Pump joined and resources released
    Stopped,
}

impl PipelineState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &PipelineState) -> bool {
        use PipelineState::*;

        match (self, target) {
            (Init, Ready) => true,
            (Ready, Playing) => true,

            // Errors and explicit stops
            (Init | Ready | Playing, Stopping) => true,

            (Stopping, Stopped) => true,

            // Re-initialization of a fresh pipeline object
            (Stopping | Stopped, Init) => true,

            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            PipelineState::Init => "Init",
            PipelineState::Ready => "Ready",
            PipelineState::Playing => "Playing",
            PipelineState::Stopping => "Stopping",
            PipelineState::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// How a run ended, as reported to the end-of-stream hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    /// Fatal error summary
    Failed(String),
}

impl StreamOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, StreamOutcome::Failed(_))
    }
}

pub type ReadyHook = Box<dyn FnOnce() + Send>;
pub type EndOfStreamHook = Box<dyn FnOnce(StreamOutcome) + Send>;

/// User callbacks fired on lifecycle events.
#[derive(Default)]
pub struct LifecycleHooks {
    pub on_ready: Option<ReadyHook>,
    pub on_end_of_stream: Option<EndOfStreamHook>,
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("on_ready", &self.on_ready.is_some())
            .field("on_end_of_stream", &self.on_end_of_stream.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct LifecycleInner {
    state: PipelineState,
    hooks: LifecycleHooks,
    ready_fired: bool,
    outcome: Option<StreamOutcome>,
}

#[derive(Debug, Default)]
pub struct Lifecycle {
    inner: Mutex<LifecycleInner>,
}

impl Lifecycle {
    pub fn new(hooks: LifecycleHooks) -> Self {
        Self {
            inner: Mutex::new(LifecycleInner {
                hooks,
                ..LifecycleInner::default()
            }),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.lock().state
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PipelineState::Playing
    }

    /// Move to `target`, rejecting transitions the state machine forbids.
    pub fn transition(&self, target: PipelineState, operation: &str) -> StreamerResult<()> {
        let mut inner = self.lock();
        let current = inner.state;
        if !current.can_transition_to(&target) {
            return Err(StreamerError::state(
                current.description(),
                operation,
                format!("cannot move to {}", target),
            ));
        }
        inner.state = target;
        drop(inner);
        log::info!("Pipeline {} -> {} ({})", current, target, operation);
        Ok(())
    }

    /// Fire the ready hook. Returns `false` when it already fired.
    pub fn fire_ready(&self) -> bool {
        let hook = {
            let mut inner = self.lock();
            if inner.ready_fired {
                return false;
            }
            inner.ready_fired = true;
            inner.hooks.on_ready.take()
        };
        log::debug!("Pipeline ready");
        if let Some(hook) = hook {
            hook();
        }
        true
    }

    /// Record a fatal error: force `Stopping` and report the failure through
    /// the end-of-stream hook. Only the first failure is kept.
    pub fn fail(&self, error: &StreamerError) {
        {
            let mut inner = self.lock();
            if inner.outcome.is_some() {
                log::debug!("Ignoring error after stream end: {}", error);
                return;
            }
            if inner.state.can_transition_to(&PipelineState::Stopping) {
                log::info!("Pipeline {} -> Stopping (error)", inner.state);
                inner.state = PipelineState::Stopping;
            }
        }
        classify::report(error);
        self.finish(StreamOutcome::Failed(error.to_string()));
    }

    /// Begin an explicit stop.
    ///
    /// `Stopping` is accepted as well, since the pump may already be draining
    /// after an error. Any other state is rejected without side effects.
    pub fn request_stop(&self) -> StreamerResult<PipelineState> {
        let mut inner = self.lock();
        let current = inner.state;
        match current {
            PipelineState::Ready | PipelineState::Playing => {
                inner.state = PipelineState::Stopping;
                drop(inner);
                log::info!("Pipeline {} -> Stopping (stop)", current);
                Ok(current)
            }
            PipelineState::Stopping => Ok(current),
            PipelineState::Init | PipelineState::Stopped => Err(StreamerError::state(
                current.description(),
                "stop",
                "pipeline is not running",
            )),
        }
    }

    /// Fire the end-of-stream hook with `outcome`. Returns `false` when the
    /// stream already ended.
    pub fn finish(&self, outcome: StreamOutcome) -> bool {
        let hook = {
            let mut inner = self.lock();
            if inner.outcome.is_some() {
                return false;
            }
            inner.outcome = Some(outcome.clone());
            inner.hooks.on_end_of_stream.take()
        };
        log::info!("End of stream: {:?}", outcome);
        if let Some(hook) = hook {
            hook(outcome);
        }
        true
    }

    pub fn outcome(&self) -> Option<StreamOutcome> {
        self.lock().outcome.clone()
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
