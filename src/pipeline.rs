//! # Pipeline Facade
//!
//! Owns one streaming pipeline: the mailbox, the lifecycle, the sink router
//! and the pump thread. There is no process-wide state; every pipeline is an
//! independent value with a `build → init → run → stop` lifetime. A stopped
//! pipeline cannot be restarted, build a new one instead.
//!
//! ## Threads
//!
//! - **Caller thread**: `init`, `run`, `feed`, `set_rotation`, `stop`
//! - **Pump thread**: spawned by `run`, joined by `stop` within
//!   `StreamConfig::shutdown_grace`
//! - **Collaborator threads**: whatever the downstream implementation runs;
//!   they talk back through [`DownstreamEvents`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use rgb_streamer::{Pipeline, StreamConfig};
//! use rgb_streamer::sink::SinkKind;
//! # fn downstream() -> Box<dyn rgb_streamer::Downstream> { unimplemented!() }
//!
//! # fn main() -> rgb_streamer::error::StreamerResult<()> {
//! let mut pipeline = Pipeline::builder()
//!     .downstream_boxed(downstream())
//!     .on_output(|jpeg| println!("{} bytes", jpeg.len()))
//!     .build();
//! pipeline.init()?;
//! pipeline.run(StreamConfig::new(30, 512, 300, SinkKind::PullCallback))?;
//! pipeline.feed(1024, 600, &vec![0xAA; 1024 * 600 * 3])?;
//! let report = pipeline.stop()?;
//! println!("{} frames", report.frames_submitted);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};

use crate::caps::{CapsNegotiator, RotationMode};
use crate::config::{DEFAULT_SHUTDOWN_GRACE, StreamConfig};
use crate::core::{FrameMailbox, MailboxStats};
use crate::downstream::{Downstream, DownstreamConfig, DownstreamEvents};
use crate::error::{StreamerError, StreamerResult};
use crate::frame::Frame;
use crate::lifecycle::{Lifecycle, LifecycleHooks, PipelineState, StreamOutcome};
use crate::pump::{FrameInput, FramePump, FrameSource, PumpReport};
use crate::sink::{OutputCallback, SinkRouter, SinkStats};
use crate::transport::{Endpoint, PublishTransport};

/// Collects the collaborators and callbacks of a [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    downstream: Option<Box<dyn Downstream>>,
    source: Option<Box<dyn FrameSource>>,
    hooks: LifecycleHooks,
    output: Option<OutputCallback>,
    transport: Option<Arc<dyn PublishTransport>>,
}

impl PipelineBuilder {
    /// Downstream collaborator frames are forwarded to.
    pub fn downstream(self, downstream: impl Downstream + 'static) -> Self {
        self.downstream_boxed(Box::new(downstream))
    }

    pub fn downstream_boxed(mut self, downstream: Box<dyn Downstream>) -> Self {
        self.downstream = Some(downstream);
        self
    }

    /// Switch to pull mode: the pump asks `source` for each frame and `feed`
    /// is rejected.
    pub fn source(mut self, source: impl FrameSource + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Called once, after the chain is wired and before the first frame.
    pub fn on_ready(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.hooks.on_ready = Some(Box::new(hook));
        self
    }

    /// Called once when the stream ends, normally or on a fatal error.
    pub fn on_end_of_stream(mut self, hook: impl FnOnce(StreamOutcome) + Send + 'static) -> Self {
        self.hooks.on_end_of_stream = Some(Box::new(hook));
        self
    }

    /// Receives every encoded chunk the collaborator produces.
    pub fn on_output(mut self, callback: impl FnMut(&[u8]) + Send + 'static) -> Self {
        self.output = Some(Box::new(callback));
        self
    }

    /// Publish channel for the `PushLatest` sink. Defaults to a
    /// [`TcpLatestPublisher`](crate::transport::TcpLatestPublisher).
    pub fn transport(mut self, transport: Arc<dyn PublishTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Pipeline {
        let downstream = self.downstream.or_else(default_downstream);
        Pipeline {
            lifecycle: Arc::new(Lifecycle::new(self.hooks)),
            mailbox: Arc::new(FrameMailbox::new(RotationMode::None)),
            downstream,
            source: self.source,
            output: self.output,
            transport: self.transport,
            router: None,
            pump: None,
            pull_mode: false,
            grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

#[cfg(feature = "gstreamer")]
fn default_downstream() -> Option<Box<dyn Downstream>> {
    Some(Box::new(crate::gst::GstDownstream::new()))
}

#[cfg(not(feature = "gstreamer"))]
fn default_downstream() -> Option<Box<dyn Downstream>> {
    None
}

struct PumpHandle {
    thread: JoinHandle<()>,
    done: Receiver<PumpReport>,
}

pub struct Pipeline {
    lifecycle: Arc<Lifecycle>,
    mailbox: Arc<FrameMailbox>,
    downstream: Option<Box<dyn Downstream>>,
    source: Option<Box<dyn FrameSource>>,
    output: Option<OutputCallback>,
    transport: Option<Arc<dyn PublishTransport>>,
    router: Option<Arc<SinkRouter>>,
    pump: Option<PumpHandle>,
    pull_mode: bool,
    grace: Duration,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Check the downstream collaborator (`Init → Ready`).
    ///
    /// On failure the pipeline stays in `Init`.
    pub fn init(&mut self) -> StreamerResult<()> {
        let state = self.lifecycle.state();
        if state != PipelineState::Init {
            return Err(StreamerError::state(
                state.description(),
                "init",
                "pipeline was already initialized",
            ));
        }
        let downstream = self.downstream.as_mut().ok_or_else(|| {
            StreamerError::initialization("downstream", "no downstream collaborator configured")
        })?;
        downstream.prepare().map_err(|e| match e {
            StreamerError::Initialization { .. } => e,
            other => StreamerError::initialization("downstream", other.to_string()),
        })?;
        self.lifecycle.transition(PipelineState::Ready, "init")
    }

    /// Open the downstream chain, fire the ready callback, and start the pump
    /// (`Ready → Playing`).
    ///
    /// If the chain cannot be opened the pipeline ends in `Stopped` and the
    /// error is returned. The end-of-stream callback only fires when the
    /// collaborator itself reported the failure through its events.
    pub fn run(&mut self, config: StreamConfig) -> StreamerResult<()> {
        let state = self.lifecycle.state();
        if state != PipelineState::Ready {
            return Err(StreamerError::state(
                state.description(),
                "run",
                "pipeline must be initialized and not yet running",
            ));
        }
        config.validate()?;
        let mut downstream = self.downstream.take().ok_or_else(|| {
            StreamerError::initialization("downstream", "no downstream collaborator configured")
        })?;

        let router = Arc::new(SinkRouter::new(
            config.sink.clone(),
            self.output.take(),
            self.transport.clone(),
        ));
        self.router = Some(Arc::clone(&router));
        self.mailbox.set_rotation(config.rotation);
        self.grace = config.shutdown_grace;

        let events = DownstreamEvents::new(
            Arc::clone(&self.lifecycle),
            Arc::clone(&router),
            Arc::clone(&self.mailbox),
        );
        let initial = CapsNegotiator::new(config.output, config.framerate, config.rotation);
        let downstream_config = DownstreamConfig {
            caps: initial.caps(),
            sink: config.sink.clone(),
        };

        log::info!(
            "Starting pipeline: {} fps, output {}, sink {}",
            config.framerate,
            config.output,
            config.sink
        );
        if let Err(e) = downstream.open(&downstream_config, events.clone()) {
            self.abort_run(downstream.as_mut(), &router);
            return Err(match e {
                StreamerError::Initialization { .. } => e,
                other => StreamerError::initialization("downstream chain", other.to_string()),
            });
        }

        if let Err(e) = self.lifecycle.transition(PipelineState::Playing, "run") {
            // the collaborator reported a fatal error while opening
            self.abort_run(downstream.as_mut(), &router);
            return Err(StreamerError::initialization("downstream chain", e.to_string()));
        }
        if let Err(e) = events.ready() {
            self.abort_run(downstream.as_mut(), &router);
            return Err(e);
        }

        let input = match self.source.take() {
            Some(source) => FrameInput::Pull(source),
            None => FrameInput::Mailbox,
        };
        self.pull_mode = input.is_pull();
        let pump = FramePump::new(
            downstream,
            Arc::clone(&self.mailbox),
            Arc::clone(&self.lifecycle),
            Arc::clone(&router),
            input,
            &config,
        );

        let (done_tx, done) = bounded::<PumpReport>(1);
        let thread = thread::Builder::new()
            .name("frame-pump".into())
            .spawn(move || {
                let report = pump.run();
                let _ = done_tx.send(report);
            })
            .map_err(|e| {
                let error = StreamerError::io("spawn pump thread", e);
                self.lifecycle.fail(&error);
                error
            })?;
        self.pump = Some(PumpHandle { thread, done });
        Ok(())
    }

    /// Copy one RGB24 frame into the mailbox, replacing any frame the pump
    /// has not taken yet. Never waits for the pump.
    pub fn feed(&self, width: u32, height: u32, bytes: &[u8]) -> StreamerResult<()> {
        self.check_feed("feed")?;
        self.mailbox.feed(width, height, bytes)
    }

    /// Ownership variant of [`feed`](Self::feed); no copy.
    pub fn feed_frame(&self, frame: Frame) -> StreamerResult<()> {
        self.check_feed("feed_frame")?;
        self.mailbox.put(frame);
        Ok(())
    }

    /// Rotate the output caps; applied before the next forwarded frame.
    pub fn set_rotation(&self, mode: RotationMode) {
        self.mailbox.set_rotation(mode);
    }

    pub fn state(&self) -> PipelineState {
        self.lifecycle.state()
    }

    /// Publish endpoint of a running `PushLatest` pipeline.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.router.as_ref().and_then(|router| router.endpoint())
    }

    pub fn mailbox_stats(&self) -> MailboxStats {
        self.mailbox.stats()
    }

    pub fn sink_stats(&self) -> SinkStats {
        self.router
            .as_ref()
            .map(|router| router.stats())
            .unwrap_or_default()
    }

    /// Stop streaming and join the pump (`Playing|Stopping → Stopped`).
    ///
    /// Safe after the pump already exited on an error; the failure is
    /// reported in [`PumpReport::failure`]. Calling `stop` again returns a
    /// `State` error and does nothing. When the pump does not exit within the
    /// grace period its thread is detached and `ShutdownTimeout` is returned.
    pub fn stop(&mut self) -> StreamerResult<PumpReport> {
        let previous = self.lifecycle.request_stop()?;
        self.mailbox.close();

        let joined = match self.pump.take() {
            Some(pump) => self.join_pump(pump),
            None => {
                log::debug!("Stopping pipeline that never ran (was {})", previous);
                Ok(PumpReport::default())
            }
        };

        if let Some(router) = &self.router {
            router.on_end_of_stream();
        }
        let outcome = match &joined {
            Ok(PumpReport {
                failure: Some(summary),
                ..
            }) => StreamOutcome::Failed(summary.clone()),
            Ok(_) => StreamOutcome::Completed,
            Err(e) => StreamOutcome::Failed(e.to_string()),
        };
        self.lifecycle.finish(outcome);
        self.lifecycle.transition(PipelineState::Stopped, "stop")?;
        joined
    }

    fn check_feed(&self, operation: &str) -> StreamerResult<()> {
        let state = self.lifecycle.state();
        if !matches!(state, PipelineState::Ready | PipelineState::Playing) {
            return Err(StreamerError::state(
                state.description(),
                operation,
                "pipeline is not accepting frames",
            ));
        }
        if self.pull_mode || self.source.is_some() {
            return Err(StreamerError::state(
                state.description(),
                operation,
                "frames come from the pull source in this run",
            ));
        }
        Ok(())
    }

    fn join_pump(&self, pump: PumpHandle) -> StreamerResult<PumpReport> {
        match pump.done.recv_timeout(self.grace) {
            Ok(report) => {
                if pump.thread.join().is_err() {
                    log::error!("Pump thread panicked after reporting");
                }
                Ok(report)
            }
            Err(RecvTimeoutError::Timeout) => {
                let grace_ms = u64::try_from(self.grace.as_millis()).unwrap_or(u64::MAX);
                log::error!(
                    "Pump did not exit within {}ms, detaching its thread",
                    grace_ms
                );
                Err(StreamerError::shutdown_timeout("join pump", grace_ms))
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = pump.thread.join();
                log::error!("Pump thread panicked");
                Err(StreamerError::state(
                    PipelineState::Stopping.description(),
                    "join pump",
                    "pump thread panicked",
                ))
            }
        }
    }

    fn abort_run(&self, downstream: &mut dyn Downstream, router: &SinkRouter) {
        if let Err(e) = downstream.finalize() {
            log::warn!("Finalize after failed start: {}", e);
        }
        router.on_end_of_stream();
        self.mailbox.close();
        let stopping = match self.lifecycle.state() {
            PipelineState::Stopping => Ok(()),
            _ => self.lifecycle.transition(PipelineState::Stopping, "run"),
        };
        if stopping
            .and_then(|()| self.lifecycle.transition(PipelineState::Stopped, "run"))
            .is_err()
        {
            log::error!("Pipeline left in {} after failed start", self.state());
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.pump.is_some() {
            if let Err(e) = self.stop() {
                log::error!("Stop on drop failed: {}", e);
            }
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state())
            .field("pull_mode", &self.pull_mode)
            .field("endpoint", &self.endpoint())
            .field("mailbox", &self.mailbox_stats())
            .finish()
    }
}
