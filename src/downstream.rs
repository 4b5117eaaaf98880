//! # Downstream Collaborator Interface
//!
//! The encode/mux/transport stage the pump forwards frames to. The pipeline
//! never encodes anything itself; it drives a [`Downstream`] implementation
//! and listens to the events that implementation raises through
//! [`DownstreamEvents`].
//!
//! ## Call Order
//!
//! ```text
//! prepare()            during Pipeline::init, on the caller thread
//! open(config, events) during Pipeline::run, on the caller thread
//! configure(caps)      on the pump thread, before the first frame and on
//!                      every geometry or rotation change
//! submit(frame, ..)    on the pump thread, once per cycle
//! finalize()           on the pump thread, exactly once when the pump exits
//! ```
//!
//! Events may be raised from any thread the implementation owns (a GStreamer
//! streaming thread, a bus watcher, ...).

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::caps::Caps;
use crate::core::FrameMailbox;
use crate::error::{StreamerError, StreamerResult};
use crate::frame::Frame;
use crate::lifecycle::{Lifecycle, StreamOutcome};
use crate::sink::{SinkKind, SinkRouter};

/// Everything a collaborator needs to wire its output stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownstreamConfig {
    /// Caps for the first frame; later changes arrive through `configure`
    pub caps: Caps,
    pub sink: SinkKind,
}

/// Encode/mux/transport stage driven by the pump.
pub trait Downstream: Send {
    /// Check that every processing stage can be constructed.
    ///
    /// Must fail with [`StreamerError::Initialization`] when a required stage
    /// is unavailable.
    fn prepare(&mut self) -> StreamerResult<()>;

    /// Build and start the processing chain for `config`.
    fn open(&mut self, config: &DownstreamConfig, events: DownstreamEvents) -> StreamerResult<()>;

    /// Apply new geometry. Idempotent, callable mid-stream.
    fn configure(&mut self, caps: &Caps) -> StreamerResult<()>;

    /// Accept one frame for processing. Must not block indefinitely.
    fn submit(&mut self, frame: Frame, pts_ns: u64, duration_ns: u64) -> StreamerResult<()>;

    /// Flush and release everything (close file, send end marker).
    fn finalize(&mut self) -> StreamerResult<()>;
}

/// Handle a collaborator uses to report lifecycle events back to the pipeline.
#[derive(Clone)]
pub struct DownstreamEvents {
    lifecycle: Arc<Lifecycle>,
    router: Arc<SinkRouter>,
    mailbox: Arc<FrameMailbox>,
}

impl DownstreamEvents {
    pub(crate) fn new(
        lifecycle: Arc<Lifecycle>,
        router: Arc<SinkRouter>,
        mailbox: Arc<FrameMailbox>,
    ) -> Self {
        Self {
            lifecycle,
            router,
            mailbox,
        }
    }

    /// The chain is wired and accepts frames. Only the first call has an
    /// effect: the sink opens its outputs, then the user's ready hook runs.
    pub fn ready(&self) -> StreamerResult<()> {
        if self.router.is_ready() {
            return Ok(());
        }
        self.router.on_ready()?;
        self.lifecycle.fire_ready();
        Ok(())
    }

    /// The collaborator reached end of stream, normally or because of `error`.
    ///
    /// Either way the pump is woken and will exit on its next cycle.
    pub fn end_of_stream(&self, error: Option<StreamerError>) {
        match error {
            Some(error) => self.lifecycle.fail(&error),
            None => {
                self.lifecycle.finish(StreamOutcome::Completed);
            }
        }
        self.mailbox.close();
        self.router.on_end_of_stream();
    }

    /// One encoded chunk (typically one JPEG per frame).
    pub fn output_chunk(&self, chunk: Bytes) {
        self.router.on_output_chunk(chunk);
    }
}

impl fmt::Debug for DownstreamEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownstreamEvents")
            .field("state", &self.lifecycle.state())
            .field("sink", self.router.kind())
            .finish()
    }
}
