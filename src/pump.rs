//! # Frame Pump
//!
//! Consumer side of the hand-off. One pump runs per `run`, on its own thread,
//! and is the only caller of [`FrameMailbox::take`] and of the downstream
//! collaborator's `configure`/`submit`/`finalize`.
//!
//! ## Cycle
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ obtain frame │──▶│ renegotiate?  │──▶│ stop asked?  │──▶│ stamp+submit │──┐
//! │ take | pull  │   │ configure(..) │   │ exit, no fwd │   │ pts = n/fps  │  │
//! └──────────────┘   └───────────────┘   └──────────────┘   └──────────────┘  │
//!        ▲                                                                    │
//!        └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Timestamps come from a frame counter, never from arrival times, so output
//! is constant-rate however bursty the producer is. A failed `submit` is not
//! retried: the lifecycle is failed and the loop ends. `finalize` runs exactly
//! once when the loop ends, whatever the reason.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::caps::CapsNegotiator;
use crate::config::{Pacing, StreamConfig};
use crate::core::{Delivery, FrameMailbox, Handoff};
use crate::downstream::Downstream;
use crate::error::StreamerError;
use crate::frame::Frame;
use crate::lifecycle::Lifecycle;
use crate::sink::SinkRouter;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Synchronous frame producer polled once per pump cycle.
///
/// Returning `None` ends the stream cleanly.
pub trait FrameSource: Send {
    fn pull(&mut self) -> Option<Frame>;
}

impl<F> FrameSource for F
where
    F: FnMut() -> Option<Frame> + Send,
{
    fn pull(&mut self) -> Option<Frame> {
        self()
    }
}

/// Where the pump gets frames from. Fixed for the whole run.
pub enum FrameInput {
    /// Frames deposited with `Pipeline::feed`
    Mailbox,
    /// Frames produced on demand by a pull source
    Pull(Box<dyn FrameSource>),
}

impl FrameInput {
    pub fn is_pull(&self) -> bool {
        matches!(self, FrameInput::Pull(_))
    }
}

/// Fixed-cadence presentation clock.
#[derive(Debug, Clone)]
pub struct PacingClock {
    framerate: u32,
    frames: u64,
    started: Instant,
}

impl PacingClock {
    pub fn new(framerate: u32) -> Self {
        Self {
            framerate: framerate.max(1),
            frames: 0,
            started: Instant::now(),
        }
    }

    /// Timestamp of the next frame, scaled from the frame count so rounding
    /// never accumulates.
    pub fn peek_pts(&self) -> u64 {
        self.pts_of(self.frames)
    }

    /// Consume the next timestamp.
    pub fn next_pts(&mut self) -> u64 {
        let pts = self.peek_pts();
        self.frames += 1;
        pts
    }

    /// Duration of one frame in nanoseconds.
    pub fn frame_duration_ns(&self) -> u64 {
        self.pts_of(self.frames + 1) - self.pts_of(self.frames)
    }

    /// Time left until the next frame is due on the wall clock.
    pub fn until_next(&self) -> Duration {
        let due = self.started + Duration::from_nanos(self.peek_pts());
        due.saturating_duration_since(Instant::now())
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    fn pts_of(&self, n: u64) -> u64 {
        (u128::from(n) * NANOS_PER_SEC / u128::from(self.framerate)) as u64
    }
}

/// What the pump did during one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpReport {
    pub frames_submitted: u64,
    pub last_pts: Option<u64>,
    /// `configure` calls after the initial one
    pub renegotiations: u64,
    /// Fatal error summary, if the run ended on one
    pub failure: Option<String>,
}

pub struct FramePump {
    downstream: Box<dyn Downstream>,
    mailbox: Arc<FrameMailbox>,
    lifecycle: Arc<Lifecycle>,
    router: Arc<SinkRouter>,
    input: FrameInput,
    caps: CapsNegotiator,
    clock: PacingClock,
    pacing: Pacing,
}

impl FramePump {
    pub fn new(
        downstream: Box<dyn Downstream>,
        mailbox: Arc<FrameMailbox>,
        lifecycle: Arc<Lifecycle>,
        router: Arc<SinkRouter>,
        input: FrameInput,
        config: &StreamConfig,
    ) -> Self {
        Self {
            downstream,
            mailbox,
            lifecycle,
            router,
            input,
            caps: CapsNegotiator::new(config.output, config.framerate, config.rotation),
            clock: PacingClock::new(config.framerate),
            pacing: config.pacing,
        }
    }

    /// Drive the cycle until end of stream, stop, or a fatal error.
    pub fn run(mut self) -> PumpReport {
        let mut report = PumpReport::default();
        let mut configured = false;
        log::debug!(
            "Pump started ({} input, {:?} pacing)",
            if self.input.is_pull() { "pull" } else { "mailbox" },
            self.pacing
        );

        while self.lifecycle.is_playing() {
            let Some(mut handoff) = self.next_frame() else {
                break;
            };

            if self.pacing == Pacing::Realtime {
                if self.mailbox.wait_closed(self.clock.until_next()) {
                    break;
                }
                match self.freshest(handoff) {
                    Some(latest) => handoff = latest,
                    None => break,
                }
            }

            let Handoff {
                frame,
                resized,
                rotation,
            } = handoff;
            let mut changed = false;
            if let Some(mode) = rotation {
                changed |= self.caps.set_rotation(mode).is_some();
            }
            if let Some(geometry) = resized {
                changed |= self.caps.note_input_resize(geometry.width, geometry.height);
            }

            if changed || !configured {
                let caps = self.caps.caps();
                if let Err(e) = self.downstream.configure(&caps) {
                    report.failure = Some(e.to_string());
                    self.fail(e.with_operation("configure"));
                    break;
                }
                if configured {
                    report.renegotiations += 1;
                    log::info!("Renegotiated caps: {}", caps);
                }
                configured = true;
            }

            if !self.lifecycle.is_playing() {
                log::debug!("Stop requested, dropping pending {:?}", frame);
                break;
            }

            let pts = self.clock.next_pts();
            let duration = self.clock.frame_duration_ns();
            match self.downstream.submit(frame, pts, duration) {
                Ok(()) => {
                    report.frames_submitted += 1;
                    report.last_pts = Some(pts);
                    log::trace!("Submitted frame {} pts={}ns", self.clock.frames(), pts);
                }
                Err(e) => {
                    report.failure = Some(e.to_string());
                    self.fail(
                        e.with_operation("submit")
                            .with_metadata("pts_ns", pts.to_string()),
                    );
                    break;
                }
            }
        }

        if let Err(e) = self.downstream.finalize() {
            if report.failure.is_none() {
                report.failure = Some(e.to_string());
            }
            self.fail(e.with_operation("finalize"));
        }
        log::info!(
            "Pump exited after {} frames ({} renegotiations)",
            report.frames_submitted,
            report.renegotiations
        );
        report
    }

    fn next_frame(&mut self) -> Option<Handoff> {
        match &mut self.input {
            FrameInput::Mailbox => match self.mailbox.take() {
                Delivery::Frame(handoff) => Some(handoff),
                Delivery::EndOfStream => None,
            },
            FrameInput::Pull(source) => {
                let rotation = self.mailbox.take_pending_rotation();
                let Some(frame) = source.pull() else {
                    log::info!("Frame source exhausted");
                    return None;
                };
                // pulled frames carry no history, the negotiator ignores repeats
                Some(Handoff {
                    resized: Some(frame.geometry()),
                    frame,
                    rotation,
                })
            }
        }
    }

    /// After a paced wait, swap in any frame fed in the meantime. The stale
    /// frame's allocation goes back to the mailbox.
    fn freshest(&self, stale: Handoff) -> Option<Handoff> {
        if self.input.is_pull() {
            return Some(stale);
        }
        match self.mailbox.try_take() {
            None => Some(stale),
            Some(Delivery::EndOfStream) => None,
            Some(Delivery::Frame(newer)) => {
                self.mailbox.recycle(stale.frame.into_bytes());
                Some(Handoff {
                    frame: newer.frame,
                    resized: newer.resized.or(stale.resized),
                    rotation: newer.rotation.or(stale.rotation),
                })
            }
        }
    }

    /// Fatal error: stop the lifecycle, wake the producer side and close the
    /// outputs so the publish endpoint disappears with the stream.
    fn fail(&self, error: StreamerError) {
        self.lifecycle.fail(&error);
        self.mailbox.close();
        self.router.on_end_of_stream();
    }
}
