//! # RGB Streamer Library
//!
//! Feeds raw RGB24 frames, arriving at irregular times and possibly changing
//! size, into an encode pipeline that runs at a fixed output frame rate.
//!
//! ## Architecture
//!
//! ```text
//! feed() ──▶ FrameMailbox ──▶ FramePump ──▶ CapsNegotiator ──▶ Downstream ──▶ SinkRouter
//! caller     one slot,        pump thread,   geometry and       encode/mux     file | socket |
//! thread     latest wins      pts = n/fps    rotation changes   (GStreamer)    callback | publish
//!                                 ▲                                  │
//!                                 └──── Lifecycle ◀── ready / eos ───┘
//! ```
//!
//! The library is organized into several key modules:
//! - `frame`: raw frame and geometry types
//! - `core`: the single-slot mailbox between producer and pump
//! - `caps`: input/output geometry and rotation tracking
//! - `lifecycle`: `Init → Ready → Playing → Stopping → Stopped`
//! - `pump`: the paced consumer loop
//! - `downstream`: the collaborator interface the pump drives
//! - `sink` / `transport`: output routing and the latest-wins publish channel
//! - `pipeline`: the owning facade
//! - `gst` (feature `gstreamer`): JPEG encoding with GStreamer
//!
//! ## Example
//!
//! ```rust,ignore
//! use rgb_streamer::{Pipeline, StreamConfig};
//! use rgb_streamer::sink::SinkKind;
//!
//! let mut pipeline = Pipeline::builder().build();
//! pipeline.init()?;
//! pipeline.run(StreamConfig::new(30, 512, 300, SinkKind::PushLatest))?;
//! println!("port {}", pipeline.endpoint().unwrap().port());
//! pipeline.feed(1024, 600, &frame_bytes)?;
//! pipeline.stop()?;
//! ```

pub mod caps;
pub mod config;
pub mod core;
pub mod downstream;
pub mod error;
pub mod frame;
#[cfg(feature = "gstreamer")]
pub mod gst;
pub mod lifecycle;
pub mod pipeline;
pub mod pump;
pub mod sink;
pub mod transport;

/// Re-export the types most callers need
pub use caps::{Caps, CapsNegotiator, RotationMode};
pub use config::{Pacing, StreamConfig};
pub use core::{FrameMailbox, MailboxStats};
pub use downstream::{Downstream, DownstreamConfig, DownstreamEvents};
pub use error::{HasSeverity, StreamerError, StreamerResult};
pub use frame::{Frame, Geometry, PixelFormat};
pub use lifecycle::{PipelineState, StreamOutcome};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use pump::{FrameSource, PumpReport};
pub use sink::{SinkKind, SinkStats};
pub use transport::{Endpoint, PublishTransport, TcpLatestPublisher};

#[cfg(feature = "gstreamer")]
pub use gst::GstDownstream;
