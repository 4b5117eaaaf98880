//! # Configuration Module
//!
//! Per-run configuration handed to [`Pipeline::run`](crate::Pipeline::run).
//! A `StreamConfig` is validated once and never mutated while the run lasts;
//! only the *input* geometry may change mid-stream.
//!
//! ## Configuration Parameters
//!
//! | Parameter        | Type           | Range        | Description |
//! |------------------|----------------|--------------|-------------|
//! | `framerate`      | `u32`          | 1-240        | Output frames per second, drives timestamps |
//! | `output`         | `Geometry`     | non-zero     | Encoded output size before rotation |
//! | `sink`           | `SinkKind`     | -            | Where encoded output goes |
//! | `rotation`       | `RotationMode` | -            | Initial rotation |
//! | `pacing`         | `Pacing`       | -            | Who sets the cycle rate |
//! | `shutdown_grace` | `Duration`     | 10ms-60s     | How long `stop` waits for the pump |
//!
//! ## Examples
//!
//! ```rust
//! use rgb_streamer::config::{Pacing, StreamConfig};
//! use rgb_streamer::sink::SinkKind;
//!
//! let config = StreamConfig::new(30, 512, 300, SinkKind::PushLatest)
//!     .with_pacing(Pacing::Realtime);
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use crate::caps::RotationMode;
use crate::error::{StreamerError, StreamerResult};
use crate::frame::Geometry;
use crate::sink::SinkKind;

pub const MAX_FRAMERATE: u32 = 240;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How the pump schedules its cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Pacing {
    /// Cycle as fast as the collaborator accepts frames. Timestamps stay
    /// evenly spaced, so a live downstream clock still plays at `framerate`.
    #[default]
    Downstream,
    /// Sleep until each frame's presentation deadline on the wall clock.
    Realtime,
}

/// Configuration for one `run`/`stop` cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Output frames per second.
    ///
    /// Timestamps are spaced by exactly `1 / framerate` regardless of how
    /// often frames are fed.
    pub framerate: u32,

    /// Output geometry before rotation is applied.
    pub output: Geometry,

    /// Output destination.
    pub sink: SinkKind,

    /// Rotation active when the run starts; change it later with
    /// `Pipeline::set_rotation`.
    pub rotation: RotationMode,

    pub pacing: Pacing,

    /// Upper bound on how long `stop` waits for the pump to exit.
    pub shutdown_grace: Duration,
}

impl Default for StreamConfig {
    /// 30 fps, 512x300 output to the in-process callback.
    fn default() -> Self {
        Self {
            framerate: 30,
            output: Geometry::new(512, 300),
            sink: SinkKind::PullCallback,
            rotation: RotationMode::None,
            pacing: Pacing::Downstream,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl StreamConfig {
    pub fn new(framerate: u32, out_width: u32, out_height: u32, sink: SinkKind) -> Self {
        Self {
            framerate,
            output: Geometry::new(out_width, out_height),
            sink,
            ..Self::default()
        }
    }

    pub fn with_rotation(mut self, rotation: RotationMode) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Nanoseconds between two consecutive frames.
    pub fn frame_duration_ns(&self) -> u64 {
        1_000_000_000 / u64::from(self.framerate.max(1))
    }

    /// Validates the configuration parameters.
    ///
    /// # Validation Rules
    ///
    /// - `framerate` must be between 1 and 240
    /// - `output` width and height must be greater than 0
    /// - a `File` sink needs a non-empty path
    /// - `shutdown_grace` must be between 10ms and 60s
    pub fn validate(&self) -> StreamerResult<()> {
        if !(1..=MAX_FRAMERATE).contains(&self.framerate) {
            return Err(StreamerError::config(
                "framerate",
                self.framerate.to_string(),
                format!("must be between 1 and {}", MAX_FRAMERATE),
            ));
        }
        self.output.ensure_non_empty("output")?;
        if let SinkKind::File(path) = &self.sink {
            if path.as_os_str().is_empty() {
                return Err(StreamerError::config("sink", "", "file path is empty"));
            }
        }
        if self.shutdown_grace < Duration::from_millis(10)
            || self.shutdown_grace > Duration::from_secs(60)
        {
            return Err(StreamerError::config(
                "shutdown_grace",
                format!("{:?}", self.shutdown_grace),
                "must be between 10ms and 60s",
            ));
        }
        Ok(())
    }
}
