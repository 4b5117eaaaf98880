//! # Caps Negotiation
//!
//! Tracks the input and output geometry of the running pipeline and decides
//! when the downstream collaborator has to be reconfigured.
//!
//! Output geometry is fixed by configuration; rotation only exchanges its
//! width and height. Input geometry follows whatever the producer feeds.
//! Only the latest change is kept: the pump applies it lazily on its next cycle.

use std::fmt;

use crate::frame::{Geometry, PixelFormat};

/// Orientation applied to the output caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationMode {
    #[default]
    None,
    /// Output width and height exchanged
    Rotate90,
}

impl RotationMode {
    /// Apply this rotation to a configured output geometry.
    pub fn apply(self, output: Geometry) -> Geometry {
        match self {
            RotationMode::None => output,
            RotationMode::Rotate90 => output.transposed(),
        }
    }
}

impl From<i32> for RotationMode {
    /// Integer code used by the C-style API: `1` rotates, anything else does not.
    fn from(code: i32) -> Self {
        match code {
            1 => RotationMode::Rotate90,
            _ => RotationMode::None,
        }
    }
}

impl fmt::Display for RotationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationMode::None => write!(f, "none"),
            RotationMode::Rotate90 => write!(f, "rotate-90"),
        }
    }
}

/// Negotiated format contract handed to the downstream collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caps {
    /// Geometry of the raw frames being submitted
    pub input: Geometry,
    /// Geometry the collaborator must scale to
    pub output: Geometry,
    pub framerate: u32,
    pub format: PixelFormat,
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} @ {}/1",
            self.format.caps_name(),
            self.input,
            self.output,
            self.framerate
        )
    }
}

#[derive(Debug, Clone)]
pub struct CapsNegotiator {
    input: Geometry,
    configured_output: Geometry,
    rotation: RotationMode,
    framerate: u32,
}

impl CapsNegotiator {
    /// Start with input equal to the configured output; the first frame of a
    /// different size triggers a renegotiation.
    pub fn new(output: Geometry, framerate: u32, rotation: RotationMode) -> Self {
        Self {
            input: output,
            configured_output: output,
            rotation,
            framerate,
        }
    }

    pub fn input(&self) -> Geometry {
        self.input
    }

    /// Output geometry after rotation.
    pub fn output(&self) -> Geometry {
        self.rotation.apply(self.configured_output)
    }

    pub fn rotation(&self) -> RotationMode {
        self.rotation
    }

    pub fn caps(&self) -> Caps {
        Caps {
            input: self.input,
            output: self.output(),
            framerate: self.framerate,
            format: PixelFormat::Rgb24,
        }
    }

    /// Record new input geometry. Returns whether downstream must be
    /// reconfigured. Output geometry is never affected.
    pub fn note_input_resize(&mut self, width: u32, height: u32) -> bool {
        let next = Geometry::new(width, height);
        if next == self.input {
            return false;
        }
        log::warn!("Input resized {} -> {}", self.input, next);
        self.input = next;
        true
    }

    /// Change rotation. Returns the caps to apply before the next frame, or
    /// `None` when the mode is unchanged.
    pub fn set_rotation(&mut self, mode: RotationMode) -> Option<Caps> {
        if mode == self.rotation {
            return None;
        }
        self.rotation = mode;
        log::info!("Rotation set to {}, output caps {}", mode, self.output());
        Some(self.caps())
    }
}
