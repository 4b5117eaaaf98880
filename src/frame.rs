//! # Raw Frames
//!
//! A [`Frame`] is one tightly packed RGB24 image. Frames are moved, never
//! shared: the producer hands one to the mailbox, the pump takes it out, and
//! the downstream collaborator consumes it.

use std::fmt;

use crate::error::{StreamerError, StreamerResult};

/// Pixel layout of every frame the streamer accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelFormat {
    /// 8-bit R, G, B, no padding between pixels or rows
    #[default]
    Rgb24,
}

impl PixelFormat {
    /// Bytes per pixel
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
        }
    }

    /// Format name as used in raw video caps
    pub const fn caps_name(self) -> &'static str {
        match self {
            PixelFormat::Rgb24 => "RGB",
        }
    }
}

/// Width and height in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Geometry {
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Same geometry with width and height exchanged
    pub const fn transposed(self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }

    pub const fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Length in bytes of an RGB24 buffer with this geometry
    pub const fn rgb_len(self) -> usize {
        self.width as usize * self.height as usize * PixelFormat::Rgb24.bytes_per_pixel()
    }

    /// Reject zero-sized geometry
    pub fn ensure_non_empty(self, field: &str) -> StreamerResult<Self> {
        if self.is_empty() {
            return Err(StreamerError::validation(
                field,
                "width and height must be greater than 0",
                self.to_string(),
            ));
        }
        Ok(self)
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One raw RGB24 image.
///
/// `data.len()` always equals `width * height * 3`; every constructor checks it.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    geometry: Geometry,
    data: Vec<u8>,
}

impl Frame {
    /// Wrap an owned buffer without copying.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> StreamerResult<Self> {
        let geometry = Geometry::new(width, height).ensure_non_empty("frame")?;
        check_len(geometry, data.len())?;
        Ok(Self { geometry, data })
    }

    /// Copy a borrowed buffer into a new frame.
    pub fn from_slice(width: u32, height: u32, bytes: &[u8]) -> StreamerResult<Self> {
        let geometry = Geometry::new(width, height).ensure_non_empty("frame")?;
        check_len(geometry, bytes.len())?;
        Ok(Self {
            geometry,
            data: bytes.to_vec(),
        })
    }

    /// Frame filled with a single byte value.
    pub fn filled(width: u32, height: u32, value: u8) -> StreamerResult<Self> {
        let geometry = Geometry::new(width, height).ensure_non_empty("frame")?;
        Ok(Self {
            geometry,
            data: vec![value; geometry.rgb_len()],
        })
    }

    pub fn width(&self) -> u32 {
        self.geometry.width
    }

    pub fn height(&self) -> u32 {
        self.geometry.height
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn pixel_format(&self) -> PixelFormat {
        PixelFormat::Rgb24
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Give up the frame and keep its allocation.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Overwrite this frame with new contents, reallocating only when the
    /// byte length changes.
    pub(crate) fn overwrite(&mut self, geometry: Geometry, bytes: &[u8]) {
        debug_assert_eq!(geometry.rgb_len(), bytes.len());
        if self.data.len() != bytes.len() {
            self.data = bytes.to_vec();
        } else {
            self.data.copy_from_slice(bytes);
        }
        self.geometry = geometry;
    }

    /// Build a frame on top of a recycled allocation.
    pub(crate) fn from_recycled(geometry: Geometry, mut buffer: Vec<u8>, bytes: &[u8]) -> Self {
        if buffer.len() == bytes.len() {
            buffer.copy_from_slice(bytes);
        } else {
            buffer = bytes.to_vec();
        }
        Self {
            geometry,
            data: buffer,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("geometry", &self.geometry)
            .field("len", &self.data.len())
            .finish()
    }
}

fn check_len(geometry: Geometry, len: usize) -> StreamerResult<()> {
    let expected = geometry.rgb_len();
    if len != expected {
        return Err(StreamerError::validation(
            "frame.data",
            format!("length must be {} for {} RGB24", expected, geometry),
            len.to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_length_is_checked() {
        assert!(Frame::new(4, 2, vec![0; 24]).is_ok());
        assert!(Frame::new(4, 2, vec![0; 23]).is_err());
        assert!(Frame::from_slice(0, 2, &[]).is_err());
    }

    #[test]
    fn test_geometry_helpers() {
        let g = Geometry::new(1024, 600);
        assert_eq!(g.rgb_len(), 1024 * 600 * 3);
        assert_eq!(g.transposed(), Geometry::new(600, 1024));
        assert_eq!(g.to_string(), "1024x600");
    }

    #[test]
    fn test_overwrite_keeps_allocation_for_same_size() {
        let mut frame = Frame::filled(2, 2, 0).unwrap();
        let ptr = frame.as_bytes().as_ptr();
        frame.overwrite(Geometry::new(1, 4), &[7u8; 12]);
        assert_eq!(frame.as_bytes().as_ptr(), ptr);
        assert_eq!(frame.geometry(), Geometry::new(1, 4));
        assert!(frame.as_bytes().iter().all(|&b| b == 7));

        frame.overwrite(Geometry::new(3, 3), &[1u8; 27]);
        assert_eq!(frame.as_bytes().len(), 27);
    }
}
