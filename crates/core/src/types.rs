use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Color channels per pixel. Frames are always interleaved RGB.
pub const CHANNELS: usize = 3;

/// Number of 8-bit planes a 16-bit frame is split into.
pub const PLANE_COUNT: usize = 5;

/// Bytes per pixel of a raw `rgb48` frame.
pub const RGB48_BYTES_PER_PIXEL: usize = CHANNELS * 2;

/// A decoded source frame: 16-bit samples, interleaved RGB, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<u16>,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u16>) -> Result<Self> {
        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            bail!(
                "frame sample count mismatch: expected {expected} for {width}x{height}, got {}",
                data.len()
            );
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Parse a raw big-endian `rgb48be` buffer (6 bytes per pixel).
    pub fn from_rgb48be(width: u32, height: u32, bytes: &[u8]) -> Result<Self> {
        let expected = width as usize * height as usize * RGB48_BYTES_PER_PIXEL;
        if bytes.len() != expected {
            bail!(
                "rgb48be buffer size mismatch: expected {expected} bytes, got {}",
                bytes.len()
            );
        }
        let data = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn to_rgb48be(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() * 2);
        for sample in &self.data {
            bytes.extend_from_slice(&sample.to_be_bytes());
        }
        bytes
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn samples(&self) -> &[u16] {
        &self.data
    }

    /// `[r, g, b]` at pixel `(x, y)`.
    #[cfg(test)]
    pub(crate) fn pixel(&self, x: u32, y: u32) -> [u16; CHANNELS] {
        let offset = (y as usize * self.width as usize + x as usize) * CHANNELS;
        [
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
        ]
    }
}

/// Dimensions shared by a source frame and its plane set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaneGeometry {
    /// Source frame width in pixels.
    pub width: u32,
    pub height: u32,
}

impl PlaneGeometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Width of the wide image the engine sees: `width * PLANE_COUNT`.
    pub fn encoded_width(&self) -> u32 {
        self.width * PLANE_COUNT as u32
    }

    /// Bytes of one plane set on the wire (3 bytes per pixel).
    pub fn plane_set_bytes(&self) -> usize {
        self.encoded_width() as usize * self.height as usize * CHANNELS
    }

    /// Bytes of one raw `rgb48` source frame.
    pub fn rgb48_frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * RGB48_BYTES_PER_PIXEL
    }
}

/// `PLANE_COUNT` full-resolution 8-bit planes laid out left to right as one
/// wide interleaved-RGB image of `width * PLANE_COUNT` by `height`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneSet {
    geometry: PlaneGeometry,
    data: Vec<u8>,
}

impl PlaneSet {
    pub fn new(geometry: PlaneGeometry, data: Vec<u8>) -> Result<Self> {
        if data.len() != geometry.plane_set_bytes() {
            bail!(
                "plane set size mismatch: expected {} bytes for {}x{}, got {}",
                geometry.plane_set_bytes(),
                geometry.encoded_width(),
                geometry.height,
                data.len()
            );
        }
        Ok(Self { geometry, data })
    }

    /// Caller guarantees `data.len() == geometry.plane_set_bytes()`.
    pub(crate) fn from_parts(geometry: PlaneGeometry, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), geometry.plane_set_bytes());
        Self { geometry, data }
    }

    pub fn geometry(&self) -> PlaneGeometry {
        self.geometry
    }

    /// Wide-image RGB bytes, row-major.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[cfg(test)]
    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Copy plane `index` out as a standalone `width x height` RGB24 image.
    #[cfg(test)]
    pub(crate) fn plane(&self, index: usize) -> Result<Vec<u8>> {
        if index >= PLANE_COUNT {
            bail!("plane index {index} out of range (0..{PLANE_COUNT})");
        }
        let width = self.geometry.width as usize;
        let row_bytes = width * CHANNELS;
        let wide_row_bytes = row_bytes * PLANE_COUNT;
        let mut out = Vec::with_capacity(row_bytes * self.geometry.height as usize);
        for row in self.data.chunks_exact(wide_row_bytes.max(1)) {
            let start = index * row_bytes;
            out.extend_from_slice(&row[start..start + row_bytes]);
        }
        Ok(out)
    }
}

/// One adjacent frame pair waiting for an engine.
#[derive(Debug, Clone)]
pub struct InterpolationTask {
    /// Sequence id; the first task is 2 (the id of its right frame).
    pub id: u64,
    pub left: Arc<PlaneSet>,
    pub right: Arc<PlaneSet>,
}

/// Engine output for one task.
#[derive(Debug, Clone)]
pub struct InterpolationResult {
    pub id: u64,
    pub mid: PlaneSet,
    /// The task's right plane set, echoed unchanged.
    pub right: Arc<PlaneSet>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rejects_wrong_sample_count() {
        assert!(Frame::new(2, 2, vec![0; 11]).is_err());
        assert!(Frame::new(2, 2, vec![0; 12]).is_ok());
    }

    #[test]
    fn test_rgb48be_parse_is_big_endian() {
        let bytes = [0x12, 0x34, 0xAB, 0xCD, 0x00, 0x01];
        let frame = Frame::from_rgb48be(1, 1, &bytes).unwrap();
        assert_eq!(frame.pixel(0, 0), [0x1234, 0xABCD, 0x0001]);
        assert_eq!(frame.to_rgb48be(), bytes);
    }

    #[test]
    fn test_rgb48be_rejects_partial_buffer() {
        let err = Frame::from_rgb48be(2, 1, &[0u8; 11]).unwrap_err();
        assert!(err.to_string().contains("expected 12 bytes"));
    }

    #[test]
    fn test_geometry_sizes() {
        let geometry = PlaneGeometry::new(1920, 1080);
        assert_eq!(geometry.encoded_width(), 9600);
        assert_eq!(geometry.plane_set_bytes(), 1920 * 1080 * 15);
        assert_eq!(geometry.rgb48_frame_bytes(), 1920 * 1080 * 6);
    }

    #[test]
    fn test_plane_extracts_block() {
        let geometry = PlaneGeometry::new(1, 2);
        // row 0: planes 0..5 carry 0..5, row 1: planes carry 10..15
        let mut data = Vec::new();
        for row in 0..2u8 {
            for plane in 0..PLANE_COUNT as u8 {
                let v = row * 10 + plane;
                data.extend_from_slice(&[v, v, v]);
            }
        }
        let set = PlaneSet::new(geometry, data).unwrap();
        assert_eq!(set.plane(3).unwrap(), vec![3, 3, 3, 13, 13, 13]);
        assert!(set.plane(PLANE_COUNT).is_err());
    }
}
