//! Bit-plane codec: lossless mapping between a 16-bit frame and
//! [`PLANE_COUNT`] 8-bit planes an 8-bit-only engine can consume.
//!
//! For a sample `V` with top byte `H` and bottom byte `L`:
//! - plane 0 carries `H` unchanged, a usable 8-bit preview on its own;
//! - plane `k` (1..=4) carries the top six bits of `H` and, in its two low
//!   bits, the 2-bit slice `L[2k-1 : 2k-2]`.
//!
//! Planes 1-4 therefore look like near-copies of plane 0, which keeps the
//! hidden low bits inside ordinary-looking imagery.

use anyhow::{bail, Result};

use crate::types::{Frame, PlaneGeometry, PlaneSet, CHANNELS, PLANE_COUNT};

const HIGH_MASK: u8 = 0b1111_1100;
const SLICE_MASK: u8 = 0b11;

/// Split one 16-bit sample into its five plane values.
#[inline]
pub fn encode_sample(value: u16) -> [u8; PLANE_COUNT] {
    let high = (value >> 8) as u8;
    let low = value as u8;
    let base = high & HIGH_MASK;
    [
        high,
        base | (low & SLICE_MASK),
        base | ((low >> 2) & SLICE_MASK),
        base | ((low >> 4) & SLICE_MASK),
        base | ((low >> 6) & SLICE_MASK),
    ]
}

/// Rebuild a 16-bit sample from its five plane values.
#[inline]
pub fn decode_sample(planes: [u8; PLANE_COUNT]) -> u16 {
    ((planes[0] as u16) << 8)
        | (planes[1] & SLICE_MASK) as u16
        | (((planes[2] & SLICE_MASK) as u16) << 2)
        | (((planes[3] & SLICE_MASK) as u16) << 4)
        | (((planes[4] & SLICE_MASK) as u16) << 6)
}

/// Encode a frame into its wide plane set.
pub fn encode(frame: &Frame) -> PlaneSet {
    let geometry = PlaneGeometry::new(frame.width(), frame.height());
    let width = geometry.width as usize;
    let row_bytes = width * CHANNELS;
    let wide_row_bytes = row_bytes * PLANE_COUNT;
    let mut data = vec![0u8; geometry.plane_set_bytes()];

    for (src_row, dst_row) in frame
        .samples()
        .chunks_exact(row_bytes.max(1))
        .zip(data.chunks_exact_mut(wide_row_bytes.max(1)))
    {
        for (i, &sample) in src_row.iter().enumerate() {
            let planes = encode_sample(sample);
            for (plane, value) in planes.into_iter().enumerate() {
                dst_row[plane * row_bytes + i] = value;
            }
        }
    }

    PlaneSet::from_parts(geometry, data)
}

/// Decode a plane set back into a 16-bit frame.
pub fn decode(set: &PlaneSet) -> Result<Frame> {
    let geometry = set.geometry();
    let width = geometry.width as usize;
    let row_bytes = width * CHANNELS;
    let wide_row_bytes = row_bytes * PLANE_COUNT;
    if set.as_bytes().len() != wide_row_bytes * geometry.height as usize {
        bail!("plane set does not match its geometry");
    }

    let mut samples = Vec::with_capacity(row_bytes * geometry.height as usize);
    for row in set.as_bytes().chunks_exact(wide_row_bytes.max(1)) {
        for i in 0..row_bytes {
            let mut planes = [0u8; PLANE_COUNT];
            for (plane, slot) in planes.iter_mut().enumerate() {
                *slot = row[plane * row_bytes + i];
            }
            samples.push(decode_sample(planes));
        }
    }

    Frame::new(geometry.width, geometry.height, samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_frame(width: u32, height: u32, seed: u16) -> Frame {
        let samples = (0..width as usize * height as usize * CHANNELS)
            .map(|i| (i as u16).wrapping_mul(2654).wrapping_add(seed))
            .collect();
        Frame::new(width, height, samples).unwrap()
    }

    #[test]
    fn test_every_sample_value_round_trips() {
        for value in 0..=u16::MAX {
            assert_eq!(decode_sample(encode_sample(value)), value, "value {value:#06x}");
        }
    }

    #[test]
    fn test_plane_layout_matches_bit_slices() {
        let planes = encode_sample(0b1010_1101_1110_0100);
        assert_eq!(planes[0], 0b1010_1101);
        assert_eq!(planes[1], 0b1010_1100);
        assert_eq!(planes[2], 0b1010_1101);
        assert_eq!(planes[3], 0b1010_1110);
        assert_eq!(planes[4], 0b1010_1111);
    }

    #[test]
    fn test_supplementary_planes_share_high_six_bits() {
        let value = 0x3FF << 6;
        let planes = encode_sample(value);
        for plane in &planes[1..] {
            assert_eq!(plane & HIGH_MASK, planes[0] & HIGH_MASK);
        }
    }

    #[test]
    fn test_frame_round_trip_is_exact() {
        let frame = gradient_frame(7, 3, 911);
        let decoded = decode(&encode(&frame)).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_encode_produces_five_wide_blocks() {
        let frame = gradient_frame(4, 2, 3);
        let set = encode(&frame);
        assert_eq!(set.geometry().encoded_width(), 20);
        assert_eq!(set.as_bytes().len(), 20 * 2 * CHANNELS);

        let preview = set.plane(0).unwrap();
        assert_eq!(preview.len(), 4 * 2 * CHANNELS);
        for (byte, sample) in preview.iter().zip(frame.samples()) {
            assert_eq!(*byte, (sample >> 8) as u8);
        }

        for plane in 1..PLANE_COUNT {
            let block = set.plane(plane).unwrap();
            assert_eq!(block.len(), 4 * 2 * CHANNELS);
            for (byte, sample) in block.iter().zip(frame.samples()) {
                let expected = encode_sample(*sample)[plane];
                assert_eq!(*byte, expected);
            }
        }
    }

    #[test]
    fn test_decode_only_reads_low_bits_of_supplementary_planes() {
        let frame = gradient_frame(3, 3, 77);
        let mut set = encode(&frame);
        let row_bytes = 3 * CHANNELS;
        // Disturb the high six bits of planes 1-4; the payload must survive.
        for row in set.as_bytes_mut().chunks_exact_mut(row_bytes * PLANE_COUNT) {
            for byte in &mut row[row_bytes..] {
                *byte ^= HIGH_MASK;
            }
        }
        assert_eq!(decode(&set).unwrap(), frame);
    }
}
