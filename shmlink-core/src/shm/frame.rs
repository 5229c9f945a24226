// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Length-prefixed framing over a fixed-size segment.
//!
//! Layout: `[0, 4)` payload length, `[4, 4 + len)` payload, the remainder
//! undefined. One frame per segment; a new frame overwrites the last one.
//! The length range check is the only corruption guard - there is no checksum.

use crate::error::FrameError;
use crate::shm::SharedMemorySegment;
use crate::types::ByteOrder;

/// Size of the length prefix in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest payload a segment of `capacity` bytes can hold.
pub const fn max_payload(capacity: usize) -> usize {
    capacity.saturating_sub(FRAME_HEADER_LEN)
}

/// Stateless codec for the single-frame segment layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramedChannel {
    byte_order: ByteOrder,
}

impl FramedChannel {
    pub fn new(byte_order: ByteOrder) -> Self {
        Self { byte_order }
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Write `payload` as the segment's current frame.
    pub fn encode(
        &self,
        segment: &SharedMemorySegment,
        payload: &[u8],
    ) -> Result<(), FrameError> {
        let max = max_payload(segment.capacity());
        if payload.len() > max {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }
        if payload.is_empty() {
            return Err(FrameError::EmptyPayload);
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&self.byte_order.encode_u32(payload.len() as u32));
        frame.extend_from_slice(payload);

        segment.write_all(&frame)?;
        Ok(())
    }

    /// Read the segment's current frame.
    pub fn decode(&self, segment: &SharedMemorySegment) -> Result<Vec<u8>, FrameError> {
        let max = max_payload(segment.capacity());
        let header = segment.read_range(0, FRAME_HEADER_LEN)?;
        let length = self
            .byte_order
            .decode_i32([header[0], header[1], header[2], header[3]]);

        if length <= 0 || length as usize > max {
            return Err(FrameError::CorruptFrame {
                length: i64::from(length),
                max,
            });
        }

        Ok(segment.read_range(FRAME_HEADER_LEN, length as usize)?)
    }
}
