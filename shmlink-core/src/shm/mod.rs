// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Shared memory transport module.
//!
//! Anonymous shared memory segments that can be handed to another process
//! as a file descriptor, and the single-frame codec that lives inside them.

mod frame;
mod handle;
mod segment;

pub use frame::{max_payload, FramedChannel, FRAME_HEADER_LEN};
pub use handle::SegmentHandle;
pub use segment::{SegmentBackend, SegmentOrigin, SharedMemorySegment};
