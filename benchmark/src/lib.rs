// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! shmlink benchmark fixtures.
//!
//! Shared helpers for the criterion benches:
//!
//! - **frame**: encode/decode of length-prefixed frames at various payload sizes
//! - **notify**: write fan-out to local subscribers, and local vs socket access

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use shmlink_core::{ByteOrder, Capacity, SharedMemoryEndpoint};

/// Payload sizes to benchmark (in bytes). All fit the largest bench segment.
pub const PAYLOAD_SIZES: &[usize] = &[16, 256, 1024, 4092, 16384, 65536];

/// Segment capacity used by the benches.
pub const BENCH_CAPACITY: usize = 128 * 1024;

static NEXT: AtomicU64 = AtomicU64::new(0);

/// Segment name unique within this process.
pub fn unique_name(prefix: &str) -> String {
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    format!("{}_{}_{}", prefix, std::process::id(), n)
}

/// Printable payload of `size` bytes.
pub fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| b'a' + (i % 26) as u8).collect()
}

/// Ready endpoint with the bench capacity.
pub fn ready_endpoint(prefix: &str) -> Arc<SharedMemoryEndpoint> {
    let capacity = Capacity::new(BENCH_CAPACITY).expect("bench capacity is valid");
    let endpoint = SharedMemoryEndpoint::new_shared(unique_name(prefix), capacity, ByteOrder::Big);
    endpoint
        .acquire_segment()
        .expect("Failed to create bench segment");
    endpoint
}
