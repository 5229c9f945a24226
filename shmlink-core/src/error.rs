// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Custom error types for shmlink.
//!
//! Explicit enum error types per concern, converted into [`ShmLinkError`]
//! at the crate boundary. No `Box<dyn Error>`, no `anyhow::Result`.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::SubscriberId;

/// Top-level error type for shmlink.
#[derive(Debug, Error)]
pub enum ShmLinkError {
    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    #[error("Endpoint not configured: {id}")]
    EndpointNotConfigured { id: String },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Segment error: {0}")]
    Segment(#[from] SegmentError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("Control channel error: {0}")]
    Control(#[from] ControlError),

    // =========================================================================
    // System Errors
    // =========================================================================
    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Hard validation errors cause the configuration to be rejected outright.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Segment capacity out of bounds: {capacity} bytes (min: {min}, max: {max})")]
    CapacityOutOfBounds {
        capacity: usize,
        min: usize,
        max: usize,
    },

    #[error("Duplicate {field}: {value}")]
    Duplicate { field: &'static str, value: String },

    #[error("Schema validation failed: {message}")]
    SchemaValidation { message: String },
}

/// Endpoint lifecycle transition errors.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Cannot transition endpoint {segment} from {from} to {to}")]
    InvalidTransition {
        segment: String,
        from: &'static str,
        to: &'static str,
    },
}

/// Errors raised by a shared memory segment.
#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("Failed to allocate shared memory segment {name}: {reason}")]
    Allocation { name: String, reason: String },

    #[error("Invalid segment handle: {reason}")]
    InvalidHandle { reason: String },

    #[error("Failed to export handle for segment {name}: {reason}")]
    HandleExport { name: String, reason: String },

    #[error("Segment {name} is closed")]
    Closed { name: String },

    #[error("Write of {len} bytes exceeds segment capacity {capacity}")]
    OutOfBounds { len: usize, capacity: usize },
}

/// Errors raised while encoding or decoding a length-prefixed frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Payload size exceeds maximum: {size} > {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Cannot write empty payload")]
    EmptyPayload,

    #[error("Corrupt frame: declared length {length} outside 1..={max}")]
    CorruptFrame { length: i64, max: usize },

    #[error(transparent)]
    Segment(#[from] SegmentError),
}

/// Errors raised by a [`SharedMemoryEndpoint`](crate::endpoint::SharedMemoryEndpoint).
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Endpoint is closed")]
    Closed,

    #[error("Endpoint has no segment yet - call acquire_segment first")]
    NotReady,

    #[error("No remote segment attached")]
    NotAttached,

    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    InvalidTransition(#[from] StateTransitionError),
}

/// Delivery failure for a single subscriber. Only ever logged by the
/// registry; the subscriber is pruned and the broadcast carries on.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Subscriber {subscriber} is disconnected")]
    Disconnected { subscriber: SubscriberId },

    #[error("Delivery failed: {reason}")]
    Failed { reason: String },
}

/// Control channel errors.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Control socket error: {context} - {source}")]
    Socket {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("System call {syscall} failed: {source}")]
    Syscall {
        syscall: &'static str,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("Malformed control message: {reason}")]
    Protocol { reason: String },

    #[error("Control message of {size} bytes exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Peer closed the control connection")]
    Disconnected,

    #[error("No reply within {timeout_ms}ms")]
    ReplyTimeout { timeout_ms: u64 },

    #[error("Remote endpoint error: {message}")]
    Remote { message: String },
}

impl From<serde_json::Error> for ControlError {
    fn from(e: serde_json::Error) -> Self {
        ControlError::Protocol {
            reason: e.to_string(),
        }
    }
}

/// Result type alias using ShmLinkError.
pub type ShmLinkResult<T> = Result<T, ShmLinkError>;

/// Result type alias for endpoint operations.
pub type EndpointResult<T> = Result<T, EndpointError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hard_validation_error_display() {
        let err = HardValidationError::MissingRequiredField {
            field: "segment_name",
            context: "endpoint 'app-a'".to_string(),
        };
        assert!(err.to_string().contains("segment_name"));
        assert!(err.to_string().contains("app-a"));
    }

    #[test]
    fn test_error_chain() {
        let frame_err = FrameError::PayloadTooLarge {
            size: 5000,
            max: 4092,
        };
        let endpoint_err: EndpointError = frame_err.into();
        assert!(matches!(endpoint_err, EndpointError::Frame(_)));

        let top: ShmLinkError = endpoint_err.into();
        assert!(matches!(top, ShmLinkError::Endpoint(_)));
        assert!(top.to_string().contains("5000"));
    }

    #[test]
    fn test_corrupt_frame_display() {
        let err = FrameError::CorruptFrame {
            length: -1,
            max: 4092,
        };
        assert!(err.to_string().contains("-1"));
    }
}
