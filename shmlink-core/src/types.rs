// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers for validated inputs.
//!
//! Following the "Newtype" pattern in Rust to ensure valid state by construction.
//! All types validate their invariants at creation time.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::HardValidationError;

/// Smallest usable segment: a length prefix plus a few payload bytes.
pub const MIN_CAPACITY: usize = 8;
/// Largest segment accepted: 16 MB.
pub const MAX_CAPACITY: usize = 16 * 1024 * 1024;
/// Capacity used by both regions of the default deployment.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Validated endpoint identifier.
/// Must be non-empty, alphanumeric with hyphens/underscores, max 64 chars.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointId(String);

impl EndpointId {
    /// Create a new EndpointId with validation.
    pub fn new(id: impl Into<String>) -> Result<Self, HardValidationError> {
        let id = id.into();

        if id.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "endpoint_id",
                value: id,
                reason: "Endpoint ID cannot be empty".to_string(),
            });
        }

        if id.len() > 64 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "endpoint_id",
                value: id.clone(),
                reason: format!("Endpoint ID too long: {} chars (max 64)", id.len()),
            });
        }

        if !id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(HardValidationError::InvalidFieldValue {
                field: "endpoint_id",
                value: id,
                reason: "Endpoint ID must contain only alphanumeric characters, hyphens, and underscores".to_string(),
            });
        }

        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for EndpointId {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EndpointId> for String {
    fn from(id: EndpointId) -> Self {
        id.0
    }
}

/// Validated subscriber identity.
///
/// Opaque to the registry; non-empty, at most 128 chars, no whitespace or
/// control characters. Remote subscribers are namespaced by their
/// connection (`conn-7/watcher`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubscriberId(String);

impl SubscriberId {
    /// Create a new SubscriberId with validation.
    pub fn new(id: impl Into<String>) -> Result<Self, HardValidationError> {
        let id = id.into();

        if id.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "subscriber_id",
                value: id,
                reason: "Subscriber ID cannot be empty".to_string(),
            });
        }

        if id.len() > 128 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "subscriber_id",
                value: id.clone(),
                reason: format!("Subscriber ID too long: {} chars (max 128)", id.len()),
            });
        }

        if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(HardValidationError::InvalidFieldValue {
                field: "subscriber_id",
                value: id,
                reason: "Subscriber ID must not contain whitespace or control characters"
                    .to_string(),
            });
        }

        Ok(Self(id))
    }

    /// Scope this id under a control connection.
    pub fn scoped(&self, connection: u64) -> Self {
        Self(format!("conn-{}/{}", connection, self.0))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for SubscriberId {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SubscriberId> for String {
    fn from(id: SubscriberId) -> Self {
        id.0
    }
}

/// Validated segment capacity in bytes.
/// Must be between MIN_CAPACITY and MAX_CAPACITY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct Capacity(usize);

impl Capacity {
    /// Create a new Capacity with bounds validation.
    pub fn new(bytes: usize) -> Result<Self, HardValidationError> {
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&bytes) {
            return Err(HardValidationError::CapacityOutOfBounds {
                capacity: bytes,
                min: MIN_CAPACITY,
                max: MAX_CAPACITY,
            });
        }
        Ok(Self(bytes))
    }

    /// Get the capacity in bytes.
    pub fn bytes(&self) -> usize {
        self.0
    }
}

impl Default for Capacity {
    fn default() -> Self {
        Self(DEFAULT_CAPACITY)
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.0)
    }
}

impl TryFrom<usize> for Capacity {
    type Error = HardValidationError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Capacity> for usize {
    fn from(capacity: Capacity) -> Self {
        capacity.0
    }
}

/// Byte order of the frame length prefix.
///
/// Both ends of a deployment must agree; a mismatch is not detected by the
/// transport and typically surfaces as corrupt frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
    Native,
}

impl ByteOrder {
    /// Encode a length prefix.
    pub fn encode_u32(&self, value: u32) -> [u8; 4] {
        match self {
            Self::Big => value.to_be_bytes(),
            Self::Little => value.to_le_bytes(),
            Self::Native => value.to_ne_bytes(),
        }
    }

    /// Decode a length prefix as the signed integer a peer may have written.
    pub fn decode_i32(&self, bytes: [u8; 4]) -> i32 {
        match self {
            Self::Big => i32::from_be_bytes(bytes),
            Self::Little => i32::from_le_bytes(bytes),
            Self::Native => i32::from_ne_bytes(bytes),
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Big => "big",
            Self::Little => "little",
            Self::Native => "native",
        }
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
