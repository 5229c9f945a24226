// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML configuration parser with strict schema validation.
//!
//! Describes the deployment: which endpoints exist, the segment each one
//! owns, where its control socket lives, and the frame byte order every
//! process must agree on. Any invalid field results in a HardValidationError.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HardValidationError, ShmLinkError, ShmLinkResult};
use crate::types::{ByteOrder, Capacity, EndpointId, DEFAULT_CAPACITY};

/// Upper bound for control-channel reply timeouts.
const MAX_REPLY_TIMEOUT_MS: u64 = 60_000;

/// Raw endpoint configuration as parsed from YAML (before validation).
#[derive(Debug, Deserialize)]
struct RawEndpointConfig {
    id: String,
    segment_name: Option<String>,
    #[serde(default = "default_capacity")]
    capacity: usize,
    socket_path: Option<String>,
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

/// Raw transport configuration.
#[derive(Debug, Deserialize)]
struct RawTransportConfig {
    #[serde(default)]
    byte_order: ByteOrder,
    #[serde(default = "default_reply_timeout_ms")]
    reply_timeout_ms: u64,
}

fn default_reply_timeout_ms() -> u64 {
    2000
}

impl Default for RawTransportConfig {
    fn default() -> Self {
        Self {
            byte_order: ByteOrder::default(),
            reply_timeout_ms: default_reply_timeout_ms(),
        }
    }
}

/// Raw root configuration file.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    transport: RawTransportConfig,
    endpoints: Vec<RawEndpointConfig>,
}

/// Validated endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub id: EndpointId,
    pub segment_name: String,
    pub capacity: Capacity,
    pub socket_path: PathBuf,
}

/// Validated transport configuration shared by all endpoints.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub byte_order: ByteOrder,
    pub reply_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            byte_order: ByteOrder::default(),
            reply_timeout: Duration::from_millis(default_reply_timeout_ms()),
        }
    }
}

/// Complete validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub transport: TransportConfig,
    pub endpoints: Vec<EndpointConfig>,
}

impl Config {
    /// The symmetric two-endpoint deployment (`app-a` / `app-b`) with
    /// control sockets under `socket_dir`.
    pub fn default_pair(socket_dir: impl AsRef<Path>) -> Self {
        let dir = socket_dir.as_ref();
        let endpoint = |id: &str, segment: &str| EndpointConfig {
            id: EndpointId::new(id).expect("static endpoint id is valid"),
            segment_name: segment.to_string(),
            capacity: Capacity::default(),
            socket_path: dir.join(format!("{}.sock", id)),
        };

        Self {
            transport: TransportConfig::default(),
            endpoints: vec![
                endpoint("app-a", "two_ipc_shared_a"),
                endpoint("app-b", "two_ipc_shared_b"),
            ],
        }
    }

    /// Look up an endpoint by id.
    pub fn endpoint(&self, id: &str) -> ShmLinkResult<&EndpointConfig> {
        self.endpoints
            .iter()
            .find(|e| e.id.as_str() == id)
            .ok_or_else(|| ShmLinkError::EndpointNotConfigured { id: id.to_string() })
    }
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> ShmLinkResult<Config> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ShmLinkError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| ShmLinkError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> ShmLinkResult<Config> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| ShmLinkError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?;

        Self::validate(raw)
    }

    /// Validate raw configuration and convert to validated types.
    fn validate(raw: RawConfig) -> ShmLinkResult<Config> {
        let transport = Self::validate_transport(raw.transport)?;

        let mut endpoints = Vec::with_capacity(raw.endpoints.len());
        let mut seen_ids = HashSet::new();
        let mut seen_segments = HashSet::new();
        let mut seen_sockets = HashSet::new();

        for (index, raw_endpoint) in raw.endpoints.into_iter().enumerate() {
            let endpoint = Self::validate_endpoint(raw_endpoint, index)?;

            if !seen_ids.insert(endpoint.id.clone()) {
                return Err(HardValidationError::Duplicate {
                    field: "id",
                    value: endpoint.id.to_string(),
                }
                .into());
            }

            if !seen_segments.insert(endpoint.segment_name.clone()) {
                return Err(HardValidationError::Duplicate {
                    field: "segment_name",
                    value: endpoint.segment_name.clone(),
                }
                .into());
            }

            if !seen_sockets.insert(endpoint.socket_path.clone()) {
                return Err(HardValidationError::Duplicate {
                    field: "socket_path",
                    value: endpoint.socket_path.display().to_string(),
                }
                .into());
            }

            endpoints.push(endpoint);
        }

        if endpoints.is_empty() {
            return Err(HardValidationError::SchemaValidation {
                message: "At least one endpoint must be defined".to_string(),
            }
            .into());
        }

        Ok(Config {
            transport,
            endpoints,
        })
    }

    /// Validate transport configuration.
    fn validate_transport(raw: RawTransportConfig) -> ShmLinkResult<TransportConfig> {
        if raw.reply_timeout_ms == 0 || raw.reply_timeout_ms > MAX_REPLY_TIMEOUT_MS {
            return Err(HardValidationError::InvalidFieldValue {
                field: "reply_timeout_ms",
                value: raw.reply_timeout_ms.to_string(),
                reason: format!("Must be between 1 and {}", MAX_REPLY_TIMEOUT_MS),
            }
            .into());
        }

        Ok(TransportConfig {
            byte_order: raw.byte_order,
            reply_timeout: Duration::from_millis(raw.reply_timeout_ms),
        })
    }

    /// Validate a single endpoint configuration.
    fn validate_endpoint(raw: RawEndpointConfig, index: usize) -> ShmLinkResult<EndpointConfig> {
        let context = format!("endpoint at index {}", index);

        let id = EndpointId::new(&raw.id).map_err(|mut e| {
            if let HardValidationError::InvalidFieldValue { ref mut field, .. } = e {
                *field = "id";
            }
            e
        })?;

        let segment_name = raw
            .segment_name
            .ok_or_else(|| HardValidationError::MissingRequiredField {
                field: "segment_name",
                context: context.clone(),
            })?;
        if segment_name.is_empty() || segment_name.contains('\0') {
            return Err(HardValidationError::InvalidFieldValue {
                field: "segment_name",
                value: segment_name,
                reason: "Segment name must be non-empty and contain no NUL bytes".to_string(),
            }
            .into());
        }

        let capacity = Capacity::new(raw.capacity)?;

        let socket_path = raw
            .socket_path
            .map(PathBuf::from)
            .ok_or(HardValidationError::MissingRequiredField {
                field: "socket_path",
                context,
            })?;

        Ok(EndpointConfig {
            id,
            segment_name,
            capacity,
            socket_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_CONFIG: &str = r#"
transport:
  byte_order: little
  reply_timeout_ms: 500

endpoints:
  - id: app-a
    segment_name: two_ipc_shared_a
    capacity: 4096
    socket_path: /tmp/shmlink/app-a.sock
  - id: app-b
    segment_name: two_ipc_shared_b
    socket_path: /tmp/shmlink/app-b.sock
"#;

    #[test]
    fn test_valid_config() {
        let config = ConfigLoader::load_string(VALID_CONFIG).unwrap();
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[0].id.as_str(), "app-a");
        assert_eq!(config.transport.byte_order, ByteOrder::Little);
        assert_eq!(config.transport.reply_timeout, Duration::from_millis(500));
        assert_eq!(config.endpoint("app-b").unwrap().capacity.bytes(), 4096);
    }

    #[test]
    fn test_defaults_applied() {
        let yaml = r#"
endpoints:
  - id: solo
    segment_name: solo_segment
    socket_path: /tmp/solo.sock
"#;
        let config = ConfigLoader::load_string(yaml).unwrap();
        assert_eq!(config.transport.byte_order, ByteOrder::Big);
        assert_eq!(config.transport.reply_timeout, Duration::from_millis(2000));
        assert_eq!(config.endpoints[0].capacity, Capacity::default());
    }

    #[test]
    fn test_missing_endpoints() {
        assert!(ConfigLoader::load_string("endpoints: []").is_err());
    }

    #[test]
    fn test_unknown_byte_order() {
        let yaml = r#"
transport:
  byte_order: middle
endpoints:
  - id: a
    segment_name: seg
    socket_path: /tmp/a.sock
"#;
        assert!(matches!(
            ConfigLoader::load_string(yaml),
            Err(ShmLinkError::ConfigParse { .. })
        ));
    }

    #[test]
    fn test_invalid_endpoint_id() {
        let yaml = r#"
endpoints:
  - id: "bad id"
    segment_name: seg
    socket_path: /tmp/a.sock
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_missing_socket_path() {
        let yaml = r#"
endpoints:
  - id: a
    segment_name: seg
"#;
        let err = ConfigLoader::load_string(yaml).unwrap_err();
        assert!(err.to_string().contains("socket_path"));
    }

    #[test]
    fn test_capacity_out_of_bounds() {
        let yaml = r#"
endpoints:
  - id: a
    segment_name: seg
    capacity: 4
    socket_path: /tmp/a.sock
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_duplicates_rejected() {
        let same_id = r#"
endpoints:
  - id: a
    segment_name: seg1
    socket_path: /tmp/a.sock
  - id: a
    segment_name: seg2
    socket_path: /tmp/b.sock
"#;
        let same_socket = r#"
endpoints:
  - id: a
    segment_name: seg1
    socket_path: /tmp/a.sock
  - id: b
    segment_name: seg2
    socket_path: /tmp/a.sock
"#;
        let same_segment = r#"
endpoints:
  - id: a
    segment_name: seg
    socket_path: /tmp/a.sock
  - id: b
    segment_name: seg
    socket_path: /tmp/b.sock
"#;
        assert!(ConfigLoader::load_string(same_id).is_err());
        assert!(ConfigLoader::load_string(same_socket).is_err());
        assert!(ConfigLoader::load_string(same_segment).is_err());
    }

    #[test]
    fn test_reply_timeout_bounds() {
        let yaml = r#"
transport:
  reply_timeout_ms: 0
endpoints:
  - id: a
    segment_name: seg
    socket_path: /tmp/a.sock
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_default_pair() {
        let config = Config::default_pair("/run/shmlink");
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoint("app-a").unwrap().segment_name, "two_ipc_shared_a");
        assert_eq!(
            config.endpoint("app-b").unwrap().socket_path,
            PathBuf::from("/run/shmlink/app-b.sock")
        );
        assert!(config.endpoint("app-c").is_err());
    }
}
