// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CLI command modules.

pub mod read;
pub mod serve;
pub mod validate;
pub mod watch;
pub mod write;

use shmlink_core::{Config, ConfigLoader, ShmLinkResult};

/// Socket directory used when no configuration file is given.
const DEFAULT_SOCKET_DIR: &str = "/tmp/shmlink";

/// Load the configuration file, or fall back to the default endpoint pair.
pub fn load_config(path: Option<&str>) -> ShmLinkResult<Config> {
    match path {
        Some(path) => ConfigLoader::load_file(path),
        None => {
            tracing::debug!(socket_dir = DEFAULT_SOCKET_DIR, "Using default endpoint pair");
            Ok(Config::default_pair(DEFAULT_SOCKET_DIR))
        }
    }
}
