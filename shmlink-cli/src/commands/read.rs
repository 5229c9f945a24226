// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `shmlink read` command - Read the current message of a served endpoint.
//!
//! With `--direct` the segment descriptor is fetched over the control socket
//! and the frame is decoded from the local mapping.

use shmlink_core::{EndpointDirectory, SharedMemoryEndpoint};

use super::load_config;

pub async fn execute(
    config_path: Option<&str>,
    endpoint_id: &str,
    direct: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let endpoint_config = config.endpoint(endpoint_id)?;
    let binding = EndpointDirectory::new().bind(endpoint_id, &config)?;

    let data = if direct {
        let Some(handle) = binding.service().get_shared_memory()? else {
            eprintln!("✗ {} did not export a segment handle", endpoint_id);
            std::process::exit(1);
        };

        let reader = SharedMemoryEndpoint::from_config(endpoint_config, &config.transport);
        let info = reader.attach_remote(handle)?;
        tracing::debug!(segment = %info.name, capacity = info.capacity, "Mapped segment");

        let data = reader
            .read_remote()?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
        reader.close();
        data
    } else {
        binding.service().read_data()?
    };

    match data {
        Some(text) => println!("{}", text),
        None => println!("(no data)"),
    }
    Ok(())
}
