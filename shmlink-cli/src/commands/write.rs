// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `shmlink write` command - Write a message into a served endpoint.

use shmlink_core::EndpointDirectory;

use super::load_config;

pub async fn execute(
    config_path: Option<&str>,
    endpoint_id: &str,
    message: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let binding = EndpointDirectory::new().bind(endpoint_id, &config)?;

    binding.service().write_data(Some(message))?;

    tracing::info!(endpoint = %endpoint_id, bytes = message.len(), "Message written");
    println!("✓ Wrote {} bytes to {}", message.len(), endpoint_id);
    Ok(())
}
