// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `shmlink serve` command - Host an endpoint on its control socket.

use std::sync::{Arc, Weak};

use shmlink_core::{
    ChangeEvent, ControlServer, DeliveryError, EndpointDirectory, SharedMemoryEndpoint,
    SubscriberId,
};

use super::load_config;

pub async fn execute(
    config_path: Option<&str>,
    endpoint_id: &str,
    greeting: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let endpoint_config = config.endpoint(endpoint_id)?;

    tracing::info!(
        endpoint = %endpoint_config.id,
        segment = %endpoint_config.segment_name,
        byte_order = %config.transport.byte_order,
        "Starting endpoint"
    );

    let endpoint = Arc::new(SharedMemoryEndpoint::from_config(
        endpoint_config,
        &config.transport,
    ));
    let info = endpoint.acquire_segment()?;

    let directory = EndpointDirectory::new();
    directory.host(endpoint_config.id.clone(), Arc::clone(&endpoint));

    // Log every change seen by this endpoint.
    let weak: Weak<SharedMemoryEndpoint> = Arc::downgrade(&endpoint);
    endpoint.subscribe(
        SubscriberId::new("serve-log")?,
        Arc::new(move |event: ChangeEvent| -> Result<(), DeliveryError> {
            if let Some(endpoint) = weak.upgrade() {
                let data = endpoint.read_text().ok().flatten();
                tracing::info!(event = event.name(), data = ?data, "Data changed");
            }
            Ok(())
        }),
    )?;

    let server = ControlServer::bind(&endpoint_config.socket_path, Arc::clone(&endpoint))?;
    let shutdown = server.shutdown_handle();

    println!("▶ Serving {}", endpoint_config.id);
    let backend = info.backend.map_or("received", |backend| backend.name());
    println!("  Segment:  {} ({} bytes, {})", info.name, info.capacity, backend);
    println!("  Socket:   {}", endpoint_config.socket_path.display());
    println!();
    println!("Press Ctrl+C to stop");

    if let Some(greeting) = greeting {
        let binding = directory.bind(endpoint_id, &config)?;
        binding.service().write_data(Some(greeting))?;
        tracing::info!(message = %greeting, "Wrote greeting");
    }

    let serving = tokio::task::spawn_blocking(move || server.serve());

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    shutdown.shutdown();
    serving.await??;

    let stats = endpoint.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    directory.remove(&endpoint_config.id);
    endpoint.close();
    Ok(())
}
