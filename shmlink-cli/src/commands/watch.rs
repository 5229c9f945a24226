// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `shmlink watch` command - Print change notifications as they arrive.

use std::sync::Arc;

use shmlink_core::{ChangeEvent, DeliveryError, EndpointDirectory, SubscriberId};
use tokio::sync::mpsc;

use super::load_config;

pub async fn execute(
    config_path: Option<&str>,
    endpoint_id: &str,
    subscriber: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    let binding = Arc::new(EndpointDirectory::new().bind(endpoint_id, &config)?);
    let subscriber = SubscriberId::new(subscriber)?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let added = binding.service().register_callback(
        subscriber.clone(),
        Arc::new(move |event: ChangeEvent| -> Result<(), DeliveryError> {
            tx.send(event).map_err(|_| DeliveryError::Failed {
                reason: "watcher stopped".to_string(),
            })
        }),
    )?;
    if !added {
        eprintln!("✗ Subscriber {} is already registered", subscriber);
        std::process::exit(1);
    }

    println!("Watching {} as {} (Ctrl+C to stop)", endpoint_id, subscriber);
    if let Some(current) = binding.service().read_data()? {
        println!("  current: {}", current);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => {
                let Some(event) = event else {
                    eprintln!("✗ Connection to {} closed", endpoint_id);
                    break;
                };
                // A remote read is a blocking socket round trip.
                let reader = Arc::clone(&binding);
                let data =
                    tokio::task::spawn_blocking(move || reader.service().read_data()).await??;
                println!("[{}] {}", event.name(), data.as_deref().unwrap_or("(no data)"));
            }
        }
    }

    if let Err(e) = binding.service().unregister_callback(&subscriber) {
        tracing::debug!(error = %e, "Unregister on exit failed");
    }
    Ok(())
}
