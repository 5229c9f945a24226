// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `shmlink validate` command - Validate configuration file.

use shmlink_core::ConfigLoader;

pub async fn execute(file: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(file = %file, "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Transport Settings:");
            println!("  Byte Order:    {}", config.transport.byte_order);
            println!(
                "  Reply Timeout: {}ms",
                config.transport.reply_timeout.as_millis()
            );
            println!();
            println!("Endpoints ({}):", config.endpoints.len());
            for endpoint in &config.endpoints {
                println!(
                    "  - {} (segment: {}, capacity: {}, socket: {})",
                    endpoint.id,
                    endpoint.segment_name,
                    endpoint.capacity,
                    endpoint.socket_path.display()
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
