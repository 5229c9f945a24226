// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! shmlink CLI
//!
//! Command-line interface for serving and exercising shmlink endpoints.

use clap::{Parser, Subcommand};

mod commands;

/// shmlink - shared-memory payload exchange between processes
#[derive(Parser)]
#[command(name = "shmlink")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (defaults to the app-a/app-b pair under /tmp/shmlink)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Host an endpoint and serve it on its control socket
    Serve {
        /// Endpoint id to host
        #[arg(short, long)]
        endpoint: String,

        /// Write this message once the endpoint is ready
        #[arg(short, long)]
        greeting: Option<String>,
    },

    /// Write a message into a served endpoint
    Write {
        /// Endpoint id to write to
        #[arg(short, long)]
        endpoint: String,

        /// Message to write
        message: String,
    },

    /// Read the current message of a served endpoint
    Read {
        /// Endpoint id to read from
        #[arg(short, long)]
        endpoint: String,

        /// Map the segment from a transferred handle instead of asking the server
        #[arg(short, long)]
        direct: bool,
    },

    /// Print every change notification from a served endpoint
    Watch {
        /// Endpoint id to watch
        #[arg(short, long)]
        endpoint: String,

        /// Subscriber identity to register under
        #[arg(short, long, default_value = "shmlink-watch")]
        subscriber: String,
    },

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        file: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Serve { endpoint, greeting } => {
            commands::serve::execute(config, &endpoint, greeting.as_deref()).await
        }
        Commands::Write { endpoint, message } => {
            commands::write::execute(config, &endpoint, &message).await
        }
        Commands::Read { endpoint, direct } => {
            commands::read::execute(config, &endpoint, direct).await
        }
        Commands::Watch {
            endpoint,
            subscriber,
        } => commands::watch::execute(config, &endpoint, &subscriber).await,
        Commands::Validate { file } => commands::validate::execute(&file).await,
    }
}
