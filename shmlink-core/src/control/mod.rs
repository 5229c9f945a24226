// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Cross-process control channel.
//!
//! Carries the service operations between processes over a Unix socket and
//! transfers segment handles as `SCM_RIGHTS` descriptors.

mod client;
mod message;
mod server;
mod wire;

pub use client::RemoteEndpoint;
pub use message::{Request, RequestFrame, Response, ServerMessage};
pub use server::{ControlServer, ShutdownHandle};
pub use wire::{recv_message, send_message, MAX_MESSAGE_SIZE};
