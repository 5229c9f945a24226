// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Control channel message types.

use serde::{Deserialize, Serialize};

use crate::registry::ChangeEvent;
use crate::types::SubscriberId;

/// Operation requested by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Export the segment handle. The reply carries the descriptor.
    GetSharedMemory,
    WriteData { data: Option<String> },
    ReadData,
    RegisterCallback { subscriber: SubscriberId },
    UnregisterCallback { subscriber: SubscriberId },
    NotifyDataChanged,
    Ping,
}

impl Request {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::GetSharedMemory => "get_shared_memory",
            Self::WriteData { .. } => "write_data",
            Self::ReadData => "read_data",
            Self::RegisterCallback { .. } => "register_callback",
            Self::UnregisterCallback { .. } => "unregister_callback",
            Self::NotifyDataChanged => "notify_data_changed",
            Self::Ping => "ping",
        }
    }
}

/// Request as sent on the wire, tagged with a correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    pub request: Request,
}

/// Server reply to a single request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Segment handle attached as `SCM_RIGHTS`.
    Handle { name: String, capacity: usize },
    /// The handle could not be exported.
    NoHandle,
    Data { data: Option<String> },
    Registered { added: bool },
    Unregistered { removed: bool },
    Ack,
    Pong,
    Error { message: String },
}

/// Anything the server sends: replies and callback pushes share the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerMessage {
    Reply { id: u64, response: Response },
    DataChanged { subscriber: SubscriberId, resync: bool },
}

impl ServerMessage {
    pub fn data_changed(subscriber: SubscriberId, event: ChangeEvent) -> Self {
        Self::DataChanged {
            subscriber,
            resync: event == ChangeEvent::Resync,
        }
    }
}
