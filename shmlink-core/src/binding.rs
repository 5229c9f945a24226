// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Service surface shared by in-process and cross-process callers.
//!
//! A caller hosted in the same process as the endpoint gets the endpoint
//! itself; anyone else gets a [`RemoteEndpoint`] proxy. Both answer to
//! [`SharedMemoryService`].

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config::Config;
use crate::control::RemoteEndpoint;
use crate::endpoint::SharedMemoryEndpoint;
use crate::error::ShmLinkResult;
use crate::registry::DataChangedCallback;
use crate::shm::SegmentHandle;
use crate::types::{EndpointId, SubscriberId};

/// Operations offered by an endpoint to its peers.
pub trait SharedMemoryService: Send + Sync {
    /// Handle to the endpoint's segment, created on first use.
    /// `None` if no handle could be exported.
    fn get_shared_memory(&self) -> ShmLinkResult<Option<SegmentHandle>>;

    /// Write `data` as the current frame. `None` is ignored.
    fn write_data(&self, data: Option<&str>) -> ShmLinkResult<()>;

    /// Current frame as text. `None` if there is none or it cannot be read.
    fn read_data(&self) -> ShmLinkResult<Option<String>>;

    fn register_callback(
        &self,
        id: SubscriberId,
        callback: Arc<dyn DataChangedCallback>,
    ) -> ShmLinkResult<bool>;

    fn unregister_callback(&self, id: &SubscriberId) -> ShmLinkResult<bool>;

    fn notify_data_changed(&self) -> ShmLinkResult<()>;
}

impl SharedMemoryService for SharedMemoryEndpoint {
    fn get_shared_memory(&self) -> ShmLinkResult<Option<SegmentHandle>> {
        match self
            .acquire_segment()
            .and_then(|_| self.export_handle_for_transfer())
        {
            Ok(handle) => Ok(Some(handle)),
            Err(e) => {
                tracing::warn!(segment = self.segment_name(), error = %e, "Handle export failed");
                Ok(None)
            }
        }
    }

    fn write_data(&self, data: Option<&str>) -> ShmLinkResult<()> {
        if let Some(data) = data {
            self.write(data.as_bytes())?;
        }
        Ok(())
    }

    fn read_data(&self) -> ShmLinkResult<Option<String>> {
        Ok(self.read_text().unwrap_or_else(|e| {
            tracing::debug!(segment = self.segment_name(), error = %e, "Read failed");
            None
        }))
    }

    fn register_callback(
        &self,
        id: SubscriberId,
        callback: Arc<dyn DataChangedCallback>,
    ) -> ShmLinkResult<bool> {
        Ok(self.subscribe(id, callback)?)
    }

    fn unregister_callback(&self, id: &SubscriberId) -> ShmLinkResult<bool> {
        Ok(self.unsubscribe(id)?)
    }

    fn notify_data_changed(&self) -> ShmLinkResult<()> {
        SharedMemoryEndpoint::notify_data_changed(self)?;
        Ok(())
    }
}

impl SharedMemoryService for RemoteEndpoint {
    fn get_shared_memory(&self) -> ShmLinkResult<Option<SegmentHandle>> {
        Ok(RemoteEndpoint::get_shared_memory(self)?)
    }

    fn write_data(&self, data: Option<&str>) -> ShmLinkResult<()> {
        Ok(RemoteEndpoint::write_data(self, data)?)
    }

    fn read_data(&self) -> ShmLinkResult<Option<String>> {
        Ok(RemoteEndpoint::read_data(self)?)
    }

    fn register_callback(
        &self,
        id: SubscriberId,
        callback: Arc<dyn DataChangedCallback>,
    ) -> ShmLinkResult<bool> {
        Ok(RemoteEndpoint::register_callback(self, id, callback)?)
    }

    fn unregister_callback(&self, id: &SubscriberId) -> ShmLinkResult<bool> {
        Ok(RemoteEndpoint::unregister_callback(self, id)?)
    }

    fn notify_data_changed(&self) -> ShmLinkResult<()> {
        Ok(RemoteEndpoint::notify_data_changed(self)?)
    }
}

/// How a caller reaches an endpoint.
#[derive(Debug)]
pub enum ServiceBinding {
    /// Hosted in this process; calls go straight to the endpoint.
    Local(Arc<SharedMemoryEndpoint>),
    /// Hosted elsewhere; calls go over the control socket.
    Remote(RemoteEndpoint),
}

impl ServiceBinding {
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    pub fn service(&self) -> &dyn SharedMemoryService {
        match self {
            Self::Local(endpoint) => endpoint.as_ref(),
            Self::Remote(remote) => remote,
        }
    }
}

/// Endpoints hosted by the current process.
#[derive(Debug, Default)]
pub struct EndpointDirectory {
    hosted: DashMap<EndpointId, Arc<SharedMemoryEndpoint>>,
}

impl EndpointDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host `endpoint` under `id`. Returns false if `id` is taken.
    pub fn host(&self, id: EndpointId, endpoint: Arc<SharedMemoryEndpoint>) -> bool {
        match self.hosted.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                tracing::debug!(endpoint = %entry.key(), "Hosting endpoint");
                entry.insert(endpoint);
                true
            }
        }
    }

    pub fn get(&self, id: &EndpointId) -> Option<Arc<SharedMemoryEndpoint>> {
        self.hosted.get(id).map(|r| Arc::clone(r.value()))
    }

    pub fn remove(&self, id: &EndpointId) -> Option<Arc<SharedMemoryEndpoint>> {
        self.hosted.remove(id).map(|(_, endpoint)| endpoint)
    }

    pub fn len(&self) -> usize {
        self.hosted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosted.is_empty()
    }

    /// Reach endpoint `id`: directly if hosted here, otherwise through the
    /// control socket named in `config`.
    pub fn bind(&self, id: &str, config: &Config) -> ShmLinkResult<ServiceBinding> {
        let endpoint_config = config.endpoint(id)?;
        if let Some(endpoint) = self.get(&endpoint_config.id) {
            tracing::debug!(endpoint = id, "Bound locally");
            return Ok(ServiceBinding::Local(endpoint));
        }

        let remote = RemoteEndpoint::connect(
            &endpoint_config.socket_path,
            config.transport.reply_timeout,
        )?;
        tracing::debug!(
            endpoint = id,
            socket = %endpoint_config.socket_path.display(),
            "Bound remotely"
        );
        Ok(ServiceBinding::Remote(remote))
    }
}
