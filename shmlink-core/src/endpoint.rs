// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Per-process shared memory endpoint.
//!
//! Combines one [`SharedMemorySegment`], one [`FramedChannel`] and one
//! [`SubscriberRegistry`]. Every write that lands triggers a change broadcast.
//! An endpoint may additionally attach another endpoint's segment from a
//! transferred handle and access it directly.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::Arc;

use crate::config::{EndpointConfig, TransportConfig};
use crate::error::{EndpointError, EndpointResult, FrameError};
use crate::registry::{BroadcastReport, ChangeEvent, DataChangedCallback, SubscriberRegistry};
use crate::shm::{
    FramedChannel, SegmentBackend, SegmentHandle, SegmentOrigin, SharedMemorySegment,
};
use crate::state::{EndpointState, EndpointStateMachine, EndpointStats};
use crate::types::{ByteOrder, Capacity, SubscriberId};

/// Description of a mapped segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub name: String,
    pub capacity: usize,
    /// `None` for a region received from another process.
    pub backend: Option<SegmentBackend>,
    pub origin: SegmentOrigin,
}

impl From<&SharedMemorySegment> for SegmentInfo {
    fn from(segment: &SharedMemorySegment) -> Self {
        Self {
            name: segment.name().to_string(),
            capacity: segment.capacity(),
            backend: segment.backend(),
            origin: segment.origin(),
        }
    }
}

/// Lock-protected mutable part of the endpoint.
struct Slots {
    state: EndpointStateMachine,
    local: Option<SharedMemorySegment>,
    remote: Option<SharedMemorySegment>,
}

impl Slots {
    fn ensure_open(&self) -> EndpointResult<()> {
        if self.state.is_closed() {
            return Err(EndpointError::Closed);
        }
        Ok(())
    }

    fn local(&self) -> EndpointResult<&SharedMemorySegment> {
        self.ensure_open()?;
        self.local.as_ref().ok_or(EndpointError::NotReady)
    }

    fn remote(&self) -> EndpointResult<&SharedMemorySegment> {
        self.ensure_open()?;
        self.remote.as_ref().ok_or(EndpointError::NotAttached)
    }
}

/// Shared memory endpoint for one process.
///
/// Share it behind an `Arc`; every operation takes `&self`.
pub struct SharedMemoryEndpoint {
    segment_name: String,
    capacity: Capacity,
    backend: Option<SegmentBackend>,
    channel: FramedChannel,
    registry: SubscriberRegistry,
    slots: RwLock<Slots>,
}

impl SharedMemoryEndpoint {
    /// Create an endpoint in the `Uninitialized` state.
    pub fn new(segment_name: impl Into<String>, capacity: Capacity, byte_order: ByteOrder) -> Self {
        let segment_name = segment_name.into();
        Self {
            slots: RwLock::new(Slots {
                state: EndpointStateMachine::new(segment_name.clone()),
                local: None,
                remote: None,
            }),
            segment_name,
            capacity,
            backend: None,
            channel: FramedChannel::new(byte_order),
            registry: SubscriberRegistry::new(),
        }
    }

    /// Create an endpoint from validated configuration.
    pub fn from_config(endpoint: &EndpointConfig, transport: &TransportConfig) -> Self {
        Self::new(
            endpoint.segment_name.clone(),
            endpoint.capacity,
            transport.byte_order,
        )
    }

    /// Create an endpoint wrapped in an Arc for sharing across threads.
    pub fn new_shared(
        segment_name: impl Into<String>,
        capacity: Capacity,
        byte_order: ByteOrder,
    ) -> Arc<Self> {
        Arc::new(Self::new(segment_name, capacity, byte_order))
    }

    /// Force a segment backend instead of the probed one.
    pub fn with_backend(mut self, backend: SegmentBackend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.channel.byte_order()
    }

    /// Create the segment on first call; return the live one afterwards.
    ///
    /// A failed allocation leaves the endpoint `Uninitialized` so the call
    /// can be retried.
    pub fn acquire_segment(&self) -> EndpointResult<SegmentInfo> {
        {
            let slots = self.read_slots();
            slots.ensure_open()?;
            if let Some(segment) = slots.local.as_ref() {
                return Ok(SegmentInfo::from(segment));
            }
        }

        let mut slots = self.write_slots();
        slots.ensure_open()?;
        if let Some(segment) = slots.local.as_ref() {
            return Ok(SegmentInfo::from(segment));
        }

        let backend = self.backend.unwrap_or_else(SegmentBackend::detect);
        let segment = SharedMemorySegment::create_with_backend(
            &self.segment_name,
            self.capacity.bytes(),
            backend,
        )?;
        let info = SegmentInfo::from(&segment);

        slots.state.transition_to(EndpointState::Ready)?;
        slots.local = Some(segment);

        tracing::info!(
            segment = %self.segment_name,
            capacity = info.capacity,
            backend = backend.name(),
            "Endpoint ready"
        );
        Ok(info)
    }

    /// Write `payload` as the current frame and notify subscribers.
    ///
    /// Encode errors are returned unchanged and nobody is notified.
    pub fn write(&self, payload: &[u8]) -> EndpointResult<BroadcastReport> {
        {
            let slots = self.read_slots();
            let segment = slots.local()?;
            self.channel.encode(segment, payload)?;
        }

        tracing::debug!(segment = %self.segment_name, bytes = payload.len(), "Frame written");
        Ok(self.registry.broadcast(ChangeEvent::DataChanged))
    }

    /// Read the current frame.
    ///
    /// `Ok(None)` means no valid frame yet: a fresh segment, or a prefix
    /// that failed the range check.
    pub fn read(&self) -> EndpointResult<Option<Vec<u8>>> {
        let slots = self.read_slots();
        let segment = slots.local()?;
        Ok(self.decode_lenient(segment))
    }

    /// [`read`](Self::read) decoded as UTF-8 text, replacing invalid sequences.
    pub fn read_text(&self) -> EndpointResult<Option<String>> {
        Ok(self
            .read()?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Register a change callback under `id`.
    ///
    /// Returns false if `id` is already registered.
    pub fn subscribe(
        &self,
        id: SubscriberId,
        callback: Arc<dyn DataChangedCallback>,
    ) -> EndpointResult<bool> {
        // Hold the read lock so close() cannot clear the registry in between.
        let slots = self.read_slots();
        slots.ensure_open()?;
        Ok(self.registry.subscribe(id, callback))
    }

    /// Remove the callback registered under `id`. Returns false if absent.
    pub fn unsubscribe(&self, id: &SubscriberId) -> EndpointResult<bool> {
        let slots = self.read_slots();
        slots.ensure_open()?;
        Ok(self.registry.unsubscribe(id))
    }

    /// Notify subscribers without writing a new frame.
    pub fn notify_data_changed(&self) -> EndpointResult<BroadcastReport> {
        self.read_slots().ensure_open()?;
        Ok(self.registry.broadcast(ChangeEvent::Resync))
    }

    /// Duplicate the segment handle for transfer to another process.
    pub fn export_handle_for_transfer(&self) -> EndpointResult<SegmentHandle> {
        let slots = self.read_slots();
        let handle = slots.local()?.export_handle()?;
        tracing::debug!(segment = %self.segment_name, "Exported segment handle");
        Ok(handle)
    }

    /// Map another endpoint's segment for direct access.
    ///
    /// Replaces any previously attached segment. On failure the endpoint is
    /// left untouched and the attach may be retried with a fresh handle.
    pub fn attach_remote(&self, handle: SegmentHandle) -> EndpointResult<SegmentInfo> {
        self.read_slots().ensure_open()?;

        let segment = SharedMemorySegment::open(handle, self.capacity.bytes())?;
        let info = SegmentInfo::from(&segment);

        let mut slots = self.write_slots();
        slots.ensure_open()?;
        if let Some(mut previous) = slots.remote.replace(segment) {
            previous.close();
        }

        tracing::info!(remote = %info.name, capacity = info.capacity, "Attached remote segment");
        Ok(info)
    }

    /// Unmap the attached remote segment. Returns false if none was attached.
    pub fn detach_remote(&self) -> bool {
        let mut slots = self.write_slots();
        match slots.remote.take() {
            Some(mut segment) => {
                segment.close();
                true
            }
            None => false,
        }
    }

    pub fn has_remote(&self) -> bool {
        self.read_slots().remote.is_some()
    }

    /// Read the current frame of the attached remote segment.
    pub fn read_remote(&self) -> EndpointResult<Option<Vec<u8>>> {
        let slots = self.read_slots();
        let segment = slots.remote()?;
        Ok(self.decode_lenient(segment))
    }

    /// Write a frame into the attached remote segment.
    ///
    /// Nobody is notified here; the owning endpoint broadcasts when asked
    /// through its `notify_data_changed`.
    pub fn write_remote(&self, payload: &[u8]) -> EndpointResult<()> {
        let slots = self.read_slots();
        let segment = slots.remote()?;
        self.channel.encode(segment, payload)?;
        Ok(())
    }

    /// Tear the endpoint down. Idempotent.
    ///
    /// Subscribers are dropped without a final notification; the local
    /// segment and any attached remote segment are unmapped.
    pub fn close(&self) {
        let mut slots = self.write_slots();
        if slots.state.is_closed() {
            return;
        }

        let dropped = self.registry.len();
        self.registry.clear();
        if let Some(mut segment) = slots.local.take() {
            segment.close();
        }
        if let Some(mut segment) = slots.remote.take() {
            segment.close();
        }

        if let Err(e) = slots.state.transition_to(EndpointState::Closed) {
            tracing::error!(segment = %self.segment_name, error = %e, "Close transition rejected");
        }
        tracing::info!(
            segment = %self.segment_name,
            dropped_subscribers = dropped,
            "Endpoint closed"
        );
    }

    pub fn state(&self) -> EndpointState {
        self.read_slots().state.state()
    }

    /// Number of registered subscribers. Diagnostics only.
    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    pub fn stats(&self) -> EndpointStats {
        let slots = self.read_slots();
        EndpointStats::new(&slots.state, self.registry.len(), slots.remote.is_some())
    }

    fn decode_lenient(&self, segment: &SharedMemorySegment) -> Option<Vec<u8>> {
        match self.channel.decode(segment) {
            Ok(payload) => Some(payload),
            Err(FrameError::CorruptFrame { length: 0, .. }) => None,
            Err(e) => {
                tracing::warn!(segment = %segment.name(), error = %e, "No valid frame");
                None
            }
        }
    }

    fn read_slots(&self) -> RwLockReadGuard<'_, Slots> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slots(&self) -> RwLockWriteGuard<'_, Slots> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for SharedMemoryEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryEndpoint")
            .field("segment_name", &self.segment_name)
            .field("capacity", &self.capacity)
            .field("byte_order", &self.channel.byte_order())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for SharedMemoryEndpoint {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeliveryError, SegmentError};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn endpoint(name: &str) -> SharedMemoryEndpoint {
        SharedMemoryEndpoint::new(name, Capacity::default(), ByteOrder::Big)
    }

    fn ready(name: &str) -> SharedMemoryEndpoint {
        let ep = endpoint(name);
        ep.acquire_segment().unwrap();
        ep
    }

    fn sub(name: &str) -> SubscriberId {
        SubscriberId::new(name).unwrap()
    }

    #[derive(Default)]
    struct Probe {
        hits: AtomicUsize,
        fail: AtomicBool,
    }

    impl DataChangedCallback for Probe {
        fn on_data_changed(&self, _event: ChangeEvent) -> Result<(), DeliveryError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DeliveryError::Disconnected {
                    subscriber: SubscriberId::new("probe").unwrap(),
                });
            }
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_acquire_is_idempotent() {
        let ep = endpoint("ep-acquire");
        assert_eq!(ep.state(), EndpointState::Uninitialized);

        let first = ep.acquire_segment().unwrap();
        assert_eq!(first.capacity, 4096);
        assert_eq!(ep.state(), EndpointState::Ready);

        ep.write(b"kept").unwrap();
        let second = ep.acquire_segment().unwrap();
        assert_eq!(first, second);
        assert_eq!(ep.read().unwrap().unwrap(), b"kept");
    }

    #[test]
    fn test_not_ready_before_acquire() {
        let ep = endpoint("ep-not-ready");
        assert!(matches!(ep.write(b"x"), Err(EndpointError::NotReady)));
        assert!(matches!(ep.read(), Err(EndpointError::NotReady)));
        assert!(matches!(
            ep.export_handle_for_transfer(),
            Err(EndpointError::NotReady)
        ));
        // Subscriptions do not need a segment.
        assert!(ep.subscribe(sub("early"), Arc::new(Probe::default())).unwrap());
    }

    #[test]
    fn test_read_fresh_segment_is_none() {
        let ep = ready("ep-fresh");
        assert_eq!(ep.read().unwrap(), None);
    }

    #[test]
    fn test_roundtrip_and_last_value_wins() {
        let ep = ready("ep-roundtrip");
        ep.write("x".as_bytes()).unwrap();
        ep.write("yy".as_bytes()).unwrap();
        assert_eq!(ep.read_text().unwrap().as_deref(), Some("yy"));
    }

    #[test]
    fn test_write_errors_surface_unchanged() {
        let ep = ready("ep-too-large");
        let probe = Arc::new(Probe::default());
        ep.subscribe(sub("p"), probe.clone()).unwrap();

        let err = ep.write(&vec![0u8; 4093]).unwrap_err();
        assert!(matches!(
            err,
            EndpointError::Frame(FrameError::PayloadTooLarge { size: 4093, max: 4092 })
        ));
        assert_eq!(probe.hits.load(Ordering::SeqCst), 0);
        assert!(ep.write(&vec![0u8; 4092]).is_ok());
        assert_eq!(probe.hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fan_out_and_pruning() {
        let ep = ready("ep-fanout");
        let probes: Vec<Arc<Probe>> = (0..3).map(|_| Arc::new(Probe::default())).collect();
        for (i, probe) in probes.iter().enumerate() {
            assert!(ep.subscribe(sub(&format!("p{}", i)), probe.clone()).unwrap());
        }

        let report = ep.write(b"one").unwrap();
        assert_eq!(report.delivered, 3);

        probes[0].fail.store(true, Ordering::SeqCst);
        let report = ep.write(b"two").unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(report.pruned, vec![sub("p0")]);

        let report = ep.write(b"three").unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(ep.subscriber_count(), 2);
    }

    #[test]
    fn test_notify_without_write() {
        let ep = ready("ep-notify");
        let probe = Arc::new(Probe::default());
        ep.subscribe(sub("p"), probe.clone()).unwrap();
        ep.notify_data_changed().unwrap();
        assert_eq!(probe.hits.load(Ordering::SeqCst), 1);
        assert_eq!(ep.read().unwrap(), None);
    }

    #[test]
    fn test_closed_guard() {
        let ep = ready("ep-closed");
        ep.subscribe(sub("p"), Arc::new(Probe::default())).unwrap();

        ep.close();
        ep.close();
        assert_eq!(ep.state(), EndpointState::Closed);
        assert_eq!(ep.subscriber_count(), 0);

        assert!(matches!(ep.write(b"late"), Err(EndpointError::Closed)));
        assert!(matches!(ep.read(), Err(EndpointError::Closed)));
        assert!(matches!(
            ep.subscribe(sub("q"), Arc::new(Probe::default())),
            Err(EndpointError::Closed)
        ));
        assert!(matches!(ep.unsubscribe(&sub("p")), Err(EndpointError::Closed)));
        assert!(matches!(ep.acquire_segment(), Err(EndpointError::Closed)));
        assert!(matches!(
            ep.notify_data_changed(),
            Err(EndpointError::Closed)
        ));
    }

    #[test]
    fn test_attach_remote_direct_access() {
        let owner = ready("ep-owner");
        let peer = endpoint("ep-peer");

        let info = peer
            .attach_remote(owner.export_handle_for_transfer().unwrap())
            .unwrap();
        assert!(peer.has_remote());
        assert_eq!(info.origin, SegmentOrigin::Opened);
        assert_eq!(info.backend, None);

        owner.write(b"hello").unwrap();
        assert_eq!(peer.read_remote().unwrap().unwrap(), b"hello");

        peer.write_remote(b"reply").unwrap();
        assert_eq!(owner.read().unwrap().unwrap(), b"reply");

        assert!(peer.detach_remote());
        assert!(matches!(peer.read_remote(), Err(EndpointError::NotAttached)));
    }

    #[test]
    fn test_failed_attach_leaves_endpoint_usable() {
        let big = SharedMemoryEndpoint::new("ep-big", Capacity::new(8192).unwrap(), ByteOrder::Big);
        let small = ready("ep-small");

        let err = big
            .attach_remote(small.export_handle_for_transfer().unwrap())
            .unwrap_err();
        assert!(matches!(
            err,
            EndpointError::Segment(SegmentError::InvalidHandle { .. })
        ));
        assert!(!big.has_remote());

        big.acquire_segment().unwrap();
        big.write(b"local still works").unwrap();
        assert_eq!(big.read().unwrap().unwrap(), b"local still works");
    }

    #[test]
    fn test_stats() {
        let ep = ready("ep-stats");
        ep.subscribe(sub("p"), Arc::new(Probe::default())).unwrap();
        let stats = ep.stats();
        assert_eq!(stats.current_state, "Ready");
        assert_eq!(stats.subscriber_count, 1);
        assert!(!stats.remote_attached);
    }

    #[test]
    fn test_legacy_backend_endpoint() {
        let ep = endpoint("ep-legacy").with_backend(SegmentBackend::Legacy);
        let info = ep.acquire_segment().unwrap();
        assert_eq!(info.backend, Some(SegmentBackend::Legacy));
        ep.write(b"legacy").unwrap();
        assert_eq!(ep.read().unwrap().unwrap(), b"legacy");
    }
}
