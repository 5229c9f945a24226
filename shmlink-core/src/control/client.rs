// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Client side of the control channel.
//!
//! A reader thread splits incoming traffic: replies go to the caller blocked
//! in a request, callback pushes go to a dispatcher thread that runs the
//! locally registered callbacks. Callbacks may therefore issue requests of
//! their own (typically `read_data`) without deadlocking the reader.

use std::net::Shutdown;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::ControlError;
use crate::registry::{ChangeEvent, DataChangedCallback};
use crate::shm::SegmentHandle;
use crate::types::SubscriberId;

use super::message::{Request, RequestFrame, Response, ServerMessage};
use super::wire::{recv_message, send_message};

type CallbackMap = DashMap<SubscriberId, Arc<dyn DataChangedCallback>>;

struct Reply {
    id: u64,
    response: Response,
    fds: Vec<OwnedFd>,
}

/// Request side of the connection. Locked for the whole round trip.
struct Channel {
    stream: UnixStream,
    replies: Receiver<Reply>,
}

/// Connection state used by both the caller and the dispatcher thread.
struct Shared {
    channel: Mutex<Channel>,
    callbacks: CallbackMap,
    connected: Arc<AtomicBool>,
    next_request: AtomicU64,
    reply_timeout: Duration,
}

/// Proxy for an endpoint served by another process.
pub struct RemoteEndpoint {
    path: PathBuf,
    shared: Arc<Shared>,
}

impl RemoteEndpoint {
    /// Connect to the control socket at `path`.
    pub fn connect(path: impl AsRef<Path>, reply_timeout: Duration) -> Result<Self, ControlError> {
        let path = path.as_ref().to_path_buf();
        let stream = UnixStream::connect(&path).map_err(|source| ControlError::Socket {
            context: "connect",
            source,
        })?;
        let reader = stream.try_clone().map_err(|source| ControlError::Socket {
            context: "clone stream",
            source,
        })?;

        let connected = Arc::new(AtomicBool::new(true));
        let (reply_tx, reply_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            channel: Mutex::new(Channel {
                stream,
                replies: reply_rx,
            }),
            callbacks: DashMap::new(),
            connected: Arc::clone(&connected),
            next_request: AtomicU64::new(1),
            reply_timeout,
        });

        let spawn_err = |source| ControlError::Socket {
            context: "spawn client thread",
            source,
        };

        thread::Builder::new()
            .name("shmlink-reader".to_string())
            .spawn(move || read_loop(reader, reply_tx, event_tx, connected))
            .map_err(spawn_err)?;

        let dispatch_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name("shmlink-dispatch".to_string())
            .spawn(move || dispatch_loop(event_rx, dispatch_shared))
            .map_err(spawn_err)?;

        tracing::debug!(socket = %path.display(), "Connected to remote endpoint");

        Ok(Self { path, shared })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Fetch a handle to the remote segment, creating it remotely if needed.
    ///
    /// `Ok(None)` means the server could not export one.
    pub fn get_shared_memory(&self) -> Result<Option<SegmentHandle>, ControlError> {
        let (response, mut fds) = self.call(Request::GetSharedMemory)?;
        match response {
            Response::Handle { name, .. } => {
                if fds.is_empty() {
                    return Err(ControlError::Protocol {
                        reason: "handle reply without descriptor".to_string(),
                    });
                }
                Ok(Some(SegmentHandle::new(fds.swap_remove(0), name)))
            }
            Response::NoHandle => Ok(None),
            other => Err(unexpected("get_shared_memory", other)),
        }
    }

    /// Write `data` as the remote segment's current frame.
    ///
    /// `None` is a no-op and nothing is sent.
    pub fn write_data(&self, data: Option<&str>) -> Result<(), ControlError> {
        let Some(data) = data else {
            return Ok(());
        };
        match self.call(Request::WriteData {
            data: Some(data.to_string()),
        })? {
            (Response::Ack, _) => Ok(()),
            (other, _) => Err(unexpected("write_data", other)),
        }
    }

    pub fn read_data(&self) -> Result<Option<String>, ControlError> {
        match self.call(Request::ReadData)? {
            (Response::Data { data }, _) => Ok(data),
            (other, _) => Err(unexpected("read_data", other)),
        }
    }

    /// Register `callback` with the remote endpoint under `id`.
    ///
    /// Returns false if `id` is already registered on this connection. When
    /// only the server still holds `id`, `callback` takes over its pushes.
    pub fn register_callback(
        &self,
        id: SubscriberId,
        callback: Arc<dyn DataChangedCallback>,
    ) -> Result<bool, ControlError> {
        // Install locally first; a push may overtake the reply.
        match self.shared.callbacks.entry(id.clone()) {
            Entry::Occupied(_) => return Ok(false),
            Entry::Vacant(entry) => {
                entry.insert(callback);
            }
        }

        let result = match self.call(Request::RegisterCallback {
            subscriber: id.clone(),
        }) {
            Ok((Response::Registered { added }, _)) => Ok(added),
            Ok((other, _)) => Err(unexpected("register_callback", other)),
            Err(e) => Err(e),
        };

        if result.is_err() {
            self.shared.callbacks.remove(&id);
        }
        result
    }

    /// Remove the callback registered under `id`. Returns false if absent.
    pub fn unregister_callback(&self, id: &SubscriberId) -> Result<bool, ControlError> {
        self.shared.callbacks.remove(id);
        self.shared.unregister(id)
    }

    /// Ask the remote endpoint to notify its subscribers.
    pub fn notify_data_changed(&self) -> Result<(), ControlError> {
        match self.call(Request::NotifyDataChanged)? {
            (Response::Ack, _) => Ok(()),
            (other, _) => Err(unexpected("notify_data_changed", other)),
        }
    }

    /// Round trip with no side effects.
    pub fn ping(&self) -> Result<Duration, ControlError> {
        let started = Instant::now();
        match self.call(Request::Ping)? {
            (Response::Pong, _) => Ok(started.elapsed()),
            (other, _) => Err(unexpected("ping", other)),
        }
    }

    fn call(&self, request: Request) -> Result<(Response, Vec<OwnedFd>), ControlError> {
        self.shared.call(request)
    }
}

impl Shared {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn unregister(&self, id: &SubscriberId) -> Result<bool, ControlError> {
        match self.call(Request::UnregisterCallback {
            subscriber: id.clone(),
        })? {
            (Response::Unregistered { removed }, _) => Ok(removed),
            (other, _) => Err(unexpected("unregister_callback", other)),
        }
    }

    fn call(&self, request: Request) -> Result<(Response, Vec<OwnedFd>), ControlError> {
        if !self.is_connected() {
            return Err(ControlError::Disconnected);
        }

        let channel = self.channel.lock().unwrap_or_else(PoisonError::into_inner);
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let op = request.name();
        send_message(&channel.stream, &RequestFrame { id, request }, &[])?;

        let deadline = Instant::now() + self.reply_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match channel.replies.recv_timeout(remaining) {
                Ok(reply) if reply.id == id => {
                    return match reply.response {
                        Response::Error { message } => Err(ControlError::Remote { message }),
                        response => Ok((response, reply.fds)),
                    };
                }
                Ok(stale) => {
                    tracing::debug!(reply = stale.id, expected = id, "Discarding stale reply");
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(op, timeout_ms = self.reply_timeout.as_millis() as u64, "Reply timed out");
                    return Err(ControlError::ReplyTimeout {
                        timeout_ms: self.reply_timeout.as_millis() as u64,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => return Err(ControlError::Disconnected),
            }
        }
    }
}

impl Drop for RemoteEndpoint {
    fn drop(&mut self) {
        let channel = self
            .shared
            .channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Unblocks the reader thread; the dispatcher follows once its
        // channel closes.
        let _ = channel.stream.shutdown(Shutdown::Both);
    }
}

impl std::fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("path", &self.path)
            .field("connected", &self.is_connected())
            .field("callbacks", &self.shared.callbacks.len())
            .finish()
    }
}

fn unexpected(op: &'static str, response: Response) -> ControlError {
    ControlError::Protocol {
        reason: format!("unexpected reply to {}: {:?}", op, response),
    }
}

fn read_loop(
    stream: UnixStream,
    replies: Sender<Reply>,
    events: Sender<(SubscriberId, ChangeEvent)>,
    connected: Arc<AtomicBool>,
) {
    loop {
        match recv_message::<ServerMessage>(&stream) {
            Ok(Some((ServerMessage::Reply { id, response }, fds))) => {
                if replies.send(Reply { id, response, fds }).is_err() {
                    break;
                }
            }
            Ok(Some((ServerMessage::DataChanged { subscriber, resync }, _))) => {
                let event = if resync {
                    ChangeEvent::Resync
                } else {
                    ChangeEvent::DataChanged
                };
                if events.send((subscriber, event)).is_err() {
                    break;
                }
            }
            Ok(None) | Err(ControlError::Disconnected) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Control connection failed");
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    tracing::debug!("Remote endpoint disconnected");
}

fn dispatch_loop(events: Receiver<(SubscriberId, ChangeEvent)>, shared: Arc<Shared>) {
    for (subscriber, event) in events {
        let Some(callback) = shared
            .callbacks
            .get(&subscriber)
            .map(|r| Arc::clone(r.value()))
        else {
            tracing::debug!(subscriber = %subscriber, "Push for unknown subscriber");
            continue;
        };

        if let Err(e) = callback.on_data_changed(event) {
            tracing::warn!(subscriber = %subscriber, error = %e, "Local callback failed, unregistering it");
            // Leave a callback re-registered under the same id alone.
            let removed = shared
                .callbacks
                .remove_if(&subscriber, |_, current| Arc::ptr_eq(current, &callback))
                .is_some();
            if removed {
                if let Err(e) = shared.unregister(&subscriber) {
                    tracing::warn!(subscriber = %subscriber, error = %e, "Remote unregister failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlServer;
    use crate::endpoint::SharedMemoryEndpoint;
    use crate::error::DeliveryError;
    use crate::types::{ByteOrder, Capacity};

    const TIMEOUT: Duration = Duration::from_secs(2);

    struct Fixture {
        _dir: tempfile::TempDir,
        endpoint: Arc<SharedMemoryEndpoint>,
        path: PathBuf,
        shutdown: crate::control::ShutdownHandle,
        join: Option<thread::JoinHandle<()>>,
    }

    impl Fixture {
        fn new(name: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("ep.sock");
            let endpoint =
                SharedMemoryEndpoint::new_shared(name, Capacity::default(), ByteOrder::Big);
            let server = ControlServer::bind(&path, Arc::clone(&endpoint)).unwrap();
            let shutdown = server.shutdown_handle();
            let join = thread::spawn(move || server.serve().unwrap());
            Self {
                _dir: dir,
                endpoint,
                path,
                shutdown,
                join: Some(join),
            }
        }

        fn client(&self) -> RemoteEndpoint {
            RemoteEndpoint::connect(&self.path, TIMEOUT).unwrap()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.shutdown.shutdown();
            if let Some(join) = self.join.take() {
                join.join().unwrap();
            }
        }
    }

    #[test]
    fn test_ping() {
        let fixture = Fixture::new("cl-ping");
        let client = fixture.client();
        assert!(client.ping().is_ok());
        assert!(client.is_connected());
    }

    #[test]
    fn test_remote_write_and_read() {
        let fixture = Fixture::new("cl-rw");
        let client = fixture.client();

        // Segment is created on demand by get_shared_memory.
        let handle = client.get_shared_memory().unwrap().unwrap();
        assert_eq!(handle.name(), "cl-rw");

        client.write_data(Some("hello")).unwrap();
        assert_eq!(client.read_data().unwrap().as_deref(), Some("hello"));
        assert_eq!(
            fixture.endpoint.read_text().unwrap().as_deref(),
            Some("hello")
        );

        client.write_data(None).unwrap();
        assert_eq!(client.read_data().unwrap().as_deref(), Some("hello"));
    }

    #[test]
    fn test_remote_error_surfaces() {
        let fixture = Fixture::new("cl-err");
        fixture.endpoint.acquire_segment().unwrap();
        let client = fixture.client();

        let err = client.write_data(Some(&"x".repeat(4093))).unwrap_err();
        assert!(matches!(err, ControlError::Remote { .. }));
        assert!(err.to_string().contains("4093"));
    }

    #[test]
    fn test_callback_reads_inside_notification() {
        let fixture = Fixture::new("cl-cb");
        fixture.endpoint.acquire_segment().unwrap();
        let client = Arc::new(fixture.client());

        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&client);
        let callback = move |event: ChangeEvent| -> Result<(), DeliveryError> {
            let data = inner.read_data().map_err(|e| DeliveryError::Failed {
                reason: e.to_string(),
            })?;
            let _ = tx.send((event, data));
            Ok(())
        };
        assert!(client
            .register_callback(SubscriberId::new("reader").unwrap(), Arc::new(callback))
            .unwrap());

        fixture.endpoint.write(b"fresh").unwrap();
        let (event, data) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(event, ChangeEvent::DataChanged);
        assert_eq!(data.as_deref(), Some("fresh"));

        client.notify_data_changed().unwrap();
        let (event, _) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(event, ChangeEvent::Resync);
    }

    #[test]
    fn test_duplicate_and_unregister() {
        let fixture = Fixture::new("cl-dup");
        let client = fixture.client();
        let id = SubscriberId::new("dup").unwrap();
        let noop = || -> Arc<dyn DataChangedCallback> {
            Arc::new(|_event: ChangeEvent| -> Result<(), DeliveryError> { Ok(()) })
        };

        assert!(client.register_callback(id.clone(), noop()).unwrap());
        assert!(!client.register_callback(id.clone(), noop()).unwrap());
        assert_eq!(fixture.endpoint.subscriber_count(), 1);

        assert!(client.unregister_callback(&id).unwrap());
        assert!(!client.unregister_callback(&id).unwrap());
        assert_eq!(fixture.endpoint.subscriber_count(), 0);
    }

    fn wait_for_count(endpoint: &SharedMemoryEndpoint, expected: usize) {
        for _ in 0..200 {
            if endpoint.subscriber_count() == expected {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_failing_callback_unregistered_on_owner() {
        let fixture = Fixture::new("cl-fail");
        fixture.endpoint.acquire_segment().unwrap();
        let client = fixture.client();
        let id = SubscriberId::new("flaky").unwrap();

        let failing = |_event: ChangeEvent| -> Result<(), DeliveryError> {
            Err(DeliveryError::Failed {
                reason: "refused".to_string(),
            })
        };
        assert!(client.register_callback(id.clone(), Arc::new(failing)).unwrap());
        assert_eq!(fixture.endpoint.subscriber_count(), 1);

        fixture.endpoint.write(b"first").unwrap();
        wait_for_count(&fixture.endpoint, 0);
        assert_eq!(fixture.endpoint.subscriber_count(), 0);

        // The id is free again on both sides.
        let (tx, rx) = mpsc::channel();
        let callback = move |event: ChangeEvent| -> Result<(), DeliveryError> {
            let _ = tx.send(event);
            Ok(())
        };
        assert!(client.register_callback(id, Arc::new(callback)).unwrap());
        assert_eq!(fixture.endpoint.subscriber_count(), 1);

        fixture.endpoint.write(b"second").unwrap();
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), ChangeEvent::DataChanged);
    }

    #[test]
    fn test_reregister_adopts_server_registration() {
        let fixture = Fixture::new("cl-adopt");
        fixture.endpoint.acquire_segment().unwrap();
        let client = fixture.client();
        let id = SubscriberId::new("orphan").unwrap();
        let noop = |_event: ChangeEvent| -> Result<(), DeliveryError> { Ok(()) };
        assert!(client.register_callback(id.clone(), Arc::new(noop)).unwrap());

        // Server keeps the registration, the local side lost its callback.
        client.shared.callbacks.remove(&id);

        let (tx, rx) = mpsc::channel();
        let callback = move |event: ChangeEvent| -> Result<(), DeliveryError> {
            let _ = tx.send(event);
            Ok(())
        };
        assert!(!client.register_callback(id, Arc::new(callback)).unwrap());
        assert_eq!(fixture.endpoint.subscriber_count(), 1);

        fixture.endpoint.write(b"routed").unwrap();
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), ChangeEvent::DataChanged);
    }

    #[test]
    fn test_same_id_on_two_connections() {
        let fixture = Fixture::new("cl-scope");
        let first = fixture.client();
        let second = fixture.client();
        let id = SubscriberId::new("shared-name").unwrap();
        let noop = || -> Arc<dyn DataChangedCallback> {
            Arc::new(|_event: ChangeEvent| -> Result<(), DeliveryError> { Ok(()) })
        };

        assert!(first.register_callback(id.clone(), noop()).unwrap());
        assert!(second.register_callback(id, noop()).unwrap());
        assert_eq!(fixture.endpoint.subscriber_count(), 2);
    }

    #[test]
    fn test_closed_remote_endpoint() {
        let fixture = Fixture::new("cl-closed");
        let client = fixture.client();
        assert!(client.ping().is_ok());

        fixture.endpoint.close();
        drop(fixture);

        // The connection thread keeps serving until the client hangs up, so
        // the endpoint reports closed rather than the socket failing.
        let err = client.notify_data_changed().unwrap_err();
        assert!(matches!(
            err,
            ControlError::Remote { .. } | ControlError::Disconnected
        ));
    }
}
