// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Control socket server exposing one endpoint to other processes.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::net::Shutdown;
use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crate::endpoint::SharedMemoryEndpoint;
use crate::error::{ControlError, DeliveryError};
use crate::registry::{ChangeEvent, DataChangedCallback};
use crate::shm::SegmentHandle;
use crate::types::SubscriberId;

use super::message::{Request, RequestFrame, Response, ServerMessage};
use super::wire::{recv_message, send_message};

/// Messages a connection may queue for its writer thread. Only replies wait
/// for room; pushes never block the endpoint.
const OUTBOUND_QUEUE: usize = 64;

/// Serves one [`SharedMemoryEndpoint`] on a Unix socket.
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    endpoint: Arc<SharedMemoryEndpoint>,
    shutdown: Arc<AtomicBool>,
    next_connection: AtomicU64,
}

impl ControlServer {
    /// Bind the control socket at `path`, replacing a stale socket file.
    pub fn bind(
        path: impl AsRef<Path>,
        endpoint: Arc<SharedMemoryEndpoint>,
    ) -> Result<Self, ControlError> {
        let path = path.as_ref().to_path_buf();

        if path.exists() {
            std::fs::remove_file(&path).map_err(|source| ControlError::Socket {
                context: "remove stale socket",
                source,
            })?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ControlError::Socket {
                context: "create socket directory",
                source,
            })?;
        }

        let listener = UnixListener::bind(&path).map_err(|source| ControlError::Socket {
            context: "bind",
            source,
        })?;

        tracing::info!(
            socket = %path.display(),
            segment = endpoint.segment_name(),
            "Control server listening"
        );

        Ok(Self {
            listener,
            path,
            endpoint,
            shutdown: Arc::new(AtomicBool::new(false)),
            next_connection: AtomicU64::new(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn endpoint(&self) -> &Arc<SharedMemoryEndpoint> {
        &self.endpoint
    }

    /// Handle used to stop [`serve`](Self::serve) from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            path: self.path.clone(),
        }
    }

    /// Accept connections until shut down. Each connection gets a thread.
    pub fn serve(&self) -> Result<(), ControlError> {
        for incoming in self.listener.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let stream = match incoming {
                Ok(stream) => stream,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(ControlError::Socket {
                        context: "accept",
                        source,
                    })
                }
            };

            let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
            let connection = match Connection::new(id, stream, Arc::clone(&self.endpoint)) {
                Ok(connection) => connection,
                Err(e) => {
                    tracing::warn!(connection = id, error = %e, "Rejected connection");
                    continue;
                }
            };

            tracing::debug!(connection = id, "Client connected");
            thread::Builder::new()
                .name(format!("shmlink-conn-{}", id))
                .spawn(move || connection.run())
                .map_err(|source| ControlError::Socket {
                    context: "spawn connection thread",
                    source,
                })?;
        }

        tracing::info!(socket = %self.path.display(), "Control server stopped");
        Ok(())
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(socket = %self.path.display(), error = %e, "Failed to remove socket");
            }
        }
    }
}

/// Stops a running [`ControlServer`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    path: PathBuf,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if self.flag.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake the blocking accept.
        let _ = UnixStream::connect(&self.path);
    }
}

/// Work for a connection's writer thread.
enum Outgoing {
    Reply {
        id: u64,
        response: Response,
        handle: Option<SegmentHandle>,
    },
    /// The mailbox has pushes waiting.
    Wake,
}

/// Newest undelivered event per subscriber of one connection.
type Mailbox = Mutex<HashMap<SubscriberId, ChangeEvent>>;

/// Forwards change events to a subscriber on the other end of a connection.
struct RemoteSubscriber {
    subscriber: SubscriberId,
    mailbox: Arc<Mailbox>,
    outbound: SyncSender<Outgoing>,
}

impl DataChangedCallback for RemoteSubscriber {
    fn on_data_changed(&self, event: ChangeEvent) -> Result<(), DeliveryError> {
        // Events for a lagging peer collapse into the newest one.
        self.mailbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.subscriber.clone(), event);

        match self.outbound.try_send(Outgoing::Wake) {
            // A full queue is drained before the writer sleeps again.
            Ok(()) | Err(TrySendError::Full(_)) => Ok(()),
            Err(TrySendError::Disconnected(_)) => Err(DeliveryError::Disconnected {
                subscriber: self.subscriber.clone(),
            }),
        }
    }
}

struct Connection {
    id: u64,
    reader: UnixStream,
    outbound: SyncSender<Outgoing>,
    mailbox: Arc<Mailbox>,
    endpoint: Arc<SharedMemoryEndpoint>,
    /// Registry keys owned by this connection.
    subscribers: HashSet<SubscriberId>,
}

impl Connection {
    fn new(
        id: u64,
        stream: UnixStream,
        endpoint: Arc<SharedMemoryEndpoint>,
    ) -> Result<Self, ControlError> {
        let socket_err = |context: &'static str| {
            move |source: std::io::Error| ControlError::Socket { context, source }
        };
        let writer = stream.try_clone().map_err(socket_err("clone stream"))?;
        let mailbox: Arc<Mailbox> = Arc::new(Mutex::new(HashMap::new()));
        let (outbound, queue) = mpsc::sync_channel(OUTBOUND_QUEUE);

        let pending = Arc::clone(&mailbox);
        thread::Builder::new()
            .name(format!("shmlink-conn-{}-tx", id))
            .spawn(move || write_loop(id, writer, queue, pending))
            .map_err(socket_err("spawn writer thread"))?;

        Ok(Self {
            id,
            reader: stream,
            outbound,
            mailbox,
            endpoint,
            subscribers: HashSet::new(),
        })
    }

    fn run(mut self) {
        loop {
            match recv_message::<RequestFrame>(&self.reader) {
                Ok(Some((frame, _fds))) => {
                    if let Err(e) = self.dispatch(frame) {
                        tracing::debug!(connection = self.id, error = %e, "Reply failed");
                        break;
                    }
                }
                Ok(None) | Err(ControlError::Disconnected) => break,
                Err(e) => {
                    tracing::warn!(connection = self.id, error = %e, "Dropping connection");
                    break;
                }
            }
        }
        self.teardown();
    }

    fn dispatch(&mut self, frame: RequestFrame) -> Result<(), ControlError> {
        let RequestFrame { id, request } = frame;
        tracing::debug!(connection = self.id, request = request.name(), "Request");

        let (response, handle) = self.handle(request);
        self.outbound
            .send(Outgoing::Reply {
                id,
                response,
                handle,
            })
            .map_err(|_| ControlError::Disconnected)
    }

    fn handle(&mut self, request: Request) -> (Response, Option<SegmentHandle>) {
        let result = match request {
            Request::GetSharedMemory => return self.export_handle(),
            Request::WriteData { data: None } => Ok(Response::Ack),
            Request::WriteData { data: Some(data) } => {
                self.endpoint.write(data.as_bytes()).map(|_| Response::Ack)
            }
            Request::ReadData => Ok(Response::Data {
                data: self.endpoint.read_text().unwrap_or_else(|e| {
                    tracing::debug!(connection = self.id, error = %e, "Read failed");
                    None
                }),
            }),
            Request::RegisterCallback { subscriber } => {
                let key = subscriber.scoped(self.id);
                let callback = Arc::new(RemoteSubscriber {
                    subscriber,
                    mailbox: Arc::clone(&self.mailbox),
                    outbound: self.outbound.clone(),
                });
                self.endpoint.subscribe(key.clone(), callback).map(|added| {
                    self.subscribers.insert(key);
                    Response::Registered { added }
                })
            }
            Request::UnregisterCallback { subscriber } => {
                let key = subscriber.scoped(self.id);
                self.subscribers.remove(&key);
                self.mailbox
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&subscriber);
                self.endpoint
                    .unsubscribe(&key)
                    .map(|removed| Response::Unregistered { removed })
            }
            Request::NotifyDataChanged => self.endpoint.notify_data_changed().map(|_| Response::Ack),
            Request::Ping => Ok(Response::Pong),
        };

        let response = result.unwrap_or_else(|e| Response::Error {
            message: e.to_string(),
        });
        (response, None)
    }

    /// Create the segment on demand and duplicate its handle.
    fn export_handle(&self) -> (Response, Option<SegmentHandle>) {
        let exported = self
            .endpoint
            .acquire_segment()
            .and_then(|_| self.endpoint.export_handle_for_transfer());

        match exported {
            Ok(handle) => {
                let response = Response::Handle {
                    name: handle.name().to_string(),
                    capacity: self.endpoint.capacity().bytes(),
                };
                (response, Some(handle))
            }
            Err(e) => {
                tracing::warn!(connection = self.id, error = %e, "Handle export failed");
                (Response::NoHandle, None)
            }
        }
    }

    fn teardown(&mut self) {
        for key in self.subscribers.drain() {
            // A closed endpoint already dropped everything.
            let _ = self.endpoint.unsubscribe(&key);
        }
        tracing::debug!(connection = self.id, "Client disconnected");
    }
}

/// Sends queued replies and mailbox pushes until every sender is gone or the
/// peer stops accepting data.
fn write_loop(
    connection: u64,
    stream: UnixStream,
    queue: Receiver<Outgoing>,
    mailbox: Arc<Mailbox>,
) {
    for item in queue {
        let sent = match item {
            Outgoing::Reply {
                id,
                response,
                handle,
            } => {
                let reply = ServerMessage::Reply { id, response };
                match &handle {
                    Some(handle) => send_message(&stream, &reply, &[handle.as_fd()]),
                    None => send_message(&stream, &reply, &[]),
                }
            }
            Outgoing::Wake => Ok(()),
        };

        if let Err(e) = sent.and_then(|_| flush_mailbox(&stream, &mailbox)) {
            tracing::debug!(connection, error = %e, "Peer stopped accepting messages");
            break;
        }
    }
    // Wakes the reader so the connection tears down.
    let _ = stream.shutdown(Shutdown::Both);
}

fn flush_mailbox(stream: &UnixStream, mailbox: &Mailbox) -> Result<(), ControlError> {
    let pending: Vec<_> = mailbox
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain()
        .collect();
    for (subscriber, event) in pending {
        send_message(stream, &ServerMessage::data_changed(subscriber, event), &[])?;
    }
    Ok(())
}
