//! shmlink Core Library
//!
//! Shared-memory transport between cooperating processes. Provides shared
//! memory segments with handle transfer, length-prefixed framing, a
//! subscriber registry with change notifications, per-process endpoints,
//! the control socket that connects them, and configuration parsing.

pub mod binding;
pub mod config;
pub mod control;
pub mod endpoint;
pub mod error;
pub mod registry;
pub mod shm;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use binding::{EndpointDirectory, ServiceBinding, SharedMemoryService};
pub use config::{Config, ConfigLoader, EndpointConfig, TransportConfig};
pub use control::{ControlServer, RemoteEndpoint, ShutdownHandle};
pub use endpoint::{SegmentInfo, SharedMemoryEndpoint};
pub use error::{
    ControlError, DeliveryError, EndpointError, FrameError, HardValidationError, SegmentError,
    ShmLinkError, ShmLinkResult,
};
pub use registry::{BroadcastReport, ChangeEvent, DataChangedCallback, SubscriberRegistry};
pub use shm::{FramedChannel, SegmentBackend, SegmentHandle, SharedMemorySegment};
pub use state::{EndpointState, EndpointStats};
pub use types::{ByteOrder, Capacity, EndpointId, SubscriberId};
