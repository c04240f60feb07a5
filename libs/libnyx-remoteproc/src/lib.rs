//! # libnyx-remoteproc
//!
//! Host-side plumbing for the remote compute cores: address translation and
//! buffer mapping, shared region registration, core lifecycle and the
//! MessageQ transport session.
//!
//! ## Usage
//!
//! ```rust
//! use libnyx_remoteproc::loopback::Loopback;
//! use libnyx_remoteproc::{Platform, SessionConfig, TransportSession};
//! use std::sync::Arc;
//!
//! let platform = Platform::from_backend(Arc::new(Loopback::new()));
//! let mut session = TransportSession::new(platform, SessionConfig::default())?;
//! let report = session.run();
//! assert!(report.is_success());
//! # Ok::<(), libnyx_remoteproc::Error>(())
//! ```
//!
//! Hardware backends implement the traits in [`platform`]; the
//! [`loopback`] backend emulates the remote side in-process.

pub mod config;
pub mod core_id;
pub mod error;
pub mod lifecycle;
#[cfg(any(test, feature = "loopback"))]
pub mod loopback;
pub mod mapper;
pub mod message;
pub mod platform;
pub mod region;
pub mod retry;
pub mod session;
pub mod status;
pub mod translate;

pub use config::{BootMode, RegionConfig, SessionConfig, Translation};
pub use core_id::CoreId;
pub use error::{Error, ErrorKind, Result};
pub use lifecycle::{CoreHandle, CoreState, ProcessorLifecycle};
pub use mapper::{MappedAddress, MappingRequest, RegionMapper};
pub use message::{Message, QueueHandle, QueueId, Timeout};
pub use platform::{
    AddrKind, CoreResolver, MapKind, MessagingService, Platform, RemoteCoreManager,
    SharedRegionService, StaticCoreSet,
};
pub use region::{SharedRegionEntry, SharedRegionRegistry};
pub use retry::{CancelToken, RetryPolicy};
pub use session::{SessionReport, ShutdownAck, TransportSession};
pub use status::Status;
pub use translate::{AddressTranslator, TILER_WINDOW};
