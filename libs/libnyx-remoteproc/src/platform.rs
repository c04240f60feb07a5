//! Collaborator interfaces
//!
//! The remote-core driver, the SharedRegion service, the MessageQ service
//! and the MultiProc core-set resolver live outside this crate. They are
//! reached only through these traits so that a hardware backend and the
//! in-process [`loopback`](crate::loopback) backend are interchangeable.

use crate::core_id::CoreId;
use crate::message::{HeapId, Message, QueueHandle, QueueId, Rejected, Timeout};
use crate::status::Status;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Driver handle to one physical core
///
/// Not `Clone`: a handle is released by moving it into
/// [`RemoteCoreManager::close`].
#[derive(Debug, PartialEq, Eq)]
pub struct RawHandle(pub u64);

/// Kind of mapping requested from the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapKind {
    /// Host user-virtual buffer
    Virtual,
    /// Physically contiguous buffer
    Physical,
    /// Tiler container buffer
    Tiler,
}

/// Address spaces understood by the driver's translator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddrKind {
    MasterKnlVirt,
    MasterUsrVirt,
    MasterPhys,
    SlaveVirt,
    SlavePhys,
}

/// Remote-core manager (ProcMgr driver)
pub trait RemoteCoreManager: Send + Sync {
    fn open(&self, core: CoreId) -> Result<RawHandle, Status>;
    fn close(&self, handle: RawHandle) -> Result<(), Status>;

    /// Map `size` bytes at `addr`; returns the host address and mapped size
    fn map(&self, handle: &RawHandle, addr: u32, size: u32, kind: MapKind)
        -> Result<(u32, u32), Status>;
    fn unmap(&self, handle: &RawHandle, host_addr: u32) -> Result<(), Status>;

    fn translate_addr(
        &self,
        handle: &RawHandle,
        addr: u32,
        from: AddrKind,
        to: AddrKind,
    ) -> Result<u32, Status>;

    /// Physical address of each of `page_count` pages starting at `addr`
    fn translate_pages(&self, handle: &RawHandle, addr: u32, page_count: u32)
        -> Result<Vec<u32>, Status>;

    /// Load `image` onto `core`; returns the entry point
    fn load(&self, handle: &RawHandle, image: &Path, core: CoreId) -> Result<u32, Status>;
    fn start(&self, handle: &RawHandle, entry_point: u32, core: CoreId) -> Result<(), Status>;
    fn stop(&self, handle: &RawHandle, core: CoreId) -> Result<(), Status>;
}

/// SharedRegion service
pub trait SharedRegionService: Send + Sync {
    fn add_region(&self, index: u16, base: u32, size: u32) -> Result<(), Status>;
    fn remove_region(&self, index: u16) -> Result<(), Status>;
}

/// MessageQ service
pub trait MessagingService: Send + Sync {
    fn create_queue(&self, name: &str) -> Result<QueueHandle, Status>;

    /// Open a remote queue by name; fails with
    /// [`Status::MESSAGEQ_E_NOTFOUND`] until its owner has created it
    fn open_queue(&self, name: &str) -> Result<QueueId, Status>;

    fn delete_queue(&self, queue: QueueHandle) -> Result<(), Status>;
    fn close_queue(&self, queue: QueueId) -> Result<(), Status>;

    fn alloc_message(&self, heap_id: HeapId, size: usize) -> Result<Message, Status>;
    fn free_message(&self, msg: Message) -> Result<(), Status>;

    /// Send `msg`; ownership passes to the transport on success
    fn put(&self, queue: QueueId, msg: Message) -> Result<(), Rejected>;
    fn get(&self, queue: &QueueHandle, timeout: Timeout) -> Result<Message, Status>;
}

/// MultiProc core-set resolver
pub trait CoreResolver: Send + Sync {
    fn resolve_id(&self, name: &str) -> Option<CoreId>;
}

/// Resolver for the fixed OMAP4 core set
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticCoreSet;

impl CoreResolver for StaticCoreSet {
    fn resolve_id(&self, name: &str) -> Option<CoreId> {
        name.parse().ok()
    }
}

/// Bundle of collaborator implementations a session runs against
#[derive(Clone)]
pub struct Platform {
    pub cores: Arc<dyn RemoteCoreManager>,
    pub regions: Arc<dyn SharedRegionService>,
    pub messaging: Arc<dyn MessagingService>,
    pub resolver: Arc<dyn CoreResolver>,
}

impl Platform {
    /// Use a single backend for every collaborator
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: RemoteCoreManager + SharedRegionService + MessagingService + CoreResolver + 'static,
    {
        Self {
            cores: backend.clone(),
            regions: backend.clone(),
            messaging: backend.clone(),
            resolver: backend,
        }
    }
}
