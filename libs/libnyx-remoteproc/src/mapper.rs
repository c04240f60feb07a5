//! Mapping remote buffers into host-visible space
//!
//! The mapper is stateless: every call opens the core handle, issues one
//! driver request and closes the handle again, so no handle is held between
//! calls.

use crate::core_id::CoreId;
use crate::lifecycle::{CoreHandle, ProcessorLifecycle};
use crate::platform::{MapKind, RemoteCoreManager};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// One buffer to map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingRequest {
    pub addr: u32,
    pub size: u32,
}

/// Host-visible result of a mapping
///
/// Must be released with [`RegionMapper::unmap`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a mapping leaks unless it is unmapped"]
pub struct MappedAddress {
    pub addr: u32,
    /// Mapped size, possibly rounded up from the requested size
    pub size: u32,
}

/// Maps single buffers through the remote-core driver
#[derive(Clone)]
pub struct RegionMapper {
    manager: Arc<dyn RemoteCoreManager>,
    lifecycle: ProcessorLifecycle,
}

impl RegionMapper {
    pub fn new(manager: Arc<dyn RemoteCoreManager>) -> Self {
        Self {
            lifecycle: ProcessorLifecycle::new(manager.clone()),
            manager,
        }
    }

    /// Map the buffer described by `requests`
    ///
    /// Exactly one request is supported; batches are rejected before the
    /// driver is touched. If the handle fails to close after a successful
    /// map, the mapping is unmapped again and the close error returned.
    pub fn map(&self, requests: &[MappingRequest], kind: MapKind, core: CoreId) -> Result<MappedAddress> {
        let request = match requests {
            [single] => *single,
            [] => return Err(Error::InvalidArgument("no buffer to map".into())),
            _ => {
                error!("SysLinkMemUtils_map: {} buffers requested, only one supported", requests.len());
                return Err(Error::InvalidArgument(format!(
                    "{} buffers requested, only one is supported",
                    requests.len()
                )));
            }
        };
        if request.size == 0 {
            return Err(Error::InvalidArgument("zero-length buffer".into()));
        }

        let handle = self.lifecycle.open(core)?;
        let result = self
            .manager
            .map(handle.raw(), request.addr, request.size, kind)
            .map_err(|status| {
                error!("Error in ProcMgr_map: {}", status);
                Error::collaborator("ProcMgr_map", status)
            });
        let closed = self.lifecycle.close(handle);
        let (addr, size) = result?;
        let mapped = MappedAddress { addr, size };

        // A mapping whose handle failed to close is not handed out
        if let Err(e) = closed {
            warn!("Releasing mapping {:#010x} after failed close", mapped.addr);
            if let Err(unmap_err) = self.unmap(mapped, core) {
                error!("Could not release mapping {:#010x}: {}", addr, unmap_err);
            }
            return Err(e);
        }

        debug!(
            "Mapped {:#010x} (+{:#x}) -> {:#010x} (+{:#x})",
            request.addr, request.size, addr, size
        );
        Ok(mapped)
    }

    /// Release a mapping made by [`RegionMapper::map`]
    pub fn unmap(&self, mapped: MappedAddress, core: CoreId) -> Result<()> {
        self.with_handle(core, |handle| {
            self.manager.unmap(handle.raw(), mapped.addr).map_err(|status| {
                error!("Error in ProcMgr_unmap: {}", status);
                Error::collaborator("ProcMgr_unmap", status)
            })?;
            debug!("Unmapped {:#010x}", mapped.addr);
            Ok(())
        })
    }

    /// Run `op` with a freshly opened handle; the handle is always closed
    /// and the first failure wins
    fn with_handle<T>(&self, core: CoreId, op: impl FnOnce(&CoreHandle) -> Result<T>) -> Result<T> {
        let handle = self.lifecycle.open(core)?;
        let result = op(&handle);
        let closed = self.lifecycle.close(handle);
        let value = result?;
        closed?;
        Ok(value)
    }
}
