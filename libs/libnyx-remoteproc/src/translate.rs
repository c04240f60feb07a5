//! Remote-to-physical address translation
//!
//! The simple translator only understands the tiler window, where the
//! hardware maps virtual addresses onto identical physical addresses.
//! Anything else needs the page-walking variant, which asks the driver.

use crate::core_id::CoreId;
use crate::lifecycle::{CoreHandle, ProcessorLifecycle};
use crate::platform::{AddrKind, RemoteCoreManager};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Page size used by the remote MMU
pub const PAGE_SIZE: u32 = 4096;

/// Half-open address range `[low, high)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub low: u32,
    pub high: u32,
}

impl AddressRange {
    pub const fn contains(&self, addr: u32) -> bool {
        addr >= self.low && addr < self.high
    }
}

/// Tiler remapping window
pub const TILER_WINDOW: AddressRange = AddressRange {
    low: 0x6000_0000,
    high: 0x8000_0000,
};

/// Round `addr` down to its page boundary
pub const fn page_align_low(addr: u32) -> u32 {
    addr & !(PAGE_SIZE - 1)
}

/// Translates addresses between host and remote views
#[derive(Clone)]
pub struct AddressTranslator {
    manager: Arc<dyn RemoteCoreManager>,
    lifecycle: ProcessorLifecycle,
}

impl AddressTranslator {
    pub fn new(manager: Arc<dyn RemoteCoreManager>) -> Self {
        Self {
            lifecycle: ProcessorLifecycle::new(manager.clone()),
            manager,
        }
    }

    /// Physical address of remote virtual `addr`
    ///
    /// Only addresses inside [`TILER_WINDOW`] are supported.
    pub fn translate(&self, addr: u32, core: CoreId) -> Result<u32> {
        if TILER_WINDOW.contains(addr) {
            trace!("Translated {:#010x} for {}", addr, core);
            Ok(addr)
        } else {
            debug!(
                "Non-tiler address translation not supported: {:#010x} for {}",
                addr, core
            );
            Err(Error::TranslationUnsupported { addr })
        }
    }

    /// Physical address of each of `page_count` pages starting at the page
    /// containing `addr`
    pub fn translate_pages(&self, addr: u32, page_count: u32, core: CoreId) -> Result<Vec<u32>> {
        if page_count == 0 {
            return Err(Error::InvalidArgument("page count must be non-zero".into()));
        }

        let base = page_align_low(addr);
        let handle = self.lifecycle.open(core)?;

        let result = self
            .manager
            .translate_pages(handle.raw(), base, page_count)
            .map_err(|status| {
                error!("Error in ProcMgr_virtToPhysPages: {}", status);
                Error::collaborator("ProcMgr_virtToPhysPages", status)
            })
            .and_then(|pages| {
                if pages.len() == page_count as usize {
                    Ok(pages)
                } else {
                    error!(
                        "ProcMgr_virtToPhysPages returned {} entries for {} pages",
                        pages.len(),
                        page_count
                    );
                    Err(Error::collaborator(
                        "ProcMgr_virtToPhysPages",
                        crate::Status::PROCMGR_E_FAIL,
                    ))
                }
            });

        let closed = self.lifecycle.close(handle);
        let pages = result?;
        closed?;

        for (i, page) in pages.iter().enumerate() {
            trace!("physEntries[{}] = {:#010x}", i, page);
        }
        Ok(pages)
    }

    /// Translate `addr` between address spaces using an open handle
    pub fn resolve(&self, handle: &CoreHandle, addr: u32, from: AddrKind, to: AddrKind) -> Result<u32> {
        let translated = self
            .manager
            .translate_addr(handle.raw(), addr, from, to)
            .map_err(|status| {
                error!("Error in ProcMgr_translateAddr: {}", status);
                Error::collaborator("ProcMgr_translateAddr", status)
            })?;

        debug!(
            "Translated {:#010x} ({:?}) -> {:#010x} ({:?})",
            addr, from, translated, to
        );
        Ok(translated)
    }
}
