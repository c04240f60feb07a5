//! Shared region registry
//!
//! Tracks the regions registered with the SharedRegion service. The registry
//! does not own the memory behind a region and does not check regions for
//! overlap; keeping them disjoint is the caller's job.

use crate::platform::SharedRegionService;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Region used for notification traffic
pub const NOTIFY_REGION: u16 = 0;
/// Region used for message payloads
pub const DATA_REGION: u16 = 1;

/// A registered region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedRegionEntry {
    pub index: u16,
    pub base: u32,
    pub size: u32,
}

/// Registered shared regions, keyed by index
pub struct SharedRegionRegistry {
    service: Arc<dyn SharedRegionService>,
    entries: BTreeMap<u16, SharedRegionEntry>,
}

impl SharedRegionRegistry {
    pub fn new(service: Arc<dyn SharedRegionService>) -> Self {
        Self {
            service,
            entries: BTreeMap::new(),
        }
    }

    /// Register `[base, base + size)` at `index`
    pub fn add(&mut self, index: u16, base: u32, size: u32) -> Result<()> {
        if self.entries.contains_key(&index) {
            return Err(Error::DuplicateIndex(index));
        }

        self.service.add_region(index, base, size).map_err(|status| {
            error!("Error in SharedRegion_add{}: {}", index, status);
            Error::collaborator("SharedRegion_add", status)
        })?;

        info!("SharedRegion {} added at {:#010x} (+{:#x})", index, base, size);
        self.entries.insert(index, SharedRegionEntry { index, base, size });
        Ok(())
    }

    /// Unregister `index`; unknown indices are ignored
    ///
    /// The index is reusable afterwards even if the service reports a
    /// failure.
    pub fn remove(&mut self, index: u16) -> Result<()> {
        if self.entries.remove(&index).is_none() {
            debug!("SharedRegion {} not registered, nothing to remove", index);
            return Ok(());
        }

        self.service.remove_region(index).map_err(|status| {
            error!("Error in SharedRegion_remove{}: {}", index, status);
            Error::collaborator("SharedRegion_remove", status)
        })?;

        info!("SharedRegion {} removed", index);
        Ok(())
    }

    pub fn get(&self, index: u16) -> Option<&SharedRegionEntry> {
        self.entries.get(&index)
    }

    pub fn entries(&self) -> impl Iterator<Item = &SharedRegionEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{Call, Faults, Loopback};

    fn registry(faults: Faults) -> (Arc<Loopback>, SharedRegionRegistry) {
        let backend = Arc::new(Loopback::with_faults(faults));
        (backend.clone(), SharedRegionRegistry::new(backend))
    }

    #[test]
    fn test_duplicate_index() {
        let (_backend, mut registry) = registry(Faults::default());
        registry.add(0, 0xA000_0000, 0x1000).unwrap();
        assert_eq!(registry.add(0, 0xB000_0000, 0x1000), Err(Error::DuplicateIndex(0)));
        assert_eq!(registry.get(0).unwrap().base, 0xA000_0000);
    }

    #[test]
    fn test_remove_is_idempotent_and_frees_index() {
        let (backend, mut registry) = registry(Faults::default());
        registry.add(1, 0xA000_0000, 0x1000).unwrap();
        registry.remove(1).unwrap();
        registry.remove(1).unwrap();
        registry.remove(7).unwrap();
        registry.add(1, 0xC000_0000, 0x2000).unwrap();
        assert_eq!(registry.len(), 1);

        let removes = backend
            .calls()
            .into_iter()
            .filter(|c| matches!(c, Call::RemoveRegion(_)))
            .count();
        assert_eq!(removes, 1);
    }

    #[test]
    fn test_overlap_is_not_checked() {
        let (_backend, mut registry) = registry(Faults::default());
        registry.add(0, 0xA000_0000, 0x2000).unwrap();
        registry.add(1, 0xA000_1000, 0x2000).unwrap();
        assert_eq!(registry.entries().count(), 2);
    }

    #[test]
    fn test_service_failure_leaves_index_free() {
        let (_backend, mut registry) = registry(Faults {
            fail_region_add: Some(1),
            ..Faults::default()
        });
        let err = registry.add(1, 0xA000_0000, 0x1000).unwrap_err();
        assert!(matches!(err, Error::Collaborator { op: "SharedRegion_add", .. }));
        assert!(registry.is_empty());
    }
}
