//! Remote core lifecycle
//!
//! A [`CoreHandle`] owns the driver handle of one physical core and tracks
//! every logical core driven through it:
//!
//! ```text
//! open -> Open -> (load) -> Loaded -> start -> Running -> stop -> Stopped -> close
//! ```
//!
//! `load` is skipped when a daemon has already placed the image. A start
//! that fails leaves the core `Failed`; `stop` is still allowed from there.

use crate::core_id::CoreId;
use crate::platform::{RawHandle, RemoteCoreManager};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Per-core lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreState {
    Open,
    Loaded,
    Running,
    Stopped,
    /// Start was attempted and failed; the core may be half powered
    Failed,
}

impl CoreState {
    pub fn can_load(&self) -> bool {
        matches!(self, CoreState::Open)
    }

    pub fn can_start(&self) -> bool {
        matches!(self, CoreState::Open | CoreState::Loaded)
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, CoreState::Running | CoreState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CoreState::Open => "open",
            CoreState::Loaded => "loaded",
            CoreState::Running => "running",
            CoreState::Stopped => "stopped",
            CoreState::Failed => "failed",
        }
    }
}

/// Exclusive handle to a physical remote core
#[derive(Debug)]
pub struct CoreHandle {
    raw: RawHandle,
    core: CoreId,
    states: BTreeMap<CoreId, CoreState>,
    started: Vec<CoreId>,
}

impl CoreHandle {
    /// Physical core this handle controls
    pub fn core(&self) -> CoreId {
        self.core
    }

    pub fn raw(&self) -> &RawHandle {
        &self.raw
    }

    /// State of a logical core behind this handle
    pub fn state(&self, core: CoreId) -> CoreState {
        self.states.get(&core).copied().unwrap_or(CoreState::Open)
    }

    /// Cores whose start was attempted, in start order
    pub fn started(&self) -> &[CoreId] {
        &self.started
    }

    fn check(&self, core: CoreId, op: &'static str, allowed: fn(&CoreState) -> bool) -> Result<()> {
        if core.physical() != self.core {
            return Err(Error::InvalidArgument(format!(
                "{} is not driven through the {} handle",
                core, self.core
            )));
        }
        let state = self.state(core);
        if !allowed(&state) {
            return Err(Error::InvalidState {
                core,
                op,
                state: state.as_str(),
            });
        }
        Ok(())
    }
}

/// Opens, boots, stops and closes remote cores
#[derive(Clone)]
pub struct ProcessorLifecycle {
    manager: Arc<dyn RemoteCoreManager>,
}

impl ProcessorLifecycle {
    pub fn new(manager: Arc<dyn RemoteCoreManager>) -> Self {
        Self { manager }
    }

    /// Open the physical core backing `core`
    pub fn open(&self, core: CoreId) -> Result<CoreHandle> {
        let physical = core.physical();
        if physical != core {
            debug!("{} shares the {} handle", core, physical);
        }

        let raw = self.manager.open(physical).map_err(|status| {
            error!("Error in ProcMgr_open for {}: {}", physical, status);
            Error::OpenFailed {
                core: physical,
                status,
            }
        })?;

        info!("Opened {} handle", physical);
        Ok(CoreHandle {
            raw,
            core: physical,
            states: BTreeMap::new(),
            started: Vec::new(),
        })
    }

    /// Load `image` onto `core`; returns the entry point
    pub fn load(&self, handle: &mut CoreHandle, core: CoreId, image: &Path) -> Result<u32> {
        handle.check(core, "load", CoreState::can_load)?;

        info!("Loading image {} onto {}", image.display(), core);
        let entry_point = self
            .manager
            .load(&handle.raw, image, core)
            .map_err(|status| {
                error!("Error in ProcMgr_load for {}: {}", core, status);
                Error::collaborator("ProcMgr_load", status)
            })?;

        debug!("{} entry point {:#010x}", core, entry_point);
        handle.states.insert(core, CoreState::Loaded);
        Ok(entry_point)
    }

    /// Release `core` from reset at `entry_point`
    ///
    /// Starting the same logical core twice is a caller bug and is reported
    /// as an invalid state.
    pub fn start(&self, handle: &mut CoreHandle, core: CoreId, entry_point: u32) -> Result<()> {
        handle.check(core, "start", CoreState::can_start)?;

        handle.started.push(core);
        match self.manager.start(&handle.raw, entry_point, core) {
            Ok(()) => {
                info!("Started {}", core);
                handle.states.insert(core, CoreState::Running);
                Ok(())
            }
            Err(status) => {
                error!("Error in ProcMgr_start for {}: {}", core, status);
                handle.states.insert(core, CoreState::Failed);
                Err(Error::collaborator("ProcMgr_start", status))
            }
        }
    }

    pub fn stop(&self, handle: &mut CoreHandle, core: CoreId) -> Result<()> {
        handle.check(core, "stop", CoreState::can_stop)?;

        self.manager.stop(&handle.raw, core).map_err(|status| {
            error!("Error in ProcMgr_stop for {}: {}", core, status);
            handle.states.insert(core, CoreState::Failed);
            Error::collaborator("ProcMgr_stop", status)
        })?;

        info!("Stopped {}", core);
        handle.states.insert(core, CoreState::Stopped);
        Ok(())
    }

    /// Stop every started core in reverse start order
    ///
    /// Every stop is attempted; the first failure is returned.
    pub fn stop_all(&self, handle: &mut CoreHandle) -> Result<()> {
        let mut first = None;
        let order: Vec<CoreId> = handle.started.iter().rev().copied().collect();
        for core in order {
            if !handle.state(core).can_stop() {
                continue;
            }
            if let Err(e) = self.stop(handle, core) {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Release the handle, whatever state its cores are in
    pub fn close(&self, handle: CoreHandle) -> Result<()> {
        for (core, state) in &handle.states {
            if *state == CoreState::Running {
                warn!("Closing {} handle while {} is still running", handle.core, core);
            }
        }

        let core = handle.core;
        self.manager.close(handle.raw).map_err(|status| {
            error!("Error in ProcMgr_close for {}: {}", core, status);
            Error::collaborator("ProcMgr_close", status)
        })?;

        info!("Closed {} handle", core);
        Ok(())
    }
}
