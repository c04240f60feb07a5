//! In-process loopback backend
//!
//! Implements every collaborator trait without hardware. The remote core is
//! emulated inline: a message put on a remote queue is answered right away
//! into its reply queue, data messages with `id + 1` and the terminate
//! sentinel with itself. Nothing can arrive during a `Timeout::Forever`
//! wait, so `get` on an empty queue reports `MESSAGEQ_E_TIMEOUT` instead of
//! blocking. A `Timeout::After` wait sleeps for its duration first.
//!
//! Faults can be injected through [`Faults`], and every collaborator call is
//! journaled so tests can check ordering and counts.

use crate::core_id::CoreId;
use crate::message::{HeapId, Message, QueueHandle, QueueId, Rejected, Timeout, SENTINEL_ID};
use crate::platform::{
    AddrKind, CoreResolver, MapKind, RawHandle, RemoteCoreManager, SharedRegionService,
    MessagingService, StaticCoreSet,
};
use crate::status::Status;
use crate::translate::PAGE_SIZE;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, trace};

/// Distance between the host user-virtual and slave-virtual views
pub const SLAVE_OFFSET: u32 = 0x07B0_0000;

const MAP_BASE: u32 = 0xB000_0000;
const REMOTE_QUEUE_BASE: u32 = 0x0001_0000;

/// Journaled collaborator call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open(CoreId),
    Close(CoreId),
    Map(u32, u32),
    Unmap(u32),
    TranslateAddr(u32),
    TranslatePages(u32, u32),
    Load(CoreId),
    Start(CoreId),
    Stop(CoreId),
    AddRegion(u16),
    RemoveRegion(u16),
    CreateQueue(String),
    OpenQueue(String),
    DeleteQueue(String),
    CloseQueue(String),
    Alloc,
    Free(u16),
    Put(u16),
    Get,
}

/// Injected failures and remote behaviour
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Every `open` fails
    pub fail_open: bool,
    /// Every `close` fails (the handle is still released)
    pub fail_close: bool,
    /// Starting this core fails
    pub fail_start: Option<CoreId>,
    /// Adding this region index fails
    pub fail_region_add: Option<u16>,
    /// The Nth `put` (1-based) is rejected
    pub fail_put: Option<u32>,
    /// The Nth data reply (1-based) carries a wrong id
    pub corrupt_reply: Option<u32>,
    /// The remote swallows the sentinel without answering
    pub drop_sentinel_reply: bool,
    /// The remote answers the sentinel with this id instead of echoing it
    pub sentinel_reply: Option<u16>,
    /// `open_queue` reports not-found this many times before the remote
    /// queue appears
    pub queue_ready_after: u32,
}

#[derive(Default)]
struct LocalQueue {
    name: String,
    pending: VecDeque<Message>,
}

#[derive(Default)]
struct State {
    faults: Faults,
    calls: Vec<Call>,
    next_handle: u64,
    handles: HashMap<u64, CoreId>,
    running: BTreeSet<CoreId>,
    next_map: u32,
    mappings: HashMap<u32, u32>,
    regions: BTreeMap<u16, (u32, u32)>,
    next_queue: u32,
    local: HashMap<u32, LocalQueue>,
    remote: HashMap<String, QueueId>,
    open_attempts: u32,
    puts: u32,
    data_replies: u32,
    live_messages: usize,
}

impl State {
    fn core_of(&self, handle: &RawHandle) -> Result<CoreId, Status> {
        self.handles.get(&handle.0).copied().ok_or(Status::PROCMGR_E_HANDLE)
    }

    fn pop(&mut self, queue: &QueueHandle) -> Result<Option<Message>, Status> {
        let local = self.local.get_mut(&queue.id().0).ok_or(Status::MESSAGEQ_E_FAIL)?;
        Ok(local.pending.pop_front())
    }

    fn remote_name(&self, queue: QueueId) -> Option<String> {
        self.remote
            .iter()
            .find(|(_, id)| **id == queue)
            .map(|(name, _)| name.clone())
    }

    /// Remote side of a put: answer into the reply queue, or drop
    fn answer(&mut self, mut msg: Message) {
        let reply_id = if msg.id() == SENTINEL_ID {
            if self.faults.drop_sentinel_reply {
                debug!("loopback: remote swallowed the sentinel");
                self.live_messages = self.live_messages.saturating_sub(1);
                return;
            }
            self.faults.sentinel_reply.unwrap_or(SENTINEL_ID)
        } else {
            self.data_replies += 1;
            if self.faults.corrupt_reply == Some(self.data_replies) {
                msg.id().wrapping_add(2)
            } else {
                msg.id().wrapping_add(1)
            }
        };

        match msg.reply_queue().and_then(|q| self.local.get_mut(&q.0)) {
            Some(queue) => {
                msg.set_id(reply_id);
                queue.pending.push_back(msg);
            }
            None => {
                debug!("loopback: no reply queue, remote dropped message {}", msg.id());
                self.live_messages = self.live_messages.saturating_sub(1);
            }
        }
    }
}

/// Loopback implementation of every collaborator
pub struct Loopback {
    state: Mutex<State>,
}

impl Default for Loopback {
    fn default() -> Self {
        Self::new()
    }
}

impl Loopback {
    pub fn new() -> Self {
        Self::with_faults(Faults::default())
    }

    pub fn with_faults(faults: Faults) -> Self {
        Self {
            state: Mutex::new(State {
                faults,
                next_handle: 1,
                next_map: MAP_BASE,
                next_queue: 0x80,
                ..State::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Number of calls matching `pred`
    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn open_handles(&self) -> usize {
        self.state().handles.len()
    }

    pub fn running_cores(&self) -> Vec<CoreId> {
        self.state().running.iter().copied().collect()
    }

    pub fn registered_regions(&self) -> Vec<u16> {
        self.state().regions.keys().copied().collect()
    }

    pub fn active_mappings(&self) -> usize {
        self.state().mappings.len()
    }

    /// Local queues that have not been deleted
    pub fn local_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().local.values().map(|q| q.name.clone()).collect();
        names.sort();
        names
    }

    /// Remote queues opened and not closed
    pub fn open_remote_queues(&self) -> usize {
        self.state().remote.len()
    }

    /// Messages allocated and not yet freed or consumed by the remote
    pub fn live_messages(&self) -> usize {
        self.state().live_messages
    }
}

impl RemoteCoreManager for Loopback {
    fn open(&self, core: CoreId) -> Result<RawHandle, Status> {
        let mut state = self.state();
        state.calls.push(Call::Open(core));
        if state.faults.fail_open {
            return Err(Status::PROCMGR_E_FAIL);
        }
        if state.handles.values().any(|c| *c == core) {
            return Err(Status::PROCMGR_E_INUSE);
        }
        let raw = state.next_handle;
        state.next_handle += 1;
        state.handles.insert(raw, core);
        Ok(RawHandle(raw))
    }

    fn close(&self, handle: RawHandle) -> Result<(), Status> {
        let mut state = self.state();
        let core = state.handles.remove(&handle.0).ok_or(Status::PROCMGR_E_HANDLE)?;
        state.calls.push(Call::Close(core));
        if state.faults.fail_close {
            return Err(Status::PROCMGR_E_FAIL);
        }
        Ok(())
    }

    fn map(&self, handle: &RawHandle, addr: u32, size: u32, kind: MapKind) -> Result<(u32, u32), Status> {
        let mut state = self.state();
        state.core_of(handle)?;
        state.calls.push(Call::Map(addr, size));

        let rounded = size
            .checked_add(PAGE_SIZE - 1)
            .map(|s| s & !(PAGE_SIZE - 1))
            .ok_or(Status::PROCMGR_E_INVALIDARG)?;
        let host = state.next_map;
        state.next_map = host.checked_add(rounded).ok_or(Status::PROCMGR_E_FAIL)?;
        state.mappings.insert(host, rounded);
        trace!("loopback: mapped {:#010x} as {:?} at {:#010x}", addr, kind, host);
        Ok((host, rounded))
    }

    fn unmap(&self, handle: &RawHandle, host_addr: u32) -> Result<(), Status> {
        let mut state = self.state();
        state.core_of(handle)?;
        state.calls.push(Call::Unmap(host_addr));
        state
            .mappings
            .remove(&host_addr)
            .map(|_| ())
            .ok_or(Status::PROCMGR_E_INVALIDARG)
    }

    fn translate_addr(&self, handle: &RawHandle, addr: u32, from: AddrKind, to: AddrKind) -> Result<u32, Status> {
        let mut state = self.state();
        state.core_of(handle)?;
        state.calls.push(Call::TranslateAddr(addr));
        match (from, to) {
            (a, b) if a == b => Ok(addr),
            (AddrKind::MasterUsrVirt, AddrKind::SlaveVirt) => Ok(addr.wrapping_add(SLAVE_OFFSET)),
            (AddrKind::SlaveVirt, AddrKind::MasterUsrVirt) => Ok(addr.wrapping_sub(SLAVE_OFFSET)),
            _ => Err(Status::PROCMGR_E_INVALIDARG),
        }
    }

    fn translate_pages(&self, handle: &RawHandle, addr: u32, page_count: u32) -> Result<Vec<u32>, Status> {
        let mut state = self.state();
        state.core_of(handle)?;
        state.calls.push(Call::TranslatePages(addr, page_count));
        (0..page_count)
            .map(|i| {
                i.checked_mul(PAGE_SIZE)
                    .and_then(|offset| addr.checked_add(offset))
                    .ok_or(Status::PROCMGR_E_INVALIDARG)
            })
            .collect()
    }

    fn load(&self, handle: &RawHandle, image: &Path, core: CoreId) -> Result<u32, Status> {
        let mut state = self.state();
        state.core_of(handle)?;
        state.calls.push(Call::Load(core));
        trace!("loopback: loading {} onto {}", image.display(), core);
        Ok(0x0000_4000 + u32::from(core.proc_id()) * 0x100)
    }

    fn start(&self, handle: &RawHandle, _entry_point: u32, core: CoreId) -> Result<(), Status> {
        let mut state = self.state();
        state.core_of(handle)?;
        state.calls.push(Call::Start(core));
        if state.faults.fail_start == Some(core) {
            return Err(Status::PROCMGR_E_FAIL);
        }
        state.running.insert(core);
        Ok(())
    }

    fn stop(&self, handle: &RawHandle, core: CoreId) -> Result<(), Status> {
        let mut state = self.state();
        state.core_of(handle)?;
        state.calls.push(Call::Stop(core));
        state.running.remove(&core);
        Ok(())
    }
}

impl SharedRegionService for Loopback {
    fn add_region(&self, index: u16, base: u32, size: u32) -> Result<(), Status> {
        let mut state = self.state();
        state.calls.push(Call::AddRegion(index));
        if state.faults.fail_region_add == Some(index) {
            return Err(Status::SHAREDREGION_E_FAIL);
        }
        if state.regions.contains_key(&index) {
            return Err(Status::SHAREDREGION_E_ALREADYEXISTS);
        }
        state.regions.insert(index, (base, size));
        Ok(())
    }

    fn remove_region(&self, index: u16) -> Result<(), Status> {
        let mut state = self.state();
        state.calls.push(Call::RemoveRegion(index));
        state
            .regions
            .remove(&index)
            .map(|_| ())
            .ok_or(Status::SHAREDREGION_E_FAIL)
    }
}

impl MessagingService for Loopback {
    fn create_queue(&self, name: &str) -> Result<QueueHandle, Status> {
        let mut state = self.state();
        state.calls.push(Call::CreateQueue(name.to_string()));
        if state.local.values().any(|q| q.name == name) {
            return Err(Status::MESSAGEQ_E_FAIL);
        }
        let id = state.next_queue;
        state.next_queue += 1;
        state.local.insert(
            id,
            LocalQueue {
                name: name.to_string(),
                pending: VecDeque::new(),
            },
        );
        Ok(QueueHandle::new(QueueId(id)))
    }

    fn open_queue(&self, name: &str) -> Result<QueueId, Status> {
        let mut state = self.state();
        state.calls.push(Call::OpenQueue(name.to_string()));

        if let Some((id, _)) = state.local.iter().find(|(_, q)| q.name == name) {
            return Ok(QueueId(*id));
        }
        if let Some(id) = state.remote.get(name) {
            return Ok(*id);
        }

        state.open_attempts += 1;
        if state.open_attempts <= state.faults.queue_ready_after {
            return Err(Status::MESSAGEQ_E_NOTFOUND);
        }
        let id = QueueId(REMOTE_QUEUE_BASE + state.remote.len() as u32);
        state.remote.insert(name.to_string(), id);
        Ok(id)
    }

    fn delete_queue(&self, queue: QueueHandle) -> Result<(), Status> {
        let mut state = self.state();
        let local = state.local.remove(&queue.id().0).ok_or(Status::MESSAGEQ_E_FAIL)?;
        state.calls.push(Call::DeleteQueue(local.name));
        state.live_messages = state.live_messages.saturating_sub(local.pending.len());
        Ok(())
    }

    fn close_queue(&self, queue: QueueId) -> Result<(), Status> {
        let mut state = self.state();
        let name = state.remote_name(queue).ok_or(Status::MESSAGEQ_E_FAIL)?;
        state.remote.remove(&name);
        state.calls.push(Call::CloseQueue(name));
        Ok(())
    }

    fn alloc_message(&self, heap_id: HeapId, size: usize) -> Result<Message, Status> {
        let mut state = self.state();
        state.calls.push(Call::Alloc);
        let msg = Message::zeroed(heap_id, size).ok_or(Status::MESSAGEQ_E_FAIL)?;
        state.live_messages += 1;
        Ok(msg)
    }

    fn free_message(&self, msg: Message) -> Result<(), Status> {
        let mut state = self.state();
        state.calls.push(Call::Free(msg.id()));
        state.live_messages = state.live_messages.saturating_sub(1);
        Ok(())
    }

    fn put(&self, queue: QueueId, msg: Message) -> Result<(), Rejected> {
        let mut state = self.state();
        state.calls.push(Call::Put(msg.id()));
        state.puts += 1;

        if state.faults.fail_put == Some(state.puts) || state.remote_name(queue).is_none() {
            return Err(Rejected {
                status: Status::MESSAGEQ_E_FAIL,
                msg,
            });
        }
        state.answer(msg);
        Ok(())
    }

    fn get(&self, queue: &QueueHandle, timeout: Timeout) -> Result<Message, Status> {
        let popped = {
            let mut state = self.state();
            state.calls.push(Call::Get);
            state.pop(queue)?
        };
        if let Some(msg) = popped {
            return Ok(msg);
        }

        if let Timeout::After(wait) = timeout {
            trace!("loopback: waiting {:?} on an empty queue", wait);
            std::thread::sleep(wait);
            if let Some(msg) = self.state().pop(queue)? {
                return Ok(msg);
            }
        }
        Err(Status::MESSAGEQ_E_TIMEOUT)
    }
}

impl CoreResolver for Loopback {
    fn resolve_id(&self, name: &str) -> Option<CoreId> {
        StaticCoreSet.resolve_id(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_remote_echo() {
        let backend = Loopback::new();
        let local = backend.create_queue("MQ_MPU").unwrap();
        let remote = backend.open_queue("MQ_CORE1").unwrap();

        let mut msg = backend.alloc_message(0, 16).unwrap();
        msg.set_id(4);
        msg.set_reply_queue(&local);
        backend.put(remote, msg).unwrap();

        let reply = backend.get(&local, Timeout::Forever).unwrap();
        assert_eq!(reply.id(), 5);
        backend.free_message(reply).unwrap();
        assert_eq!(backend.live_messages(), 0);
        assert_eq!(backend.get(&local, Timeout::Forever), Err(Status::MESSAGEQ_E_TIMEOUT));
    }

    #[test]
    fn test_bounded_get_waits_before_timing_out() {
        let backend = Loopback::new();
        let local = backend.create_queue("MQ_MPU").unwrap();

        let started = Instant::now();
        let result = backend.get(&local, Timeout::After(Duration::from_millis(20)));
        assert_eq!(result, Err(Status::MESSAGEQ_E_TIMEOUT));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(backend.count(|c| *c == Call::Get), 1);
    }

    #[test]
    fn test_queue_appears_late() {
        let backend = Loopback::with_faults(Faults {
            queue_ready_after: 2,
            ..Faults::default()
        });
        assert_eq!(backend.open_queue("MQ_CORE1"), Err(Status::MESSAGEQ_E_NOTFOUND));
        assert_eq!(backend.open_queue("MQ_CORE1"), Err(Status::MESSAGEQ_E_NOTFOUND));
        let id = backend.open_queue("MQ_CORE1").unwrap();
        assert_eq!(backend.open_queue("MQ_CORE1"), Ok(id));
        backend.close_queue(id).unwrap();
        assert_eq!(backend.open_remote_queues(), 0);
    }

    #[test]
    fn test_rejected_put_returns_message() {
        let backend = Loopback::with_faults(Faults {
            fail_put: Some(1),
            ..Faults::default()
        });
        let remote = backend.open_queue("MQ_CORE1").unwrap();
        let mut msg = backend.alloc_message(0, 8).unwrap();
        msg.set_id(3);
        let rejected = backend.put(remote, msg).unwrap_err();
        assert_eq!(rejected.status, Status::MESSAGEQ_E_FAIL);
        assert_eq!(rejected.msg.id(), 3);
        backend.free_message(rejected.msg).unwrap();
        assert_eq!(backend.live_messages(), 0);
    }

    #[test]
    fn test_delete_drops_pending() {
        let backend = Loopback::new();
        let local = backend.create_queue("MQ_MPU").unwrap();
        let remote = backend.open_queue("MQ_CORE1").unwrap();
        let mut msg = backend.alloc_message(0, 8).unwrap();
        msg.set_reply_queue(&local);
        backend.put(remote, msg).unwrap();
        backend.delete_queue(local).unwrap();
        assert_eq!(backend.live_messages(), 0);
        assert!(backend.local_queues().is_empty());
    }
}
