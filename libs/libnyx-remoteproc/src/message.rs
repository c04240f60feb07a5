//! MessageQ message and queue types

use crate::status::Status;
use std::time::Duration;

/// Upper bound on a message payload in bytes
pub const MAX_PAYLOAD: usize = 512;

/// Reserved id asking the remote core to terminate
pub const SENTINEL_ID: u16 = 0xFFFF;

/// Ids of data messages cycle through this many values
pub const ID_CYCLE: u32 = 16;

/// Heap identifier registered with MessageQ
pub type HeapId = u16;

/// Locally created receive queue
///
/// Owned by whoever created it and returned to the messaging service on
/// delete; deliberately neither `Clone` nor `Copy`.
#[derive(Debug, PartialEq, Eq)]
pub struct QueueHandle {
    id: QueueId,
}

impl QueueHandle {
    pub fn new(id: QueueId) -> Self {
        Self { id }
    }

    /// Queue id other cores use to address this queue
    pub fn id(&self) -> QueueId {
        self.id
    }
}

/// Address of a queue, local or remote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub u32);

/// Receive timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Forever,
    After(Duration),
}

/// A MessageQ message
///
/// Allocated by the messaging service and consumed exactly once, either by
/// a successful `put` or by `free_message`.
#[derive(Debug, PartialEq, Eq)]
pub struct Message {
    id: u16,
    heap_id: HeapId,
    reply_queue: Option<QueueId>,
    payload: Vec<u8>,
}

impl Message {
    /// Allocate a zeroed message of `size` payload bytes; `None` if the size
    /// exceeds [`MAX_PAYLOAD`]
    pub fn zeroed(heap_id: HeapId, size: usize) -> Option<Self> {
        if size > MAX_PAYLOAD {
            return None;
        }
        Some(Self {
            id: 0,
            heap_id,
            reply_queue: None,
            payload: vec![0; size],
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn set_id(&mut self, id: u16) {
        self.id = id;
    }

    pub fn heap_id(&self) -> HeapId {
        self.heap_id
    }

    pub fn reply_queue(&self) -> Option<QueueId> {
        self.reply_queue
    }

    /// Direct the reply to `queue`
    pub fn set_reply_queue(&mut self, queue: &QueueHandle) {
        self.reply_queue = Some(queue.id());
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }
}

/// A message the transport refused, handed back so it can be freed
#[derive(Debug)]
pub struct Rejected {
    pub status: Status,
    pub msg: Message,
}

/// Id stamped on data message `iteration`
pub fn request_id(iteration: u32) -> u16 {
    (iteration % ID_CYCLE) as u16
}

/// Id the remote core answers data message `iteration` with
pub fn reply_id(iteration: u32) -> u16 {
    request_id(iteration) + 1
}
