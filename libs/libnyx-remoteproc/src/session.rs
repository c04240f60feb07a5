//! MessageQ transport session
//!
//! Drives one complete run against a remote core pair:
//!
//! 1. bring-up: open the boot core, translate and register the notify and
//!    data regions, then start the boot core and the application core
//! 2. rendezvous: create the local queue and open the remote one, retrying
//!    while the remote has not created it yet
//! 3. exchange: `iterations` request/reply round trips with cyclic ids
//! 4. sentinel: ask the remote to terminate and wait for the echo
//! 5. teardown: release everything in reverse order
//!
//! Steps 4 and 5 run however far the earlier steps got. Teardown attempts
//! every step and returns the first failure.

use crate::config::{BootMode, SessionConfig};
use crate::core_id::CoreId;
use crate::error::ErrorKind;
use crate::lifecycle::{CoreHandle, ProcessorLifecycle};
use crate::message::{reply_id, request_id, Message, QueueHandle, QueueId, SENTINEL_ID};
use crate::platform::Platform;
use crate::region::{SharedRegionRegistry, DATA_REGION, NOTIFY_REGION};
use crate::retry::CancelToken;
use crate::status::Status;
use crate::translate::AddressTranslator;
use crate::{Error, Result};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// Outcome of the terminate handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownAck {
    /// The remote echoed the sentinel
    Acknowledged,
    /// The remote answered with another id
    Unexpected(u16),
    /// The sentinel was sent but no answer could be received
    NoReply,
    /// The sentinel could not be sent
    NotSent,
    /// Disabled by configuration
    Skipped,
}

impl ShutdownAck {
    /// Error class of a failed handshake
    ///
    /// An answer with the wrong id is a protocol fault. A missing answer
    /// carries no class of its own.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ShutdownAck::Unexpected(_) => Some(ErrorKind::ProtocolIntegrity),
            _ => None,
        }
    }
}

/// Result of [`TransportSession::run`]
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    /// Successful round trips
    pub exchanged: u32,
    pub shutdown: ShutdownAck,
    /// First failure of the run, if any
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<Error>,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && matches!(self.shutdown, ShutdownAck::Acknowledged | ShutdownAck::Skipped)
    }

    /// Class of the first failure, falling back to the handshake outcome
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error
            .as_ref()
            .map(Error::kind)
            .or_else(|| self.shutdown.kind())
    }
}

fn serialize_error<S: Serializer>(error: &Option<Error>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match error {
        Some(e) => {
            let mut state = serializer.serialize_struct("Error", 2)?;
            state.serialize_field("kind", &e.kind())?;
            state.serialize_field("message", &e.to_string())?;
            state.end()
        }
        None => serializer.serialize_none(),
    }
}

/// A transport session with one remote core pair
///
/// Not reentrant: one control thread drives a session from start to end.
pub struct TransportSession {
    platform: Platform,
    config: SessionConfig,
    lifecycle: ProcessorLifecycle,
    translator: AddressTranslator,
    regions: SharedRegionRegistry,
    cancel: CancelToken,
    handle: Option<CoreHandle>,
    local_queue: Option<QueueHandle>,
    remote_queue: Option<QueueId>,
    exchanged: u32,
}

impl TransportSession {
    pub fn new(platform: Platform, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            lifecycle: ProcessorLifecycle::new(platform.cores.clone()),
            translator: AddressTranslator::new(platform.cores.clone()),
            regions: SharedRegionRegistry::new(platform.regions.clone()),
            platform,
            config,
            cancel: CancelToken::new(),
            handle: None,
            local_queue: None,
            remote_queue: None,
            exchanged: 0,
        })
    }

    /// Use `cancel` instead of the session's own token
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Round trips completed so far
    pub fn exchanged(&self) -> u32 {
        self.exchanged
    }

    pub fn regions(&self) -> &SharedRegionRegistry {
        &self.regions
    }

    pub fn handle(&self) -> Option<&CoreHandle> {
        self.handle.as_ref()
    }

    /// Whether teardown still has something to release
    pub fn is_active(&self) -> bool {
        self.handle.is_some()
            || self.local_queue.is_some()
            || self.remote_queue.is_some()
            || !self.regions.is_empty()
    }

    fn resolve(&self, name: &str) -> Result<CoreId> {
        self.platform
            .resolver
            .resolve_id(name)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown processor name: {}", name)))
    }

    /// Open the boot core, register the shared regions and boot the cores
    ///
    /// On failure whatever was acquired stays recorded in the session and
    /// is released by [`TransportSession::shutdown`].
    pub fn startup(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Err(Error::InvalidArgument(
                "transport session already holds a core handle".into(),
            ));
        }

        let core = self.resolve(&self.config.core)?;
        let app_core = match &self.config.app_core {
            Some(name) => Some(self.resolve(name)?),
            None => None,
        };

        info!("Starting transport session on {}", core);
        let handle = self.lifecycle.open(core)?;
        let handle = self.handle.insert(handle);

        let translation = self.config.translation;
        let notify = self.config.notify_region;
        let data = self.config.data_region;

        let notify_base = self
            .translator
            .resolve(handle, notify.base, translation.from, translation.to)?;
        info!("Notify region base {:#010x} -> {:#010x}", notify.base, notify_base);
        let data_base = self
            .translator
            .resolve(handle, data.base, translation.from, translation.to)?;
        info!("Data region base {:#010x} -> {:#010x}", data.base, data_base);

        self.regions.add(NOTIFY_REGION, notify_base, notify.size)?;
        self.regions.add(DATA_REGION, data_base, data.size)?;

        if self.config.boot == BootMode::Daemon {
            info!("Remote images are managed by the daemon, not booting");
            return Ok(());
        }

        self.boot(core, self.config.core_image.clone())?;
        if let Some(app_core) = app_core {
            if app_core == core {
                warn!("{} is both boot and application core, starting it once", core);
            } else {
                self.boot(app_core, self.config.app_image.clone())?;
            }
        }

        info!("Transport session startup complete");
        Ok(())
    }

    fn boot(&mut self, core: CoreId, image: Option<PathBuf>) -> Result<()> {
        let handle = self.handle.as_mut().ok_or_else(not_started)?;

        let entry_point = match (self.config.boot, image) {
            (BootMode::Load, Some(image)) => self.lifecycle.load(handle, core, &image)?,
            (BootMode::Load, None) => {
                return Err(Error::Config(format!("no image configured for {}", core)));
            }
            _ => 0,
        };

        self.lifecycle.start(handle, core, entry_point)
    }

    /// Create the local queue and open the remote queue
    pub fn rendezvous(&mut self) -> Result<()> {
        if self.remote_queue.is_some() {
            return Err(Error::InvalidArgument(
                "transport session already has a remote queue".into(),
            ));
        }

        let messaging = self.platform.messaging.clone();

        if self.local_queue.is_none() {
            let queue = messaging.create_queue(&self.config.local_queue).map_err(|status| {
                error!("Error in MessageQ_create {}: {}", self.config.local_queue, status);
                Error::collaborator("MessageQ_create", status)
            })?;
            info!("Created local queue {} ({:#x})", self.config.local_queue, queue.id().0);
            self.local_queue = Some(queue);
        }

        let name = self.config.remote_queue.as_str();
        let remote = self.config.rendezvous.run(name, &self.cancel, || {
            messaging.open_queue(name).map_err(|status| {
                if status == Status::MESSAGEQ_E_NOTFOUND {
                    Error::ResourceUnavailable(format!("remote queue {} not created yet", name))
                } else {
                    error!("Error in MessageQ_open {}: {}", name, status);
                    Error::collaborator("MessageQ_open", status)
                }
            })
        })?;

        info!("Opened remote queue {} ({:#x})", name, remote.0);
        self.remote_queue = Some(remote);
        Ok(())
    }

    /// Run the configured number of request/reply round trips
    ///
    /// Iteration `i` sends id `i % 16` and only accepts `i % 16 + 1` back.
    /// Returns the number of round trips completed by this call.
    pub fn exchange(&mut self) -> Result<u32> {
        let local = self.local_queue.as_ref().ok_or_else(not_connected)?;
        let remote = self.remote_queue.ok_or_else(not_connected)?;

        info!("Exchanging messages with remote processor");
        for done in 0..self.config.iterations {
            if self.cancel.is_cancelled() {
                warn!("Exchange cancelled after {} round trips", done);
                return Err(Error::Cancelled);
            }

            let i = self.exchanged;
            let reply = send(&self.platform, &self.config, local, remote, request_id(i))
                .and_then(|()| wait(&self.platform, &self.config, local))?;
            let received = reply.id();
            release(&self.platform, reply);

            let expected = reply_id(i);
            if received != expected {
                error!(
                    "Data integrity failure: expected {}, received {}",
                    expected, received
                );
                return Err(Error::ProtocolIntegrity { expected, received });
            }

            self.exchanged += 1;
            if i % 2 == 0 {
                info!("Exchanged {} messages with remote processor", i);
            }
        }

        Ok(self.config.iterations)
    }

    /// Send the terminate sentinel and wait for its echo
    pub fn send_sentinel(&mut self) -> ShutdownAck {
        if !self.config.shutdown_sentinel {
            debug!("Shutdown sentinel disabled");
            return ShutdownAck::Skipped;
        }

        let (Some(local), Some(remote)) = (self.local_queue.as_ref(), self.remote_queue) else {
            warn!("No queue pair, cannot send the shutdown sentinel");
            return ShutdownAck::NotSent;
        };

        if let Err(e) = send(&self.platform, &self.config, local, remote, SENTINEL_ID) {
            warn!("Could not send the shutdown sentinel: {}", e);
            return ShutdownAck::NotSent;
        }

        let reply = match wait(&self.platform, &self.config, local) {
            Ok(reply) => reply,
            Err(e) => {
                error!("Unsuccessful run: no reply to the shutdown sentinel: {}", e);
                return ShutdownAck::NoReply;
            }
        };

        let received = reply.id();
        release(&self.platform, reply);

        if received == SENTINEL_ID {
            info!("Successfully received die response from the remote processor");
            ShutdownAck::Acknowledged
        } else {
            error!("Unsuccessful run: sentinel answered with id {:#x}", received);
            ShutdownAck::Unexpected(received)
        }
    }

    /// Release every resource the session holds, in reverse acquisition
    /// order
    ///
    /// Each step runs even if an earlier one failed. Calling it again is a
    /// no-op.
    pub fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down transport session");
        let messaging = self.platform.messaging.clone();
        let mut first: Option<Error> = None;
        let mut note = |result: Result<()>| {
            if let Err(e) = result {
                if first.is_some() {
                    warn!("Additional teardown failure: {}", e);
                } else {
                    first = Some(e);
                }
            }
        };

        if let Some(queue) = self.local_queue.take() {
            note(messaging.delete_queue(queue).map_err(|status| {
                error!("Error in MessageQ_delete: {}", status);
                Error::collaborator("MessageQ_delete", status)
            }));
        }

        if let Some(queue) = self.remote_queue.take() {
            note(messaging.close_queue(queue).map_err(|status| {
                error!("Error in MessageQ_close: {}", status);
                Error::collaborator("MessageQ_close", status)
            }));
        }

        note(self.regions.remove(NOTIFY_REGION));
        note(self.regions.remove(DATA_REGION));

        if let Some(mut handle) = self.handle.take() {
            note(self.lifecycle.stop_all(&mut handle));
            note(self.lifecycle.close(handle));
        }

        first.map_or(Ok(()), Err)
    }

    /// Run every phase and report the outcome
    pub fn run(&mut self) -> SessionReport {
        let mut first = None;

        let ready = self.startup().and_then(|()| self.rendezvous());
        match ready {
            Ok(()) => {
                if let Err(e) = self.exchange() {
                    first = Some(e);
                }
            }
            Err(e) => {
                error!("Transport session bring-up failed: {}", e);
                first = Some(e);
            }
        }

        let shutdown = self.send_sentinel();

        if let Err(e) = self.shutdown() {
            if first.is_none() {
                first = Some(e);
            }
        }

        let report = SessionReport {
            exchanged: self.exchanged,
            shutdown,
            error: first,
        };
        if report.is_success() {
            info!("Transport session completed: {} round trips", report.exchanged);
        } else {
            warn!("Transport session unsuccessful: {:?}", report);
        }
        report
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if self.is_active() {
            warn!("Transport session dropped while active, tearing down");
            if let Err(e) = self.shutdown() {
                error!("Teardown on drop failed: {}", e);
            }
        }
    }
}

fn not_started() -> Error {
    Error::InvalidArgument("transport session has no open core handle".into())
}

fn not_connected() -> Error {
    Error::InvalidArgument("transport session has no queue pair".into())
}

/// Allocate, stamp and send one message
fn send(platform: &Platform, config: &SessionConfig, local: &QueueHandle, remote: QueueId, id: u16) -> Result<()> {
    let messaging = &platform.messaging;
    let mut msg = messaging
        .alloc_message(config.heap_id, config.message_size)
        .map_err(|status| {
            error!("Error in MessageQ_alloc: {}", status);
            Error::collaborator("MessageQ_alloc", status)
        })?;

    msg.set_id(id);
    msg.set_reply_queue(local);

    if let Err(rejected) = messaging.put(remote, msg) {
        error!("Error in MessageQ_put (id {:#x}): {}", id, rejected.status);
        release(platform, rejected.msg);
        return Err(Error::collaborator("MessageQ_put", rejected.status));
    }

    debug!("MessageQ_put id {:#x}", id);
    Ok(())
}

/// Wait for a reply on `local`, forever unless a reply timeout is
/// configured
fn wait(platform: &Platform, config: &SessionConfig, local: &QueueHandle) -> Result<Message> {
    platform.messaging.get(local, config.reply_timeout()).map_err(|status| {
        error!("Error in MessageQ_get: {}", status);
        Error::collaborator("MessageQ_get", status)
    })
}

/// Return a message to its heap; failures are only logged
fn release(platform: &Platform, msg: Message) {
    let id = msg.id();
    if let Err(status) = platform.messaging.free_message(msg) {
        warn!("Error in MessageQ_free (id {:#x}): {}", id, status);
    }
}
