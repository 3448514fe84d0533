//! Session controller: owns at most one running transfer and mirrors its state.
//!
//! Starting a new session always tears down the previous worker first. The
//! controller never blocks on the network; it only drains events.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;

use crate::batch::{Batch, SecurityCode};
use crate::config::TransferConfig;
use crate::error::{ErrorKind, Result, TransferError};
use crate::events::{
    ProgressUpdate, ReceiverState, Role, SenderState, SessionState, TransferEvent, TransferSummary,
};
use crate::worker::{self, WorkerHandle};

pub type SessionId = u32;

/// Storage permission check, supplied by the platform layer.
pub trait StorageAccess: Send {
    /// `dest` is the receive directory, `None` when reading files to send.
    fn ensure_access(&self, dest: Option<&Path>) -> bool;
}

/// For platforms without a permission model.
pub struct AlwaysGranted;

impl StorageAccess for AlwaysGranted {
    fn ensure_access(&self, _dest: Option<&Path>) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(TransferSummary),
    Failed { kind: ErrorKind, message: String },
}

/// Read-only mirror of a session, updated from its events.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub role: Role,
    pub state: SessionState,
    /// Code to display (senders) or the code presented (receivers).
    pub code: SecurityCode,
    /// Listening address for senders.
    pub local_addr: Option<SocketAddr>,
    pub progress: Option<ProgressUpdate>,
    pub outcome: Option<Outcome>,
}

impl SessionSnapshot {
    fn apply(&mut self, event: &TransferEvent) {
        match event {
            TransferEvent::StateChanged(state) => self.state = *state,
            TransferEvent::Progress(p) => self.progress = Some(p.clone()),
            TransferEvent::Completed(summary) => {
                self.state = match self.role {
                    Role::Sender => SessionState::Sender(SenderState::Done),
                    Role::Receiver => SessionState::Receiver(ReceiverState::Done),
                };
                self.outcome = Some(Outcome::Completed(summary.clone()));
            }
            TransferEvent::Failed { kind, message } => {
                self.state = SessionState::error(self.role);
                self.outcome = Some(Outcome::Failed {
                    kind: *kind,
                    message: message.clone(),
                });
            }
        }
    }
}

struct ActiveSession {
    handle: WorkerHandle,
    snapshot: SessionSnapshot,
}

pub struct SessionController {
    config: TransferConfig,
    storage: Box<dyn StorageAccess>,
    active: Option<ActiveSession>,
    last: Option<SessionSnapshot>,
}

impl SessionController {
    pub fn new(config: TransferConfig) -> Self {
        Self::with_storage(config, Box::new(AlwaysGranted))
    }

    pub fn with_storage(config: TransferConfig, storage: Box<dyn StorageAccess>) -> Self {
        SessionController {
            config,
            storage,
            active: None,
            last: None,
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Start listening for a receiver with a fresh security code.
    pub fn start_sending(&mut self, batch: Batch) -> Result<SessionId> {
        self.teardown();
        self.require_storage(None)?;
        let code = SecurityCode::generate();
        let handle = worker::spawn_sender(self.config.clone(), batch, code)?;
        let snapshot = SessionSnapshot {
            id: handle.id(),
            role: Role::Sender,
            state: SessionState::Sender(SenderState::Listening),
            code,
            local_addr: handle.local_addr(),
            progress: None,
            outcome: None,
        };
        Ok(self.install(handle, snapshot))
    }

    /// Connect to `address` (`host` or `host:port`) and receive into `dest_dir`.
    pub fn start_receiving(
        &mut self,
        address: &str,
        code: SecurityCode,
        dest_dir: impl Into<PathBuf>,
    ) -> Result<SessionId> {
        self.teardown();
        let dest_dir = dest_dir.into();
        self.require_storage(Some(&dest_dir))?;
        let handle = worker::spawn_receiver(self.config.clone(), address, code, dest_dir)?;
        let snapshot = SessionSnapshot {
            id: handle.id(),
            role: Role::Receiver,
            state: SessionState::Receiver(ReceiverState::Connecting),
            code,
            local_addr: None,
            progress: None,
            outcome: None,
        };
        Ok(self.install(handle, snapshot))
    }

    /// Tear down the session `id` if it is the active one.
    pub fn cancel(&mut self, id: SessionId) -> bool {
        let is_active = self.active.as_ref().is_some_and(|a| a.snapshot.id == id);
        if is_active {
            self.teardown();
        }
        is_active
    }

    /// Drain every pending event without blocking.
    pub fn poll(&mut self) -> Vec<TransferEvent> {
        let mut drained = Vec::new();
        while let Some(active) = &self.active {
            match active.handle.events().try_recv() {
                Ok(event) => {
                    self.apply(&event);
                    drained.push(event);
                }
                Err(crossbeam_channel::TryRecvError::Empty) => break,
                Err(crossbeam_channel::TryRecvError::Disconnected) => {
                    let event = worker_vanished();
                    self.apply(&event);
                    drained.push(event);
                }
            }
        }
        drained
    }

    /// Wait up to `timeout` for the next event. `None` when idle or nothing arrived.
    pub fn next_event(&mut self, timeout: Duration) -> Option<TransferEvent> {
        let active = self.active.as_ref()?;
        let event = match active.handle.events().recv_timeout(timeout) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => return None,
            Err(RecvTimeoutError::Disconnected) => worker_vanished(),
        };
        self.apply(&event);
        Some(event)
    }

    /// The running session, if any.
    pub fn snapshot(&self) -> Option<&SessionSnapshot> {
        self.active.as_ref().map(|a| &a.snapshot)
    }

    /// The most recent session that reached a terminal state.
    pub fn last_session(&self) -> Option<&SessionSnapshot> {
        self.last.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    fn install(&mut self, handle: WorkerHandle, snapshot: SessionSnapshot) -> SessionId {
        let id = snapshot.id;
        tracing::info!("session {} started as {:?}", id, snapshot.role);
        self.active = Some(ActiveSession { handle, snapshot });
        id
    }

    fn apply(&mut self, event: &TransferEvent) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.snapshot.apply(event);
        if event.is_terminal() {
            // back to idle; the worker exits right after its terminal event
            if let Some(done) = self.active.take() {
                self.last = Some(done.snapshot);
            }
        }
    }

    /// Forcibly end the active session, if any, and wait for its worker to
    /// release its socket. A sender notices within one `accept_poll_interval`;
    /// a receiver still connecting can take up to `connect_timeout`.
    fn teardown(&mut self) {
        if let Some(ActiveSession {
            handle,
            mut snapshot,
        }) = self.active.take()
        {
            tracing::info!("tearing down session {}", snapshot.id);
            handle.cancel();
            handle.join();
            snapshot.apply(&TransferEvent::Failed {
                kind: ErrorKind::Cancelled,
                message: TransferError::Cancelled.to_string(),
            });
            self.last = Some(snapshot);
        }
    }

    fn require_storage(&self, dest: Option<&Path>) -> Result<()> {
        if self.storage.ensure_access(dest) {
            return Ok(());
        }
        Err(TransferError::io(
            "storage access",
            io::Error::new(io::ErrorKind::PermissionDenied, "storage permission not granted"),
        ))
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn worker_vanished() -> TransferEvent {
    TransferEvent::Failed {
        kind: ErrorKind::IoFailure,
        message: "worker exited without reporting a result".into(),
    }
}
