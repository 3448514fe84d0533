//! Worker threads: one per session, talking back only through an event channel.
//!
//! The controller keeps the receiving end of the channel and an `AbortSignal`.
//! Cancelling shuts the session's socket down, so a worker blocked in a read or
//! write wakes up with an error instead of hanging.

use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender as ChannelSender};
use parking_lot::Mutex;

use crate::batch::{Batch, SecurityCode};
use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::events::{ProgressUpdate, Role, SessionState, TransferEvent, TransferSummary};
use crate::net;
use crate::receiver::{self, RecvConfig};
use crate::sender::{self, SendConfig};
use crate::stats::ThroughputSample;

/// Capacity of the per-session event channel. Progress is rate limited, so this
/// only fills when the controller stops draining.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);

/// Write side of the event channel, owned by the engine.
#[derive(Clone)]
pub struct EventSink {
    tx: ChannelSender<TransferEvent>,
}

impl EventSink {
    pub fn new(tx: ChannelSender<TransferEvent>) -> Self {
        EventSink { tx }
    }

    /// Deliver an event. A controller that went away is not an engine error.
    pub fn emit(&self, event: TransferEvent) {
        let _ = self.tx.send(event);
    }

    pub fn state(&self, state: SessionState) {
        self.emit(TransferEvent::StateChanged(state));
    }

    pub fn progress(&self, file_index: usize, file_count: usize, name: &str, sample: ThroughputSample) {
        self.emit(TransferEvent::Progress(ProgressUpdate::new(
            file_index, file_count, name, sample,
        )));
    }
}

/// Cancellation shared between the controller and one engine.
#[derive(Default)]
pub struct AbortSignal {
    cancelled: AtomicBool,
    stream: Mutex<Option<TcpStream>>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(TransferError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Register the session's connection so `abort` can shut it down.
    pub fn attach(&self, stream: &TcpStream) -> Result<()> {
        let handle = stream
            .try_clone()
            .map_err(|e| TransferError::io("clone socket handle", e))?;
        let mut slot = self.stream.lock();
        if self.is_cancelled() {
            let _ = handle.shutdown(Shutdown::Both);
            return Err(TransferError::Cancelled);
        }
        *slot = Some(handle);
        Ok(())
    }

    /// Forget the connection once the session has finished with it.
    pub fn detach(&self) {
        self.stream.lock().take();
    }

    pub fn abort(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(stream) = self.stream.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Controller-side view of a running worker.
pub struct WorkerHandle {
    id: u32,
    role: Role,
    events: Receiver<TransferEvent>,
    abort: Arc<AbortSignal>,
    thread: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl WorkerHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn events(&self) -> &Receiver<TransferEvent> {
        &self.events
    }

    /// Address the sender is listening on (`None` for receivers).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Request teardown. Returns immediately; the terminal event follows.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wait for the worker thread to exit. Undelivered events are discarded so a
    /// worker blocked on a full channel can finish.
    pub fn join(mut self) {
        drop(std::mem::replace(&mut self.events, crossbeam_channel::never()));
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.thread.as_ref().is_some_and(|t| !t.is_finished()) {
            self.abort.abort();
        }
    }
}

/// Bind the listening socket and start a sender worker.
///
/// Binding happens on the caller's thread so a busy port fails fast and the
/// chosen port is known before anyone connects.
pub fn spawn_sender(
    config: TransferConfig,
    batch: Batch,
    code: SecurityCode,
) -> Result<WorkerHandle> {
    config.validate()?;
    let listener = net::bind_listener(config.port, config.socket_buffer_size)
        .map_err(|e| TransferError::io(format!("bind port {}", config.port), e))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| TransferError::io("listener address", e))?;
    tracing::info!("listening on {} for {} file(s)", local_addr, batch.len());

    let send_config = SendConfig {
        transfer: config,
        code,
        batch,
    };
    spawn(Role::Sender, Some(local_addr), move |events, abort| {
        sender::run_sender(send_config, listener, events, abort)
    })
}

/// Start a receiver worker. Address resolution and connecting both happen on the
/// worker so the caller never blocks.
pub fn spawn_receiver(
    config: TransferConfig,
    peer: impl Into<String>,
    code: SecurityCode,
    dest_dir: impl Into<PathBuf>,
) -> Result<WorkerHandle> {
    config.validate()?;
    let recv_config = RecvConfig {
        transfer: config,
        peer: peer.into(),
        code,
        dest_dir: dest_dir.into(),
    };
    spawn(Role::Receiver, None, move |events, abort| {
        receiver::run_receiver(recv_config, events, abort)
    })
}

fn spawn<F>(role: Role, local_addr: Option<SocketAddr>, run: F) -> Result<WorkerHandle>
where
    F: FnOnce(&EventSink, &AbortSignal) -> Result<TransferSummary> + Send + 'static,
{
    let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = bounded::<TransferEvent>(EVENT_CHANNEL_CAPACITY);
    let abort = Arc::new(AbortSignal::new());
    let worker_abort = abort.clone();
    let prefix = match role {
        Role::Sender => "send",
        Role::Receiver => "recv",
    };

    let thread = std::thread::Builder::new()
        .name(format!("lanbeam-{}-{}", prefix, id))
        .spawn(move || {
            let events = EventSink::new(tx);
            match run(&events, &worker_abort) {
                Ok(summary) => {
                    tracing::info!(
                        "session {} complete: {} file(s), {} bytes in {:.1}s ({} B/s)",
                        id,
                        summary.files,
                        summary.total_bytes,
                        summary.elapsed.as_secs_f64(),
                        summary.throughput_bps
                    );
                    events.emit(TransferEvent::Completed(summary));
                }
                Err(e) => {
                    tracing::warn!("session {} failed: {}", id, e);
                    events.emit(TransferEvent::Failed {
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
        })
        .map_err(|e| TransferError::io("spawn worker thread", e))?;

    Ok(WorkerHandle {
        id,
        role,
        events: rx,
        abort,
        thread: Some(thread),
        local_addr,
    })
}
