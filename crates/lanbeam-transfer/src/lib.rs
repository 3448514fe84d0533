//! LanBeam transfer engine: direct device-to-device file transfer on a LAN.
//!
//! One side sends (listens on a well-known TCP port, shows a six-digit code),
//! the other receives (connects by address and code). Each session runs on its
//! own worker thread and reports back over an ordered event channel:
//!
//! ```text
//! SessionController ──spawn──> worker thread (sender or receiver engine)
//!        ^                              │
//!        └──── TransferEvent channel ───┘
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod events;
pub mod net;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod stats;
pub mod worker;

pub use batch::{Batch, OutgoingFile, SecurityCode};
pub use config::{TransferConfig, DEFAULT_PORT};
pub use error::{ErrorKind, Result, TransferError};
pub use events::{
    ProgressUpdate, ReceiverState, Role, SenderState, SessionState, TransferEvent, TransferSummary,
};
pub use session::{AlwaysGranted, Outcome, SessionController, SessionId, SessionSnapshot, StorageAccess};
pub use stats::{format_rate, ThroughputTracker};
pub use worker::{spawn_receiver, spawn_sender, WorkerHandle};
