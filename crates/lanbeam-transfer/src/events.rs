//! Values a worker sends back to the controller.
//!
//! Every stream is ordered and ends with exactly one terminal event:
//! `Completed` or `Failed`.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::ErrorKind;
use crate::stats::{format_rate, ThroughputSample};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

/// Sender state machine. Indices are zero-based positions in the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Listening,
    Connected,
    Authenticating,
    SendingMetadata(usize),
    SendingBody(usize),
    AwaitingAck,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Connecting,
    Authenticated,
    ReadingHeader(usize),
    ReceivingBody(usize),
    Acknowledging,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Sender(SenderState),
    Receiver(ReceiverState),
}

impl SessionState {
    pub fn role(&self) -> Role {
        match self {
            SessionState::Sender(_) => Role::Sender,
            SessionState::Receiver(_) => Role::Receiver,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Sender(SenderState::Done | SenderState::Error)
                | SessionState::Receiver(ReceiverState::Done | ReceiverState::Error)
        )
    }

    /// Absorbing error state for `role`.
    pub fn error(role: Role) -> Self {
        match role {
            Role::Sender => SessionState::Sender(SenderState::Error),
            Role::Receiver => SessionState::Receiver(ReceiverState::Error),
        }
    }
}

/// Progress of the file currently on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub file_index: usize,
    pub file_count: usize,
    pub file_name: String,
    /// Fraction of the current file, 0.0..=1.0.
    pub fraction: f64,
    /// Fraction of the batch, counting finished files as whole.
    pub overall_fraction: f64,
    pub bytes_per_second: f64,
    /// e.g. `file 1/3: holiday.jpg`
    pub label: String,
}

impl ProgressUpdate {
    pub fn new(file_index: usize, file_count: usize, file_name: &str, sample: ThroughputSample) -> Self {
        let overall_fraction = if file_count == 0 {
            1.0
        } else {
            ((file_index as f64 + sample.fraction) / file_count as f64).min(1.0)
        };
        ProgressUpdate {
            file_index,
            file_count,
            file_name: file_name.to_string(),
            fraction: sample.fraction,
            overall_fraction,
            bytes_per_second: sample.bytes_per_second,
            label: format!("file {}/{}: {}", file_index + 1, file_count, file_name),
        }
    }

    pub fn rate_label(&self) -> String {
        format_rate(self.bytes_per_second)
    }
}

/// Outcome of a finished session.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSummary {
    pub role: Role,
    pub peer: SocketAddr,
    pub files: usize,
    pub total_bytes: u64,
    pub elapsed: Duration,
    pub throughput_bps: u64,
}

impl TransferSummary {
    pub fn new(role: Role, peer: SocketAddr, files: usize, total_bytes: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let throughput_bps = if secs > 0.0 {
            (total_bytes as f64 / secs) as u64
        } else {
            0
        };
        TransferSummary {
            role,
            peer,
            files,
            total_bytes,
            elapsed,
            throughput_bps,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    StateChanged(SessionState),
    Progress(ProgressUpdate),
    Completed(TransferSummary),
    Failed { kind: ErrorKind, message: String },
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferEvent::Completed(_) | TransferEvent::Failed { .. })
    }
}
