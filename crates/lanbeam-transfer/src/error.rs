//! Transfer errors and their stable classification.
//!
//! Every failure inside an engine ends the whole session and is reported to the
//! controller as a single `ErrorKind` plus a human-readable message.

use std::io;

use thiserror::Error;

/// Classification surfaced to the controller in `TransferEvent::Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The receiver presented the wrong security code (or the sender rejected it).
    AuthenticationFailed,
    /// The peer address could not be reached within the connect timeout.
    ConnectFailed,
    /// The sender never received the completion byte.
    AckTimeout,
    /// The peer disconnected mid-frame or mid-body.
    StreamClosedPrematurely,
    ReadTimeout,
    WriteTimeout,
    /// Local file create/read/write failure.
    IoFailure,
    /// A decoded length, size, count or name was rejected.
    InvalidFrame,
    /// Local input rejected before any I/O (empty batch, bad address, bad config).
    InvalidInput,
    /// The controller tore the session down.
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::AuthenticationFailed => "authentication failed",
            ErrorKind::ConnectFailed => "connect failed",
            ErrorKind::AckTimeout => "acknowledgment timeout",
            ErrorKind::StreamClosedPrematurely => "stream closed prematurely",
            ErrorKind::ReadTimeout => "read timeout",
            ErrorKind::WriteTimeout => "write timeout",
            ErrorKind::IoFailure => "I/O failure",
            ErrorKind::InvalidFrame => "invalid frame",
            ErrorKind::InvalidInput => "invalid input",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("security code rejected")]
    AuthenticationFailed,

    #[error("cannot connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("no acknowledgment from receiver: {0}")]
    AckTimeout(String),

    #[error("peer closed the connection during {0}")]
    StreamClosed(&'static str),

    #[error("timed out reading {0}")]
    ReadTimeout(&'static str),

    #[error("timed out writing {0}")]
    WriteTimeout(&'static str),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::AuthenticationFailed => ErrorKind::AuthenticationFailed,
            TransferError::ConnectFailed { .. } => ErrorKind::ConnectFailed,
            TransferError::AckTimeout(_) => ErrorKind::AckTimeout,
            TransferError::StreamClosed(_) => ErrorKind::StreamClosedPrematurely,
            TransferError::ReadTimeout(_) => ErrorKind::ReadTimeout,
            TransferError::WriteTimeout(_) => ErrorKind::WriteTimeout,
            TransferError::Io { .. } => ErrorKind::IoFailure,
            TransferError::InvalidFrame(_) => ErrorKind::InvalidFrame,
            TransferError::InvalidInput(_) => ErrorKind::InvalidInput,
            TransferError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Wrap a local filesystem error.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        TransferError::Io {
            context: context.into(),
            source,
        }
    }

    /// Classify an error from a socket read. `what` names the frame being read.
    pub fn from_read(what: &'static str, e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransferError::ReadTimeout(what),
            k if is_disconnect(k) => TransferError::StreamClosed(what),
            _ => TransferError::io(format!("socket read ({what})"), e),
        }
    }

    /// Classify an error from a socket write.
    pub fn from_write(what: &'static str, e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                TransferError::WriteTimeout(what)
            }
            k if is_disconnect(k) => TransferError::StreamClosed(what),
            _ => TransferError::io(format!("socket write ({what})"), e),
        }
    }
}

fn is_disconnect(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

pub type Result<T> = std::result::Result<T, TransferError>;
