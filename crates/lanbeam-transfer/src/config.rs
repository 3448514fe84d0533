//! Session configuration shared by both engines.

use std::time::Duration;

use crate::error::{Result, TransferError};

/// Well-known TCP port the sender listens on.
pub const DEFAULT_PORT: u16 = 12345;

/// 1 MiB body chunks.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// 4 MB socket buffers.
pub const SOCKET_BUF_SIZE: usize = 4 * 1024 * 1024;

/// Upper bound on the announced file count. Anything above is treated as garbage.
pub const MAX_FILE_COUNT: u32 = 1_000_000;

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Port the sender binds and the receiver connects to. 0 lets the OS pick (tests).
    pub port: u16,
    pub connect_timeout: Duration,
    /// Maximum idle wait for any single socket read.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// How long the sender waits for the completion byte after the last body.
    pub ack_timeout: Duration,
    pub chunk_size: usize,
    /// Minimum spacing between two progress events for the same file.
    pub progress_interval: Duration,
    /// How often the listening sender checks for cancellation.
    pub accept_poll_interval: Duration,
    pub socket_buffer_size: usize,
    pub max_file_count: u32,
    /// Keep the half-written file when a receive fails.
    pub keep_partial_files: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(120),
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_interval: Duration::from_millis(300),
            accept_poll_interval: Duration::from_millis(50),
            socket_buffer_size: SOCKET_BUF_SIZE,
            max_file_count: MAX_FILE_COUNT,
            keep_partial_files: false,
        }
    }
}

impl TransferConfig {
    /// Reject settings that would make a session hang or spin.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(TransferError::InvalidInput("chunk size must be non-zero".into()));
        }
        if self.max_file_count == 0 {
            return Err(TransferError::InvalidInput(
                "max file count must be non-zero".into(),
            ));
        }
        for (name, value) in [
            ("connect timeout", self.connect_timeout),
            ("read timeout", self.read_timeout),
            ("write timeout", self.write_timeout),
            ("ack timeout", self.ack_timeout),
            ("accept poll interval", self.accept_poll_interval),
        ] {
            // std sockets reject a zero timeout
            if value.is_zero() {
                return Err(TransferError::InvalidInput(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}
