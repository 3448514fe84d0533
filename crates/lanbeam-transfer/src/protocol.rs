//! Wire format and framing.
//!
//! One ordered TCP stream per session, no version field, all integers big-endian:
//!
//! ```text
//! receiver -> sender   [code: i32]
//! sender -> receiver   [file_count: i32]
//!                      per file: [name_len: i16][name: UTF-8][size: i64][body: size bytes]
//! receiver -> sender   [ack: u8 = 0x01]
//! ```
//!
//! Bodies carry no inner framing; they are streamed in chunks whose boundaries mean
//! nothing to the peer.

use std::io::{self, Read};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::batch::validate_file_name;
use crate::error::{Result, TransferError};

pub const CODE_LEN: usize = 4;
pub const FILE_COUNT_LEN: usize = 4;
pub const NAME_LEN_LEN: usize = 2;
pub const SIZE_LEN: usize = 8;

/// Completion acknowledgment value.
pub const ACK: u8 = 0x01;

/// Longest encodable name in bytes (i16 length prefix).
pub const MAX_NAME_LEN: usize = i16::MAX as usize;

/// A single frame as written by either engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    Code(i32),
    FileCount(i32),
    /// Name length, name and size. The body follows separately.
    FileHeader { name: &'a str, size: i64 },
    Ack,
}

/// Serialize a frame. Fails on values the peer would have to reject.
pub fn encode(frame: &Frame<'_>) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    match *frame {
        Frame::Code(code) => buf.put_i32(code),
        Frame::FileCount(count) => {
            if count < 0 {
                return Err(TransferError::InvalidFrame(format!("negative file count {count}")));
            }
            buf.put_i32(count);
        }
        Frame::FileHeader { name, size } => {
            let name_bytes = name.as_bytes();
            if name_bytes.len() > MAX_NAME_LEN {
                return Err(TransferError::InvalidFrame(format!(
                    "name is {} bytes, limit is {MAX_NAME_LEN}",
                    name_bytes.len()
                )));
            }
            if size < 0 {
                return Err(TransferError::InvalidFrame(format!("negative file size {size}")));
            }
            buf.reserve(NAME_LEN_LEN + name_bytes.len() + SIZE_LEN);
            buf.put_i16(name_bytes.len() as i16);
            buf.put_slice(name_bytes);
            buf.put_i64(size);
        }
        Frame::Ack => buf.put_u8(ACK),
    }
    Ok(buf.freeze())
}

/// Decoded per-file metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub name: String,
    pub size: u64,
}

/// Pulls exact-length frames out of a stream that delivers bytes in arbitrary pieces.
///
/// Bytes read past the end of a frame stay buffered for the next call. Blocking and
/// timeouts come from the underlying reader (the socket's read timeout).
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    scratch: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    /// `read_size` bounds a single read from the stream and therefore a body chunk.
    pub fn new(inner: R, read_size: usize) -> Self {
        FrameReader {
            inner,
            buf: BytesMut::with_capacity(read_size),
            scratch: vec![0u8; read_size.max(SIZE_LEN)],
        }
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Block until exactly `n` bytes are available and return them.
    pub fn decode(&mut self, n: usize, what: &'static str) -> Result<Bytes> {
        while self.buf.len() < n {
            self.fill(what)?;
        }
        Ok(self.buf.split_to(n).freeze())
    }

    /// Next piece of a body: whatever is buffered, or one read from the stream,
    /// never more than `max` bytes.
    pub fn read_chunk(&mut self, max: usize, what: &'static str) -> Result<Bytes> {
        if self.buf.is_empty() {
            self.fill(what)?;
        }
        let n = max.min(self.buf.len());
        Ok(self.buf.split_to(n).freeze())
    }

    pub fn read_i32(&mut self, what: &'static str) -> Result<i32> {
        Ok(self.decode(4, what)?.get_i32())
    }

    pub fn read_code(&mut self) -> Result<i32> {
        self.read_i32("security code")
    }

    /// File count, rejected when negative, zero or above `max`.
    pub fn read_file_count(&mut self, max: u32) -> Result<u32> {
        let count = self.read_i32("file count")?;
        if count <= 0 || count as u32 > max {
            return Err(TransferError::InvalidFrame(format!(
                "file count {count} outside 1..={max}"
            )));
        }
        Ok(count as u32)
    }

    /// Name length, name and size of the next file, in that order.
    pub fn read_file_header(&mut self) -> Result<FileHeader> {
        let name_len = self.decode(NAME_LEN_LEN, "name length")?.get_i16();
        if name_len < 0 {
            return Err(TransferError::InvalidFrame(format!("negative name length {name_len}")));
        }
        let raw = self.decode(name_len as usize, "file name")?;
        let name = String::from_utf8(raw.to_vec())
            .map_err(|_| TransferError::InvalidFrame("file name is not valid UTF-8".into()))?;
        validate_file_name(&name)?;

        let size = self.decode(SIZE_LEN, "file size")?.get_i64();
        if size < 0 {
            return Err(TransferError::InvalidFrame(format!("negative size {size} for {name}")));
        }
        Ok(FileHeader {
            name,
            size: size as u64,
        })
    }

    pub fn read_ack(&mut self) -> Result<()> {
        let value = self.decode(1, "acknowledgment")?[0];
        if value != ACK {
            return Err(TransferError::InvalidFrame(format!(
                "unexpected acknowledgment byte 0x{value:02x}"
            )));
        }
        Ok(())
    }

    fn fill(&mut self, what: &'static str) -> Result<()> {
        loop {
            match self.inner.read(&mut self.scratch) {
                Ok(0) => return Err(TransferError::StreamClosed(what)),
                Ok(n) => {
                    self.buf.extend_from_slice(&self.scratch[..n]);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransferError::from_read(what, e)),
            }
        }
    }
}
