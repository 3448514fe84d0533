//! Session inputs: the one-time security code and the batch of files to send.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rand::Rng;

use crate::error::{Result, TransferError};
use crate::protocol::MAX_NAME_LEN;

pub const CODE_MIN: u32 = 100_000;
pub const CODE_MAX: u32 = 999_999;

/// Six-digit code shown by the sender and typed into the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecurityCode(u32);

impl SecurityCode {
    /// Fresh code for a new send session.
    pub fn generate() -> Self {
        SecurityCode(rand::rng().random_range(CODE_MIN..=CODE_MAX))
    }

    pub fn new(value: u32) -> Result<Self> {
        if !(CODE_MIN..=CODE_MAX).contains(&value) {
            return Err(TransferError::InvalidInput(format!(
                "security code must be six digits, got {value}"
            )));
        }
        Ok(SecurityCode(value))
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Wire representation (always fits in a positive i32).
    pub fn to_wire(self) -> i32 {
        self.0 as i32
    }

    /// Compare against a code read off the wire.
    pub fn matches(self, wire: i32) -> bool {
        wire >= 0 && wire as u32 == self.0
    }
}

impl fmt::Display for SecurityCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

impl FromStr for SecurityCode {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let value: u32 = trimmed
            .parse()
            .map_err(|_| TransferError::InvalidInput(format!("not a security code: {trimmed:?}")))?;
        SecurityCode::new(value)
    }
}

/// A file queued for sending, bound to the path its content is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    pub name: String,
    pub size: u64,
    pub path: PathBuf,
}

impl OutgoingFile {
    /// Describe a regular file, named after its final path component.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let meta = fs::metadata(path)
            .map_err(|e| TransferError::io(format!("stat {}", path.display()), e))?;
        if !meta.is_file() {
            return Err(TransferError::InvalidInput(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                TransferError::InvalidInput(format!("{} has no UTF-8 file name", path.display()))
            })?
            .to_string();
        validate_file_name(&name)?;
        Ok(OutgoingFile {
            name,
            size: meta.len(),
            path: path.to_path_buf(),
        })
    }
}

/// Ordered, non-empty list of files, fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    files: Vec<OutgoingFile>,
}

impl Batch {
    pub fn new(files: Vec<OutgoingFile>) -> Result<Self> {
        if files.is_empty() {
            return Err(TransferError::InvalidInput("nothing to send".into()));
        }
        if files.len() > i32::MAX as usize {
            return Err(TransferError::InvalidInput(format!("{} files is too many", files.len())));
        }
        let mut seen = HashSet::with_capacity(files.len());
        for f in &files {
            validate_file_name(&f.name)?;
            if f.name.len() > MAX_NAME_LEN {
                return Err(TransferError::InvalidInput(format!(
                    "name of {} is {} bytes, limit is {MAX_NAME_LEN}",
                    f.path.display(),
                    f.name.len()
                )));
            }
            // the receiver writes every file into one directory
            if !seen.insert(f.name.as_str()) {
                return Err(TransferError::InvalidInput(format!(
                    "more than one file named {:?}",
                    f.name
                )));
            }
        }
        Ok(Batch { files })
    }

    pub fn from_paths<I, P>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let files = paths
            .into_iter()
            .map(OutgoingFile::from_path)
            .collect::<Result<Vec<_>>>()?;
        Batch::new(files)
    }

    pub fn files(&self) -> &[OutgoingFile] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

/// Reject names that could escape the destination directory.
pub fn validate_file_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0', ':']);
    if bad {
        return Err(TransferError::InvalidFrame(format!("unsafe file name {name:?}")));
    }
    Ok(())
}
