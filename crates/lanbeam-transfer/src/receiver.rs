/// Receiver: connects, presents the code, writes each incoming file to disk.
///
/// Flow:
///   1. Connect to the sender with a bounded timeout
///   2. Write the 4-byte security code without waiting for a reply
///   3. Read the file count (a close here means the code was rejected)
///   4. Per file: name length, name, size, then the body in bounded chunks,
///      written to the destination as they arrive
///   5. fsync each file; after the last one write the 0x01 acknowledgment → DONE

use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::batch::SecurityCode;
use crate::config::TransferConfig;
use crate::error::{ErrorKind, Result, TransferError};
use crate::events::{ReceiverState, Role, SessionState, TransferSummary};
use crate::net;
use crate::protocol::{encode, Frame, FrameReader};
use crate::stats::{ThroughputSample, ThroughputTracker};
use crate::worker::{AbortSignal, EventSink};

/// Receiver configuration.
pub struct RecvConfig {
    pub transfer: TransferConfig,
    /// `host` or `host:port` as typed by the user.
    pub peer: String,
    pub code: SecurityCode,
    pub dest_dir: PathBuf,
}

/// Run the receiver. Blocks until the session ends.
pub fn run_receiver(
    config: RecvConfig,
    events: &EventSink,
    abort: &AbortSignal,
) -> Result<TransferSummary> {
    let result = receive_session(&config, events, abort);
    abort.detach();
    match result {
        Err(e) if abort.is_cancelled() && e.kind() != ErrorKind::Cancelled => {
            debug!("receiver error after cancel: {}", e);
            Err(TransferError::Cancelled)
        }
        other => other,
    }
}

fn receive_session(
    config: &RecvConfig,
    events: &EventSink,
    abort: &AbortSignal,
) -> Result<TransferSummary> {
    let t = &config.transfer;
    let state = |s| events.state(SessionState::Receiver(s));

    state(ReceiverState::Connecting);
    let addr = net::resolve_peer(&config.peer, t.port)?;
    abort.check()?;
    let stream = net::connect(addr, t.connect_timeout)?;
    info!("connected to sender {}", addr);
    abort.attach(&stream)?;
    net::tune_stream(&stream, t.socket_buffer_size);
    net::set_timeouts(&stream, t.read_timeout, t.write_timeout)?;
    let start = Instant::now();

    let code = encode(&Frame::Code(config.code.to_wire()))?;
    (&stream)
        .write_all(&code)
        .and_then(|_| (&stream).flush())
        .map_err(|e| TransferError::from_write("security code", e))?;
    state(ReceiverState::Authenticated);

    let mut reader = FrameReader::new(&stream, t.chunk_size);
    let count = match reader.read_file_count(t.max_file_count) {
        // the sender closes without a word when the code is wrong
        Err(TransferError::StreamClosed(_)) => return Err(TransferError::AuthenticationFailed),
        other => other? as usize,
    };
    info!("sender {} announced {} file(s)", addr, count);

    fs::create_dir_all(&config.dest_dir).map_err(|e| {
        TransferError::io(format!("create {}", config.dest_dir.display()), e)
    })?;

    let mut tracker = ThroughputTracker::new(t.progress_interval);
    let mut total_bytes = 0u64;

    for i in 0..count {
        abort.check()?;
        state(ReceiverState::ReadingHeader(i));
        let header = reader.read_file_header()?;
        let path = config.dest_dir.join(&header.name);
        debug!("receiving {} ({} bytes) into {}", header.name, header.size, path.display());

        state(ReceiverState::ReceivingBody(i));
        tracker.start_file(header.size);
        let received = receive_body(
            &mut reader,
            &path,
            header.size,
            t.chunk_size,
            &mut tracker,
            abort,
            |sample| events.progress(i, count, &header.name, sample),
        );
        if let Err(e) = received {
            discard_partial(&path, t.keep_partial_files);
            return Err(e);
        }
        events.progress(i, count, &header.name, tracker.finish_file());
        total_bytes += header.size;
    }

    state(ReceiverState::Acknowledging);
    let ack = encode(&Frame::Ack)?;
    (&stream)
        .write_all(&ack)
        .and_then(|_| (&stream).flush())
        .map_err(|e| TransferError::from_write("acknowledgment", e))?;
    // FIN after the ack byte; the sender closes its side once it has read it
    let _ = stream.shutdown(Shutdown::Write);

    state(ReceiverState::Done);
    Ok(TransferSummary::new(
        Role::Receiver,
        addr,
        count,
        total_bytes,
        start.elapsed(),
    ))
}

/// Create (or truncate) `path` and fill it with exactly `size` bytes from the
/// stream, one chunk at a time. The file is synced before returning.
fn receive_body<R, F>(
    reader: &mut FrameReader<R>,
    path: &Path,
    size: u64,
    chunk_size: usize,
    tracker: &mut ThroughputTracker,
    abort: &AbortSignal,
    mut on_sample: F,
) -> Result<()>
where
    R: Read,
    F: FnMut(ThroughputSample),
{
    let mut file = File::create(path)
        .map_err(|e| TransferError::io(format!("create {}", path.display()), e))?;
    let mut remaining = size;

    while remaining > 0 {
        abort.check()?;
        let want = remaining.min(chunk_size as u64) as usize;
        let chunk = reader.read_chunk(want, "file body")?;
        file.write_all(&chunk)
            .map_err(|e| TransferError::io(format!("write {}", path.display()), e))?;
        remaining -= chunk.len() as u64;
        if let Some(sample) = tracker.record(chunk.len() as u64) {
            on_sample(sample);
        }
    }

    file.sync_all()
        .map_err(|e| TransferError::io(format!("sync {}", path.display()), e))
}

/// Remove the file that was being written when the session failed.
fn discard_partial(path: &Path, keep: bool) {
    if keep {
        warn!("keeping partial file {}", path.display());
        return;
    }
    match fs::remove_file(path) {
        Ok(()) => debug!("removed partial file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("cannot remove partial file {}: {}", path.display(), e),
    }
}
