/// Sender: listens, accepts one receiver, checks its code, streams the batch.
///
/// Flow:
///   1. Accept exactly one TCP connection, then drop the listener
///   2. Read the 4-byte security code; close on mismatch
///   3. Write the file count, then per file: name length, name, size, body
///   4. Flush at every file boundary
///   5. Wait for the receiver's 0x01 acknowledgment → DONE

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::batch::{Batch, OutgoingFile, SecurityCode};
use crate::config::TransferConfig;
use crate::error::{ErrorKind, Result, TransferError};
use crate::events::{Role, SenderState, SessionState, TransferSummary};
use crate::net;
use crate::protocol::{encode, Frame, FrameReader};
use crate::stats::{ThroughputSample, ThroughputTracker};
use crate::worker::{AbortSignal, EventSink};

/// Everything one send session needs.
pub struct SendConfig {
    pub transfer: TransferConfig,
    pub code: SecurityCode,
    pub batch: Batch,
}

/// Run the sender on an already-bound listener. Blocks until the session ends.
pub fn run_sender(
    config: SendConfig,
    listener: TcpListener,
    events: &EventSink,
    abort: &AbortSignal,
) -> Result<TransferSummary> {
    let result = send_session(&config, listener, events, abort);
    abort.detach();
    match result {
        Err(e) if abort.is_cancelled() && e.kind() != ErrorKind::Cancelled => {
            debug!("sender error after cancel: {}", e);
            Err(TransferError::Cancelled)
        }
        other => other,
    }
}

fn send_session(
    config: &SendConfig,
    listener: TcpListener,
    events: &EventSink,
    abort: &AbortSignal,
) -> Result<TransferSummary> {
    let t = &config.transfer;
    let state = |s| events.state(SessionState::Sender(s));

    state(SenderState::Listening);
    let (stream, peer) = accept_one(listener, t.accept_poll_interval, abort)?;
    info!("receiver connected from {}", peer);
    state(SenderState::Connected);

    abort.attach(&stream)?;
    net::tune_stream(&stream, t.socket_buffer_size);
    net::set_timeouts(&stream, t.read_timeout, t.write_timeout)?;
    let start = Instant::now();

    state(SenderState::Authenticating);
    let mut reader = FrameReader::new(&stream, 16);
    let presented = reader.read_code()?;
    if !config.code.matches(presented) {
        warn!("rejected receiver {}: wrong security code", peer);
        let _ = stream.shutdown(Shutdown::Both);
        return Err(TransferError::AuthenticationFailed);
    }
    info!("receiver {} authenticated", peer);

    let files = config.batch.files();
    let count = files.len();
    let mut writer = BufWriter::with_capacity(t.chunk_size, &stream);
    write_frame(&mut writer, &Frame::FileCount(count as i32), "file count")?;

    let mut tracker = ThroughputTracker::new(t.progress_interval);
    let mut chunk = vec![0u8; t.chunk_size];

    for (i, file) in files.iter().enumerate() {
        abort.check()?;
        state(SenderState::SendingMetadata(i));
        debug!("sending {} ({} bytes)", file.name, file.size);
        write_frame(
            &mut writer,
            &Frame::FileHeader {
                name: &file.name,
                size: file.size as i64,
            },
            "file header",
        )?;

        state(SenderState::SendingBody(i));
        tracker.start_file(file.size);
        send_body(&mut writer, file, &mut chunk, &mut tracker, abort, |sample| {
            events.progress(i, count, &file.name, sample)
        })?;
        writer
            .flush()
            .map_err(|e| TransferError::from_write("file body", e))?;
        events.progress(i, count, &file.name, tracker.finish_file());
    }
    drop(writer);

    state(SenderState::AwaitingAck);
    stream
        .set_read_timeout(Some(t.ack_timeout))
        .map_err(|e| TransferError::io("set ack timeout", e))?;
    reader.read_ack().map_err(|e| match e.kind() {
        ErrorKind::InvalidFrame => e,
        _ => TransferError::AckTimeout(e.to_string()),
    })?;

    state(SenderState::Done);
    let _ = stream.shutdown(Shutdown::Both);
    Ok(TransferSummary::new(
        Role::Sender,
        peer,
        count,
        config.batch.total_bytes(),
        start.elapsed(),
    ))
}

/// Wait for one connection, polling so cancellation is noticed. The listener is
/// consumed: no second receiver can connect to this session.
fn accept_one(
    listener: TcpListener,
    poll: Duration,
    abort: &AbortSignal,
) -> Result<(TcpStream, SocketAddr)> {
    listener
        .set_nonblocking(true)
        .map_err(|e| TransferError::io("listener non-blocking", e))?;
    loop {
        abort.check()?;
        match listener.accept() {
            Ok((stream, peer)) => {
                stream
                    .set_nonblocking(false)
                    .map_err(|e| TransferError::io("accepted socket blocking", e))?;
                return Ok((stream, peer));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(poll),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(TransferError::io("accept", e)),
        }
    }
}

fn write_frame<W: Write>(writer: &mut W, frame: &Frame<'_>, what: &'static str) -> Result<()> {
    let bytes = encode(frame)?;
    writer
        .write_all(&bytes)
        .map_err(|e| TransferError::from_write(what, e))
}

/// Stream exactly `file.size` bytes. A source that ends early fails the session
/// rather than desynchronizing the receiver; extra bytes are ignored.
fn send_body<W, F>(
    writer: &mut W,
    file: &OutgoingFile,
    chunk: &mut [u8],
    tracker: &mut ThroughputTracker,
    abort: &AbortSignal,
    mut on_sample: F,
) -> Result<()>
where
    W: Write,
    F: FnMut(ThroughputSample),
{
    let source = File::open(&file.path)
        .map_err(|e| TransferError::io(format!("open {}", file.path.display()), e))?;
    let mut source = source.take(file.size);
    let mut remaining = file.size;

    while remaining > 0 {
        abort.check()?;
        let n = match source.read(chunk) {
            Ok(0) => {
                return Err(TransferError::io(
                    format!("read {}", file.path.display()),
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("file shrank: {} of {} bytes missing", remaining, file.size),
                    ),
                ));
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(TransferError::io(format!("read {}", file.path.display()), e));
            }
        };
        writer
            .write_all(&chunk[..n])
            .map_err(|e| TransferError::from_write("file body", e))?;
        remaining -= n as u64;
        if let Some(sample) = tracker.record(n as u64) {
            on_sample(sample);
        }
    }
    Ok(())
}
