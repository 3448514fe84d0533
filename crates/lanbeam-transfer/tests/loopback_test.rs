/// Integration tests: run the sender and receiver engines against each other (or
/// against a hand-driven peer) over loopback TCP and check what lands on disk.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use lanbeam_transfer::protocol::{encode, Frame};
use lanbeam_transfer::{
    spawn_receiver, spawn_sender, Batch, ErrorKind, ReceiverState, SecurityCode, SenderState,
    SessionState, TransferConfig, TransferEvent, WorkerHandle,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("lanbeam_transfer=debug")
        .try_init();
}

fn test_config() -> TransferConfig {
    TransferConfig {
        port: 0,
        connect_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_secs(5),
        write_timeout: Duration::from_secs(5),
        ack_timeout: Duration::from_secs(5),
        progress_interval: Duration::from_millis(1),
        ..Default::default()
    }
}

fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| ((i % 251) as u8).wrapping_add(seed)).collect()
}

fn write_inputs(dir: &Path, files: &[(&str, Vec<u8>)]) -> Batch {
    let paths: Vec<PathBuf> = files
        .iter()
        .map(|(name, data)| {
            let p = dir.join(name);
            fs::write(&p, data).unwrap();
            p
        })
        .collect();
    Batch::from_paths(&paths).unwrap()
}

/// Collect events until the terminal one (or panic after `limit`).
fn drain(handle: &WorkerHandle, limit: Duration) -> Vec<TransferEvent> {
    let deadline = Instant::now() + limit;
    let mut events = Vec::new();
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match handle.events().recv_timeout(left) {
            Ok(ev) => {
                let done = ev.is_terminal();
                events.push(ev);
                if done {
                    return events;
                }
            }
            Err(e) => panic!("no terminal event within {:?}: {}; got {:?}", limit, e, events),
        }
    }
}

fn failure_kind(events: &[TransferEvent]) -> Option<ErrorKind> {
    match events.last() {
        Some(TransferEvent::Failed { kind, .. }) => Some(*kind),
        _ => None,
    }
}

fn loopback(addr: SocketAddr) -> String {
    format!("127.0.0.1:{}", addr.port())
}

/// Wait until the worker reports `state`, discarding everything before it.
fn wait_for_state(handle: &WorkerHandle, state: SessionState) {
    loop {
        match handle.events().recv_timeout(Duration::from_secs(10)) {
            Ok(TransferEvent::StateChanged(s)) if s == state => return,
            Ok(ev) if ev.is_terminal() => panic!("ended before {:?}: {:?}", state, ev),
            Ok(_) => {}
            Err(e) => panic!("never reached {:?}: {}", state, e),
        }
    }
}

/// Fake sender that accepts one receiver, writes `prefix` after reading its
/// code, then goes quiet until the receiver hangs up.
fn stalling_sender(prefix: Vec<u8>) -> (SocketAddr, thread::JoinHandle<()>) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let fake = thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        conn.set_read_timeout(Some(Duration::from_secs(30))).unwrap();
        let mut code = [0u8; 4];
        conn.read_exact(&mut code).unwrap();
        conn.write_all(&prefix).unwrap();
        let mut rest = Vec::new();
        let _ = conn.read_to_end(&mut rest);
    });
    (addr, fake)
}

#[test]
fn loopback_batch_roundtrip() {
    init_logging();
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let files = vec![
        ("a.txt", b"hello".to_vec()),
        ("b.bin", Vec::new()),
        ("big.bin", patterned(3 * 1024 * 1024 + 17, 7)),
        ("ünïcødé name.dat", patterned(70_000, 3)),
    ];
    let batch = write_inputs(src.path(), &files);
    let code = SecurityCode::new(424242).unwrap();

    let config = TransferConfig {
        chunk_size: 64 * 1024,
        ..test_config()
    };
    let sender = spawn_sender(config.clone(), batch, code).unwrap();
    let addr = sender.local_addr().unwrap();
    let receiver = spawn_receiver(config, loopback(addr), code, dst.path()).unwrap();

    let recv_events = drain(&receiver, Duration::from_secs(30));
    let send_events = drain(&sender, Duration::from_secs(30));

    for events in [&send_events, &recv_events] {
        match events.last() {
            Some(TransferEvent::Completed(summary)) => {
                assert_eq!(summary.files, 4);
                assert_eq!(summary.total_bytes, files.iter().map(|f| f.1.len() as u64).sum::<u64>());
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    for (name, data) in &files {
        assert_eq!(&fs::read(dst.path().join(name)).unwrap(), data, "{name}");
    }

    // Per file: fractions never go down and the last one is 1.0.
    for events in [&send_events, &recv_events] {
        let mut per_file: HashMap<usize, Vec<f64>> = HashMap::new();
        let mut order = Vec::new();
        for ev in events {
            if let TransferEvent::Progress(p) = ev {
                if order.last() != Some(&p.file_index) {
                    order.push(p.file_index);
                }
                per_file.entry(p.file_index).or_default().push(p.fraction);
                assert_eq!(p.file_count, 4);
            }
        }
        assert_eq!(order, vec![0, 1, 2, 3], "files reported out of order");
        for (index, fractions) in &per_file {
            assert!(fractions.windows(2).all(|w| w[0] <= w[1]), "file {index}: {fractions:?}");
            assert_eq!(*fractions.last().unwrap(), 1.0, "file {index}");
        }
    }

    // Sender walks its state machine in order and ends in Done.
    let states: Vec<SessionState> = send_events
        .iter()
        .filter_map(|e| match e {
            TransferEvent::StateChanged(s) => Some(*s),
            _ => None,
        })
        .collect();
    assert_eq!(states.first(), Some(&SessionState::Sender(SenderState::Listening)));
    assert!(states.contains(&SessionState::Sender(SenderState::SendingBody(2))));
    assert_eq!(states.last(), Some(&SessionState::Sender(SenderState::Done)));

    sender.join();
    receiver.join();
}

#[test]
fn wrong_code_is_rejected_without_data() {
    init_logging();
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let dest = dst.path().join("incoming");
    let batch = write_inputs(src.path(), &[("secret.txt", b"top secret".to_vec())]);

    let sender = spawn_sender(test_config(), batch, SecurityCode::new(111111).unwrap()).unwrap();
    let addr = sender.local_addr().unwrap();
    let receiver = spawn_receiver(
        test_config(),
        loopback(addr),
        SecurityCode::new(222222).unwrap(),
        &dest,
    )
    .unwrap();

    assert_eq!(
        failure_kind(&drain(&sender, Duration::from_secs(10))),
        Some(ErrorKind::AuthenticationFailed)
    );
    assert_eq!(
        failure_kind(&drain(&receiver, Duration::from_secs(10))),
        Some(ErrorKind::AuthenticationFailed)
    );
    assert!(!dest.join("secret.txt").exists());
}

#[test]
fn wire_trace_matches_layout() {
    init_logging();
    let src = tempfile::tempdir().unwrap();
    let batch = write_inputs(src.path(), &[("a.txt", b"hello".to_vec()), ("b.bin", Vec::new())]);
    let code = SecurityCode::new(654321).unwrap();
    let sender = spawn_sender(test_config(), batch, code).unwrap();
    let addr = sender.local_addr().unwrap();

    let mut peer = TcpStream::connect(loopback(addr)).unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    peer.write_all(&654321i32.to_be_bytes()).unwrap();

    let mut expected = Vec::new();
    expected.extend_from_slice(&[0, 0, 0, 2]);
    expected.extend_from_slice(&[0, 5]);
    expected.extend_from_slice(b"a.txt");
    expected.extend_from_slice(&5i64.to_be_bytes());
    expected.extend_from_slice(b"hello");
    expected.extend_from_slice(&[0, 5]);
    expected.extend_from_slice(b"b.bin");
    expected.extend_from_slice(&0i64.to_be_bytes());

    let mut got = vec![0u8; expected.len()];
    peer.read_exact(&mut got).unwrap();
    assert_eq!(got, expected);

    peer.write_all(&[0x01]).unwrap();
    let events = drain(&sender, Duration::from_secs(10));
    assert!(matches!(events.last(), Some(TransferEvent::Completed(_))));
}

#[test]
fn premature_close_fails_receiver_without_ack() {
    init_logging();
    let dst = tempfile::tempdir().unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    // Fake sender: announces two files but hangs up three bytes into the first.
    let fake = thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        conn.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let mut code = [0u8; 4];
        conn.read_exact(&mut code).unwrap();
        conn.write_all(&encode(&Frame::FileCount(2)).unwrap()).unwrap();
        conn.write_all(&encode(&Frame::FileHeader { name: "a.txt", size: 10 }).unwrap())
            .unwrap();
        conn.write_all(b"abc").unwrap();
        conn.shutdown(std::net::Shutdown::Write).unwrap();

        let mut rest = Vec::new();
        let _ = conn.read_to_end(&mut rest);
        rest
    });

    let receiver = spawn_receiver(
        test_config(),
        loopback(addr),
        SecurityCode::new(123456).unwrap(),
        dst.path(),
    )
    .unwrap();

    let events = drain(&receiver, Duration::from_secs(10));
    assert_eq!(failure_kind(&events), Some(ErrorKind::StreamClosedPrematurely));
    drop(receiver);

    let after_count = fake.join().unwrap();
    assert!(!after_count.contains(&0x01), "receiver acknowledged a broken transfer");
    assert!(!dst.path().join("a.txt").exists(), "partial file left behind");
}

#[test]
fn silent_receiver_triggers_ack_timeout() {
    init_logging();
    let src = tempfile::tempdir().unwrap();
    let batch = write_inputs(src.path(), &[("a.txt", b"hello".to_vec())]);
    let code = SecurityCode::new(500500).unwrap();
    let config = TransferConfig {
        ack_timeout: Duration::from_millis(300),
        ..test_config()
    };
    let sender = spawn_sender(config, batch, code).unwrap();
    let addr = sender.local_addr().unwrap();

    let mut peer = TcpStream::connect(loopback(addr)).unwrap();
    peer.write_all(&code.to_wire().to_be_bytes()).unwrap();

    let events = drain(&sender, Duration::from_secs(10));
    assert_eq!(failure_kind(&events), Some(ErrorKind::AckTimeout));
    drop(peer);
}

#[test]
fn cancel_unblocks_stalled_sender() {
    init_logging();
    let src = tempfile::tempdir().unwrap();
    let batch = write_inputs(src.path(), &[("huge.bin", patterned(32 * 1024 * 1024, 1))]);
    let code = SecurityCode::new(777777).unwrap();
    let config = TransferConfig {
        socket_buffer_size: 64 * 1024,
        write_timeout: Duration::from_secs(60),
        ..test_config()
    };
    let sender = spawn_sender(config, batch, code).unwrap();
    let addr = sender.local_addr().unwrap();

    // Authenticate, then never read: the sender fills the socket buffers and blocks.
    let mut peer = TcpStream::connect(loopback(addr)).unwrap();
    peer.write_all(&code.to_wire().to_be_bytes()).unwrap();

    let started = Instant::now();
    loop {
        match sender.events().recv_timeout(Duration::from_secs(10)) {
            Ok(TransferEvent::StateChanged(SessionState::Sender(SenderState::SendingBody(_)))) => break,
            Ok(_) => {}
            Err(e) => panic!("sender never started the body: {}", e),
        }
    }
    thread::sleep(Duration::from_millis(200));

    sender.cancel();
    let events = drain(&sender, Duration::from_secs(10));
    assert_eq!(failure_kind(&events), Some(ErrorKind::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(20));
    drop(peer);
}

#[test]
fn cancel_unblocks_receiver_waiting_for_count() {
    init_logging();
    let dst = tempfile::tempdir().unwrap();
    let (addr, fake) = stalling_sender(Vec::new());
    let config = TransferConfig {
        read_timeout: Duration::from_secs(60),
        ..test_config()
    };
    let receiver = spawn_receiver(config, loopback(addr), SecurityCode::new(246810).unwrap(), dst.path())
        .unwrap();

    wait_for_state(&receiver, SessionState::Receiver(ReceiverState::Authenticated));
    thread::sleep(Duration::from_millis(200));

    let started = Instant::now();
    receiver.cancel();
    let events = drain(&receiver, Duration::from_secs(10));
    assert_eq!(failure_kind(&events), Some(ErrorKind::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
    fake.join().unwrap();
}

#[test]
fn cancel_mid_body_removes_partial_file() {
    init_logging();
    let dst = tempfile::tempdir().unwrap();
    let mut prefix = encode(&Frame::FileCount(1)).unwrap().to_vec();
    prefix.extend_from_slice(&encode(&Frame::FileHeader { name: "stall.bin", size: 1_000_000 }).unwrap());
    prefix.extend_from_slice(&[7u8; 100]);
    let (addr, fake) = stalling_sender(prefix);
    let config = TransferConfig {
        read_timeout: Duration::from_secs(60),
        ..test_config()
    };
    let receiver = spawn_receiver(config, loopback(addr), SecurityCode::new(135791).unwrap(), dst.path())
        .unwrap();

    wait_for_state(&receiver, SessionState::Receiver(ReceiverState::ReceivingBody(0)));
    let partial = dst.path().join("stall.bin");
    let deadline = Instant::now() + Duration::from_secs(5);
    while !partial.exists() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(partial.exists(), "receiver never created the destination file");
    thread::sleep(Duration::from_millis(200));

    let started = Instant::now();
    receiver.cancel();
    let events = drain(&receiver, Duration::from_secs(10));
    assert_eq!(failure_kind(&events), Some(ErrorKind::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
    assert!(!partial.exists(), "partial file left behind after cancel");
    fake.join().unwrap();
}
