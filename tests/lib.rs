// SPDX-License-Identifier: MIT OR Apache-2.0
//! End-to-end loopback scenarios driving both roles of the engine
//! against each other.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, UNIX_EPOCH};
use zmodem_engine::header::Parsed;
use zmodem_engine::{
    subpacket, Config, Encoding, EscapeMap, EventSink, FileSpec, Frame, Header, Session, State,
    Tag, Terminator,
};

const CAN: u8 = 0x18;

/// Drives both sessions until each reports a terminal state and the
/// wires are drained.
fn pump(sender: &mut Session, receiver: &mut Session) {
    pump_with(sender, receiver, |_| {});
}

/// Same as [`pump`], with a hook mangling each sender-to-receiver
/// chunk.
fn pump_with<F: FnMut(&mut Vec<u8>)>(sender: &mut Session, receiver: &mut Session, mut mangle: F) {
    let mut to_receiver: Vec<u8> = Vec::new();
    let mut to_sender: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    for _ in 0..10_000 {
        let step = sender.step(&to_sender, &mut buf);
        to_sender.clear();
        let mut chunk = buf[..step.produced].to_vec();
        mangle(&mut chunk);
        to_receiver.extend_from_slice(&chunk);

        let step = receiver.step(&to_receiver, &mut buf);
        to_receiver.clear();
        to_sender.extend_from_slice(&buf[..step.produced]);

        let sender_done = matches!(sender.state(), State::Complete | State::Aborted);
        let receiver_done = matches!(receiver.state(), State::Complete | State::Aborted);
        if sender_done && receiver_done && to_sender.is_empty() && to_receiver.is_empty() {
            return;
        }
    }
    panic!(
        "transfer stalled: sender {:?}, receiver {:?}",
        sender.state(),
        receiver.state()
    );
}

/// Payload whose bytes never collide with protocol bytes, so injected
/// corruption stays deterministic.
fn clean_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| 0x60 + (i % 0x1f) as u8).collect()
}

/// Payload covering the whole byte range, exercising the escaper.
fn noisy_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 3) as u8).collect()
}

fn stage_file(dir: &Path, name: &str, data: &[u8]) -> FileSpec {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    FileSpec::from_path(path).unwrap()
}

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<(Tag, String)>>>);

impl Capture {
    fn tags(&self) -> Vec<Tag> {
        self.0.lock().unwrap().iter().map(|(tag, _)| *tag).collect()
    }
}

impl EventSink for Capture {
    fn event(&mut self, tag: Tag, message: &str) {
        self.0.lock().unwrap().push((tag, message.to_string()));
    }
}

#[test]
fn sends_and_receives_a_single_file() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let data = noisy_payload(3072);
    let spec = stage_file(src.path(), "a.bin", &data);
    let mtime = spec.mtime;
    let events = Capture::default();

    let mut sender = Session::send(vec![spec], Config::default()).unwrap();
    let mut receiver = Session::receive(dst.path(), Config::default())
        .unwrap()
        .with_event_sink(Box::new(events.clone()));
    pump(&mut sender, &mut receiver);

    assert_eq!(sender.state(), State::Complete);
    assert_eq!(receiver.state(), State::Complete);
    let received = dst.path().join("a.bin");
    assert_eq!(std::fs::read(&received).unwrap(), data);
    let received_mtime = std::fs::metadata(&received)
        .unwrap()
        .modified()
        .unwrap()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    assert_eq!(received_mtime, mtime);
    assert_eq!(receiver.stats().errors, 0);
    assert_eq!(receiver.stats().file_bytes, 3072);

    let tags = events.tags();
    assert!(tags.contains(&Tag::FileStart));
    assert!(tags.contains(&Tag::FileEnd));
    assert!(tags.contains(&Tag::SessionEnd));

    // A finished session is inert.
    let mut buf = [0u8; 64];
    let step = sender.step(&[], &mut buf);
    assert_eq!((step.consumed, step.produced), (0, 0));
    let step = receiver.step(b"noise", &mut buf);
    assert_eq!((step.consumed, step.produced), (0, 0));
}

#[test]
fn sends_a_batch_including_an_empty_file() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let first = noisy_payload(2048);
    let tail = noisy_payload(100);
    let specs = vec![
        stage_file(src.path(), "first.bin", &first),
        stage_file(src.path(), "empty.bin", &[]),
        stage_file(src.path(), "tail.bin", &tail),
    ];

    let mut sender = Session::send(specs, Config::default()).unwrap();
    let mut receiver = Session::receive(dst.path(), Config::default()).unwrap();
    pump(&mut sender, &mut receiver);

    assert_eq!(sender.state(), State::Complete);
    assert_eq!(receiver.state(), State::Complete);
    assert_eq!(std::fs::read(dst.path().join("first.bin")).unwrap(), first);
    assert_eq!(std::fs::read(dst.path().join("empty.bin")).unwrap(), b"");
    assert_eq!(std::fs::read(dst.path().join("tail.bin")).unwrap(), tail);
    assert_eq!(receiver.stats().batch_done, 2148);
}

#[test]
fn streams_a_large_file_across_windows() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let data = noisy_payload(100_000);
    let spec = stage_file(src.path(), "big.bin", &data);

    let mut sender = Session::send(vec![spec], Config::default()).unwrap();
    let mut receiver = Session::receive(dst.path(), Config::default()).unwrap();
    pump(&mut sender, &mut receiver);

    assert_eq!(std::fs::read(dst.path().join("big.bin")).unwrap(), data);
    // A clean run never downgrades the block size.
    assert_eq!(sender.stats().block_size, 1024);
    assert_eq!(receiver.stats().errors, 0);
}

#[test]
fn resumes_a_partial_download() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let data = noisy_payload(3072);
    let spec = stage_file(src.path(), "a.bin", &data);
    std::fs::write(dst.path().join("a.bin"), &data[..2048]).unwrap();

    let mut sender = Session::send(vec![spec], Config::default()).unwrap();
    let mut receiver = Session::receive(dst.path(), Config::default()).unwrap();
    pump(&mut sender, &mut receiver);

    assert_eq!(sender.state(), State::Complete);
    assert_eq!(std::fs::read(dst.path().join("a.bin")).unwrap(), data);
    assert!(!dst.path().join("a.bin.0000").exists());
    assert_eq!(receiver.stats().errors, 0);
}

#[test]
fn skips_an_identical_file() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let data = noisy_payload(3072);
    let spec = stage_file(src.path(), "a.bin", &data);
    std::fs::write(dst.path().join("a.bin"), &data).unwrap();
    let events = Capture::default();

    let mut sender = Session::send(vec![spec], Config::default())
        .unwrap()
        .with_event_sink(Box::new(events.clone()));
    let mut receiver = Session::receive(dst.path(), Config::default()).unwrap();
    pump(&mut sender, &mut receiver);

    assert_eq!(sender.state(), State::Complete);
    assert_eq!(receiver.state(), State::Complete);
    assert_eq!(std::fs::read(dst.path().join("a.bin")).unwrap(), data);
    assert!(!dst.path().join("a.bin.0000").exists());
    assert!(events.tags().contains(&Tag::FileSkip));
}

#[test]
fn diverts_to_a_numbered_sibling_on_content_mismatch() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let data = noisy_payload(3072);
    let other = clean_payload(3072);
    let spec = stage_file(src.path(), "a.bin", &data);
    std::fs::write(dst.path().join("a.bin"), &other).unwrap();

    let mut sender = Session::send(vec![spec], Config::default()).unwrap();
    let mut receiver = Session::receive(dst.path(), Config::default()).unwrap();
    pump(&mut sender, &mut receiver);

    // The colliding file is untouched; the transfer landed next to it.
    assert_eq!(std::fs::read(dst.path().join("a.bin")).unwrap(), other);
    assert_eq!(std::fs::read(dst.path().join("a.bin.0000")).unwrap(), data);
}

#[test]
fn treats_a_longer_on_disk_file_as_new() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let data = noisy_payload(3072);
    let longer = clean_payload(4096);
    let spec = stage_file(src.path(), "a.bin", &data);
    std::fs::write(dst.path().join("a.bin"), &longer).unwrap();

    let mut sender = Session::send(vec![spec], Config::default()).unwrap();
    let mut receiver = Session::receive(dst.path(), Config::default()).unwrap();
    pump(&mut sender, &mut receiver);

    assert_eq!(std::fs::read(dst.path().join("a.bin")).unwrap(), longer);
    assert_eq!(std::fs::read(dst.path().join("a.bin.0000")).unwrap(), data);
}

#[test]
fn recovers_from_a_corrupted_subpacket() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let data = clean_payload(3072);
    let spec = stage_file(src.path(), "a.bin", &data);

    let mut sender = Session::send(vec![spec], Config::default()).unwrap();
    let mut receiver = Session::receive(dst.path(), Config::default()).unwrap();
    let mut flipped = false;
    pump_with(&mut sender, &mut receiver, |chunk| {
        // One bit flip inside the second data subpacket of the burst.
        if !flipped && chunk.len() > 2500 {
            chunk[1500] ^= 0x01;
            flipped = true;
        }
    });

    assert!(flipped);
    assert_eq!(sender.state(), State::Complete);
    assert_eq!(receiver.state(), State::Complete);
    assert_eq!(std::fs::read(dst.path().join("a.bin")).unwrap(), data);
    // The error halved the block size and it never recovered within
    // this short file; both sides observe the downgrade.
    assert_eq!(sender.stats().block_size, 512);
    assert_eq!(receiver.stats().block_size, 512);
    assert_eq!(sender.stats().errors, 1);
    assert_eq!(receiver.stats().errors, 1);
}

#[test]
fn a_can_run_aborts_within_one_step() {
    let src = tempfile::tempdir().unwrap();
    let data = noisy_payload(3072);
    let spec = stage_file(src.path(), "a.bin", &data);

    let mut sender = Session::send(vec![spec], Config::default()).unwrap();
    let mut buf = [0u8; 4096];
    sender.step(&[], &mut buf);
    let step = sender.step(&[CAN; 4], &mut buf);
    assert_eq!(step.state, State::Aborted);
    assert_eq!(sender.stats().message, "TRANSFER CANCELLED BY RECEIVER");
}

#[test]
fn aborts_after_consecutive_timeouts() {
    let src = tempfile::tempdir().unwrap();
    let data = noisy_payload(128);
    let spec = stage_file(src.path(), "a.bin", &data);
    let cfg = Config {
        timeout: Duration::from_millis(1),
        ..Config::default()
    };

    let mut sender = Session::send(vec![spec], cfg).unwrap();
    let mut buf = [0u8; 4096];
    for _ in 0..20 {
        let step = sender.step(&[], &mut buf);
        if step.state == State::Aborted {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(sender.state(), State::Aborted);
    assert_eq!(
        sender.stats().message,
        "TOO MANY TIMEOUTS, TRANSFER CANCELLED"
    );
}

#[test]
fn stop_without_save_discards_the_partial_file() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let data = noisy_payload(200_000);
    let spec = stage_file(src.path(), "big.bin", &data);

    let mut sender = Session::send(vec![spec], Config::default()).unwrap();
    let mut receiver = Session::receive(dst.path(), Config::default()).unwrap();
    let mut to_receiver: Vec<u8> = Vec::new();
    let mut to_sender: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    for _ in 0..4 {
        let step = sender.step(&to_sender, &mut buf);
        to_sender.clear();
        to_receiver.extend_from_slice(&buf[..step.produced]);
        let step = receiver.step(&to_receiver, &mut buf);
        to_receiver.clear();
        to_sender.extend_from_slice(&buf[..step.produced]);
    }
    let partial = dst.path().join("big.bin");
    assert!(partial.exists());

    receiver.stop(false);
    assert!(!partial.exists());
    assert_eq!(receiver.state(), State::Aborted);

    // The queued CAN run still drains and kills the sender.
    let step = receiver.step(&[], &mut buf);
    assert!(step.produced >= 4);
    let can_run = buf[..step.produced].to_vec();
    let step = sender.step(&can_run, &mut buf);
    assert_eq!(step.state, State::Aborted);
    assert_eq!(sender.stats().message, "TRANSFER CANCELLED BY RECEIVER");
}

#[test]
fn refuses_zcommand_with_zcompl() {
    let dst = tempfile::tempdir().unwrap();
    let mut receiver = Session::receive(dst.path(), Config::default()).unwrap();
    let mut buf = [0u8; 4096];
    receiver.step(&[], &mut buf);

    let map = EscapeMap::new(false, false);
    let mut wire = Vec::new();
    Header::with_arg(Encoding::ZBIN32, Frame::ZCOMMAND, 0).encode(&mut wire, &map);
    subpacket::encode(&mut wire, b"echo owned\0", Terminator::ZCRCW, true, &map);

    let step = receiver.step(&wire, &mut buf);
    match Header::parse(&buf[..step.produced]) {
        Parsed::Frame { header, .. } => {
            assert_eq!(header.frame(), Frame::ZCOMPL);
            assert_eq!(header.arg(), 1);
        }
        other => panic!("expected a ZCOMPL answer, got {other:?}"),
    }
    assert_eq!(receiver.state(), State::Transferring);
}

#[test]
fn demands_control_escaping_through_zsinit() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let data = noisy_payload(3072);
    let spec = stage_file(src.path(), "a.bin", &data);
    // The receiver does not ask for control escaping, so the sender
    // must demand it with ZSINIT before announcing the file.
    let cfg = Config {
        escape_ctrl: false,
        ..Config::default()
    };

    let mut sender = Session::send(vec![spec], Config::default()).unwrap();
    let mut receiver = Session::receive(dst.path(), cfg).unwrap();
    pump(&mut sender, &mut receiver);

    assert_eq!(sender.state(), State::Complete);
    assert_eq!(receiver.state(), State::Complete);
    assert_eq!(std::fs::read(dst.path().join("a.bin")).unwrap(), data);
}

#[test]
fn challenge_handshake_completes() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let data = noisy_payload(3072);
    let spec = stage_file(src.path(), "a.bin", &data);
    let cfg = Config {
        zchallenge: true,
        ..Config::default()
    };

    let mut sender = Session::send(vec![spec], Config::default()).unwrap();
    let mut receiver = Session::receive(dst.path(), cfg).unwrap();
    pump(&mut sender, &mut receiver);

    assert_eq!(sender.state(), State::Complete);
    assert_eq!(receiver.state(), State::Complete);
    assert_eq!(std::fs::read(dst.path().join("a.bin")).unwrap(), data);
}

#[test]
fn challenge_mismatch_aborts() {
    let dst = tempfile::tempdir().unwrap();
    let cfg = Config {
        zchallenge: true,
        ..Config::default()
    };
    let mut receiver = Session::receive(dst.path(), cfg).unwrap();
    let mut buf = [0u8; 4096];
    let step = receiver.step(&[], &mut buf);
    let value = match Header::parse(&buf[..step.produced]) {
        Parsed::Frame { header, .. } => {
            assert_eq!(header.frame(), Frame::ZCHALLENGE);
            header.arg()
        }
        other => panic!("expected ZCHALLENGE, got {other:?}"),
    };

    let map = EscapeMap::new(false, false);
    let mut wire = Vec::new();
    Header::with_arg(Encoding::ZHEX, Frame::ZACK, value ^ 1).encode(&mut wire, &map);
    let step = receiver.step(&wire, &mut buf);
    assert_eq!(step.state, State::Aborted);
    assert_eq!(receiver.stats().message, "CHALLENGE MISMATCH");
}
