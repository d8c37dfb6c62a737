//! End-to-end upload through a `TerminalSession` against a scripted receiver

use bytes::Bytes;
use sshterm_core::core::protocol::zmodem::{decode_header, decode_subpacket, FrameEnd, FrameType, Header, CAN, ZPAD};
use sshterm_core::{
    BufferSurface, FixedPicker, ProtocolFailure, SessionConfig, SessionEvent, ShellChannel,
    StyleState, TerminalSession, TransferError, TransferEvent, TransferState, TransportError,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::Write;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Plays the `rz` side: decodes everything the client writes and answers
#[derive(Default)]
struct FakeReceiver {
    inbox: VecDeque<Bytes>,
    written: Vec<u8>,
    cursor: usize,
    /// Header of the subpacket we are waiting for
    expecting: Option<Header>,
    headers: Vec<Header>,
    received: Vec<u8>,
    silent: bool,
    /// Next poll reports the channel closed
    hang_up: bool,
    /// Copy of every write, still readable once the session drops the channel
    wire: Rc<RefCell<Vec<u8>>>,
}

impl FakeReceiver {
    fn frames(&self) -> Vec<FrameType> {
        self.headers.iter().map(|h| h.kind).collect()
    }

    fn reply(&mut self, header: Header) {
        if !self.silent {
            self.inbox.push_back(Bytes::from(header.encode_hex()));
        }
    }

    fn parse(&mut self) {
        loop {
            let buf = &self.written[self.cursor..];
            if let Some(header) = self.expecting {
                match decode_subpacket(buf).expect("valid subpacket") {
                    Some((sub, used)) => {
                        self.cursor += used;
                        self.expecting = None;
                        match header.kind {
                            FrameType::File => self.reply(Header::new(FrameType::RPos, 0)),
                            FrameType::Data => {
                                assert_eq!(header.position as usize, self.received.len());
                                self.received.extend_from_slice(&sub.payload);
                                if sub.end == FrameEnd::Wait {
                                    let at = self.received.len() as u32;
                                    self.reply(Header::new(FrameType::Ack, at));
                                }
                            }
                            _ => unreachable!(),
                        }
                    }
                    None => return,
                }
                continue;
            }

            let Some(start) = buf.iter().position(|&b| b == ZPAD) else {
                self.cursor = self.written.len();
                return;
            };
            match decode_header(&buf[start..]) {
                Ok(Some((header, used))) => {
                    self.cursor += start + used;
                    self.headers.push(header);
                    match header.kind {
                        FrameType::File | FrameType::Data => self.expecting = Some(header),
                        FrameType::Eof => self.reply(Header::new(FrameType::RInit, 0)),
                        _ => {}
                    }
                }
                Ok(None) => {
                    self.cursor += start;
                    return;
                }
                Err(_) => self.cursor += start + 1,
            }
        }
    }
}

impl ShellChannel for FakeReceiver {
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.written.extend_from_slice(data);
        self.wire.borrow_mut().extend_from_slice(data);
        self.parse();
        Ok(data.len())
    }

    fn poll(&mut self) -> Result<Option<Bytes>, TransportError> {
        if self.hang_up {
            return Err(TransportError::Disconnected);
        }
        Ok(self.inbox.pop_front())
    }
}

fn rz_start() -> Bytes {
    let mut chunk = b"[alice@box ~]$ rz\r\nrz waiting to receive.".to_vec();
    chunk.extend_from_slice(&Header::new(FrameType::RInit, 0).encode_hex());
    Bytes::from(chunk)
}

fn upload_file(len: usize) -> (tempfile::NamedTempFile, Vec<u8>) {
    let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&data).unwrap();
    (file, data)
}

fn session(receiver: FakeReceiver) -> TerminalSession<FakeReceiver> {
    TerminalSession::new(receiver, StyleState::default(), SessionConfig::default())
}

#[test]
fn upload_completes_and_restores_prompt() {
    let (file, data) = upload_file(5000);
    let mut receiver = FakeReceiver::default();
    receiver.inbox.push_back(rz_start());

    let mut session = session(receiver);
    let mut display = BufferSurface::default();
    let mut picker = FixedPicker(Some(file.path().to_path_buf()));

    let start = Instant::now();
    let mut events = Vec::new();
    for step in 0..300u64 {
        let now = start + Duration::from_millis(10 * step);
        events.extend(session.tick(now, &mut display, &mut picker));
    }

    assert!(display.text().starts_with("[alice@box ~]$ rz\nrz waiting to receive."));
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Transfer(TransferEvent::Finished {
            state: TransferState::Completed,
            error: None
        })
    )));
    assert_eq!(session.transfer_state(), TransferState::Idle);

    let receiver = session.channel().unwrap();
    assert_eq!(receiver.received, data);
    let frames = receiver.frames();
    assert_eq!(frames.first(), Some(&FrameType::File));
    assert_eq!(frames[frames.len() - 2..], [FrameType::Eof, FrameType::Fin]);
    let data_frames = frames.iter().filter(|&&k| k == FrameType::Data).count();
    assert_eq!(data_frames, 5);

    // ZFIN, "OO", two CAN, then the interrupt + newline after the restore delay
    let written = &receiver.written;
    let oo = written.windows(4).position(|w| w == [b'O', b'O', CAN, CAN]).unwrap();
    assert_eq!(&written[oo + 4..], &[0x03, b'\n']);
}

#[test]
fn silent_receiver_times_out_after_retries() {
    let (file, _) = upload_file(100);
    let mut receiver = FakeReceiver {
        silent: true,
        ..FakeReceiver::default()
    };
    receiver.inbox.push_back(rz_start());

    let mut session = session(receiver);
    let mut display = BufferSurface::default();
    let mut picker = FixedPicker(Some(file.path().to_path_buf()));

    let t0 = Instant::now();
    let mut events = session.tick(t0, &mut display, &mut picker);
    assert_eq!(session.transfer_state(), TransferState::HeaderSent);

    for secs in [10, 20] {
        events.extend(session.tick(t0 + Duration::from_secs(secs), &mut display, &mut picker));
        assert_eq!(session.transfer_state(), TransferState::HeaderSent);
    }
    let headers = session.channel().unwrap().headers.len();
    assert_eq!(headers, 3, "ZFILE sent once and resent on each timeout");

    events.extend(session.tick(t0 + Duration::from_secs(30), &mut display, &mut picker));
    assert_eq!(session.transfer_state(), TransferState::Cancelled);
    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Transfer(TransferEvent::Finished {
            state: TransferState::Cancelled,
            error: Some(TransferError::Protocol(ProtocolFailure::Timeout))
        })
    )));

    let before = session.channel().unwrap().written.len();
    session.tick(t0 + Duration::from_secs(31), &mut display, &mut picker);
    let tail = session.channel().unwrap().written[before..].to_vec();
    let mut expected = vec![CAN; 8];
    expected.push(b'\n');
    assert_eq!(tail, expected);
    assert_eq!(session.transfer_state(), TransferState::Idle);
}

#[test]
fn trigger_during_cooldown_only_nudges() {
    let (file, _) = upload_file(100);
    let mut receiver = FakeReceiver {
        silent: true,
        ..FakeReceiver::default()
    };
    receiver.inbox.push_back(rz_start());

    let mut session = session(receiver);
    let mut display = BufferSurface::default();
    let mut picker = FixedPicker(Some(file.path().to_path_buf()));

    let t0 = Instant::now();
    session.tick(t0, &mut display, &mut picker);
    session.interrupt();
    session.tick(t0 + Duration::from_millis(10), &mut display, &mut picker);
    assert_eq!(session.transfer_state(), TransferState::Cancelled);
    session.tick(t0 + Duration::from_secs(1), &mut display, &mut picker);
    assert_eq!(session.transfer_state(), TransferState::Idle);

    let frames = session.channel().unwrap().headers.len();
    let before = session.channel().unwrap().written.len();
    session.channel_mut().unwrap().inbox.push_back(rz_start());
    session.tick(t0 + Duration::from_secs(2), &mut display, &mut picker);

    let receiver = session.channel().unwrap();
    assert_eq!(receiver.headers.len(), frames, "no new ZFILE during cooldown");
    assert_eq!(&receiver.written[before..], &[0x03, b'\n']);
    assert_eq!(session.transfer_state(), TransferState::Idle);
    assert!(!session.is_transferring());
}

#[test]
fn output_after_upload_is_rendered() {
    let (file, _) = upload_file(10);
    let mut receiver = FakeReceiver::default();
    receiver.inbox.push_back(rz_start());

    let mut session = session(receiver);
    let mut display = BufferSurface::default();
    let mut picker = FixedPicker(Some(file.path().to_path_buf()));

    let start = Instant::now();
    for step in 0..150u64 {
        session.tick(start + Duration::from_millis(10 * step), &mut display, &mut picker);
    }
    assert!(!session.is_transferring());

    session
        .channel_mut()
        .unwrap()
        .inbox
        .push_back(Bytes::from_static(b"\x1b[1;32mdone\x1b[0m\r\n[alice@box ~]$ "));
    session.tick(start + Duration::from_secs(5), &mut display, &mut picker);

    assert!(display.text().ends_with("done\n[alice@box ~]$ "));
    assert!(display.runs.iter().any(|r| r.text == "done" && r.bold));
    assert_eq!(session.last_prompt(), Some("[alice@box ~]$"));
}

#[test]
fn empty_file_sends_eof_at_zero() {
    let (file, _) = upload_file(0);
    let mut receiver = FakeReceiver::default();
    receiver.inbox.push_back(rz_start());

    let mut session = session(receiver);
    let mut display = BufferSurface::default();
    let mut picker = FixedPicker(Some(file.path().to_path_buf()));

    let start = Instant::now();
    let mut events = Vec::new();
    for step in 0..20u64 {
        events.extend(session.tick(start + Duration::from_millis(10 * step), &mut display, &mut picker));
    }

    assert!(events.iter().any(|e| matches!(
        e,
        SessionEvent::Transfer(TransferEvent::Finished {
            state: TransferState::Completed,
            error: None
        })
    )));
    let receiver = session.channel().unwrap();
    assert_eq!(receiver.frames(), vec![FrameType::File, FrameType::Eof, FrameType::Fin]);
    assert_eq!(receiver.headers[1].position, 0);
    assert!(receiver.received.is_empty());
}

#[test]
fn hang_up_mid_transfer_resets_silently() {
    let (file, _) = upload_file(100);
    let mut receiver = FakeReceiver {
        silent: true,
        ..FakeReceiver::default()
    };
    receiver.inbox.push_back(rz_start());
    let wire = Rc::clone(&receiver.wire);

    let mut session = session(receiver);
    let mut display = BufferSurface::default();
    let mut picker = FixedPicker(Some(file.path().to_path_buf()));

    let t0 = Instant::now();
    session.tick(t0, &mut display, &mut picker);
    assert_eq!(session.transfer_state(), TransferState::HeaderSent);
    assert!(session.is_transferring());
    let before = wire.borrow().len();

    // A pending cancel must not turn into a cancel run on a dead channel
    session.interrupt();
    session.channel_mut().unwrap().hang_up = true;
    let events = session.tick(t0 + Duration::from_millis(10), &mut display, &mut picker);

    assert!(matches!(events.last(), Some(SessionEvent::Disconnected(None))));
    assert!(!events.iter().any(|e| matches!(e, SessionEvent::Transfer(TransferEvent::Finished { .. }))));
    assert_eq!(session.transfer_state(), TransferState::Idle);
    assert!(!session.is_transferring());
    assert!(display.text().ends_with("Disconnected from server.\n"));

    session.tick(t0 + Duration::from_secs(5), &mut display, &mut picker);
    assert_eq!(wire.borrow().len(), before, "nothing written after the hang-up");
    assert!(session.into_channel().is_none());
}

#[test]
fn cancel_run_is_spaced_over_ticks() {
    let (file, _) = upload_file(100);
    let mut receiver = FakeReceiver {
        silent: true,
        ..FakeReceiver::default()
    };
    receiver.inbox.push_back(rz_start());

    let mut session = session(receiver);
    let mut display = BufferSurface::default();
    let mut picker = FixedPicker(Some(file.path().to_path_buf()));

    let t0 = Instant::now();
    session.tick(t0, &mut display, &mut picker);
    let before = session.channel().unwrap().written.len();

    // Cancel is acted on at t0 + 5ms; byte k is due 10ms * k later
    session.interrupt();
    let cancelled_at = t0 + Duration::from_millis(5);
    session.tick(cancelled_at, &mut display, &mut picker);
    assert_eq!(session.transfer_state(), TransferState::Cancelled);

    let mut released = Vec::new();
    for k in 0..8u64 {
        session.tick(cancelled_at + Duration::from_millis(10 * k + 1), &mut display, &mut picker);
        let written = &session.channel().unwrap().written[before..];
        released.push(written.iter().filter(|&&b| b == CAN).count());
    }
    assert_eq!(released, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    assert!(!session.channel().unwrap().written.ends_with(b"\n"));

    // Newline follows the resync delay after the last CAN
    session.tick(cancelled_at + Duration::from_millis(80 + 500), &mut display, &mut picker);
    let written = &session.channel().unwrap().written[before..];
    let mut expected = vec![CAN; 8];
    expected.push(b'\n');
    assert_eq!(written, &expected[..]);
}
