//! ZMODEM sender state machine
//!
//! Single-entry-point engine advanced by [`ZmodemSender::tick`]. Nothing
//! here blocks or sleeps: outgoing bytes wait in an outbox until the channel
//! accepts them, and delayed writes (cancel spacing, prompt restore) sit in a
//! deferred queue released once their due time passes.
//!
//! ```text
//! Idle -> Detected -> AwaitingFileChoice -> HeaderSent -> SendingData -> EofSent
//!                                                                          |
//!                              Idle <- Completed | Cancelled | Failed <----+
//! ```

use super::{
    FilePicker, ProtocolFailure, TransferConfig, TransferError, TransferEvent, TransferJob,
    TransferState,
};
use crate::core::protocol::zmodem::{self, FrameEnd, FrameType, Header, HeaderScanner, CAN, ZCBIN};
use crate::core::transport::{ShellChannel, TransportError};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Instant;

/// Ctrl-C
const INTERRUPT: u8 = 0x03;

/// Consecutive CAN bytes from the receiver that mean "abort"
const REMOTE_CANCEL_RUN: usize = 3;

/// Most data subpackets queued in one tick
const PUMP_BUDGET: usize = 64;

/// Bytes released to the outbox once `due` has passed
#[derive(Debug)]
struct Deferred {
    due: Instant,
    bytes: Vec<u8>,
}

/// ZMODEM upload engine
#[derive(Debug)]
pub struct ZmodemSender {
    config: TransferConfig,
    state: TransferState,
    job: Option<TransferJob>,
    outbox: Vec<u8>,
    deferred: Vec<Deferred>,
    watchdog: Option<Instant>,
    eof_deadline: Option<Instant>,
    cooldown_until: Option<Instant>,
    remote_can_run: usize,
    packets_sent: u64,
    scanner: HeaderScanner,
    events: Vec<TransferEvent>,
}

impl ZmodemSender {
    /// Create an idle engine
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            state: TransferState::Idle,
            job: None,
            outbox: Vec::new(),
            deferred: Vec::new(),
            watchdog: None,
            eof_deadline: None,
            cooldown_until: None,
            remote_can_run: 0,
            packets_sent: 0,
            scanner: HeaderScanner::default(),
            events: Vec::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Job in progress, if any
    pub fn job(&self) -> Option<&TransferJob> {
        self.job.as_ref()
    }

    /// Engine configuration
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Watchdog deadline; set exactly while waiting on the receiver
    pub fn watchdog(&self) -> Option<Instant> {
        self.watchdog
    }

    /// A transfer ended recently and new triggers should not start another
    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    /// Anything still waiting to be written
    pub fn has_pending_output(&self) -> bool {
        !self.outbox.is_empty() || !self.deferred.is_empty()
    }

    /// Take accumulated events
    pub fn drain_events(&mut self) -> Vec<TransferEvent> {
        std::mem::take(&mut self.events)
    }

    fn set_state(&mut self, next: TransferState, now: Instant) {
        if self.state != next {
            tracing::info!("Transfer state: {} -> {}", self.state, next);
        }
        self.state = next;
        self.watchdog = if next.is_waiting_on_receiver() {
            Some(now + self.config.timeout)
        } else {
            None
        };
        if next != TransferState::EofSent {
            self.eof_deadline = None;
        }
    }

    fn queue(&mut self, bytes: &[u8]) {
        if tracing::enabled!(tracing::Level::TRACE) {
            tracing::trace!("Queue {} bytes: {}", bytes.len(), hex::encode(bytes));
        }
        self.outbox.extend_from_slice(bytes);
    }

    fn defer(&mut self, due: Instant, bytes: Vec<u8>) {
        self.deferred.push(Deferred { due, bytes });
    }

    /// Receiver detected: ask for a file and start sending it
    ///
    /// Does nothing unless the engine is idle. Returns whether a transfer was
    /// started.
    pub fn begin(&mut self, picker: &mut dyn FilePicker, now: Instant) -> bool {
        if self.state != TransferState::Idle {
            tracing::debug!("Ignoring begin while {}", self.state);
            return false;
        }

        self.set_state(TransferState::Detected, now);
        self.set_state(TransferState::AwaitingFileChoice, now);

        match picker.pick_upload() {
            Some(path) => self.start(&path, now) == TransferState::HeaderSent,
            None => {
                tracing::info!("No file chosen, cancelling receiver");
                self.cancel(now, ProtocolFailure::Cancelled);
                false
            }
        }
    }

    /// Open `path` and send the ZFILE frame
    ///
    /// Returns the state reached: `HeaderSent`, or `Failed` when the file
    /// cannot be opened (the receiver is then sent a cancel run).
    pub fn start(&mut self, path: &Path, now: Instant) -> TransferState {
        let job = match TransferJob::open(path, self.config.packet_size) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!("Cannot upload: {}", e);
                self.abort_with(now, TransferState::Failed, e);
                return self.state;
            }
        };

        tracing::info!("Uploading {} ({} bytes)", job.name, job.size);
        self.events.push(TransferEvent::Started {
            name: job.name.clone(),
            size: job.size,
        });
        self.packets_sent = 0;
        self.remote_can_run = 0;
        self.scanner.clear();
        self.job = Some(job);
        self.send_file_header();
        self.set_state(TransferState::HeaderSent, now);
        self.state
    }

    fn send_file_header(&mut self) {
        let Some(job) = self.job.as_ref() else {
            return;
        };
        let info = zmodem::file_info(&job.name, job.size, job.mtime);
        let mut frame = Header::with_flags(FrameType::File, ZCBIN, 0, 0, 0).encode_binary();
        frame.extend_from_slice(&zmodem::encode_subpacket(&info, FrameEnd::Wait));
        self.queue(&frame);
    }

    /// Advance by one unit of work
    ///
    /// Sends the next data subpacket, or ZEOF once the whole file is out.
    /// While the receiver has not yet answered ZFILE (or ZEOF) the pending
    /// header is sent again instead.
    pub fn pump(&mut self, now: Instant) {
        if self.job.as_ref().is_some_and(|j| j.cancel_requested) {
            self.cancel(now, ProtocolFailure::Cancelled);
            return;
        }

        match self.state {
            TransferState::HeaderSent => {
                tracing::debug!("Resending ZFILE");
                self.send_file_header();
            }
            TransferState::SendingData => self.send_next_chunk(now),
            TransferState::EofSent => {
                if let Some(job) = self.job.as_ref() {
                    tracing::debug!("Resending ZEOF");
                    let frame = Header::new(FrameType::Eof, job.offset as u32).encode_binary();
                    self.queue(&frame);
                }
            }
            _ => {}
        }
    }

    fn send_next_chunk(&mut self, now: Instant) {
        let Some(job) = self.job.as_mut() else {
            return;
        };

        if job.offset >= job.size {
            let frame = Header::new(FrameType::Eof, job.offset as u32).encode_binary();
            tracing::debug!("All {} bytes sent, sending ZEOF", job.size);
            self.queue(&frame);
            self.set_state(TransferState::EofSent, now);
            self.eof_deadline = Some(now + self.config.eof_settle);
            return;
        }

        let want = (job.packet_size as u64).min(job.remaining()) as usize;
        let mut chunk = vec![0u8; want];
        let read = job
            .file
            .seek(SeekFrom::Start(job.offset))
            .and_then(|_| job.file.read(&mut chunk));
        let n = match read {
            Ok(0) => {
                // File shrank underneath us; end it here
                tracing::warn!("{} ended early at {}", job.path.display(), job.offset);
                job.size = job.offset;
                return self.send_next_chunk(now);
            }
            Ok(n) => n,
            Err(source) => {
                let reason = TransferError::Io {
                    file: job.path.clone(),
                    source,
                };
                tracing::warn!("Read failed: {}", reason);
                self.abort_with(now, TransferState::Failed, reason);
                return;
            }
        };
        chunk.truncate(n);

        self.packets_sent += 1;
        let last = job.offset + n as u64 >= job.size;
        let ack_interval = u64::from(self.config.ack_interval.max(1));
        let end = if last || self.packets_sent % ack_interval == 0 {
            FrameEnd::Wait
        } else {
            FrameEnd::End
        };

        let mut frame = Header::new(FrameType::Data, job.offset as u32).encode_binary();
        frame.extend_from_slice(&zmodem::encode_subpacket(&chunk, end));
        job.offset += n as u64;
        let (sent, total) = (job.offset, job.size);

        self.queue(&frame);
        self.watchdog = Some(now + self.config.timeout);
        self.events.push(TransferEvent::Progress { sent, total });
    }

    /// Watchdog expired without a receiver header
    pub fn on_timeout(&mut self, now: Instant) {
        let Some(job) = self.job.as_mut() else {
            return;
        };
        job.retries += 1;
        let retries = job.retries;
        tracing::warn!(
            "No response from receiver ({}/{})",
            retries,
            self.config.max_retries
        );

        if retries >= self.config.max_retries {
            self.cancel(now, ProtocolFailure::Timeout);
            return;
        }

        self.watchdog = Some(now + self.config.timeout);
        if self.outbox.is_empty() {
            self.pump(now);
        }
    }

    /// Flag the running transfer for cancellation at the next step
    pub fn request_cancel(&mut self) {
        if let Some(job) = self.job.as_mut() {
            tracing::info!("Cancel requested");
            job.cancel_requested = true;
        }
    }

    /// Abort the receiver: a spaced run of CAN bytes, then a newline
    pub fn cancel(&mut self, now: Instant, reason: ProtocolFailure) {
        self.abort_with(now, TransferState::Cancelled, TransferError::Protocol(reason));
    }

    fn abort_with(&mut self, now: Instant, state: TransferState, reason: TransferError) {
        self.outbox.clear();
        self.deferred.clear();

        let mut due = now;
        for _ in 0..self.config.cancel_run {
            self.defer(due, vec![CAN]);
            due += self.config.cancel_byte_delay;
        }
        self.defer(due + self.config.resync_delay, b"\n".to_vec());

        self.finish(now, state, Some(reason));
    }

    /// End the transfer
    ///
    /// Success sends ZFIN, the "OO" sign-off and two CAN bytes so a receiver
    /// still waiting for another file exits. Either way an interrupt and a
    /// newline follow after the restore delay.
    pub fn complete(&mut self, success: bool, now: Instant) {
        self.complete_with(success, now, ProtocolFailure::ServerCancelled);
    }

    fn complete_with(&mut self, success: bool, now: Instant, failure: ProtocolFailure) {
        if success {
            let mut tail = Header::new(FrameType::Fin, 0).encode_hex();
            tail.extend_from_slice(b"OO");
            tail.extend_from_slice(&[CAN, CAN]);
            self.queue(&tail);
        }
        self.defer(now + self.config.restore_delay, vec![INTERRUPT, b'\n']);

        if success {
            self.finish(now, TransferState::Completed, None);
        } else {
            self.finish(now, TransferState::Failed, Some(TransferError::Protocol(failure)));
        }
    }

    fn finish(&mut self, now: Instant, state: TransferState, error: Option<TransferError>) {
        match &error {
            Some(e) => tracing::warn!("Transfer ended ({}): {}", state, e),
            None => tracing::info!("Transfer complete"),
        }
        self.job = None;
        self.scanner.clear();
        self.remote_can_run = 0;
        self.set_state(state, now);
        self.cooldown_until = Some(now + self.config.cooldown);
        self.events.push(TransferEvent::Finished { state, error });
    }

    /// Send an interrupt and newline to bring back a stuck prompt
    pub fn nudge(&mut self, now: Instant) {
        tracing::debug!("Nudging remote prompt");
        self.defer(now, vec![INTERRUPT, b'\n']);
    }

    /// Drop everything without writing; the channel is gone
    pub fn reset_silently(&mut self) {
        if self.state != TransferState::Idle {
            tracing::info!("Transfer reset ({} -> Idle)", self.state);
        }
        self.state = TransferState::Idle;
        self.job = None;
        self.outbox.clear();
        self.deferred.clear();
        self.watchdog = None;
        self.eof_deadline = None;
        self.remote_can_run = 0;
        self.scanner.clear();
    }

    /// Handle bytes the receiver sent back
    pub fn process_response(&mut self, data: &[u8], now: Instant) {
        for &byte in data {
            if byte == CAN {
                self.remote_can_run += 1;
            } else {
                self.remote_can_run = 0;
            }
            if self.remote_can_run >= REMOTE_CANCEL_RUN && self.state.is_waiting_on_receiver() {
                tracing::warn!("Receiver sent a cancel run");
                self.outbox.clear();
                self.defer(now + self.config.resync_delay, b"\n".to_vec());
                self.finish(
                    now,
                    TransferState::Cancelled,
                    Some(TransferError::Protocol(ProtocolFailure::ServerCancelled)),
                );
                return;
            }
        }

        for header in self.scanner.push(data) {
            self.handle_header(header, now);
        }
    }

    fn handle_header(&mut self, header: Header, now: Instant) {
        tracing::debug!("Receiver: {}", header);

        if self.job.is_none() {
            if header.kind == FrameType::RInit {
                self.nudge(now);
            }
            return;
        }
        let Some(job) = self.job.as_mut() else {
            return;
        };

        let rewind = header.kind == FrameType::RPos
            && matches!(self.state, TransferState::SendingData | TransferState::EofSent)
            && u64::from(header.position) != job.offset;
        if !rewind {
            job.retries = 0;
        }
        if self.state.is_waiting_on_receiver() {
            self.watchdog = Some(now + self.config.timeout);
        }

        match (header.kind, self.state) {
            (FrameType::RPos, TransferState::HeaderSent) => {
                let position = u64::from(header.position).min(job.size);
                job.offset = position;
                tracing::info!("Receiver ready at offset {}", position);
                self.set_state(TransferState::SendingData, now);
            }
            (FrameType::RPos, TransferState::SendingData | TransferState::EofSent) => {
                let offset = job.offset;
                if u64::from(header.position) != offset {
                    tracing::warn!(
                        "Not rewinding to {} (at {}), counting as retry",
                        header.position,
                        offset
                    );
                    job.retries += 1;
                    if job.retries >= self.config.max_retries {
                        self.cancel(now, ProtocolFailure::Timeout);
                    }
                }
            }
            (FrameType::RInit | FrameType::Nak, TransferState::HeaderSent) => {
                if self.outbox.is_empty() {
                    self.send_file_header();
                }
            }
            (FrameType::RInit, TransferState::EofSent) => self.complete(true, now),
            (FrameType::Fin, state) => self.complete(state == TransferState::EofSent, now),
            (FrameType::Skip, _) => self.complete_with(false, now, ProtocolFailure::Skipped),
            (FrameType::FErr | FrameType::Abort, _) => {
                self.complete_with(false, now, ProtocolFailure::ServerCancelled)
            }
            (FrameType::Ack, _) => {}
            (kind, state) => tracing::debug!("Ignoring {} while {}", kind, state),
        }
    }

    /// Drive the engine: release due writes, flush, check timers, pump
    pub fn tick<C: ShellChannel + ?Sized>(
        &mut self,
        channel: &mut C,
        now: Instant,
    ) -> Result<(), TransportError> {
        self.release_deferred(now);
        self.flush(channel)?;

        if self.state.is_terminal() {
            self.set_state(TransferState::Idle, now);
            return Ok(());
        }

        if self.state.is_waiting_on_receiver() {
            if self.job.as_ref().is_some_and(|j| j.cancel_requested) {
                self.cancel(now, ProtocolFailure::Cancelled);
                return Ok(());
            }
            if self.eof_deadline.is_some_and(|d| now >= d) {
                tracing::debug!("EOF settle time elapsed");
                self.complete(true, now);
            } else if self.watchdog.is_some_and(|d| now >= d) {
                self.on_timeout(now);
            }
            self.flush(channel)?;
        }

        let mut budget = PUMP_BUDGET;
        while self.state == TransferState::SendingData && self.outbox.is_empty() && budget > 0 {
            self.pump(now);
            self.flush(channel)?;
            budget -= 1;
        }
        Ok(())
    }

    fn release_deferred(&mut self, now: Instant) {
        if self.deferred.is_empty() {
            return;
        }
        let (mut due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|d| d.due <= now);
        self.deferred = later;
        due.sort_by_key(|d| d.due);
        for item in due {
            self.outbox.extend_from_slice(&item.bytes);
        }
    }

    fn flush<C: ShellChannel + ?Sized>(&mut self, channel: &mut C) -> Result<(), TransportError> {
        while !self.outbox.is_empty() {
            let n = channel.send(&self.outbox)?;
            if n == 0 {
                break;
            }
            self.outbox.drain(..n);
        }
        Ok(())
    }
}

impl Default for ZmodemSender {
    fn default() -> Self {
        Self::new(TransferConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::zmodem::decode_header;
    use crate::core::transfer::{FixedPicker, MockFilePicker};
    use bytes::Bytes;
    use std::io::Write;
    use std::time::Duration;

    #[derive(Default)]
    struct Sink {
        written: Vec<u8>,
    }

    impl ShellChannel for Sink {
        fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
            self.written.extend_from_slice(data);
            Ok(data.len())
        }

        fn poll(&mut self) -> Result<Option<Bytes>, TransportError> {
            Ok(None)
        }
    }

    fn temp_file(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();
        file
    }

    #[test]
    fn test_begin_is_noop_when_busy() {
        let file = temp_file(10);
        let now = Instant::now();
        let mut engine = ZmodemSender::default();
        let mut picker = FixedPicker(Some(file.path().to_path_buf()));
        assert!(engine.begin(&mut picker, now));
        assert_eq!(engine.state(), TransferState::HeaderSent);

        let mut never = MockFilePicker::new();
        never.expect_pick_upload().times(0);
        assert!(!engine.begin(&mut never, now));
        assert_eq!(engine.state(), TransferState::HeaderSent);
    }

    #[test]
    fn test_declined_pick_cancels() {
        let now = Instant::now();
        let mut engine = ZmodemSender::default();
        let mut picker = MockFilePicker::new();
        picker.expect_pick_upload().times(1).return_const(None);

        assert!(!engine.begin(&mut picker, now));
        assert_eq!(engine.state(), TransferState::Cancelled);
        assert!(engine.watchdog().is_none());

        let mut sink = Sink::default();
        engine.tick(&mut sink, now + Duration::from_secs(2)).unwrap();
        let mut expected = vec![CAN; 8];
        expected.push(b'\n');
        assert_eq!(sink.written, expected);
        assert_eq!(engine.state(), TransferState::Idle);
    }

    #[test]
    fn test_missing_file_fails() {
        let now = Instant::now();
        let mut engine = ZmodemSender::default();
        let mut picker = FixedPicker(Some("/no/such/file".into()));
        assert!(!engine.begin(&mut picker, now));
        assert_eq!(engine.state(), TransferState::Failed);

        let events = engine.drain_events();
        assert!(matches!(
            events.last(),
            Some(TransferEvent::Finished {
                state: TransferState::Failed,
                error: Some(TransferError::Io { .. })
            })
        ));
    }

    #[test]
    fn test_zfile_frame() {
        let file = temp_file(300);
        let now = Instant::now();
        let mut engine = ZmodemSender::default();
        engine.start(file.path(), now);
        assert_eq!(engine.watchdog(), Some(now + Duration::from_secs(10)));

        let mut sink = Sink::default();
        engine.tick(&mut sink, now).unwrap();
        let (header, used) = decode_header(&sink.written).unwrap().unwrap();
        assert_eq!(header.kind, FrameType::File);
        assert_eq!(header.zf0(), ZCBIN);

        let (sub, _) = zmodem::decode_subpacket(&sink.written[used..]).unwrap().unwrap();
        assert_eq!(sub.end, FrameEnd::Wait);
        let name = file.path().file_name().unwrap().to_string_lossy();
        assert!(sub.payload.starts_with(name.as_bytes()));
        assert!(sub.payload.windows(4).any(|w| w == b"300 "));
    }

    #[test]
    fn test_offset_never_rewinds() {
        let file = temp_file(4096);
        let now = Instant::now();
        let mut engine = ZmodemSender::default();
        engine.start(file.path(), now);
        engine.process_response(&Header::new(FrameType::RPos, 0).encode_hex(), now);
        assert_eq!(engine.state(), TransferState::SendingData);

        // Send one subpacket without flushing
        engine.pump(now);
        let offset = engine.job().unwrap().offset;
        assert_eq!(offset, 1024);

        engine.process_response(&Header::new(FrameType::RPos, 0).encode_hex(), now);
        assert_eq!(engine.job().unwrap().offset, offset);
        assert_eq!(engine.job().unwrap().retries, 1);

        engine.process_response(&Header::new(FrameType::RPos, 0).encode_hex(), now);
        assert_eq!(engine.job().unwrap().retries, 2);
        engine.process_response(&Header::new(FrameType::RPos, 0).encode_hex(), now);
        assert_eq!(engine.state(), TransferState::Cancelled);
    }

    #[test]
    fn test_remote_cancel_run() {
        let file = temp_file(100);
        let now = Instant::now();
        let mut engine = ZmodemSender::default();
        engine.start(file.path(), now);
        engine.process_response(&[CAN, CAN, CAN, CAN, CAN], now);
        assert_eq!(engine.state(), TransferState::Cancelled);

        let mut sink = Sink::default();
        engine.tick(&mut sink, now + Duration::from_secs(1)).unwrap();
        // No cancel run echoed back, only the resync newline
        assert_eq!(sink.written.iter().filter(|&&b| b == CAN).count(), 0);
        assert!(sink.written.ends_with(b"\n"));
    }

    #[test]
    fn test_skip_fails() {
        let file = temp_file(100);
        let now = Instant::now();
        let mut engine = ZmodemSender::default();
        engine.start(file.path(), now);
        engine.process_response(&Header::new(FrameType::Skip, 0).encode_hex(), now);
        assert_eq!(engine.state(), TransferState::Failed);
        let events = engine.drain_events();
        assert!(matches!(
            events.last(),
            Some(TransferEvent::Finished {
                error: Some(TransferError::Protocol(ProtocolFailure::Skipped)),
                ..
            })
        ));
    }

    #[test]
    fn test_request_cancel_honoured_on_tick() {
        let file = temp_file(100);
        let now = Instant::now();
        let mut engine = ZmodemSender::default();
        engine.start(file.path(), now);
        engine.request_cancel();

        let mut sink = Sink::default();
        engine.tick(&mut sink, now).unwrap();
        assert_eq!(engine.state(), TransferState::Cancelled);
        assert!(engine.watchdog().is_none());
    }

    #[test]
    fn test_cooldown_and_nudge_without_job() {
        let now = Instant::now();
        let mut engine = ZmodemSender::default();
        let mut picker = FixedPicker(None);
        engine.begin(&mut picker, now);
        assert!(engine.in_cooldown(now + Duration::from_secs(1)));
        assert!(!engine.in_cooldown(now + Duration::from_secs(4)));

        let mut sink = Sink::default();
        engine.tick(&mut sink, now + Duration::from_secs(1)).unwrap();
        sink.written.clear();

        // A receiver heartbeat with nothing to send gets a nudge
        engine.process_response(&Header::new(FrameType::RInit, 0).encode_hex(), now);
        engine.tick(&mut sink, now + Duration::from_secs(1)).unwrap();
        assert_eq!(sink.written, vec![INTERRUPT, b'\n']);
    }

    #[test]
    fn test_silent_reset_writes_nothing() {
        let file = temp_file(100);
        let now = Instant::now();
        let mut engine = ZmodemSender::default();
        engine.start(file.path(), now);
        engine.reset_silently();
        assert_eq!(engine.state(), TransferState::Idle);
        assert!(!engine.has_pending_output());
        assert!(engine.watchdog().is_none());
    }
}
