//! Terminal session
//!
//! A `TerminalSession` owns an open shell channel and everything downstream
//! of it: the dispatcher, the ANSI interpreter with its style state and the
//! upload engine. All of it lives on one thread and is advanced by
//! [`TerminalSession::tick`] on a fixed interval.

use crate::core::dispatch::{Dispatcher, Route};
use crate::core::history::{self, CommandHistory};
use crate::core::terminal::{AnsiInterpreter, DisplaySurface, StyleState, StyledRun};
use crate::core::transfer::{FilePicker, TransferConfig, TransferEvent, TransferState, ZmodemSender};
use crate::core::transport::{SessionState, ShellChannel, TransportError};
use bytes::Bytes;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Ctrl-C
const INTERRUPT: u8 = 0x03;

/// Session events
#[derive(Debug)]
pub enum SessionEvent {
    /// Upload progress or outcome
    Transfer(TransferEvent),
    /// New shell prompt seen
    PromptChanged(String),
    /// Channel closed or failed; the session is finished
    Disconnected(Option<TransportError>),
}

/// Session tuning
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Detection buffer bound
    pub detection_buffer: usize,
    /// Keepalive period (zero disables)
    pub keepalive: Duration,
    /// Upload engine settings
    pub transfer: TransferConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            detection_buffer: crate::core::dispatch::DEFAULT_DETECTION_BUFFER,
            keepalive: Duration::from_secs(60),
            transfer: TransferConfig::default(),
        }
    }
}

/// Interactive session over a shell channel
pub struct TerminalSession<C: ShellChannel> {
    id: Uuid,
    channel: Option<C>,
    state: SessionState,
    dispatcher: Dispatcher,
    interpreter: AnsiInterpreter,
    style: StyleState,
    engine: ZmodemSender,
    input: Vec<u8>,
    history: CommandHistory,
    keepalive: Duration,
    last_keepalive: Option<Instant>,
    last_prompt: Option<String>,
}

impl<C: ShellChannel> TerminalSession<C> {
    /// Wrap an open shell channel
    pub fn new(channel: C, style: StyleState, config: SessionConfig) -> Self {
        let id = Uuid::new_v4();
        tracing::debug!("Session {} started", id);
        Self {
            id,
            channel: Some(channel),
            state: SessionState::ShellActive,
            dispatcher: Dispatcher::new(config.detection_buffer),
            interpreter: AnsiInterpreter::new(),
            style,
            engine: ZmodemSender::new(config.transfer),
            input: Vec::new(),
            history: CommandHistory::default(),
            keepalive: config.keepalive,
            last_keepalive: None,
            last_prompt: None,
        }
    }

    /// Session ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Shell is still open
    pub fn is_active(&self) -> bool {
        self.channel.is_some()
    }

    /// Upload engine state
    pub fn transfer_state(&self) -> TransferState {
        self.engine.state()
    }

    /// Upload in progress (the poll loop may want to tick faster)
    pub fn is_transferring(&self) -> bool {
        self.dispatcher.transfer_active() || self.engine.has_pending_output()
    }

    /// Most recent prompt
    pub fn last_prompt(&self) -> Option<&str> {
        self.last_prompt.as_deref()
    }

    /// Current style (carried across chunks)
    pub fn style(&self) -> &StyleState {
        &self.style
    }

    /// Borrow the channel
    pub fn channel(&self) -> Option<&C> {
        self.channel.as_ref()
    }

    /// Mutably borrow the channel
    pub fn channel_mut(&mut self) -> Option<&mut C> {
        self.channel.as_mut()
    }

    /// Queue keystrokes or a command line for the remote shell
    ///
    /// Input typed during an upload would corrupt the stream and is dropped.
    pub fn send_input(&mut self, data: &[u8]) {
        if self.dispatcher.transfer_active() {
            tracing::debug!("Dropping {} input bytes during transfer", data.len());
            return;
        }
        self.input.extend_from_slice(data);
    }

    /// Submit one typed line
    ///
    /// The command is added to the history. A line made only of up/down
    /// arrow keys recalls an entry and sends that instead.
    pub fn submit_line(&mut self, line: &[u8]) {
        if self.dispatcher.transfer_active() {
            tracing::debug!("Dropping {} input bytes during transfer", line.len());
            return;
        }
        if let Some(keys) = history::parse_recall(line) {
            match self.history.recall(&keys).filter(|c| !c.is_empty()) {
                Some(command) => {
                    tracing::debug!("Recalled {:?}", command);
                    self.history.push(&command);
                    self.input.extend_from_slice(command.as_bytes());
                    self.input.push(b'\n');
                }
                None => tracing::debug!("Nothing to recall"),
            }
            return;
        }
        self.history.push(&String::from_utf8_lossy(line));
        self.input.extend_from_slice(line);
    }

    /// Commands submitted so far
    pub fn history(&self) -> &CommandHistory {
        &self.history
    }

    /// Ctrl+C: interrupt the remote command, or cancel a running upload
    pub fn interrupt(&mut self) {
        if self.engine.job().is_some() {
            self.engine.request_cancel();
        } else {
            self.input.push(INTERRUPT);
        }
    }

    /// Append a status line in the default style
    pub fn status_line(&self, display: &mut dyn DisplaySurface, text: &str) {
        let mut style = self.style;
        style.reset();
        display.append_run(&StyledRun::new(format!("{}\n", text), &style));
    }

    /// Poll the channel and advance everything by one step
    pub fn tick(
        &mut self,
        now: Instant,
        display: &mut dyn DisplaySurface,
        picker: &mut dyn FilePicker,
    ) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if let Err(e) = self.step(now, display, picker, &mut events) {
            self.lost(e, display, &mut events);
        }
        events
    }

    fn step(
        &mut self,
        now: Instant,
        display: &mut dyn DisplaySurface,
        picker: &mut dyn FilePicker,
        events: &mut Vec<SessionEvent>,
    ) -> Result<(), TransportError> {
        let Some(channel) = self.channel.as_mut() else {
            return Ok(());
        };

        if !self.keepalive.is_zero()
            && self
                .last_keepalive
                .map_or(true, |at| now.duration_since(at) >= self.keepalive)
        {
            channel.keepalive()?;
            self.last_keepalive = Some(now);
        }

        if let Some(chunk) = channel.poll()? {
            self.handle_chunk(chunk, now, display, picker);
        }

        if let Some(channel) = self.channel.as_mut() {
            self.engine.tick(channel, now)?;

            while !self.input.is_empty() {
                let n = channel.send(&self.input)?;
                if n == 0 {
                    break;
                }
                self.input.drain(..n);
            }
        }

        for event in self.engine.drain_events() {
            if let TransferEvent::Finished { state, .. } = &event {
                tracing::debug!("Transfer finished ({}), resuming terminal output", state);
                self.dispatcher.reset();
            }
            events.push(SessionEvent::Transfer(event));
        }

        if let Some(prompt) = self.dispatcher.last_prompt() {
            if self.last_prompt.as_deref() != Some(prompt) {
                self.last_prompt = Some(prompt.to_string());
                events.push(SessionEvent::PromptChanged(prompt.to_string()));
            }
        }
        Ok(())
    }

    fn handle_chunk(
        &mut self,
        chunk: Bytes,
        now: Instant,
        display: &mut dyn DisplaySurface,
        picker: &mut dyn FilePicker,
    ) {
        match self.dispatcher.route(chunk) {
            Route::Terminal(bytes) => self.render(&bytes, display),
            Route::Detected {
                trigger,
                passthrough,
            } => {
                self.render(&passthrough, display);
                if self.engine.in_cooldown(now) || self.engine.state() != TransferState::Idle {
                    tracing::debug!("Ignoring {:?} right after a transfer", trigger);
                    self.engine.nudge(now);
                    self.dispatcher.reset();
                    return;
                }
                self.input.clear();
                if self.engine.begin(picker, now) {
                    self.dispatcher.upload_started();
                }
            }
            Route::Withheld => {}
            Route::Transfer(bytes) => self.engine.process_response(&bytes, now),
        }
    }

    fn render(&mut self, bytes: &[u8], display: &mut dyn DisplaySurface) {
        if bytes.is_empty() {
            return;
        }
        for op in self.interpreter.interpret(bytes, &mut self.style) {
            display.apply(&op);
        }
    }

    fn lost(
        &mut self,
        error: TransportError,
        display: &mut dyn DisplaySurface,
        events: &mut Vec<SessionEvent>,
    ) {
        tracing::warn!("Session {} lost: {}", self.id, error);
        self.engine.reset_silently();
        self.dispatcher.reset();
        self.input.clear();
        self.channel = None;
        self.state = SessionState::Disconnected;
        self.status_line(display, "Disconnected from server.");

        let error = match error {
            TransportError::Disconnected => None,
            other => Some(other),
        };
        events.push(SessionEvent::Disconnected(error));
    }

    /// Give the channel back, ending the session
    pub fn into_channel(mut self) -> Option<C> {
        self.engine.reset_silently();
        self.channel.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::terminal::{BufferSurface, Rgb};
    use crate::core::transfer::FixedPicker;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct ScriptedChannel {
        incoming: VecDeque<Result<Bytes, TransportError>>,
        written: Vec<u8>,
    }

    impl ShellChannel for ScriptedChannel {
        fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
            self.written.extend_from_slice(data);
            Ok(data.len())
        }

        fn poll(&mut self) -> Result<Option<Bytes>, TransportError> {
            self.incoming.pop_front().transpose()
        }
    }

    fn session(incoming: Vec<Result<Bytes, TransportError>>) -> TerminalSession<ScriptedChannel> {
        let channel = ScriptedChannel {
            incoming: incoming.into(),
            written: Vec::new(),
        };
        TerminalSession::new(
            channel,
            StyleState::new(Rgb::new(220, 220, 220), Rgb::new(30, 30, 30)),
            SessionConfig::default(),
        )
    }

    #[test]
    fn test_output_reaches_display() {
        let mut s = session(vec![Ok(Bytes::from_static(b"\x1b[32mok\x1b[0m\r\n"))]);
        let mut display = BufferSurface::default();
        let mut picker = FixedPicker(None);
        s.tick(Instant::now(), &mut display, &mut picker);
        assert_eq!(display.text(), "ok\n");
    }

    #[test]
    fn test_ops_reach_surface_in_order() {
        use crate::core::terminal::display::MockDisplaySurface;
        use crate::core::terminal::DisplayOp;
        use mockall::Sequence;

        let mut s = session(vec![Ok(Bytes::from_static(b"\x1b]0;web01\x07\x1b[1mhi\x1b[H\x1b[2J"))]);
        let mut display = MockDisplaySurface::new();
        let mut seq = Sequence::new();
        display
            .expect_apply()
            .withf(|op| matches!(op, DisplayOp::SetTitle(t) if t == "web01"))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        display
            .expect_apply()
            .withf(|op| matches!(op, DisplayOp::Append(run) if run.text == "hi" && run.bold))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        display
            .expect_apply()
            .withf(|op| *op == DisplayOp::Clear)
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        let mut picker = FixedPicker(None);
        s.tick(Instant::now(), &mut display, &mut picker);
    }

    #[test]
    fn test_input_and_interrupt() {
        let mut s = session(vec![]);
        let mut display = BufferSurface::default();
        let mut picker = FixedPicker(None);
        s.send_input(b"ls\n");
        s.interrupt();
        s.tick(Instant::now(), &mut display, &mut picker);
        assert_eq!(s.channel().unwrap().written, b"ls\n\x03");
    }

    #[test]
    fn test_submitted_lines_go_to_history() {
        let mut s = session(vec![]);
        let mut display = BufferSurface::default();
        let mut picker = FixedPicker(None);
        s.submit_line(b"uname -a\n");
        s.submit_line(b"uname -a\n");
        s.submit_line(b"\n");
        s.submit_line(b"df -h\n");
        s.tick(Instant::now(), &mut display, &mut picker);

        assert_eq!(s.history().iter().collect::<Vec<_>>(), vec!["uname -a", "df -h"]);
        assert_eq!(s.channel().unwrap().written, b"uname -a\nuname -a\n\ndf -h\n");
    }

    #[test]
    fn test_arrow_line_recalls_command() {
        let mut s = session(vec![]);
        let mut display = BufferSurface::default();
        let mut picker = FixedPicker(None);
        s.submit_line(b"make\n");
        s.submit_line(b"make test\n");
        s.submit_line(b"\x1b[A\x1b[A\n");
        // Nothing newer to step down to
        s.submit_line(b"\x1b[B\n");
        // Recall starts again from the newest entry, which is not stored twice
        s.submit_line(b"\x1b[A\n");
        s.tick(Instant::now(), &mut display, &mut picker);

        assert_eq!(
            s.channel().unwrap().written,
            b"make\nmake test\nmake\nmake\n"
        );
        assert_eq!(s.history().len(), 3);
    }

    #[test]
    fn test_prompt_event() {
        let mut s = session(vec![Ok(Bytes::from_static(b"[root@web ~]# "))]);
        let mut display = BufferSurface::default();
        let mut picker = FixedPicker(None);
        let events = s.tick(Instant::now(), &mut display, &mut picker);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::PromptChanged(p) if p == "[root@web ~]#")));
        assert_eq!(s.last_prompt(), Some("[root@web ~]#"));
    }

    #[test]
    fn test_eof_disconnects_and_resets() {
        let mut s = session(vec![Err(TransportError::Disconnected)]);
        let mut display = BufferSurface::default();
        let mut picker = FixedPicker(None);
        let events = s.tick(Instant::now(), &mut display, &mut picker);

        assert!(matches!(events.last(), Some(SessionEvent::Disconnected(None))));
        assert!(!s.is_active());
        assert_eq!(s.state(), SessionState::Disconnected);
        assert!(display.text().contains("Disconnected from server."));
    }

    #[test]
    fn test_declined_upload_resumes_terminal() {
        let now = Instant::now();
        let mut s = session(vec![
            Ok(Bytes::from_static(b"**\x18B0100000023be50\r\x8a\x11")),
            Ok(Bytes::from_static(b"after")),
        ]);
        let mut display = BufferSurface::default();
        let mut picker = FixedPicker(None);

        let events = s.tick(now, &mut display, &mut picker);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Transfer(TransferEvent::Finished {
                state: TransferState::Cancelled,
                ..
            })
        )));

        s.tick(now + Duration::from_secs(1), &mut display, &mut picker);
        assert_eq!(display.text(), "after");
    }
}
