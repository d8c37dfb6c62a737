//! Byte-stream dispatcher
//!
//! Decides whether each inbound chunk is terminal output or ZMODEM traffic.
//! While no transfer is active every chunk is scanned for a receiver start:
//! - the hex or binary header magic (`ZPAD ZDLE ZHEX|ZBIN`)
//! - `rz` typed right after a shell prompt
//! - the receiver's "waiting to receive" banner
//!
//! A bounded rolling buffer catches triggers split across chunks.

use crate::core::protocol::zmodem::{ZBIN, ZDLE, ZHEX, ZPAD};
use bytes::Bytes;
use regex::bytes::Regex;
use std::borrow::Cow;
use std::sync::OnceLock;

/// Default rolling buffer size
pub const DEFAULT_DETECTION_BUFFER: usize = 1024;

/// `[user@host dir]$ ` or `user@host:dir$ `
const PROMPT_PATTERN: &str = r"(?:\[[^\]\r\n]+@[^\]\r\n]+\s+[^\]\r\n]+\]|[\w.-]+@[\w.-]+:[^\s$#]*)[$#]\s*";

/// Escape sequences a shell may emit between the prompt and the echo
const ESCAPES: &str = r"(?:\x1b\[[0-9;?]*[A-Za-z])*";

fn prompt_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(PROMPT_PATTERN).expect("prompt pattern is valid"))
}

fn receive_command_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let pattern = format!(r"{PROMPT_PATTERN}{ESCAPES}rz(?:[ \t][^\r\n]*)?\r?\n");
        Regex::new(&pattern).expect("receive command pattern is valid")
    })
}

fn sgr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;:]*m").expect("sgr pattern is valid"))
}

/// Drop color sequences so colored prompts read as plain text
fn strip_sgr(data: &[u8]) -> Cow<'_, [u8]> {
    sgr_regex().replace_all(data, &b""[..])
}

fn waiting_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)waiting to receive").expect("waiting pattern is valid"))
}

/// What started a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// ZMODEM header magic
    HeaderMagic,
    /// `rz` entered at a prompt
    ReceiveCommand,
    /// Receiver banner
    WaitingBanner,
}

/// Routing decision for one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Render as terminal output
    Terminal(Bytes),
    /// Transfer detected; `passthrough` precedes the trigger and is still
    /// terminal output
    Detected {
        /// What matched
        trigger: Trigger,
        /// Bytes to render
        passthrough: Bytes,
    },
    /// Protocol preamble held back until the upload starts
    Withheld,
    /// Receiver traffic for the engine
    Transfer(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Scanning,
    Preamble,
    Routing,
}

/// Stream dispatcher
#[derive(Debug)]
pub struct Dispatcher {
    phase: Phase,
    buffer: Vec<u8>,
    limit: usize,
    last_prompt: Option<String>,
}

impl Dispatcher {
    /// Create a dispatcher with a rolling buffer of `limit` bytes
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(4);
        Self {
            phase: Phase::Scanning,
            buffer: Vec::with_capacity(limit),
            limit,
            last_prompt: None,
        }
    }

    /// A transfer is active (detected or running)
    pub fn transfer_active(&self) -> bool {
        self.phase != Phase::Scanning
    }

    /// Current detection buffer length
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Buffer bound
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Most recent shell prompt seen
    pub fn last_prompt(&self) -> Option<&str> {
        self.last_prompt.as_deref()
    }

    /// Route one inbound chunk
    pub fn route(&mut self, chunk: Bytes) -> Route {
        match self.phase {
            Phase::Routing => Route::Transfer(chunk),
            Phase::Preamble => {
                tracing::trace!("Withholding {} preamble bytes", chunk.len());
                Route::Withheld
            }
            Phase::Scanning => self.scan(chunk),
        }
    }

    fn scan(&mut self, chunk: Bytes) -> Route {
        self.track_prompt(&chunk);

        if let Some((trigger, at)) = find_trigger(&chunk) {
            return self.detected(trigger, chunk.slice(..at));
        }

        // Keep only the tail that can still complete a trigger
        let tail_start = chunk.len().saturating_sub(self.limit);
        let kept = chunk.len() - tail_start;
        self.buffer.extend_from_slice(&chunk[tail_start..]);
        if self.buffer.len() > self.limit {
            let excess = self.buffer.len() - self.limit;
            self.buffer.drain(..excess);
        }
        let chunk_start = self.buffer.len() - kept;

        if let Some((trigger, at)) = find_trigger(&self.buffer) {
            // Part of the trigger arrived in an earlier chunk
            let before = (tail_start + at.saturating_sub(chunk_start)).min(chunk.len());
            return self.detected(trigger, chunk.slice(..before));
        }
        Route::Terminal(chunk)
    }

    fn detected(&mut self, trigger: Trigger, passthrough: Bytes) -> Route {
        tracing::info!("Transfer trigger: {:?}", trigger);
        self.phase = Phase::Preamble;
        self.buffer.clear();
        Route::Detected {
            trigger,
            passthrough,
        }
    }

    fn track_prompt(&mut self, chunk: &[u8]) {
        let plain = strip_sgr(chunk);
        if let Some(m) = prompt_regex().find_iter(&plain).last() {
            let prompt = String::from_utf8_lossy(m.as_bytes()).trim_end().to_string();
            if self.last_prompt.as_deref() != Some(prompt.as_str()) {
                tracing::debug!("Prompt: {}", prompt);
                self.last_prompt = Some(prompt);
            }
        }
    }

    /// The engine has sent its first frame; route replies to it
    pub fn upload_started(&mut self) {
        if self.phase == Phase::Preamble {
            self.phase = Phase::Routing;
        }
    }

    /// Transfer over; back to terminal output
    pub fn reset(&mut self) {
        self.phase = Phase::Scanning;
        self.buffer.clear();
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_DETECTION_BUFFER)
    }
}

/// Earliest trigger in `data` and where its text starts
///
/// Textual triggers report offset `data.len()`: the banner and the echoed
/// command are ordinary output.
fn find_trigger(data: &[u8]) -> Option<(Trigger, usize)> {
    if let Some(at) = data
        .windows(3)
        .position(|w| w[0] == ZPAD && w[1] == ZDLE && (w[2] == ZHEX || w[2] == ZBIN))
    {
        // Include any extra leading ZPAD
        let start = data[..at].iter().rev().take_while(|&&b| b == ZPAD).count();
        return Some((Trigger::HeaderMagic, at - start));
    }
    let plain = strip_sgr(data);
    if receive_command_regex().is_match(&plain) {
        return Some((Trigger::ReceiveCommand, data.len()));
    }
    if waiting_regex().is_match(&plain) {
        return Some((Trigger::WaitingBanner, data.len()));
    }
    None
}
