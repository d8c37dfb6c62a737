//! Transport layer
//!
//! Provides:
//! - SSH-2 sessions (password or public key authentication)
//! - One-shot command execution
//! - A non-blocking interactive shell channel
//! - A connect worker that keeps the blocking handshake off the poll loop

mod ssh;
mod worker;

pub use ssh::{CommandOutput, ExecOutcome, SshAuth, SshConfig, SshTransport};
pub use worker::{spawn_connect, ConnectHandle};

use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Step of the connect sequence that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectStage {
    /// Host name lookup
    Resolve,
    /// TCP socket connect
    Socket,
    /// SSH protocol handshake
    Handshake,
    /// User authentication
    Authenticate,
    /// Channel, PTY or shell request
    Channel,
}

impl fmt::Display for ConnectStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolve => write!(f, "resolve"),
            Self::Socket => write!(f, "socket"),
            Self::Handshake => write!(f, "handshake"),
            Self::Authenticate => write!(f, "authenticate"),
            Self::Channel => write!(f, "channel"),
        }
    }
}

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed at a specific stage
    #[error("Connection failed during {stage}: {reason}")]
    Connection {
        /// Failing stage
        stage: ConnectStage,
        /// Underlying cause
        reason: String,
    },

    /// Authentication rejected
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Channel open/request failed
    #[error("Channel error: {0}")]
    Channel(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Remote side closed the channel
    #[error("Disconnected")]
    Disconnected,
}

impl TransportError {
    /// Shorthand for a stage-tagged connection error
    pub fn connection(stage: ConnectStage, reason: impl fmt::Display) -> Self {
        Self::Connection {
            stage,
            reason: reason.to_string(),
        }
    }

    /// Connect stage this error belongs to, if any
    pub fn stage(&self) -> Option<ConnectStage> {
        match self {
            Self::Connection { stage, .. } => Some(*stage),
            Self::Auth(_) => Some(ConnectStage::Authenticate),
            Self::Channel(_) => Some(ConnectStage::Channel),
            _ => None,
        }
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No connection
    #[default]
    Disconnected,
    /// Connect worker running
    Connecting,
    /// Handshake and authentication done
    Authenticated,
    /// Interactive shell open
    ShellActive,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Authenticated => write!(f, "Authenticated"),
            Self::ShellActive => write!(f, "Shell active"),
        }
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Writes that moved at least one byte
    pub writes: u64,
    /// Reads that returned data
    pub reads: u64,
    /// Connection uptime in seconds
    pub uptime_secs: u64,
}

/// Non-blocking interactive byte channel
///
/// Implemented by the SSH shell and by in-memory mocks. Neither method may
/// block.
pub trait ShellChannel {
    /// Write as much of `data` as the channel accepts right now
    ///
    /// Returns the number of bytes taken; `0` means the channel would block.
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read whatever has arrived
    ///
    /// `Ok(None)` when nothing is pending, `Err(Disconnected)` on EOF.
    fn poll(&mut self) -> Result<Option<Bytes>, TransportError>;

    /// Keep the session alive; called once per poll tick
    fn keepalive(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

impl<T: ShellChannel + ?Sized> ShellChannel for Box<T> {
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        (**self).send(data)
    }

    fn poll(&mut self) -> Result<Option<Bytes>, TransportError> {
        (**self).poll()
    }

    fn keepalive(&mut self) -> Result<(), TransportError> {
        (**self).keepalive()
    }
}
