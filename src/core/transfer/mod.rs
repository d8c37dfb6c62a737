//! Inline file upload
//!
//! The remote side starts a ZMODEM receiver (`rz`) inside the shell; the
//! client answers as the sender over the same channel. This module holds the
//! job bookkeeping, errors, events and the file picker seam; the state
//! machine itself lives in [`engine`].

pub mod engine;

pub use engine::ZmodemSender;

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use thiserror::Error;

/// Upload state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransferState {
    /// Nothing in progress
    #[default]
    Idle,
    /// Receiver start detected in the stream
    Detected,
    /// Waiting for the user to pick a file
    AwaitingFileChoice,
    /// ZFILE sent, waiting for the receiver's position
    HeaderSent,
    /// Streaming file data
    SendingData,
    /// ZEOF sent
    EofSent,
    /// Finished successfully
    Completed,
    /// Cancelled locally or by the receiver
    Cancelled,
    /// Failed (file error, receiver refused)
    Failed,
}

impl TransferState {
    /// Completed, Cancelled or Failed
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// States during which the receiver is expected to answer
    pub fn is_waiting_on_receiver(self) -> bool {
        matches!(self, Self::HeaderSent | Self::SendingData | Self::EofSent)
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Detected => write!(f, "Detected"),
            Self::AwaitingFileChoice => write!(f, "Awaiting file choice"),
            Self::HeaderSent => write!(f, "Header sent"),
            Self::SendingData => write!(f, "Sending data"),
            Self::EofSent => write!(f, "EOF sent"),
            Self::Completed => write!(f, "Completed"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Protocol-level reasons a transfer ended early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFailure {
    /// Receiver stopped answering
    Timeout,
    /// Cancelled locally
    Cancelled,
    /// Receiver sent a cancel run, ZABORT or ZFERR
    ServerCancelled,
    /// Receiver refused the file (ZSKIP)
    Skipped,
}

impl fmt::Display for ProtocolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "receiver timed out"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::ServerCancelled => write!(f, "cancelled by remote"),
            Self::Skipped => write!(f, "file skipped by remote"),
        }
    }
}

/// Transfer errors
#[derive(Error, Debug)]
pub enum TransferError {
    /// Local file could not be opened or read
    #[error("{}: {source}", .file.display())]
    Io {
        /// File involved
        file: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// File does not fit ZMODEM's 32-bit positions
    #[error("{}: {size} bytes is too large to send", .file.display())]
    TooLarge {
        /// File involved
        file: PathBuf,
        /// Its size
        size: u64,
    },

    /// Protocol ended the transfer
    #[error("transfer {0}")]
    Protocol(ProtocolFailure),
}

/// Engine timing and sizing
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Data bytes per subpacket
    pub packet_size: usize,
    /// Watchdog period
    pub timeout: Duration,
    /// Consecutive timeouts before giving up
    pub max_retries: u32,
    /// Every n-th data subpacket requests an ACK
    pub ack_interval: u32,
    /// Length of the cancel run
    pub cancel_run: usize,
    /// Gap between cancel bytes
    pub cancel_byte_delay: Duration,
    /// Delay before the newline that follows a cancel
    pub resync_delay: Duration,
    /// Pause after ZEOF before completing
    pub eof_settle: Duration,
    /// Delay before the interrupt + newline that restores the prompt
    pub restore_delay: Duration,
    /// Window after a transfer in which new triggers are only nudged
    pub cooldown: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            packet_size: 1024,
            timeout: Duration::from_secs(10),
            max_retries: 3,
            ack_interval: 8,
            cancel_run: 8,
            cancel_byte_delay: Duration::from_millis(10),
            resync_delay: Duration::from_millis(500),
            eof_settle: Duration::from_millis(500),
            restore_delay: Duration::from_millis(1000),
            cooldown: Duration::from_millis(3000),
        }
    }
}

/// One file upload
#[derive(Debug)]
pub struct TransferJob {
    /// Local path
    pub path: PathBuf,
    /// Name announced to the receiver
    pub name: String,
    /// Total size in bytes
    pub size: u64,
    /// Next byte to send
    pub offset: u64,
    /// Data bytes per subpacket
    pub packet_size: usize,
    /// Modification time, seconds since the epoch
    pub mtime: u64,
    /// Consecutive watchdog expiries
    pub retries: u32,
    /// Cancel requested, honoured before the next pump step
    pub cancel_requested: bool,
    file: File,
}

impl TransferJob {
    /// Open `path` for upload
    pub fn open(path: &Path, packet_size: usize) -> Result<Self, TransferError> {
        let io_err = |source| TransferError::Io {
            file: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(io_err)?;
        let metadata = file.metadata().map_err(io_err)?;
        if !metadata.is_file() {
            return Err(io_err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "not a regular file",
            )));
        }
        let size = metadata.len();
        if size > u64::from(u32::MAX) {
            return Err(TransferError::TooLarge {
                file: path.to_path_buf(),
                size,
            });
        }
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        Ok(Self {
            path: path.to_path_buf(),
            name,
            size,
            offset: 0,
            packet_size: packet_size.max(1),
            mtime,
            retries: 0,
            cancel_requested: false,
            file,
        })
    }

    /// Bytes still to send
    pub fn remaining(&self) -> u64 {
        self.size.saturating_sub(self.offset)
    }
}

/// Progress and outcome notifications
#[derive(Debug)]
pub enum TransferEvent {
    /// ZFILE sent for this file
    Started {
        /// File name
        name: String,
        /// File size
        size: u64,
    },
    /// More data handed to the channel
    Progress {
        /// Bytes sent so far
        sent: u64,
        /// Total bytes
        total: u64,
    },
    /// Reached a terminal state
    Finished {
        /// Completed, Cancelled or Failed
        state: TransferState,
        /// Reason for anything but Completed
        error: Option<TransferError>,
    },
}

/// Chooses the file to upload when a receiver appears
#[cfg_attr(test, mockall::automock)]
pub trait FilePicker {
    /// Path to upload, or `None` when the user declines
    fn pick_upload(&mut self) -> Option<PathBuf>;
}

/// Picker that always answers with the same file (or always declines)
#[derive(Debug, Clone, Default)]
pub struct FixedPicker(pub Option<PathBuf>);

impl FilePicker for FixedPicker {
    fn pick_upload(&mut self) -> Option<PathBuf> {
        self.0.clone()
    }
}
