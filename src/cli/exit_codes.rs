//! CLI Exit Codes
//!
//! Exit codes for the `sshterm` binary, derived from library error kinds.

use crate::config::ConfigError;
use crate::core::transfer::{ProtocolFailure, TransferError};
use crate::core::transport::{ConnectStage, TransportError};
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Connection failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// Connection timeout
    pub const TIMEOUT: u8 = 4;

    /// Authentication failed
    pub const AUTH_FAILED: u8 = 5;

    /// File not found
    pub const FILE_NOT_FOUND: u8 = 6;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Protocol error
    pub const PROTOCOL_ERROR: u8 = 9;

    /// Transfer failed
    pub const TRANSFER_FAILED: u8 = 10;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// Remote command exited non-zero
    pub const REMOTE_FAILED: u8 = 12;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Error with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Classify an error chain by the first library error found in it
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let code = err
            .chain()
            .find_map(|cause| {
                if let Some(e) = cause.downcast_ref::<TransportError>() {
                    Some(transport_code(e))
                } else if let Some(e) = cause.downcast_ref::<TransferError>() {
                    Some(transfer_code(e))
                } else if cause.downcast_ref::<ConfigError>().is_some() {
                    Some(ExitCodes::CONFIG_ERROR)
                } else {
                    cause.downcast_ref::<std::io::Error>().map(io_code)
                }
            })
            .unwrap_or(ExitCodes::ERROR);
        Self::Error(code, format!("{:#}", err))
    }
}

impl From<std::io::Error> for CliResult {
    fn from(err: std::io::Error) -> Self {
        Self::Error(io_code(&err), err.to_string())
    }
}

impl From<TransportError> for CliResult {
    fn from(err: TransportError) -> Self {
        Self::Error(transport_code(&err), err.to_string())
    }
}

fn io_code(err: &std::io::Error) -> u8 {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::NotFound => ExitCodes::FILE_NOT_FOUND,
        ErrorKind::PermissionDenied => ExitCodes::PERMISSION_DENIED,
        ErrorKind::ConnectionRefused => ExitCodes::CONNECTION_FAILED,
        ErrorKind::TimedOut => ExitCodes::TIMEOUT,
        _ => ExitCodes::ERROR,
    }
}

fn transport_code(err: &TransportError) -> u8 {
    match err {
        TransportError::Auth(_) => ExitCodes::AUTH_FAILED,
        TransportError::Connection { reason, .. } if reason.contains("timed out") => {
            ExitCodes::TIMEOUT
        }
        TransportError::Connection {
            stage: ConnectStage::Handshake,
            ..
        }
        | TransportError::Channel(_) => ExitCodes::PROTOCOL_ERROR,
        TransportError::Io(e) => io_code(e),
        _ => ExitCodes::CONNECTION_FAILED,
    }
}

fn transfer_code(err: &TransferError) -> u8 {
    match err {
        TransferError::Io { source, .. } => io_code(source),
        TransferError::TooLarge { .. } => ExitCodes::TRANSFER_FAILED,
        TransferError::Protocol(ProtocolFailure::Cancelled) => ExitCodes::CANCELLED,
        TransferError::Protocol(_) => ExitCodes::TRANSFER_FAILED,
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        4 => "Connection timeout",
        5 => "Authentication failed",
        6 => "File not found",
        7 => "Permission denied",
        8 => "Configuration error",
        9 => "Protocol error",
        10 => "Transfer failed",
        11 => "Operation cancelled",
        12 => "Remote command failed",
        127 => "Internal error",
        _ => "Unknown error",
    }
}
