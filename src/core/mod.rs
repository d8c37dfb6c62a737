//! Core module containing the main functionality of sshterm
//!
//! This module provides:
//! - SSH transport with a non-blocking interactive shell and a connect worker
//! - Stream dispatch between terminal output and ZMODEM traffic
//! - ANSI/VT interpretation into styled text runs
//! - ZMODEM framing and the upload (sender) state machine
//! - The terminal session tying these together

pub mod dispatch;
pub mod history;
pub mod protocol;
pub mod session;
pub mod terminal;
pub mod transfer;
pub mod transport;
