//! # sshterm Core Library
//!
//! An interactive SSH terminal client with inline file upload:
//! - SSH-2 shell and one-shot commands (libssh2)
//! - ANSI/VT colors and attributes rendered as styled text runs
//! - ZMODEM upload when the remote shell starts `rz`
//!
//! ## Example
//!
//! ```rust,no_run
//! use sshterm_core::{spawn_connect, BufferSurface, FixedPicker, SshConfig, TerminalSession};
//! use std::time::{Duration, Instant};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = SshConfig::new("example.com", "alice").password("secret");
//!     let transport = spawn_connect(config, true)?
//!         .wait(Duration::from_secs(30))
//!         .ok_or_else(|| anyhow::anyhow!("connect timed out"))??;
//!
//!     let mut session = TerminalSession::new(transport, Default::default(), Default::default());
//!     let mut display = BufferSurface::default();
//!     let mut picker = FixedPicker(Some("notes.txt".into()));
//!
//!     session.submit_line(b"rz\n");
//!     while session.is_active() {
//!         session.tick(Instant::now(), &mut display, &mut picker);
//!         std::thread::sleep(Duration::from_millis(10));
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes, OutputFormat};
pub use crate::config::{AppConfig, ConfigError, ConnectionProfile};
pub use crate::core::dispatch::{Dispatcher, Route, Trigger};
pub use crate::core::history::CommandHistory;
pub use crate::core::session::{SessionConfig, SessionEvent, TerminalSession};
pub use crate::core::terminal::{
    AnsiInterpreter, BufferSurface, DisplayOp, DisplaySurface, Rgb, StyleState, StyledRun,
};
pub use crate::core::transfer::{
    FilePicker, FixedPicker, ProtocolFailure, TransferConfig, TransferError, TransferEvent,
    TransferJob, TransferState, ZmodemSender,
};
pub use crate::core::transport::{
    spawn_connect, CommandOutput, ConnectHandle, ConnectStage, ExecOutcome, SessionState,
    ShellChannel, SshAuth, SshConfig, SshTransport, TransportError,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
