//! SSH transport implementation
//!
//! Provides SSH-2 protocol support with:
//! - Password and public key (optionally passphrase protected) authentication
//! - One-shot command execution capturing stdout and stderr
//! - An interactive PTY shell read in non-blocking mode
//! - Keepalive and a polite `exit` on disconnect

use super::{ConnectStage, SessionState, ShellChannel, TransportError, TransportStats};
use bytes::Bytes;
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Largest amount drained from the shell in one poll
const MAX_POLL_BYTES: usize = 256 * 1024;

/// Pause after sending `exit` so the remote shell can see it
const EXIT_GRACE: Duration = Duration::from_millis(100);

/// Back-off while an exec'd command produces nothing
const EXEC_IDLE: Duration = Duration::from_millis(5);

/// SSH authentication method
#[derive(Clone)]
pub enum SshAuth {
    /// Password authentication
    Password(String),
    /// Public key authentication
    PublicKey {
        /// Path to private key file
        private_key: PathBuf,
        /// Optional passphrase for encrypted keys
        passphrase: Option<String>,
    },
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(***)"),
            Self::PublicKey {
                private_key,
                passphrase,
            } => f
                .debug_struct("PublicKey")
                .field("private_key", private_key)
                .field("passphrase", &passphrase.as_ref().map(|_| "***"))
                .finish(),
        }
    }
}

/// SSH connection configuration
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Hostname or IP address
    pub host: String,
    /// Port (default: 22)
    pub port: u16,
    /// Username
    pub username: String,
    /// Authentication method
    pub auth: SshAuth,
    /// Connection timeout in seconds
    pub timeout_secs: u64,
    /// Keepalive interval (0 = disabled)
    pub keepalive_secs: u32,
    /// Terminal type for PTY
    pub term_type: String,
    /// Terminal width
    pub term_width: u32,
    /// Terminal height
    pub term_height: u32,
}

impl SshConfig {
    /// Create a new SSH configuration with defaults
    pub fn new(host: &str, username: &str) -> Self {
        Self {
            host: host.to_string(),
            port: 22,
            username: username.to_string(),
            auth: SshAuth::Password(String::new()),
            timeout_secs: 30,
            keepalive_secs: 60,
            term_type: "xterm".to_string(),
            term_width: 80,
            term_height: 24,
        }
    }

    /// Set port
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set password authentication
    #[must_use]
    pub fn password(mut self, password: &str) -> Self {
        self.auth = SshAuth::Password(password.to_string());
        self
    }

    /// Set public key authentication
    #[must_use]
    pub fn private_key(mut self, path: PathBuf, passphrase: Option<String>) -> Self {
        self.auth = SshAuth::PublicKey {
            private_key: path,
            passphrase,
        };
        self
    }

    /// Set connect timeout
    #[must_use]
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Set keepalive interval
    #[must_use]
    pub fn keepalive(mut self, secs: u32) -> Self {
        self.keepalive_secs = secs;
        self
    }

    /// Set PTY terminal type
    #[must_use]
    pub fn term_type(mut self, term: &str) -> Self {
        self.term_type = term.to_string();
        self
    }

    /// Set terminal size
    #[must_use]
    pub fn terminal_size(mut self, width: u32, height: u32) -> Self {
        self.term_width = width;
        self.term_height = height;
        self
    }

    /// `user@host:port`
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Captured result of a one-shot command
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CommandOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Remote exit status
    pub exit_status: i32,
}

impl CommandOutput {
    /// Build from raw stream bytes; invalid UTF-8 is replaced, not rejected
    pub fn from_bytes(stdout: &[u8], stderr: &[u8], exit_status: i32) -> Self {
        Self {
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
            exit_status,
        }
    }
}

/// What `exec_command` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Ran on its own channel and was captured
    Captured(CommandOutput),
    /// Written into the active interactive shell; output arrives via `poll`
    SentToShell,
}

/// SSH transport using ssh2 crate (libssh2 bindings)
pub struct SshTransport {
    config: SshConfig,
    session: Option<ssh2::Session>,
    channel: Option<ssh2::Channel>,
    state: SessionState,
    stats: TransportStats,
    connected_at: Option<Instant>,
}

impl fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTransport")
            .field("target", &self.config.target())
            .field("state", &self.state)
            .finish()
    }
}

impl SshTransport {
    /// Resolve, connect, handshake and authenticate
    ///
    /// Blocks for up to the configured timeout; run it on the connect worker.
    pub fn connect(config: SshConfig) -> Result<Self, TransportError> {
        tracing::info!("Connecting to {}", config.target());

        let addrs: Vec<SocketAddr> = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::connection(ConnectStage::Resolve, e))?
            .collect();
        if addrs.is_empty() {
            return Err(TransportError::connection(
                ConnectStage::Resolve,
                format!("no addresses for {}", config.host),
            ));
        }
        tracing::debug!("Resolved {} to {:?}", config.host, addrs);

        let tcp = Self::open_socket(&addrs, Duration::from_secs(config.timeout_secs))?;

        let mut session = ssh2::Session::new()
            .map_err(|e| TransportError::connection(ConnectStage::Handshake, e))?;
        session.set_timeout(u32::try_from(config.timeout_secs * 1000).unwrap_or(u32::MAX));
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| TransportError::connection(ConnectStage::Handshake, e))?;
        tracing::debug!("SSH handshake complete");

        Self::authenticate(&session, &config)?;
        tracing::info!("Authenticated as {}", config.username);

        if config.keepalive_secs > 0 {
            session.set_keepalive(true, config.keepalive_secs);
        }

        Ok(Self {
            config,
            session: Some(session),
            channel: None,
            state: SessionState::Authenticated,
            stats: TransportStats::default(),
            connected_at: Some(Instant::now()),
        })
    }

    fn open_socket(addrs: &[SocketAddr], timeout: Duration) -> Result<TcpStream, TransportError> {
        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!("Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }
        Err(TransportError::connection(
            ConnectStage::Socket,
            last_error.map_or_else(|| "no address".to_string(), |e| e.to_string()),
        ))
    }

    /// Authenticate with the configured method
    fn authenticate(session: &ssh2::Session, config: &SshConfig) -> Result<(), TransportError> {
        match &config.auth {
            SshAuth::Password(password) => {
                tracing::debug!("Trying password authentication");
                session
                    .userauth_password(&config.username, password)
                    .map_err(|e| TransportError::Auth(format!("Password auth failed: {}", e)))?;
            }
            SshAuth::PublicKey {
                private_key,
                passphrase,
            } => {
                tracing::debug!("Trying public key {}", private_key.display());
                session
                    .userauth_pubkey_file(
                        &config.username,
                        None,
                        private_key,
                        passphrase.as_deref(),
                    )
                    .map_err(|e| TransportError::Auth(format!("Key auth failed: {}", e)))?;
            }
        }

        if !session.authenticated() {
            return Err(TransportError::Auth("Authentication failed".to_string()));
        }
        Ok(())
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Connection configuration
    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Traffic counters
    pub fn stats(&self) -> TransportStats {
        let mut stats = self.stats.clone();
        if let Some(connected_at) = self.connected_at {
            stats.uptime_secs = connected_at.elapsed().as_secs();
        }
        stats
    }

    /// Open a PTY shell and switch the session to non-blocking mode
    pub fn open_shell(&mut self) -> Result<(), TransportError> {
        let session = self.session.as_ref().ok_or(TransportError::NotConnected)?;

        let mut channel = session
            .channel_session()
            .map_err(|e| TransportError::Channel(format!("Channel open failed: {}", e)))?;

        channel
            .request_pty(
                &self.config.term_type,
                None,
                Some((self.config.term_width, self.config.term_height, 0, 0)),
            )
            .map_err(|e| TransportError::Channel(format!("PTY request failed: {}", e)))?;

        channel
            .shell()
            .map_err(|e| TransportError::Channel(format!("Shell request failed: {}", e)))?;

        session.set_blocking(false);
        self.channel = Some(channel);
        self.state = SessionState::ShellActive;
        tracing::info!("Interactive shell opened ({})", self.config.term_type);
        Ok(())
    }

    /// Run a command
    ///
    /// Without a shell this opens a channel, runs the command and reads both
    /// streams to EOF, alternating between them so neither window fills up. With an active shell the command line is typed into the
    /// shell instead.
    pub fn exec_command(&mut self, command: &str) -> Result<ExecOutcome, TransportError> {
        if self.state == SessionState::ShellActive {
            let line = format!("{}\n", command);
            self.write_all_shell(line.as_bytes())?;
            return Ok(ExecOutcome::SentToShell);
        }

        let session = self.session.as_ref().ok_or(TransportError::NotConnected)?;
        tracing::debug!("Executing: {}", command);

        let mut channel = session
            .channel_session()
            .map_err(|e| TransportError::Channel(format!("Channel open failed: {}", e)))?;
        channel
            .exec(command)
            .map_err(|e| TransportError::Channel(format!("Exec failed: {}", e)))?;

        let mut out_stream = channel.stream(0);
        let mut err_stream = channel.stderr();
        session.set_blocking(false);
        let drained = drain_streams(&mut out_stream, &mut err_stream, || channel.eof());
        session.set_blocking(true);
        let (stdout, stderr) = drained?;

        channel
            .wait_close()
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        let exit_status = channel
            .exit_status()
            .map_err(|e| TransportError::Channel(e.to_string()))?;

        self.stats.bytes_received += (stdout.len() + stderr.len()) as u64;
        self.stats.reads += 1;

        Ok(ExecOutcome::Captured(CommandOutput::from_bytes(
            &stdout,
            &stderr,
            exit_status,
        )))
    }

    /// Write a whole buffer to the shell, spinning over would-block
    fn write_all_shell(&mut self, mut data: &[u8]) -> Result<(), TransportError> {
        let deadline = Instant::now() + Duration::from_secs(self.config.timeout_secs);
        while !data.is_empty() {
            let n = self.send(data)?;
            if n == 0 {
                if Instant::now() >= deadline {
                    return Err(TransportError::Io(ErrorKind::TimedOut.into()));
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            data = &data[n..];
        }
        Ok(())
    }

    /// Close the shell and session
    ///
    /// An active shell gets `exit\n` and a short pause first.
    pub fn disconnect(&mut self) {
        if self.state == SessionState::ShellActive {
            if let Err(e) = self.write_all_shell(b"exit\n") {
                tracing::debug!("Could not send exit: {}", e);
            }
            std::thread::sleep(EXIT_GRACE);
        }

        if let Some(mut channel) = self.channel.take() {
            let _ = channel.close();
        }
        if let Some(session) = self.session.take() {
            let _ = session.disconnect(None, "User disconnect", None);
        }
        self.connected_at = None;
        self.state = SessionState::Disconnected;
        tracing::info!("Disconnected from {}", self.config.target());
    }
}

/// Read stdout and stderr side by side until EOF and both are empty
///
/// Both readers must be non-blocking (`WouldBlock` when idle, `Ok(0)` at end).
fn drain_streams<O: Read, E: Read>(
    stdout: &mut O,
    stderr: &mut E,
    at_eof: impl Fn() -> bool,
) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut buffer = [0u8; 16 * 1024];
    loop {
        let got_out = read_available(stdout, &mut out, &mut buffer)?;
        let got_err = read_available(stderr, &mut err, &mut buffer)?;
        if got_out || got_err {
            continue;
        }
        if at_eof() {
            return Ok((out, err));
        }
        std::thread::sleep(EXEC_IDLE);
    }
}

/// Append whatever `reader` has right now; true if anything was read
fn read_available<R: Read>(
    reader: &mut R,
    sink: &mut Vec<u8>,
    buffer: &mut [u8],
) -> std::io::Result<bool> {
    let mut got = false;
    loop {
        match reader.read(buffer) {
            Ok(0) => return Ok(got),
            Ok(n) => {
                sink.extend_from_slice(&buffer[..n]);
                got = true;
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(got),
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

impl ShellChannel for SshTransport {
    fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let channel = self.channel.as_mut().ok_or(TransportError::NotConnected)?;

        let written = match channel.write(data) {
            Ok(n) => n,
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => 0,
            Err(e) => return Err(TransportError::Io(e)),
        };
        match channel.flush() {
            Ok(()) => {}
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(TransportError::Io(e)),
        }

        if written > 0 {
            self.stats.bytes_sent += written as u64;
            self.stats.writes += 1;
        }
        Ok(written)
    }

    fn poll(&mut self) -> Result<Option<Bytes>, TransportError> {
        let channel = self.channel.as_mut().ok_or(TransportError::NotConnected)?;

        let mut collected = Vec::new();
        let mut buffer = [0u8; 16 * 1024];
        while collected.len() < MAX_POLL_BYTES {
            match channel.read(&mut buffer) {
                Ok(0) => {
                    if channel.eof() && collected.is_empty() {
                        tracing::info!("Remote closed the shell channel");
                        self.state = SessionState::Disconnected;
                        return Err(TransportError::Disconnected);
                    }
                    break;
                }
                Ok(n) => collected.extend_from_slice(&buffer[..n]),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(TransportError::Io(e)),
            }
        }

        if collected.is_empty() {
            return Ok(None);
        }
        self.stats.bytes_received += collected.len() as u64;
        self.stats.reads += 1;
        Ok(Some(Bytes::from(collected)))
    }

    fn keepalive(&mut self) -> Result<(), TransportError> {
        let Some(session) = self.session.as_ref() else {
            return Err(TransportError::NotConnected);
        };
        if self.config.keepalive_secs == 0 {
            return Ok(());
        }
        match session.keepalive_send() {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = std::io::Error::from(e);
                if err.kind() == ErrorKind::WouldBlock {
                    Ok(())
                } else {
                    Err(TransportError::Io(err))
                }
            }
        }
    }
}

impl Drop for SshTransport {
    fn drop(&mut self) {
        if self.session.is_some() {
            self.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// Non-blocking reader fed from a script; empty script means idle or EOF
    struct ScriptedStream {
        script: VecDeque<Vec<u8>>,
        /// Stays idle until this flag is set
        gate: Option<Rc<Cell<bool>>>,
        /// Set once the script is used up
        drained: Rc<Cell<bool>>,
        closed: bool,
    }

    impl ScriptedStream {
        fn new(chunks: &[&[u8]]) -> Self {
            Self {
                script: chunks.iter().map(|c| c.to_vec()).collect(),
                gate: None,
                drained: Rc::new(Cell::new(false)),
                closed: false,
            }
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.gate.as_ref().is_some_and(|g| !g.get()) {
                return Err(ErrorKind::WouldBlock.into());
            }
            match self.script.pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    // Report one chunk per wake-up
                    Ok(chunk.len())
                }
                None => {
                    self.drained.set(true);
                    if self.closed {
                        Ok(0)
                    } else {
                        self.closed = true;
                        Err(ErrorKind::WouldBlock.into())
                    }
                }
            }
        }
    }

    #[test]
    fn test_drain_reads_stderr_before_stdout_ends() {
        let mut stderr = ScriptedStream::new(&[b"warn 1\n", b"warn 2\n"]);
        let mut stdout = ScriptedStream::new(&[b"result\n"]);
        // stdout only produces once stderr has been emptied
        stdout.gate = Some(Rc::clone(&stderr.drained));
        let out_done = Rc::clone(&stdout.drained);

        let (out, err) = drain_streams(&mut stdout, &mut stderr, || out_done.get()).unwrap();
        assert_eq!(out, b"result\n");
        assert_eq!(err, b"warn 1\nwarn 2\n");
    }

    #[test]
    fn test_command_output_keeps_invalid_utf8() {
        let output = CommandOutput::from_bytes(b"ok \xff\n", b"", 1);
        assert_eq!(output.stdout, "ok \u{fffd}\n");
        assert_eq!(output.stderr, "");
        assert_eq!(output.exit_status, 1);
    }

    #[test]
    fn test_config_builder() {
        let config = SshConfig::new("example.org", "alice")
            .port(2222)
            .private_key(PathBuf::from("/home/alice/.ssh/id_ed25519"), None)
            .keepalive(15)
            .term_type("vt100");
        assert_eq!(config.port, 2222);
        assert_eq!(config.keepalive_secs, 15);
        assert_eq!(config.term_type, "vt100");
        assert_eq!(config.target(), "alice@example.org:2222");
        assert!(matches!(config.auth, SshAuth::PublicKey { .. }));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let config = SshConfig::new("h", "u").password("hunter2");
        assert!(!format!("{:?}", config).contains("hunter2"));

        let key = SshAuth::PublicKey {
            private_key: PathBuf::from("k"),
            passphrase: Some("secret".into()),
        };
        assert!(!format!("{:?}", key).contains("secret"));
    }

    #[test]
    fn test_resolve_failure_is_tagged() {
        let config = SshConfig::new("host.invalid", "u").timeout(1);
        let err = SshTransport::connect(config).unwrap_err();
        assert!(matches!(
            err.stage(),
            Some(ConnectStage::Resolve) | Some(ConnectStage::Socket)
        ));
    }

    #[test]
    fn test_socket_failure_is_tagged() {
        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = SshConfig::new("127.0.0.1", "u").port(port).timeout(1);
        let err = SshTransport::connect(config).unwrap_err();
        assert_eq!(err.stage(), Some(ConnectStage::Socket));
    }
}
