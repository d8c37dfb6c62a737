//! Connect worker
//!
//! The resolve/handshake/authenticate/open-shell sequence blocks, so it runs
//! on its own thread. The result comes back through a single-slot channel that
//! the poll loop checks without blocking.

use super::{SshConfig, SshTransport, TransportError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Pending connect result
#[derive(Debug)]
pub struct ConnectHandle {
    rx: Receiver<Result<SshTransport, TransportError>>,
    thread: Option<JoinHandle<()>>,
}

/// Start connecting on a worker thread
///
/// With `open_shell` the worker also opens the interactive shell, so the
/// returned transport is ready for polling.
pub fn spawn_connect(config: SshConfig, open_shell: bool) -> Result<ConnectHandle, TransportError> {
    let (tx, rx) = bounded(1);
    let thread = thread::Builder::new()
        .name("ssh-connect".to_string())
        .spawn(move || {
            let result = SshTransport::connect(config).and_then(|mut transport| {
                if open_shell {
                    transport.open_shell()?;
                }
                Ok(transport)
            });
            if let Err(ref e) = result {
                tracing::warn!("Connect failed: {}", e);
            }
            // Receiver gone means nobody is waiting any more
            let _ = tx.send(result);
        })?;

    Ok(ConnectHandle {
        rx,
        thread: Some(thread),
    })
}

impl ConnectHandle {
    /// Take the result if the worker has finished
    pub fn try_take(&mut self) -> Option<Result<SshTransport, TransportError>> {
        match self.rx.try_recv() {
            Ok(result) => {
                self.join();
                Some(result)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.join();
                Some(Err(TransportError::NotConnected))
            }
        }
    }

    /// Wait up to `timeout` for the result
    pub fn wait(mut self, timeout: Duration) -> Option<Result<SshTransport, TransportError>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => {
                self.join();
                Some(result)
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.join();
                Some(Err(TransportError::NotConnected))
            }
        }
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Connect worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::ConnectStage;
    use std::time::Instant;

    #[test]
    fn test_failure_is_delivered() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = SshConfig::new("127.0.0.1", "u").port(port).timeout(1);
        let mut handle = spawn_connect(config, true).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let result = loop {
            if let Some(result) = handle.try_take() {
                break result;
            }
            assert!(Instant::now() < deadline, "worker never reported");
            std::thread::sleep(Duration::from_millis(10));
        };
        let err = result.unwrap_err();
        assert_eq!(err.stage(), Some(ConnectStage::Socket));
    }
}
