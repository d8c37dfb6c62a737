//! Application settings and connection profiles

use super::ConfigError;
use crate::core::session::SessionConfig;
use crate::core::terminal::{Rgb, StyleState};
use crate::core::transfer::TransferConfig;
use crate::core::transport::SshConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest accepted data subpacket
pub const MAX_PACKET_SIZE: usize = 8192;

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Terminal settings
    pub terminal: TerminalConfig,
    /// Upload engine settings
    pub transfer: TransferSettings,
    /// Logging settings
    pub logging: LoggingConfig,
    /// Saved connection profiles
    pub profiles: Vec<ConnectionProfile>,
}

impl AppConfig {
    /// Load config from the default location
    ///
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::config_file().ok_or(ConfigError::NoConfigDir)?;
        Self::load_from(&path)
    }

    /// Load config from `path`
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = super::config_file().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)
    }

    /// Save config to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(io_err)?;
        Ok(())
    }

    /// Check ranges and colors
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transfer;
        if t.packet_size == 0 || t.packet_size > MAX_PACKET_SIZE {
            return Err(ConfigError::Invalid(format!(
                "transfer.packet_size must be 1..={}, got {}",
                MAX_PACKET_SIZE, t.packet_size
            )));
        }
        for (name, value) in [
            ("transfer.timeout_secs", t.timeout_secs),
            ("transfer.ack_interval", u64::from(t.ack_interval)),
            ("transfer.cancel_run", t.cancel_run as u64),
            ("terminal.poll_interval_ms", self.terminal.poll_interval_ms),
            ("terminal.connect_timeout_secs", self.terminal.connect_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be nonzero", name)));
            }
        }
        if self.terminal.detection_buffer < 16 {
            return Err(ConfigError::Invalid(
                "terminal.detection_buffer must be at least 16".to_string(),
            ));
        }
        for (name, value) in [
            ("terminal.foreground", &self.terminal.foreground),
            ("terminal.background", &self.terminal.background),
        ] {
            if Rgb::from_hex(value).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "{} is not a #rrggbb color: {:?}",
                    name, value
                )));
            }
        }
        let mut names: Vec<&str> = self.profiles.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        if let Some(w) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(ConfigError::Invalid(format!("duplicate profile {:?}", w[0])));
        }
        Ok(())
    }

    /// Look up a profile by name
    pub fn profile(&self, name: &str) -> Option<&ConnectionProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Session tuning derived from the terminal and transfer sections
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            detection_buffer: self.terminal.detection_buffer,
            keepalive: Duration::from_secs(self.terminal.keepalive_secs),
            transfer: TransferConfig::from(&self.transfer),
        }
    }
}

/// Terminal settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Default foreground, `#rrggbb`
    pub foreground: String,
    /// Default background, `#rrggbb`
    pub background: String,
    /// PTY terminal type
    pub term_type: String,
    /// Poll tick while idle (ms)
    pub poll_interval_ms: u64,
    /// Rolling detection buffer bound (bytes)
    pub detection_buffer: usize,
    /// SSH keepalive interval (0 = disabled)
    pub keepalive_secs: u64,
    /// Connect timeout
    pub connect_timeout_secs: u64,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            foreground: "#DCDCDC".to_string(),
            background: "#1E1E1E".to_string(),
            term_type: "xterm".to_string(),
            poll_interval_ms: 100,
            detection_buffer: crate::core::dispatch::DEFAULT_DETECTION_BUFFER,
            keepalive_secs: 60,
            connect_timeout_secs: 30,
        }
    }
}

impl TerminalConfig {
    /// Style state seeded with the configured defaults
    ///
    /// Unparsable colors fall back to the built-in defaults; `validate`
    /// rejects them on load.
    pub fn style(&self) -> StyleState {
        let fallback = StyleState::default();
        StyleState::new(
            Rgb::from_hex(&self.foreground).unwrap_or(fallback.default_fg),
            Rgb::from_hex(&self.background).unwrap_or(fallback.default_bg),
        )
    }

    /// Poll tick
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Upload engine settings as stored on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    /// Data bytes per subpacket
    pub packet_size: usize,
    /// Watchdog period
    pub timeout_secs: u64,
    /// Consecutive timeouts tolerated
    pub max_retries: u32,
    /// Request an ACK every n packets
    pub ack_interval: u32,
    /// Cancel run length
    pub cancel_run: usize,
    /// Gap between cancel bytes (ms)
    pub cancel_byte_delay_ms: u64,
    /// Newline delay after a cancel run (ms)
    pub resync_delay_ms: u64,
    /// Pause after ZEOF (ms)
    pub eof_settle_ms: u64,
    /// Prompt restore delay (ms)
    pub restore_delay_ms: u64,
    /// Re-detection cooldown (ms)
    pub cooldown_ms: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self::from(&TransferConfig::default())
    }
}

impl From<&TransferConfig> for TransferSettings {
    fn from(c: &TransferConfig) -> Self {
        let ms = |d: Duration| d.as_millis() as u64;
        Self {
            packet_size: c.packet_size,
            timeout_secs: c.timeout.as_secs(),
            max_retries: c.max_retries,
            ack_interval: c.ack_interval,
            cancel_run: c.cancel_run,
            cancel_byte_delay_ms: ms(c.cancel_byte_delay),
            resync_delay_ms: ms(c.resync_delay),
            eof_settle_ms: ms(c.eof_settle),
            restore_delay_ms: ms(c.restore_delay),
            cooldown_ms: ms(c.cooldown),
        }
    }
}

impl From<&TransferSettings> for TransferConfig {
    fn from(s: &TransferSettings) -> Self {
        Self {
            packet_size: s.packet_size,
            timeout: Duration::from_secs(s.timeout_secs),
            max_retries: s.max_retries,
            ack_interval: s.ack_interval,
            cancel_run: s.cancel_run,
            cancel_byte_delay: Duration::from_millis(s.cancel_byte_delay_ms),
            resync_delay: Duration::from_millis(s.resync_delay_ms),
            eof_settle: Duration::from_millis(s.eof_settle_ms),
            restore_delay: Duration::from_millis(s.restore_delay_ms),
            cooldown: Duration::from_millis(s.cooldown_ms),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (`RUST_LOG` overrides)
    pub level: String,
    /// Write daily log files here instead of stderr
    pub directory: Option<PathBuf>,
    /// JSON formatted records
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            json: false,
        }
    }
}

/// Saved connection (never holds secrets)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    /// Profile name
    pub name: String,
    /// Hostname or address
    pub host: String,
    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login name
    pub username: String,
    /// Private key for public key authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
}

fn default_port() -> u16 {
    22
}

impl ConnectionProfile {
    /// Create a profile
    pub fn new(name: &str, host: &str, username: &str) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port: default_port(),
            username: username.to_string(),
            key_file: None,
        }
    }

    /// `user@host:port`
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    /// SSH settings for this profile; the caller adds the password if needed
    pub fn ssh_config(&self, terminal: &TerminalConfig) -> SshConfig {
        let mut config = SshConfig::new(&self.host, &self.username)
            .port(self.port)
            .timeout(terminal.connect_timeout_secs)
            .keepalive(u32::try_from(terminal.keepalive_secs).unwrap_or(u32::MAX))
            .term_type(&terminal.term_type);
        if let Some(key) = &self.key_file {
            config = config.private_key(key.clone(), None);
        }
        config
    }
}
