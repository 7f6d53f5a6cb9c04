//! Session configuration.
//!
//! Everything is optional in TOML; missing sections fall back to defaults.
//!
//! ```toml
//! [target]
//! host = "192.168.1.100"
//! credential = "00112233445566778899aabbccddeeff"
//! console = "ps5_1"
//!
//! [video]
//! resolution = "720p"
//! fps = "60"
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::profile::{Codec, FpsPreset, ResolutionPreset, Target, VideoProfile};
use crate::video::DEFAULT_POOL_SIZE;

/// Length of the registration credential in bytes.
pub const CREDENTIAL_SIZE: usize = 16;

/// Control port used when the host string carries none.
pub const DEFAULT_CONTROL_PORT: u16 = 9295;

// ── ConnectTarget ────────────────────────────────────────────────

/// A validated host address plus registration credential.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    host: String,
    port: u16,
    credential: [u8; CREDENTIAL_SIZE],
    console: Target,
}

impl std::fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("credential", &self.fingerprint())
            .field("console", &self.console)
            .finish()
    }
}

impl ConnectTarget {
    /// Validate `host` (`ip`, `name`, `ip:port`, `name:port` or `[v6]:port`)
    /// and a credential of exactly [`CREDENTIAL_SIZE`] bytes.
    pub fn new(host: &str, credential: &[u8]) -> Result<Self, SessionError> {
        let credential: [u8; CREDENTIAL_SIZE] = credential.try_into().map_err(|_| {
            SessionError::InvalidConfig(format!(
                "credential must be {CREDENTIAL_SIZE} bytes, got {}",
                credential.len()
            ))
        })?;
        let (host, port) = parse_host(host)?;
        Ok(Self {
            host,
            port,
            credential,
            console: Target::default(),
        })
    }

    pub fn with_console(mut self, console: Target) -> Self {
        self.console = console;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn credential(&self) -> &[u8; CREDENTIAL_SIZE] {
        &self.credential
    }

    pub fn console(&self) -> Target {
        self.console
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{}]:{}", self.host, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    /// Short credential digest, safe to log.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.credential);
        hex::encode(&hash.as_bytes()[..4])
    }
}

fn parse_host(raw: &str) -> Result<(String, u16), SessionError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(SessionError::InvalidConfig("host is empty".into()));
    }
    if raw.chars().any(char::is_whitespace) {
        return Err(SessionError::InvalidConfig(format!("host contains whitespace: {raw:?}")));
    }
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok((addr.ip().to_string(), addr.port()));
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Ok((ip.to_string(), DEFAULT_CONTROL_PORT));
    }

    let (name, port) = match raw.rsplit_once(':') {
        Some((name, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| SessionError::InvalidConfig(format!("invalid port in {raw:?}")))?;
            (name, port)
        }
        None => (raw, DEFAULT_CONTROL_PORT),
    };
    let valid_name = !name.is_empty()
        && name.len() <= 253
        && name
            .split('.')
            .all(|label| {
                !label.is_empty()
                    && !label.starts_with('-')
                    && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            });
    if !valid_name {
        return Err(SessionError::InvalidConfig(format!("invalid host name {raw:?}")));
    }
    Ok((name.to_string(), port))
}

// ── SessionConfig ────────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub target: TargetConfig,
    pub video: VideoConfig,
    pub timeouts: TimeoutConfig,
    pub runtime: RuntimeConfig,
}

/// Host and credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Host address, optionally with `:port`. Empty means "initialize later".
    pub host: String,
    /// Registration credential as 32 hex characters.
    pub credential: String,
    pub console: Target,
}

/// Requested stream parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub resolution: ResolutionPreset,
    pub fps: FpsPreset,
    pub codec: Codec,
    /// Number of reusable frame buffers (2..=8).
    pub frame_pool: usize,
}

/// Handshake deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_ms: u64,
    pub login_ms: u64,
}

/// Internal runtime sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub worker_threads: usize,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            credential: String::new(),
            console: Target::default(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            resolution: ResolutionPreset::default(),
            fps: FpsPreset::default(),
            codec: Codec::default(),
            frame_pool: DEFAULT_POOL_SIZE,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 5_000,
            login_ms: 5_000,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { worker_threads: 2 }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl SessionConfig {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, SessionError> {
        Ok(toml::from_str(contents)?)
    }

    pub fn to_toml(&self) -> Result<String, SessionError> {
        toml::to_string_pretty(self).map_err(|e| SessionError::Config(e.to_string()))
    }

    /// Validated target, or `None` when no host is configured.
    pub fn connect_target(&self) -> Result<Option<ConnectTarget>, SessionError> {
        if self.target.host.trim().is_empty() {
            return Ok(None);
        }
        let credential = hex::decode(self.target.credential.trim())
            .map_err(|e| SessionError::InvalidConfig(format!("credential is not hex: {e}")))?;
        let target = ConnectTarget::new(&self.target.host, &credential)?
            .with_console(self.target.console);
        Ok(Some(target))
    }

    pub fn video_profile(&self) -> VideoProfile {
        VideoProfile::preset(self.video.resolution, self.video.fps, self.video.codec)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.connect_ms)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.login_ms)
    }
}
