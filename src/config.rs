//! Bridge configuration
//!
//! Resolution order: built-in defaults, then `config.toml` under the user's
//! config directory, then `ASK_CONTINUE_*` environment variables. CLI flags are
//! applied on top by the binary.

use crate::protocol::{DEFAULT_CALLBACK_PORT, DEFAULT_HOST_PORT};
use crate::{BridgeError, Result};
use serde::Deserialize;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// How long a requester waits for an answer by default (5 minutes)
pub const DEFAULT_ASK_TIMEOUT: Duration = Duration::from_secs(300);

/// How long an undelivered ask may be re-opened (30 minutes)
pub const DEFAULT_REOPEN_WINDOW: Duration = Duration::from_secs(30 * 60);

/// Extra ports tried after the base port is taken
pub const DEFAULT_MAX_PORT_RETRIES: u16 = 3;

/// Width of the stale-listener scan that starts at the default callback port
const SWEEP_RANGE_WIDTH: u16 = 50;

/// Directory name under the system temp dir holding discovery records
const PORTS_DIR_NAME: &str = "ask-continue-ports";

/// Configuration shared by the requester, the UI host and the sweeper
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Base port for the host's ask endpoint
    pub host_port: u16,

    /// Callback port used when an ask omits `callbackPort`
    pub default_callback_port: u16,

    /// Per-ask wait before the requester gives up
    pub ask_timeout: Duration,

    /// How long an undelivered ask stays re-openable
    pub reopen_window: Duration,

    /// Number of `host_port + n` retries on bind conflict
    pub max_port_retries: u16,

    /// Pause between bind retries
    pub port_retry_delay: Duration,

    /// Pause between sweeping and re-binding on restart
    pub restart_settle: Duration,

    /// Requester -> host `/ask` timeout
    pub dispatch_timeout: Duration,

    /// Host -> requester `/response` timeout
    pub reply_timeout: Duration,

    /// Ports scanned for orphaned listeners
    pub sweep_range: RangeInclusive<u16>,

    /// Maximum in-flight listener probes during a sweep
    pub sweep_concurrency: usize,

    /// Directory holding one discovery record per host process
    pub discovery_dir: PathBuf,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host_port: DEFAULT_HOST_PORT,
            default_callback_port: DEFAULT_CALLBACK_PORT,
            ask_timeout: DEFAULT_ASK_TIMEOUT,
            reopen_window: DEFAULT_REOPEN_WINDOW,
            max_port_retries: DEFAULT_MAX_PORT_RETRIES,
            port_retry_delay: Duration::from_millis(100),
            restart_settle: Duration::from_millis(500),
            dispatch_timeout: Duration::from_secs(10),
            reply_timeout: Duration::from_secs(5),
            sweep_range: DEFAULT_CALLBACK_PORT..=DEFAULT_CALLBACK_PORT + SWEEP_RANGE_WIDTH,
            sweep_concurrency: 16,
            discovery_dir: std::env::temp_dir().join(PORTS_DIR_NAME),
        }
    }
}

/// On-disk shape of `config.toml`; every key is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigToml {
    host_port: Option<u16>,
    default_callback_port: Option<u16>,
    ask_timeout_ms: Option<u64>,
    reopen_window_secs: Option<u64>,
    max_port_retries: Option<u16>,
    sweep_start: Option<u16>,
    sweep_end: Option<u16>,
    sweep_concurrency: Option<usize>,
    discovery_dir: Option<PathBuf>,
}

impl BridgeConfig {
    /// Load defaults, the user's `config.toml`, then environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Like [`BridgeConfig::load`], reading `path` instead of the default
    /// location. An explicit path must exist.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        match path {
            Some(path) => config = config.merge_file(path)?,
            None => {
                if let Some(path) = Self::default_config_path().filter(|p| p.exists()) {
                    config = config.merge_file(&path)?;
                }
            }
        }
        config.apply_env(|key| std::env::var(key).ok())
    }

    /// `<config dir>/ask-continue/config.toml`
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ask-continue").join("config.toml"))
    }

    /// Overlay the keys present in a TOML file.
    pub fn merge_file(self, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        debug!("Loading config from {}", path.display());
        self.merge_toml(&content)
    }

    fn merge_toml(mut self, content: &str) -> Result<Self> {
        let file: ConfigToml =
            toml::from_str(content).map_err(|e| BridgeError::Config(e.to_string()))?;

        if let Some(port) = file.host_port {
            self.host_port = port;
        }
        if let Some(port) = file.default_callback_port {
            self.default_callback_port = port;
        }
        if let Some(ms) = file.ask_timeout_ms {
            self.ask_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = file.reopen_window_secs {
            self.reopen_window = Duration::from_secs(secs);
        }
        if let Some(retries) = file.max_port_retries {
            self.max_port_retries = retries;
        }
        let start = file.sweep_start.unwrap_or(*self.sweep_range.start());
        let end = file.sweep_end.unwrap_or(*self.sweep_range.end());
        if start > end {
            return Err(BridgeError::Config(format!(
                "sweep_start ({start}) is after sweep_end ({end})"
            )));
        }
        self.sweep_range = start..=end;
        if let Some(concurrency) = file.sweep_concurrency {
            self.sweep_concurrency = concurrency.max(1);
        }
        if let Some(dir) = file.discovery_dir {
            self.discovery_dir = dir;
        }
        Ok(self)
    }

    /// Apply `ASK_CONTINUE_PORT`, `ASK_CONTINUE_TIMEOUT_MS` and
    /// `ASK_CONTINUE_PORTS_DIR`.
    fn apply_env(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(port) = var("ASK_CONTINUE_PORT") {
            self.host_port = port
                .trim()
                .parse()
                .map_err(|_| BridgeError::Config(format!("invalid ASK_CONTINUE_PORT: {port}")))?;
        }
        if let Some(ms) = var("ASK_CONTINUE_TIMEOUT_MS") {
            let ms: u64 = ms.trim().parse().map_err(|_| {
                BridgeError::Config(format!("invalid ASK_CONTINUE_TIMEOUT_MS: {ms}"))
            })?;
            self.ask_timeout = Duration::from_millis(ms);
        }
        if let Some(dir) = var("ASK_CONTINUE_PORTS_DIR") {
            self.discovery_dir = PathBuf::from(dir);
        }
        Ok(self)
    }

    pub fn with_host_port(mut self, port: u16) -> Self {
        self.host_port = port;
        self
    }

    pub fn with_ask_timeout(mut self, timeout: Duration) -> Self {
        self.ask_timeout = timeout;
        self
    }

    pub fn with_reopen_window(mut self, window: Duration) -> Self {
        self.reopen_window = window;
        self
    }

    pub fn with_discovery_dir(mut self, dir: PathBuf) -> Self {
        self.discovery_dir = dir;
        self
    }

    pub fn with_sweep_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.sweep_range = range;
        self
    }

    pub fn with_restart_settle(mut self, settle: Duration) -> Self {
        self.restart_settle = settle;
        self
    }

    /// Last port the host will try before reporting a conflict.
    pub fn last_host_port(&self) -> u16 {
        self.host_port.saturating_add(self.max_port_retries)
    }
}
