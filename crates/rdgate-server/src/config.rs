//! Gateway configuration: TOML file + CLI overrides.

use crate::backend::BackendConfig;
use rdgate_core::{Cipher, GatewayError, GatewayResult, ProtocolTable, Settings, TokenCodec};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub crypt: CryptSection,
    #[serde(default)]
    pub drive: DriveSection,
    #[serde(default)]
    pub events: EventsSection,
    /// Per-protocol profiles. Empty means the built-in table.
    #[serde(default)]
    pub protocols: BTreeMap<String, ProtocolSection>,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_inactivity_ms")]
    pub max_inactivity_ms: u64,
    #[serde(default)]
    pub max_connections: usize,
    #[serde(default = "default_resource_param")]
    pub resource_param: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_inactivity_ms: default_inactivity_ms(),
            max_connections: 0,
            resource_param: default_resource_param(),
        }
    }
}

/// `[backend]` section: where the remote-desktop daemon listens.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    #[serde(default = "default_backend_host")]
    pub host: String,
    #[serde(default = "default_backend_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_inactivity_ms")]
    pub inactivity_ms: u64,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            host: default_backend_host(),
            port: default_backend_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            inactivity_ms: default_inactivity_ms(),
        }
    }
}

/// `[crypt]` section. Exactly one key source is used, tried in the order
/// `key`, `key_file`, `key_env`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CryptSection {
    #[serde(default)]
    pub cipher: Option<String>,
    /// Hex-encoded key.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
    #[serde(default)]
    pub key_env: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DriveSection {
    #[serde(default)]
    pub root: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventsSection {
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// `[protocols.<name>]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProtocolSection {
    #[serde(default)]
    pub defaults: Settings,
    #[serde(default)]
    pub allowed: Vec<String>,
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_port() -> u16 {
    8080
}
fn default_inactivity_ms() -> u64 {
    10_000
}
fn default_resource_param() -> String {
    "resource".to_string()
}
fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}
fn default_backend_port() -> u16 {
    4822
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}

/// Values given on the command line; each one wins over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub backend_host: Option<String>,
    pub backend_port: Option<u16>,
    pub max_inactivity_ms: Option<u64>,
}

/// Resolved gateway configuration (key loaded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub max_inactivity: Option<Duration>,
    pub max_connections: Option<usize>,
    pub resource_param: String,
    pub backend: BackendConfig,
    pub token_codec: Arc<TokenCodec>,
    pub protocols: ProtocolTable,
    pub drive_root: Option<PathBuf>,
    pub webhook_url: Option<String>,
}

impl GatewayConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    ///
    /// A missing file means defaults, but the key must still come from
    /// somewhere; without one this fails.
    pub fn load(config_path: &Path, overrides: &Overrides) -> GatewayResult<Self> {
        let expanded = expand_tilde(config_path);
        let file = if expanded.exists() {
            info!(path = %expanded.display(), "loading config file");
            let content = std::fs::read_to_string(&expanded)?;
            parse(&content)?
        } else {
            info!(path = %expanded.display(), "config file not found, using defaults");
            ConfigFile::default()
        };
        Self::resolve(file, overrides)
    }

    pub fn resolve(file: ConfigFile, overrides: &Overrides) -> GatewayResult<Self> {
        let cipher = match &file.crypt.cipher {
            Some(name) => name.parse::<Cipher>()?,
            None => Cipher::default(),
        };
        let key = load_key(&file.crypt)?;
        let token_codec = Arc::new(TokenCodec::from_hex(cipher, &key)?);

        let protocols = if file.protocols.is_empty() {
            ProtocolTable::builtin()
        } else {
            let mut table = ProtocolTable::default();
            for (name, section) in file.protocols {
                table.insert(name, section.defaults, section.allowed);
            }
            table
        };

        let backend_host = overrides
            .backend_host
            .clone()
            .unwrap_or(file.backend.host);
        let backend_port = overrides.backend_port.unwrap_or(file.backend.port);
        let max_inactivity_ms = overrides
            .max_inactivity_ms
            .unwrap_or(file.server.max_inactivity_ms);

        Ok(Self {
            bind: file.server.bind,
            port: overrides.port.unwrap_or(file.server.port),
            max_inactivity: millis(max_inactivity_ms),
            max_connections: (file.server.max_connections > 0)
                .then_some(file.server.max_connections),
            resource_param: file.server.resource_param,
            backend: BackendConfig {
                addr: format!("{backend_host}:{backend_port}"),
                connect_timeout: Duration::from_millis(file.backend.connect_timeout_ms),
                inactivity: millis(file.backend.inactivity_ms),
            },
            token_codec,
            protocols,
            drive_root: file.drive.root.as_deref().map(expand_tilde_str),
            webhook_url: file.events.webhook_url,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Parse config TOML.
pub fn parse(content: &str) -> GatewayResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| GatewayError::Config(format!("config parse error: {e}")))
}

/// 0 disables.
fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn load_key(crypt: &CryptSection) -> GatewayResult<String> {
    if let Some(key) = &crypt.key {
        return Ok(key.trim().to_string());
    }
    if let Some(path) = &crypt.key_file {
        let path = expand_tilde_str(path);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            GatewayError::Config(format!("cannot read key file {}: {e}", path.display()))
        })?;
        return Ok(content.trim().to_string());
    }
    if let Some(var) = &crypt.key_env {
        let value = std::env::var(var)
            .map_err(|_| GatewayError::Config(format!("key variable {var} is not set")))?;
        return Ok(value.trim().to_string());
    }
    Err(GatewayError::Config(
        "no encryption key configured (set crypt.key, crypt.key_file or crypt.key_env)".into(),
    ))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
