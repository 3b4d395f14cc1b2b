use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Fully resolved gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener and presentation settings
    pub gateway: GatewayConfig,

    /// Control plane API access
    pub control_plane: ControlPlaneConfig,

    /// The managed game server
    pub backend: BackendConfig,

    /// Optional local admin API
    pub admin: AdminConfig,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Port for the game listener (`LISTEN_PORT`)
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    pub bind: String,

    /// Seconds before an unanswered start attempt stops blocking new ones
    pub start_cooldown_secs: u64,

    /// Player cap advertised in placeholder status payloads
    pub max_players: u32,

    /// Version name advertised in placeholder status payloads
    pub version_name: String,

    /// Idle timeout for a single client read or write
    pub client_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// Base URL of the panel, without a trailing slash (`PTERO_HOST`)
    pub base_url: String,

    /// Client API key sent as a bearer token (`PTERO_API_KEY`)
    pub api_key: String,

    /// Identifier of the managed server (`PTERO_SERVER_ID`)
    pub server_id: String,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Host the liveness probe connects to (`MINECRAFT_SERVER_HOST`)
    pub host: String,

    /// Port the liveness probe connects to (`MINECRAFT_SERVER_PORT`)
    pub port: u16,

    /// Accepted for compatibility; does not influence any decision
    pub online_mode: bool,

    /// Address players are told to connect to (default: host:port)
    pub public_address: Option<String>,

    /// Liveness probe timeout in milliseconds
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct AdminConfig {
    /// Admin API port on 127.0.0.1; disabled when unset
    pub port: Option<u16>,

    /// Bearer token for authenticated routes; generated when unset
    pub token: Option<String>,
}

impl GatewayConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = self
            .bind
            .trim()
            .parse::<IpAddr>()
            .map_err(|e| ConfigError::Invalid {
                key: "BIND_ADDRESS",
                reason: format!("{:?}: {}", self.bind, e),
            })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn start_cooldown(&self) -> Duration {
        Duration::from_secs(self.start_cooldown_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

impl ControlPlaneConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl BackendConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Address shown to players when the server is up
    pub fn public_address(&self) -> String {
        self.public_address
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port))
    }
}

/// On-disk configuration. Every field is optional; the environment fills
/// in or overrides whatever the file leaves out.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub gateway: GatewayFile,
    pub control_plane: ControlPlaneFile,
    pub backend: BackendFile,
    pub admin: AdminFile,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct GatewayFile {
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub start_cooldown_secs: Option<u64>,
    pub max_players: Option<u32>,
    pub version_name: Option<String>,
    pub client_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ControlPlaneFile {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub server_id: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct BackendFile {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub online_mode: Option<bool>,
    pub public_address: Option<String>,
    pub probe_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AdminFile {
    pub port: Option<u16>,
    pub token: Option<String>,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_start_cooldown() -> u64 {
    30
}

fn default_max_players() -> u32 {
    20
}

fn default_version_name() -> String {
    "Wakegate".to_string()
}

fn default_client_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    2500
}

/// Collects values from the environment and the file, remembering every
/// problem so they can be reported together.
struct Resolver<F> {
    env: F,
    errors: Vec<ConfigError>,
}

impl<F> Resolver<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Environment value if set and non-empty
    fn env(&self, key: &str) -> Option<String> {
        (self.env)(key).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, key: &'static str, file: Option<String>) -> Option<String> {
        self.env(key).or(file)
    }

    fn required_string(&mut self, key: &'static str, file: Option<String>) -> String {
        match self.string(key, file) {
            Some(value) => value,
            None => {
                self.errors.push(ConfigError::Missing(key));
                String::new()
            }
        }
    }

    fn parsed<T>(&mut self, key: &'static str, file: Option<T>) -> Option<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.env(key) {
            Some(raw) => match raw.trim().parse::<T>() {
                Ok(value) => Some(value),
                Err(e) => {
                    self.errors.push(ConfigError::Invalid {
                        key,
                        reason: format!("{:?}: {}", raw, e),
                    });
                    None
                }
            },
            None => file,
        }
    }

    fn required_parsed<T>(&mut self, key: &'static str, file: Option<T>) -> Option<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let had_env = self.env(key).is_some();
        let value = self.parsed(key, file);
        if value.is_none() && !had_env {
            self.errors.push(ConfigError::Missing(key));
        }
        value
    }
}

impl Config {
    /// Load configuration from an optional TOML file overlaid with a
    /// `.env` file in the working directory and the process environment.
    ///
    /// Process variables win over `.env` entries, which win over the file.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => ConfigFile::read(path)?,
            None => ConfigFile::default(),
        };
        let dotenv = read_dotenv(Path::new(".env"))?;
        Self::resolve(file, |key| {
            std::env::var(key)
                .ok()
                .or_else(|| dotenv.get(key).cloned())
        })
    }

    /// Resolve configuration from a parsed file and an environment lookup.
    ///
    /// Environment values win over file values. All missing or malformed
    /// settings are collected into a single error.
    pub fn resolve<F>(file: ConfigFile, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut r = Resolver {
            env,
            errors: Vec::new(),
        };

        let listen_port = r.required_parsed("LISTEN_PORT", file.gateway.port);
        let base_url = r.required_string("PTERO_HOST", file.control_plane.base_url);
        let api_key = r.required_string("PTERO_API_KEY", file.control_plane.api_key);
        let server_id = r.required_string("PTERO_SERVER_ID", file.control_plane.server_id);
        let backend_host = r.required_string("MINECRAFT_SERVER_HOST", file.backend.host);
        let backend_port = r.required_parsed("MINECRAFT_SERVER_PORT", file.backend.port);

        // Only the exact string "true" enables online mode.
        let online_mode = match r.env("MINECRAFT_SERVER_ONLINE_MODE") {
            Some(raw) => raw == "true",
            None => file.backend.online_mode.unwrap_or(true),
        };

        let bind = r
            .string("BIND_ADDRESS", file.gateway.bind)
            .unwrap_or_else(default_bind_address);
        let start_cooldown_secs = r
            .parsed("START_COOLDOWN_SECS", file.gateway.start_cooldown_secs)
            .unwrap_or_else(default_start_cooldown);
        let max_players = r
            .parsed("MAX_PLAYERS", file.gateway.max_players)
            .unwrap_or_else(default_max_players);
        let version_name = r
            .string("MOTD_VERSION_NAME", file.gateway.version_name)
            .unwrap_or_else(default_version_name);
        let client_timeout_secs = r
            .parsed("CLIENT_TIMEOUT_SECS", file.gateway.client_timeout_secs)
            .unwrap_or_else(default_client_timeout);
        let request_timeout_secs = r
            .parsed("PTERO_TIMEOUT_SECS", file.control_plane.request_timeout_secs)
            .unwrap_or_else(default_request_timeout);
        let public_address = r.string("MINECRAFT_PUBLIC_ADDRESS", file.backend.public_address);
        let probe_timeout_ms = r
            .parsed("PROBE_TIMEOUT_MS", file.backend.probe_timeout_ms)
            .unwrap_or_else(default_probe_timeout);
        let admin_port = r.parsed("ADMIN_PORT", file.admin.port);
        let admin_token = r.string("ADMIN_TOKEN", file.admin.token);

        if !base_url.is_empty()
            && !(base_url.starts_with("http://") || base_url.starts_with("https://"))
        {
            r.errors.push(ConfigError::Invalid {
                key: "PTERO_HOST",
                reason: format!("{:?} is not an http(s) URL", base_url),
            });
        }

        if start_cooldown_secs == 0 {
            r.errors.push(ConfigError::Invalid {
                key: "START_COOLDOWN_SECS",
                reason: "must be greater than zero".to_string(),
            });
        }

        if probe_timeout_ms == 0 {
            r.errors.push(ConfigError::Invalid {
                key: "PROBE_TIMEOUT_MS",
                reason: "must be greater than zero".to_string(),
            });
        }

        let mut errors = r.errors;
        match (listen_port, backend_port) {
            (Some(port), Some(backend_port)) if errors.is_empty() => {
                let config = Self {
                    gateway: GatewayConfig {
                        port,
                        bind,
                        start_cooldown_secs,
                        max_players,
                        version_name,
                        client_timeout_secs,
                    },
                    control_plane: ControlPlaneConfig {
                        base_url: base_url.trim_end_matches('/').to_string(),
                        api_key,
                        server_id,
                        request_timeout_secs,
                    },
                    backend: BackendConfig {
                        host: backend_host,
                        port: backend_port,
                        online_mode,
                        public_address,
                        probe_timeout_ms,
                    },
                    admin: AdminConfig {
                        port: admin_port,
                        token: admin_token,
                    },
                };
                config.gateway.bind_addr()?;
                Ok(config)
            }
            _ => {
                if errors.len() == 1 {
                    Err(errors.remove(0))
                } else {
                    Err(ConfigError::Multiple(errors))
                }
            }
        }
    }
}

/// Read `KEY=value` pairs from a dotenv file without touching the process
/// environment. A missing file yields no entries.
pub fn read_dotenv(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let invalid = |e: dotenvy::Error| ConfigError::Invalid {
        key: ".env",
        reason: format!("{}: {}", path.display(), e),
    };
    let iter = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter,
        Err(e) if e.not_found() => return Ok(HashMap::new()),
        Err(e) => return Err(invalid(e)),
    };
    iter.map(|item| item.map_err(invalid)).collect()
}

impl ConfigFile {
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::File {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }
}
