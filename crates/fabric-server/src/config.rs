//! Server configuration: TOML file + CLI overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use fabric_core::error::{FabricError, FabricResult};
use fabric_core::registration::{ServiceRegistration, KEY_HEALTH_URL};
use fabric_core::wire::{self, Protocol};

use crate::handler::random_id;
use crate::server::ServerOptions;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FabricConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub naming: NamingSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub routing: RoutingSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Unique instance id; generated when empty.
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_public_address")]
    pub public_address: String,
    /// 0 means the port actually bound.
    #[serde(default)]
    pub public_port: u16,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Port of the `/health` endpoint; unset disables it.
    #[serde(default)]
    pub monitor_port: Option<u16>,
    #[serde(default = "default_read_wait")]
    pub read_wait_secs: u64,
    #[serde(default = "default_write_wait")]
    pub write_wait_secs: u64,
    #[serde(default = "default_login_wait")]
    pub login_wait_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            service_id: String::new(),
            service_name: None,
            listen: default_listen(),
            public_address: default_public_address(),
            public_port: 0,
            protocol: None,
            tags: Vec::new(),
            monitor_port: None,
            read_wait_secs: default_read_wait(),
            write_wait_secs: default_write_wait(),
            login_wait_secs: default_login_wait(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamingBackend {
    #[default]
    Consul,
    Memory,
}

/// `[naming]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct NamingSection {
    #[serde(default)]
    pub backend: NamingBackend,
    #[serde(default = "default_consul_url")]
    pub consul_url: String,
}

impl Default for NamingSection {
    fn default() -> Self {
        Self {
            backend: NamingBackend::default(),
            consul_url: default_consul_url(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Redis,
    Memory,
}

/// `[storage]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_location_ttl")]
    pub location_ttl_secs: u64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            redis_url: default_redis_url(),
            location_ttl_secs: default_location_ttl(),
        }
    }
}

/// `[auth]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded token signing secret, shared with whoever issues tokens.
    #[serde(default)]
    pub app_secret: String,
    /// Login attempts allowed per remote IP per minute; 0 disables.
    #[serde(default = "default_login_per_minute")]
    pub login_per_minute: u32,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            app_secret: String::new(),
            login_per_minute: default_login_per_minute(),
        }
    }
}

/// `[routing]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingSection {
    /// Services a gateway dials at start and keeps watching.
    #[serde(default = "default_dependencies")]
    pub dependencies: Vec<String>,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            dependencies: default_dependencies(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_public_address() -> String {
    "127.0.0.1".to_string()
}
fn default_read_wait() -> u64 {
    wire::DEFAULT_READ_WAIT.as_secs()
}
fn default_write_wait() -> u64 {
    wire::DEFAULT_WRITE_WAIT.as_secs()
}
fn default_login_wait() -> u64 {
    wire::DEFAULT_LOGIN_WAIT.as_secs()
}
fn default_consul_url() -> String {
    "http://127.0.0.1:8500".to_string()
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_location_ttl() -> u64 {
    crate::storage::DEFAULT_LOCATION_TTL.as_secs()
}
fn default_login_per_minute() -> u32 {
    30
}
fn default_dependencies() -> Vec<String> {
    vec![wire::SN_LOGIN.to_string(), wire::SN_CHAT.to_string()]
}

/// Command-line values that win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub protocol: Option<Protocol>,
    pub service_id: Option<String>,
    pub service_name: Option<String>,
}

impl FabricConfig {
    /// Load config from a TOML file, then apply CLI overrides. A missing
    /// file yields the defaults.
    pub fn load(config_path: Option<&Path>, overrides: &Overrides) -> FabricResult<Self> {
        let mut config = match config_path.map(expand_tilde) {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(&path)?;
                toml::from_str::<FabricConfig>(&content)
                    .map_err(|e| FabricError::Config(format!("config parse error: {e}")))?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                FabricConfig::default()
            }
            None => FabricConfig::default(),
        };

        if let Some(listen) = &overrides.listen {
            config.server.listen = listen.clone();
        }
        if let Some(protocol) = overrides.protocol {
            config.server.protocol = Some(protocol);
        }
        if let Some(id) = &overrides.service_id {
            config.server.service_id = id.clone();
        }
        if let Some(name) = &overrides.service_name {
            config.server.service_name = Some(name.clone());
        }
        Ok(config)
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            login_wait: Duration::from_secs(self.server.login_wait_secs),
            read_wait: Duration::from_secs(self.server.read_wait_secs),
            write_wait: Duration::from_secs(self.server.write_wait_secs),
            ..Default::default()
        }
    }

    pub fn location_ttl(&self) -> Duration {
        Duration::from_secs(self.storage.location_ttl_secs)
    }

    /// The registration this instance publishes. Name and protocol fall
    /// back to the given defaults; an empty service id becomes
    /// `{name}-{random}`.
    pub fn registration(&self, default_name: &str, default_protocol: Protocol) -> FabricResult<ServiceRegistration> {
        let s = &self.server;
        let name = s.service_name.clone().unwrap_or_else(|| default_name.to_string());
        let id = if s.service_id.is_empty() {
            format!("{name}-{}", &random_id()[..8])
        } else {
            s.service_id.clone()
        };
        let port = if s.public_port != 0 {
            s.public_port
        } else {
            listen_port(&s.listen)?
        };
        let mut reg = ServiceRegistration::new(
            id,
            name,
            s.public_address.clone(),
            port,
            s.protocol.unwrap_or(default_protocol),
        );
        reg.tags = s.tags.clone();
        if let Some(monitor) = s.monitor_port {
            reg.meta.insert(
                KEY_HEALTH_URL.to_string(),
                format!("http://{}:{monitor}/health", s.public_address),
            );
        }
        Ok(reg)
    }

    /// Token secret. When none is configured a random one is generated,
    /// which only verifies tokens minted by this process.
    pub fn app_secret(&self) -> FabricResult<Vec<u8>> {
        if self.auth.app_secret.is_empty() {
            warn!("no app_secret configured, generating a random one");
            return Ok(fabric_core::token::generate_secret());
        }
        hex::decode(self.auth.app_secret.trim())
            .map_err(|e| FabricError::Config(format!("app_secret is not valid hex: {e}")))
    }
}

fn listen_port(listen: &str) -> FabricResult<u16> {
    listen
        .rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .ok_or_else(|| FabricError::Config(format!("listen address has no port: {listen}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_gives_defaults() {
        let cfg = FabricConfig::load(Some(Path::new("/nonexistent/fabric.toml")), &Overrides::default()).unwrap();
        assert_eq!(cfg.server.listen, "0.0.0.0:8000");
        assert_eq!(cfg.naming.backend, NamingBackend::Consul);
        assert_eq!(cfg.storage.backend, StorageBackend::Redis);
        assert_eq!(cfg.storage.location_ttl_secs, 7200);
        assert_eq!(cfg.routing.dependencies, vec!["login", "chat"]);
        assert_eq!(cfg.server_options().read_wait, Duration::from_secs(180));
    }

    #[test]
    fn file_and_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
service_id = "gw-1"
listen = "0.0.0.0:8100"
public_address = "10.0.0.5"
protocol = "tcp"
tags = ["blue"]
monitor_port = 8101
read_wait_secs = 120

[naming]
backend = "memory"

[storage]
backend = "memory"
location_ttl_secs = 60

[auth]
app_secret = "00ff10"
login_per_minute = 5
"#
        )
        .unwrap();

        let overrides = Overrides {
            protocol: Some(Protocol::Websocket),
            ..Default::default()
        };
        let cfg = FabricConfig::load(Some(file.path()), &overrides).unwrap();
        assert_eq!(cfg.naming.backend, NamingBackend::Memory);
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
        assert_eq!(cfg.location_ttl(), Duration::from_secs(60));
        assert_eq!(cfg.auth.login_per_minute, 5);
        assert_eq!(cfg.app_secret().unwrap(), vec![0x00, 0xff, 0x10]);
        assert_eq!(cfg.server_options().read_wait, Duration::from_secs(120));

        let reg = cfg.registration(wire::SN_WS_GATEWAY, Protocol::Tcp).unwrap();
        assert_eq!(reg.id, "gw-1");
        assert_eq!(reg.name, "wgateway");
        assert_eq!(reg.protocol, Protocol::Websocket);
        assert_eq!(reg.port, 8100);
        assert_eq!(reg.tags, vec!["blue"]);
        assert_eq!(reg.health_url(), Some("http://10.0.0.5:8101/health"));
    }

    #[test]
    fn generated_service_id_uses_name() {
        let cfg = FabricConfig::default();
        let reg = cfg.registration("chat", Protocol::Tcp).unwrap();
        assert!(reg.id.starts_with("chat-"));
        assert_eq!(reg.port, 8000);
    }

    #[test]
    fn bad_secret_and_listen_are_config_errors() {
        let mut cfg = FabricConfig::default();
        cfg.auth.app_secret = "not hex".into();
        assert!(matches!(cfg.app_secret(), Err(FabricError::Config(_))));

        cfg.server.listen = "nowhere".into();
        assert!(cfg.registration("chat", Protocol::Tcp).is_err());
    }

    #[test]
    fn parse_error_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nlisten = ").unwrap();
        let err = FabricConfig::load(Some(file.path()), &Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("config parse error"));
    }
}
