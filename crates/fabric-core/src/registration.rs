//! Service instance descriptors exchanged with the naming backend.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::wire::Protocol;

/// Meta key carrying the instance's transport protocol.
pub const KEY_PROTOCOL: &str = "protocol";
/// Meta key carrying an HTTP health-check URL.
pub const KEY_HEALTH_URL: &str = "health_url";

/// One discoverable, network-reachable service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

impl ServiceRegistration {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        protocol: Protocol,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            port,
            protocol,
            namespace: String::new(),
            tags: Vec::new(),
            meta: HashMap::new(),
        }
    }

    /// Address a dialer connects to: `host:port` for TCP, a URL otherwise.
    pub fn dial_url(&self) -> String {
        match self.protocol {
            Protocol::Tcp => format!("{}:{}", self.address, self.port),
            Protocol::Websocket => format!("ws://{}:{}", self.address, self.port),
        }
    }

    pub fn health_url(&self) -> Option<&str> {
        self.meta.get(KEY_HEALTH_URL).map(String::as_str)
    }

    pub fn has_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|t| self.tags.contains(t))
    }
}
