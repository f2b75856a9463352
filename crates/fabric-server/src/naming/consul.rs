//! Naming over the Consul HTTP API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fabric_core::error::{FabricError, FabricResult};
use fabric_core::registration::{ServiceRegistration, KEY_HEALTH_URL, KEY_PROTOCOL};
use fabric_core::wire::Protocol;

use super::{membership, Naming, WatchCallback, WatchTable};

const HEALTH_PASSING: &str = "passing";
const BLOCKING_WAIT: Duration = Duration::from_secs(60);
const RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    address: &'a str,
    port: u16,
    tags: &'a [String],
    meta: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    check: Option<AgentServiceCheck>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceCheck {
    #[serde(rename = "CheckID")]
    check_id: String,
    #[serde(rename = "HTTP")]
    http: String,
    timeout: &'static str,
    interval: &'static str,
    deregister_critical_service_after: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    service: AgentService,
    #[serde(default)]
    checks: Vec<HealthCheck>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    address: String,
    port: u16,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    meta: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthCheck {
    status: String,
}

impl HealthEntry {
    fn is_passing(&self) -> bool {
        self.checks.iter().all(|c| c.status == HEALTH_PASSING)
    }

    fn into_registration(self) -> ServiceRegistration {
        let meta = self.service.meta.unwrap_or_default();
        let protocol = meta
            .get(KEY_PROTOCOL)
            .and_then(|p| p.parse().ok())
            .unwrap_or(Protocol::Tcp);
        let mut reg = ServiceRegistration::new(
            self.service.id,
            self.service.service,
            self.service.address,
            self.service.port,
            protocol,
        );
        reg.tags = self.service.tags.unwrap_or_default();
        reg.meta = meta;
        reg
    }
}

fn http_err(e: reqwest::Error) -> FabricError {
    FabricError::Naming(e.to_string())
}

/// The HTTP side, cloned into each watch loop.
#[derive(Debug, Clone)]
struct ConsulClient {
    base: String,
    http: reqwest::Client,
}

impl ConsulClient {
    /// Query healthy instances. A non-zero `index` blocks until the result
    /// changes or the wait expires. Returns the instances and the new index.
    async fn load(
        &self,
        name: &str,
        tags: &[String],
        index: u64,
    ) -> FabricResult<(Vec<ServiceRegistration>, u64)> {
        let url = format!("{}/v1/health/service/{}", self.base, name);
        let mut query: Vec<(&str, String)> = tags.iter().map(|t| ("tag", t.clone())).collect();
        let mut req = self.http.get(&url);
        if index > 0 {
            query.push(("index", index.to_string()));
            query.push(("wait", format!("{}s", BLOCKING_WAIT.as_secs())));
            req = req.timeout(BLOCKING_WAIT + Duration::from_secs(10));
        }
        let resp = req.query(&query).send().await.map_err(http_err)?;
        if !resp.status().is_success() {
            return Err(FabricError::Naming(format!(
                "consul returned {} for {}",
                resp.status(),
                name
            )));
        }
        let last_index = resp
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let entries: Vec<HealthEntry> = resp.json().await.map_err(http_err)?;

        let mut services = Vec::with_capacity(entries.len());
        for entry in entries {
            if !entry.is_passing() {
                debug!(service_id = %entry.service.id, service = %name, "skipping unhealthy instance");
                continue;
            }
            services.push(entry.into_registration());
        }
        Ok((services, last_index))
    }
}

pub struct ConsulNaming {
    client: ConsulClient,
    watches: Arc<WatchTable>,
}

impl ConsulNaming {
    /// `url` is the agent's HTTP address, e.g. `http://localhost:8500`.
    pub fn new(url: &str) -> FabricResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(http_err)?;
        let base = if url.starts_with("http://") || url.starts_with("https://") {
            url.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", url.trim_end_matches('/'))
        };
        Ok(Self {
            client: ConsulClient { base, http },
            watches: Arc::new(WatchTable::new()),
        })
    }
}

async fn watch_loop(client: ConsulClient, name: String, callback: WatchCallback, quit: CancellationToken) {
    let mut index = 0u64;
    let mut last: Option<Vec<String>> = None;
    loop {
        let res = tokio::select! {
            _ = quit.cancelled() => break,
            res = client.load(&name, &[], index) => res,
        };
        match res {
            Ok((services, new_index)) => {
                // Consul may reset its index; start over rather than block forever.
                index = if new_index < index { 0 } else { new_index };
                let ids = membership(&services);
                if last.as_ref() != Some(&ids) {
                    if last.is_some() {
                        debug!(service = %name, instances = ids.len(), "membership changed");
                        callback(services);
                    }
                    last = Some(ids);
                }
            }
            Err(e) => {
                warn!(service = %name, error = %e, "watch query failed");
                tokio::select! {
                    _ = quit.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }
    }
    info!(service = %name, "watch stopped");
}

#[async_trait]
impl Naming for ConsulNaming {
    async fn find(&self, name: &str, tags: &[String]) -> FabricResult<Vec<ServiceRegistration>> {
        let (services, _) = self.client.load(name, tags, 0).await?;
        Ok(services)
    }

    async fn register(&self, registration: &ServiceRegistration) -> FabricResult<()> {
        let mut meta = registration.meta.clone();
        meta.insert(KEY_PROTOCOL.to_string(), registration.protocol.to_string());
        let check = registration.health_url().filter(|u| !u.is_empty()).map(|url| AgentServiceCheck {
            check_id: format!("{}_normal", registration.id),
            http: url.to_string(),
            timeout: "1s",
            interval: "10s",
            deregister_critical_service_after: "20s",
        });
        let body = AgentServiceRegistration {
            id: &registration.id,
            name: &registration.name,
            address: &registration.address,
            port: registration.port,
            tags: &registration.tags,
            meta,
            check,
        };
        let url = format!("{}/v1/agent/service/register", self.client.base);
        let resp = self.client.http.put(&url).json(&body).send().await.map_err(http_err)?;
        if !resp.status().is_success() {
            return Err(FabricError::Naming(format!(
                "register {} failed: {}",
                registration.id,
                resp.status()
            )));
        }
        info!(
            service_id = %registration.id,
            service = %registration.name,
            health_check = registration.meta.contains_key(KEY_HEALTH_URL),
            "registered with consul"
        );
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> FabricResult<()> {
        let url = format!("{}/v1/agent/service/deregister/{}", self.client.base, service_id);
        let resp = self.client.http.put(&url).send().await.map_err(http_err)?;
        if !resp.status().is_success() {
            return Err(FabricError::Naming(format!(
                "deregister {service_id} failed: {}",
                resp.status()
            )));
        }
        info!(service_id, "deregistered from consul");
        Ok(())
    }

    async fn subscribe(&self, name: &str, callback: WatchCallback) -> FabricResult<()> {
        let quit = self.watches.insert(name)?;
        tokio::spawn(watch_loop(self.client.clone(), name.to_string(), callback, quit));
        Ok(())
    }

    async fn unsubscribe(&self, name: &str) -> FabricResult<()> {
        self.watches.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEALTH_JSON: &str = r#"[
        {
            "Node": {"Node": "n1"},
            "Service": {
                "ID": "chat-1", "Service": "chat", "Address": "10.0.0.1", "Port": 8100,
                "Tags": ["v1"], "Meta": {"protocol": "tcp"}
            },
            "Checks": [{"Status": "passing"}, {"Status": "passing"}]
        },
        {
            "Service": {
                "ID": "chat-2", "Service": "chat", "Address": "10.0.0.2", "Port": 8100,
                "Tags": null, "Meta": null
            },
            "Checks": [{"Status": "passing"}, {"Status": "critical"}]
        }
    ]"#;

    #[test]
    fn health_entries_filter_and_convert() {
        let entries: Vec<HealthEntry> = serde_json::from_str(HEALTH_JSON).unwrap();
        assert!(entries[0].is_passing());
        assert!(!entries[1].is_passing());

        let reg = entries.into_iter().next().unwrap().into_registration();
        assert_eq!(reg.id, "chat-1");
        assert_eq!(reg.protocol, Protocol::Tcp);
        assert_eq!(reg.tags, vec!["v1"]);
        assert_eq!(reg.dial_url(), "10.0.0.1:8100");
    }

    #[test]
    fn registration_body_shape() {
        let mut reg = ServiceRegistration::new("gw-1", "wgateway", "10.0.0.3", 8000, Protocol::Websocket);
        reg.meta.insert(KEY_HEALTH_URL.into(), "http://10.0.0.3:8001/health".into());
        let body = AgentServiceRegistration {
            id: &reg.id,
            name: &reg.name,
            address: &reg.address,
            port: reg.port,
            tags: &reg.tags,
            meta: HashMap::from([(KEY_PROTOCOL.to_string(), "websocket".to_string())]),
            check: Some(AgentServiceCheck {
                check_id: "gw-1_normal".into(),
                http: reg.health_url().unwrap().to_string(),
                timeout: "1s",
                interval: "10s",
                deregister_critical_service_after: "20s",
            }),
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["ID"], "gw-1");
        assert_eq!(v["Meta"]["protocol"], "websocket");
        assert_eq!(v["Check"]["HTTP"], "http://10.0.0.3:8001/health");
        assert_eq!(v["Check"]["DeregisterCriticalServiceAfter"], "20s");
    }

    #[test]
    fn base_url_gets_scheme() {
        let n = ConsulNaming::new("localhost:8500").unwrap();
        assert_eq!(n.client.base, "http://localhost:8500");
        let n = ConsulNaming::new("https://consul.internal/").unwrap();
        assert_eq!(n.client.base, "https://consul.internal");
    }
}
