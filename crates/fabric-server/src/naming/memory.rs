//! In-process naming for tests and single-host deployments.
//!
//! Cloning a `MemoryNaming` shares the registry, so several servers in one
//! process can discover each other.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

use fabric_core::error::{FabricError, FabricResult};
use fabric_core::registration::ServiceRegistration;

use super::{membership, Naming, WatchCallback, WatchTable};

struct Entry {
    registration: ServiceRegistration,
    healthy: bool,
}

struct Inner {
    services: RwLock<HashMap<String, Entry>>,
    changes: watch::Sender<u64>,
    watches: WatchTable,
}

#[derive(Clone)]
pub struct MemoryNaming {
    inner: Arc<Inner>,
}

impl Default for MemoryNaming {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNaming {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                services: RwLock::new(HashMap::new()),
                changes,
                watches: WatchTable::new(),
            }),
        }
    }

    fn bump(&self) {
        self.inner.changes.send_modify(|index| *index += 1);
    }

    /// Mark an instance as passing or failing its health check.
    pub async fn set_health(&self, service_id: &str, healthy: bool) -> FabricResult<()> {
        {
            let mut services = self.inner.services.write().await;
            let entry = services
                .get_mut(service_id)
                .ok_or_else(|| FabricError::Naming(format!("unknown service id {service_id}")))?;
            entry.healthy = healthy;
        }
        self.bump();
        Ok(())
    }

    async fn healthy(&self, name: &str, tags: &[String]) -> Vec<ServiceRegistration> {
        let services = self.inner.services.read().await;
        let mut out: Vec<ServiceRegistration> = services
            .values()
            .filter(|e| e.healthy && e.registration.name == name && e.registration.has_tags(tags))
            .map(|e| e.registration.clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

#[async_trait]
impl Naming for MemoryNaming {
    async fn find(&self, name: &str, tags: &[String]) -> FabricResult<Vec<ServiceRegistration>> {
        Ok(self.healthy(name, tags).await)
    }

    async fn register(&self, registration: &ServiceRegistration) -> FabricResult<()> {
        self.inner.services.write().await.insert(
            registration.id.clone(),
            Entry {
                registration: registration.clone(),
                healthy: true,
            },
        );
        self.bump();
        info!(service_id = %registration.id, service = %registration.name, "registered");
        Ok(())
    }

    async fn deregister(&self, service_id: &str) -> FabricResult<()> {
        let removed = self.inner.services.write().await.remove(service_id).is_some();
        if removed {
            self.bump();
            info!(service_id, "deregistered");
        }
        Ok(())
    }

    async fn subscribe(&self, name: &str, callback: WatchCallback) -> FabricResult<()> {
        let quit = self.inner.watches.insert(name)?;
        let naming = self.clone();
        let name = name.to_string();
        let mut rx = self.inner.changes.subscribe();
        let mut last = membership(&self.healthy(&name, &[]).await);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = quit.cancelled() => break,
                    res = rx.changed() => if res.is_err() { break },
                }
                let services = naming.healthy(&name, &[]).await;
                let ids = membership(&services);
                if ids != last {
                    debug!(service = %name, instances = ids.len(), "membership changed");
                    last = ids;
                    callback(services);
                }
            }
            debug!(service = %name, "watch stopped");
        });
        Ok(())
    }

    async fn unsubscribe(&self, name: &str) -> FabricResult<()> {
        self.inner.watches.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_core::wire::Protocol;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn reg(id: &str, name: &str) -> ServiceRegistration {
        ServiceRegistration::new(id, name, "127.0.0.1", 9000, Protocol::Tcp)
    }

    #[tokio::test]
    async fn find_filters_by_health_and_tags() {
        let naming = MemoryNaming::new();
        let mut tagged = reg("chat-1", "chat");
        tagged.tags = vec!["v2".into()];
        naming.register(&tagged).await.unwrap();
        naming.register(&reg("chat-2", "chat")).await.unwrap();
        naming.register(&reg("login-1", "login")).await.unwrap();

        assert_eq!(naming.find("chat", &[]).await.unwrap().len(), 2);
        let v2 = naming.find("chat", &["v2".into()]).await.unwrap();
        assert_eq!(v2.len(), 1);
        assert_eq!(v2[0].id, "chat-1");

        naming.set_health("chat-1", false).await.unwrap();
        let found = naming.find("chat", &[]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "chat-2");

        naming.deregister("chat-2").await.unwrap();
        assert!(naming.find("chat", &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn subscribe_fires_on_membership_change_only() {
        let naming = MemoryNaming::new();
        naming.register(&reg("chat-1", "chat")).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        naming
            .subscribe(
                "chat",
                Arc::new(move |services: Vec<ServiceRegistration>| {
                    let _ = tx.send(membership(&services));
                }),
            )
            .await
            .unwrap();
        assert!(naming.subscribe("chat", Arc::new(|_| {})).await.is_err());

        // unrelated service: no callback
        naming.register(&reg("login-1", "login")).await.unwrap();
        naming.register(&reg("chat-2", "chat")).await.unwrap();
        let ids = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(ids, vec!["chat-1", "chat-2"]);

        naming.set_health("chat-1", false).await.unwrap();
        let ids = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(ids, vec!["chat-2"]);

        naming.unsubscribe("chat").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        naming.deregister("chat-2").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
