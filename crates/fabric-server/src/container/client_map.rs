//! Connected backend clients, keyed by remote service id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use fabric_client::Client;

#[derive(Default)]
pub struct ClientMap {
    clients: RwLock<HashMap<String, Arc<Client>>>,
}

impl ClientMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, replacing any previous client with the same id.
    pub async fn add(&self, client: Arc<Client>) {
        let id = client.service_id().to_string();
        self.clients.write().await.insert(id.clone(), client);
        debug!(service_id = %id, "client added");
    }

    /// Remove `id` only if it still maps to `client`.
    pub async fn remove_if_same(&self, client: &Arc<Client>) -> bool {
        let mut clients = self.clients.write().await;
        match clients.get(client.service_id()) {
            Some(current) if Arc::ptr_eq(current, client) => {
                clients.remove(client.service_id());
                debug!(service_id = %client.service_id(), "client removed");
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Client>> {
        self.clients.read().await.get(id).cloned()
    }

    /// Connected clients of the named service.
    pub async fn services(&self, name: &str) -> Vec<Arc<Client>> {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| c.service_name() == name)
            .cloned()
            .collect()
    }

    pub async fn all(&self) -> Vec<Arc<Client>> {
        self.clients.read().await.values().cloned().collect()
    }

    pub async fn drain(&self) -> Vec<Arc<Client>> {
        self.clients.write().await.drain().map(|(_, c)| c).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_client::{ClientOptions, TcpDialer};
    use fabric_core::registration::ServiceRegistration;
    use fabric_core::wire::Protocol;

    fn client(id: &str, name: &str) -> Arc<Client> {
        let reg = ServiceRegistration::new(id, name, "127.0.0.1", 1, Protocol::Tcp);
        Arc::new(Client::new(reg, Arc::new(TcpDialer::new("gw")), ClientOptions::default()))
    }

    #[tokio::test]
    async fn filter_by_service_and_remove_if_same() {
        let map = ClientMap::new();
        let c1 = client("chat-1", "chat");
        map.add(c1.clone()).await;
        map.add(client("login-1", "login")).await;
        assert_eq!(map.services("chat").await.len(), 1);
        assert_eq!(map.all().await.len(), 2);

        let replacement = client("chat-1", "chat");
        map.add(replacement.clone()).await;
        assert!(!map.remove_if_same(&c1).await);
        assert!(map.remove_if_same(&replacement).await);
        assert!(map.get("chat-1").await.is_none());
        assert_eq!(map.drain().await.len(), 1);
    }
}
