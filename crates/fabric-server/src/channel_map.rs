//! Registry of live channels on one server, keyed by channel id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, error};

use fabric_core::error::{FabricError, FabricResult};

use crate::channel::Channel;

#[derive(Default)]
pub struct ChannelMap {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel. An empty id or an id already present is refused
    /// and the existing entry is left alone.
    pub async fn add(&self, channel: Arc<Channel>) -> FabricResult<()> {
        let id = channel.id().to_string();
        if id.is_empty() {
            error!("refusing to register a channel with an empty id");
            return Err(FabricError::InvalidMessage("empty channel id".into()));
        }
        let mut channels = self.channels.write().await;
        if channels.contains_key(&id) {
            return Err(FabricError::DuplicateChannel(id));
        }
        channels.insert(id.clone(), channel);
        debug!(channel_id = %id, total = channels.len(), "channel registered");
        Ok(())
    }

    /// Remove a channel if present.
    pub async fn remove(&self, id: &str) -> Option<Arc<Channel>> {
        let removed = self.channels.write().await.remove(id);
        if removed.is_some() {
            debug!(channel_id = %id, "channel unregistered");
        }
        removed
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.channels.read().await.contains_key(id)
    }

    /// Point-in-time snapshot of every registered channel.
    pub async fn all(&self) -> Vec<Arc<Channel>> {
        self.channels.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.channels.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::duplex_conn;

    fn channel(id: &str) -> Arc<Channel> {
        let (conn, _peer) = duplex_conn();
        Channel::new(id, conn)
    }

    #[tokio::test]
    async fn add_get_remove() {
        let map = Arc::new(ChannelMap::new());
        let ch = channel("ch1");
        map.add(ch.clone()).await.unwrap();

        let map2 = map.clone();
        let found = tokio::spawn(async move { map2.get("ch1").await }).await.unwrap();
        assert!(Arc::ptr_eq(&found.unwrap(), &ch));

        assert!(map.remove("ch1").await.is_some());
        assert!(map.get("ch1").await.is_none());
        assert!(map.remove("ch1").await.is_none());
    }

    #[tokio::test]
    async fn duplicate_is_rejected_and_original_kept() {
        let map = ChannelMap::new();
        let first = channel("ch1");
        map.add(first.clone()).await.unwrap();
        let err = map.add(channel("ch1")).await.unwrap_err();
        assert!(matches!(err, FabricError::DuplicateChannel(id) if id == "ch1"));
        assert!(Arc::ptr_eq(&map.get("ch1").await.unwrap(), &first));
    }

    #[tokio::test]
    async fn empty_id_rejected() {
        let map = ChannelMap::new();
        assert!(map.add(channel("")).await.is_err());
        assert_eq!(map.count().await, 0);
    }

    #[tokio::test]
    async fn snapshot_is_independent() {
        let map = ChannelMap::new();
        map.add(channel("a")).await.unwrap();
        map.add(channel("b")).await.unwrap();
        let snapshot = map.all().await;
        map.remove("a").await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(map.count().await, 1);
    }
}
