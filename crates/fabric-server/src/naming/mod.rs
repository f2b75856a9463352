//! Service registration and discovery.

pub mod consul;
pub mod memory;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use fabric_core::error::{FabricError, FabricResult};
use fabric_core::registration::ServiceRegistration;

pub use consul::ConsulNaming;
pub use memory::MemoryNaming;

/// Called with the full healthy instance list whenever membership changes.
pub type WatchCallback = Arc<dyn Fn(Vec<ServiceRegistration>) + Send + Sync>;

#[async_trait]
pub trait Naming: Send + Sync {
    /// Healthy instances of `name` carrying every tag in `tags`.
    async fn find(&self, name: &str, tags: &[String]) -> FabricResult<Vec<ServiceRegistration>>;

    async fn register(&self, registration: &ServiceRegistration) -> FabricResult<()>;

    async fn deregister(&self, service_id: &str) -> FabricResult<()>;

    /// Start watching `name`. Subscribing twice to the same name fails.
    async fn subscribe(&self, name: &str, callback: WatchCallback) -> FabricResult<()>;

    async fn unsubscribe(&self, name: &str) -> FabricResult<()>;
}

/// Active watches, one cancellation token per service name.
#[derive(Debug, Default)]
pub struct WatchTable {
    watches: Mutex<HashMap<String, CancellationToken>>,
}

impl WatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name` and return the token its loop should watch.
    pub fn insert(&self, name: &str) -> FabricResult<CancellationToken> {
        let mut watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        if watches.contains_key(name) {
            return Err(FabricError::Naming(format!("{name} is already subscribed")));
        }
        let token = CancellationToken::new();
        watches.insert(name.to_string(), token.clone());
        Ok(token)
    }

    /// Stop the watch on `name`. Returns whether one was active.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self
            .watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        match removed {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }
}

/// Sorted instance ids, used to tell whether membership changed.
pub(crate) fn membership(services: &[ServiceRegistration]) -> Vec<String> {
    let mut ids: Vec<String> = services.iter().map(|s| s.id.clone()).collect();
    ids.sort();
    ids
}
