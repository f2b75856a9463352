//! In-process session storage with expiry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use fabric_core::error::FabricResult;
use fabric_core::location::{Location, Session};

use super::{key_session, SessionStorage, DEFAULT_LOCATION_TTL};

struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T: Clone> Expiring<T> {
    fn live(&self, now: Instant) -> Option<T> {
        (self.expires_at > now).then(|| self.value.clone())
    }
}

/// Locations of one account, keyed by device.
type Devices = HashMap<String, Expiring<Location>>;

pub struct MemoryStorage {
    ttl: Duration,
    sessions: RwLock<HashMap<String, Expiring<Session>>>,
    locations: RwLock<HashMap<String, Devices>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(DEFAULT_LOCATION_TTL)
    }
}

impl MemoryStorage {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: RwLock::new(HashMap::new()),
            locations: RwLock::new(HashMap::new()),
        }
    }

    /// Drop expired entries.
    pub async fn gc(&self) {
        let now = Instant::now();
        self.sessions.write().await.retain(|_, e| e.expires_at > now);
        let mut locations = self.locations.write().await;
        for devices in locations.values_mut() {
            devices.retain(|_, e| e.expires_at > now);
        }
        locations.retain(|_, devices| !devices.is_empty());
    }
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn add(&self, session: &Session) -> FabricResult<()> {
        let expires_at = Instant::now() + self.ttl;
        self.locations
            .write()
            .await
            .entry(session.account.clone())
            .or_default()
            .insert(
                session.device.clone(),
                Expiring {
                    value: session.location(),
                    expires_at,
                },
            );
        self.sessions.write().await.insert(
            key_session(&session.channel_id),
            Expiring {
                value: session.clone(),
                expires_at,
            },
        );
        debug!(account = %session.account, channel_id = %session.channel_id, "session added");
        Ok(())
    }

    async fn delete(&self, account: &str, channel_id: &str) -> FabricResult<()> {
        let removed = self.sessions.write().await.remove(&key_session(channel_id));
        let device = removed.map(|e| e.value.device).unwrap_or_default();
        let mut locations = self.locations.write().await;
        if let Some(devices) = locations.get_mut(account) {
            if devices.get(&device).is_some_and(|e| e.value.channel_id == channel_id) {
                devices.remove(&device);
            }
            if devices.is_empty() {
                locations.remove(account);
            }
        }
        Ok(())
    }

    async fn get(&self, channel_id: &str) -> FabricResult<Option<Session>> {
        let now = Instant::now();
        Ok(self
            .sessions
            .read()
            .await
            .get(&key_session(channel_id))
            .and_then(|e| e.live(now)))
    }

    async fn get_location(&self, account: &str, device: &str) -> FabricResult<Option<Location>> {
        let now = Instant::now();
        Ok(self
            .locations
            .read()
            .await
            .get(account)
            .and_then(|devices| devices.get(device))
            .and_then(|e| e.live(now)))
    }

    async fn get_locations(&self, accounts: &[String]) -> FabricResult<Vec<Location>> {
        let now = Instant::now();
        let locations = self.locations.read().await;
        let mut out = Vec::new();
        for account in accounts {
            let Some(devices) = locations.get(account) else {
                continue;
            };
            let mut live: Vec<(&String, Location)> = devices
                .iter()
                .filter_map(|(device, e)| e.live(now).map(|loc| (device, loc)))
                .collect();
            live.sort_by(|a, b| a.0.cmp(b.0));
            out.extend(live.into_iter().map(|(_, loc)| loc));
        }
        Ok(out)
    }
}
