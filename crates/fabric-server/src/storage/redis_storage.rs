//! Session storage on Redis.
//!
//! Sessions are JSON under `login:sn:{channel}`; locations are the binary
//! [`Location`] encoding under `login:loc:{account}[:{device}]`, and
//! `login:dev:{account}` is the set of devices holding one. Everything is
//! written with a TTL so stale logins age out on their own.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info};

use fabric_core::error::{FabricError, FabricResult};
use fabric_core::location::{Location, Session};

use super::{key_devices, key_location, key_session, SessionStorage, DEFAULT_LOCATION_TTL};

fn storage_err(e: redis::RedisError) -> FabricError {
    FabricError::Storage(e.to_string())
}

#[derive(Clone)]
pub struct RedisStorage {
    connection: ConnectionManager,
    ttl: Duration,
}

impl RedisStorage {
    pub async fn connect(redis_url: &str, ttl: Duration) -> FabricResult<Self> {
        let client = redis::Client::open(redis_url).map_err(storage_err)?;
        let connection = client.get_connection_manager().await.map_err(storage_err)?;
        info!(url = %redis_url, "connected to redis");
        Ok(Self {
            connection,
            ttl: if ttl.is_zero() { DEFAULT_LOCATION_TTL } else { ttl },
        })
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }
}

#[async_trait]
impl SessionStorage for RedisStorage {
    async fn add(&self, session: &Session) -> FabricResult<()> {
        let mut conn = self.connection.clone();
        let location = session.location().to_bytes()?;
        let payload = serde_json::to_vec(session).map_err(|e| FabricError::Storage(e.to_string()))?;
        let devices = key_devices(&session.account);
        let _: () = redis::pipe()
            .atomic()
            .set_ex(key_location(&session.account, &session.device), location, self.ttl_secs())
            .ignore()
            .sadd(&devices, &session.device)
            .ignore()
            .cmd("EXPIRE")
            .arg(&devices)
            .arg(self.ttl_secs())
            .ignore()
            .set_ex(key_session(&session.channel_id), payload, self.ttl_secs())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;
        debug!(account = %session.account, channel_id = %session.channel_id, "session added");
        Ok(())
    }

    async fn delete(&self, account: &str, channel_id: &str) -> FabricResult<()> {
        let device = self.get(channel_id).await?.map(|s| s.device).unwrap_or_default();
        let mut conn = self.connection.clone();
        let key = key_location(account, &device);
        let current: Option<Vec<u8>> = conn.get(&key).await.map_err(storage_err)?;
        let points_here = current
            .and_then(|raw| Location::from_bytes(&raw).ok())
            .is_some_and(|loc| loc.channel_id == channel_id);
        if points_here {
            let _: () = conn.del(&key).await.map_err(storage_err)?;
            let _: () = conn.srem(key_devices(account), &device).await.map_err(storage_err)?;
        }
        let _: () = conn.del(key_session(channel_id)).await.map_err(storage_err)?;
        Ok(())
    }

    async fn get(&self, channel_id: &str) -> FabricResult<Option<Session>> {
        let mut conn = self.connection.clone();
        let payload: Option<Vec<u8>> = conn.get(key_session(channel_id)).await.map_err(storage_err)?;
        match payload {
            Some(raw) => {
                let session =
                    serde_json::from_slice(&raw).map_err(|e| FabricError::Storage(e.to_string()))?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn get_location(&self, account: &str, device: &str) -> FabricResult<Option<Location>> {
        let mut conn = self.connection.clone();
        let raw: Option<Vec<u8>> = conn.get(key_location(account, device)).await.map_err(storage_err)?;
        raw.map(|raw| Location::from_bytes(&raw)).transpose()
    }

    async fn get_locations(&self, accounts: &[String]) -> FabricResult<Vec<Location>> {
        let mut conn = self.connection.clone();
        let mut keys = Vec::new();
        for account in accounts {
            let mut devices: Vec<String> = conn.smembers(key_devices(account)).await.map_err(storage_err)?;
            devices.sort();
            keys.extend(devices.iter().map(|device| key_location(account, device)));
        }
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        // a device whose location expired is still in the set; MGET skips it
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;
        values
            .into_iter()
            .flatten()
            .map(|raw| Location::from_bytes(&raw))
            .collect()
    }
}
