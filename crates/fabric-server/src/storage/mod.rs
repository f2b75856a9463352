//! Session and location storage.
//!
//! A session is stored under its channel id; its location is stored per
//! `(account, device)`, and each account keeps an index of the devices it is
//! logged in on. Lookups that find nothing return `None`: an absent session
//! means the user is offline, which is not an error.

pub mod memory;
pub mod redis_storage;

use std::time::Duration;

use async_trait::async_trait;

use fabric_core::error::FabricResult;
use fabric_core::location::{Location, Session};

pub use self::memory::MemoryStorage;
pub use self::redis_storage::RedisStorage;

/// How long a session and its location live without being re-added.
pub const DEFAULT_LOCATION_TTL: Duration = Duration::from_secs(2 * 60 * 60);

#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Store the session and its location, replacing any previous location
    /// for the same account and device.
    async fn add(&self, session: &Session) -> FabricResult<()>;

    /// Remove the session for `channel_id`, and its device location if that
    /// still points at the channel. Other devices of the account are kept.
    async fn delete(&self, account: &str, channel_id: &str) -> FabricResult<()>;

    async fn get(&self, channel_id: &str) -> FabricResult<Option<Session>>;

    /// Location for `(account, device)`. An empty device is the login that
    /// named no device.
    async fn get_location(&self, account: &str, device: &str) -> FabricResult<Option<Location>>;

    /// Locations of every device of every listed account that is online.
    /// Offline accounts are skipped.
    async fn get_locations(&self, accounts: &[String]) -> FabricResult<Vec<Location>>;
}

pub fn key_session(channel_id: &str) -> String {
    format!("login:sn:{channel_id}")
}

pub fn key_location(account: &str, device: &str) -> String {
    if device.is_empty() {
        format!("login:loc:{account}")
    } else {
        format!("login:loc:{account}:{device}")
    }
}

/// Set of devices `account` has a location on.
pub fn key_devices(account: &str) -> String {
    format!("login:dev:{account}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(key_session("gw1_a_1"), "login:sn:gw1_a_1");
        assert_eq!(key_location("acct1", ""), "login:loc:acct1");
        assert_eq!(key_location("acct1", "phone"), "login:loc:acct1:phone");
        assert_eq!(key_devices("acct1"), "login:dev:acct1");
    }
}
