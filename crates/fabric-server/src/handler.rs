//! Hooks a [`Server`](crate::server::Server) calls into.
//!
//! An `Acceptor` authenticates a fresh connection and names its channel, a
//! `MessageListener` receives every inbound payload, and a `StateListener`
//! hears about channels coming and going.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use fabric_core::error::FabricResult;
use fabric_core::transport::Conn;

/// The sender of an inbound payload, able to receive pushes.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    async fn push(&self, payload: Vec<u8>) -> FabricResult<()>;
}

#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Run the login handshake on `conn` and return the channel id. The
    /// server bounds the call by `login_wait`; an error rejects the
    /// connection with a close frame carrying the error text.
    async fn accept(&self, conn: &mut Conn, login_wait: Duration) -> FabricResult<String>;
}

#[async_trait]
pub trait MessageListener: Send + Sync {
    /// Called on its own task for each non-empty text or binary frame.
    async fn receive(&self, agent: Arc<dyn Agent>, payload: Vec<u8>);
}

#[async_trait]
pub trait StateListener: Send + Sync {
    /// The channel is registered and its read loop is about to start.
    async fn connected(&self, _id: &str) {}

    /// The channel's read loop has ended and it was removed from the map.
    async fn disconnect(&self, id: &str) -> FabricResult<()>;
}

/// Accepts every connection under a random id.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAcceptor;

#[async_trait]
impl Acceptor for DefaultAcceptor {
    async fn accept(&self, _conn: &mut Conn, _login_wait: Duration) -> FabricResult<String> {
        Ok(random_id())
    }
}

/// 16 random bytes, hex-encoded.
pub fn random_id() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}
