//! Dialing backend services.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use fabric_core::codec::cbor_encode;
use fabric_core::error::{FabricError, FabricResult};
use fabric_core::messages::InnerHandshakeReq;
use fabric_core::transport::{tcp, Conn};

/// Target of a dial.
#[derive(Debug, Clone)]
pub struct DialerContext {
    /// Service id of the instance being dialed.
    pub id: String,
    pub name: String,
    pub address: String,
    pub timeout: Duration,
}

/// Opens a connection to a backend instance and completes its handshake.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial_and_handshake(&self, ctx: DialerContext) -> FabricResult<Conn>;
}

/// Dials over TCP and announces `service_id` in the inner handshake.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    service_id: String,
}

impl TcpDialer {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial_and_handshake(&self, ctx: DialerContext) -> FabricResult<Conn> {
        let mut conn = tokio::time::timeout(ctx.timeout, tcp::connect(&ctx.address))
            .await
            .map_err(|_| FabricError::Transport(format!("dial {} timed out", ctx.address)))??;

        let req = InnerHandshakeReq {
            service_id: self.service_id.clone(),
        };
        conn.send(&cbor_encode(&req)?).await?;
        debug!(target_id = %ctx.id, address = %ctx.address, "handshake sent");
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_core::codec::cbor_decode;
    use fabric_core::frame::OpCode;

    #[tokio::test]
    async fn handshake_carries_service_id() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, remote) = listener.accept().await.unwrap();
            let mut conn = tcp::from_stream(stream, remote);
            conn.read_frame().await.unwrap()
        });

        let dialer = TcpDialer::new("gw-1");
        let _conn = dialer
            .dial_and_handshake(DialerContext {
                id: "chat-1".into(),
                name: "chat".into(),
                address: addr.to_string(),
                timeout: Duration::from_secs(2),
            })
            .await
            .unwrap();

        let frame = server.await.unwrap();
        assert_eq!(frame.op, OpCode::Binary);
        let req: InnerHandshakeReq = cbor_decode(&frame.payload).unwrap();
        assert_eq!(req.service_id, "gw-1");
    }

    #[tokio::test]
    async fn dial_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let res = TcpDialer::new("gw-1")
            .dial_and_handshake(DialerContext {
                id: "x".into(),
                name: "chat".into(),
                address: addr.to_string(),
                timeout: Duration::from_secs(1),
            })
            .await;
        assert!(res.is_err());
    }
}
