//! Server hooks of a logic service.
//!
//! Logic services are dialed by gateways, never by end users. Each inbound
//! channel belongs to one gateway and is named after that gateway's
//! service id, which is how pushes find their way back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use fabric_core::codec;
use fabric_core::error::{FabricError, FabricResult};
use fabric_core::frame::OpCode;
use fabric_core::location::Session;
use fabric_core::messages::InnerHandshakeReq;
use fabric_core::packet::{Packet, Status};
use fabric_core::transport::Conn;
use fabric_core::wire;

use super::context::Context;
use super::router::Router;
use crate::container::Pusher;
use crate::handler::{Acceptor, Agent, MessageListener, StateListener};
use crate::storage::SessionStorage;

/// Accepts a gateway by its inner handshake.
#[derive(Debug, Default, Clone, Copy)]
pub struct InnerAcceptor;

#[async_trait]
impl Acceptor for InnerAcceptor {
    async fn accept(&self, conn: &mut Conn, _login_wait: Duration) -> FabricResult<String> {
        let frame = conn.read_frame().await?;
        if frame.op != OpCode::Binary && frame.op != OpCode::Text {
            return Err(FabricError::InvalidMessage(format!(
                "expected handshake, got {:?} frame",
                frame.op
            )));
        }
        let req: InnerHandshakeReq = codec::cbor_decode(&frame.payload)?;
        if req.service_id.is_empty() {
            return Err(FabricError::InvalidMessage("empty service id in handshake".into()));
        }
        info!(service_id = %req.service_id, remote = %conn.remote_addr(), "gateway connected");
        Ok(req.service_id)
    }
}

pub struct LogicHandler {
    router: Arc<Router>,
    storage: Arc<dyn SessionStorage>,
    pusher: Arc<dyn Pusher>,
}

impl LogicHandler {
    pub fn new(router: Arc<Router>, storage: Arc<dyn SessionStorage>, pusher: Arc<dyn Pusher>) -> Self {
        Self {
            router,
            storage,
            pusher,
        }
    }
}

#[async_trait]
impl MessageListener for LogicHandler {
    async fn receive(&self, agent: Arc<dyn Agent>, payload: Vec<u8>) {
        let pkt = match Packet::decode(&payload) {
            Ok(Packet::Logic(pkt)) => pkt,
            Ok(Packet::Heartbeat(_)) => return,
            Err(e) => {
                warn!(gateway = %agent.id(), error = %e, "dropping undecodable packet");
                return;
            }
        };

        // sign-in carries its session in the body; everything else looks it up
        let found = if pkt.header.command == wire::COMMAND_LOGIN_SIGN_IN {
            pkt.read_body::<Session>().map(Some)
        } else {
            self.storage.get(&pkt.header.channel_id).await
        };
        let (session, failure) = match found {
            Ok(Some(session)) => (session, None),
            Ok(None) => {
                let reason = format!("session of {} not found", pkt.header.channel_id);
                (Session::default(), Some((Status::SessionNotFound, reason)))
            }
            Err(e) => {
                warn!(channel_id = %pkt.header.channel_id, error = %e, "session lookup failed");
                let status = match e {
                    FabricError::Codec(_) => Status::InvalidPacketBody,
                    _ => Status::SystemException,
                };
                (Session::default(), Some((status, e.to_string())))
            }
        };

        let ctx = Context::new(pkt, session, agent, self.storage.clone(), self.pusher.clone());
        let Some((status, reason)) = failure else {
            self.router.serve(&ctx).await;
            return;
        };
        debug!(command = %ctx.header().command, channel_id = %ctx.header().channel_id, ?status, "request refused");
        if let Err(e) = ctx.resp_with_error(status, reason).await {
            warn!(channel_id = %ctx.header().channel_id, error = %e, "response failed");
        }
    }
}

#[async_trait]
impl StateListener for LogicHandler {
    async fn disconnect(&self, id: &str) -> FabricResult<()> {
        info!(gateway = %id, "gateway disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::duplex_conn;
    use crate::logic::context::tests::{session, GatewayAgent, RecordingPusher};
    use crate::logic::login::SignIn;
    use crate::storage::MemoryStorage;
    use fabric_core::packet::LogicPkt;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn handshake_names_channel_after_gateway() {
        let (mut conn, mut peer) = duplex_conn();
        let hs = codec::cbor_encode(&InnerHandshakeReq {
            service_id: "gw-1".into(),
        })
        .unwrap();
        peer.send(OpCode::Binary, &hs).await;
        let id = InnerAcceptor.accept(&mut conn, Duration::from_secs(1)).await.unwrap();
        assert_eq!(id, "gw-1");
    }

    #[tokio::test]
    async fn handshake_rejects_garbage() {
        let (mut conn, mut peer) = duplex_conn();
        peer.send(OpCode::Binary, b"\xff\xff").await;
        assert!(InnerAcceptor.accept(&mut conn, Duration::from_secs(1)).await.is_err());
    }

    fn handler(router: Router) -> (LogicHandler, Arc<dyn Agent>, mpsc::UnboundedReceiver<LogicPkt>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (push_tx, _push_rx) = mpsc::unbounded_channel();
        let h = LogicHandler::new(
            Arc::new(router),
            Arc::new(MemoryStorage::default()),
            Arc::new(RecordingPusher(push_tx)),
        );
        let agent: Arc<dyn Agent> = Arc::new(GatewayAgent { id: "gw-1".into(), tx });
        (h, agent, rx)
    }

    #[tokio::test]
    async fn request_without_session_is_refused() {
        let (h, agent, mut rx) = handler(Router::new());
        let pkt = LogicPkt::new(wire::COMMAND_CHAT_USER_TALK)
            .with_channel("gw-1_ghost_1")
            .with_dest("acct2");
        h.receive(agent, pkt.encode().unwrap()).await;

        let resp = rx.recv().await.unwrap();
        assert_eq!(resp.header.status, Status::SessionNotFound);
        assert_eq!(resp.meta(wire::META_DEST_CHANNELS), Some("gw-1_ghost_1"));
    }

    #[tokio::test]
    async fn signin_takes_session_from_body() {
        let mut router = Router::new();
        router.handle(wire::COMMAND_LOGIN_SIGN_IN, Arc::new(SignIn));
        let (h, agent, mut rx) = handler(router);

        let s = session("acct1", "gw-1_acct1_1", "gw-1");
        let mut pkt = LogicPkt::new(wire::COMMAND_LOGIN_SIGN_IN).with_channel(&s.channel_id);
        pkt.write_body(&s).unwrap();
        h.receive(agent, pkt.encode().unwrap()).await;

        assert_eq!(rx.recv().await.unwrap().header.status, Status::Success);
    }
}
