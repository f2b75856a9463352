//! Per-request context handed to command handlers.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

use fabric_core::error::FabricResult;
use fabric_core::location::{Location, Session};
use fabric_core::messages::ErrorResp;
use fabric_core::packet::{Flag, Header, LogicPkt, Status};
use fabric_core::wire::META_DEST_CHANNELS;

use crate::container::Pusher;
use crate::handler::Agent;
use crate::storage::SessionStorage;

pub struct Context {
    request: LogicPkt,
    session: Session,
    /// The gateway connection the request arrived on.
    agent: Arc<dyn Agent>,
    storage: Arc<dyn SessionStorage>,
    pusher: Arc<dyn Pusher>,
}

impl Context {
    pub fn new(
        request: LogicPkt,
        session: Session,
        agent: Arc<dyn Agent>,
        storage: Arc<dyn SessionStorage>,
        pusher: Arc<dyn Pusher>,
    ) -> Self {
        Self {
            request,
            session,
            agent,
            storage,
            pusher,
        }
    }

    pub fn header(&self) -> &Header {
        &self.request.header
    }

    pub fn read_body<T: DeserializeOwned>(&self) -> FabricResult<T> {
        self.request.read_body()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Answer the request with `status` and `body`.
    pub async fn resp<T: Serialize>(&self, status: Status, body: &T) -> FabricResult<()> {
        let mut pkt = self.response(status);
        pkt.write_body(body)?;
        self.send_response(pkt).await
    }

    /// Answer with `status` and no body.
    pub async fn resp_status(&self, status: Status) -> FabricResult<()> {
        self.send_response(self.response(status)).await
    }

    pub async fn resp_with_error(&self, status: Status, err: impl Display) -> FabricResult<()> {
        self.resp(
            status,
            &ErrorResp {
                message: err.to_string(),
            },
        )
        .await
    }

    fn response(&self, status: Status) -> LogicPkt {
        let mut pkt = LogicPkt::from_header(&self.request.header);
        pkt.header.status = status;
        pkt.header.flag = Flag::Response;
        pkt
    }

    async fn send_response(&self, mut pkt: LogicPkt) -> FabricResult<()> {
        pkt.add_meta(META_DEST_CHANNELS, self.request.header.channel_id.clone());
        self.agent.push(pkt.encode()?).await
    }

    /// Push `body` under the request's command to every location.
    pub async fn dispatch<T: Serialize>(&self, body: &T, locations: &[Location]) -> FabricResult<()> {
        self.dispatch_as(&self.request.header.command, body, locations).await
    }

    /// Push `body` under `command` to every location, one push per
    /// gateway. The requesting channel itself is skipped. Every gateway is
    /// attempted; the first failure is returned.
    pub async fn dispatch_as<T: Serialize>(
        &self,
        command: &str,
        body: &T,
        locations: &[Location],
    ) -> FabricResult<()> {
        let mut groups: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for loc in locations {
            if loc.channel_id == self.session.channel_id {
                continue;
            }
            groups
                .entry(loc.gate_id.as_str())
                .or_default()
                .push(loc.channel_id.clone());
        }
        if groups.is_empty() {
            return Ok(());
        }

        let mut pkt = LogicPkt::from_header(&self.request.header);
        pkt.header.command = command.to_string();
        pkt.header.status = Status::Success;
        pkt.header.flag = Flag::Push;
        pkt.write_body(body)?;

        let mut first_err = None;
        for (gateway, channels) in groups {
            debug!(gateway, channels = channels.len(), command, "dispatch");
            if let Err(e) = self.pusher.push(gateway, &channels, pkt.clone()).await {
                error!(gateway, command, error = %e, "dispatch failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn get_location(&self, account: &str, device: &str) -> FabricResult<Option<Location>> {
        self.storage.get_location(account, device).await
    }

    pub async fn get_locations(&self, accounts: &[String]) -> FabricResult<Vec<Location>> {
        self.storage.get_locations(accounts).await
    }

    pub async fn add(&self, session: &Session) -> FabricResult<()> {
        self.storage.add(session).await
    }

    pub async fn delete(&self, account: &str, channel_id: &str) -> FabricResult<()> {
        self.storage.delete(account, channel_id).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use fabric_core::packet::Packet;
    use tokio::sync::mpsc;

    /// The gateway side of a request: decodes every response pushed to it.
    pub(crate) struct GatewayAgent {
        pub id: String,
        pub tx: mpsc::UnboundedSender<LogicPkt>,
    }

    #[async_trait]
    impl Agent for GatewayAgent {
        fn id(&self) -> &str {
            &self.id
        }

        async fn push(&self, payload: Vec<u8>) -> FabricResult<()> {
            let _ = self.tx.send(Packet::decode_logic(&payload)?);
            Ok(())
        }
    }

    pub(crate) struct RecordingPusher(pub mpsc::UnboundedSender<(String, Vec<String>, LogicPkt)>);

    #[async_trait]
    impl Pusher for RecordingPusher {
        async fn push(&self, gateway: &str, channels: &[String], pkt: LogicPkt) -> FabricResult<()> {
            let _ = self.0.send((gateway.to_string(), channels.to_vec(), pkt));
            Ok(())
        }
    }

    pub(crate) struct Fixture {
        pub ctx: Context,
        pub storage: Arc<MemoryStorage>,
        pub responses: mpsc::UnboundedReceiver<LogicPkt>,
        pub pushes: mpsc::UnboundedReceiver<(String, Vec<String>, LogicPkt)>,
    }

    pub(crate) fn session(account: &str, channel_id: &str, gate_id: &str) -> Session {
        Session {
            channel_id: channel_id.into(),
            gate_id: gate_id.into(),
            account: account.into(),
            ..Default::default()
        }
    }

    pub(crate) fn fixture_with(request: LogicPkt, session: Session, storage: Arc<MemoryStorage>) -> Fixture {
        let (resp_tx, responses) = mpsc::unbounded_channel();
        let (push_tx, pushes) = mpsc::unbounded_channel();
        let agent = Arc::new(GatewayAgent {
            id: session.gate_id.clone(),
            tx: resp_tx,
        });
        let ctx = Context::new(request, session, agent, storage.clone(), Arc::new(RecordingPusher(push_tx)));
        Fixture {
            ctx,
            storage,
            responses,
            pushes,
        }
    }

    /// Request from `acct1` on the channel the packet names, via `gw-1`.
    pub(crate) fn fixture(request: LogicPkt) -> Fixture {
        let s = session("acct1", &request.header.channel_id, "gw-1");
        fixture_with(request, s, Arc::new(MemoryStorage::default()))
    }

    #[tokio::test]
    async fn resp_targets_requesting_channel() {
        let req = LogicPkt::new("chat.user.talk").with_channel("gw-1_acct1_1");
        let mut fx = fixture(req.clone());
        fx.ctx.resp_status(Status::Success).await.unwrap();

        let resp = fx.responses.recv().await.unwrap();
        assert_eq!(resp.header.flag, Flag::Response);
        assert_eq!(resp.header.sequence, req.header.sequence);
        assert_eq!(resp.meta(META_DEST_CHANNELS), Some("gw-1_acct1_1"));
    }

    #[tokio::test]
    async fn dispatch_groups_by_gateway_and_skips_sender() {
        let req = LogicPkt::new("chat.user.talk").with_channel("gw-1_acct1_1");
        let mut fx = fixture(req);
        let locations = vec![
            Location::new("gw-1_acct1_1", "gw-1"),
            Location::new("gw-1_acct2_2", "gw-1"),
            Location::new("gw-1_acct3_3", "gw-1"),
            Location::new("gw-2_acct4_1", "gw-2"),
        ];
        fx.ctx.dispatch(&"hi", &locations).await.unwrap();

        let (gw, channels, pkt) = fx.pushes.recv().await.unwrap();
        assert_eq!(gw, "gw-1");
        assert_eq!(channels, vec!["gw-1_acct2_2", "gw-1_acct3_3"]);
        assert_eq!(pkt.header.flag, Flag::Push);
        assert_eq!(pkt.read_body::<String>().unwrap(), "hi");

        let (gw, channels, _) = fx.pushes.recv().await.unwrap();
        assert_eq!(gw, "gw-2");
        assert_eq!(channels, vec!["gw-2_acct4_1"]);
        assert!(fx.pushes.try_recv().is_err());
    }

    #[tokio::test]
    async fn dispatch_to_self_only_sends_nothing() {
        let req = LogicPkt::new("chat.user.talk").with_channel("gw-1_acct1_1");
        let mut fx = fixture(req);
        fx.ctx
            .dispatch(&"echo", &[Location::new("gw-1_acct1_1", "gw-1")])
            .await
            .unwrap();
        assert!(fx.pushes.try_recv().is_err());
    }
}
