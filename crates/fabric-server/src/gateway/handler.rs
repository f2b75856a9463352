//! Client-facing hooks of a gateway.
//!
//! Login runs in two steps: the acceptor validates the sign-in packet and
//! parks the rewritten request, then the `connected` hook forwards it to the
//! login service once the channel is registered, so the login response can
//! never arrive before there is a channel to push it to.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use fabric_core::error::{FabricError, FabricResult};
use fabric_core::frame::OpCode;
use fabric_core::location::Session;
use fabric_core::messages::{ErrorResp, LoginReq};
use fabric_core::packet::{Flag, HeartbeatCode, HeartbeatPkt, LogicPkt, Packet, Status};
use fabric_core::token::parse_token;
use fabric_core::transport::Conn;
use fabric_core::wire::{self, Sequence};

use super::rate_limit::LoginRateLimit;
use crate::channel_map::ChannelMap;
use crate::container::Dispatcher;
use crate::handler::{Acceptor, Agent, MessageListener, StateListener};

const RATE_LIMIT_GC_EVERY: u32 = 1024;

pub struct GatewayHandler {
    service_id: String,
    app_secret: Vec<u8>,
    dispatcher: Arc<Dispatcher>,
    channels: Arc<ChannelMap>,
    pending_logins: Mutex<HashMap<String, LogicPkt>>,
    rate_limit: Option<Mutex<LoginRateLimit>>,
    attempts: AtomicU32,
    seq: Sequence,
}

impl GatewayHandler {
    /// `channels` must be the map the gateway's server registers into.
    pub fn new(
        service_id: impl Into<String>,
        app_secret: Vec<u8>,
        dispatcher: Arc<Dispatcher>,
        channels: Arc<ChannelMap>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            app_secret,
            dispatcher,
            channels,
            pending_logins: Mutex::new(HashMap::new()),
            rate_limit: None,
            attempts: AtomicU32::new(0),
            seq: Sequence::new(),
        }
    }

    /// Limit login attempts per remote IP; 0 disables the limit.
    pub fn with_login_rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit = LoginRateLimit::per_minute(per_minute).map(Mutex::new);
        self
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    fn allow_login(&self, conn: &Conn) -> bool {
        let Some(limit) = &self.rate_limit else {
            return true;
        };
        let Ok(mut limit) = limit.lock() else {
            return true;
        };
        if self.attempts.fetch_add(1, Ordering::Relaxed) % RATE_LIMIT_GC_EVERY == 0 {
            limit.gc();
        }
        limit.check(&conn.remote_addr().ip())
    }

    fn take_pending(&self, id: &str) -> Option<LogicPkt> {
        self.pending_logins.lock().ok().and_then(|mut p| p.remove(id))
    }

    async fn fail_login(&self, id: &str, mut req: LogicPkt, reason: &str) {
        req.header.status = Status::SystemException;
        req.header.flag = Flag::Response;
        let _ = req.write_body(&ErrorResp {
            message: reason.to_string(),
        });
        if let Some(channel) = self.channels.get(id).await {
            if let Ok(payload) = req.encode() {
                let _ = channel.push(payload).await;
            }
            let _ = channel.close().await;
        }
    }
}

/// Answer the sign-in packet directly on the raw connection.
async fn reply(conn: &mut Conn, req: &LogicPkt, status: Status) {
    let mut resp = LogicPkt::from_header(&req.header);
    resp.header.status = status;
    resp.header.flag = Flag::Response;
    if let Ok(payload) = resp.encode() {
        let _ = conn.send(&payload).await;
    }
}

#[async_trait]
impl Acceptor for GatewayHandler {
    async fn accept(&self, conn: &mut Conn, _login_wait: Duration) -> FabricResult<String> {
        let frame = conn.read_frame().await?;
        if frame.op == OpCode::Close {
            return Err(FabricError::RemoteClosed);
        }
        let mut req = Packet::decode_logic(&frame.payload)?;
        if req.header.command != wire::COMMAND_LOGIN_SIGN_IN {
            reply(conn, &req, Status::InvalidCommand).await;
            return Err(FabricError::InvalidMessage(format!(
                "first packet must be {}, got {}",
                wire::COMMAND_LOGIN_SIGN_IN,
                req.header.command
            )));
        }

        if !self.allow_login(conn) {
            reply(conn, &req, Status::Unauthorized).await;
            return Err(FabricError::AuthFailed("too many login attempts".into()));
        }

        let login: LoginReq = match req.read_body() {
            Ok(login) => login,
            Err(e) => {
                reply(conn, &req, Status::InvalidPacketBody).await;
                return Err(e);
            }
        };
        let token = match parse_token(&self.app_secret, &login.token) {
            Ok(token) => token,
            Err(e) => {
                reply(conn, &req, Status::Unauthorized).await;
                return Err(FabricError::AuthFailed(e.to_string()));
            }
        };

        let id = format!("{}_{}_{}", self.service_id, token.account, self.seq.next());
        req.header.channel_id = id.clone();
        req.write_body(&Session {
            channel_id: id.clone(),
            gate_id: self.service_id.clone(),
            account: token.account.clone(),
            remote_ip: conn.remote_addr().ip().to_string(),
            app: token.app,
            device: login.device.unwrap_or_default(),
            ..Default::default()
        })?;
        if let Ok(mut pending) = self.pending_logins.lock() {
            pending.insert(id.clone(), req);
        }
        info!(channel_id = %id, account = %token.account, remote = %conn.remote_addr(), "login accepted");
        Ok(id)
    }
}

#[async_trait]
impl MessageListener for GatewayHandler {
    async fn receive(&self, agent: Arc<dyn Agent>, payload: Vec<u8>) {
        let packet = match Packet::decode(&payload) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(channel_id = %agent.id(), error = %e, "dropping undecodable payload");
                return;
            }
        };
        match packet {
            Packet::Heartbeat(hb) => {
                if hb.code == HeartbeatCode::Ping {
                    if let Ok(pong) = HeartbeatPkt::pong().encode() {
                        let _ = agent.push(pong).await;
                    }
                }
            }
            Packet::Logic(mut pkt) => {
                pkt.header.channel_id = agent.id().to_string();
                let service = pkt.service_name().to_string();
                if let Err(e) = self.dispatcher.forward(&service, &pkt).await {
                    error!(
                        channel_id = %agent.id(),
                        command = %pkt.header.command,
                        dest = %pkt.header.dest,
                        error = %e,
                        "forward failed"
                    );
                    let mut resp = LogicPkt::from_header(&pkt.header);
                    resp.header.status = Status::NoDestination;
                    resp.header.flag = Flag::Response;
                    if let Ok(payload) = resp.encode() {
                        let _ = agent.push(payload).await;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl StateListener for GatewayHandler {
    async fn connected(&self, id: &str) {
        let Some(req) = self.take_pending(id) else {
            return;
        };
        if let Err(e) = self.dispatcher.forward(wire::SN_LOGIN, &req).await {
            error!(channel_id = %id, error = %e, "forward login failed");
            self.fail_login(id, req, &e.to_string()).await;
        }
    }

    async fn disconnect(&self, id: &str) -> FabricResult<()> {
        info!(channel_id = %id, "disconnect");
        if self.take_pending(id).is_some() {
            return Ok(());
        }
        let logout = LogicPkt::new(wire::COMMAND_LOGIN_SIGN_OUT).with_channel(id);
        if let Err(e) = self.dispatcher.forward(wire::SN_LOGIN, &logout).await {
            warn!(channel_id = %id, error = %e, "forward logout failed");
        }
        Ok(())
    }
}
