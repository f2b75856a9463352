//! Connection-accepting server for both transports.
//!
//! Each accepted socket runs on its own task: upgrade (for WebSocket),
//! acceptor handshake under the login wait, channel registration, then the
//! channel's read loop. When the read loop ends the channel is removed,
//! the state listener is told, and the channel is closed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fabric_core::error::{FabricError, FabricResult};
use fabric_core::frame::OpCode;
use fabric_core::registration::ServiceRegistration;
use fabric_core::transport::{tcp, websocket, Conn, DEFAULT_MAX_FRAME_SIZE};
use fabric_core::wire::{self, Protocol};

use crate::channel::Channel;
use crate::channel_map::ChannelMap;
use crate::handler::{Acceptor, DefaultAcceptor, MessageListener, StateListener};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub login_wait: Duration,
    pub read_wait: Duration,
    pub write_wait: Duration,
    pub max_frame_size: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            login_wait: wire::DEFAULT_LOGIN_WAIT,
            read_wait: wire::DEFAULT_READ_WAIT,
            write_wait: wire::DEFAULT_WRITE_WAIT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

pub struct ServerBuilder {
    listen: String,
    registration: ServiceRegistration,
    options: ServerOptions,
    acceptor: Arc<dyn Acceptor>,
    message_listener: Option<Arc<dyn MessageListener>>,
    state_listener: Option<Arc<dyn StateListener>>,
    channels: Option<Arc<ChannelMap>>,
}

impl ServerBuilder {
    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn acceptor(mut self, acceptor: Arc<dyn Acceptor>) -> Self {
        self.acceptor = acceptor;
        self
    }

    pub fn message_listener(mut self, listener: Arc<dyn MessageListener>) -> Self {
        self.message_listener = Some(listener);
        self
    }

    pub fn state_listener(mut self, listener: Arc<dyn StateListener>) -> Self {
        self.state_listener = Some(listener);
        self
    }

    /// Share an existing channel map instead of creating one.
    pub fn channels(mut self, channels: Arc<ChannelMap>) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn build(self) -> FabricResult<Arc<Server>> {
        let message_listener = self
            .message_listener
            .ok_or_else(|| FabricError::Config("message listener is required".into()))?;
        let state_listener = self
            .state_listener
            .ok_or_else(|| FabricError::Config("state listener is required".into()))?;
        Ok(Arc::new(Server {
            listen: self.listen,
            registration: self.registration,
            options: self.options,
            acceptor: self.acceptor,
            message_listener,
            state_listener,
            channels: self.channels.unwrap_or_default(),
            quit: CancellationToken::new(),
            shutdown_once: AtomicBool::new(false),
            local_addr: OnceLock::new(),
        }))
    }
}

pub struct Server {
    listen: String,
    registration: ServiceRegistration,
    options: ServerOptions,
    acceptor: Arc<dyn Acceptor>,
    message_listener: Arc<dyn MessageListener>,
    state_listener: Arc<dyn StateListener>,
    channels: Arc<ChannelMap>,
    quit: CancellationToken,
    shutdown_once: AtomicBool,
    local_addr: OnceLock<SocketAddr>,
}

impl Server {
    pub fn builder(listen: impl Into<String>, registration: ServiceRegistration) -> ServerBuilder {
        ServerBuilder {
            listen: listen.into(),
            registration,
            options: ServerOptions::default(),
            acceptor: Arc::new(DefaultAcceptor),
            message_listener: None,
            state_listener: None,
            channels: None,
        }
    }

    pub fn registration(&self) -> &ServiceRegistration {
        &self.registration
    }

    pub fn service_id(&self) -> &str {
        &self.registration.id
    }

    pub fn protocol(&self) -> Protocol {
        self.registration.protocol
    }

    pub fn channels(&self) -> &Arc<ChannelMap> {
        &self.channels
    }

    /// Address actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Bind the listener and start accepting on a background task.
    pub async fn start(self: &Arc<Self>) -> FabricResult<SocketAddr> {
        let listener = TcpListener::bind(&self.listen).await?;
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);
        info!(
            service_id = %self.registration.id,
            protocol = %self.protocol(),
            listen = %addr,
            "server started"
        );

        let server = self.clone();
        tokio::spawn(async move { server.accept_loop(listener).await });
        Ok(addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, remote) = tokio::select! {
                _ = self.quit.cancelled() => break,
                res = listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle(stream, remote).await {
                    debug!(remote = %remote, error = %e, "connection ended");
                }
            });
        }
        info!(service_id = %self.registration.id, "server stopped accepting");
    }

    async fn handle(&self, stream: TcpStream, remote: SocketAddr) -> FabricResult<()> {
        let login_wait = self.options.login_wait;
        let mut conn = match self.protocol() {
            Protocol::Tcp => tcp::from_stream(stream, remote),
            Protocol::Websocket => {
                let upgrade = websocket::accept_with_limit(stream, remote, self.options.max_frame_size);
                tokio::time::timeout(login_wait, upgrade).await??
            }
        };

        let id = match tokio::time::timeout(login_wait, self.acceptor.accept(&mut conn, login_wait)).await {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                reject(&mut conn, &e.to_string()).await;
                return Err(e);
            }
            Err(_) => {
                reject(&mut conn, "login timeout").await;
                return Err(FabricError::Timeout);
            }
        };
        if self.channels.contains(&id).await {
            reject(&mut conn, "channel already exists").await;
            return Err(FabricError::DuplicateChannel(id));
        }

        let channel = Channel::new(id.clone(), conn);
        channel.set_read_wait(self.options.read_wait);
        channel.set_write_wait(self.options.write_wait);
        if let Err(e) = self.channels.add(channel.clone()).await {
            let _ = channel.close().await;
            return Err(e);
        }
        info!(channel_id = %id, remote = %remote, "channel accepted");

        self.state_listener.connected(&id).await;
        let reason = channel.read_loop(self.message_listener.clone()).await;
        if reason.is_disconnect() {
            debug!(channel_id = %id, reason = %reason, "read loop ended");
        } else {
            warn!(channel_id = %id, error = %reason, "read loop failed");
        }

        self.channels.remove(&id).await;
        if let Err(e) = self.state_listener.disconnect(&id).await {
            warn!(channel_id = %id, error = %e, "disconnect hook failed");
        }
        if let Err(e) = channel.close().await {
            debug!(channel_id = %id, error = %e, "close after read loop");
        }
        Ok(())
    }

    /// Queue a payload on a local channel.
    pub async fn push(&self, id: &str, payload: Vec<u8>) -> FabricResult<()> {
        let channel = self
            .channels
            .get(id)
            .await
            .ok_or_else(|| FabricError::ChannelNotFound(id.to_string()))?;
        channel.push(payload).await
    }

    /// Stop accepting and close every channel. Runs once; later calls return
    /// immediately. `ctx` firing stops the sweep between channels.
    pub async fn shutdown(&self, ctx: &CancellationToken) -> FabricResult<()> {
        if self.shutdown_once.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.quit.cancel();
        let channels = self.channels.all().await;
        info!(service_id = %self.registration.id, channels = channels.len(), "server shutting down");
        for channel in channels {
            if ctx.is_cancelled() {
                warn!(service_id = %self.registration.id, "shutdown cancelled before all channels closed");
                return Err(FabricError::Timeout);
            }
            if let Err(e) = channel.close().await {
                debug!(channel_id = %channel.id(), error = %e, "close during shutdown");
            }
        }
        Ok(())
    }
}

/// WebSocket close status for a refused login (policy violation).
const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Control frame payloads are capped at 125 bytes, 2 of them the status.
const MAX_CLOSE_REASON: usize = 123;

/// Tell the peer why it was refused, then drop the connection.
async fn reject(conn: &mut Conn, reason: &str) {
    debug!(remote = %conn.remote_addr(), reason, "rejecting connection");
    let payload = match conn.protocol() {
        Protocol::Tcp => reason.as_bytes().to_vec(),
        Protocol::Websocket => {
            let mut end = reason.len().min(MAX_CLOSE_REASON);
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            let mut payload = CLOSE_POLICY_VIOLATION.to_be_bytes().to_vec();
            payload.extend_from_slice(&reason.as_bytes()[..end]);
            payload
        }
    };
    let _ = conn.write_frame(OpCode::Close, &payload).await;
    let _ = conn.flush().await;
    let _ = conn.close().await;
}
