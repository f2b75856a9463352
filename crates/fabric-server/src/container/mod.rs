//! Runs one server inside the routing fabric.
//!
//! The container registers the server with naming, keeps clients to the
//! services it depends on, and delivers packets coming back from those
//! services to the local channels named in their `dest.channels` meta.

pub mod client_map;
pub mod dispatcher;
pub mod selector;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fabric_core::error::{FabricError, FabricResult};
use fabric_core::packet::LogicPkt;
use fabric_core::registration::ServiceRegistration;
use fabric_core::wire::META_DEST_CHANNELS;

use crate::channel_map::ChannelMap;
use crate::naming::Naming;
use crate::server::Server;

pub use dispatcher::Dispatcher;
pub use selector::{HashSelector, Selector};

const STATE_UNINITIALIZED: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

pub struct Container {
    server: Arc<Server>,
    naming: Arc<dyn Naming>,
    dispatcher: Arc<Dispatcher>,
    dependencies: Vec<String>,
    inbound: Mutex<Option<mpsc::Receiver<LogicPkt>>>,
    push_task: Mutex<Option<JoinHandle<()>>>,
    registration: Mutex<Option<ServiceRegistration>>,
    state: AtomicU8,
}

impl Container {
    /// `inbound` is the receiving end of the queue the dispatcher feeds.
    pub fn new(
        server: Arc<Server>,
        naming: Arc<dyn Naming>,
        dispatcher: Arc<Dispatcher>,
        inbound: mpsc::Receiver<LogicPkt>,
        dependencies: Vec<String>,
    ) -> Self {
        Self {
            server,
            naming,
            dispatcher,
            dependencies,
            inbound: Mutex::new(Some(inbound)),
            push_task: Mutex::new(None),
            registration: Mutex::new(None),
            state: AtomicU8::new(STATE_UNINITIALIZED),
        }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Start the server, register it, and connect to dependencies.
    ///
    /// Returns the registration as published (with the bound port filled in
    /// when the configured one was 0).
    pub async fn start(&self) -> FabricResult<ServiceRegistration> {
        if self
            .state
            .compare_exchange(STATE_UNINITIALIZED, STATE_STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(FabricError::Other("container already started".into()));
        }

        let addr = self.server.start().await?;
        let mut registration = self.server.registration().clone();
        if registration.port == 0 {
            registration.port = addr.port();
        }

        let inbound = self
            .inbound
            .lock()
            .await
            .take()
            .ok_or_else(|| FabricError::Other("inbound queue already taken".into()))?;
        let server = self.server.clone();
        *self.push_task.lock().await = Some(tokio::spawn(push_loop(server, inbound)));

        for dep in &self.dependencies {
            match self.dispatcher.connect_all(dep).await {
                Ok(n) => info!(service = %dep, instances = n, "dependency connected"),
                Err(e) => warn!(service = %dep, error = %e, "dependency lookup failed"),
            }
            self.dispatcher.watch(dep).await?;
        }

        self.naming.register(&registration).await?;
        *self.registration.lock().await = Some(registration.clone());
        info!(
            service_id = %registration.id,
            service = %registration.name,
            address = %registration.dial_url(),
            "container started"
        );
        Ok(registration)
    }

    /// Deregister, stop watches, close backend clients, then shut the server
    /// down bounded by `ctx`.
    pub async fn shutdown(&self, ctx: &CancellationToken) -> FabricResult<()> {
        if self.state.swap(STATE_CLOSED, Ordering::AcqRel) != STATE_STARTED {
            return Ok(());
        }
        if let Some(reg) = self.registration.lock().await.take() {
            if let Err(e) = self.naming.deregister(&reg.id).await {
                warn!(service_id = %reg.id, error = %e, "deregister failed");
            }
        }
        for dep in &self.dependencies {
            if let Err(e) = self.naming.unsubscribe(dep).await {
                warn!(service = %dep, error = %e, "unsubscribe failed");
            }
        }
        self.dispatcher.close_all().await;
        let res = self.server.shutdown(ctx).await;
        if let Some(task) = self.push_task.lock().await.take() {
            task.abort();
        }
        info!(service_id = %self.server.service_id(), "container stopped");
        res
    }
}

async fn push_loop(server: Arc<Server>, mut inbound: mpsc::Receiver<LogicPkt>) {
    while let Some(pkt) = inbound.recv().await {
        deliver(&server, pkt).await;
    }
}

/// Push a packet from a backend to every local channel it names.
async fn deliver(server: &Server, mut pkt: LogicPkt) {
    let Some(targets) = pkt.remove_meta(META_DEST_CHANNELS) else {
        warn!(command = %pkt.header.command, "packet from backend has no destination channels");
        return;
    };
    let payload = match pkt.encode() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(command = %pkt.header.command, error = %e, "re-encode failed");
            return;
        }
    };
    for id in targets.split(',').filter(|s| !s.is_empty()) {
        if let Err(e) = server.push(id, payload.clone()).await {
            debug!(channel_id = %id, command = %pkt.header.command, error = %e, "push to channel failed");
        }
    }
}

/// Delivers packets from a logic service to gateways.
#[async_trait]
pub trait Pusher: Send + Sync {
    /// Send `pkt` to `gateway`, addressed to the listed client channels.
    async fn push(&self, gateway: &str, channels: &[String], pkt: LogicPkt) -> FabricResult<()>;
}

/// Pushes over the inbound channels gateways opened to this logic server.
/// Those channels are keyed by the gateway's service id.
pub struct ChannelPusher {
    channels: Arc<ChannelMap>,
}

impl ChannelPusher {
    pub fn new(channels: Arc<ChannelMap>) -> Self {
        Self { channels }
    }
}

#[async_trait]
impl Pusher for ChannelPusher {
    async fn push(&self, gateway: &str, channels: &[String], mut pkt: LogicPkt) -> FabricResult<()> {
        pkt.add_meta(META_DEST_CHANNELS, channels.join(","));
        let channel = self
            .channels
            .get(gateway)
            .await
            .ok_or_else(|| FabricError::ChannelNotFound(gateway.to_string()))?;
        channel.push(pkt.encode()?).await
    }
}
