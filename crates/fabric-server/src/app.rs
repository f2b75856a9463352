//! Wiring of gateway and logic-service containers from configuration.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fabric_client::{ClientOptions, TcpDialer};
use fabric_core::error::FabricResult;
use fabric_core::packet::LogicPkt;
use fabric_core::wire::{self, Protocol};

use crate::channel_map::ChannelMap;
use crate::config::{FabricConfig, NamingBackend, StorageBackend};
use crate::container::{ChannelPusher, Container, Dispatcher, HashSelector};
use crate::gateway::GatewayHandler;
use crate::logic::{self, InnerAcceptor, LogicHandler};
use crate::monitor;
use crate::naming::{ConsulNaming, MemoryNaming, Naming};
use crate::server::Server;
use crate::storage::{MemoryStorage, RedisStorage, SessionStorage};

/// Depth of the queue between backend clients and the push loop.
const INBOUND_QUEUE: usize = 1024;

/// Upper bound on a graceful shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub fn naming_from_config(config: &FabricConfig) -> FabricResult<Arc<dyn Naming>> {
    Ok(match config.naming.backend {
        NamingBackend::Consul => Arc::new(ConsulNaming::new(&config.naming.consul_url)?),
        NamingBackend::Memory => Arc::new(MemoryNaming::new()),
    })
}

pub async fn storage_from_config(config: &FabricConfig) -> FabricResult<Arc<dyn SessionStorage>> {
    Ok(match config.storage.backend {
        StorageBackend::Redis => {
            Arc::new(RedisStorage::connect(&config.storage.redis_url, config.location_ttl()).await?)
        }
        StorageBackend::Memory => Arc::new(MemoryStorage::new(config.location_ttl())),
    })
}

fn dispatcher(naming: Arc<dyn Naming>, service_id: &str) -> (Arc<Dispatcher>, mpsc::Receiver<LogicPkt>) {
    let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
    let dispatcher = Dispatcher::new(
        naming,
        Arc::new(HashSelector),
        Arc::new(TcpDialer::new(service_id)),
        ClientOptions::default(),
        tx,
    );
    (dispatcher, rx)
}

/// A gateway container. Websocket unless the config says tcp; the default
/// service name follows the protocol.
pub fn build_gateway(config: &FabricConfig, naming: Arc<dyn Naming>, app_secret: Vec<u8>) -> FabricResult<Container> {
    let protocol = config.server.protocol.unwrap_or(Protocol::Websocket);
    let default_name = match protocol {
        Protocol::Websocket => wire::SN_WS_GATEWAY,
        Protocol::Tcp => wire::SN_TCP_GATEWAY,
    };
    let registration = config.registration(default_name, protocol)?;
    let (dispatcher, inbound) = dispatcher(naming.clone(), &registration.id);

    let channels = Arc::new(ChannelMap::new());
    let handler = Arc::new(
        GatewayHandler::new(registration.id.clone(), app_secret, dispatcher.clone(), channels.clone())
            .with_login_rate_limit(config.auth.login_per_minute),
    );
    let server = Server::builder(config.server.listen.clone(), registration)
        .options(config.server_options())
        .acceptor(handler.clone())
        .message_listener(handler.clone())
        .state_listener(handler)
        .channels(channels)
        .build()?;

    Ok(Container::new(
        server,
        naming,
        dispatcher,
        inbound,
        config.routing.dependencies.clone(),
    ))
}

/// A logic-service container running the bundled handlers of `service`.
/// Logic services always listen on tcp.
pub fn build_logic(
    config: &FabricConfig,
    service: &str,
    naming: Arc<dyn Naming>,
    storage: Arc<dyn SessionStorage>,
) -> FabricResult<Container> {
    let router = Arc::new(logic::service_router(service)?);
    let mut registration = config.registration(service, Protocol::Tcp)?;
    if registration.protocol != Protocol::Tcp {
        warn!(service, protocol = %registration.protocol, "logic services only listen on tcp");
        registration.protocol = Protocol::Tcp;
    }
    let (dispatcher, inbound) = dispatcher(naming.clone(), &registration.id);

    let channels = Arc::new(ChannelMap::new());
    let pusher = Arc::new(ChannelPusher::new(channels.clone()));
    let handler = Arc::new(LogicHandler::new(router, storage, pusher));
    let server = Server::builder(config.server.listen.clone(), registration)
        .options(config.server_options())
        .acceptor(Arc::new(InnerAcceptor))
        .message_listener(handler.clone())
        .state_listener(handler)
        .channels(channels)
        .build()?;

    Ok(Container::new(server, naming, dispatcher, inbound, Vec::new()))
}

/// Start `container` (and the health endpoint when configured), wait for
/// `shutdown`, then stop within [`SHUTDOWN_TIMEOUT`].
pub async fn run(container: Container, config: &FabricConfig, shutdown: impl Future<Output = ()>) -> FabricResult<()> {
    let monitor_quit = CancellationToken::new();
    if let Some(port) = config.server.monitor_port {
        monitor::start(&format!("0.0.0.0:{port}"), monitor_quit.clone()).await?;
    }
    let registration = container.start().await?;
    info!(service_id = %registration.id, service = %registration.name, "running");

    shutdown.await;
    info!(service_id = %registration.id, "shutting down");

    let ctx = CancellationToken::new();
    let deadline = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SHUTDOWN_TIMEOUT).await;
            ctx.cancel();
        })
    };
    let res = container.shutdown(&ctx).await;
    deadline.abort();
    monitor_quit.cancel();
    res
}
