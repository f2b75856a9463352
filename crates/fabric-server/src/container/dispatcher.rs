//! Forwarding packets to backend services.
//!
//! Keeps one persistent [`Client`] per backend instance, opened lazily or
//! when a watched service gains an instance. Every packet read from a
//! backend is decoded and handed to the inbound queue.

use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use fabric_client::{Client, ClientOptions, Dialer};
use fabric_core::error::{FabricError, FabricResult};
use fabric_core::frame::OpCode;
use fabric_core::packet::{LogicPkt, Packet};
use fabric_core::registration::ServiceRegistration;

use super::client_map::ClientMap;
use super::selector::Selector;
use crate::naming::{Naming, WatchCallback};

pub struct Dispatcher {
    naming: Arc<dyn Naming>,
    selector: Arc<dyn Selector>,
    dialer: Arc<dyn Dialer>,
    client_options: ClientOptions,
    clients: Arc<ClientMap>,
    inbound: mpsc::Sender<LogicPkt>,
    connect_lock: Mutex<()>,
}

impl Dispatcher {
    pub fn new(
        naming: Arc<dyn Naming>,
        selector: Arc<dyn Selector>,
        dialer: Arc<dyn Dialer>,
        client_options: ClientOptions,
        inbound: mpsc::Sender<LogicPkt>,
    ) -> Arc<Self> {
        Arc::new(Self {
            naming,
            selector,
            dialer,
            client_options,
            clients: Arc::new(ClientMap::new()),
            inbound,
            connect_lock: Mutex::new(()),
        })
    }

    pub fn clients(&self) -> &Arc<ClientMap> {
        &self.clients
    }

    /// Send `pkt` to one instance of `service`.
    ///
    /// Connected instances are preferred; otherwise naming is asked for
    /// healthy ones and the chosen instance is dialed.
    pub async fn forward(self: &Arc<Self>, service: &str, pkt: &LogicPkt) -> FabricResult<()> {
        let mut candidates: Vec<ServiceRegistration> = self
            .clients
            .services(service)
            .await
            .iter()
            .filter(|c| !c.is_closed())
            .map(|c| c.registration().clone())
            .collect();
        if candidates.is_empty() {
            candidates = self.naming.find(service, &[]).await?;
        }
        if candidates.is_empty() {
            return Err(FabricError::NoInstances(service.to_string()));
        }
        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        let id = self
            .selector
            .lookup(&pkt.header, &candidates)
            .ok_or_else(|| FabricError::NoDispatcher(service.to_string()))?;
        let client = match self.clients.get(&id).await {
            Some(client) if !client.is_closed() => client,
            _ => {
                let reg = candidates
                    .into_iter()
                    .find(|r| r.id == id)
                    .ok_or_else(|| FabricError::NoDispatcher(service.to_string()))?;
                self.connect(reg).await?
            }
        };
        client.send(&pkt.encode()?).await
    }

    /// Open a client to `registration` unless one is already connected.
    pub async fn connect(self: &Arc<Self>, registration: ServiceRegistration) -> FabricResult<Arc<Client>> {
        let _guard = self.connect_lock.lock().await;
        if let Some(existing) = self.clients.get(&registration.id).await {
            if !existing.is_closed() {
                return Ok(existing);
            }
        }

        let client = Arc::new(Client::new(
            registration,
            self.dialer.clone(),
            self.client_options.clone(),
        ));
        client.connect().await?;
        self.clients.add(client.clone()).await;
        info!(
            service_id = %client.service_id(),
            service = %client.service_name(),
            address = %client.registration().dial_url(),
            "connected to backend"
        );

        tokio::spawn(read_loop(client.clone(), self.clients.clone(), self.inbound.clone()));
        Ok(client)
    }

    /// Connect to every healthy instance of `service`. Failures are logged.
    pub async fn connect_all(self: &Arc<Self>, service: &str) -> FabricResult<usize> {
        let services = self.naming.find(service, &[]).await?;
        let mut connected = 0;
        for reg in services {
            let id = reg.id.clone();
            match self.connect(reg).await {
                Ok(_) => connected += 1,
                Err(e) => warn!(service_id = %id, error = %e, "connect failed"),
            }
        }
        Ok(connected)
    }

    /// Subscribe to membership changes of `service`, connecting new instances.
    pub async fn watch(self: &Arc<Self>, service: &str) -> FabricResult<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let callback: WatchCallback = Arc::new(move |services: Vec<ServiceRegistration>| {
            let Some(dispatcher) = weak.upgrade() else { return };
            tokio::spawn(async move { dispatcher.sync(services).await });
        });
        self.naming.subscribe(service, callback).await
    }

    async fn sync(self: Arc<Self>, services: Vec<ServiceRegistration>) {
        for reg in services {
            if let Some(c) = self.clients.get(&reg.id).await {
                if !c.is_closed() {
                    continue;
                }
            }
            let id = reg.id.clone();
            if let Err(e) = self.connect(reg).await {
                warn!(service_id = %id, error = %e, "connect to new instance failed");
            }
        }
    }

    pub async fn close_all(&self) {
        for client in self.clients.drain().await {
            client.close().await;
        }
    }
}

async fn read_loop(client: Arc<Client>, clients: Arc<ClientMap>, inbound: mpsc::Sender<LogicPkt>) {
    loop {
        let frame = match client.read().await {
            Ok(frame) => frame,
            Err(e) => {
                if e.is_disconnect() {
                    debug!(service_id = %client.service_id(), reason = %e, "backend read ended");
                } else {
                    warn!(service_id = %client.service_id(), error = %e, "backend read failed");
                }
                break;
            }
        };
        if !matches!(frame.op, OpCode::Binary | OpCode::Text) {
            continue;
        }
        match Packet::decode_logic(&frame.payload) {
            Ok(pkt) => {
                if inbound.send(pkt).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(service_id = %client.service_id(), error = %e, "dropping undecodable packet"),
        }
    }
    clients.remove_if_same(&client).await;
    client.close().await;
}
