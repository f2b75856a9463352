//! Persistent connection to one backend service instance.
//!
//! A gateway holds one `Client` per logic-service instance it routes to.
//! Writes from many tasks are serialized behind a mutex; a single read loop
//! (owned by the dispatcher) consumes inbound frames.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use fabric_core::error::{FabricError, FabricResult};
use fabric_core::frame::{Frame, OpCode};
use fabric_core::registration::ServiceRegistration;
use fabric_core::transport::{FrameReader, FrameWriter};
use fabric_core::wire;

use crate::dialer::{Dialer, DialerContext};

const STATE_INIT: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Interval between ping frames; zero disables the heartbeat loop.
    pub heartbeat: Duration,
    pub read_wait: Duration,
    pub write_wait: Duration,
    pub dial_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            heartbeat: wire::DEFAULT_HEARTBEAT,
            read_wait: wire::DEFAULT_READ_WAIT,
            write_wait: wire::DEFAULT_WRITE_WAIT,
            dial_timeout: Duration::from_secs(5),
        }
    }
}

pub struct Client {
    registration: ServiceRegistration,
    dialer: Arc<dyn Dialer>,
    options: ClientOptions,
    reader: Mutex<Option<Box<dyn FrameReader>>>,
    writer: Arc<Mutex<Option<Box<dyn FrameWriter>>>>,
    state: AtomicU8,
    quit: CancellationToken,
}

impl Client {
    pub fn new(registration: ServiceRegistration, dialer: Arc<dyn Dialer>, options: ClientOptions) -> Self {
        Self {
            registration,
            dialer,
            options,
            reader: Mutex::new(None),
            writer: Arc::new(Mutex::new(None)),
            state: AtomicU8::new(STATE_INIT),
            quit: CancellationToken::new(),
        }
    }

    /// Id of the remote service instance.
    pub fn service_id(&self) -> &str {
        &self.registration.id
    }

    pub fn service_name(&self) -> &str {
        &self.registration.name
    }

    pub fn registration(&self) -> &ServiceRegistration {
        &self.registration
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CLOSED
    }

    /// Dial the instance and start the heartbeat loop. Only the first call
    /// connects; later calls fail.
    pub async fn connect(&self) -> FabricResult<()> {
        if self
            .state
            .compare_exchange(STATE_INIT, STATE_CONNECTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(FabricError::Transport(format!(
                "client {} already connected",
                self.registration.id
            )));
        }

        let ctx = DialerContext {
            id: self.registration.id.clone(),
            name: self.registration.name.clone(),
            address: self.registration.dial_url(),
            timeout: self.options.dial_timeout,
        };
        let conn = match self.dialer.dial_and_handshake(ctx).await {
            Ok(conn) => conn,
            Err(e) => {
                self.state.store(STATE_CLOSED, Ordering::Release);
                return Err(e);
            }
        };
        let (reader, writer) = conn.into_parts();
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);

        if !self.options.heartbeat.is_zero() {
            tokio::spawn(heartbeat_loop(
                self.writer.clone(),
                self.options.heartbeat,
                self.options.write_wait,
                self.quit.clone(),
                self.registration.id.clone(),
            ));
        }
        debug!(service_id = %self.registration.id, address = %self.registration.dial_url(), "client connected");
        Ok(())
    }

    /// Write one binary frame and flush it, bounded by the write wait.
    pub async fn send(&self, payload: &[u8]) -> FabricResult<()> {
        if self.is_closed() {
            return Err(FabricError::ChannelClosed);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(FabricError::ChannelClosed)?;
        tokio::time::timeout(self.options.write_wait, async {
            writer.write_frame(OpCode::Binary, payload).await?;
            writer.flush().await
        })
        .await?
    }

    /// Read the next frame. A close frame from the peer is reported as
    /// [`FabricError::RemoteClosed`]; ping and pong frames are returned.
    pub async fn read(&self) -> FabricResult<Frame> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(FabricError::ChannelClosed)?;
        let frame = tokio::select! {
            res = tokio::time::timeout(self.options.read_wait, reader.read_frame()) => res??,
            _ = self.quit.cancelled() => return Err(FabricError::ChannelClosed),
        };
        if frame.op == OpCode::Close {
            return Err(FabricError::RemoteClosed);
        }
        Ok(frame)
    }

    /// Send a close frame and shut the connection down. Idempotent.
    pub async fn close(&self) {
        if self.state.swap(STATE_CLOSED, Ordering::AcqRel) == STATE_CLOSED {
            return;
        }
        self.quit.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.write_frame(OpCode::Close, &[]).await;
            if let Err(e) = writer.shutdown().await {
                debug!(service_id = %self.registration.id, error = %e, "shutdown after close");
            }
        }
    }
}

async fn heartbeat_loop(
    writer: Arc<Mutex<Option<Box<dyn FrameWriter>>>>,
    interval: Duration,
    write_wait: Duration,
    quit: CancellationToken,
    service_id: String,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = quit.cancelled() => return,
        }
        let mut guard = writer.lock().await;
        let Some(w) = guard.as_mut() else { return };
        let res = tokio::time::timeout(write_wait, async {
            w.write_frame(OpCode::Ping, &[]).await?;
            w.flush().await
        })
        .await;
        if let Err(e) = res.map_err(FabricError::from).and_then(|r| r) {
            warn!(service_id = %service_id, error = %e, "heartbeat failed");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::TcpDialer;
    use fabric_core::transport::tcp;
    use fabric_core::wire::Protocol;
    use tokio::net::TcpListener;

    async fn echo_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<Frame>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, remote) = listener.accept().await.unwrap();
            let mut conn = tcp::from_stream(stream, remote);
            let mut seen = Vec::new();
            loop {
                let frame = match conn.read_frame().await {
                    Ok(f) => f,
                    Err(_) => break,
                };
                seen.push(frame.clone());
                match frame.op {
                    OpCode::Close => break,
                    OpCode::Binary if seen.len() > 1 => conn.send(&frame.payload).await.unwrap(),
                    _ => {}
                }
            }
            seen
        });
        (addr, handle)
    }

    fn client_for(addr: std::net::SocketAddr, heartbeat: Duration) -> Client {
        let reg = ServiceRegistration::new("chat-1", "chat", addr.ip().to_string(), addr.port(), Protocol::Tcp);
        Client::new(
            reg,
            Arc::new(TcpDialer::new("gw-1")),
            ClientOptions {
                heartbeat,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn send_read_close() {
        let (addr, server) = echo_server().await;
        let client = client_for(addr, Duration::ZERO);
        client.connect().await.unwrap();
        assert!(client.connect().await.is_err());

        client.send(b"hello").await.unwrap();
        let frame = client.read().await.unwrap();
        assert_eq!(frame.payload, b"hello");

        client.close().await;
        client.close().await;
        assert!(client.is_closed());
        assert!(matches!(client.send(b"x").await, Err(FabricError::ChannelClosed)));

        let seen = server.await.unwrap();
        // handshake, payload, close
        assert_eq!(seen.len(), 3);
        assert_eq!(seen.last().unwrap().op, OpCode::Close);
    }

    #[tokio::test]
    async fn heartbeat_sends_pings() {
        let (addr, server) = echo_server().await;
        let client = client_for(addr, Duration::from_millis(20));
        client.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        client.close().await;

        let seen = server.await.unwrap();
        assert!(seen.iter().any(|f| f.op == OpCode::Ping));
    }

    #[tokio::test]
    async fn remote_close_frame_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, remote) = listener.accept().await.unwrap();
            let mut conn = tcp::from_stream(stream, remote);
            let _handshake = conn.read_frame().await.unwrap();
            conn.write_frame(OpCode::Close, b"bye").await.unwrap();
            conn.flush().await.unwrap();
        });

        let client = client_for(addr, Duration::ZERO);
        client.connect().await.unwrap();
        assert!(matches!(client.read().await, Err(FabricError::RemoteClosed)));
    }
}
