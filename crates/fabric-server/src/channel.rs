//! A managed, authenticated duplex session over one connection.
//!
//! Outbound payloads go through a bounded queue drained by a dedicated flush
//! task, which coalesces whatever is queued into a single flush. The read
//! side enforces the read wait, answers pings, and hands payloads to the
//! listener on their own tasks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use fabric_core::error::{FabricError, FabricResult};
use fabric_core::frame::OpCode;
use fabric_core::transport::{Conn, FrameReader, FrameWriter};
use fabric_core::wire;

use crate::handler::{Agent, MessageListener};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closing,
    Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

struct Shared {
    id: String,
    writer: Mutex<Box<dyn FrameWriter>>,
    read_wait_ms: AtomicU64,
    write_wait_ms: AtomicU64,
    state: AtomicU8,
    closed: CancellationToken,
}

impl Shared {
    fn write_wait(&self) -> Duration {
        Duration::from_millis(self.write_wait_ms.load(Ordering::Relaxed))
    }

    /// Write `first` and everything queued behind it, then flush once.
    async fn write_batch(&self, first: Vec<u8>, rx: &mut mpsc::Receiver<Vec<u8>>) -> FabricResult<()> {
        let mut writer = self.writer.lock().await;
        tokio::time::timeout(self.write_wait(), async {
            writer.write_frame(OpCode::Binary, &first).await?;
            for _ in 0..rx.len() {
                let Ok(payload) = rx.try_recv() else { break };
                writer.write_frame(OpCode::Binary, &payload).await?;
            }
            writer.flush().await
        })
        .await?
    }

    async fn write_control(&self, op: OpCode, payload: &[u8]) -> FabricResult<()> {
        let mut writer = self.writer.lock().await;
        tokio::time::timeout(self.write_wait(), async {
            writer.write_frame(op, payload).await?;
            writer.flush().await
        })
        .await?
    }
}

async fn write_loop(shared: Arc<Shared>, mut rx: mpsc::Receiver<Vec<u8>>) {
    loop {
        let payload = tokio::select! {
            _ = shared.closed.cancelled() => return,
            msg = rx.recv() => match msg {
                Some(payload) => payload,
                None => return,
            },
        };
        if let Err(e) = shared.write_batch(payload, &mut rx).await {
            warn!(channel_id = %shared.id, error = %e, "channel write failed");
            shared.closed.cancel();
            return;
        }
    }
}

pub struct Channel {
    id: String,
    remote_addr: SocketAddr,
    tx: mpsc::Sender<Vec<u8>>,
    reader: Mutex<Option<Box<dyn FrameReader>>>,
    shared: Arc<Shared>,
}

impl Channel {
    /// Take ownership of `conn` and start the flush task.
    pub fn new(id: impl Into<String>, conn: Conn) -> Arc<Self> {
        let id = id.into();
        let remote_addr = conn.remote_addr();
        let (reader, writer) = conn.into_parts();
        let (tx, rx) = mpsc::channel(wire::CHANNEL_QUEUE_CAPACITY);
        let shared = Arc::new(Shared {
            id: id.clone(),
            writer: Mutex::new(writer),
            read_wait_ms: AtomicU64::new(wire::DEFAULT_READ_WAIT.as_millis() as u64),
            write_wait_ms: AtomicU64::new(wire::DEFAULT_WRITE_WAIT.as_millis() as u64),
            state: AtomicU8::new(STATE_OPEN),
            closed: CancellationToken::new(),
        });
        tokio::spawn(write_loop(shared.clone(), rx));
        Arc::new(Self {
            id,
            remote_addr,
            tx,
            reader: Mutex::new(Some(reader)),
            shared,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// A channel whose flush task failed reports `Closing` until
    /// [`close`](Channel::close) finishes the shutdown.
    pub fn state(&self) -> ChannelState {
        match self.shared.state.load(Ordering::Acquire) {
            STATE_OPEN if self.shared.closed.is_cancelled() => ChannelState::Closing,
            STATE_OPEN => ChannelState::Open,
            STATE_CLOSING => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }

    /// Whether the close signal has fired.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Zero keeps the current value.
    pub fn set_read_wait(&self, wait: Duration) {
        if !wait.is_zero() {
            self.shared.read_wait_ms.store(wait.as_millis() as u64, Ordering::Relaxed);
        }
    }

    /// Zero keeps the current value.
    pub fn set_write_wait(&self, wait: Duration) {
        if !wait.is_zero() {
            self.shared.write_wait_ms.store(wait.as_millis() as u64, Ordering::Relaxed);
        }
    }

    pub fn read_wait(&self) -> Duration {
        Duration::from_millis(self.shared.read_wait_ms.load(Ordering::Relaxed))
    }

    pub fn write_wait(&self) -> Duration {
        self.shared.write_wait()
    }

    /// Queue a payload for the flush task. Waits while the queue is full;
    /// fails once the channel is closed.
    pub async fn push(&self, payload: Vec<u8>) -> FabricResult<()> {
        if self.is_closed() {
            return Err(FabricError::ChannelClosed);
        }
        tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => Err(FabricError::ChannelClosed),
            res = self.tx.send(payload) => res.map_err(|_| FabricError::ChannelClosed),
        }
    }

    /// Read frames until the peer closes, the read wait expires, the channel
    /// is closed or the transport fails. Always returns an error describing
    /// why the loop ended. May only run once per channel.
    pub async fn read_loop(self: &Arc<Self>, listener: Arc<dyn MessageListener>) -> FabricError {
        let Some(mut reader) = self.reader.lock().await.take() else {
            return FabricError::Other(format!("read loop already started on {}", self.id));
        };
        loop {
            let frame = tokio::select! {
                _ = self.shared.closed.cancelled() => return FabricError::ChannelClosed,
                res = tokio::time::timeout(self.read_wait(), reader.read_frame()) => match res {
                    Ok(Ok(frame)) => frame,
                    Ok(Err(e)) => return e,
                    Err(_) => return FabricError::Timeout,
                },
            };
            match frame.op {
                OpCode::Close => return FabricError::RemoteClosed,
                OpCode::Ping => {
                    trace!(channel_id = %self.id, "recv ping, send pong");
                    if let Err(e) = self.shared.write_control(OpCode::Pong, &frame.payload).await {
                        return e;
                    }
                }
                OpCode::Text | OpCode::Binary if !frame.payload.is_empty() => {
                    let agent: Arc<dyn Agent> = self.clone();
                    let listener = listener.clone();
                    tokio::spawn(async move { listener.receive(agent, frame.payload).await });
                }
                _ => {}
            }
        }
    }

    /// Fire the close signal and shut the connection down. Only the first
    /// caller does the work; the rest return immediately.
    pub async fn close(&self) -> FabricResult<()> {
        if self
            .shared
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        self.shared.closed.cancel();
        let res = {
            let mut writer = self.shared.writer.lock().await;
            tokio::time::timeout(self.write_wait(), writer.shutdown()).await
        };
        self.shared.state.store(STATE_CLOSED, Ordering::Release);
        debug!(channel_id = %self.id, "channel closed");
        res?
    }
}

#[async_trait]
impl Agent for Channel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn push(&self, payload: Vec<u8>) -> FabricResult<()> {
        Channel::push(self, payload).await
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}
