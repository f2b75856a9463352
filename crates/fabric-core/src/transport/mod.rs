//! Frame-level duplex connections.
//!
//! Both TCP and WebSocket adapters expose the same small contract, split into
//! a read half and a write half so a channel can read on one task while its
//! flush task writes on another.

pub mod tcp;
pub mod websocket;

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::FabricResult;
use crate::frame::{Frame, OpCode};
use crate::wire::Protocol;

/// Largest frame payload accepted by default (4 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Read half of a connection.
#[async_trait]
pub trait FrameReader: Send {
    /// Read the next complete frame. A close frame is returned as a frame,
    /// not as an error, so callers can tell an orderly close from a fault.
    async fn read_frame(&mut self) -> FabricResult<Frame>;
}

/// Write half of a connection. Writes may be buffered until [`flush`].
///
/// [`flush`]: FrameWriter::flush
#[async_trait]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, op: OpCode, payload: &[u8]) -> FabricResult<()>;

    async fn flush(&mut self) -> FabricResult<()>;

    /// Flush pending data and close the write side of the socket.
    async fn shutdown(&mut self) -> FabricResult<()>;
}

/// A duplex connection over one transport.
pub struct Conn {
    reader: Box<dyn FrameReader>,
    writer: Box<dyn FrameWriter>,
    remote_addr: SocketAddr,
    protocol: Protocol,
}

impl Conn {
    pub fn new(
        reader: Box<dyn FrameReader>,
        writer: Box<dyn FrameWriter>,
        remote_addr: SocketAddr,
        protocol: Protocol,
    ) -> Self {
        Self {
            reader,
            writer,
            remote_addr,
            protocol,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub async fn read_frame(&mut self) -> FabricResult<Frame> {
        self.reader.read_frame().await
    }

    pub async fn write_frame(&mut self, op: OpCode, payload: &[u8]) -> FabricResult<()> {
        self.writer.write_frame(op, payload).await
    }

    pub async fn flush(&mut self) -> FabricResult<()> {
        self.writer.flush().await
    }

    /// Write, then flush, a single binary frame.
    pub async fn send(&mut self, payload: &[u8]) -> FabricResult<()> {
        self.writer.write_frame(OpCode::Binary, payload).await?;
        self.writer.flush().await
    }

    pub async fn close(&mut self) -> FabricResult<()> {
        self.writer.shutdown().await
    }

    pub fn into_parts(self) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("remote_addr", &self.remote_addr)
            .field("protocol", &self.protocol)
            .finish()
    }
}
