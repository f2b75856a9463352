//! Raw TCP framing: `opcode:u8 | length:u32 | payload`, no masking.

use std::io::ErrorKind;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;

use super::{Conn, FrameReader, FrameWriter, DEFAULT_MAX_FRAME_SIZE};
use crate::error::{FabricError, FabricResult};
use crate::frame::{Frame, OpCode};
use crate::wire::Protocol;

pub struct TcpFrameReader<R> {
    inner: BufReader<R>,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin + Send> TcpFrameReader<R> {
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            max_frame_size,
        }
    }

    async fn read(&mut self) -> FabricResult<Frame> {
        let op = match self.inner.read_u8().await {
            Ok(b) => OpCode::try_from(b)?,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(FabricError::RemoteClosed),
            Err(e) => return Err(e.into()),
        };
        let len = self.inner.read_u32().await? as usize;
        if len > self.max_frame_size {
            return Err(FabricError::FrameTooLarge(len));
        }
        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await?;
        Ok(Frame { op, payload })
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameReader for TcpFrameReader<R> {
    async fn read_frame(&mut self) -> FabricResult<Frame> {
        self.read().await
    }
}

pub struct TcpFrameWriter<W> {
    inner: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin + Send> TcpFrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::new(inner),
        }
    }

    async fn write(&mut self, op: OpCode, payload: &[u8]) -> FabricResult<()> {
        let len = u32::try_from(payload.len()).map_err(|_| FabricError::FrameTooLarge(payload.len()))?;
        self.inner.write_u8(op as u8).await?;
        self.inner.write_u32(len).await?;
        self.inner.write_all(payload).await?;
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameWriter for TcpFrameWriter<W> {
    async fn write_frame(&mut self, op: OpCode, payload: &[u8]) -> FabricResult<()> {
        self.write(op, payload).await
    }

    async fn flush(&mut self) -> FabricResult<()> {
        self.inner.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> FabricResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Wrap an accepted or dialed stream.
pub fn from_stream(stream: TcpStream, remote_addr: SocketAddr) -> Conn {
    let _ = stream.set_nodelay(true);
    let (rd, wr) = stream.into_split();
    Conn::new(
        Box::new(TcpFrameReader::new(rd, DEFAULT_MAX_FRAME_SIZE)),
        Box::new(TcpFrameWriter::new(wr)),
        remote_addr,
        Protocol::Tcp,
    )
}

/// Dial `addr` and wrap the stream.
pub async fn connect(addr: &str) -> FabricResult<Conn> {
    let stream = TcpStream::connect(addr).await?;
    let remote = stream.peer_addr()?;
    Ok(from_stream(stream, remote))
}
