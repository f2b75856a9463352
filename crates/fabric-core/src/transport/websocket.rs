//! Server side of the WebSocket transport.
//!
//! The upgrade and framing are tokio-tungstenite's; this module maps its
//! messages onto [`Frame`]s and splits the stream into the same
//! reader/writer halves as TCP.

use std::borrow::Cow;
use std::net::SocketAddr;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use super::{Conn, FrameReader, FrameWriter, DEFAULT_MAX_FRAME_SIZE};
use crate::error::{FabricError, FabricResult};
use crate::frame::{Frame, OpCode};
use crate::wire::Protocol;

/// Paths a client may upgrade on.
pub const UPGRADE_PATHS: [&str; 2] = ["/", "/im"];

type WsStream = WebSocketStream<TcpStream>;

pub struct WsFrameReader {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameReader for WsFrameReader {
    async fn read_frame(&mut self) -> FabricResult<Frame> {
        loop {
            let msg = match self.inner.next().await {
                Some(msg) => msg?,
                None => return Err(FabricError::RemoteClosed),
            };
            let frame = match msg {
                Message::Binary(data) => Frame::binary(data),
                Message::Text(text) => Frame::new(OpCode::Text, text.into_bytes()),
                Message::Ping(data) => Frame::new(OpCode::Ping, data),
                Message::Pong(data) => Frame::new(OpCode::Pong, data),
                Message::Close(close) => Frame::new(OpCode::Close, close_payload(close)),
                Message::Frame(_) => continue,
            };
            return Ok(frame);
        }
    }
}

pub struct WsFrameWriter {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameWriter for WsFrameWriter {
    async fn write_frame(&mut self, op: OpCode, payload: &[u8]) -> FabricResult<()> {
        let msg = match op {
            OpCode::Binary => Message::Binary(payload.to_vec()),
            OpCode::Text => Message::Text(
                String::from_utf8(payload.to_vec()).map_err(|e| FabricError::InvalidMessage(e.to_string()))?,
            ),
            OpCode::Ping => Message::Ping(payload.to_vec()),
            // tungstenite already queued the pong for the ping it read
            OpCode::Pong => return Ok(()),
            OpCode::Close => Message::Close(close_frame(payload)),
            OpCode::Continuation => {
                return Err(FabricError::InvalidMessage("cannot send a bare continuation frame".into()))
            }
        };
        self.inner.feed(msg).await?;
        Ok(())
    }

    async fn flush(&mut self) -> FabricResult<()> {
        self.inner.flush().await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> FabricResult<()> {
        match self.inner.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// `status:u16 | reason` on the wire, as the TCP transport carries it.
fn close_payload(close: Option<CloseFrame<'static>>) -> Vec<u8> {
    let Some(close) = close else {
        return Vec::new();
    };
    let mut payload = u16::from(close.code).to_be_bytes().to_vec();
    payload.extend_from_slice(close.reason.as_bytes());
    payload
}

fn close_frame(payload: &[u8]) -> Option<CloseFrame<'static>> {
    if payload.len() < 2 {
        return None;
    }
    Some(CloseFrame {
        code: CloseCode::from(u16::from_be_bytes([payload[0], payload[1]])),
        reason: Cow::Owned(String::from_utf8_lossy(&payload[2..]).into_owned()),
    })
}

/// Perform the server side of the HTTP upgrade on an accepted stream.
///
/// Unknown paths are answered with a 404 and fail the upgrade.
pub async fn accept(stream: TcpStream, remote_addr: SocketAddr) -> FabricResult<Conn> {
    accept_with_limit(stream, remote_addr, DEFAULT_MAX_FRAME_SIZE).await
}

pub async fn accept_with_limit(
    stream: TcpStream,
    remote_addr: SocketAddr,
    max_frame_size: usize,
) -> FabricResult<Conn> {
    let _ = stream.set_nodelay(true);
    let mut config = WebSocketConfig::default();
    config.max_frame_size = Some(max_frame_size);
    config.max_message_size = Some(max_frame_size);

    let check_path = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if UPGRADE_PATHS.contains(&req.uri().path()) {
            return Ok(resp);
        }
        debug!(path = %req.uri().path(), remote = %remote_addr, "upgrade on unknown path");
        let mut not_found = ErrorResponse::new(None);
        *not_found.status_mut() = StatusCode::NOT_FOUND;
        Err(not_found)
    };
    let ws = tokio_tungstenite::accept_hdr_async_with_config(stream, check_path, Some(config)).await?;
    let (sink, stream) = ws.split();

    Ok(Conn::new(
        Box::new(WsFrameReader { inner: stream }),
        Box::new(WsFrameWriter { inner: sink }),
        remote_addr,
        Protocol::Websocket,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    type Client = WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

    /// Accept one connection on a fresh listener and connect a tungstenite
    /// client to `path`.
    async fn pair(path: &str, max_frame_size: usize) -> (FabricResult<Conn>, Option<Client>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, remote) = listener.accept().await.unwrap();
            accept_with_limit(stream, remote, max_frame_size).await
        });
        let client = tokio_tungstenite::connect_async(format!("ws://{addr}{path}"))
            .await
            .ok()
            .map(|(ws, _)| ws);
        (server.await.unwrap(), client)
    }

    async fn next(client: &mut Client) -> Message {
        tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn tungstenite_client_round_trip() {
        let (conn, client) = pair("/im", DEFAULT_MAX_FRAME_SIZE).await;
        let (mut conn, mut ws) = (conn.unwrap(), client.unwrap());
        assert_eq!(conn.protocol(), Protocol::Websocket);

        ws.send(Message::Binary(b"ping me".to_vec())).await.unwrap();
        let frame = conn.read_frame().await.unwrap();
        assert_eq!(frame, Frame::binary(b"ping me".to_vec()));
        conn.send(&frame.payload).await.unwrap();
        assert_eq!(next(&mut ws).await, Message::Binary(b"ping me".to_vec()));

        conn.close().await.unwrap();
        assert!(matches!(next(&mut ws).await, Message::Close(_)));
    }

    #[tokio::test]
    async fn text_and_close_map_to_frames() {
        let (conn, client) = pair("/", DEFAULT_MAX_FRAME_SIZE).await;
        let (mut conn, mut ws) = (conn.unwrap(), client.unwrap());

        ws.send(Message::Text("hi".into())).await.unwrap();
        assert_eq!(conn.read_frame().await.unwrap(), Frame::new(OpCode::Text, b"hi".to_vec()));

        ws.send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        })))
        .await
        .unwrap();
        let close = conn.read_frame().await.unwrap();
        assert_eq!(close.op, OpCode::Close);
        assert_eq!(close.payload, [&1000u16.to_be_bytes()[..], b"bye"].concat());
    }

    #[tokio::test]
    async fn ping_is_answered_once() {
        let (conn, client) = pair("/", DEFAULT_MAX_FRAME_SIZE).await;
        let (mut conn, mut ws) = (conn.unwrap(), client.unwrap());

        ws.send(Message::Ping(b"hb".to_vec())).await.unwrap();
        let ping = conn.read_frame().await.unwrap();
        assert_eq!(ping, Frame::new(OpCode::Ping, b"hb".to_vec()));
        // what a channel does with a ping; the pong must not be doubled
        conn.write_frame(OpCode::Pong, &ping.payload).await.unwrap();
        conn.send(b"after").await.unwrap();

        // collect everything until the connection goes quiet
        let mut seen = Vec::new();
        while let Ok(Some(msg)) = tokio::time::timeout(Duration::from_millis(200), ws.next()).await {
            seen.push(msg.unwrap());
        }
        let pongs = seen.iter().filter(|m| matches!(m, Message::Pong(data) if data == b"hb")).count();
        assert_eq!(pongs, 1, "{seen:?}");
        assert!(seen.contains(&Message::Binary(b"after".to_vec())));
    }

    #[tokio::test]
    async fn close_payload_carries_status() {
        let (conn, client) = pair("/", DEFAULT_MAX_FRAME_SIZE).await;
        let (mut conn, mut ws) = (conn.unwrap(), client.unwrap());
        let mut payload = 1008u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"go away");
        conn.write_frame(OpCode::Close, &payload).await.unwrap();
        conn.flush().await.unwrap();

        match next(&mut ws).await {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Policy);
                assert_eq!(frame.reason, "go away");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_message_rejected() {
        let (conn, client) = pair("/", 16).await;
        let (mut conn, mut ws) = (conn.unwrap(), client.unwrap());
        ws.send(Message::Binary(vec![7u8; 64])).await.unwrap();
        assert!(matches!(conn.read_frame().await, Err(FabricError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn peer_going_away_is_remote_closed() {
        let (conn, client) = pair("/", DEFAULT_MAX_FRAME_SIZE).await;
        let mut conn = conn.unwrap();
        drop(client);
        let err = conn.read_frame().await.unwrap_err();
        assert!(err.is_disconnect(), "{err}");
    }

    #[tokio::test]
    async fn unknown_path_gets_404() {
        let (conn, client) = pair("/nope", DEFAULT_MAX_FRAME_SIZE).await;
        assert!(client.is_none());
        assert!(conn.is_err());
    }
}
