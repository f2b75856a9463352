//! WebSocket SDK for end-user applications.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use fabric_core::error::{FabricError, FabricResult};
use fabric_core::messages::{LoginReq, LoginResp};
use fabric_core::packet::{HeartbeatPkt, LogicPkt, Packet, Status};
use fabric_core::wire;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A client connection to a WebSocket gateway.
pub struct WsClient {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
}

impl WsClient {
    /// Open the WebSocket without logging in.
    pub async fn connect(url: &str) -> FabricResult<Self> {
        let (ws, _) = connect_async(url).await.map_err(FabricError::from)?;
        let (sink, stream) = ws.split();
        Ok(Self { sink, stream })
    }

    /// Connect and sign in with `token`. Returns the client and the channel
    /// id the gateway assigned.
    pub async fn login(url: &str, token: &str, device: Option<&str>) -> FabricResult<(Self, String)> {
        let mut client = Self::connect(url).await?;
        let mut req = LogicPkt::new(wire::COMMAND_LOGIN_SIGN_IN);
        req.write_body(&LoginReq {
            token: token.to_string(),
            device: device.map(str::to_string),
        })?;
        client.send_logic(&req).await?;

        loop {
            let Packet::Logic(resp) = client.recv().await? else {
                continue;
            };
            if resp.header.command != wire::COMMAND_LOGIN_SIGN_IN {
                continue;
            }
            if resp.header.status != Status::Success {
                return Err(FabricError::AuthFailed(format!("login rejected: {:?}", resp.header.status)));
            }
            let body: LoginResp = resp.read_body()?;
            debug!(channel_id = %body.channel_id, "logged in");
            return Ok((client, body.channel_id));
        }
    }

    pub async fn send(&mut self, packet: &Packet) -> FabricResult<()> {
        let bytes = packet.encode()?;
        self.sink.send(Message::Binary(bytes)).await.map_err(FabricError::from)
    }

    pub async fn send_logic(&mut self, pkt: &LogicPkt) -> FabricResult<()> {
        let bytes = pkt.encode()?;
        self.sink.send(Message::Binary(bytes)).await.map_err(FabricError::from)
    }

    /// Send a heartbeat ping packet.
    pub async fn ping(&mut self) -> FabricResult<()> {
        self.send(&HeartbeatPkt::ping().into()).await
    }

    /// Receive the next packet. WebSocket-level ping/pong frames are skipped;
    /// a close frame or end of stream is [`FabricError::RemoteClosed`].
    pub async fn recv(&mut self) -> FabricResult<Packet> {
        loop {
            let msg = match self.stream.next().await {
                Some(msg) => msg.map_err(FabricError::from)?,
                None => return Err(FabricError::RemoteClosed),
            };
            match msg {
                Message::Binary(data) => return Packet::decode(&data),
                Message::Text(text) => return Packet::decode(text.as_bytes()),
                Message::Close(_) => return Err(FabricError::RemoteClosed),
                _ => continue,
            }
        }
    }

    pub async fn close(mut self) -> FabricResult<()> {
        self.sink.close().await.map_err(FabricError::from)
    }
}
