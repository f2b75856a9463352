//! Typed packets and their binary encoding.
//!
//! Every packet starts with a 4-byte magic selecting its kind:
//!
//! ```text
//! heartbeat: magic | code:u16 | length:u16 | body
//! logic:     magic | command:str16 | channel_id:str16 | sequence:u32 | status:u16
//!                  | dest:str16 | flag:u8 | meta_count:u16 | (key:str16 value:str16)*
//!                  | body:bytes32
//! ```

use std::collections::BTreeMap;

use crate::codec::{self, ByteReader};
use crate::error::{FabricError, FabricResult};
use crate::wire::{self, Magic, MAGIC_HEARTBEAT_PKT, MAGIC_LOGIC_PKT};

/// Outcome code carried by response packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u16)]
pub enum Status {
    #[default]
    Success = 0,
    NoDestination = 100,
    InvalidPacketBody = 101,
    InvalidCommand = 103,
    Unauthorized = 105,
    SystemException = 300,
    NotImplemented = 301,
    SessionNotFound = 404,
}

impl TryFrom<u16> for Status {
    type Error = FabricError;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => Status::Success,
            100 => Status::NoDestination,
            101 => Status::InvalidPacketBody,
            103 => Status::InvalidCommand,
            105 => Status::Unauthorized,
            300 => Status::SystemException,
            301 => Status::NotImplemented,
            404 => Status::SessionNotFound,
            other => return Err(FabricError::Codec(format!("unknown status: {other}"))),
        })
    }
}

/// Direction of a logic packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Flag {
    #[default]
    Request = 0,
    Response = 1,
    Push = 2,
}

impl TryFrom<u8> for Flag {
    type Error = FabricError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Flag::Request),
            1 => Ok(Flag::Response),
            2 => Ok(Flag::Push),
            other => Err(FabricError::Codec(format!("unknown flag: {other}"))),
        }
    }
}

/// Routing header of a [`LogicPkt`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    /// `service.action`; the prefix selects the backend service.
    pub command: String,
    /// Gateway-local channel of the client this packet came from (or answers).
    pub channel_id: String,
    pub sequence: u32,
    pub status: Status,
    /// Addressee account or group; empty on server-originated pushes.
    pub dest: String,
    pub flag: Flag,
    pub meta: BTreeMap<String, String>,
}

impl Header {
    /// Name of the backend service that handles this command.
    pub fn service_name(&self) -> &str {
        self.command.split('.').next().unwrap_or_default()
    }
}

/// Application packet routed between gateways and logic services.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogicPkt {
    pub header: Header,
    pub body: Vec<u8>,
}

impl LogicPkt {
    /// New request packet with a fresh sequence number.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            header: Header {
                command: command.into(),
                sequence: wire::SEQ.next(),
                ..Default::default()
            },
            body: Vec::new(),
        }
    }

    /// Packet that answers or mirrors `header`: same command, channel,
    /// sequence and dest, no meta, empty body.
    pub fn from_header(header: &Header) -> Self {
        Self {
            header: Header {
                command: header.command.clone(),
                channel_id: header.channel_id.clone(),
                sequence: header.sequence,
                status: header.status,
                dest: header.dest.clone(),
                flag: header.flag,
                meta: BTreeMap::new(),
            },
            body: Vec::new(),
        }
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.header.channel_id = channel_id.into();
        self
    }

    pub fn with_dest(mut self, dest: impl Into<String>) -> Self {
        self.header.dest = dest.into();
        self
    }

    pub fn service_name(&self) -> &str {
        self.header.service_name()
    }

    pub fn add_meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.header.meta.insert(key.into(), value.into());
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.header.meta.get(key).map(String::as_str)
    }

    pub fn remove_meta(&mut self, key: &str) -> Option<String> {
        self.header.meta.remove(key)
    }

    /// Replace the body with the CBOR encoding of `value`.
    pub fn write_body<T: serde::Serialize>(&mut self, value: &T) -> FabricResult<()> {
        self.body = codec::cbor_encode(value)?;
        Ok(())
    }

    pub fn read_body<T: serde::de::DeserializeOwned>(&self) -> FabricResult<T> {
        codec::cbor_decode(&self.body)
    }

    /// Encode with the logic magic prepended.
    pub fn encode(&self) -> FabricResult<Vec<u8>> {
        let h = &self.header;
        let mut out = Vec::with_capacity(32 + h.command.len() + self.body.len());
        out.extend_from_slice(&MAGIC_LOGIC_PKT);
        codec::write_str16(&mut out, &h.command)?;
        codec::write_str16(&mut out, &h.channel_id)?;
        codec::write_u32(&mut out, h.sequence);
        codec::write_u16(&mut out, h.status as u16);
        codec::write_str16(&mut out, &h.dest)?;
        codec::write_u8(&mut out, h.flag as u8);
        let meta_count = u16::try_from(h.meta.len())
            .map_err(|_| FabricError::Codec("too many meta entries".into()))?;
        codec::write_u16(&mut out, meta_count);
        for (k, v) in &h.meta {
            codec::write_str16(&mut out, k)?;
            codec::write_str16(&mut out, v)?;
        }
        codec::write_bytes32(&mut out, &self.body)?;
        Ok(out)
    }

    fn decode_from(r: &mut ByteReader<'_>) -> FabricResult<Self> {
        let command = r.read_str16()?;
        let channel_id = r.read_str16()?;
        let sequence = r.read_u32()?;
        let status = Status::try_from(r.read_u16()?)?;
        let dest = r.read_str16()?;
        let flag = Flag::try_from(r.read_u8()?)?;
        let meta_count = r.read_u16()?;
        let mut meta = BTreeMap::new();
        for _ in 0..meta_count {
            let k = r.read_str16()?;
            let v = r.read_str16()?;
            meta.insert(k, v);
        }
        let body = r.read_bytes32()?.to_vec();
        Ok(Self {
            header: Header {
                command,
                channel_id,
                sequence,
                status,
                dest,
                flag,
                meta,
            },
            body,
        })
    }
}

/// Heartbeat code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum HeartbeatCode {
    Ping = 1,
    Pong = 2,
}

impl TryFrom<u16> for HeartbeatCode {
    type Error = FabricError;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(HeartbeatCode::Ping),
            2 => Ok(HeartbeatCode::Pong),
            other => Err(FabricError::Codec(format!("unknown heartbeat code: {other}"))),
        }
    }
}

/// Client ↔ gateway keepalive packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatPkt {
    pub code: HeartbeatCode,
    pub body: Vec<u8>,
}

impl HeartbeatPkt {
    pub fn ping() -> Self {
        Self {
            code: HeartbeatCode::Ping,
            body: Vec::new(),
        }
    }

    pub fn pong() -> Self {
        Self {
            code: HeartbeatCode::Pong,
            body: Vec::new(),
        }
    }

    /// Body length as carried on the wire.
    pub fn length(&self) -> usize {
        self.body.len()
    }

    /// Encode with the heartbeat magic prepended.
    pub fn encode(&self) -> FabricResult<Vec<u8>> {
        let mut out = Vec::with_capacity(8 + self.body.len());
        out.extend_from_slice(&MAGIC_HEARTBEAT_PKT);
        codec::write_u16(&mut out, self.code as u16);
        codec::write_bytes16(&mut out, &self.body)?;
        Ok(out)
    }

    fn decode_from(r: &mut ByteReader<'_>) -> FabricResult<Self> {
        let code = HeartbeatCode::try_from(r.read_u16()?)?;
        let body = r.read_bytes16()?.to_vec();
        Ok(Self { code, body })
    }
}

/// A decoded packet of either kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Heartbeat(HeartbeatPkt),
    Logic(LogicPkt),
}

impl Packet {
    /// Decode a packet by switching on its magic prefix.
    pub fn decode(data: &[u8]) -> FabricResult<Self> {
        let mut r = ByteReader::new(data);
        let magic: Magic = r.read_array()?;
        match magic {
            MAGIC_HEARTBEAT_PKT => Ok(Packet::Heartbeat(HeartbeatPkt::decode_from(&mut r)?)),
            MAGIC_LOGIC_PKT => Ok(Packet::Logic(LogicPkt::decode_from(&mut r)?)),
            other => Err(FabricError::BadMagic(other)),
        }
    }

    pub fn encode(&self) -> FabricResult<Vec<u8>> {
        match self {
            Packet::Heartbeat(p) => p.encode(),
            Packet::Logic(p) => p.encode(),
        }
    }

    /// Decode, requiring a logic packet.
    pub fn decode_logic(data: &[u8]) -> FabricResult<LogicPkt> {
        match Self::decode(data)? {
            Packet::Logic(p) => Ok(p),
            Packet::Heartbeat(_) => Err(FabricError::InvalidMessage(
                "expected a logic packet, got a heartbeat".into(),
            )),
        }
    }
}

impl From<LogicPkt> for Packet {
    fn from(p: LogicPkt) -> Self {
        Packet::Logic(p)
    }
}

impl From<HeartbeatPkt> for Packet {
    fn from(p: HeartbeatPkt) -> Self {
        Packet::Heartbeat(p)
    }
}
