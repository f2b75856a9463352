//! Protocol constants shared by gateways, logic services, and clients.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FabricError;

/// 4-byte prefix identifying the packet kind on the wire.
pub type Magic = [u8; 4];

pub const MAGIC_LOGIC_PKT: Magic = [0xc3, 0x11, 0xa3, 0x65];
pub const MAGIC_HEARTBEAT_PKT: Magic = [0xc3, 0x15, 0xa7, 0x65];

pub const COMMAND_LOGIN_SIGN_IN: &str = "login.signin";
pub const COMMAND_LOGIN_SIGN_OUT: &str = "login.signout";
pub const COMMAND_LOGIN_KICKOUT: &str = "login.kickout";
pub const COMMAND_CHAT_USER_TALK: &str = "chat.user.talk";
pub const COMMAND_CHAT_GROUP_TALK: &str = "chat.group.talk";
pub const COMMAND_CHAT_TALK_ACK: &str = "chat.talk.ack";

pub const SN_WS_GATEWAY: &str = "wgateway";
pub const SN_TCP_GATEWAY: &str = "tgateway";
pub const SN_LOGIN: &str = "login";
pub const SN_CHAT: &str = "chat";

/// Comma-joined list of gateway-local channel ids a pushed packet targets.
pub const META_DEST_CHANNELS: &str = "dest.channels";
pub const META_DEST_SERVER: &str = "dest.server";

pub const DEFAULT_READ_WAIT: Duration = Duration::from_secs(180);
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);
pub const DEFAULT_LOGIN_WAIT: Duration = Duration::from_secs(10);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(55);

/// Outbound queue depth of a single channel.
pub const CHANNEL_QUEUE_CAPACITY: usize = 5;

/// Transport protocol of a server or registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    #[serde(alias = "ws")]
    Websocket,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Websocket => "websocket",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "ws" | "websocket" => Ok(Protocol::Websocket),
            other => Err(FabricError::Config(format!("unknown protocol: {other}"))),
        }
    }
}

/// Monotonic sequence source for packet sequences and channel ids.
#[derive(Debug, Default)]
pub struct Sequence(AtomicU32);

impl Sequence {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Next sequence number, starting at 1 and skipping 0 on wrap-around.
    pub fn next(&self) -> u32 {
        loop {
            let n = self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if n != 0 {
                return n;
            }
        }
    }
}

/// Process-wide packet sequence.
pub static SEQ: Sequence = Sequence::new();
