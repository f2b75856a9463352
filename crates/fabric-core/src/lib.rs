//! fabric-core: shared protocol library for the IM routing fabric.
//!
//! Provides the packet codec (heartbeat and logic packets behind a magic
//! prefix), transport frames, split TCP/WebSocket connections, locations and
//! sessions, service registrations, login tokens and CBOR message bodies.

pub mod codec;
pub mod error;
pub mod frame;
pub mod location;
pub mod messages;
pub mod packet;
pub mod registration;
pub mod token;
pub mod transport;
pub mod wire;

// Re-export commonly used items at crate root.
pub use error::{FabricError, FabricResult};
pub use frame::{Frame, OpCode};
pub use location::{Location, Session};
pub use packet::{Flag, Header, HeartbeatCode, HeartbeatPkt, LogicPkt, Packet, Status};
pub use registration::ServiceRegistration;
pub use token::{create_token, generate_secret, parse_token, LoginToken};
pub use transport::{Conn, FrameReader, FrameWriter};
pub use wire::Protocol;
