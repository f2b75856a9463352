//! fabric-client: the outbound side of the IM routing fabric.
//!
//! - [`Dialer`] / [`TcpDialer`]: connect to a backend service and perform the
//!   inner handshake carrying the dialing service's id.
//! - [`Client`]: a persistent connection to one backend instance.
//! - [`WsClient`]: a WebSocket SDK for end-user applications.

pub mod client;
pub mod dialer;
pub mod websocket;

pub use client::{Client, ClientOptions};
pub use dialer::{Dialer, DialerContext, TcpDialer};
pub use websocket::WsClient;
