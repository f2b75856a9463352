//! fabric-server: gateways and logic services of the IM routing fabric.
//!
//! A gateway terminates end-user connections (WebSocket or TCP), keeps one
//! [`Channel`](channel::Channel) per connection, and forwards logic packets
//! to backend services found through [`Naming`](naming::Naming). Logic
//! services resolve sessions from [`SessionStorage`](storage::SessionStorage)
//! and push results back through the gateways.

pub mod app;
pub mod channel;
pub mod channel_map;
pub mod config;
pub mod container;
pub mod gateway;
pub mod handler;
pub mod logic;
pub mod monitor;
pub mod naming;
pub mod server;
pub mod storage;

pub use channel::Channel;
pub use channel_map::ChannelMap;
pub use container::Container;
pub use server::{Server, ServerOptions};
