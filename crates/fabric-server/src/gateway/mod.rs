//! Gateway: terminates end-user connections and routes their packets.
//!
//! - **[`handler`]** authenticates sign-in packets, answers heartbeats and
//!   forwards logic packets to the service named by their command.
//! - **[`rate_limit`]** bounds login attempts per remote IP.
//!
//! Packets coming back from logic services are delivered by the
//! [`Container`](crate::container::Container) to the channels listed in
//! their `dest.channels` meta.

pub mod handler;
pub mod rate_limit;

pub use handler::GatewayHandler;
pub use rate_limit::{LoginRateLimit, RateLimiter};
