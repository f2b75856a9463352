//! Logic services: the backends gateways forward packets to.
//!
//! A [`LogicHandler`] decodes each packet, resolves the sender's session
//! and hands a [`Context`] to the [`Router`], which picks the command
//! handler. Handlers answer through the context; pushes to other users go
//! back through the gateways' own channels.

pub mod chat;
pub mod context;
pub mod login;
pub mod router;
pub mod serv;

use std::sync::Arc;

use fabric_core::error::{FabricError, FabricResult};
use fabric_core::wire;

pub use context::Context;
pub use router::{CommandHandler, Router};
pub use serv::{InnerAcceptor, LogicHandler};

/// Router with the bundled handlers of service `name`.
pub fn service_router(name: &str) -> FabricResult<Router> {
    let mut router = Router::new();
    match name {
        wire::SN_LOGIN => {
            router
                .handle(wire::COMMAND_LOGIN_SIGN_IN, Arc::new(login::SignIn))
                .handle(wire::COMMAND_LOGIN_SIGN_OUT, Arc::new(login::SignOut));
        }
        wire::SN_CHAT => {
            router.handle(wire::COMMAND_CHAT_USER_TALK, Arc::new(chat::UserTalk::default()));
        }
        other => return Err(FabricError::Config(format!("unknown logic service: {other}"))),
    }
    Ok(router)
}
