//! Command routing inside a logic service.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use fabric_core::packet::Status;

use super::context::Context;

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: &Context);
}

#[derive(Default)]
pub struct Router {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `command`, replacing any earlier one.
    pub fn handle(&mut self, command: impl Into<String>, handler: Arc<dyn CommandHandler>) -> &mut Self {
        self.handlers.insert(command.into(), handler);
        self
    }

    pub fn commands(&self) -> Vec<&str> {
        let mut commands: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        commands.sort_unstable();
        commands
    }

    /// Run the handler for the request's command. Unknown commands are
    /// answered with `NotImplemented`.
    pub async fn serve(&self, ctx: &Context) {
        let command = ctx.header().command.as_str();
        match self.handlers.get(command) {
            Some(handler) => {
                debug!(command, channel_id = %ctx.header().channel_id, "serve");
                handler.handle(ctx).await;
            }
            None => {
                warn!(command, "no handler for command");
                if let Err(e) = ctx
                    .resp_with_error(Status::NotImplemented, format!("command {command} is not implemented"))
                    .await
                {
                    warn!(command, error = %e, "response failed");
                }
            }
        }
    }
}
