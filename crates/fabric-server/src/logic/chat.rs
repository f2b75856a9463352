//! `chat.user.talk`: one-to-one messages.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::debug;

use fabric_core::messages::{MessagePush, MessageReq, MessageResp};
use fabric_core::packet::Status;

use super::context::Context;
use super::router::CommandHandler;

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Message ids: microseconds since the epoch, bumped past the last id
/// handed out so they stay unique and increasing within a process.
#[derive(Debug, Default)]
pub struct MessageIds {
    last: AtomicI64,
}

impl MessageIds {
    pub fn next(&self) -> i64 {
        let now = now_nanos() / 1_000;
        let prev = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| Some(now.max(last + 1)))
            .unwrap_or(now);
        now.max(prev + 1)
    }
}

#[derive(Debug, Default)]
pub struct UserTalk {
    ids: MessageIds,
}

#[async_trait]
impl CommandHandler for UserTalk {
    async fn handle(&self, ctx: &Context) {
        let dest = ctx.header().dest.clone();
        if dest.is_empty() {
            let _ = ctx.resp_with_error(Status::NoDestination, "dest is empty").await;
            return;
        }
        let req: MessageReq = match ctx.read_body() {
            Ok(req) => req,
            Err(e) => {
                let _ = ctx.resp_with_error(Status::InvalidPacketBody, e).await;
                return;
            }
        };
        let locations = match ctx.get_locations(std::slice::from_ref(&dest)).await {
            Ok(locations) => locations,
            Err(e) => {
                let _ = ctx.resp_with_error(Status::SystemException, e).await;
                return;
            }
        };

        let message_id = self.ids.next();
        let send_time = now_nanos();
        if locations.is_empty() {
            debug!(dest = %dest, message_id, "recipient offline");
        } else {
            let push = MessagePush {
                message_id,
                sender: ctx.session().account.clone(),
                kind: req.kind,
                body: req.body,
                extra: req.extra,
                send_time,
            };
            if let Err(e) = ctx.dispatch(&push, &locations).await {
                let _ = ctx.resp_with_error(Status::SystemException, e).await;
                return;
            }
        }
        let _ = ctx
            .resp(
                Status::Success,
                &MessageResp {
                    message_id,
                    send_time,
                },
            )
            .await;
    }
}
