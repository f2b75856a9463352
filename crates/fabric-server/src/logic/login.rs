//! `login.signin` / `login.signout`.

use async_trait::async_trait;
use tracing::{info, warn};

use fabric_core::location::Session;
use fabric_core::messages::{KickoutNotify, LoginResp};
use fabric_core::packet::Status;
use fabric_core::wire;

use super::context::Context;
use super::router::CommandHandler;

/// Binds a new session. An account already online on the same device is
/// told to leave with `login.kickout`, then superseded.
pub struct SignIn;

#[async_trait]
impl CommandHandler for SignIn {
    async fn handle(&self, ctx: &Context) {
        let session: Session = match ctx.read_body() {
            Ok(session) => session,
            Err(e) => {
                let _ = ctx.resp_with_error(Status::InvalidPacketBody, e).await;
                return;
            }
        };

        let old = match ctx.get_location(&session.account, &session.device).await {
            Ok(old) => old,
            Err(e) => {
                let _ = ctx.resp_with_error(Status::SystemException, e).await;
                return;
            }
        };
        if let Some(old) = old.filter(|old| old.channel_id != session.channel_id) {
            info!(
                account = %session.account,
                old_channel = %old.channel_id,
                new_channel = %session.channel_id,
                "kicking out previous login"
            );
            let notify = KickoutNotify {
                channel_id: old.channel_id.clone(),
            };
            if let Err(e) = ctx
                .dispatch_as(wire::COMMAND_LOGIN_KICKOUT, &notify, std::slice::from_ref(&old))
                .await
            {
                warn!(account = %session.account, error = %e, "kickout push failed");
            }
        }

        if let Err(e) = ctx.add(&session).await {
            let _ = ctx.resp_with_error(Status::SystemException, e).await;
            return;
        }
        info!(account = %session.account, channel_id = %session.channel_id, gate_id = %session.gate_id, "signed in");
        let _ = ctx
            .resp(
                Status::Success,
                &LoginResp {
                    channel_id: session.channel_id,
                },
            )
            .await;
    }
}

pub struct SignOut;

#[async_trait]
impl CommandHandler for SignOut {
    async fn handle(&self, ctx: &Context) {
        let session = ctx.session();
        info!(account = %session.account, channel_id = %session.channel_id, "signing out");
        if let Err(e) = ctx.delete(&session.account, &session.channel_id).await {
            let _ = ctx.resp_with_error(Status::SystemException, e).await;
            return;
        }
        let _ = ctx.resp_status(Status::Success).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::context::tests::{fixture_with, session};
    use crate::storage::{MemoryStorage, SessionStorage};
    use fabric_core::location::Location;
    use fabric_core::packet::{Flag, LogicPkt};
    use std::sync::Arc;

    fn signin_pkt(s: &Session) -> LogicPkt {
        let mut pkt = LogicPkt::new(wire::COMMAND_LOGIN_SIGN_IN).with_channel(&s.channel_id);
        pkt.write_body(s).unwrap();
        pkt
    }

    #[tokio::test]
    async fn first_login_stores_session() {
        let storage = Arc::new(MemoryStorage::default());
        let s = session("acct1", "gw-1_acct1_1", "gw-1");
        let mut fx = fixture_with(signin_pkt(&s), s.clone(), storage.clone());
        SignIn.handle(&fx.ctx).await;

        let resp = fx.responses.recv().await.unwrap();
        assert_eq!(resp.header.status, Status::Success);
        assert_eq!(resp.read_body::<LoginResp>().unwrap().channel_id, "gw-1_acct1_1");
        assert!(fx.pushes.try_recv().is_err());

        assert_eq!(storage.get("gw-1_acct1_1").await.unwrap(), Some(s));
        assert_eq!(
            storage.get_location("acct1", "").await.unwrap(),
            Some(Location::new("gw-1_acct1_1", "gw-1"))
        );
    }

    #[tokio::test]
    async fn second_login_kicks_out_first() {
        let storage = Arc::new(MemoryStorage::default());
        let first = session("acct1", "gw-1_acct1_1", "gw-1");
        storage.add(&first).await.unwrap();

        let second = session("acct1", "gw-2_acct1_7", "gw-2");
        let mut fx = fixture_with(signin_pkt(&second), second.clone(), storage.clone());
        SignIn.handle(&fx.ctx).await;

        let (gw, channels, pkt) = fx.pushes.recv().await.unwrap();
        assert_eq!(gw, "gw-1");
        assert_eq!(channels, vec!["gw-1_acct1_1"]);
        assert_eq!(pkt.header.command, wire::COMMAND_LOGIN_KICKOUT);
        assert_eq!(pkt.header.flag, Flag::Push);
        assert_eq!(pkt.read_body::<KickoutNotify>().unwrap().channel_id, "gw-1_acct1_1");

        assert_eq!(fx.responses.recv().await.unwrap().header.status, Status::Success);
        assert_eq!(
            storage.get_location("acct1", "").await.unwrap(),
            Some(Location::new("gw-2_acct1_7", "gw-2"))
        );

        // the superseded channel signing out leaves the new location alone
        let logout = LogicPkt::new(wire::COMMAND_LOGIN_SIGN_OUT).with_channel("gw-1_acct1_1");
        let fx = fixture_with(logout, first, storage.clone());
        SignOut.handle(&fx.ctx).await;
        assert!(storage.get("gw-1_acct1_1").await.unwrap().is_none());
        assert_eq!(
            storage.get_location("acct1", "").await.unwrap(),
            Some(Location::new("gw-2_acct1_7", "gw-2"))
        );
    }

    #[tokio::test]
    async fn bad_session_body_is_rejected() {
        let storage = Arc::new(MemoryStorage::default());
        let s = session("acct1", "gw-1_acct1_1", "gw-1");
        let mut pkt = LogicPkt::new(wire::COMMAND_LOGIN_SIGN_IN).with_channel(&s.channel_id);
        pkt.body = vec![0xff, 0x00];
        let mut fx = fixture_with(pkt, s, storage.clone());
        SignIn.handle(&fx.ctx).await;
        assert_eq!(fx.responses.recv().await.unwrap().header.status, Status::InvalidPacketBody);
        assert!(storage.get("gw-1_acct1_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn signout_removes_session_and_location() {
        let storage = Arc::new(MemoryStorage::default());
        let s = session("acct1", "gw-1_acct1_1", "gw-1");
        storage.add(&s).await.unwrap();

        let logout = LogicPkt::new(wire::COMMAND_LOGIN_SIGN_OUT).with_channel(&s.channel_id);
        let mut fx = fixture_with(logout, s, storage.clone());
        SignOut.handle(&fx.ctx).await;

        assert_eq!(fx.responses.recv().await.unwrap().header.status, Status::Success);
        assert!(storage.get("gw-1_acct1_1").await.unwrap().is_none());
        assert!(storage.get_location("acct1", "").await.unwrap().is_none());
    }
}
