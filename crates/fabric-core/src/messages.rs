//! CBOR bodies carried inside logic packets and handshake frames.

use serde::{Deserialize, Serialize};

/// `login.signin` request body sent by an end-user client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginReq {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

/// `login.signin` response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResp {
    pub channel_id: String,
}

/// `login.kickout` push body, sent to a superseded channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KickoutNotify {
    pub channel_id: String,
}

/// `chat.user.talk` request body.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageReq {
    #[serde(rename = "type")]
    pub kind: i32,
    pub body: String,
    #[serde(default)]
    pub extra: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResp {
    pub message_id: i64,
    pub send_time: i64,
}

/// Message pushed to the recipient of a `chat.user.talk`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePush {
    pub message_id: i64,
    pub sender: String,
    #[serde(rename = "type")]
    pub kind: i32,
    pub body: String,
    #[serde(default)]
    pub extra: String,
    pub send_time: i64,
}

/// First frame a gateway writes after dialing a logic service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InnerHandshakeReq {
    pub service_id: String,
}

/// Body attached to error responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResp {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{cbor_decode, cbor_encode};

    #[test]
    fn login_req_without_device() {
        let req = LoginReq {
            token: "abc".into(),
            device: None,
        };
        let bytes = cbor_encode(&req).unwrap();
        let back: LoginReq = cbor_decode(&bytes).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn message_push_uses_type_key() {
        let push = MessagePush {
            message_id: 7,
            sender: "acct2".into(),
            kind: 1,
            body: "hello".into(),
            extra: String::new(),
            send_time: 1,
        };
        let value: ciborium::Value = cbor_decode(&cbor_encode(&push).unwrap()).unwrap();
        let map = value.as_map().unwrap();
        assert!(map.iter().any(|(k, _)| k.as_text() == Some("type")));
    }
}
