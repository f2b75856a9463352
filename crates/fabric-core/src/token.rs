//! HMAC login tokens.
//!
//! A token binds an account and app to an expiry time and is signed with the
//! gateway's app secret. Wire form is hex of
//! `[8-byte expiry][account:str16][app:str16][32-byte HMAC-SHA256]`.

use std::time::{SystemTime, UNIX_EPOCH};

use ring::hmac;

use crate::codec::{self, ByteReader};
use crate::error::{FabricError, FabricResult};

const TAG_LEN: usize = 32;

/// Claims carried by a verified login token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginToken {
    pub account: String,
    pub app: String,
    /// Unix seconds after which the token is rejected.
    pub expires_at: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn claims_bytes(expiry: u64, account: &str, app: &str) -> FabricResult<Vec<u8>> {
    let mut data = Vec::with_capacity(12 + account.len() + app.len());
    data.extend_from_slice(&expiry.to_be_bytes());
    codec::write_str16(&mut data, account)?;
    codec::write_str16(&mut data, app)?;
    Ok(data)
}

/// Create a login token valid for `ttl_secs`.
pub fn create_token(secret: &[u8], account: &str, app: &str, ttl_secs: u64) -> FabricResult<String> {
    let expiry = now_secs() + ttl_secs;
    let mut data = claims_bytes(expiry, account, app)?;
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, &data);
    data.extend_from_slice(tag.as_ref());
    Ok(hex::encode(data))
}

/// Verify a login token and return its claims.
///
/// Checks encoding, the HMAC signature and the expiry time.
pub fn parse_token(secret: &[u8], token: &str) -> FabricResult<LoginToken> {
    let raw = hex::decode(token).map_err(|e| FabricError::Token(format!("invalid encoding: {e}")))?;
    if raw.len() <= 8 + 4 + TAG_LEN {
        return Err(FabricError::Token(format!("token too short: {} bytes", raw.len())));
    }
    let (data, tag) = raw.split_at(raw.len() - TAG_LEN);

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, data, tag).map_err(|_| FabricError::Token("invalid token signature".into()))?;

    let mut r = ByteReader::new(data);
    let expires_at = u64::from_be_bytes(r.read_array()?);
    let account = r.read_str16()?;
    let app = r.read_str16()?;
    if r.remaining() != 0 {
        return Err(FabricError::Token("trailing bytes in token".into()));
    }
    if now_secs() > expires_at {
        return Err(FabricError::Token("token expired".into()));
    }
    if account.is_empty() {
        return Err(FabricError::Token("empty account".into()));
    }
    Ok(LoginToken {
        account,
        app,
        expires_at,
    })
}

/// Generate a random 32-byte app secret.
pub fn generate_secret() -> Vec<u8> {
    use rand::RngCore;
    let mut secret = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}
