//! Where a user's live socket resides, and the identity bound to it.

use serde::{Deserialize, Serialize};

use crate::codec::{self, ByteReader};
use crate::error::FabricResult;

/// The `(channel, gateway)` pair currently serving an account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Location {
    pub channel_id: String,
    pub gate_id: String,
}

impl Location {
    pub fn new(channel_id: impl Into<String>, gate_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            gate_id: gate_id.into(),
        }
    }

    /// `channel_id:str16 | gate_id:str16`
    pub fn to_bytes(&self) -> FabricResult<Vec<u8>> {
        let mut out = Vec::with_capacity(4 + self.channel_id.len() + self.gate_id.len());
        codec::write_str16(&mut out, &self.channel_id)?;
        codec::write_str16(&mut out, &self.gate_id)?;
        Ok(out)
    }

    pub fn from_bytes(data: &[u8]) -> FabricResult<Self> {
        let mut r = ByteReader::new(data);
        let channel_id = r.read_str16()?;
        let gate_id = r.read_str16()?;
        Ok(Self {
            channel_id,
            gate_id,
        })
    }
}

/// Authenticated identity bound to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Session {
    pub channel_id: String,
    pub gate_id: String,
    pub account: String,
    #[serde(default)]
    pub remote_ip: String,
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub isp: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Session {
    pub fn location(&self) -> Location {
        Location::new(&self.channel_id, &self.gate_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_bytes_round_trip() {
        let loc = Location::new("gw1_acct1_3", "gw1");
        let bytes = loc.to_bytes().unwrap();
        assert_eq!(&bytes[..2], &[0, 11]);
        assert_eq!(Location::from_bytes(&bytes).unwrap(), loc);
    }

    #[test]
    fn truncated_location_rejected() {
        let bytes = Location::new("ch", "gw").to_bytes().unwrap();
        assert!(Location::from_bytes(&bytes[..3]).is_err());
    }

    #[test]
    fn session_json_tolerates_missing_optional_fields() {
        let s: Session =
            serde_json::from_str(r#"{"channel_id":"c","gate_id":"g","account":"a"}"#).unwrap();
        assert_eq!(s.location(), Location::new("c", "g"));
        assert!(s.tags.is_empty());
    }
}
