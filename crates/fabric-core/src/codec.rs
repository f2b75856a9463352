//! Big-endian field codec and CBOR body helpers.
//!
//! Variable-width fields are length-prefixed: `str16`/`bytes16` carry a
//! 2-byte big-endian length, `bytes32` a 4-byte one.

use crate::error::{FabricError, FabricResult};
use std::io::Cursor;

/// Serialize a value into a CBOR body.
pub fn cbor_encode<T: serde::Serialize>(value: &T) -> FabricResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    Ok(payload)
}

/// Decode a CBOR body into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> FabricResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Cursor over a complete packet buffer.
#[derive(Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_fixed(&mut self, n: usize) -> FabricResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(FabricError::Codec(format!(
                "unexpected end of packet: need {n} bytes, have {}",
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self) -> FabricResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_fixed(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> FabricResult<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> FabricResult<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> FabricResult<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_bytes16(&mut self) -> FabricResult<&'a [u8]> {
        let len = self.read_u16()? as usize;
        self.read_fixed(len)
    }

    pub fn read_bytes32(&mut self) -> FabricResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.read_fixed(len)
    }

    pub fn read_str16(&mut self) -> FabricResult<String> {
        let raw = self.read_bytes16()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| FabricError::Codec(format!("invalid utf-8 string: {e}")))
    }
}

pub fn write_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn write_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Write a 16-bit length-prefixed byte field. Fails if the field exceeds 64 KiB.
pub fn write_bytes16(out: &mut Vec<u8>, data: &[u8]) -> FabricResult<()> {
    let len = u16::try_from(data.len())
        .map_err(|_| FabricError::Codec(format!("field too long: {} bytes", data.len())))?;
    write_u16(out, len);
    out.extend_from_slice(data);
    Ok(())
}

pub fn write_bytes32(out: &mut Vec<u8>, data: &[u8]) -> FabricResult<()> {
    let len = u32::try_from(data.len())
        .map_err(|_| FabricError::Codec(format!("field too long: {} bytes", data.len())))?;
    write_u32(out, len);
    out.extend_from_slice(data);
    Ok(())
}

pub fn write_str16(out: &mut Vec<u8>, s: &str) -> FabricResult<()> {
    write_bytes16(out, s.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestMsg {
        name: String,
        value: i64,
    }

    #[test]
    fn cbor_body_round_trip() {
        let msg = TestMsg {
            name: "hello".into(),
            value: 42,
        };
        let body = cbor_encode(&msg).unwrap();
        let decoded: TestMsg = cbor_decode(&body).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn fields_are_big_endian() {
        let mut out = Vec::new();
        write_u16(&mut out, 0x0102);
        write_u32(&mut out, 0x03040506);
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6]);

        let mut r = ByteReader::new(&out);
        assert_eq!(r.read_u16().unwrap(), 0x0102);
        assert_eq!(r.read_u32().unwrap(), 0x03040506);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn short_read_is_an_error() {
        let mut out = Vec::new();
        write_str16(&mut out, "abcdef").unwrap();
        out.truncate(4);
        let mut r = ByteReader::new(&out);
        assert!(matches!(r.read_str16(), Err(FabricError::Codec(_))));
    }

    #[test]
    fn oversized_short_field_rejected() {
        let mut out = Vec::new();
        let big = vec![0u8; u16::MAX as usize + 1];
        assert!(write_bytes16(&mut out, &big).is_err());
    }
}
