//! Binary encoding primitives
//!
//! Everything on the wire is built from unsigned LEB128 varints and
//! length-prefixed byte strings.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut};

/// Types with a binary wire representation
pub trait Encode {
    fn encode<B: BufMut>(&self, buf: &mut B);

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

/// Types that can be read back from their wire representation
pub trait Decode: Sized {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;

    /// Decode a value that must span the whole slice
    fn decode_from_slice(data: &[u8]) -> Result<Self> {
        let mut buf = data;
        let value = Self::decode(&mut buf)?;
        if buf.has_remaining() {
            return Err(Error::Decode(format!(
                "{} trailing bytes after value",
                buf.remaining()
            )));
        }
        Ok(value)
    }
}

pub fn write_var_u64<B: BufMut>(buf: &mut B, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

pub fn read_var_u64<B: Buf>(buf: &mut B) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;

    loop {
        let byte = read_u8(buf)?;
        if shift == 63 && byte > 1 {
            return Err(Error::Decode("varint overflows u64".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Read a varint that is used as a length or count
pub fn read_var_len<B: Buf>(buf: &mut B) -> Result<usize> {
    let len = read_var_u64(buf)?;
    let len = usize::try_from(len).map_err(|_| Error::Decode(format!("length {} too large", len)))?;
    // Every element takes at least one byte, so a count larger than the
    // remaining input can never be satisfied.
    if len > buf.remaining() {
        return Err(Error::Decode(format!(
            "length {} exceeds remaining {} bytes",
            len,
            buf.remaining()
        )));
    }
    Ok(len)
}

pub fn read_u8<B: Buf>(buf: &mut B) -> Result<u8> {
    if !buf.has_remaining() {
        return Err(Error::Decode("unexpected end of input".into()));
    }
    Ok(buf.get_u8())
}

pub fn write_var_bytes<B: BufMut>(buf: &mut B, bytes: &[u8]) {
    write_var_u64(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

pub fn read_var_bytes<B: Buf>(buf: &mut B) -> Result<Vec<u8>> {
    let len = read_var_len(buf)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub fn write_var_string<B: BufMut>(buf: &mut B, value: &str) {
    write_var_bytes(buf, value.as_bytes());
}

pub fn read_var_string<B: Buf>(buf: &mut B) -> Result<String> {
    let bytes = read_var_bytes(buf)?;
    String::from_utf8(bytes).map_err(|e| Error::Decode(format!("invalid UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_var_u64(&mut buf, value);
            let mut slice = buf.as_slice();
            assert_eq!(read_var_u64(&mut slice).unwrap(), value);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn test_varint_single_byte_below_128() {
        let mut buf = Vec::new();
        write_var_u64(&mut buf, 127);
        assert_eq!(buf, vec![0x7f]);
    }

    #[test]
    fn test_truncated_varint() {
        let mut slice: &[u8] = &[0x80, 0x80];
        assert!(matches!(read_var_u64(&mut slice), Err(Error::Decode(_))));
    }

    #[test]
    fn test_overflowing_varint() {
        let mut data = vec![0xff; 9];
        data.push(0x02);
        let mut slice = data.as_slice();
        assert!(read_var_u64(&mut slice).is_err());
    }

    #[test]
    fn test_string_length_past_end() {
        let mut buf = Vec::new();
        write_var_u64(&mut buf, 10);
        buf.extend_from_slice(b"abc");
        let mut slice = buf.as_slice();
        assert!(read_var_string(&mut slice).is_err());
    }

    #[test]
    fn test_invalid_utf8() {
        let mut buf = Vec::new();
        write_var_bytes(&mut buf, &[0xff, 0xfe]);
        let mut slice = buf.as_slice();
        assert!(read_var_string(&mut slice).is_err());
    }
}
