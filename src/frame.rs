//! Wire-level framing primitives shared by the daemon and the client.
//!
//! Every request and reply on the wire is a plain concatenation of these
//! primitives, with no outer framing. Integers travel fixed-width in host
//! byte order (the store assumes all participants share an architecture),
//! byte vectors and keys are length-prefixed with a `u64`, and enumeration
//! tags are a single byte. Reads are full reads: they loop until the
//! requested byte count is satisfied or the peer closes the stream.

use std::io::{Read, Write};

use crate::Result;

/// writes a single tag byte
pub(crate) fn write_u8<W: Write>(writer: &mut W, val: u8) -> Result<()> {
    writer.write_all(&[val])?;
    Ok(())
}

/// reads a single tag byte
pub(crate) fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

/// writes a fixed-width unsigned length in host byte order
pub(crate) fn write_u64<W: Write>(writer: &mut W, val: u64) -> Result<()> {
    writer.write_all(&val.to_ne_bytes())?;
    Ok(())
}

/// reads a fixed-width unsigned length in host byte order
pub(crate) fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_ne_bytes(buf))
}

/// writes a fixed-width signed integer in host byte order
pub(crate) fn write_i64<W: Write>(writer: &mut W, val: i64) -> Result<()> {
    writer.write_all(&val.to_ne_bytes())?;
    Ok(())
}

/// reads a fixed-width signed integer in host byte order
pub(crate) fn read_i64<R: Read>(reader: &mut R) -> Result<i64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(i64::from_ne_bytes(buf))
}

/// writes a length-prefixed byte vector
pub(crate) fn write_bytes<W: Write>(writer: &mut W, data: &[u8]) -> Result<()> {
    write_u64(writer, data.len() as u64)?;
    writer.write_all(data)?;
    Ok(())
}

/// reads a length-prefixed byte vector
pub(crate) fn read_bytes<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let len = read_u64(reader)? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// writes a key; same shape on the wire as a byte vector
pub(crate) fn write_key<W: Write>(writer: &mut W, key: &str) -> Result<()> {
    write_bytes(writer, key.as_bytes())
}

/// reads a key, validating it is UTF-8
pub(crate) fn read_key<R: Read>(reader: &mut R) -> Result<String> {
    let raw = read_bytes(reader)?;
    Ok(String::from_utf8(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreError;
    use std::io::Cursor;

    #[test]
    fn u64_round_trip() {
        let mut buf = Vec::new();
        write_u64(&mut buf, u64::MAX - 7).unwrap();
        assert_eq!(buf.len(), 8);
        assert_eq!(read_u64(&mut Cursor::new(buf)).unwrap(), u64::MAX - 7);
    }

    #[test]
    fn i64_round_trip_negative() {
        let mut buf = Vec::new();
        write_i64(&mut buf, -42).unwrap();
        assert_eq!(read_i64(&mut Cursor::new(buf)).unwrap(), -42);
    }

    #[test]
    fn bytes_round_trip_with_embedded_zeros() {
        let data = vec![0u8, 1, 0, 2, 0];
        let mut buf = Vec::new();
        write_bytes(&mut buf, &data).unwrap();
        assert_eq!(read_bytes(&mut Cursor::new(buf)).unwrap(), data);
    }

    #[test]
    fn empty_bytes_round_trip() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, &[]).unwrap();
        assert_eq!(buf.len(), 8);
        assert!(read_bytes(&mut Cursor::new(buf)).unwrap().is_empty());
    }

    #[test]
    fn key_round_trip() {
        let mut buf = Vec::new();
        write_key(&mut buf, "/workers/rank0").unwrap();
        assert_eq!(read_key(&mut Cursor::new(buf)).unwrap(), "/workers/rank0");
    }

    #[test]
    fn key_rejects_invalid_utf8() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, &[0xff, 0xfe]).unwrap();
        match read_key(&mut Cursor::new(buf)) {
            Err(StoreError::Utf8Error(_)) => {}
            other => panic!("expected a UTF-8 error, got {:?}", other),
        }
    }

    #[test]
    fn short_read_is_an_error() {
        let mut buf = Vec::new();
        write_u64(&mut buf, 16).unwrap();
        buf.extend_from_slice(&[1, 2, 3]);
        assert!(read_bytes(&mut Cursor::new(buf)).is_err());
    }
}
