//! Byte-level primitives of the map file format.
//!
//! Fixed-width integers are big-endian. Variable-length integers are LEB128
//! (`vu`), signed ones are zigzag-mapped before (`vs`).

use crate::errors::{Error, Result};

pub fn put_vu(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

pub fn put_vs(buf: &mut Vec<u8>, value: i64) {
    put_vu(buf, zigzag(value));
}

pub fn put_string(buf: &mut Vec<u8>, value: &str) {
    put_vu(buf, value.len() as u64);
    buf.extend_from_slice(value.as_bytes());
}

/// zig-zag encoding
#[inline]
pub fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

#[inline]
pub fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

/// Cursor over an in-memory map file or block.
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        ByteReader { data, pos: 0 }
    }

    pub fn at(data: &'a [u8], pos: usize) -> Self {
        ByteReader { data, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::inconsistent(format!(
                "unexpected end of data at byte {} (wanted {len} more)",
                self.pos
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    pub fn vu(&mut self) -> Result<u64> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.u8()?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(Error::inconsistent(format!("varint overflow at byte {}", self.pos)))
    }

    pub fn vs(&mut self) -> Result<i64> {
        Ok(unzigzag(self.vu()?))
    }

    pub fn string(&mut self) -> Result<String> {
        let len = usize::try_from(self.vu()?)?;
        let bytes = self.bytes(len)?;
        Ok(std::str::from_utf8(bytes)?.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zigzag() {
        assert_eq!(zigzag(0), 0);
        assert_eq!(zigzag(-1), 1);
        assert_eq!(zigzag(1), 2);
        assert_eq!(zigzag(-2), 3);
        assert_eq!(zigzag(i64::MIN), u64::MAX);
        for v in [0, 1, -1, 4096, -4096, i64::MAX, i64::MIN] {
            assert_eq!(unzigzag(zigzag(v)), v);
        }
    }

    #[test]
    fn varint_lengths() {
        let mut buf = Vec::new();
        put_vu(&mut buf, 127);
        assert_eq!(buf, vec![0x7f]);
        buf.clear();
        put_vu(&mut buf, 300);
        assert_eq!(buf, vec![0xac, 0x02]);
        buf.clear();
        put_vu(&mut buf, u64::MAX);
        assert_eq!(buf.len(), 10);
        assert_eq!(ByteReader::new(&buf).vu().unwrap(), u64::MAX);
    }

    #[test]
    fn reads_mixed_fields() {
        let mut buf = Vec::new();
        buf.extend(0xbeefu16.to_be_bytes());
        buf.extend((-5i32).to_be_bytes());
        put_vs(&mut buf, -70_000);
        put_string(&mut buf, "aerialway");

        let mut reader = ByteReader::new(&buf);
        assert_eq!(reader.u16().unwrap(), 0xbeef);
        assert_eq!(reader.i32().unwrap(), -5);
        assert_eq!(reader.vs().unwrap(), -70_000);
        assert_eq!(reader.string().unwrap(), "aerialway");
        assert_eq!(reader.remaining(), 0);
        assert!(reader.u8().is_err());
    }
}
