//! Byte cursor for wire-format state machines.
//!
//! Reads fail *without consuming* when the buffer is underfull, so a demuxer
//! can park mid-frame and retry once the next socket chunk arrives.

pub mod errors;

use {
    self::errors::{BytesReadError, BytesReadErrorValue},
    byteorder::{BigEndian, ByteOrder},
    bytes::BytesMut,
};

pub struct BytesReader {
    buf: BytesMut,
}

impl Default for BytesReader {
    fn default() -> Self {
        Self::new(BytesMut::new())
    }
}

impl BytesReader {
    #[must_use]
    pub fn new(buf: BytesMut) -> Self {
        Self { buf }
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn need(&self, needed: usize) -> Result<(), BytesReadError> {
        if self.buf.len() < needed {
            return Err(BytesReadErrorValue::NotEnoughBytes {
                needed,
                have: self.buf.len(),
            }
            .into());
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, BytesReadError> {
        self.need(1)?;
        Ok(self.buf.split_to(1)[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, BytesReadError> {
        self.need(2)?;
        Ok(BigEndian::read_u16(&self.buf.split_to(2)))
    }

    pub fn read_u24(&mut self) -> Result<u32, BytesReadError> {
        self.need(3)?;
        Ok(BigEndian::read_u24(&self.buf.split_to(3)))
    }

    pub fn read_u32(&mut self) -> Result<u32, BytesReadError> {
        self.need(4)?;
        Ok(BigEndian::read_u32(&self.buf.split_to(4)))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<BytesMut, BytesReadError> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    pub fn peek_bytes(&self, n: usize) -> Result<&[u8], BytesReadError> {
        self.need(n)?;
        Ok(&self.buf[..n])
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn underflow_consumes_nothing() {
        let mut reader = BytesReader::new(BytesMut::from(&[0x01, 0x02][..]));
        assert!(reader.read_u32().is_err());
        assert_eq!(reader.len(), 2);
        assert_eq!(reader.read_u16().expect("two bytes"), 0x0102);
        assert!(reader.is_empty());
    }

    #[test]
    fn big_endian_reads() {
        let mut reader = BytesReader::default();
        reader.extend_from_slice(&[0xAB, 0x00, 0x00, 0x2A, 0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(reader.read_u8().expect("u8"), 0xAB);
        assert_eq!(reader.read_u24().expect("u24"), 0x2A);
        assert_eq!(reader.read_u32().expect("u32"), 0xDEAD_BEEF);
    }

    #[test]
    fn peek_does_not_advance() {
        let mut reader = BytesReader::new(BytesMut::from(&b"hello"[..]));
        assert_eq!(reader.peek_bytes(3).expect("peek"), b"hel");
        assert_eq!(&reader.read_bytes(5).expect("all")[..], b"hello");
    }
}
