//! Cursor over a metadata buffer with bounds-checked big-endian reads.

use bytes::Bytes;

use super::ProtocolError;

pub(crate) struct WireReader {
    buf: Bytes,
    pos: usize,
    context: &'static str,
}

impl WireReader {
    pub(crate) fn new(buf: Bytes, context: &'static str) -> Self {
        Self { buf, pos: 0, context }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn ensure(&self, needed: usize) -> Result<(), ProtocolError> {
        if self.remaining() < needed {
            return Err(ProtocolError::Truncated {
                context: self.context,
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.ensure(1)?;
        let value = self.buf[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub(crate) fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.ensure(2)?;
        let value = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    pub(crate) fn u24(&mut self) -> Result<usize, ProtocolError> {
        self.ensure(3)?;
        let b = &self.buf[self.pos..self.pos + 3];
        let value = (usize::from(b[0]) << 16) | (usize::from(b[1]) << 8) | usize::from(b[2]);
        self.pos += 3;
        Ok(value)
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.ensure(4)?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(u32::from_be_bytes(raw))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, ProtocolError> {
        self.ensure(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buf[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(u64::from_be_bytes(raw))
    }

    /// Zero-copy slice of the next `len` bytes.
    pub(crate) fn bytes(&mut self, len: usize) -> Result<Bytes, ProtocolError> {
        self.ensure(len)?;
        let slice = self.buf.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn string(&mut self, len: usize) -> Result<String, ProtocolError> {
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(self.context))
    }
}
