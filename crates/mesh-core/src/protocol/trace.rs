//! Zipkin trace context entry (`0x7D`).
//!
//! `flags u8 | [trace_id_high u64] | trace_id u64 | span_id u64 | [parent_id u64]`.
//! The context is propagated as received; spans are created elsewhere.

use bytes::{BufMut, Bytes, BytesMut};

use super::{wire::WireReader, ProtocolError};

const FLAG_DEBUG: u8 = 0x80;
const FLAG_IDS: u8 = 0x40;
const FLAG_NOT_SAMPLED: u8 = 0x20;
const FLAG_SAMPLED: u8 = 0x10;
const FLAG_TRACE_ID_128: u8 = 0x08;
const FLAG_PARENT: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraceContext {
    pub trace_id_high: Option<u64>,
    pub trace_id: u64,
    pub span_id: u64,
    pub parent_span_id: Option<u64>,
    /// `None` leaves the sampling decision to the receiver.
    pub sampled: Option<bool>,
    pub debug: bool,
}

impl TraceContext {
    pub fn new(trace_id: u64, span_id: u64) -> Self {
        Self { trace_id, span_id, ..Self::default() }
    }

    pub fn encode(&self) -> Bytes {
        let mut flags = FLAG_IDS;
        if self.debug {
            flags |= FLAG_DEBUG;
        }
        match self.sampled {
            Some(true) => flags |= FLAG_SAMPLED,
            Some(false) => flags |= FLAG_NOT_SAMPLED,
            None => {}
        }
        if self.trace_id_high.is_some() {
            flags |= FLAG_TRACE_ID_128;
        }
        if self.parent_span_id.is_some() {
            flags |= FLAG_PARENT;
        }

        let mut buf = BytesMut::with_capacity(33);
        buf.put_u8(flags);
        if let Some(high) = self.trace_id_high {
            buf.put_u64(high);
        }
        buf.put_u64(self.trace_id);
        buf.put_u64(self.span_id);
        if let Some(parent) = self.parent_span_id {
            buf.put_u64(parent);
        }
        buf.freeze()
    }

    /// Returns `Ok(None)` for a sampling-only entry that carries no ids.
    pub fn decode(content: Bytes) -> Result<Option<Self>, ProtocolError> {
        let mut reader = WireReader::new(content, "zipkin trace context");
        let flags = reader.u8()?;
        if flags & FLAG_IDS == 0 {
            return Ok(None);
        }
        let trace_id_high =
            if flags & FLAG_TRACE_ID_128 != 0 { Some(reader.u64()?) } else { None };
        let trace_id = reader.u64()?;
        let span_id = reader.u64()?;
        let parent_span_id = if flags & FLAG_PARENT != 0 { Some(reader.u64()?) } else { None };
        let sampled = if flags & FLAG_SAMPLED != 0 {
            Some(true)
        } else if flags & FLAG_NOT_SAMPLED != 0 {
            Some(false)
        } else {
            None
        };
        Ok(Some(Self {
            trace_id_high,
            trace_id,
            span_id,
            parent_span_id,
            sampled,
            debug: flags & FLAG_DEBUG != 0,
        }))
    }
}
