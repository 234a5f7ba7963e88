//! Composite metadata: a sequence of `[mime][u24 length][content]` entries.

use bytes::{BufMut, Bytes, BytesMut};

use super::{mime::MimeType, wire::WireReader, ProtocolError};

const MAX_ENTRY_LEN: usize = 0x00FF_FFFF;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataEntry {
    pub mime: MimeType,
    pub content: Bytes,
}

/// Ordered collection of metadata entries. Unknown entries survive a decode/encode
/// cycle untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompositeMetadata {
    entries: Vec<MetadataEntry>,
}

impl CompositeMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mime: MimeType, content: Bytes) {
        self.entries.push(MetadataEntry { mime, content });
    }

    #[must_use]
    pub fn with(mut self, mime: MimeType, content: Bytes) -> Self {
        self.push(mime, content);
        self
    }

    pub fn entries(&self) -> &[MetadataEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First entry of the given type.
    pub fn find(&self, mime: &MimeType) -> Option<&Bytes> {
        self.entries.iter().find(|entry| &entry.mime == mime).map(|entry| &entry.content)
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let capacity = self.entries.iter().map(|e| e.content.len() + 4).sum();
        let mut buf = BytesMut::with_capacity(capacity);
        for entry in &self.entries {
            if entry.content.len() > MAX_ENTRY_LEN {
                return Err(ProtocolError::EntryTooLarge(entry.content.len()));
            }
            entry.mime.write_to(&mut buf)?;
            #[allow(clippy::cast_possible_truncation)]
            let len = entry.content.len() as u32;
            buf.put_uint(u64::from(len), 3);
            buf.put_slice(&entry.content);
        }
        Ok(buf.freeze())
    }

    pub fn decode(buf: Bytes) -> Result<Self, ProtocolError> {
        let mut reader = WireReader::new(buf, "composite metadata");
        let mut entries = Vec::new();
        while !reader.is_empty() {
            let mime = MimeType::read_from(&mut reader)?;
            let len = reader.u24()?;
            let content = reader.bytes(len)?;
            entries.push(MetadataEntry { mime, content });
        }
        Ok(Self { entries })
    }
}
