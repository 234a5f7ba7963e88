//! Mime types and their compact wire form.
//!
//! On the wire a mime type is either a single byte `0x80 | id` for a well-known type or
//! a length byte (`len - 1`) followed by the ASCII name. The same form is used for
//! composite entry headers, the data-encoding entry and the accept list.

use std::{borrow::Cow, fmt};

use bytes::{BufMut, Bytes, BytesMut};

use super::{wire::WireReader, ProtocolError};

const WELL_KNOWN_FLAG: u8 = 0x80;
const MAX_MIME_LEN: usize = 128;

const WELL_KNOWN: &[(u8, &str)] = &[
    (0x00, "application/avro"),
    (0x01, "application/cbor"),
    (0x02, "application/graphql"),
    (0x03, "application/gzip"),
    (0x04, "application/javascript"),
    (0x05, "application/json"),
    (0x06, "application/octet-stream"),
    (0x07, "application/pdf"),
    (0x08, "application/vnd.apache.thrift.binary"),
    (0x09, "application/vnd.google.protobuf"),
    (0x0A, "application/xml"),
    (0x0B, "application/zip"),
    (0x7A, "message/x.rsocket.mime-type.v0"),
    (0x7B, "message/x.rsocket.accept-mime-types.v0"),
    (0x7C, "message/x.rsocket.authentication.v0"),
    (0x7D, "message/x.rsocket.tracing-zipkin.v0"),
    (0x7E, "message/x.rsocket.routing.v0"),
    (0x7F, "message/x.rsocket.composite-metadata.v0"),
];

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MimeType(Cow<'static, str>);

impl MimeType {
    pub const APPLICATION_JSON: Self = Self(Cow::Borrowed("application/json"));
    pub const APPLICATION_CBOR: Self = Self(Cow::Borrowed("application/cbor"));
    pub const APPLICATION_PROTOBUF: Self = Self(Cow::Borrowed("application/vnd.google.protobuf"));
    pub const OCTET_STREAM: Self = Self(Cow::Borrowed("application/octet-stream"));
    pub const TEXT_PLAIN: Self = Self(Cow::Borrowed("text/plain"));

    pub const DATA_MIME: Self = Self(Cow::Borrowed("message/x.rsocket.mime-type.v0"));
    pub const ACCEPT_MIMES: Self = Self(Cow::Borrowed("message/x.rsocket.accept-mime-types.v0"));
    pub const AUTHENTICATION: Self = Self(Cow::Borrowed("message/x.rsocket.authentication.v0"));
    pub const TRACING_ZIPKIN: Self = Self(Cow::Borrowed("message/x.rsocket.tracing-zipkin.v0"));
    pub const ROUTING_TAGS: Self = Self(Cow::Borrowed("message/x.rsocket.routing.v0"));

    pub const BINARY_ROUTING: Self = Self(Cow::Borrowed("message/x.mesh.binary-routing.v0"));
    pub const SERVICES_EXPOSED: Self = Self(Cow::Borrowed("message/x.mesh.services-exposed.v0"));

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Id of this type in the well-known table, if it has one.
    pub fn well_known_id(&self) -> Option<u8> {
        WELL_KNOWN.iter().find(|(_, name)| *name == self.as_str()).map(|(id, _)| *id)
    }

    pub fn from_well_known_id(id: u8) -> Option<Self> {
        WELL_KNOWN
            .iter()
            .find(|(known, _)| *known == id)
            .map(|(_, name)| Self(Cow::Borrowed(name)))
    }

    pub(crate) fn write_to(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        if let Some(id) = self.well_known_id() {
            buf.put_u8(WELL_KNOWN_FLAG | id);
            return Ok(());
        }
        let name = self.as_str();
        if name.is_empty() || name.len() > MAX_MIME_LEN || !name.is_ascii() {
            return Err(ProtocolError::InvalidMimeType(name.to_string()));
        }
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u8((name.len() - 1) as u8);
        buf.put_slice(name.as_bytes());
        Ok(())
    }

    pub(crate) fn read_from(reader: &mut WireReader) -> Result<Self, ProtocolError> {
        let head = reader.u8()?;
        if head & WELL_KNOWN_FLAG != 0 {
            let id = head & !WELL_KNOWN_FLAG;
            return Self::from_well_known_id(id).ok_or(ProtocolError::UnknownMimeId(id));
        }
        let name = reader.string(usize::from(head) + 1)?;
        if !name.is_ascii() {
            return Err(ProtocolError::InvalidMimeType(name));
        }
        Ok(Self::new(name))
    }

    /// Content of a data-encoding (`0x7A`) entry.
    pub fn encode_single(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(1);
        self.write_to(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn decode_single(content: Bytes) -> Result<Self, ProtocolError> {
        let mut reader = WireReader::new(content, "data mime type");
        Self::read_from(&mut reader)
    }

    /// Content of an accept-mime-types (`0x7B`) entry, preserving order.
    pub fn encode_list(mimes: &[MimeType]) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(mimes.len());
        for mime in mimes {
            mime.write_to(&mut buf)?;
        }
        Ok(buf.freeze())
    }

    pub fn decode_list(content: Bytes) -> Result<Vec<Self>, ProtocolError> {
        let mut reader = WireReader::new(content, "accept mime types");
        let mut mimes = Vec::new();
        while !reader.is_empty() {
            mimes.push(Self::read_from(&mut reader)?);
        }
        Ok(mimes)
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MimeType({})", self.0)
    }
}

impl From<&str> for MimeType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}
