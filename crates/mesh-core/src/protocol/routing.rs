//! Routing entries: the authoritative binary block and the optional tag list.

use bytes::{BufMut, Bytes, BytesMut};

use super::{wire::WireReader, ProtocolError};
use crate::service::ServiceLocator;

const FLAG_STICKY: u8 = 0x01;
const FLAG_ENDPOINT: u8 = 0x02;

/// `(serviceId, handlerId)` plus selection hints. Computed once per call site.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    pub service_id: u32,
    pub handler_id: u32,
    pub endpoint: Option<String>,
    pub sticky: bool,
}

impl RoutingKey {
    pub fn new(service_id: u32, handler_id: u32) -> Self {
        Self { service_id, handler_id, endpoint: None, sticky: false }
    }

    pub fn for_handler(locator: &ServiceLocator, handler: &str) -> Self {
        Self::new(locator.id(), locator.handler_id(handler))
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    #[must_use]
    pub fn with_sticky(mut self, sticky: bool) -> Self {
        self.sticky = sticky;
        self
    }
}

/// Content of the `message/x.mesh.binary-routing.v0` entry.
///
/// Layout: `serviceId u32 | handlerId u32 | flags u8 | [u16 len + endpoint] | route`,
/// where `route` is the optional human-readable `gsv.handler` key filling the rest of
/// the entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryRouting {
    pub key: RoutingKey,
    pub route: Option<String>,
}

impl BinaryRouting {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let endpoint_len = self.key.endpoint.as_ref().map_or(0, |e| e.len() + 2);
        let route_len = self.route.as_ref().map_or(0, String::len);
        let mut buf = BytesMut::with_capacity(9 + endpoint_len + route_len);
        buf.put_u32(self.key.service_id);
        buf.put_u32(self.key.handler_id);

        let mut flags = 0;
        if self.key.sticky {
            flags |= FLAG_STICKY;
        }
        if self.key.endpoint.is_some() {
            flags |= FLAG_ENDPOINT;
        }
        buf.put_u8(flags);

        if let Some(endpoint) = &self.key.endpoint {
            let len = u16::try_from(endpoint.len()).map_err(|_| ProtocolError::FieldTooLong {
                context: "routing endpoint",
                len: endpoint.len(),
                limit: usize::from(u16::MAX),
            })?;
            buf.put_u16(len);
            buf.put_slice(endpoint.as_bytes());
        }
        if let Some(route) = &self.route {
            buf.put_slice(route.as_bytes());
        }
        Ok(buf.freeze())
    }

    pub fn decode(content: Bytes) -> Result<Self, ProtocolError> {
        let mut reader = WireReader::new(content, "binary routing");
        let service_id = reader.u32()?;
        let handler_id = reader.u32()?;
        let flags = reader.u8()?;
        let endpoint = if flags & FLAG_ENDPOINT != 0 {
            let len = usize::from(reader.u16()?);
            Some(reader.string(len)?)
        } else {
            None
        };
        let route = if reader.is_empty() {
            None
        } else {
            let len = reader.remaining();
            Some(reader.string(len)?)
        };
        Ok(Self {
            key: RoutingKey { service_id, handler_id, endpoint, sticky: flags & FLAG_STICKY != 0 },
            route,
        })
    }
}

/// Content of the well-known routing (`0x7E`) entry: u8-length-prefixed tags.
pub fn encode_routing_tags(tags: &[String]) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(tags.iter().map(|t| t.len() + 1).sum());
    for tag in tags {
        let len = u8::try_from(tag.len()).map_err(|_| ProtocolError::FieldTooLong {
            context: "routing tag",
            len: tag.len(),
            limit: usize::from(u8::MAX),
        })?;
        buf.put_u8(len);
        buf.put_slice(tag.as_bytes());
    }
    Ok(buf.freeze())
}

pub fn decode_routing_tags(content: Bytes) -> Result<Vec<String>, ProtocolError> {
    let mut reader = WireReader::new(content, "routing tags");
    let mut tags = Vec::new();
    while !reader.is_empty() {
        let len = usize::from(reader.u8()?);
        tags.push(reader.string(len)?);
    }
    Ok(tags)
}
